//! Castellan core definitions
//!
//! This crate purpose is to hold core types and constants definitions for use by other crates.
//! In particular, this crate does not hold any code, this is important as not all code is
//! portable, but the definitions here can be used in lots of different contexts (such as in
//! Castellan itself, from enclave runtimes, or external tooling).

#![no_std]

// ———————————————————————————— ABI Definitions ————————————————————————————— //

/// Castellan ABI definitions.
///
/// The enclave ABI is exposed as an SBI extension, with separate function id ranges for calls
/// originating from the host and calls originating from a running enclave.
/// See: https://github.com/riscv-non-isa/riscv-sbi-doc
pub mod abi {
    /// Castellan SBI extension ID.
    pub const EXT_ENCLAVE: usize = 0x08424b45;

    /// Function ids 0-1999 are unused (deprecated).
    pub const FID_RANGE_DEPRECATED: usize = 1999;

    // 2000-2999 are called by the host
    pub const CREATE_ENCLAVE_FID: usize = 2001;
    pub const DESTROY_ENCLAVE_FID: usize = 2002;
    pub const RUN_ENCLAVE_FID: usize = 2003;
    pub const RESUME_ENCLAVE_FID: usize = 2005;
    pub const FID_RANGE_HOST: usize = 2999;

    // 3000-3999 are called by an enclave
    pub const RANDOM_FID: usize = 3001;
    pub const ATTEST_ENCLAVE_FID: usize = 3002;
    pub const GET_SEALING_KEY_FID: usize = 3003;
    pub const STOP_ENCLAVE_FID: usize = 3004;
    pub const EXIT_ENCLAVE_FID: usize = 3006;
    pub const CREATE_KEYPAIR_FID: usize = 3007;
    pub const GET_CHAIN_FID: usize = 3008;
    pub const CRYPTO_INTERFACE_FID: usize = 3009;
    pub const FID_RANGE_ENCLAVE: usize = 3999;

    /// 4000-4999 are experimental.
    pub const FID_RANGE_EXPERIMENTAL: usize = 4999;

    /// Stop reasons passed by an enclave to `STOP_ENCLAVE`.
    pub mod stop {
        pub const STOP_TIMER_INTERRUPT: usize = 0;
        pub const STOP_EDGE_CALL_HOST: usize = 1;
        pub const STOP_EXIT_ENCLAVE: usize = 2;
    }

    /// Stable SBI error codes returned by the security monitor.
    ///
    /// The values are part of the host/enclave ABI and must not be renumbered, gaps in the
    /// range stay reserved.
    pub mod error {
        pub const SUCCESS: usize = 0;
        pub const UNKNOWN_ERROR: usize = 100_000;
        pub const INTERRUPTED: usize = 100_002;
        pub const PMP_FAILURE: usize = 100_003;
        pub const NOT_DESTROYABLE: usize = 100_005;
        pub const REGION_OVERLAPS: usize = 100_006;
        pub const NOT_ACCESSIBLE: usize = 100_007;
        pub const ILLEGAL_ARGUMENT: usize = 100_008;
        pub const NOT_RUNNING: usize = 100_009;
        pub const NOT_RESUMABLE: usize = 100_010;
        pub const EDGE_CALL_HOST: usize = 100_011;
        pub const NOT_INITIALIZED: usize = 100_012;
        pub const NO_FREE_RESOURCE: usize = 100_013;
        pub const NOT_FRESH: usize = 100_014;
        pub const NOT_IMPLEMENTED: usize = 100_100;
    }
}

// —————————————————————————————— Wire Layouts —————————————————————————————— //

/// Sizes of the cryptographic objects exchanged over the ABI, in bytes.
pub mod size {
    /// SHA3-512 digest.
    pub const MDSIZE: usize = 64;
    /// Ed25519 public key.
    pub const PUBLIC_KEY_SIZE: usize = 32;
    /// Ed25519 secret key material (seed and public half).
    pub const PRIVATE_KEY_SIZE: usize = 64;
    /// Ed25519 signature.
    pub const SIGNATURE_SIZE: usize = 64;
    /// Maximum user data bound into an attestation report.
    pub const ATTEST_DATA_MAXLEN: usize = 1024;
    /// Derived sealing key.
    pub const SEALING_KEY_SIZE: usize = 128;
    /// Maximum length of a DER-encoded certificate.
    pub const MAX_CERT_LEN: usize = 1024;
    /// Maximum payload accepted by the crypto interface.
    pub const CRYPTO_DATA_MAXLEN: usize = 2048;
}

/// A physical memory region provided by the host.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhysRegion {
    pub paddr: usize,
    pub size: usize,
}

/// The enclave creation record, copied from host memory in one operation.
///
/// The field order and natural machine-word alignment are part of the host ABI.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateArgs {
    pub epm_region: PhysRegion,
    pub utm_region: PhysRegion,
    pub runtime_paddr: usize,
    pub user_paddr: usize,
    pub free_paddr: usize,
    pub free_requested: usize,
}

impl CreateArgs {
    /// Number of machine words in the record.
    pub const NB_WORDS: usize = 8;
}

/// The runtime parameters handed to an enclave on its first entry, in entry register order
/// (`a1` through `a7`, then the free memory request used for attestation).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeParams {
    pub dram_base: usize,
    pub dram_size: usize,
    pub runtime_base: usize,
    pub user_base: usize,
    pub free_base: usize,
    pub untrusted_base: usize,
    pub untrusted_size: usize,
    pub free_requested: usize,
}
