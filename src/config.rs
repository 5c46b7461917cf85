//! Configuration constants
//!
//! The constants in this file are parsed from the Castellan configuration (passed through
//! environment variables at build time). Parsing happens in const context, an invalid value
//! fails the build rather than the boot.

// ———————————————————————————————— Helpers ————————————————————————————————— //

/// Parses an unsigned decimal from a build-time environment variable, falling back to `default`
/// when the variable is absent.
const fn usize_from_env(env_var: Option<&str>, default: usize) -> usize {
    let Some(env_var) = env_var else {
        return default;
    };

    let bytes = env_var.as_bytes();
    if bytes.is_empty() {
        panic!("Empty numeric configuration value");
    }

    let mut value: usize = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit < b'0' || digit > b'9' {
            panic!("Invalid numeric configuration value");
        }
        value = value * 10 + (digit - b'0') as usize;
        i += 1;
    }
    value
}

/// Parses a boolean choice from a build-time environment variable, defaulting to no.
const fn bool_from_env(env_var: Option<&str>) -> bool {
    match env_var {
        Some(env_var) => matches!(env_var.as_bytes(), b"true"),
        None => false,
    }
}

// ———————————————————————— Configuration Parameters ———————————————————————— //

/// The desired log level.
pub const LOG_LEVEL: Option<&'static str> = option_env!("CASTELLAN_LOG_LEVEL");

/// Maximum number of live enclaves.
pub const ENCL_MAX: usize = usize_from_env(option_env!("CASTELLAN_ENCL_MAX"), 16);

/// Maximum number of memory regions per enclave.
pub const ENCLAVE_REGIONS_MAX: usize = 8;

/// Maximum number of harts concurrently entered into one enclave.
pub const MAX_ENCL_THREADS: usize = usize_from_env(option_env!("CASTELLAN_MAX_ENCL_THREADS"), 1);

/// Maximum number of derived keypairs per enclave (the first one is the LDevID).
pub const NB_KEYPAIRS_MAX: usize = 8;

/// Number of PMP registers managed by the monitor.
pub const NB_PMP: usize = usize_from_env(option_env!("CASTELLAN_NB_PMP"), 64);

/// Whether `resume` requires the enclave to be stopped.
///
/// The permissive default matches the reference host driver, which drives multi-hart entry
/// through `resume` while the enclave is already running. The strict policy only admits
/// `STOPPED` enclaves.
pub const RESUME_REQUIRES_STOPPED: bool =
    bool_from_env(option_env!("CASTELLAN_RESUME_REQUIRES_STOPPED"));

// ————————————————————————————————— Tests —————————————————————————————————— //
