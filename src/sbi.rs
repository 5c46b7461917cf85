//! SBI entry layer
//!
//! The dispatcher for the enclave SBI extension. The embedding firmware routes every trapped
//! `ecall` carrying the extension id here, with the trapped register file and the per-hart
//! context. Function ids 2000-2999 are host calls, 3000-3999 enclave calls, 4000-4999 are
//! reserved for experiments; calls from the wrong world are rejected before touching the table.
//!
//! Returns follow the SBI convention: the error code (or control code, for `stop`) lands in
//! `a0`, an optional value in `a1`, and `mepc` is advanced past the `ecall`. After a world
//! switch these writes target the context being entered, which is how a fresh enclave starts
//! with `mepc = dram_base` and how the host observes an exiting enclave's return value.

use castellan_core::abi;

use crate::arch::{HartCtx, Register, TrapRegs};
use crate::enclave::SecurityMonitor;
use crate::error::SmError;
use crate::mem;

/// Handles one trapped `ecall` against the enclave extension.
pub fn handle_ecall(monitor: &SecurityMonitor, hart: &mut HartCtx, regs: &mut TrapRegs) {
    let extension = regs.get(Register::X17);
    let fid = regs.get(Register::X16);

    let result = if extension != abi::EXT_ENCLAVE {
        Err(SmError::NotImplemented)
    } else {
        dispatch(monitor, hart, regs, fid)
    };

    // Skip the ecall instruction of whichever context is live after the call.
    regs.mepc = regs.mepc.wrapping_add(4);
    match result {
        Ok(Some(value)) => {
            regs.set(Register::X10, abi::error::SUCCESS);
            regs.set(Register::X11, value);
        }
        Ok(None) => regs.set(Register::X10, abi::error::SUCCESS),
        Err(err) => regs.set(Register::X10, err.code()),
    }
}

fn dispatch(
    monitor: &SecurityMonitor,
    hart: &mut HartCtx,
    regs: &mut TrapRegs,
    fid: usize,
) -> Result<Option<usize>, SmError> {
    if fid <= abi::FID_RANGE_DEPRECATED {
        Err(SmError::NotImplemented)
    } else if fid <= abi::FID_RANGE_HOST {
        host_ecall(monitor, hart, regs, fid)
    } else if fid <= abi::FID_RANGE_ENCLAVE {
        enclave_ecall(monitor, hart, regs, fid)
    } else {
        // The experimental range is not populated.
        Err(SmError::NotImplemented)
    }
}

fn host_ecall(
    monitor: &SecurityMonitor,
    hart: &mut HartCtx,
    regs: &mut TrapRegs,
    fid: usize,
) -> Result<Option<usize>, SmError> {
    if hart.is_enclave_context() {
        return Err(SmError::IllegalArgument);
    }

    match fid {
        abi::CREATE_ENCLAVE_FID => {
            let args = mem::read_create_args(regs.get(Register::X10), monitor.sm_memory())?;
            let eid = monitor.create_enclave(args)?;
            Ok(Some(eid))
        }
        abi::DESTROY_ENCLAVE_FID => monitor.destroy_enclave(regs.get(Register::X10)).map(|_| None),
        abi::RUN_ENCLAVE_FID => {
            let eid = regs.get(Register::X10);
            monitor.run_enclave(hart, regs, eid).map(|_| None)
        }
        abi::RESUME_ENCLAVE_FID => {
            let eid = regs.get(Register::X10);
            monitor.resume_enclave(hart, regs, eid).map(|_| None)
        }
        _ => Err(SmError::NotImplemented),
    }
}

fn enclave_ecall(
    monitor: &SecurityMonitor,
    hart: &mut HartCtx,
    regs: &mut TrapRegs,
    fid: usize,
) -> Result<Option<usize>, SmError> {
    // Enclave calls act on the enclave entered on this hart.
    let Some(eid) = hart.inside_enclave else {
        return Err(SmError::IllegalArgument);
    };

    match fid {
        abi::RANDOM_FID => Ok(Some(monitor.random_word())),
        abi::ATTEST_ENCLAVE_FID => monitor
            .attest_enclave(
                eid,
                regs.get(Register::X10),
                regs.get(Register::X11),
                regs.get(Register::X12),
            )
            .map(|_| None),
        abi::GET_SEALING_KEY_FID => monitor
            .get_sealing_key(
                eid,
                regs.get(Register::X10),
                regs.get(Register::X11),
                regs.get(Register::X12),
            )
            .map(|_| None),
        abi::STOP_ENCLAVE_FID => {
            let request = regs.get(Register::X10);
            monitor.stop_enclave(hart, regs, request, eid).map(|_| None)
        }
        abi::EXIT_ENCLAVE_FID => {
            let retval = regs.get(Register::X10);
            monitor.exit_enclave(hart, regs, eid)?;
            Ok(Some(retval))
        }
        abi::CREATE_KEYPAIR_FID => monitor
            .create_keypair(
                eid,
                regs.get(Register::X10),
                regs.get(Register::X11),
                regs.get(Register::X12),
                regs.get(Register::X13),
            )
            .map(|_| None),
        abi::GET_CHAIN_FID => monitor
            .get_cert_chain(eid, regs.get(Register::X10), regs.get(Register::X11))
            .map(|_| None),
        abi::CRYPTO_INTERFACE_FID => monitor
            .crypto_op(
                eid,
                regs.get(Register::X10),
                regs.get(Register::X11),
                regs.get(Register::X12),
                regs.get(Register::X13),
                regs.get(Register::X14),
                regs.get(Register::X15),
            )
            .map(|_| None),
        _ => Err(SmError::NotImplemented),
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use castellan_core::abi::{error, stop};
    use castellan_core::size::{MDSIZE, PUBLIC_KEY_SIZE};
    use castellan_core::RuntimeParams;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use tiny_keccak::{Hasher, Sha3};

    use super::*;
    use crate::arch::pmp::{pmpcfg, Segment};
    use crate::arch::userspace;
    use crate::arch::{mip, Arch, Architecture, Csr};
    use crate::attest::{Report, REPORT_BYTES};
    use crate::enclave::EnclaveState;
    use crate::testing::{
        self, ARGS_PADDR, EPM_BASE, EPM_SIZE, FREE_PADDR, RUNTIME_PADDR, USER_PADDR, UTM_BASE,
        UTM_SIZE,
    };
    use crate::x509;

    const HOST_PC: usize = 0x8002_0000;

    fn ecall(
        monitor: &crate::enclave::SecurityMonitor,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        fid: usize,
        args: &[usize],
    ) {
        regs.set(Register::X17, abi::EXT_ENCLAVE);
        regs.set(Register::X16, fid);
        for (i, arg) in args.iter().enumerate() {
            regs.set(
                match i {
                    0 => Register::X10,
                    1 => Register::X11,
                    2 => Register::X12,
                    3 => Register::X13,
                    4 => Register::X14,
                    5 => Register::X15,
                    _ => panic!("Too many SBI arguments"),
                },
                *arg,
            );
        }
        handle_ecall(monitor, hart, regs);
    }

    /// Creates the reference enclave and returns its eid.
    fn create_reference_enclave(
        monitor: &crate::enclave::SecurityMonitor,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        payload: &[u8],
    ) -> usize {
        let args = testing::default_args();
        testing::build_enclave_image(&args, payload);
        testing::write_args(&args, ARGS_PADDR);

        regs.mepc = HOST_PC;
        ecall(monitor, hart, regs, abi::CREATE_ENCLAVE_FID, &[ARGS_PADDR]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS, "create failed");
        regs.get(Register::X11)
    }

    fn run(
        monitor: &crate::enclave::SecurityMonitor,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        eid: usize,
    ) {
        regs.mepc = HOST_PC;
        ecall(monitor, hart, regs, abi::RUN_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS, "run failed");
    }

    #[test]
    fn scenario_create_run_exit_destroy() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let args = testing::default_args();
        testing::build_enclave_image(&args, b"scenario A payload");
        // Leave junk in the shared memory, creation must clean it.
        testing::fill(UTM_BASE, 16, 0xAA);
        testing::write_args(&args, ARGS_PADDR);

        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::CREATE_ENCLAVE_FID, &[ARGS_PADDR]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        let eid = regs.get(Register::X11);
        assert_eq!(eid, 0);
        assert_eq!(regs.mepc, HOST_PC + 4);
        assert_eq!(testing::read_byte(UTM_BASE), 0, "UTM not cleaned");

        // Run: the live context is now the enclave, with the entry register contract in place.
        run(&monitor, &mut hart, &mut regs, eid);
        assert!(hart.is_enclave_context());
        assert_eq!(regs.mepc, EPM_BASE, "entry at the DRAM base");
        assert_eq!(regs.get(Register::X11), EPM_BASE);
        assert_eq!(regs.get(Register::X12), EPM_SIZE);
        assert_eq!(regs.get(Register::X13), RUNTIME_PADDR);
        assert_eq!(regs.get(Register::X14), USER_PADDR);
        assert_eq!(regs.get(Register::X15), FREE_PADDR);
        assert_eq!(regs.get(Register::X16), UTM_BASE);
        assert_eq!(regs.get(Register::X17), UTM_SIZE);
        assert_eq!(Arch::read_csr(Csr::Satp), 0);
        assert_eq!(Arch::read_csr(Csr::Mideleg), 0);

        // While running, the private memory is granted on this hart and the catch-all revoked.
        let (_, epm_cfg) = userspace::pmp_entry(1);
        assert_eq!(epm_cfg, pmpcfg::NAPOT | pmpcfg::RWX);

        // The enclave exits with return value 7.
        ecall(&monitor, &mut hart, &mut regs, abi::EXIT_ENCLAVE_FID, &[7]);
        assert!(!hart.is_enclave_context());
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        assert_eq!(regs.get(Register::X11), 7, "host must observe the exit value");
        assert_eq!(regs.mepc, HOST_PC + 4);
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Stopped);

        // On exit the private memory is revoked again.
        let (_, epm_cfg) = userspace::pmp_entry(1);
        assert_eq!(epm_cfg, pmpcfg::NAPOT);

        // Destroy, and check the private memory was zeroed.
        assert_ne!(testing::read_byte(EPM_BASE + 0x3000), 0);
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::DESTROY_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        assert_eq!(testing::read_byte(EPM_BASE), 0);
        assert_eq!(testing::read_byte(EPM_BASE + 0x3000), 0);
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Invalid);
    }

    #[test]
    fn scenario_overlap_rejection() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let mut args = testing::default_args();
        args.user_paddr = 0x8039_0000; // below the private memory
        testing::build_enclave_image(&testing::default_args(), b"payload");
        testing::write_args(&args, ARGS_PADDR);

        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::CREATE_ENCLAVE_FID, &[ARGS_PADDR]);
        assert_eq!(regs.get(Register::X10), error::ILLEGAL_ARGUMENT);
        assert_eq!(monitor.enclave_state(0), EnclaveState::Invalid, "no slot allocated");
    }

    #[test]
    fn scenario_table_exhaustion() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        // Small disjoint enclaves, so that the table is the limiting resource.
        userspace::install_dram(testing::DRAM_BASE, testing::DRAM_SIZE);
        for i in 0..crate::config::ENCL_MAX {
            let mut args = testing::default_args();
            args.epm_region.paddr = EPM_BASE + i * 0x2_0000;
            args.epm_region.size = 0x1_0000;
            args.utm_region.paddr = UTM_BASE + i * 0x1000;
            args.utm_region.size = 0x1000;
            args.runtime_paddr = args.epm_region.paddr;
            args.user_paddr = args.epm_region.paddr + 0x8000;
            args.free_paddr = args.epm_region.paddr + 0x1_0000;

            // Rebuilding the image resets the DRAM, so build then re-stage previous page tables
            // is not needed: each image only touches its own EPM.
            build_small_image(&args);
            testing::write_args(&args, ARGS_PADDR);
            regs.mepc = HOST_PC;
            ecall(&monitor, &mut hart, &mut regs, abi::CREATE_ENCLAVE_FID, &[ARGS_PADDR]);
            assert_eq!(regs.get(Register::X10), error::SUCCESS, "create {} failed", i);
            assert_eq!(regs.get(Register::X11), i);
        }

        // One more must fail with a full table.
        let mut args = testing::default_args();
        args.epm_region.paddr = EPM_BASE + crate::config::ENCL_MAX * 0x2_0000;
        args.epm_region.size = 0x1_0000;
        args.utm_region.paddr = UTM_BASE + crate::config::ENCL_MAX * 0x1000;
        args.utm_region.size = 0x1000;
        args.runtime_paddr = args.epm_region.paddr;
        args.user_paddr = args.epm_region.paddr + 0x8000;
        args.free_paddr = args.epm_region.paddr + 0x1_0000;
        build_small_image(&args);
        testing::write_args(&args, ARGS_PADDR);
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::CREATE_ENCLAVE_FID, &[ARGS_PADDR]);
        assert_eq!(regs.get(Register::X10), error::NO_FREE_RESOURCE);
    }

    /// Builds page tables for a small (64 KiB) enclave without reinstalling the DRAM.
    fn build_small_image(args: &castellan_core::CreateArgs) {
        use crate::measure::pte;

        let epm = args.epm_region.paddr;
        let (root, l1, l0) = (epm, epm + 0x1000, epm + 0x2000);
        let write =
            |at: usize, value: usize| unsafe { Arch::phys_write(at, &value.to_le_bytes()) };

        write(root + ((epm >> 30) & 0x1ff) * 8, pte::table(l1));
        write(l1 + ((epm >> 21) & 0x1ff) * 8, pte::table(l0));
        for i in 0..8 {
            let pa = epm + i * 0x1000;
            write(l0 + ((pa >> 12) & 0x1ff) * 8, pte::leaf(pa, pte::R | pte::X));
        }
        for i in 0..4 {
            let pa = args.user_paddr + i * 0x1000;
            write(l0 + ((pa >> 12) & 0x1ff) * 8, pte::leaf(pa, pte::R | pte::W | pte::U));
        }
    }

    #[test]
    fn scenario_resume_after_stop() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"payload D");
        run(&monitor, &mut hart, &mut regs, eid);

        // A timer interrupt is pending when the enclave stops for an edge call.
        unsafe { Arch::write_csr(Csr::Mip, mip::MTIP) };
        let enclave_pc = regs.mepc;
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::STOP_ENCLAVE_FID,
            &[stop::STOP_EDGE_CALL_HOST],
        );

        // The host observes the edge call, the enclave is stopped, and the pending machine
        // interrupt was demoted to its supervisor counterpart.
        assert!(!hart.is_enclave_context());
        assert_eq!(regs.get(Register::X10), error::EDGE_CALL_HOST);
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Stopped);
        assert_eq!(Arch::read_csr(Csr::Mip), mip::STIP);
        assert_eq!(Arch::read_csr(Csr::Mideleg), mip::SUPERVISOR_ALL);

        // Resume: the enclave continues right after its stop ecall.
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::RESUME_ENCLAVE_FID, &[eid]);
        assert!(hart.is_enclave_context());
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Running);
        assert_eq!(regs.mepc, enclave_pc + 4);
    }

    #[test]
    fn scenario_attestation_determinism() {
        let report_a = attest_once(b"deterministic payload", &[0x5a; 16]);
        let report_b = attest_once(b"deterministic payload", &[0x5a; 16]);

        // Identical EPM contents and user data yield identical report signatures.
        assert_eq!(report_a.enclave.hash, report_b.enclave.hash);
        assert_eq!(report_a.enclave.signature, report_b.enclave.signature);

        // The report signature verifies over the fixed prefix plus exactly data_len bytes.
        let key = VerifyingKey::from_bytes(&report_a.sm.public_key).unwrap();
        let mut signed = [0u8; MDSIZE + 8 + 16];
        signed[..MDSIZE].copy_from_slice(&report_a.enclave.hash);
        signed[MDSIZE..MDSIZE + 8].copy_from_slice(&report_a.enclave.data_len.to_le_bytes());
        signed[MDSIZE + 8..].copy_from_slice(&report_a.enclave.data[..16]);
        key.verify(&signed, &Signature::from_bytes(&report_a.enclave.signature))
            .unwrap();
    }

    /// Creates an enclave with the given payload, attests over `data`, and returns the report.
    fn attest_once(payload: &[u8], data: &[u8]) -> Report {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, payload);
        run(&monitor, &mut hart, &mut regs, eid);

        // Stage the user data in the shared memory and attest into it as well.
        let data_ptr = UTM_BASE + 0x100;
        let report_ptr = UTM_BASE + 0x1000;
        unsafe { Arch::phys_write(data_ptr, data) };
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::ATTEST_ENCLAVE_FID,
            &[report_ptr, data_ptr, data.len()],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        let mut bytes = [0u8; REPORT_BYTES];
        unsafe { Arch::phys_read(report_ptr, &mut bytes) };
        Report::from_bytes(&bytes)
    }

    #[test]
    fn scenario_certificate_chain() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"chain payload");
        run(&monitor, &mut hart, &mut regs, eid);

        // Three DER output buffers in the shared memory, plus the pointer and size arrays.
        let dests = [UTM_BASE + 0x2000, UTM_BASE + 0x3000, UTM_BASE + 0x4000];
        let certs_ptr = UTM_BASE + 0x100;
        let sizes_ptr = UTM_BASE + 0x200;
        for (i, dest) in dests.iter().enumerate() {
            unsafe { Arch::phys_write(certs_ptr + i * 8, &dest.to_le_bytes()) };
        }

        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::GET_CHAIN_FID,
            &[certs_ptr, sizes_ptr],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        let mut sizes = [0usize; 3];
        for (i, size) in sizes.iter_mut().enumerate() {
            let mut word = [0u8; 8];
            unsafe { Arch::phys_read(sizes_ptr + i * 8, &mut word) };
            *size = usize::from_le_bytes(word);
        }

        let mut ders: [Vec<u8>; 3] = [vec![], vec![], vec![]];
        for i in 0..3 {
            ders[i] = vec![0; sizes[i]];
            unsafe { Arch::phys_read(dests[i], &mut ders[i]) };
        }

        // Chain order on the wire: LAK, monitor, device root.
        let lak = x509::Certificate::parse(&ders[0]).unwrap();
        let sm = x509::Certificate::parse(&ders[1]).unwrap();
        let dev = x509::Certificate::parse(&ders[2]).unwrap();
        assert_eq!(lak.tbs_certificate.subject.cn(), "Enclave LAK");
        assert_eq!(sm.tbs_certificate.subject.cn(), "Security Monitor");
        assert_eq!(dev.tbs_certificate.subject.cn(), "Device Root Key");

        // The chain verifies: LAK by the monitor, the monitor by the device root.
        assert!(x509::verify_signature(&ders[0], &monitor.identity.sm_public_key));
        assert!(x509::verify_signature(&ders[1], &monitor.identity.dev_public_key));

        // The LAK certificate pins the enclave measurement.
        let args = testing::default_args();
        let params = RuntimeParams {
            dram_base: args.epm_region.paddr,
            dram_size: args.epm_region.size,
            runtime_base: args.runtime_paddr,
            user_base: args.user_paddr,
            free_base: args.free_paddr,
            untrusted_base: args.utm_region.paddr,
            untrusted_size: args.utm_region.size,
            free_requested: args.free_requested,
        };
        let expected_hash = crate::measure::validate_and_hash(
            &params,
            crate::arch::satp::encode(args.epm_region.paddr),
            Segment::new(args.epm_region.paddr, args.epm_region.size),
            Segment::new(args.utm_region.paddr, args.utm_region.size),
        )
        .unwrap();
        assert_eq!(lak.fwid_digest().unwrap(), expected_hash);
    }

    #[test]
    fn keypairs_and_crypto_interface() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"crypto payload");
        run(&monitor, &mut hart, &mut regs, eid);

        // First keypair: becomes the LDevID and returns a certificate.
        let pk_ptr = UTM_BASE + 0x100;
        let crt_ptr = UTM_BASE + 0x1000;
        let crt_len_ptr = UTM_BASE + 0x200;
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::CREATE_KEYPAIR_FID,
            &[pk_ptr, 1, crt_ptr, crt_len_ptr],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        let mut pk_ldev = [0u8; PUBLIC_KEY_SIZE];
        unsafe { Arch::phys_read(pk_ptr, &mut pk_ldev) };
        let mut len_word = [0u8; 8];
        unsafe { Arch::phys_read(crt_len_ptr, &mut len_word) };
        let crt_len = usize::from_le_bytes(len_word);
        assert!(crt_len > 0);

        let mut crt = vec![0u8; crt_len];
        unsafe { Arch::phys_read(crt_ptr, &mut crt) };
        let ldev_cert = x509::Certificate::parse(&crt).unwrap();
        assert_eq!(ldev_cert.tbs_certificate.subject.cn(), "Enclave LDevID");
        assert_eq!(ldev_cert.tbs_certificate.serial_number.as_bytes(), &[1]);
        assert_eq!(ldev_cert.public_key(), pk_ldev);
        assert!(x509::verify_signature(&crt, &monitor.identity.sm_public_key));

        // Flag 1: signature over SHA3(data ‖ hash ‖ pk_ldev) with the LAK.
        let data = b"bind me to the enclave";
        let data_ptr = UTM_BASE + 0x300;
        let out_ptr = UTM_BASE + 0x400;
        let out_len_ptr = UTM_BASE + 0x500;
        unsafe { Arch::phys_write(data_ptr, data) };
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::CRYPTO_INTERFACE_FID,
            &[1, data_ptr, data.len(), out_ptr, out_len_ptr, pk_ptr],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        // Fetch the LAK public key from the chain and verify.
        let mut report_sig = [0u8; 64];
        unsafe { Arch::phys_read(out_ptr, &mut report_sig) };

        // Rebuild the signed digest.
        let lak_pub = fetch_lak_public(&monitor, &mut hart, &mut regs);
        let enclave_hash = fetch_enclave_hash(&monitor, &mut hart, &mut regs);
        let mut hasher = Sha3::v512();
        hasher.update(data);
        hasher.update(&enclave_hash);
        hasher.update(&pk_ldev);
        let mut digest = [0u8; MDSIZE];
        hasher.finalize(&mut digest);

        let key = VerifyingKey::from_bytes(&lak_pub).unwrap();
        key.verify(&digest, &Signature::from_bytes(&report_sig)).unwrap();

        // Flag 2: signature over raw data with the matching derived keypair.
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::CRYPTO_INTERFACE_FID,
            &[2, data_ptr, data.len(), out_ptr, out_len_ptr, pk_ptr],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        let mut sig = [0u8; 64];
        unsafe { Arch::phys_read(out_ptr, &mut sig) };
        let key = VerifyingKey::from_bytes(&pk_ldev).unwrap();
        key.verify(data, &Signature::from_bytes(&sig)).unwrap();

        // Unknown flags are rejected.
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::CRYPTO_INTERFACE_FID,
            &[3, data_ptr, data.len(), out_ptr, out_len_ptr, pk_ptr],
        );
        assert_eq!(regs.get(Register::X10), error::ILLEGAL_ARGUMENT);
    }

    fn fetch_lak_public(
        monitor: &crate::enclave::SecurityMonitor,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
    ) -> [u8; PUBLIC_KEY_SIZE] {
        let certs_ptr = UTM_BASE + 0x5000;
        let sizes_ptr = UTM_BASE + 0x5100;
        let dests = [UTM_BASE + 0x6000, UTM_BASE + 0x7000, UTM_BASE + 0x8000];
        for (i, dest) in dests.iter().enumerate() {
            unsafe { Arch::phys_write(certs_ptr + i * 8, &dest.to_le_bytes()) };
        }
        ecall(monitor, hart, regs, abi::GET_CHAIN_FID, &[certs_ptr, sizes_ptr]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        let mut len_word = [0u8; 8];
        unsafe { Arch::phys_read(sizes_ptr, &mut len_word) };
        let mut der = vec![0u8; usize::from_le_bytes(len_word)];
        unsafe { Arch::phys_read(dests[0], &mut der) };
        let cert = x509::Certificate::parse(&der).unwrap();
        cert.public_key().try_into().unwrap()
    }

    fn fetch_enclave_hash(
        monitor: &crate::enclave::SecurityMonitor,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
    ) -> [u8; MDSIZE] {
        let report_ptr = UTM_BASE + 0x9000;
        let data_ptr = UTM_BASE + 0x9800;
        ecall(
            monitor,
            hart,
            regs,
            abi::ATTEST_ENCLAVE_FID,
            &[report_ptr, data_ptr, 0],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        let mut bytes = [0u8; REPORT_BYTES];
        unsafe { Arch::phys_read(report_ptr, &mut bytes) };
        Report::from_bytes(&bytes).enclave.hash
    }

    #[test]
    fn sealing_key_round_trip() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"sealing payload");
        run(&monitor, &mut hart, &mut regs, eid);

        let key_ptr = UTM_BASE + 0x100;
        let ident_ptr = UTM_BASE + 0x800;
        unsafe { Arch::phys_write(ident_ptr, b"disk-encryption") };
        ecall(
            &monitor,
            &mut hart,
            &mut regs,
            abi::GET_SEALING_KEY_FID,
            &[key_ptr, ident_ptr, 15],
        );
        assert_eq!(regs.get(Register::X10), error::SUCCESS);

        // The returned record is the key followed by the monitor's signature over it.
        let mut record = [0u8; crate::attest::SEALING_KEY_BYTES];
        unsafe { Arch::phys_read(key_ptr, &mut record) };
        let key = VerifyingKey::from_bytes(&monitor.identity.sm_public_key).unwrap();
        let sig: [u8; 64] = record[128..].try_into().unwrap();
        key.verify(&record[..128], &Signature::from_bytes(&sig)).unwrap();
    }

    #[test]
    fn wrong_world_calls_are_rejected() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        // Enclave-only calls from the host.
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::RANDOM_FID, &[]);
        assert_eq!(regs.get(Register::X10), error::ILLEGAL_ARGUMENT);

        // Host-only calls from inside an enclave.
        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"payload");
        run(&monitor, &mut hart, &mut regs, eid);
        ecall(&monitor, &mut hart, &mut regs, abi::DESTROY_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::ILLEGAL_ARGUMENT);

        // Unknown and experimental ranges.
        ecall(&monitor, &mut hart, &mut regs, 4000, &[]);
        assert_eq!(regs.get(Register::X10), error::NOT_IMPLEMENTED);
    }

    #[test]
    fn thread_accounting_follows_entries_and_exits() {
        let monitor = testing::fresh_monitor();
        let mut hart = HartCtx::new(0);
        let mut regs = TrapRegs::new();

        let eid = create_reference_enclave(&monitor, &mut hart, &mut regs, b"threads");

        // Fresh enclaves cannot be resumed or re-run twice.
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::RESUME_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::NOT_RESUMABLE);

        run(&monitor, &mut hart, &mut regs, eid);
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Running);

        // A second run of a running enclave is rejected.
        let mut host_regs = TrapRegs::new();
        let mut other_hart = HartCtx::new(1);
        host_regs.mepc = HOST_PC;
        ecall(&monitor, &mut other_hart, &mut host_regs, abi::RUN_ENCLAVE_FID, &[eid]);
        assert_eq!(host_regs.get(Register::X10), error::NOT_FRESH);

        // Stop with an unknown request still stops the thread.
        ecall(&monitor, &mut hart, &mut regs, abi::STOP_ENCLAVE_FID, &[99]);
        assert_eq!(regs.get(Register::X10), error::UNKNOWN_ERROR);
        assert_eq!(monitor.enclave_state(eid), EnclaveState::Stopped);

        // Destroying a stopped enclave succeeds, a second destroy fails.
        regs.mepc = HOST_PC;
        ecall(&monitor, &mut hart, &mut regs, abi::DESTROY_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::SUCCESS);
        ecall(&monitor, &mut hart, &mut regs, abi::DESTROY_ENCLAVE_FID, &[eid]);
        assert_eq!(regs.get(Register::X10), error::NOT_DESTROYABLE);
    }
}
