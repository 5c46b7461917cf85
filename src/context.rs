//! Host/enclave context switch
//!
//! The context switch swaps the trapped register file with the state saved in the enclave slot,
//! reprograms interrupt delegation and the PMP for the new world, and installs the matching trap
//! vector. It is used by `run` and `resume` in one direction and by `stop` and `exit` in the
//! other. All CPU state mutation goes through the [Architecture] trait so the switch can be
//! exercised in userspace tests.

use crate::arch::pmp::{PmpManager, RegionId, PMP_ALL_PERM, PMP_NO_PERM};
use crate::arch::{mip, mstatus, Arch, Architecture, Csr, HartCtx, Mode, Register, TrapRegs, TrapVector};
use crate::enclave::{Enclave, RegionType};
use crate::platform::{Plat, Platform};

// ————————————————————————————— Thread Context ————————————————————————————— //

/// The saved context of one hardware thread inside an enclave.
///
/// Written only during context switches. While a hart runs the enclave, this holds the host's
/// registers, and vice versa once the enclave exits.
#[derive(Clone, Copy, Debug)]
pub struct ThreadState {
    pub regs: [usize; 32],
    pub mepc: usize,
    pub mstatus: usize,
}

impl ThreadState {
    pub const fn clean() -> Self {
        ThreadState {
            regs: [0; 32],
            mepc: 0,
            mstatus: 0,
        }
    }

    /// Swaps the saved context with the live trapped registers.
    fn swap(&mut self, regs: &mut TrapRegs) {
        core::mem::swap(&mut self.regs, &mut regs.regs);
        core::mem::swap(&mut self.mepc, &mut regs.mepc);
        core::mem::swap(&mut self.mstatus, &mut regs.mstatus);
    }
}

// ————————————————————————————— World Switches ————————————————————————————— //

/// Context switch from the host into an enclave.
///
/// Expects the eid to be validated and the slot transitioned to `Running`: this function performs
/// no state-machine checks.
pub fn enter_enclave(
    slot: &mut Enclave,
    pmp: &PmpManager,
    osm_rid: RegionId,
    hart: &mut HartCtx,
    regs: &mut TrapRegs,
    load_parameters: bool,
) {
    // Save the host context.
    slot.threads[0].swap(regs);
    slot.threads[0].regs[Register::X10 as usize] = 1;

    // All interrupts trap to the monitor while the enclave runs.
    unsafe { Arch::write_csr(Csr::Mideleg, 0) };

    if load_parameters {
        // Passing parameters for a first run. The ecall return path adds 4 to mepc, so aim one
        // instruction before the entry point.
        regs.mepc = slot.params.dram_base.wrapping_sub(4);
        regs.mstatus = mstatus::with_mpp(0, Mode::S);
        regs.set(Register::X11, slot.params.dram_base);
        regs.set(Register::X12, slot.params.dram_size);
        regs.set(Register::X13, slot.params.runtime_base);
        regs.set(Register::X14, slot.params.user_base);
        regs.set(Register::X15, slot.params.free_base);
        regs.set(Register::X16, slot.params.untrusted_base);
        regs.set(Register::X17, slot.params.untrusted_size);

        // The enclave only uses physical addresses on its first run.
        unsafe { Arch::write_csr(Csr::Satp, 0) };
    }

    unsafe { Arch::set_trap_vector(TrapVector::Enclave) };

    // Grant the enclave regions and revoke everything else on this hart.
    pmp.set_local(osm_rid, PMP_NO_PERM);
    for region in slot.regions.iter().flatten() {
        pmp.set_local(region.pmp_rid, PMP_ALL_PERM);
    }

    Plat::switch_to_enclave_hook(slot);
    hart.inside_enclave = Some(slot.eid);
}

/// Context switch from an enclave back to the host.
///
/// `return_on_resume` is recorded in the enclave's saved `a0`: it tells a later `resume` whether
/// the in-enclave SBI call should observe a return value rather than replay.
pub fn exit_enclave(
    slot: &mut Enclave,
    pmp: &PmpManager,
    osm_rid: RegionId,
    hart: &mut HartCtx,
    regs: &mut TrapRegs,
    return_on_resume: bool,
) {
    // Revoke the private regions and restore host access on this hart. The shared memory stays
    // accessible, the host uses it for edge calls while the enclave is stopped.
    for region in slot.regions.iter().flatten() {
        let perm = match region.kind {
            RegionType::Utm => PMP_ALL_PERM,
            _ => PMP_NO_PERM,
        };
        pmp.set_local(region.pmp_rid, perm);
    }
    pmp.set_local(osm_rid, PMP_ALL_PERM);

    // Delegate supervisor interrupts back to the host.
    unsafe { Arch::write_csr(Csr::Mideleg, mip::SUPERVISOR_ALL) };

    // Restore the host context.
    slot.threads[0].swap(regs);
    slot.threads[0].regs[Register::X10 as usize] = return_on_resume as usize;

    unsafe { Arch::set_trap_vector(TrapVector::Host) };

    // Demote pending machine interrupts to their supervisor counterparts so the returning host
    // handles them.
    let pending = Arch::read_csr(Csr::Mip);
    unsafe {
        if pending & mip::MTIP != 0 {
            Arch::clear_csr_bits(Csr::Mip, mip::MTIP);
            Arch::set_csr_bits(Csr::Mip, mip::STIP);
        }
        if pending & mip::MSIP != 0 {
            Arch::clear_csr_bits(Csr::Mip, mip::MSIP);
            Arch::set_csr_bits(Csr::Mip, mip::SSIP);
        }
        if pending & mip::MEIP != 0 {
            Arch::clear_csr_bits(Csr::Mip, mip::MEIP);
            Arch::set_csr_bits(Csr::Mip, mip::SEIP);
        }
    }

    Plat::switch_from_enclave_hook(slot);
    hart.inside_enclave = None;
}

// ————————————————————————————————— Tests —————————————————————————————————— //
