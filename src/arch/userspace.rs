//! A mock of architecture specific features when running in user space.
//!
//! This implementation is used when running the monitor on the host (potentially non-riscv)
//! architecture, such as when running unit tests. Each thread gets its own CSR file, PMP register
//! file, and emulated DRAM window, so tests can drive the complete enclave life cycle (including
//! measurement, memory zeroing, and PMP programming) deterministically and in parallel.

use std::cell::RefCell;

use super::{Architecture, Csr, TrapVector};

std::thread_local! {
    static STATE: RefCell<HostState> = RefCell::new(HostState::new());
}

struct HostState {
    csrs: [usize; Csr::COUNT],
    trap_vector: TrapVector,
    pmp_addr: [usize; 64],
    pmp_cfg: [u8; 64],
    dram_base: usize,
    dram: Vec<u8>,
    cycles: usize,
}

impl HostState {
    fn new() -> Self {
        HostState {
            csrs: [0; Csr::COUNT],
            trap_vector: TrapVector::Host,
            pmp_addr: [0; 64],
            pmp_cfg: [0; 64],
            dram_base: 0,
            dram: Vec::new(),
            cycles: 0,
        }
    }

    fn check_range(&self, paddr: usize, len: usize) -> usize {
        let end = paddr.checked_add(len).expect("Physical range overflows");
        assert!(
            paddr >= self.dram_base && end <= self.dram_base + self.dram.len(),
            "Physical access outside the emulated DRAM: 0x{:x}..0x{:x}",
            paddr,
            end
        );
        paddr - self.dram_base
    }
}

/// User space mock, running on the host architecture.
pub struct HostArch {}

impl Architecture for HostArch {
    fn init() {}

    fn hart_id() -> usize {
        0
    }

    fn read_csr(csr: Csr) -> usize {
        STATE.with(|s| s.borrow().csrs[csr as usize])
    }

    unsafe fn write_csr(csr: Csr, value: usize) {
        STATE.with(|s| s.borrow_mut().csrs[csr as usize] = value)
    }

    unsafe fn set_csr_bits(csr: Csr, mask: usize) {
        STATE.with(|s| s.borrow_mut().csrs[csr as usize] |= mask)
    }

    unsafe fn clear_csr_bits(csr: Csr, mask: usize) {
        STATE.with(|s| s.borrow_mut().csrs[csr as usize] &= !mask)
    }

    unsafe fn set_trap_vector(vector: TrapVector) {
        STATE.with(|s| s.borrow_mut().trap_vector = vector)
    }

    unsafe fn write_pmp_entry(index: usize, pmpaddr: usize, pmpcfg: u8) {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            s.pmp_addr[index] = pmpaddr;
            s.pmp_cfg[index] = pmpcfg;
        })
    }

    unsafe fn pmp_fence() {}

    unsafe fn phys_read(paddr: usize, buf: &mut [u8]) {
        STATE.with(|s| {
            let s = s.borrow();
            let offset = s.check_range(paddr, buf.len());
            buf.copy_from_slice(&s.dram[offset..offset + buf.len()]);
        })
    }

    unsafe fn phys_write(paddr: usize, buf: &[u8]) {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            let offset = s.check_range(paddr, buf.len());
            s.dram[offset..offset + buf.len()].copy_from_slice(buf);
        })
    }

    unsafe fn phys_zero(paddr: usize, len: usize) {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            let offset = s.check_range(paddr, len);
            s.dram[offset..offset + len].fill(0);
        })
    }

    fn cycle_count() -> usize {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            s.cycles += 1;
            s.cycles
        })
    }
}

// ————————————————————————————— Test Controls —————————————————————————————— //

/// Installs a zeroed DRAM window for the current thread.
pub fn install_dram(base: usize, size: usize) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.dram_base = base;
        s.dram = vec![0; size];
    })
}

/// Returns the PMP entry as last programmed on this hart.
pub fn pmp_entry(index: usize) -> (usize, u8) {
    STATE.with(|s| {
        let s = s.borrow();
        (s.pmp_addr[index], s.pmp_cfg[index])
    })
}

/// Returns the installed trap vector.
pub fn trap_vector() -> TrapVector {
    STATE.with(|s| s.borrow().trap_vector)
}
