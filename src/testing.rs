//! Shared helpers for userspace tests
//!
//! Builds complete enclave images (page tables and payload) inside the emulated DRAM, so that
//! tests can drive the real creation, measurement, and destruction paths end to end.

use castellan_core::{CreateArgs, PhysRegion};

use crate::arch::userspace;
use crate::arch::{Arch, Architecture};
use crate::enclave::SecurityMonitor;
use crate::identity;
use crate::measure::pte;
use crate::platform::{Plat, Platform};

pub const DRAM_BASE: usize = 0x8000_0000;
pub const DRAM_SIZE: usize = 0x80_0000;

pub const EPM_BASE: usize = 0x8040_0000;
pub const EPM_SIZE: usize = 0x20_0000;
pub const UTM_BASE: usize = 0x8070_0000;
pub const UTM_SIZE: usize = 0x1_0000;
pub const RUNTIME_PADDR: usize = EPM_BASE;
pub const USER_PADDR: usize = EPM_BASE + 0x8_0000;
pub const FREE_PADDR: usize = EPM_BASE + 0x10_0000;

/// Host memory used to stage the creation record.
pub const ARGS_PADDR: usize = 0x8001_0000;

/// The creation record of the reference scenario.
pub fn default_args() -> CreateArgs {
    CreateArgs {
        epm_region: PhysRegion {
            paddr: EPM_BASE,
            size: EPM_SIZE,
        },
        utm_region: PhysRegion {
            paddr: UTM_BASE,
            size: UTM_SIZE,
        },
        runtime_paddr: RUNTIME_PADDR,
        user_paddr: USER_PADDR,
        free_paddr: FREE_PADDR,
        free_requested: 0,
    }
}

/// A monitor with the userspace identity and its root PMP regions installed.
pub fn fresh_monitor() -> SecurityMonitor {
    let monitor = SecurityMonitor::new(identity::test_identity());
    let (start, size) = Plat::sm_memory_start_and_size();
    monitor
        .protect_monitor_memory(start, size)
        .expect("Failed to protect the monitor memory");
    monitor
}

/// Installs a fresh DRAM window and builds a minimal Sv39 enclave image.
///
/// The root page table sits at the EPM base (where the monitor points `satp`), with the runtime
/// pages identity-mapped read-execute and the user pages identity-mapped read-write. `payload`
/// is placed in the runtime segment so that tests can vary the measured content.
pub fn build_enclave_image(args: &CreateArgs, payload: &[u8]) {
    userspace::install_dram(DRAM_BASE, DRAM_SIZE);

    let epm = args.epm_region.paddr;
    let root = epm;
    let l1 = epm + 0x1000;
    let l0 = epm + 0x2000;

    // One entry per level covers the whole identity-mapped window.
    let idx2 = (epm >> 30) & 0x1ff;
    write_pte(root + idx2 * 8, pte::table(l1));
    let idx1 = (epm >> 21) & 0x1ff;
    write_pte(l1 + idx1 * 8, pte::table(l0));

    // Runtime pages, including the page tables themselves.
    for i in 0..8 {
        let pa = epm + i * 0x1000;
        let idx0 = (pa >> 12) & 0x1ff;
        write_pte(l0 + idx0 * 8, pte::leaf(pa, pte::R | pte::X));
    }

    // User pages.
    for i in 0..4 {
        let pa = args.user_paddr + i * 0x1000;
        let idx0 = (pa >> 12) & 0x1ff;
        write_pte(l0 + idx0 * 8, pte::leaf(pa, pte::R | pte::W | pte::U));
    }

    // The measured payload, placed after the page tables.
    unsafe { Arch::phys_write(epm + 0x3000, payload) };
}

/// Writes the creation record at `at` in the wire layout expected by the monitor.
pub fn write_args(args: &CreateArgs, at: usize) {
    let words = [
        args.epm_region.paddr,
        args.epm_region.size,
        args.utm_region.paddr,
        args.utm_region.size,
        args.runtime_paddr,
        args.user_paddr,
        args.free_paddr,
        args.free_requested,
    ];
    for (i, word) in words.iter().enumerate() {
        unsafe { Arch::phys_write(at + i * core::mem::size_of::<usize>(), &word.to_le_bytes()) };
    }
}

/// Reads one byte of emulated physical memory.
pub fn read_byte(paddr: usize) -> u8 {
    let mut byte = [0u8; 1];
    unsafe { Arch::phys_read(paddr, &mut byte) };
    byte[0]
}

/// Fills a physical range with a marker byte.
pub fn fill(paddr: usize, len: usize, marker: u8) {
    let buf = vec![marker; len];
    unsafe { Arch::phys_write(paddr, &buf) };
}

fn write_pte(at: usize, pte_value: usize) {
    unsafe { Arch::phys_write(at, &pte_value.to_le_bytes()) };
}
