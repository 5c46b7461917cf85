//! Enclave measurement
//!
//! Validates the enclave's initial page tables and streams the mapped private pages through
//! SHA3-512 in a fixed, address-ordered traversal. The walk enforces that the whole tree lives
//! inside the enclave's private memory, that leaves point into private or shared memory only,
//! that the runtime and user entry points are mapped, and that the runtime segment carries no
//! writable-executable page. The resulting digest is the enclave's identity anchor: it is fixed
//! from `Fresh` onwards and never recomputed.

use castellan_core::size::MDSIZE;
use castellan_core::RuntimeParams;
use tiny_keccak::{Hasher, Sha3};

use crate::arch::pmp::Segment;
use crate::arch::{satp, Arch, Architecture};
use crate::error::SmError;

// ——————————————————————————— Page Table Encoding —————————————————————————— //

/// Page table entry encoding.
pub mod pte {
    /// Valid
    pub const V: usize = 1 << 0;
    /// Readable
    pub const R: usize = 1 << 1;
    /// Writable
    pub const W: usize = 1 << 2;
    /// Executable
    pub const X: usize = 1 << 3;
    /// User accessible
    pub const U: usize = 1 << 4;
    /// Accessed
    pub const A: usize = 1 << 6;
    /// Dirty
    pub const D: usize = 1 << 7;

    /// Offset of the physical page number.
    pub const PPN_SHIFT: usize = 10;

    /// A pointer entry to the next level page table.
    pub const fn table(paddr: usize) -> usize {
        ((paddr >> super::PAGE_SHIFT) << PPN_SHIFT) | V
    }

    /// A leaf entry with the given permission bits.
    pub const fn leaf(paddr: usize, perms: usize) -> usize {
        ((paddr >> super::PAGE_SHIFT) << PPN_SHIFT) | perms | A | D | V
    }

    /// The physical address a PTE points to.
    pub const fn paddr(pte: usize) -> usize {
        (pte >> PPN_SHIFT) << super::PAGE_SHIFT
    }
}

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Sv39 on 64-bit targets, Sv32 on 32-bit targets.
#[cfg(target_pointer_width = "64")]
const LEVELS: usize = 3;
#[cfg(target_pointer_width = "32")]
const LEVELS: usize = 2;

#[cfg(target_pointer_width = "64")]
const INDEX_BITS: usize = 9;
#[cfg(target_pointer_width = "32")]
const INDEX_BITS: usize = 10;

const PT_ENTRIES: usize = 1 << INDEX_BITS;
const PTE_BYTES: usize = core::mem::size_of::<usize>();

// ———————————————————————————————— Validation —————————————————————————————— //

/// Walks and validates the enclave's initial page tables, returning the measurement digest.
pub fn validate_and_hash(
    params: &RuntimeParams,
    encl_satp: usize,
    epm: Segment,
    utm: Segment,
) -> Result<[u8; MDSIZE], SmError> {
    let mut walker = Walker {
        hasher: Sha3::v512(),
        epm,
        utm,
        runtime: Segment::new(
            params.runtime_base,
            params.user_base - params.runtime_base,
        ),
        runtime_entry: params.runtime_base,
        user_entry: params.user_base,
        runtime_mapped: false,
        user_mapped: false,
    };

    // The runtime parameters are measured first: two enclaves only measure equal if they are
    // loaded at the same addresses with the same layout.
    walker.hash_params(params);
    walker.walk(satp::root(encl_satp), 0, LEVELS - 1)?;

    // The runtime and user entry points must fall on mapped pages.
    if !walker.runtime_mapped || !walker.user_mapped {
        return Err(SmError::IllegalArgument);
    }

    let mut hash = [0u8; MDSIZE];
    walker.hasher.finalize(&mut hash);
    Ok(hash)
}

struct Walker {
    hasher: Sha3,
    epm: Segment,
    utm: Segment,
    runtime: Segment,
    runtime_entry: usize,
    user_entry: usize,
    runtime_mapped: bool,
    user_mapped: bool,
}

impl Walker {
    fn hash_params(&mut self, params: &RuntimeParams) {
        for word in [
            params.dram_base,
            params.dram_size,
            params.runtime_base,
            params.user_base,
            params.free_base,
            params.untrusted_base,
            params.untrusted_size,
            params.free_requested,
        ] {
            self.hasher.update(&word.to_le_bytes());
        }
    }

    /// Validates one page table and recurses into its children, hashing leaves in address order.
    fn walk(&mut self, pt_paddr: usize, va_base: usize, level: usize) -> Result<(), SmError> {
        // The page table tree itself must live in the private memory.
        if !self.epm.contain(Segment::new(pt_paddr, PAGE_SIZE)) {
            return Err(SmError::IllegalArgument);
        }

        for idx in 0..PT_ENTRIES {
            let entry = read_pte(pt_paddr + idx * PTE_BYTES);
            if entry & pte::V == 0 {
                continue;
            }
            let va = va_base + (idx << (PAGE_SHIFT + INDEX_BITS * level));

            if entry & (pte::R | pte::W | pte::X) == 0 {
                // A pointer to the next level.
                if level == 0 {
                    return Err(SmError::IllegalArgument);
                }
                self.walk(pte::paddr(entry), va, level - 1)?;
            } else {
                self.leaf(entry, va, level)?;
            }
        }
        Ok(())
    }

    fn leaf(&mut self, entry: usize, va: usize, level: usize) -> Result<(), SmError> {
        // Writable but not readable is a reserved encoding.
        if entry & pte::W != 0 && entry & pte::R == 0 {
            return Err(SmError::IllegalArgument);
        }

        let size = PAGE_SIZE << (INDEX_BITS * level);
        let paddr = pte::paddr(entry);
        if paddr & (size - 1) != 0 {
            // Misaligned superpage.
            return Err(SmError::IllegalArgument);
        }

        let mapping = Segment::new(paddr, size);
        if self.epm.contain(mapping) {
            // The runtime segment must not contain a writable-executable page.
            if self.runtime.overlap(mapping) && entry & pte::W != 0 && entry & pte::X != 0 {
                return Err(SmError::IllegalArgument);
            }
            if mapping.contains_addr(self.runtime_entry) {
                self.runtime_mapped = true;
            }
            if mapping.contains_addr(self.user_entry) {
                self.user_mapped = true;
            }
            self.hash_page(va, paddr, size);
            Ok(())
        } else if self.utm.contain(mapping) {
            // Shared memory is mapped but never measured.
            Ok(())
        } else {
            Err(SmError::IllegalArgument)
        }
    }

    /// Measures a mapped private page: the virtual address, then the page content.
    fn hash_page(&mut self, va: usize, paddr: usize, size: usize) {
        self.hasher.update(&va.to_le_bytes());

        let mut buf = [0u8; 256];
        let mut offset = 0;
        while offset < size {
            unsafe { Arch::phys_read(paddr + offset, &mut buf) };
            self.hasher.update(&buf);
            offset += buf.len();
        }
    }
}

fn read_pte(paddr: usize) -> usize {
    let mut bytes = [0u8; PTE_BYTES];
    unsafe { Arch::phys_read(paddr, &mut bytes) };
    usize::from_le_bytes(bytes)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
