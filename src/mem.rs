//! Bounded memory copies
//!
//! All data movement between caller memory and monitor memory goes through this module. Copies
//! from the host are rejected when the source overlaps the monitor's own memory, and copies from
//! or to an enclave are rejected when the range leaves the enclave's permitted regions. The
//! actual access is performed through the architecture layer once the range is validated.

use core::mem;

use castellan_core::CreateArgs;

use crate::arch::pmp::Segment;
use crate::arch::{Arch, Architecture};
use crate::error::SmError;

/// Copies `dst.len()` bytes from host memory into monitor memory.
///
/// The source must not overlap the monitor's own memory: a host could otherwise use the monitor
/// as an oracle over its own address space.
pub fn copy_from_host(dst: &mut [u8], src: usize, sm_memory: Segment) -> Result<(), SmError> {
    let src_segment = checked_segment(src, dst.len())?;
    if sm_memory.overlap(src_segment) {
        return Err(SmError::RegionOverlaps);
    }

    unsafe { Arch::phys_read(src, dst) };
    Ok(())
}

/// Copies `dst.len()` bytes from enclave memory into monitor memory.
///
/// The source must lie entirely within one of the enclave's permitted regions.
pub fn copy_from_enclave(
    dst: &mut [u8],
    src: usize,
    allowed: &[Segment],
) -> Result<(), SmError> {
    check_caller_range(src, dst.len(), allowed)?;
    unsafe { Arch::phys_read(src, dst) };
    Ok(())
}

/// Copies `src` into enclave memory at `dst`.
///
/// The destination must lie entirely within one of the enclave's permitted regions.
pub fn copy_to_enclave(dst: usize, src: &[u8], allowed: &[Segment]) -> Result<(), SmError> {
    check_caller_range(dst, src.len(), allowed)?;
    unsafe { Arch::phys_write(dst, src) };
    Ok(())
}

/// Zeroes `size` bytes of memory owned (or being reclaimed) by the monitor.
pub fn zero_region(base: usize, size: usize) {
    unsafe { Arch::phys_zero(base, size) };
}

/// Reads the enclave creation record from host memory in one bounded copy.
pub fn read_create_args(src: usize, sm_memory: Segment) -> Result<CreateArgs, SmError> {
    const WORD: usize = mem::size_of::<usize>();
    let mut bytes = [0u8; CreateArgs::NB_WORDS * WORD];
    copy_from_host(&mut bytes, src, sm_memory)?;

    let mut words = [0usize; CreateArgs::NB_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        let mut buf = [0u8; WORD];
        buf.copy_from_slice(&bytes[i * WORD..(i + 1) * WORD]);
        *word = usize::from_le_bytes(buf);
    }

    let mut args = CreateArgs::default();
    args.epm_region.paddr = words[0];
    args.epm_region.size = words[1];
    args.utm_region.paddr = words[2];
    args.utm_region.size = words[3];
    args.runtime_paddr = words[4];
    args.user_paddr = words[5];
    args.free_paddr = words[6];
    args.free_requested = words[7];
    Ok(args)
}

// ————————————————————————————————— Helpers ———————————————————————————————— //

fn checked_segment(base: usize, len: usize) -> Result<Segment, SmError> {
    base.checked_add(len).ok_or(SmError::IllegalArgument)?;
    Ok(Segment::new(base, len))
}

fn check_caller_range(base: usize, len: usize, allowed: &[Segment]) -> Result<(), SmError> {
    let range = checked_segment(base, len).map_err(|_| SmError::NotAccessible)?;
    if allowed.iter().any(|region| region.contain(range)) {
        Ok(())
    } else {
        Err(SmError::NotAccessible)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
