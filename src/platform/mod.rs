//! Platform abstraction
//!
//! The platform provides the few services the monitor needs from the surrounding machine: a debug
//! console, the bounds of the monitor's own memory (protected by the highest priority PMP
//! region), and a way to terminate execution.

use core::fmt;

use crate::enclave::Enclave;
use crate::error::SmError;

#[cfg(any(test, feature = "userspace"))]
pub mod userspace;
pub mod virt;

/// Export the current platform.
/// For now, only QEMU's Virt board is supported on hardware.
#[cfg(not(any(test, feature = "userspace")))]
pub type Plat = virt::VirtPlatform;

#[cfg(any(test, feature = "userspace"))]
pub type Plat = userspace::UserspacePlatform;

pub trait Platform {
    fn name() -> &'static str;
    fn init();
    fn debug_print(args: fmt::Arguments);
    fn exit_success() -> !;
    fn exit_failure() -> !;

    /// Returns the start and size of the monitor's own memory.
    fn sm_memory_start_and_size() -> (usize, usize);

    /// Hook invoked at the end of enclave creation, before measurement. May amend the slot
    /// (e.g. provision a platform-specific parent identifier). A failure aborts the creation.
    fn create_enclave_hook(_slot: &mut Enclave) -> Result<(), SmError> {
        Ok(())
    }

    /// Hook invoked at the start of enclave destruction.
    fn destroy_enclave_hook(_slot: &mut Enclave) {}

    /// Hook invoked on each context switch into an enclave, after the PMP is programmed.
    fn switch_to_enclave_hook(_slot: &mut Enclave) {}

    /// Hook invoked on each context switch back to the host.
    fn switch_from_enclave_hook(_slot: &mut Enclave) {}

    const NB_HARTS: usize;
}
