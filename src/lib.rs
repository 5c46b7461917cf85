//! Castellan
//!
//! The Castellan security monitor library, which needs to be embedded into an M-mode executable.
//! The monitor creates measured enclaves out of host-supplied physical memory, enforces PMP
//! isolation across every host/enclave transition, and issues DICE-rooted attestation identities.
//!
//! The library exposes two main entry points: [init], which sets up the platform and the global
//! monitor instance, and [sbi::handle_ecall], which the embedding firmware calls for every trapped
//! `ecall` carrying the enclave extension id.

// Mark the crate as no_std, but only when not running tests.
// We need std to be able to run tests in user-space on the host architecture.
#![cfg_attr(not(any(test, feature = "userspace")), no_std)]

pub mod arch;
pub mod attest;
pub mod config;
pub mod context;
pub mod enclave;
pub mod error;
pub mod identity;
pub mod logger;
pub mod measure;
pub mod mem;
pub mod platform;
pub mod sbi;
#[cfg(any(test, feature = "userspace"))]
pub mod testing;
pub mod x509;

use arch::{Architecture, HartCtx};
use enclave::SecurityMonitor;
use identity::SmIdentity;
use platform::{Plat, Platform};
use spin::Once;

pub use crate::error::SmError;

/// The global security monitor instance.
static MONITOR: Once<SecurityMonitor> = Once::new();

/// Initializes the monitor on the boot hart.
///
/// The identity material (device root certificate, monitor keypair and certificate, monitor
/// measurement) is provisioned by the boot loader before jumping into the firmware and is handed
/// over here. Secondary harts only need a [HartCtx] of their own, the monitor state is shared.
///
/// # Safety
///
/// Must be called once, before any ecall is routed to the monitor. The platform must be in its
/// boot state (PMP registers under full control of the monitor).
pub unsafe fn init(identity: SmIdentity) -> Result<&'static SecurityMonitor, SmError> {
    Plat::init();
    logger::init();
    arch::Arch::init();

    let (sm_start, sm_size) = Plat::sm_memory_start_and_size();
    let monitor = MONITOR.call_once(|| SecurityMonitor::new(identity));
    monitor.protect_monitor_memory(sm_start, sm_size)?;

    log::info!("Initialized Castellan on {}", Plat::name());
    Ok(monitor)
}

/// Returns the global monitor instance.
///
/// Panics if called before [init].
pub fn monitor() -> &'static SecurityMonitor {
    MONITOR
        .get()
        .expect("The security monitor is not initialized")
}

/// Returns a fresh per-hart context for the calling hart.
pub fn hart_ctx(hart_id: usize) -> HartCtx {
    HartCtx::new(hart_id)
}
