//! Security monitor errors
//!
//! All fallible monitor operations return [SmError], which maps one-to-one onto the stable SBI
//! error codes of the enclave extension. Errors never escalate beyond the SBI boundary: the
//! dispatcher turns them into the caller's return value.

use castellan_core::abi::error;
use thiserror_no_std::Error;

/// The error codes surfaced at the SBI boundary.
///
/// `Interrupted` and `EdgeCallHost` are not failures but control-flow returns from a stopped
/// enclave, they share the error channel so that the host can dispatch on a single value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SmError {
    #[error("cryptographic primitive failed")]
    UnknownError = error::UNKNOWN_ERROR,
    #[error("enclave was interrupted")]
    Interrupted = error::INTERRUPTED,
    #[error("PMP region allocation failed")]
    PmpFailure = error::PMP_FAILURE,
    #[error("enclave is not destroyable")]
    NotDestroyable = error::NOT_DESTROYABLE,
    #[error("argument region overlaps monitor memory")]
    RegionOverlaps = error::REGION_OVERLAPS,
    #[error("memory range leaves the caller's permitted regions")]
    NotAccessible = error::NOT_ACCESSIBLE,
    #[error("illegal argument")]
    IllegalArgument = error::ILLEGAL_ARGUMENT,
    #[error("enclave is not running")]
    NotRunning = error::NOT_RUNNING,
    #[error("enclave is not resumable")]
    NotResumable = error::NOT_RESUMABLE,
    #[error("enclave performed an edge call to the host")]
    EdgeCallHost = error::EDGE_CALL_HOST,
    #[error("enclave is not initialized")]
    NotInitialized = error::NOT_INITIALIZED,
    #[error("enclave table is full")]
    NoFreeResource = error::NO_FREE_RESOURCE,
    #[error("enclave is not fresh")]
    NotFresh = error::NOT_FRESH,
    #[error("function is not implemented")]
    NotImplemented = error::NOT_IMPLEMENTED,
}

impl SmError {
    /// The stable SBI error code for this error.
    pub fn code(self) -> usize {
        self as usize
    }
}
