//! Stable error codes exchanged at the library boundary.
//!
//! The numeric values are part of the wire contract with collaborators
//! (admin tools, the MPI interposer) and must not change. Positive values
//! are informational successes, zero is plain success, negative values are
//! failures.
use core::fmt;

/// Result alias for engine operations: `Ok` carries an informational code
/// (usually [`ErrorCode::Success`]), `Err` carries a failure code.
pub type DlbResult<T> = Result<(T, ErrorCode), ErrorCode>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation succeeded with no caveats.
    Success = 0,
    /// Operation succeeded, but as an asynchronous request that will be
    /// fulfilled later (e.g. a steal queued behind a busy CPU).
    Noted = 1,
    /// Operation was a no-op: the requested state already held.
    NoUpdate = 2,
    Unknown = -1,
    /// The engine has not been initialized.
    NotInitialized = -2,
    /// The engine is already initialized.
    AlreadyInitialized = -3,
    /// The engine, or a sub-feature of it, is disabled.
    Disabled = -4,
    /// No shared memory region is attached.
    NoSharedMemory = -5,
    /// Target pid is not a registered process.
    NoProcess = -6,
    /// Process has an outstanding dirty mask that must be acknowledged first.
    ProcessDirty = -7,
    /// Caller does not own the resource it tried to mutate.
    PermissionDenied = -8,
    /// A blocking poll exceeded its timeout.
    Timeout = -9,
    /// No callback registered for the requested event.
    NoCallback = -10,
    /// Requested entity does not exist.
    NoEntry = -11,
    /// Feature not compiled in / not supported on this platform.
    NotCompiled = -12,
    /// Conflicting request already outstanding.
    Request = -13,
    /// Out of memory, or the shared region is too small to hold a new entry.
    NoMemory = -14,
    /// No policy module active for the requested operation.
    NoPolicy = -15,
}

impl ErrorCode {
    pub const fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success | ErrorCode::Noted | ErrorCode::NoUpdate)
    }

    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorCode::Success => "success",
            ErrorCode::Noted => "request noted, will be fulfilled asynchronously",
            ErrorCode::NoUpdate => "no update: requested state already held",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::NotInitialized => "engine not initialized",
            ErrorCode::AlreadyInitialized => "engine already initialized",
            ErrorCode::Disabled => "feature disabled",
            ErrorCode::NoSharedMemory => "no shared memory region attached",
            ErrorCode::NoProcess => "process not registered",
            ErrorCode::ProcessDirty => "process mask change not yet acknowledged",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::NoCallback => "no callback registered",
            ErrorCode::NoEntry => "no such entry",
            ErrorCode::NotCompiled => "feature not compiled in",
            ErrorCode::Request => "conflicting request already outstanding",
            ErrorCode::NoMemory => "out of memory",
            ErrorCode::NoPolicy => "no policy active",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_match_wire_contract() {
        assert_eq!(ErrorCode::Success.as_i32(), 0);
        assert_eq!(ErrorCode::Noted.as_i32(), 1);
        assert_eq!(ErrorCode::NoUpdate.as_i32(), 2);
        assert_eq!(ErrorCode::Unknown.as_i32(), -1);
        assert_eq!(ErrorCode::NotInitialized.as_i32(), -2);
        assert_eq!(ErrorCode::NoSharedMemory.as_i32(), -5);
        assert_eq!(ErrorCode::NoProcess.as_i32(), -6);
        assert_eq!(ErrorCode::ProcessDirty.as_i32(), -7);
        assert_eq!(ErrorCode::PermissionDenied.as_i32(), -8);
        assert_eq!(ErrorCode::Timeout.as_i32(), -9);
        assert_eq!(ErrorCode::NoMemory.as_i32(), -14);
    }

    #[test]
    fn success_classification() {
        assert!(ErrorCode::Success.is_success());
        assert!(ErrorCode::Noted.is_success());
        assert!(ErrorCode::NoUpdate.is_success());
        assert!(!ErrorCode::Timeout.is_success());
    }
}
