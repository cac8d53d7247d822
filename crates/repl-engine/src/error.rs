//! Errors raised by the REPL engine.
//!
//! Two channels are kept apart here: `ErrNo` is the status convention the
//! hosted module understands, and is returned to it as a raw `u32` from every
//! syscall import.  `EngineError` is the host-side taxonomy: a module that
//! fails to load, traps, or is driven out of order.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::session::SessionState;
use err_derive::Error;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::sync::PoisonError;

////////////////////////////////////////////////////////////////////////////////
// Syscall status codes.
////////////////////////////////////////////////////////////////////////////////

/// The subset of WASI error numbers the syscall shim ever reports back to the
/// module.  Values follow `wasi_snapshot_preview1`.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum ErrNo {
    /// No error occurred.
    Success = 0,
    /// Permission denied.
    Access = 2,
    /// Bad file descriptor.
    BadF = 8,
    /// Device or resource busy.
    Busy = 10,
    /// Bad address.
    Fault = 21,
    /// Illegal byte sequence.
    IlSeq = 25,
    /// Invalid argument.
    Inval = 28,
    /// Function not supported.
    NoSys = 52,
}

/// Result of a single syscall as seen by the shim.
pub type ShimResult<T> = Result<T, ErrNo>;

impl From<std::io::Error> for ErrNo {
    #[inline]
    fn from(_: std::io::Error) -> Self {
        ErrNo::Fault
    }
}

////////////////////////////////////////////////////////////////////////////////
// Host-side errors.
////////////////////////////////////////////////////////////////////////////////

/// A host-side failure while loading, instantiating or driving the module.
///
/// Only `EvaluationTrap` invalidates a live instance; every other variant
/// leaves the session in the state it was in before the failing call.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The module could not be fetched, compiled or instantiated.  Terminal
    /// for this attempt; the caller may retry by loading again.
    #[error(display = "EngineError: failed to load module: {}.", _0)]
    LoadFailed(String),
    /// The module trapped (or otherwise faulted) during a guest call.
    #[error(display = "EngineError: module trapped during evaluation: {}.", _0)]
    EvaluationTrap(String),
    /// A request arrived while the session was in a state that cannot accept
    /// it.
    #[error(
        display = "EngineError: request '{}' is not valid in state {}.",
        request,
        state
    )]
    ProtocolViolation {
        /// The state the receiver was in.
        state: String,
        /// The rejected request.
        request: String,
    },
    /// The module does not export a function the host contract requires.
    #[error(display = "EngineError: module does not export '{}'.", _0)]
    MissingExport(String),
    /// The module imports a host function that this host does not provide.
    #[error(
        display = "EngineError: unknown host function '{}::{}'.",
        module,
        name
    )]
    UnknownHostFunction {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },
    /// No linear memory is exported under the expected name.
    #[error(display = "EngineError: no linear memory exported by the module.")]
    NoMemoryExported,
    /// An access fell outside the module's linear memory.
    #[error(
        display = "EngineError: invalid memory access at {:#x} (length {}).",
        address,
        length
    )]
    InvalidMemoryAccess {
        /// Start of the access.
        address: u32,
        /// Length of the access in bytes.
        length: u32,
    },
    /// Bytes read back from the module were not valid UTF-8.
    #[error(display = "EngineError: module returned a string that is not valid UTF-8.")]
    InvalidUtf8,
    /// A pointer was released that is not currently allocated.
    #[error(display = "EngineError: pointer {:#x} released twice or never allocated.", _0)]
    DoubleFree(u32),
    /// The module's allocator returned a pointer that is still live.
    #[error(display = "EngineError: allocator returned live pointer {:#x}.", _0)]
    AllocationAliased(u32),
    /// The shared syscall shim could not be locked.
    #[error(display = "EngineError: failed to obtain lock on the syscall shim.")]
    FailedLockShim,
    /// The session was asked to do something it cannot do in its current
    /// state.
    #[error(display = "EngineError: session is not ready (state {:?}).", _0)]
    SessionNotReady(SessionState),
}

impl<T> From<PoisonError<T>> for EngineError {
    fn from(_error: PoisonError<T>) -> Self {
        EngineError::FailedLockShim
    }
}

impl EngineError {
    /// Whether the error leaves the instance unusable, forcing a rebuild.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::EvaluationTrap(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn errno_values_match_preview1() {
        assert_eq!(ErrNo::BadF.to_u32(), Some(8));
        assert_eq!(ErrNo::Inval.to_u32(), Some(28));
        assert_eq!(ErrNo::NoSys.to_u32(), Some(52));
        assert_eq!(ErrNo::from_u32(0), Some(ErrNo::Success));
        assert_eq!(ErrNo::from_u32(1), None);
    }

    #[test]
    fn only_traps_are_fatal() {
        assert!(EngineError::EvaluationTrap("unreachable".into()).is_fatal());
        assert!(!EngineError::LoadFailed("404".into()).is_fatal());
        assert!(!EngineError::DoubleFree(16).is_fatal());
    }
}
