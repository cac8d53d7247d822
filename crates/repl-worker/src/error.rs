//! Errors raised by the session worker and its controller.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use err_derive::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The other end of the request or response channel has gone away.
    #[error(display = "WorkerError: the worker channel is disconnected.")]
    Disconnected,
    /// The worker could not load the module, or could not rebuild it after
    /// a crash, and will not become ready again.
    #[error(display = "WorkerError: session failed: {}.", _0)]
    SessionFailed(String),
    /// The worker thread could not be started.
    #[error(display = "WorkerError: failed to spawn the worker thread: {}.", _0)]
    SpawnFailed(String),
    /// The worker thread panicked.
    #[error(display = "WorkerError: the worker thread panicked.")]
    WorkerPanicked,
}
