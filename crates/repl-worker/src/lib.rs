//! The REPL session worker.
//!
//! A REPL module call is one synchronous foreign invocation, so the session
//! lives on a dedicated worker thread and the controlling side talks to it
//! through a pair of FIFO channels carrying `Request`s and `Response`s.  The
//! only state the two sides share directly is the `CancellationChannel`,
//! which lets a stop request reach a run that is still in flight.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

pub mod controller;
pub mod error;
pub mod protocol;
pub mod worker;

pub use controller::{SessionController, WorkerState};
pub use error::WorkerError;
pub use protocol::{Request, Response};
pub use worker::{ResponseSink, SessionWorker};
