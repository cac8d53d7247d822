//! The controlling side of the protocol.
//!
//! `SessionController` enforces the request discipline the worker relies on:
//! one request at a time, and nothing new until the previous one has been
//! answered with `ready` (or `format`).  A stop is the exception.  It goes
//! straight into the shared cancellation cell, since the worker is busy and
//! would not read a message until the run it is meant to interrupt is over.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{
    error::WorkerError,
    protocol::{Request, Response},
};
use anyhow::{anyhow, Result};
use log::{debug, info};
use repl_engine::{CancellationChannel, EngineError};
use std::{
    fmt,
    sync::mpsc::{Receiver, Sender},
    thread::JoinHandle,
};

/// Where the worker/session pairing is in its lifecycle, as seen by the
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The module is being fetched, or was lost and could not be rebuilt.
    Loading,
    /// The worker is idle and accepts a request.
    Ready,
    /// A request is in flight.
    Running,
    /// A request is in flight and a stop has been signalled.
    PendingStop,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handle on a running `SessionWorker`.
pub struct SessionController {
    requests: Sender<Request>,
    responses: Receiver<Response>,
    cancellation: CancellationChannel,
    state: WorkerState,
    initialised: bool,
    worker: Option<JoinHandle<()>>,
}

impl SessionController {
    pub(crate) fn new(
        requests: Sender<Request>,
        responses: Receiver<Response>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            requests,
            responses,
            cancellation: CancellationChannel::new(),
            state: WorkerState::Loading,
            initialised: false,
            worker: Some(worker),
        }
    }

    #[inline]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The cells shared with the worker.
    #[inline]
    pub fn cancellation(&self) -> &CancellationChannel {
        &self.cancellation
    }

    fn violation(&self, request: &str) -> anyhow::Error {
        anyhow!(EngineError::ProtocolViolation {
            state: self.state.to_string(),
            request: request.to_string(),
        })
    }

    fn send(&mut self, request: Request) -> Result<()> {
        if self.state != WorkerState::Ready {
            return Err(self.violation(request.name()));
        }
        debug!("Controller sending '{}'.", request.name());
        self.requests
            .send(request)
            .map_err(|_| anyhow!(WorkerError::Disconnected))?;
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Shares the cancellation cells with the worker.  Sent automatically on
    /// the first `ready`; it gets no answer of its own.
    pub fn init(&mut self) -> Result<()> {
        if self.state != WorkerState::Ready {
            return Err(self.violation("init"));
        }
        self.requests
            .send(Request::Init {
                data: self.cancellation.clone(),
            })
            .map_err(|_| anyhow!(WorkerError::Disconnected))?;
        self.initialised = true;
        Ok(())
    }

    /// Replaces the session with one created from `source`.
    pub fn load(&mut self, source: &str) -> Result<()> {
        self.send(Request::Load {
            data: source.to_string(),
        })
    }

    /// Evaluates `input`.
    pub fn run(&mut self, input: &str) -> Result<()> {
        self.send(Request::Run {
            data: input.to_string(),
        })
    }

    /// Asks for `source` to be formatted.  Answered by a `format` response.
    pub fn format(&mut self, source: &str) -> Result<()> {
        self.send(Request::Format {
            data: source.to_string(),
        })
    }

    /// Signals the in-flight request to stop at its next interrupt poll.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != WorkerState::Running {
            return Err(self.violation("stop"));
        }
        info!("Requesting stop.");
        self.cancellation.request_stop();
        self.state = WorkerState::PendingStop;
        Ok(())
    }

    /// Waits for the next response and updates the state to match.
    pub fn recv(&mut self) -> Result<Response> {
        let response = self
            .responses
            .recv()
            .map_err(|_| anyhow!(WorkerError::Disconnected))?;
        match &response {
            Response::Ready => {
                self.state = WorkerState::Ready;
                if !self.initialised {
                    self.init()?;
                }
            }
            Response::Format { .. } => self.state = WorkerState::Ready,
            Response::Error { .. } => self.state = WorkerState::Loading,
            Response::Output { .. } | Response::Progress { .. } => (),
        }
        Ok(response)
    }

    /// Receives until the worker is idle again, handing every intermediate
    /// response to `on_response`.  Returns the `ready` or `format` response
    /// that ended the request.  An `error` response ends it with
    /// `SessionFailed`.
    pub fn recv_until_ready<F>(&mut self, mut on_response: F) -> Result<Response>
    where
        F: FnMut(&Response),
    {
        loop {
            match self.recv()? {
                Response::Error { data } => {
                    return Err(anyhow!(WorkerError::SessionFailed(data)))
                }
                response @ Response::Ready | response @ Response::Format { .. } => {
                    return Ok(response)
                }
                response => on_response(&response),
            }
        }
    }

    /// Closes the request channel and waits for the worker to finish.  Any
    /// request still running is asked to stop first.
    pub fn shutdown(mut self) -> Result<()> {
        self.cancellation.request_stop();
        let worker = self.worker.take();
        drop(self);
        match worker {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!(WorkerError::WorkerPanicked)),
            None => Ok(()),
        }
    }
}
