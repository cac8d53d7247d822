//! The execution side of the protocol.
//!
//! The worker thread owns the `ReplSession` and with it the module instance;
//! nothing else ever touches its memory.  Requests are handled one at a time,
//! in arrival order, and every request that can change the session ends with
//! either `ready` (the session is usable) or `error` (it never will be
//! again).
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
    controller::SessionController,
    error::WorkerError,
    protocol::{Request, Response},
};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use repl_engine::{
    engines::wasmtime::new_engine, CancellationChannel, EngineError, FormatOutcome, HostConfig,
    ModuleLoader, OutputSink, ReplSession, RunOutcome, Stream,
};
use std::{
    sync::mpsc::{channel, Receiver, Sender},
    thread,
};

/// Printed when a run was stopped and the module did not say so itself.
pub const INTERRUPTED_NOTICE: &str = "Interrupted.\n";
/// Printed when the module asks to quit, before the fresh session is ready.
pub const QUIT_NOTICE: &str = "Reloading the repl.\n";
/// Printed when the module traps, before the rebuilt session is ready.
pub const TRAP_NOTICE: &str = "Execution error (probably a stack overflow). Reloading the repl.\n";

/// Forwards module output to the controller as `output` responses.
pub struct ResponseSink(Sender<Response>);

impl ResponseSink {
    #[inline]
    pub fn new(responses: Sender<Response>) -> Self {
        ResponseSink(responses)
    }
}

impl OutputSink for ResponseSink {
    fn emit(&mut self, stream: Stream, data: String) {
        if self.0.send(Response::Output { stream, data }).is_err() {
            debug!("Controller gone; dropping {:?} output.", stream);
        }
    }
}

/// A session plus the channel its answers go back on.
pub struct SessionWorker {
    session: ReplSession,
    responses: Sender<Response>,
}

impl SessionWorker {
    #[inline]
    pub fn new(session: ReplSession, responses: Sender<Response>) -> Self {
        Self { session, responses }
    }

    /// Starts a worker thread that loads the module at `url` and creates a
    /// session from `config.initial_source`.  Loading progress, then `ready`
    /// or `error`, arrive through the returned controller.
    pub fn spawn(url: String, config: HostConfig) -> Result<SessionController> {
        let (request_sender, request_receiver) = channel();
        let (response_sender, response_receiver) = channel();

        let handle = thread::Builder::new()
            .name("repl-worker".to_string())
            .spawn(move || Self::main_loop(&url, config, request_receiver, response_sender))
            .map_err(|e| anyhow!(WorkerError::SpawnFailed(e.to_string())))?;

        Ok(SessionController::new(
            request_sender,
            response_receiver,
            handle,
        ))
    }

    fn main_loop(
        url: &str,
        config: HostConfig,
        requests: Receiver<Request>,
        responses: Sender<Response>,
    ) {
        let mut worker = match Self::start(url, config, &responses) {
            Ok(worker) => worker,
            Err(e) => {
                error!("Worker failed to start: {:#}", e);
                if responses
                    .send(Response::Error {
                        data: format!("{:#}", e),
                    })
                    .is_err()
                {
                    debug!("Controller gone before the load failure was reported.");
                }
                return;
            }
        };

        while let Ok(request) = requests.recv() {
            if let Err(e) = worker.dispatch(request) {
                error!("Worker stopping: {:#}", e);
                break;
            }
        }
        info!("Worker exiting.");
    }

    /// Loads and compiles the module, reporting progress, then creates the
    /// first session.
    fn start(url: &str, config: HostConfig, responses: &Sender<Response>) -> Result<Self> {
        let loader = ModuleLoader::new(new_engine()?);
        let progress = responses.clone();
        let module = loader.load(url, &mut |percent| {
            if progress.send(Response::Progress { data: percent }).is_err() {
                debug!("Controller gone; dropping progress report.");
            }
        })?;

        let initial_source = config.initial_source.clone();
        let mut session = ReplSession::new(
            loader.engine(),
            &module,
            config,
            Box::new(ResponseSink::new(responses.clone())),
            CancellationChannel::new(),
        )?;
        session.create(&initial_source)?;

        let worker = Self::new(session, responses.clone());
        worker.respond(Response::Ready)?;
        Ok(worker)
    }

    fn respond(&self, response: Response) -> Result<()> {
        debug!("Worker responding: {:?}", response);
        self.responses
            .send(response)
            .map_err(|_| anyhow!(WorkerError::Disconnected))
    }

    /// Handles one request.  An error return means the controller is gone and
    /// the worker should stop.
    pub fn dispatch(&mut self, request: Request) -> Result<()> {
        debug!("Worker received '{}'.", request.name());
        match request {
            Request::Init { data } => {
                self.session.set_cancellation(data)?;
                info!("Cancellation cells installed.");
                Ok(())
            }
            Request::Load { data } => {
                let result = self.session.create(&data);
                self.settle(result)
            }
            Request::Run { data } => {
                let report = match self.session.run(&data) {
                    Ok(report) => report,
                    Err(e) => return self.settle(Err(e)),
                };
                if report.interrupted && report.activity.stderr_bytes == 0 {
                    self.session
                        .emit(Stream::Stderr, INTERRUPTED_NOTICE.to_string())?;
                }
                if report.outcome == RunOutcome::Quit {
                    self.session.emit(Stream::Stdout, QUIT_NOTICE.to_string())?;
                }
                self.respond(Response::Ready)
            }
            Request::Format { data } => {
                let formatted = match self.session.format(&data) {
                    Ok(FormatOutcome::Formatted(text)) => Some(text),
                    Ok(FormatOutcome::Unchanged) => None,
                    Err(e) => {
                        if !self.recover(e)? {
                            return Ok(());
                        }
                        None
                    }
                };
                self.respond(Response::Format { data: formatted })
            }
            Request::Stop => {
                debug!("Stop message received; the shared cell carries the request.");
                Ok(())
            }
        }
    }

    /// Ends a session-changing request with `ready`, or with `error` when a
    /// crashed session cannot be rebuilt.
    fn settle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.respond(Response::Ready),
            Err(e) => {
                if self.recover(e)? {
                    self.respond(Response::Ready)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Reports a failed request.  A trap rebuilds the instance; anything else
    /// is shown on stderr and leaves the session as it was.  Returns whether
    /// the session is usable afterwards; when it is not, `error` has already
    /// been sent.
    fn recover(&mut self, failure: anyhow::Error) -> Result<bool> {
        let fatal = failure
            .downcast_ref::<EngineError>()
            .map_or(false, EngineError::is_fatal);
        if !fatal {
            warn!("Request failed: {:#}", failure);
            self.session
                .emit(Stream::Stderr, format!("{:#}\n", failure))?;
            return Ok(true);
        }

        warn!("{:#}", failure);
        self.session.emit(Stream::Stderr, TRAP_NOTICE.to_string())?;
        match self.session.reload() {
            Ok(()) => Ok(true),
            Err(e) => {
                error!("Failed to rebuild the session: {:#}", e);
                self.respond(Response::Error {
                    data: format!("{:#}", e),
                })?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::TryRecvError;

    const MOCK_REPL: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../test-collateral/mock_repl.wat"
    );

    fn new_worker() -> (SessionWorker, Receiver<Response>) {
        let loader = ModuleLoader::new(new_engine().unwrap());
        let module = loader.load(MOCK_REPL, &mut |_| {}).unwrap();
        let (sender, receiver) = channel();
        let mut session = ReplSession::new(
            loader.engine(),
            &module,
            HostConfig::default(),
            Box::new(ResponseSink::new(sender.clone())),
            CancellationChannel::new(),
        )
        .unwrap();
        session.create("").unwrap();
        (SessionWorker::new(session, sender), receiver)
    }

    #[test]
    fn stop_message_is_benign() {
        let (mut worker, responses) = new_worker();
        worker.dispatch(Request::Stop).unwrap();
        assert_eq!(responses.try_recv(), Err(TryRecvError::Empty));

        worker
            .dispatch(Request::Run {
                data: "1 + 2".to_string(),
            })
            .unwrap();
        let received: Vec<Response> = responses.try_iter().collect();
        assert_eq!(
            received,
            vec![
                Response::Output {
                    stream: Stream::Stdout,
                    data: "3\n".to_string()
                },
                Response::Ready
            ]
        );
    }

    #[test]
    fn init_installs_cancellation_cells() {
        let (mut worker, responses) = new_worker();
        let cancellation = CancellationChannel::new();
        worker
            .dispatch(Request::Init {
                data: cancellation.clone(),
            })
            .unwrap();
        assert_eq!(responses.try_recv(), Err(TryRecvError::Empty));

        cancellation.request_stop();
        assert!(worker.session.cancellation().unwrap().is_stop_requested());
    }

    #[test]
    fn non_fatal_failures_keep_the_session() {
        let (mut worker, responses) = new_worker();
        worker.session.destroy().unwrap();
        worker
            .dispatch(Request::Run {
                data: "1 + 2".to_string(),
            })
            .unwrap();
        let received: Vec<Response> = responses.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(
            &received[0],
            Response::Output { stream: Stream::Stderr, data } if data.contains("not ready")
        ));
        assert_eq!(received[1], Response::Ready);
    }
}
