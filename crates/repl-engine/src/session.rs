//! The REPL session lifecycle.
//!
//! A `ReplSession` owns one compiled module and at most one live instance of
//! it, and within that instance at most one live session handle.  States:
//!
//! ```text
//! Uninitialized --create--> Ready --run--> Running --+--> Ready
//!       ^                                            |
//!       +------------------ reload <-- Crashed <-----+ (trap)
//! ```
//!
//! A trap during any guest call leaves the instance's memory in an unknown
//! state, so it is never called into again: not even to release the buffer
//! the trapping call was given.  The whole instance is discarded and rebuilt
//! from the cached module, and `reload` recreates the session from the
//! source of the last successful `create`.
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
    cancel::CancellationChannel,
    engines::wasmtime::WasmtimeHost,
    error::EngineError,
    marshal::MemoryMarshaller,
    shim::{Activity, OutputSink, SharedSyscallShim, Stream, SyscallShim},
    HostConfig,
};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use wasmtime::{
    Engine, Instance, InstancePre, Module, Store, Trap, TypedFunc, WasmParams, WasmResults,
};

////////////////////////////////////////////////////////////////////////////////
// Session-visible types.
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No live handle.  An instance may or may not exist.
    Uninitialized,
    /// A handle is live and the session accepts input.
    Ready,
    /// A guest call is in flight.
    Running,
    /// The instance trapped and must be rebuilt.
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// The session stays as it is.
    Continue,
    /// The module asked to quit; the session was replaced by an empty one.
    Quit,
}

/// What happened during one run.  Created when the run starts and finalised
/// when it returns.  A trap is not a report: it is an `EvaluationTrap` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// A stop request reached the module through `check_interrupt`.
    pub interrupted: bool,
    pub activity: Activity,
}

/// Result of `format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatOutcome {
    /// The reformatted source.
    Formatted(String),
    /// The source is already canonical, or could not be parsed.
    Unchanged,
}

////////////////////////////////////////////////////////////////////////////////
// Module exports.
////////////////////////////////////////////////////////////////////////////////

const REPL_NEW_EXPORT: &str = "repl_new";
const REPL_RUN_EXPORT: &str = "repl_run";
const REPL_DESTROY_EXPORT: &str = "repl_destroy";
const FORMAT_EXPORT: &str = "format";
const USE_BIGINT_EXPORT: &str = "use_bigint";
const CSTR_DEALLOCATE_EXPORT: &str = "cstr_deallocate";

/// The session entry points of one instance.
struct SessionExports {
    repl_new: TypedFunc<(u32, u32), u32>,
    repl_run: TypedFunc<(u32, u32, u32), u32>,
    repl_destroy: TypedFunc<u32, ()>,
    format: Option<TypedFunc<(u32, u32), u32>>,
    cstr_deallocate: Option<TypedFunc<u32, ()>>,
}

/// One instantiation of the module.
struct LiveInstance {
    store: Store<SharedSyscallShim>,
    marshaller: MemoryMarshaller,
    exports: SessionExports,
    handle: Option<u32>,
}

/// Renders a guest-call failure, naming the trap when there is one.
fn describe_failure(error: &anyhow::Error, exit_code: Option<u32>) -> String {
    if let Some(code) = exit_code {
        return format!("module exited with code {}", code);
    }
    match error.downcast_ref::<Trap>() {
        Some(Trap::StackOverflow) => "stack overflow".to_string(),
        Some(trap) => trap.to_string(),
        None => format!("{:#}", error),
    }
}

////////////////////////////////////////////////////////////////////////////////
// The session.
////////////////////////////////////////////////////////////////////////////////

/// One interactive session over a compiled REPL module.
pub struct ReplSession {
    instance_pre: InstancePre<SharedSyscallShim>,
    config: HostConfig,
    shim: SharedSyscallShim,
    live: Option<LiveInstance>,
    state: SessionState,
    /// Source of the last session created, replayed by `reload`.
    source: String,
}

impl ReplSession {
    /// Links `module` against a fresh shim.  Nothing is instantiated until
    /// the first `create` (or an explicit `instantiate`).
    pub fn new(
        engine: &Engine,
        module: &Module,
        config: HostConfig,
        sink: Box<dyn OutputSink>,
        cancellation: CancellationChannel,
    ) -> Result<Self> {
        let linker = WasmtimeHost::link(engine, module)
            .map_err(|e| anyhow!(EngineError::LoadFailed(format!("{:#}", e))))?;
        let instance_pre = linker
            .instantiate_pre(module)
            .map_err(|e| anyhow!(EngineError::LoadFailed(format!("{:#}", e))))?;
        let shim = SyscallShim::shared(&config, sink, cancellation);
        let source = config.initial_source.clone();
        Ok(Self {
            instance_pre,
            config,
            shim,
            live: None,
            state: SessionState::Uninitialized,
            source,
        })
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The source `reload` would recreate the session from.
    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The live session handle, if any.
    #[inline]
    pub fn handle(&self) -> Option<u32> {
        self.live.as_ref().and_then(|live| live.handle)
    }

    /// Buffers currently allocated in the module on the host's behalf.
    pub fn live_allocations(&self) -> usize {
        self.live
            .as_ref()
            .map_or(0, |live| live.marshaller.live_allocations())
    }

    /// The cancellation cells the interrupt check and sleep import use.
    pub fn cancellation(&self) -> Result<CancellationChannel> {
        let shim = self.shim.lock().map_err(EngineError::from)?;
        Ok(shim.cancellation().clone())
    }

    /// Shares new cancellation cells with the shim.
    pub fn set_cancellation(&mut self, cancellation: CancellationChannel) -> Result<()> {
        let mut shim = self.shim.lock().map_err(EngineError::from)?;
        shim.set_cancellation(cancellation);
        Ok(())
    }

    /// Sends host-generated text through the same sink as module output.
    pub fn emit(&self, stream: Stream, data: String) -> Result<()> {
        let mut shim = self.shim.lock().map_err(EngineError::from)?;
        shim.emit(stream, data);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Instances.
    ////////////////////////////////////////////////////////////////////////////

    /// Discards any current instance and creates a fresh one.  The module's
    /// numeric mode is configured once here.
    pub fn instantiate(&mut self) -> Result<()> {
        if self.live.take().is_some() {
            info!("Discarding the previous instance.");
        }
        self.state = SessionState::Uninitialized;
        self.shim.lock().map_err(EngineError::from)?.reset_instance_state();

        let mut store = Store::new(self.instance_pre.module().engine(), self.shim.clone());
        let instance = self
            .instance_pre
            .instantiate(&mut store)
            .map_err(|e| anyhow!(EngineError::LoadFailed(format!("{:#}", e))))?;
        let marshaller = MemoryMarshaller::new(instance, &mut store)?;

        let exports = SessionExports {
            repl_new: typed_export(&instance, &mut store, REPL_NEW_EXPORT)?,
            repl_run: typed_export(&instance, &mut store, REPL_RUN_EXPORT)?,
            repl_destroy: typed_export(&instance, &mut store, REPL_DESTROY_EXPORT)?,
            format: typed_export(&instance, &mut store, FORMAT_EXPORT).ok(),
            cstr_deallocate: typed_export(&instance, &mut store, CSTR_DEALLOCATE_EXPORT).ok(),
        };

        match instance.get_typed_func::<u32, ()>(&mut store, USE_BIGINT_EXPORT) {
            Ok(use_bigint) => use_bigint
                .call(&mut store, u32::from(self.config.use_bigint))
                .map_err(|e| anyhow!(EngineError::LoadFailed(format!("{:#}", e))))?,
            Err(_) => debug!("Module has no {} export.", USE_BIGINT_EXPORT),
        }

        info!("Instance created.");
        self.live = Some(LiveInstance {
            store,
            marshaller,
            exports,
            handle: None,
        });
        Ok(())
    }

    /// Marks the instance as lost after a failed guest call, flushing any
    /// output the module produced before it failed.
    fn crash(&mut self, error: anyhow::Error) -> anyhow::Error {
        let exit_code = match self.shim.lock() {
            Ok(mut shim) => {
                shim.flush();
                shim.exit_code()
            }
            Err(_) => None,
        };
        let reason = describe_failure(&error, exit_code);
        warn!("Module trapped: {}", reason);
        self.state = SessionState::Crashed;
        anyhow!(EngineError::EvaluationTrap(reason))
    }

    /// The live instance, instantiating one if there is none or the last one
    /// crashed.
    fn live_instance(&mut self) -> Result<&mut LiveInstance> {
        if self.live.is_none() || self.state == SessionState::Crashed {
            self.instantiate()?;
        }
        self.live
            .as_mut()
            .ok_or_else(|| anyhow!(EngineError::SessionNotReady(SessionState::Uninitialized)))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Session operations.
    ////////////////////////////////////////////////////////////////////////////

    /// Creates a session from `source`, destroying any live one first.
    pub fn create(&mut self, source: &str) -> Result<()> {
        if self.state == SessionState::Running {
            return Err(anyhow!(EngineError::SessionNotReady(self.state)));
        }
        self.destroy()?;

        let live = self.live_instance()?;
        let repl_new = &live.exports.repl_new;
        let result = live
            .marshaller
            .with_string(&mut live.store, source, |store, pointer, length| {
                repl_new.call(store, (pointer, length))
            });

        match result {
            Ok(handle) => {
                live.handle = Some(handle);
                self.state = SessionState::Ready;
                self.source = source.to_string();
                info!("Session {:#x} created.", handle);
                Ok(())
            }
            Err(e) => Err(self.crash(e)),
        }
    }

    /// Evaluates `input` in the live session.  A pending stop from before
    /// this call is discarded first.
    pub fn run(&mut self, input: &str) -> Result<RunReport> {
        if self.state != SessionState::Ready {
            return Err(anyhow!(EngineError::SessionNotReady(self.state)));
        }
        {
            let mut shim = self.shim.lock().map_err(EngineError::from)?;
            shim.cancellation().reset();
            shim.take_activity();
        }
        self.state = SessionState::Running;

        let live = self
            .live
            .as_mut()
            .ok_or_else(|| anyhow!(EngineError::SessionNotReady(SessionState::Uninitialized)))?;
        let handle = live
            .handle
            .ok_or_else(|| anyhow!(EngineError::SessionNotReady(SessionState::Uninitialized)))?;
        let repl_run = &live.exports.repl_run;
        let result = live
            .marshaller
            .with_string(&mut live.store, input, |store, pointer, length| {
                repl_run.call(store, (handle, pointer, length))
            });

        let quit = match result {
            Ok(quit) => quit != 0,
            Err(e) => return Err(self.crash(e)),
        };
        let activity = {
            let mut shim = self.shim.lock().map_err(EngineError::from)?;
            shim.flush();
            shim.take_activity()
        };
        self.state = SessionState::Ready;

        let outcome = if quit {
            info!("Module requested quit; recreating the session.");
            self.create("")?;
            RunOutcome::Quit
        } else {
            RunOutcome::Continue
        };
        Ok(RunReport {
            outcome,
            interrupted: activity.interrupts > 0,
            activity,
        })
    }

    /// Formats `source` without touching the session handle.
    pub fn format(&mut self, source: &str) -> Result<FormatOutcome> {
        if self.state == SessionState::Running {
            return Err(anyhow!(EngineError::SessionNotReady(self.state)));
        }
        let live = self.live_instance()?;
        let format = live
            .exports
            .format
            .as_ref()
            .ok_or_else(|| anyhow!(EngineError::MissingExport(FORMAT_EXPORT.to_string())))?;
        let cstr_deallocate = live.exports.cstr_deallocate.as_ref();
        let marshaller = &mut live.marshaller;
        let store = &mut live.store;

        let result = marshaller
            .with_string(&mut *store, source, |store, pointer, length| {
                format.call(store, (pointer, length))
            })
            .and_then(|pointer| {
                if pointer == 0 {
                    return Ok(None);
                }
                let formatted = marshaller.read_cstring(&mut *store, pointer);
                let length = formatted.as_ref().map_or(0, |text| text.len() as u32);
                match cstr_deallocate {
                    Some(release) => release.call(&mut *store, pointer)?,
                    None => {
                        marshaller.adopt(pointer, length + 1)?;
                        marshaller.deallocate(&mut *store, pointer)?;
                    }
                }
                formatted.map(Some)
            });

        match result {
            Ok(Some(formatted)) if formatted != source => Ok(FormatOutcome::Formatted(formatted)),
            Ok(_) => Ok(FormatOutcome::Unchanged),
            Err(e) => Err(self.crash(e)),
        }
    }

    /// Releases the live handle.  A no-op when there is none; after a crash
    /// the handle is dropped along with its instance, without calling in.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == SessionState::Crashed {
            if let Some(live) = self.live.as_mut() {
                live.handle = None;
            }
            return Ok(());
        }
        let live = match self.live.as_mut() {
            Some(live) => live,
            None => return Ok(()),
        };
        let handle = match live.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.state = SessionState::Uninitialized;
        match live.exports.repl_destroy.call(&mut live.store, handle) {
            Ok(()) => {
                info!("Session {:#x} destroyed.", handle);
                Ok(())
            }
            Err(e) => Err(self.crash(e)),
        }
    }

    /// Rebuilds the instance from scratch and recreates the last session
    /// created, or the configured initial source if there was none.
    pub fn reload(&mut self) -> Result<()> {
        info!("Reloading the module instance.");
        self.instantiate()?;
        let source = self.source.clone();
        self.create(&source)
    }
}

/// Looks up export `name` with the given signature.
fn typed_export<P: WasmParams, R: WasmResults>(
    instance: &Instance,
    store: &mut Store<SharedSyscallShim>,
    name: &str,
) -> Result<TypedFunc<P, R>> {
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|_| anyhow!(EngineError::MissingExport(name.to_string())))
}
