//! The REPL engine.
//!
//! Hosts an externally built interpreter module, compiled to WebAssembly, as
//! an interactive session: the module is fetched and compiled by
//! `loader::ModuleLoader`, instantiated against `shim::SyscallShim`, and
//! driven through `session::ReplSession`, with strings crossing into its
//! linear memory by way of `marshal::MemoryMarshaller`.  Long-running calls
//! are interrupted cooperatively through `cancel::CancellationChannel`.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

pub mod cancel;
pub mod engines;
pub mod error;
pub mod loader;
pub mod marshal;
pub mod session;
pub mod shim;

pub use cancel::CancellationChannel;
pub use error::{EngineError, ErrNo};
pub use loader::ModuleLoader;
pub use marshal::MemoryMarshaller;
pub use session::{FormatOutcome, ReplSession, RunOutcome, RunReport, SessionState};
pub use shim::{CapturedOutput, OutputSink, Stream, SyscallShim};

use serde::{Deserialize, Serialize};

/// The timer backing the shim's clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// Nanosecond wall clock and a monotonic timer since shim creation.
    HighResolution,
    /// Millisecond wall clock scaled to nanoseconds, for every clock id.
    Coarse,
}

impl Default for ClockSource {
    fn default() -> Self {
        ClockSource::HighResolution
    }
}

/// A type representing the host configuration a module is run with.  The
/// argument and environment lists are fixed for the life of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Arguments reported through `args_get`, program name first.
    pub program_arguments: Vec<String>,
    /// Variables reported through `environ_get`.
    pub environment_variables: Vec<(String, String)>,
    /// Passed to the module's `use_bigint` once per instantiation.
    pub use_bigint: bool,
    pub clock: ClockSource,
    /// Source the session is created from after (re)instantiation.
    pub initial_source: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            program_arguments: vec!["sgleam".to_string()],
            environment_variables: vec![("RUST_BACKTRACE".to_string(), "1".to_string())],
            use_bigint: true,
            clock: ClockSource::default(),
            initial_source: String::new(),
        }
    }
}

impl HostConfig {
    pub fn with_program_arguments(mut self, program_arguments: Vec<String>) -> Self {
        self.program_arguments = program_arguments;
        self
    }

    pub fn with_environment_variables(
        mut self,
        environment_variables: Vec<(String, String)>,
    ) -> Self {
        self.environment_variables = environment_variables;
        self
    }

    /// Appends one variable to the environment.
    pub fn with_environment_variable<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.environment_variables.push((key.into(), value.into()));
        self
    }

    pub fn with_bigint(mut self, use_bigint: bool) -> Self {
        self.use_bigint = use_bigint;
        self
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_initial_source<S: Into<String>>(mut self, source: S) -> Self {
        self.initial_source = source.into();
        self
    }
}
