// pyjail: capability-restricted Python sandboxes on an embedded RustPython VM.

pub mod audit;
pub mod cache;
mod finalizer;
pub mod modules;
mod namespace;
pub mod output;
pub mod runner;
pub mod sandbox;
pub mod timeout;
pub mod types;
pub(crate) mod vm;

pub use audit::{is_denied_attribute, DENIED_ATTRIBUTES};
pub use cache::PreparedCache;
pub use modules::check_module_allowed;
pub use output::OutputBuffer;
pub use runner::{run_isolated, run_isolated_with};
pub use sandbox::{Capabilities, Sandbox};
pub use timeout::{run_with_timeout, WorkerError};
pub use types::{
    ExecOutcome, FinalizerFault, GuestError, Lookup, RunReport, SandboxError, SandboxSettings,
    TeardownReport, DEFAULT_ALLOWED_MODULES, DEFAULT_CAPABILITIES,
};
