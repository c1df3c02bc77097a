//! Foundational public types for the pyjail library.
//!
//! - [`SandboxSettings`] — what a new sandbox is granted
//! - [`ExecOutcome`] — the result of one `execute` call
//! - [`TeardownReport`] / [`FinalizerFault`] — what happened at dispose
//! - [`GuestError`] — guest-visible failure kinds
//! - [`SandboxError`] — host-side failures

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Builtin names granted to a freshly created sandbox.
///
/// Exception types are always granted in addition to this list. `open` is
/// present so that hosts can revoke it explicitly; `eval`, `exec`, `compile`,
/// `globals`, `locals`, `vars`, `input` and `breakpoint` are never granted by
/// default.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "abs",
    "all",
    "any",
    "ascii",
    "bin",
    "bool",
    "bytearray",
    "bytes",
    "callable",
    "chr",
    "classmethod",
    "complex",
    "delattr",
    "dict",
    "dir",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "getattr",
    "hasattr",
    "hash",
    "hex",
    "id",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "open",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "setattr",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
];

/// Modules guest code may import by default.
///
/// All of them are implemented natively in Rust and hold no reference to
/// `sys`, `os` or `io`.
pub const DEFAULT_ALLOWED_MODULES: &[&str] =
    &["math", "cmath", "itertools", "binascii", "unicodedata"];

/// Configuration applied when a sandbox is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Builtin names granted at creation (see [`DEFAULT_CAPABILITIES`]).
    pub capabilities: Vec<String>,

    /// Module names guest code may import (see [`DEFAULT_ALLOWED_MODULES`]).
    pub allowed_modules: Vec<String>,

    /// Combined stdout + stderr budget for one `execute` call or one teardown.
    /// Default: 1,048,576 bytes (1 MiB).
    pub max_output_bytes: usize,

    /// Wall-clock limit for [`run_isolated`](crate::run_isolated).
    /// Default: 5,000,000,000 ns (5 seconds).
    pub timeout_ns: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            capabilities: DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_output_bytes: 1_048_576,
            timeout_ns: 5_000_000_000,
        }
    }
}

impl SandboxSettings {
    /// Loads settings from a JSON file. Fields missing from the file keep
    /// their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, SandboxError> {
        let text = std::fs::read_to_string(path).map_err(|e| SandboxError::Settings {
            message: format!("{}: {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| SandboxError::Settings {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Defaults, overridden by `PYJAIL_MAX_OUTPUT_BYTES` and `PYJAIL_TIMEOUT_NS`
    /// when those are set to valid numbers.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(bytes) = env_number("PYJAIL_MAX_OUTPUT_BYTES") {
            settings.max_output_bytes = bytes as usize;
        }
        if let Some(ns) = env_number("PYJAIL_TIMEOUT_NS") {
            settings.timeout_ns = ns;
        }
        settings
    }

    /// Returns these settings without `name` in the granted capability list.
    pub fn without_capability(mut self, name: &str) -> Self {
        self.capabilities.retain(|c| c != name);
        self
    }
}

fn env_number(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

/// How guest code tried to reach a missing capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookup {
    /// Bare name lookup (`open`), raised as `NameError`.
    Name,
    /// Attribute traversal (`math.open`, `f.__globals__`).
    Attribute,
}

/// Failures observable by the host after running guest code.
///
/// Serialized with an internally-tagged `"type"` discriminator.
///
/// ```json
/// {"type":"ImportDenied","module_name":"os"}
/// {"type":"CapabilityUnreachable","name":"open","lookup":"Name"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "type")]
pub enum GuestError {
    /// The source could not be parsed.
    #[error("syntax error at {line}:{col}: {message}")]
    SyntaxError {
        message: String,
        /// 1-based, 0 if unknown.
        line: u32,
        /// 1-based, 0 if unknown.
        col: u32,
    },

    /// Guest code imported a module outside the allowlist.
    #[error("import of module '{module_name}' is not allowed")]
    ImportDenied { module_name: String },

    /// Guest code used a name that is not (or no longer) in the sandbox.
    #[error("capability '{name}' is unreachable ({lookup:?} lookup)")]
    CapabilityUnreachable { name: String, lookup: Lookup },

    /// Any other exception raised by guest code.
    #[error("{message}")]
    RuntimeError { message: String, traceback: String },

    /// Guest output exceeded [`SandboxSettings::max_output_bytes`].
    #[error("output limit of {limit_bytes} bytes exceeded")]
    OutputLimitExceeded { limit_bytes: usize },

    /// A one-shot run exceeded [`SandboxSettings::timeout_ns`].
    #[error("execution exceeded {limit_ns} ns")]
    Timeout { limit_ns: u64 },
}

impl GuestError {
    /// True for the two boundary failures: denied import and unreachable capability.
    pub fn is_capability_denial(&self) -> bool {
        matches!(
            self,
            Self::ImportDenied { .. } | Self::CapabilityUnreachable { .. }
        )
    }
}

/// Host-side failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox initialisation failed: {message}")]
    Init { message: String },

    #[error("capability '{name}' does not exist on the host")]
    UnknownCapability { name: String },

    #[error("invalid settings: {message}")]
    Settings { message: String },

    /// The interpreter failed while the host was editing the namespace.
    #[error("interpreter error: {message}")]
    Vm { message: String },

    /// The one-shot runner's worker thread died or could not start.
    #[error("sandbox worker failed: {message}")]
    Worker { message: String },
}

/// The outcome of one [`Sandbox::execute`](crate::Sandbox::execute) call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Everything written to `sys.stdout` during the call.
    pub stdout: String,

    /// Everything written to `sys.stderr` during the call.
    pub stderr: String,

    /// `repr()` of the trailing bare expression, if the source ended with one
    /// and it did not evaluate to `None`.
    pub return_value: Option<String>,

    /// `repr()` of every public guest global holding plain data after the call.
    pub bindings: BTreeMap<String, String>,

    /// `None` on success.
    pub error: Option<GuestError>,

    /// Elapsed wall-clock time in nanoseconds.
    pub duration_ns: u64,
}

impl ExecOutcome {
    pub fn binding(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// `Err` with a copy of the guest error, if any.
    pub fn check(&self) -> Result<(), GuestError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// A finalizer that raised during teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizerFault {
    /// Name of the guest class whose `__del__` raised.
    pub type_name: String,
    pub error: GuestError,
}

/// What happened while a sandbox was disposed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Number of tracked finalizers that ran.
    pub finalized: usize,
    /// Finalizers that raised, in the order they ran.
    pub faults: Vec<FinalizerFault>,
    /// Output written by finalizers.
    pub stdout: String,
    pub stderr: String,
}

/// Result of [`run_isolated`](crate::run_isolated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: ExecOutcome,
    /// `None` when the run timed out and the sandbox thread was abandoned.
    pub teardown: Option<TeardownReport>,
}
