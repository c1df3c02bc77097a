//! The sandbox: an interpreter whose reachable capabilities are a
//! host-controlled subset of the host's.
//!
//! ## Lifecycle
//!
//! 1. [`Sandbox::create`] builds a private interpreter, captures its output,
//!    installs the finalizer tracker and the import gate, and prunes the
//!    builtin namespace to the granted set.
//! 2. [`Sandbox::execute`] runs guest source against a persistent `__main__`
//!    globals dict; successive calls share state.
//! 3. [`Sandbox::capabilities`] edits the namespace between calls. Changes are
//!    seen by every guest object, including ones created earlier.
//! 4. [`Sandbox::dispose`] (or drop) finalizes live guest objects while the
//!    namespace is still intact, then tears everything down.
//!
//! A sandbox is neither `Send` nor `Sync`; it runs guest code on the thread
//! that owns it.

use std::collections::BTreeMap;
use std::time::Instant;

use rustpython_vm::{
    builtins::PyDictRef, compiler::Mode, scope::Scope, AsObject, Interpreter, PyObject, PyResult,
    VirtualMachine,
};

use crate::audit::RESULT_NAME;
use crate::cache::PreparedCache;
use crate::finalizer::Tracker;
use crate::namespace::Namespace;
use crate::output::OutputBuffer;
use crate::types::{ExecOutcome, GuestError, SandboxError, SandboxSettings, TeardownReport};
use crate::vm::{
    build_interpreter, exception_message, install_output_capture, string_keys, syntax_error,
};

pub struct Sandbox {
    namespace: Namespace,
    globals: PyDictRef,
    tracker: Tracker,
    output: OutputBuffer,
    settings: SandboxSettings,
    disposed: bool,
    // Declared last so every object reference above is released first.
    interp: Interpreter,
}

impl Sandbox {
    /// A sandbox with [`SandboxSettings::default`].
    pub fn new() -> Result<Self, SandboxError> {
        Self::create(SandboxSettings::default())
    }

    pub fn create(settings: SandboxSettings) -> Result<Self, SandboxError> {
        let interp = build_interpreter();
        let output = OutputBuffer::new(settings.max_output_bytes);

        let parts = interp.enter(|vm| {
            let built: PyResult<(Namespace, PyDictRef, Tracker)> = (|| {
                install_output_capture(vm, &output)?;
                let (tracker, build_class) = Tracker::install(vm)?;
                let globals = vm.ctx.new_dict();
                globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
                globals.set_item("__doc__", vm.ctx.none(), vm)?;
                let namespace = Namespace::install(vm, &settings, &globals, build_class)?;
                Ok((namespace, globals, tracker))
            })();
            built.map_err(|exc| exception_message(vm, &exc))
        });
        let (namespace, globals, tracker) =
            parts.map_err(|message| SandboxError::Init { message })?;

        tracing::debug!(
            capabilities = namespace.len(),
            modules = ?namespace.modules(),
            "sandbox created"
        );

        Ok(Self {
            namespace,
            globals,
            tracker,
            output,
            settings,
            disposed: false,
            interp,
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// A mutable view of the live namespace and import allowlist.
    pub fn capabilities(&mut self) -> Capabilities<'_> {
        Capabilities { sandbox: self }
    }

    /// Audits, compiles and runs `source` to completion on this thread.
    ///
    /// Never panics on guest behaviour; every failure is reported in
    /// [`ExecOutcome::error`].
    pub fn execute(&mut self, source: &str) -> ExecOutcome {
        let start = Instant::now();
        let mut outcome = ExecOutcome::default();

        let prepared = PreparedCache::global().prepare(source);
        match prepared.verdict {
            Ok(()) => self.run(&prepared.source, &mut outcome),
            Err(e) => outcome.error = Some(e),
        }

        if self.output.is_limit_exceeded() {
            outcome.error = Some(GuestError::OutputLimitExceeded {
                limit_bytes: self.output.max_bytes(),
            });
        }
        if let Some(error) = outcome.error.as_ref().filter(|e| e.is_capability_denial()) {
            tracing::debug!(%error, "guest stopped at the capability boundary");
        }
        let (stdout, stderr) = self.output.take();
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        outcome.duration_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        outcome
    }

    fn run(&self, source: &str, outcome: &mut ExecOutcome) {
        let globals = &self.globals;
        let namespace = &self.namespace;
        self.interp.enter(|vm| {
            let _ = take_result(vm, globals);

            let code = match vm.compile(source, Mode::Exec, "<guest>".to_owned()) {
                Ok(code) => code,
                Err(err) => {
                    outcome.error = Some(syntax_error(err));
                    return;
                }
            };
            if let Err(exc) = vm.run_code_obj(code, Scope::new(None, globals.clone())) {
                outcome.error = Some(namespace.classify(vm, &exc));
            }
            namespace.forget_signals();
            outcome.return_value = take_result(vm, globals);
            outcome.bindings = plain_bindings(vm, globals);
        });
    }

    /// `repr()` of the guest global `name`, if it is bound.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let globals = &self.globals;
        self.interp.enter(|vm| {
            let value = globals.get_item_opt(name, vm).ok().flatten()?;
            value.repr(vm).ok().map(|s| s.as_str().to_owned())
        })
    }

    /// Tears the sandbox down and reports what its finalizers did.
    pub fn dispose(mut self) -> TeardownReport {
        let report = self.teardown();
        tracing::info!(
            finalized = report.finalized,
            faults = report.faults.len(),
            "sandbox disposed"
        );
        report
    }

    fn teardown(&mut self) -> TeardownReport {
        self.disposed = true;
        let (finalized, faults) = self.interp.enter(|vm| {
            self.namespace.forget_signals();
            let namespace = &self.namespace;
            let result = self
                .tracker
                .finalize_all(vm, |exc| namespace.classify(vm, exc));
            self.namespace.forget_signals();
            clear_globals(vm, &self.globals);
            self.namespace.release(vm);
            self.tracker.release(vm);
            result
        });
        let (stdout, stderr) = self.output.take();
        TeardownReport {
            finalized,
            faults,
            stdout,
            stderr,
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let report = self.teardown();
        tracing::warn!(
            finalized = report.finalized,
            faults = report.faults.len(),
            "sandbox dropped without dispose"
        );
    }
}

/// Mutable view of a sandbox's namespace, from [`Sandbox::capabilities`].
pub struct Capabilities<'a> {
    sandbox: &'a mut Sandbox,
}

impl Capabilities<'_> {
    /// Every granted name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.sandbox.namespace.names()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sandbox.namespace.contains(name)
    }

    pub fn len(&self) -> usize {
        self.sandbox.namespace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revokes `name`. Guest code that already holds a reference to it,
    /// directly or through a module, loses access too. Returns `false` if
    /// the name was not granted.
    pub fn remove(&mut self, name: &str) -> bool {
        let Sandbox {
            interp, namespace, ..
        } = &mut *self.sandbox;
        let removed = interp.enter(|vm| match namespace.remove(vm, name) {
            Ok(removed) => removed,
            Err(exc) => {
                tracing::warn!(%name, error = %exception_message(vm, &exc), "revocation did not complete");
                true
            }
        });
        if removed {
            tracing::debug!(%name, "capability revoked");
        }
        removed
    }

    /// Restores a capability the host has. Fails with
    /// [`SandboxError::UnknownCapability`] for names the host never had.
    pub fn grant(&mut self, name: &str) -> Result<(), SandboxError> {
        let Sandbox {
            interp, namespace, ..
        } = &mut *self.sandbox;
        let granted = interp
            .enter(|vm| {
                namespace
                    .grant(vm, name)
                    .map_err(|exc| exception_message(vm, &exc))
            })
            .map_err(|message| SandboxError::Vm { message })?;
        if !granted {
            return Err(SandboxError::UnknownCapability {
                name: name.to_owned(),
            });
        }
        tracing::debug!(%name, "capability granted");
        Ok(())
    }

    /// The import allowlist, sorted.
    pub fn modules(&self) -> Vec<String> {
        self.sandbox.namespace.modules()
    }

    pub fn allow_module(&mut self, name: &str) -> bool {
        let Sandbox {
            interp, namespace, ..
        } = &mut *self.sandbox;
        let added = interp.enter(|vm| namespace.allow_module(vm, name));
        if added {
            tracing::debug!(module = %name, "module allowed");
        }
        added
    }

    /// Removes `name` from the allowlist. Views of it that were already
    /// imported are emptied.
    pub fn deny_module(&mut self, name: &str) -> bool {
        let Sandbox {
            interp, namespace, ..
        } = &mut *self.sandbox;
        let denied = interp.enter(|vm| match namespace.deny_module(vm, name) {
            Ok(denied) => denied,
            Err(exc) => {
                tracing::warn!(module = %name, error = %exception_message(vm, &exc), "module denial did not complete");
                true
            }
        });
        if denied {
            tracing::debug!(module = %name, "module denied");
        }
        denied
    }
}

/// Removes and returns `repr(__result__)`; `None` when unbound or `None`.
fn take_result(vm: &VirtualMachine, globals: &PyDictRef) -> Option<String> {
    let value = globals.get_item_opt(RESULT_NAME, vm).ok().flatten()?;
    let _ = globals.del_item(RESULT_NAME, vm);
    if vm.is_none(&value) {
        return None;
    }
    value.repr(vm).ok().map(|s| s.as_str().to_owned())
}

fn is_plain_data(vm: &VirtualMachine, value: &PyObject) -> bool {
    let types = &vm.ctx.types;
    let class = value.class();
    [
        types.none_type,
        types.bool_type,
        types.int_type,
        types.float_type,
        types.complex_type,
        types.str_type,
        types.bytes_type,
        types.list_type,
        types.tuple_type,
        types.dict_type,
        types.set_type,
        types.frozenset_type,
    ]
    .iter()
    .any(|t| class.is(*t))
}

/// `repr()` of every public global holding plain data.
fn plain_bindings(vm: &VirtualMachine, globals: &PyDictRef) -> BTreeMap<String, String> {
    let mut bindings = BTreeMap::new();
    let Ok(names) = string_keys(vm, globals.as_object()) else {
        return bindings;
    };
    for name in names.into_iter().filter(|n| !n.starts_with('_')) {
        let Ok(Some(value)) = globals.get_item_opt(name.as_str(), vm) else {
            continue;
        };
        if !is_plain_data(vm, &value) {
            continue;
        }
        if let Ok(repr) = value.repr(vm) {
            bindings.insert(name, repr.as_str().to_owned());
        }
    }
    bindings
}

/// Unbinds guest globals newest first; untracked finalizers run here.
fn clear_globals(vm: &VirtualMachine, globals: &PyDictRef) {
    let Ok(names) = string_keys(vm, globals.as_object()) else {
        let _ = vm.call_method(globals.as_object(), "clear", ());
        return;
    };
    for name in names.iter().rev() {
        let _ = globals.del_item(name.as_str(), vm);
    }
    let _ = vm.call_method(globals.as_object(), "clear", ());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lookup;

    fn sandbox() -> Sandbox {
        Sandbox::new().expect("sandbox")
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn state_persists_between_calls() {
        let mut sb = sandbox();
        assert!(sb.execute("x = 20").is_ok());
        let outcome = sb.execute("x + 22");
        assert_eq!(outcome.return_value.as_deref(), Some("42"));
        assert_eq!(sb.lookup("x").as_deref(), Some("20"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn stdout_is_captured_per_call() {
        let mut sb = sandbox();
        assert_eq!(sb.execute("print('one')").stdout, "one\n");
        assert_eq!(sb.execute("print('two')").stdout, "two\n");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn bindings_hold_plain_data_only() {
        let mut sb = sandbox();
        let outcome = sb.execute("n = 3\ns = 'hi'\n_hidden = 1\ndef f(): pass\n");
        assert_eq!(outcome.binding("n"), Some("3"));
        assert_eq!(outcome.binding("s"), Some("'hi'"));
        assert_eq!(outcome.binding("_hidden"), None);
        assert_eq!(outcome.binding("f"), None);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn removed_capability_is_unreachable_by_name() {
        let mut sb = sandbox();
        assert!(sb.capabilities().remove("len"));
        assert!(!sb.capabilities().contains("len"));
        assert_eq!(
            sb.execute("len([1])").error,
            Some(GuestError::CapabilityUnreachable {
                name: "len".to_string(),
                lookup: Lookup::Name,
            })
        );
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn captured_reference_follows_revocation_and_grant() {
        let mut sb = sandbox();
        assert!(sb.execute("L = len").is_ok());
        sb.capabilities().remove("len");
        assert!(matches!(
            sb.execute("L([1, 2])").error,
            Some(GuestError::CapabilityUnreachable { .. })
        ));
        sb.capabilities().grant("len").expect("grant");
        assert_eq!(sb.execute("L([1, 2])").return_value.as_deref(), Some("2"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn grant_of_unknown_name_fails() {
        let mut sb = sandbox();
        assert!(matches!(
            sb.capabilities().grant("no_such_builtin"),
            Err(SandboxError::UnknownCapability { .. })
        ));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn eval_is_not_granted_by_default_but_can_be() {
        let mut sb = sandbox();
        assert!(!sb.capabilities().contains("eval"));
        assert!(matches!(
            sb.execute("eval('1')").error,
            Some(GuestError::CapabilityUnreachable { .. })
        ));
        sb.capabilities().grant("eval").expect("grant");
        assert!(sb.capabilities().contains("eval"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn dispose_reports_finalizer_output() {
        let mut sb = sandbox();
        sb.execute("class A:\n    def __del__(self):\n        print('bye')\na = A()\n");
        let report = sb.dispose();
        assert_eq!(report.finalized, 1);
        assert!(report.faults.is_empty());
        assert_eq!(report.stdout, "bye\n");
    }
}
