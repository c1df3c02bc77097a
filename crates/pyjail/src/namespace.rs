//! The live capability namespace of one sandbox.
//!
//! RustPython frames resolve builtins through the interpreter-wide `builtins`
//! dict, so each sandbox owns an interpreter and that dict *is* its namespace.
//! At install time the dict is emptied and refilled with the granted names.
//!
//! Three kinds of binding end up in the dict:
//! - builtin functions are replaced by *forwarders*: native functions that
//!   look the real object up in the [`Gate`] on every call. Revoking a name
//!   therefore disables every reference the guest already holds to it;
//! - types, constants and exception classes are installed as-is;
//! - `__import__` and `__build_class__` are the gate hook and the finalizer
//!   tracker.
//!
//! Guest imports of allowlisted modules return *views*: fresh module objects
//! holding a filtered copy of the real module's public attributes. Views are
//! cached, so a module is imported once per sandbox and shared by every
//! importer.
//!
//! Denials raised here are remembered by identity, so the host never has to
//! trust exception text the guest could have written itself.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDict, PyDictRef, PyStr},
    function::FuncArgs,
    AsObject, PyObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::audit::is_denied_attribute;
use crate::modules::{build_allowed_set, check_module_allowed};
use crate::types::{GuestError, Lookup, SandboxSettings};
use crate::vm::{classify_exception, collect_iter, intern, string_keys};

/// Names every namespace carries regardless of settings; the interpreter
/// needs them to run module and class bodies.
pub(crate) const REQUIRED_NAMES: &[&str] = &[
    "__name__",
    "__doc__",
    "__debug__",
    "__build_class__",
    "__import__",
    "Ellipsis",
    "NotImplemented",
];

/// Builtins whose second argument is an attribute name.
const GUARDED_BUILTINS: &[&str] = &["getattr", "setattr", "delattr", "hasattr"];

/// How many recent denials are remembered for classification.
const SIGNAL_HISTORY: usize = 64;

/// State shared between the host and the native functions installed in the VM.
pub(crate) struct Gate {
    /// Every builtin the host interpreter had at creation, by name.
    host: HashMap<String, PyObjectRef>,
    granted: BTreeSet<String>,
    /// What goes into the builtins dict when a name is granted; forwarders
    /// are built on first grant and reused afterwards.
    installed: HashMap<String, PyObjectRef>,
    allowed_modules: BTreeSet<String>,
    /// Issued module views, by module name.
    views: BTreeMap<String, PyObjectRef>,
    /// Exceptions raised by the boundary, newest last.
    signals: VecDeque<(PyBaseExceptionRef, GuestError)>,
}

impl Gate {
    /// The real object behind a granted name.
    fn resolve(&self, name: &str) -> Option<PyObjectRef> {
        if self.granted.contains(name) {
            self.host.get(name).cloned()
        } else {
            None
        }
    }

    /// How host builtins found inside a real module appear in a view:
    /// `None` withholds the object, `Some` exposes the namespace binding
    /// (forwarder or hook) in its place. Unlisted objects pass through.
    fn substitutions(&self) -> Vec<(PyObjectRef, Option<PyObjectRef>)> {
        self.host
            .iter()
            .filter_map(|(name, obj)| {
                if !self.granted.contains(name.as_str()) {
                    return Some((obj.clone(), None));
                }
                match self.installed.get(name) {
                    Some(binding) if !binding.is(obj) => Some((obj.clone(), Some(binding.clone()))),
                    _ => None,
                }
            })
            .collect()
    }
}

pub(crate) type GateRef = Arc<Mutex<Gate>>;

// No gate method panics while holding the lock, but a guest-triggered Rust
// panic elsewhere must not wedge teardown.
pub(crate) fn lock(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Namespace {
    builtins: PyDictRef,
    gate: GateRef,
}

impl Namespace {
    /// Snapshots the host builtins, installs the import gate and prunes the
    /// namespace down to what `settings` grants.
    pub(crate) fn install(
        vm: &VirtualMachine,
        settings: &SandboxSettings,
        guest_globals: &PyDictRef,
        build_class: PyObjectRef,
    ) -> PyResult<Self> {
        let builtins = vm
            .builtins
            .as_object()
            .dict()
            .ok_or_else(|| vm.new_runtime_error("builtins module has no __dict__".to_owned()))?;

        let mut host = HashMap::new();
        for name in string_keys(vm, builtins.as_object())? {
            if let Some(value) = builtins.get_item_opt(name.as_str(), vm)? {
                host.insert(name, value);
            }
        }

        let original_import = host
            .get("__import__")
            .cloned()
            .ok_or_else(|| vm.new_runtime_error("host has no __import__".to_owned()))?;

        // Loaded while the namespace is still complete; later guest imports
        // of these are served from `sys.modules`.
        let allowed_modules = build_allowed_set(&settings.allowed_modules);
        for module in &allowed_modules {
            preload(vm, &original_import, module);
        }

        let mut granted: BTreeSet<String> = REQUIRED_NAMES.iter().map(|s| s.to_string()).collect();
        for (name, value) in &host {
            if is_exception_type(vm, value) {
                granted.insert(name.clone());
            }
        }
        for name in &settings.capabilities {
            if host.contains_key(name) {
                granted.insert(name.clone());
            } else {
                tracing::debug!(%name, "requested capability does not exist on the host");
            }
        }
        granted.retain(|name| host.contains_key(name));

        let gate: GateRef = Arc::new(Mutex::new(Gate {
            host,
            granted,
            installed: HashMap::new(),
            allowed_modules,
            views: BTreeMap::new(),
            signals: VecDeque::new(),
        }));
        let hook = import_hook(vm, gate.clone(), original_import, guest_globals.clone());
        {
            let mut gate = lock(&gate);
            gate.installed.insert("__import__".to_owned(), hook);
            gate.installed.insert("__build_class__".to_owned(), build_class);
        }

        let mut namespace = Self { builtins, gate };

        vm.call_method(namespace.builtins.as_object(), "clear", ())?;
        let names: Vec<String> = lock(&namespace.gate).granted.iter().cloned().collect();
        for name in &names {
            if let Some(binding) = namespace.binding_for(vm, name) {
                namespace.builtins.set_item(name.as_str(), binding, vm)?;
            }
        }
        Ok(namespace)
    }

    fn binding_for(&mut self, vm: &VirtualMachine, name: &str) -> Option<PyObjectRef> {
        let real = {
            let gate = lock(&self.gate);
            if let Some(binding) = gate.installed.get(name) {
                return Some(binding.clone());
            }
            gate.host.get(name).cloned()?
        };
        let binding = if real.fast_isinstance(vm.ctx.types.builtin_function_or_method_type) {
            forwarder(vm, name, self.gate.clone())
        } else {
            real
        };
        lock(&self.gate)
            .installed
            .insert(name.to_owned(), binding.clone());
        Some(binding)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        lock(&self.gate).granted.iter().cloned().collect()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        lock(&self.gate).granted.contains(name)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.gate).granted.len()
    }

    /// Revokes `name`. Returns `false` if it was not granted.
    pub(crate) fn remove(&mut self, vm: &VirtualMachine, name: &str) -> PyResult<bool> {
        let (targets, views) = {
            let mut gate = lock(&self.gate);
            if !gate.granted.remove(name) {
                return Ok(false);
            }
            let targets: Vec<PyObjectRef> = gate
                .host
                .get(name)
                .into_iter()
                .chain(gate.installed.get(name))
                .cloned()
                .collect();
            (targets, gate.views.values().cloned().collect::<Vec<_>>())
        };
        if self.builtins.get_item_opt(name, vm)?.is_some() {
            self.builtins.del_item(name, vm)?;
        }
        for view in &views {
            scrub(vm, view, &targets)?;
        }
        Ok(true)
    }

    /// Restores `name` from the host snapshot. Returns `false` if the host
    /// never had it.
    pub(crate) fn grant(&mut self, vm: &VirtualMachine, name: &str) -> PyResult<bool> {
        let Some(binding) = self.binding_for(vm, name) else {
            return Ok(false);
        };
        lock(&self.gate).granted.insert(name.to_owned());
        self.builtins.set_item(name, binding, vm)?;
        Ok(true)
    }

    pub(crate) fn modules(&self) -> Vec<String> {
        lock(&self.gate).allowed_modules.iter().cloned().collect()
    }

    pub(crate) fn allow_module(&mut self, vm: &VirtualMachine, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let (added, original_import) = {
            let mut gate = lock(&self.gate);
            (
                gate.allowed_modules.insert(name.to_owned()),
                gate.host.get("__import__").cloned(),
            )
        };
        if let (true, Some(original_import)) = (added, original_import) {
            preload(vm, &original_import, name);
        }
        added
    }

    /// Removes `name` from the allowlist and empties every cached view that
    /// is no longer admitted, so holders of the view lose its attributes.
    pub(crate) fn deny_module(&mut self, vm: &VirtualMachine, name: &str) -> PyResult<bool> {
        let stale = {
            let mut gate = lock(&self.gate);
            if !gate.allowed_modules.remove(name) {
                return Ok(false);
            }
            let still_allowed = gate.allowed_modules.clone();
            let stale: Vec<(String, PyObjectRef)> = gate
                .views
                .iter()
                .filter(|(module, _)| check_module_allowed(module, &still_allowed).is_err())
                .map(|(module, view)| (module.clone(), view.clone()))
                .collect();
            for (module, _) in &stale {
                gate.views.remove(module);
            }
            stale
        };
        for (module, view) in stale {
            if let Some(dict) = view.dict() {
                vm.call_method(dict.as_object(), "clear", ())?;
                dict.set_item("__name__", vm.ctx.new_str(module).into(), vm)?;
            }
        }
        Ok(true)
    }

    /// Classifies `exc`. Only exceptions this namespace raised itself are
    /// reported as boundary denials on the strength of their origin.
    pub(crate) fn classify(&self, vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> GuestError {
        let signalled = lock(&self.gate)
            .signals
            .iter()
            .rev()
            .find(|(raised, _)| raised.as_object().is(exc.as_object()))
            .map(|(_, error)| error.clone());
        signalled.unwrap_or_else(|| classify_exception(vm, exc))
    }

    /// Releases remembered denials. Their tracebacks may keep guest objects
    /// alive, so they are dropped outside the gate lock.
    pub(crate) fn forget_signals(&self) {
        let stale = std::mem::take(&mut lock(&self.gate).signals);
        drop(stale);
    }

    /// Drops every object reference held by the gate and the namespace.
    /// The native functions in the VM keep the (now empty) gate alive until
    /// the interpreter itself is dropped.
    pub(crate) fn release(&mut self, vm: &VirtualMachine) {
        let (views, signals) = {
            let mut gate = lock(&self.gate);
            gate.host.clear();
            gate.granted.clear();
            gate.installed.clear();
            (
                std::mem::take(&mut gate.views),
                std::mem::take(&mut gate.signals),
            )
        };
        drop(signals);
        for view in views.values() {
            if let Some(dict) = view.dict() {
                let _ = vm.call_method(dict.as_object(), "clear", ());
            }
        }
        let _ = vm.call_method(self.builtins.as_object(), "clear", ());
    }
}

fn is_exception_type(vm: &VirtualMachine, obj: &PyObject) -> bool {
    obj.fast_isinstance(vm.ctx.types.type_type)
        && obj
            .is_subclass(vm.ctx.exceptions.base_exception_type.as_object(), vm)
            .unwrap_or(false)
}

/// A native function that calls the real builtin `name` if it is still
/// granted, and raises `NameError` otherwise.
fn forwarder(vm: &VirtualMachine, name: &str, gate: GateRef) -> PyObjectRef {
    let name = intern(name);
    let guarded = GUARDED_BUILTINS.contains(&name);
    vm.new_function(
        name,
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            if guarded {
                reject_denied_attribute(&args, vm, &gate)?;
            }
            let target = lock(&gate).resolve(name);
            match target {
                Some(target) => target.call(args, vm),
                None => {
                    let exc = vm.new_exception_msg(
                        vm.ctx.exceptions.name_error.to_owned(),
                        format!("name '{name}' is not defined"),
                    );
                    Err(signal(
                        &gate,
                        exc,
                        GuestError::CapabilityUnreachable {
                            name: name.to_owned(),
                            lookup: Lookup::Name,
                        },
                    ))
                }
            }
        },
    )
    .into()
}

/// Remembers `exc` as a boundary denial and hands it back for raising.
fn signal(gate: &Mutex<Gate>, exc: PyBaseExceptionRef, error: GuestError) -> PyBaseExceptionRef {
    let evicted = {
        let mut gate = lock(gate);
        let evicted = if gate.signals.len() >= SIGNAL_HISTORY {
            gate.signals.pop_front()
        } else {
            None
        };
        gate.signals.push_back((exc.clone(), error));
        evicted
    };
    drop(evicted);
    exc
}

fn reject_denied_attribute(args: &FuncArgs, vm: &VirtualMachine, gate: &GateRef) -> PyResult<()> {
    let Some(attr) = args.args.get(1) else {
        return Ok(());
    };
    // The string payload, not `str(attr)`: a subclass can override `__str__`
    // while the lookup still uses the underlying value.
    let Some(attr) = attr.payload_if_subclass::<PyStr>(vm) else {
        return Ok(());
    };
    let name = attr.as_str();
    if !is_denied_attribute(name) {
        return Ok(());
    }
    let exc = vm.new_attribute_error(format!("access to attribute '{name}' is not allowed"));
    Err(signal(
        gate,
        exc,
        GuestError::CapabilityUnreachable {
            name: name.to_owned(),
            lookup: Lookup::Attribute,
        },
    ))
}

/// The replacement `__import__`.
///
/// Imports issued from guest frames (globals identical to the guest
/// `__main__` dict) or with no frame at all are checked against the
/// allowlist and answered with module views. Imports issued by library code
/// running inside the VM go straight to the original importer.
fn import_hook(
    vm: &VirtualMachine,
    gate: GateRef,
    original_import: PyObjectRef,
    guest_globals: PyDictRef,
) -> PyObjectRef {
    vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let from_guest = vm
                .current_frame()
                .map_or(true, |frame| frame.globals.is(&guest_globals));
            if !from_guest {
                return original_import.call(args, vm);
            }

            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let level: i64 = args
                .args
                .get(4)
                .or_else(|| args.kwargs.get("level"))
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            let permitted = level == 0
                && check_module_allowed(&module_name, &lock(&gate).allowed_modules).is_ok();
            if !permitted {
                tracing::debug!(module = %module_name, level, "guest import denied");
                return Err(deny_import(vm, &gate, module_name));
            }

            let fromlist = fromlist_names(vm, &args)?;
            let module = match loaded_module(vm, &module_name, !fromlist.is_empty())? {
                Some(module) => module,
                None => original_import.call(args, vm)?,
            };
            let view = module_view(vm, &gate, &module)?;
            for item in fromlist.iter().filter(|item| item.as_str() != "*") {
                expose_from(vm, &gate, &original_import, &module, &view, item)?;
            }
            Ok(view)
        },
    )
    .into()
}

fn deny_import(vm: &VirtualMachine, gate: &GateRef, module_name: String) -> PyBaseExceptionRef {
    let exc = vm.new_import_error(
        format!("import of module '{module_name}' is not allowed"),
        vm.ctx.new_str(module_name.as_str()),
    );
    signal(gate, exc, GuestError::ImportDenied { module_name })
}

/// Makes `from <module> import <item>` find `item` on `view`, or raises the
/// denial explaining why it cannot: `ImportDenied` for a submodule outside
/// the allowlist, `CapabilityUnreachable` for anything else the view lacks.
fn expose_from(
    vm: &VirtualMachine,
    gate: &GateRef,
    original_import: &PyObject,
    module: &PyObject,
    view: &PyObject,
    item: &str,
) -> PyResult<()> {
    if dict_entry(vm, view, item)?.is_some() {
        return Ok(());
    }
    let parent = module_name(vm, module)?;
    let full = format!("{parent}.{item}");

    let submodule = match dict_entry(vm, module, item)?
        .filter(|value| value.fast_isinstance(vm.ctx.types.module_type))
    {
        Some(sub) => Some(sub),
        None => loaded_module(vm, &full, true)?,
    };
    let is_submodule = submodule.is_some();

    let admitted = admits(&full, &lock(gate).allowed_modules);
    if admitted {
        let submodule = match submodule {
            Some(sub) => Some(sub),
            // Not a submodule after all: fall through to "cannot import name".
            None => match original_import.call((vm.ctx.new_str(full.as_str()),), vm) {
                Ok(_) => loaded_module(vm, &full, true)?,
                Err(exc) if exc.fast_isinstance(vm.ctx.exceptions.import_error) => None,
                Err(exc) => return Err(exc),
            },
        };
        if let (Some(sub), Some(dict)) = (submodule, view.dict()) {
            let sub_view = module_view(vm, gate, &sub)?;
            dict.set_item(item, sub_view, vm)?;
            return Ok(());
        }
    }

    if is_submodule {
        tracing::debug!(module = %full, "guest import denied");
        return Err(deny_import(vm, gate, full));
    }
    let exc = vm.new_import_error(
        format!("cannot import name '{item}' from '{parent}'"),
        vm.ctx.new_str(parent.as_str()),
    );
    Err(signal(
        gate,
        exc,
        GuestError::CapabilityUnreachable {
            name: item.to_owned(),
            lookup: Lookup::Attribute,
        },
    ))
}

fn preload(vm: &VirtualMachine, original_import: &PyObject, module: &str) {
    if let Err(exc) = original_import.call((vm.ctx.new_str(module),), vm) {
        tracing::debug!(
            %module,
            error = %crate::vm::exception_message(vm, &exc),
            "allowlisted module could not be preloaded"
        );
    }
}

fn sys_modules(vm: &VirtualMachine) -> PyResult<Option<PyDictRef>> {
    Ok(vm
        .sys_module
        .get_attr("modules", vm)?
        .downcast::<PyDict>()
        .ok())
}

/// What `__import__(name, ...)` returns when `name` is already in
/// `sys.modules`: the module itself when `leaf`, its top-level package
/// otherwise. `None` means the importer has work to do.
fn loaded_module(vm: &VirtualMachine, name: &str, leaf: bool) -> PyResult<Option<PyObjectRef>> {
    let Some(modules) = sys_modules(vm)? else {
        return Ok(None);
    };
    let lookup = |key: &str| -> PyResult<Option<PyObjectRef>> {
        Ok(modules
            .get_item_opt(key, vm)?
            .filter(|module| !vm.is_none(module)))
    };

    let Some(found) = lookup(name)? else {
        return Ok(None);
    };
    if leaf {
        return Ok(Some(found));
    }
    let top = name.split('.').next().unwrap_or(name);
    lookup(top)
}

fn fromlist_names(vm: &VirtualMachine, args: &FuncArgs) -> PyResult<Vec<String>> {
    let Some(fromlist) = args
        .args
        .get(3)
        .or_else(|| args.kwargs.get("fromlist"))
        .filter(|f| !vm.is_none(f))
    else {
        return Ok(Vec::new());
    };
    collect_iter(vm, fromlist)?
        .iter()
        .map(|item| -> PyResult<String> { Ok(item.str(vm)?.as_str().to_owned()) })
        .collect()
}

/// `obj.__dict__[key]`, without going through attribute lookup.
fn dict_entry(vm: &VirtualMachine, obj: &PyObject, key: &str) -> PyResult<Option<PyObjectRef>> {
    match obj.dict() {
        Some(dict) => dict.get_item_opt(key, vm),
        None => Ok(None),
    }
}

fn module_name(vm: &VirtualMachine, module: &PyObject) -> PyResult<String> {
    Ok(module.get_attr("__name__", vm)?.str(vm)?.as_str().to_owned())
}

/// Returns the cached view of `module`, building it on first use.
///
/// A module that is not itself allowlisted (the parent of an allowlisted
/// submodule) gets a shell view holding only its admitted submodules.
fn module_view(vm: &VirtualMachine, gate: &GateRef, module: &PyObject) -> PyResult<PyObjectRef> {
    if !module.fast_isinstance(vm.ctx.types.module_type) {
        return Ok(module.to_owned());
    }
    let name = module_name(vm, module)?;

    let (allowed, substitutions) = {
        let gate = lock(gate);
        if let Some(view) = gate.views.get(&name) {
            return Ok(view.clone());
        }
        (gate.allowed_modules.clone(), gate.substitutions())
    };
    let full = check_module_allowed(&name, &allowed).is_ok();

    let dict = vm.ctx.new_dict();
    let view: PyObjectRef = vm.new_module(&name, dict.clone(), None).into();
    // Registered before the walk so that cyclic submodule references resolve
    // to this view.
    lock(gate).views.insert(name.clone(), view.clone());

    let Some(source) = module.dict() else {
        return Ok(view);
    };
    for attr in string_keys(vm, source.as_object())? {
        let Some(value) = source.get_item_opt(attr.as_str(), vm)? else {
            continue;
        };
        if value.fast_isinstance(vm.ctx.types.module_type) {
            let sub = module_name(vm, &value)?;
            if admits(&sub, &allowed) {
                dict.set_item(attr.as_str(), module_view(vm, gate, &value)?, vm)?;
            }
            continue;
        }
        if !full {
            continue;
        }
        if attr.starts_with("__") && attr != "__name__" && attr != "__doc__" {
            continue;
        }
        let exposed = match substitutions.iter().find(|(host, _)| host.is(&value)) {
            Some((_, None)) => continue,
            Some((_, Some(binding))) => binding.clone(),
            None => value,
        };
        dict.set_item(attr.as_str(), exposed, vm)?;
    }
    Ok(view)
}

/// True if `name` is allowlisted or is a package of an allowlisted module.
fn admits(name: &str, allowed: &BTreeSet<String>) -> bool {
    check_module_allowed(name, allowed).is_ok()
        || allowed
            .iter()
            .any(|m| m.len() > name.len() && m.starts_with(name) && m[name.len()..].starts_with('.'))
}

/// Deletes every attribute of `view` that is one of `targets`.
fn scrub(vm: &VirtualMachine, view: &PyObject, targets: &[PyObjectRef]) -> PyResult<()> {
    let Some(dict) = view.dict() else {
        return Ok(());
    };
    for attr in string_keys(vm, dict.as_object())? {
        let Some(value) = dict.get_item_opt(attr.as_str(), vm)? else {
            continue;
        };
        if targets.iter().any(|t| t.is(&value)) {
            dict.del_item(attr.as_str(), vm)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        build_allowed_set(names)
    }

    #[test]
    fn admits_packages_of_allowlisted_submodules() {
        let allowed = set(&["os.path", "math"]);
        assert!(admits("os", &allowed));
        assert!(admits("os.path", &allowed));
        assert!(admits("math", &allowed));
        assert!(!admits("o", &allowed));
        assert!(!admits("sys", &allowed));
    }

    #[test]
    fn required_names_cover_class_and_import_machinery() {
        assert!(REQUIRED_NAMES.contains(&"__build_class__"));
        assert!(REQUIRED_NAMES.contains(&"__import__"));
    }

    #[test]
    fn guarded_builtins_take_attribute_names() {
        for name in GUARDED_BUILTINS {
            assert!(name.ends_with("attr"), "{name}");
        }
    }
}
