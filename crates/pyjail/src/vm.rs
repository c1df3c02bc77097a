//! RustPython plumbing shared by the sandbox modules.
//!
//! - interpreter construction (native stdlib modules registered, nothing read
//!   from the host filesystem);
//! - `sys.stdout` / `sys.stderr` replacement writing into an [`OutputBuffer`];
//! - mapping of guest exceptions onto [`GuestError`];
//! - small helpers for iterating and inspecting Python objects.
//!
//! No `unsafe` code; only the public RustPython API is used.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use rustpython_vm::{
    builtins::PyBaseExceptionRef,
    function::FuncArgs,
    AsObject, Interpreter, PyObject, PyObjectRef, PyResult, VirtualMachine,
};

use crate::output::{OutputBuffer, Stream};
use crate::types::{GuestError, Lookup};

/// A fresh interpreter with the Rust-native stdlib modules registered.
pub(crate) fn build_interpreter() -> Interpreter {
    let settings = rustpython_vm::Settings::default();
    Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
    })
}

/// `new_function` wants a `'static` name. Builtin names form a small fixed
/// set, so each distinct one is leaked once and reused by every sandbox.
pub(crate) fn intern(name: &str) -> &'static str {
    static NAMES: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();
    let mut names = NAMES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = names.get(name) {
        return existing;
    }
    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    names.insert(leaked);
    leaked
}

/// Replaces `sys.stdout` and `sys.stderr` with writers feeding `output`.
pub(crate) fn install_output_capture(vm: &VirtualMachine, output: &OutputBuffer) -> PyResult<()> {
    let stdout = build_writer(vm, output.clone(), Stream::Stdout)?;
    let stderr = build_writer(vm, output.clone(), Stream::Stderr)?;
    vm.sys_module.set_attr("stdout", stdout, vm)?;
    vm.sys_module.set_attr("stderr", stderr, vm)?;
    Ok(())
}

/// A module used as a plain namespace with `write`, `flush`, `closed` and
/// `encoding`, which is all `print` and the unraisable hook need.
fn build_writer(vm: &VirtualMachine, output: OutputBuffer, stream: Stream) -> PyResult<PyObjectRef> {
    let write = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data = match args.args.first() {
                Some(obj) => obj.str(vm)?.as_str().to_owned(),
                None => String::new(),
            };
            match output.write(stream, data.as_bytes()) {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(e) => Err(vm.new_exception_msg(
                    vm.ctx.exceptions.runtime_error.to_owned(),
                    e.to_string(),
                )),
            }
        },
    );
    let flush = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let name = match stream {
        Stream::Stdout => "<stdout>",
        Stream::Stderr => "<stderr>",
    };
    let ns = vm.new_module(name, vm.ctx.new_dict(), None);
    ns.set_attr("write", write, vm)?;
    ns.set_attr("flush", flush, vm)?;
    ns.set_attr("closed", vm.ctx.new_bool(false), vm)?;
    ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm)?;
    Ok(ns.into())
}

/// Converts a compile error into [`GuestError::SyntaxError`].
pub(crate) fn syntax_error(err: rustpython_vm::compiler::CompileError) -> GuestError {
    let (row, col) = err.python_location();
    GuestError::SyntaxError {
        message: err.to_string(),
        line: row as u32,
        col: col as u32,
    }
}

/// Maps a guest exception onto the failure kinds the host distinguishes.
///
/// Denials raised by the boundary itself are recognised by identity before
/// this runs (see `Namespace::classify`); message text never produces
/// `ImportDenied`.
///
/// - `AttributeError` raised by a module object -> `CapabilityUnreachable { lookup: Attribute }`
/// - `NameError` (but not `UnboundLocalError`) -> `CapabilityUnreachable { lookup: Name }`
/// - anything else -> `RuntimeError` with a rendered traceback
pub(crate) fn classify_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> GuestError {
    let message = exception_message(vm, exc);
    let obj = exc.as_object();
    let exceptions = &vm.ctx.exceptions;

    if obj.fast_isinstance(exceptions.attribute_error) {
        if message.starts_with("module ") {
            if let Some(name) = last_quoted(&message) {
                return unreachable_attribute(name);
            }
        }
    }

    if obj.fast_isinstance(exceptions.name_error)
        && !obj.fast_isinstance(exceptions.unbound_local_error)
    {
        if let Some(name) = first_quoted(&message) {
            return GuestError::CapabilityUnreachable {
                name: name.to_owned(),
                lookup: Lookup::Name,
            };
        }
    }

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, exc);
    GuestError::RuntimeError {
        message: format!("{}: {message}", type_name(vm, obj)),
        traceback,
    }
}

fn unreachable_attribute(name: &str) -> GuestError {
    GuestError::CapabilityUnreachable {
        name: name.to_owned(),
        lookup: Lookup::Attribute,
    }
}

/// `str(exc)`, or a placeholder when the guest's `__str__` itself raises.
pub(crate) fn exception_message(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    match exc.as_object().str(vm) {
        Ok(s) => s.as_str().to_owned(),
        Err(_) => format!("<unprintable {} object>", type_name(vm, exc.as_object())),
    }
}

/// `type(obj).__name__`, or `"object"` if even that fails.
pub(crate) fn type_name(vm: &VirtualMachine, obj: &PyObject) -> String {
    obj.class()
        .as_object()
        .get_attr("__name__", vm)
        .and_then(|n| n.str(vm))
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "object".to_owned())
}

/// Drains a Python iterable into a `Vec`, propagating anything but `StopIteration`.
pub(crate) fn collect_iter(vm: &VirtualMachine, iterable: &PyObject) -> PyResult<Vec<PyObjectRef>> {
    let iter = vm.call_method(iterable, "__iter__", ())?;
    let mut items = Vec::new();
    loop {
        match vm.call_method(&iter, "__next__", ()) {
            Ok(item) => items.push(item),
            Err(exc) if exc.as_object().fast_isinstance(vm.ctx.exceptions.stop_iteration) => {
                break
            }
            Err(exc) => return Err(exc),
        }
    }
    Ok(items)
}

/// String keys of a dict-like object, in iteration (insertion) order.
/// Non-string keys are skipped.
pub(crate) fn string_keys(vm: &VirtualMachine, mapping: &PyObject) -> PyResult<Vec<String>> {
    Ok(collect_iter(vm, mapping)?
        .into_iter()
        .filter(|k| k.fast_isinstance(vm.ctx.types.str_type))
        .filter_map(|k| k.str(vm).ok().map(|s| s.as_str().to_owned()))
        .collect())
}

fn first_quoted(message: &str) -> Option<&str> {
    let start = message.find('\'')? + 1;
    let len = message[start..].find('\'')?;
    Some(&message[start..start + len])
}

fn last_quoted(message: &str) -> Option<&str> {
    let end = message.rfind('\'')?;
    let start = message[..end].rfind('\'')? + 1;
    Some(&message[start..end])
}
