//! Deferred finalization of guest objects.
//!
//! Guest classes are created through a replacement `__build_class__`. When a
//! class defines `__del__` in its own body:
//! - its `__init__` is wrapped so every initialised instance is remembered by
//!   weak reference, in creation order;
//! - its `__del__` is wrapped so it becomes a no-op once the sandbox retires
//!   its finalizers.
//!
//! At teardown the still-alive instances are finalized explicitly, newest
//! first, while the capability namespace is intact. Instances that died
//! earlier were finalized by reference counting and are skipped.

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDictRef},
    compiler::Mode,
    scope::Scope,
    AsObject, PyObjectRef, PyResult, VirtualMachine,
};

use crate::types::{FinalizerFault, GuestError};
use crate::vm::{collect_iter, type_name};

/// Runs in its own globals before the namespace is pruned, so every builtin
/// it needs is bound once up front.
const TRACKER_SOURCE: &str = r#"
import _weakref

_type = type
_id = id
_len = len
_isinstance = isinstance
_reversed = reversed
_Exception = Exception
_object_init = object.__init__
_build_class = __build_class__

_live = []
_seen = {}
_compact_at = 256
_retired = False


def _remember(obj):
    global _compact_at
    key = _id(obj)
    ref = _seen.get(key)
    if ref is not None and ref() is obj:
        return
    try:
        ref = _weakref.ref(obj)
    except _Exception:
        ref = lambda obj=obj: obj
    _seen[key] = ref
    _live.append(ref)
    if _len(_live) >= _compact_at:
        _live[:] = [r for r in _live if r() is not None]
        _seen.clear()
        for r in _live:
            _seen[_id(r())] = r
        _compact_at = _len(_live) * 2 + 256


def _track(cls):
    init = cls.__init__
    fin = cls.__dict__['__del__']

    def __init__(self, *args, **kwargs):
        _remember(self)
        if init is _object_init:
            init(self)
        else:
            init(self, *args, **kwargs)

    def __del__(self):
        if not _retired:
            fin(self)

    cls.__init__ = __init__
    cls.__del__ = __del__


def build_class(func, name, *bases, **kwargs):
    cls = _build_class(func, name, *bases, **kwargs)
    if _isinstance(cls, _type) and '__del__' in cls.__dict__:
        _track(cls)
    return cls


def live():
    out = []
    for ref in _reversed(_live):
        obj = ref()
        if obj is not None:
            out.append(obj)
    return out


def retire():
    global _retired
    _retired = True
    _live.clear()
    _seen.clear()
"#;

pub(crate) struct Tracker {
    scope: PyDictRef,
}

impl Tracker {
    /// Runs the tracker module and returns it with the `__build_class__`
    /// replacement to install in the namespace.
    pub(crate) fn install(vm: &VirtualMachine) -> PyResult<(Self, PyObjectRef)> {
        let code = vm
            .compile(TRACKER_SOURCE, Mode::Exec, "<pyjail.finalizers>".to_owned())
            .map_err(|e| vm.new_runtime_error(format!("finalizer tracker: {e}")))?;
        let scope = vm.ctx.new_dict();
        scope.set_item("__name__", vm.ctx.new_str("pyjail.finalizers").into(), vm)?;
        vm.run_code_obj(code, Scope::new(None, scope.clone()))?;
        let build_class = scope.get_item("build_class", vm)?;
        Ok((Self { scope }, build_class))
    }

    /// Finalizes every live tracked instance, newest first, then retires all
    /// tracked finalizers. Returns how many ran and the ones that raised,
    /// each mapped through `classify`.
    pub(crate) fn finalize_all<C>(&self, vm: &VirtualMachine, classify: C) -> (usize, Vec<FinalizerFault>)
    where
        C: Fn(&PyBaseExceptionRef) -> GuestError,
    {
        // Holding strong references for the whole pass keeps a finalizer from
        // dropping the last reference to an instance not yet finalized.
        let objects = match self.live(vm) {
            Ok(objects) => objects,
            Err(exc) => {
                tracing::warn!(error = %classify(&exc), "could not list live finalizable objects");
                Vec::new()
            }
        };

        let mut faults = Vec::new();
        for obj in &objects {
            if let Err(exc) = vm.call_method(obj, "__del__", ()) {
                let fault = FinalizerFault {
                    type_name: type_name(vm, obj),
                    error: classify(&exc),
                };
                tracing::warn!(type_name = %fault.type_name, error = %fault.error, "finalizer raised during teardown");
                faults.push(fault);
            }
        }

        if let Err(exc) = self
            .scope
            .get_item("retire", vm)
            .and_then(|retire| retire.call((), vm))
        {
            tracing::warn!(error = %classify(&exc), "could not retire finalizers");
        }
        (objects.len(), faults)
    }

    fn live(&self, vm: &VirtualMachine) -> PyResult<Vec<PyObjectRef>> {
        let list = self.scope.get_item("live", vm)?.call((), vm)?;
        collect_iter(vm, &list)
    }

    /// Drops the tracker's references. Wrapped `__del__` methods of objects
    /// that outlive this (reference cycles) still see `_retired`.
    pub(crate) fn release(&self, vm: &VirtualMachine) {
        let _ = vm.call_method(self.scope.as_object(), "clear", ());
        let _ = self
            .scope
            .set_item("_retired", vm.ctx.new_bool(true).into(), vm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{build_interpreter, classify_exception};

    fn run(vm: &VirtualMachine, build_class: &PyObjectRef, source: &str) -> PyDictRef {
        let globals = vm.ctx.new_dict();
        globals
            .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)
            .expect("set __name__");
        vm.builtins
            .set_attr("__build_class__", build_class.clone(), vm)
            .expect("install build_class");
        let code = vm
            .compile(source, Mode::Exec, "<test>".to_owned())
            .expect("compiles");
        vm.run_code_obj(code, Scope::new(None, globals.clone()))
            .expect("runs");
        globals
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn finalizers_run_newest_first() {
        let interp = build_interpreter();
        interp.enter(|vm| {
            let (tracker, build_class) = Tracker::install(vm).expect("install");
            let globals = run(
                vm,
                &build_class,
                "order = []\n\
                 class R:\n    def __init__(self, n):\n        self.n = n\n    def __del__(self):\n        order.append(self.n)\n\
                 a = R(1)\nb = R(2)\nc = R(3)\n",
            );
            let (count, faults) = tracker.finalize_all(vm, |exc| classify_exception(vm, exc));
            assert_eq!(count, 3);
            assert!(faults.is_empty());
            let order = globals.get_item("order", vm).expect("order");
            assert_eq!(order.repr(vm).expect("repr").as_str(), "[3, 2, 1]");
        });
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn retired_finalizers_do_not_run_again() {
        let interp = build_interpreter();
        interp.enter(|vm| {
            let (tracker, build_class) = Tracker::install(vm).expect("install");
            let globals = run(
                vm,
                &build_class,
                "count = [0]\n\
                 class R:\n    def __del__(self):\n        count[0] += 1\n\
                 r = R()\n",
            );
            tracker.finalize_all(vm, |exc| classify_exception(vm, exc));
            globals.del_item("r", vm).expect("drop instance");
            let count = globals.get_item("count", vm).expect("count");
            assert_eq!(count.repr(vm).expect("repr").as_str(), "[1]");
        });
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn dead_instances_are_skipped_and_faults_collected() {
        let interp = build_interpreter();
        interp.enter(|vm| {
            let (tracker, build_class) = Tracker::install(vm).expect("install");
            run(
                vm,
                &build_class,
                "class Gone:\n    def __del__(self):\n        pass\n\
                 Gone()\n\
                 class Bad:\n    def __del__(self):\n        raise ValueError('boom')\n\
                 bad = Bad()\n",
            );
            let (count, faults) = tracker.finalize_all(vm, |exc| classify_exception(vm, exc));
            assert_eq!(count, 1);
            assert_eq!(faults.len(), 1);
            assert_eq!(faults[0].type_name, "Bad");
        });
    }
}
