//! `System.Action`: either a pure managed delegate or one backed by a
//! native closure.
//!
//! A native-backed action owns three things: its delegate handle in the
//! object table, the handle of the managed wrapper class in the
//! action-class table, and a slot in the action pointer pool holding the
//! boxed closure. The wrapper stores the slot index and calls
//! `ActionNativeInvoke` with it.
//!
//! A combined delegate dispatches through the managed side but pins every
//! native closure its operands reached, so `a += b` never frees the
//! closure of the `a` it replaces.

use crate::{
    BridgeContext, BridgeError, Handle, NULL_HANDLE, Result, current,
    system::{Delegate, Object},
};

/// What the action pool stores.
pub type ActionTarget = dyn Fn() -> Result<()>;

/// One native closure kept alive by a class-handle reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NativeBinding {
    class_handle: Handle,
    cpp_handle: i32,
}

pub struct Action {
    handle: Handle,
    /// Set when `handle` is exactly one native action.
    native: Option<NativeBinding>,
    pinned: Vec<NativeBinding>,
}

impl Action {
    /// Creates a managed `Action` that runs `target` natively when invoked.
    pub fn new(target: impl Fn() -> Result<()> + 'static) -> Result<Self> {
        let context = current()?;
        let target: Box<ActionTarget> = Box::new(target);
        let cpp_handle = context.actions.reserve(Box::into_raw(target));

        let mut class_handle = NULL_HANDLE;
        let handle = context.call(|context| {
            // SAFETY: table entries were validated at init, `class_handle`
            // outlives the call
            unsafe { (context.generated.action_new)(cpp_handle, &mut class_handle) }
        });
        let handle = match handle {
            Ok(handle) if handle != NULL_HANDLE && class_handle != NULL_HANDLE => handle,
            Ok(_) => {
                free_target(&context, cpp_handle);
                return Err(BridgeError::NullHandle("SystemActionConstructor"));
            }
            Err(error) => {
                free_target(&context, cpp_handle);
                return Err(error);
            }
        };

        context.objects.reference(handle);
        context.action_classes.reference(class_handle);
        log::debug!("native action {cpp_handle} bound to delegate {handle}, class {class_handle}");
        Ok(Self {
            handle,
            native: Some(NativeBinding {
                class_handle,
                cpp_handle,
            }),
            pinned: Vec::new(),
        })
    }

    /// Adopts a managed delegate handle, taking one reference. A handle
    /// that wraps a single live native action dispatches to it directly.
    pub fn acquire(handle: Handle) -> Self {
        let Some(context) = crate::try_current() else {
            return Self::unbound(handle);
        };
        context.objects.reference(handle);
        let native = match native_target(&context, handle) {
            Ok(native) => native,
            Err(error) => {
                log::warn!("cannot resolve the target of delegate {handle}: {error}");
                None
            }
        };
        if let Some(binding) = native {
            context.action_classes.reference(binding.class_handle);
        }
        Self {
            handle,
            native,
            pinned: Vec::new(),
        }
    }

    pub fn null() -> Self {
        Self::unbound(NULL_HANDLE)
    }

    fn unbound(handle: Handle) -> Self {
        Self {
            handle,
            native: None,
            pinned: Vec::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_null(&self) -> bool {
        self.handle == NULL_HANDLE
    }

    /// Index of the native closure, `0` unless this is one native action.
    pub fn cpp_handle(&self) -> i32 {
        self.native.map_or(0, |binding| binding.cpp_handle)
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Number of native closures this delegate keeps alive.
    pub fn native_targets(&self) -> usize {
        self.bindings().count()
    }

    fn bindings(&self) -> impl Iterator<Item = NativeBinding> + '_ {
        self.native.iter().chain(&self.pinned).copied()
    }

    /// Runs the delegate. A native-backed action calls its closure directly
    /// without crossing the boundary.
    pub fn invoke(&self) -> Result<()> {
        let context = current()?;
        if let Some(binding) = self.native {
            let target = context.actions.get(binding.cpp_handle);
            // SAFETY: the slot stays occupied while this action holds its
            // class handle
            return unsafe { (*target)() };
        }
        context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.action_invoke)(self.handle) }
        })
    }

    /// `a + b`: a new multicast delegate, both operands unchanged.
    pub fn combine(&self, other: &Action) -> Result<Action> {
        self.binary(other, |context, a, b| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.delegate_combine)(a, b) }
        })
    }

    /// `a - b`: `a` without the last occurrence of `b`'s invocation list.
    pub fn remove(&self, other: &Action) -> Result<Action> {
        self.binary(other, |context, a, b| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.delegate_remove)(a, b) }
        })
    }

    fn binary(
        &self,
        other: &Action,
        trampoline: impl FnOnce(&BridgeContext, Handle, Handle) -> Handle,
    ) -> Result<Action> {
        let context = current()?;
        let handle = context.call(|context| trampoline(context, self.handle, other.handle))?;
        context.objects.reference(handle);

        let mut pinned: Vec<NativeBinding> = Vec::new();
        for binding in self.bindings().chain(other.bindings()) {
            if !pinned.contains(&binding) {
                context.action_classes.reference(binding.class_handle);
                pinned.push(binding);
            }
        }
        Ok(Self {
            handle,
            native: None,
            pinned,
        })
    }

    /// `+=`
    pub fn add_assign(&mut self, other: &Action) -> Result<()> {
        *self = self.combine(other)?;
        Ok(())
    }

    /// `-=`
    pub fn remove_assign(&mut self, other: &Action) -> Result<()> {
        *self = self.remove(other)?;
        Ok(())
    }
}

fn native_target(context: &BridgeContext, handle: Handle) -> Result<Option<NativeBinding>> {
    if handle == NULL_HANDLE {
        return Ok(None);
    }
    let mut class_handle = NULL_HANDLE;
    let cpp_handle = context.call(|context| {
        // SAFETY: table entries were validated at init, `class_handle`
        // outlives the call
        unsafe { (context.generated.action_get_native_target)(handle, &mut class_handle) }
    })?;
    Ok((cpp_handle != 0 && class_handle != NULL_HANDLE).then_some(NativeBinding {
        class_handle,
        cpp_handle,
    }))
}

fn free_target(context: &BridgeContext, cpp_handle: i32) {
    let target = context.actions.release(cpp_handle);
    // SAFETY: reserved from `Box::into_raw` in `Action::new`
    drop(unsafe { Box::from_raw(target) });
}

/// Drops one class reference, freeing the closure with the last one.
fn unpin(context: &BridgeContext, binding: NativeBinding) {
    if context.action_classes.dereference_no_release(binding.class_handle) {
        log::debug!("freeing native action {}", binding.cpp_handle);
        free_target(context, binding.cpp_handle);
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.release_action)(binding.class_handle) };
    }
}

/// Runs the closure behind `cpp_handle`, as the managed wrapper asks.
pub(crate) fn invoke_native(cpp_handle: i32) -> Result<()> {
    let context = current()?;
    let target = context.actions.get(cpp_handle);
    // SAFETY: the managed wrapper is disconnected before the slot is freed
    unsafe { (*target)() }
}

impl Clone for Action {
    fn clone(&self) -> Self {
        if let Some(context) = crate::try_current() {
            context.objects.reference(self.handle);
            for binding in self.bindings() {
                context.action_classes.reference(binding.class_handle);
            }
        }
        Self {
            handle: self.handle,
            native: self.native,
            pinned: self.pinned.clone(),
        }
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        if self.handle == NULL_HANDLE && self.native.is_none() && self.pinned.is_empty() {
            return;
        }
        let Some(context) = crate::try_current() else {
            log::warn!("action {} dropped with no bridge context", self.handle);
            return;
        };
        context.objects.dereference(self.handle);
        for binding in self.native.take().into_iter().chain(self.pinned.drain(..)) {
            unpin(&context, binding);
        }
    }
}

impl core::fmt::Debug for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Action")
            .field("handle", &self.handle)
            .field("native", &self.native)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl From<&Action> for Delegate {
    fn from(action: &Action) -> Self {
        Delegate::acquire(action.handle)
    }
}

impl From<&Action> for Object {
    fn from(action: &Action) -> Self {
        Object::acquire(action.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExceptionClass, host};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn native_action_runs_directly_and_through_the_managed_side() {
        let _session = host::boot_default();

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let action = Action::new(move || {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("action");
        assert!(action.is_native());

        action.invoke().expect("direct");
        assert_eq!(hits.get(), 1);

        host::invoke(action.handle()).expect("through ActionInvoke");
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn acquiring_a_native_backed_handle_dispatches_directly() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let action = Action::new(move || {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("action");

        let adopted = Action::acquire(action.handle());
        assert!(adopted.is_native());
        assert_eq!(adopted.cpp_handle(), action.cpp_handle());

        drop(action);
        assert_eq!(context.actions.occupied_len(), 1, "adopted copy holds the class");
        adopted.invoke().expect("direct");
        assert_eq!(hits.get(), 1);

        drop(adopted);
        assert_eq!(context.actions.occupied_len(), 0);
        assert_eq!(host::released_action_classes().len(), 1);
    }

    #[test]
    fn managed_delegates_are_not_native() {
        let _session = host::boot_default();

        let managed = Action::acquire(host::new_managed_action("managed"));
        assert!(!managed.is_native());
        assert_eq!(managed.native_targets(), 0);
        managed.invoke().expect("through ActionInvoke");
        assert_eq!(host::invocations(), vec!["managed".to_owned()]);
    }

    #[test]
    fn add_assign_keeps_the_native_target_alive() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let mut action = Action::new(move || {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("action");
        let managed = Action::acquire(host::new_managed_action("managed"));

        action.add_assign(&managed).expect("+=");
        assert!(!action.is_native());
        assert_eq!(action.native_targets(), 1);
        assert!(host::released_action_classes().is_empty());

        action.invoke().expect("invoke");
        assert_eq!(hits.get(), 1);
        assert_eq!(host::invocations(), vec!["managed".to_owned()]);

        action.add_assign(&managed).expect("+=");
        assert_eq!(action.native_targets(), 1, "pinned once");
        drop(action);
        assert_eq!(context.actions.occupied_len(), 0);
        assert_eq!(host::released_action_classes().len(), 1);
    }

    #[test]
    fn combined_delegate_outlives_its_native_operand() {
        let _session = host::boot_default();

        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let native = Action::new(move || {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .expect("action");
        let combined = native.combine(&native).expect("Combine");
        drop(native);

        combined.invoke().expect("both targets run");
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn dropping_the_last_native_action_frees_the_closure_and_the_class() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let token = Rc::new(());
        let held = token.clone();
        let action = Action::new(move || {
            let _ = &held;
            Ok(())
        })
        .expect("action");
        let copy = action.clone();
        assert_eq!(Rc::strong_count(&token), 2);
        assert_eq!(context.actions.occupied_len(), 1);

        drop(action);
        assert_eq!(Rc::strong_count(&token), 2, "copy still holds the class");
        drop(copy);
        assert_eq!(Rc::strong_count(&token), 1);
        assert_eq!(context.actions.occupied_len(), 0);
        assert_eq!(host::released_action_classes().len(), 1);
    }

    #[test]
    fn combine_and_remove_build_new_delegates() {
        let _session = host::boot_default();

        let log = Rc::new(core::cell::RefCell::new(Vec::new()));
        let first_log = log.clone();
        let first = Action::new(move || {
            first_log.borrow_mut().push("native");
            Ok(())
        })
        .expect("action");
        let second = Action::acquire(host::new_managed_action("managed"));

        let mut both = first.combine(&second).expect("Combine");
        both.invoke().expect("invoke");
        assert_eq!(*log.borrow(), vec!["native"]);
        assert_eq!(host::invocations(), vec!["managed".to_owned()]);

        both.remove_assign(&first).expect("Remove");
        both.invoke().expect("invoke");
        assert_eq!(log.borrow().len(), 1, "native target removed");
        assert_eq!(host::invocations().len(), 2);

        both.remove_assign(&second).expect("Remove");
        assert!(both.is_null());
    }

    #[test]
    fn managed_exceptions_from_a_delegate_arrive_typed() {
        let _session = host::boot_default();

        let throwing = Action::acquire(host::new_throwing_action(
            ExceptionClass::InvalidOperation,
            "not now",
        ));
        let error = throwing.invoke().expect_err("throws");
        let exception = error.managed().expect("managed");
        assert_eq!(exception.class(), ExceptionClass::InvalidOperation);
        assert_eq!(exception.message().expect("message"), "not now");
    }

    #[test]
    fn native_errors_cross_back_through_a_managed_invoke() {
        let _session = host::boot_default();

        let action = Action::new(|| Err(BridgeError::native("closure failed"))).expect("action");
        let exception = host::invoke(action.handle()).expect_err("fails");
        assert_eq!(exception.class, ExceptionClass::Exception);
        assert_eq!(exception.message, "closure failed");
    }
}
