//! The bridge context: everything `Init` reads out of the lent region,
//! installed per thread so every mirror can reach its tables.

use core::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::{
    ActionTarget, BaseScript, BridgeError, Capacities, CoreFunctions,
    GeneratedFunctions, ManagedException, ObjectPool, PluginDescriptor,
    PointerPool, RefCountTable, Result, WorkingLayout,
    system::{Exception, String},
};

thread_local! {
    static CURRENT: RefCell<Option<Rc<BridgeContext>>> = const { RefCell::new(None) };
}

pub struct BridgeContext {
    pub core: CoreFunctions,
    pub generated: GeneratedFunctions,
    pub objects: RefCountTable,
    pub raycast_hits: RefCountTable,
    pub action_classes: RefCountTable,
    pub base_script_pointers: PointerPool<dyn BaseScript>,
    pub base_script_objects: ObjectPool,
    pub actions: PointerPool<ActionTarget>,
    pub plugin: PluginDescriptor,
    pub capacities: Capacities,
    pub layout: WorkingLayout,
    memory: *mut u8,
    memory_size: usize,
    pending: RefCell<Option<ManagedException>>,
}

impl BridgeContext {
    /// Builds the tables and pools over the working memory described by
    /// `layout`. Nothing is written: threading is a separate, first-boot
    /// only step.
    ///
    /// # Safety
    /// `memory` must be 16-byte aligned and valid for `memory_size` bytes
    /// for as long as the context lives, and `layout.required()` must not
    /// exceed `memory_size`.
    pub unsafe fn new(
        memory: *mut u8,
        memory_size: usize,
        core: CoreFunctions,
        generated: GeneratedFunctions,
        capacities: Capacities,
        layout: WorkingLayout,
        plugin: PluginDescriptor,
    ) -> Self {
        assert!(layout.required() <= memory_size);
        // SAFETY: every section lies inside the region, checked above
        unsafe {
            let at = |offset: usize| memory.add(offset);
            Self {
                objects: RefCountTable::from_raw(
                    "objects",
                    at(layout.objects.offset).cast(),
                    capacities.managed_objects,
                    core.release_object,
                ),
                raycast_hits: RefCountTable::from_raw(
                    "raycast hits",
                    at(layout.raycast_hits.offset).cast(),
                    capacities.raycast_hits,
                    generated.release_raycast_hit,
                ),
                action_classes: RefCountTable::from_raw(
                    "action classes",
                    at(layout.action_classes.offset).cast(),
                    capacities.actions,
                    generated.release_action,
                ),
                base_script_pointers: PointerPool::from_raw(
                    "BaseScript pointers",
                    at(layout.base_script_pointers.offset),
                    capacities.base_scripts,
                ),
                base_script_objects: ObjectPool::from_raw(
                    "BaseScript objects",
                    at(layout.base_script_objects.offset),
                    capacities.base_scripts,
                    plugin.base_script_slot_size,
                ),
                actions: PointerPool::from_raw(
                    "actions",
                    at(layout.action_pointers.offset),
                    capacities.actions,
                ),
                core,
                generated,
                plugin,
                capacities,
                layout,
                memory,
                memory_size,
                pending: RefCell::new(None),
            }
        }
    }

    /// Zeroes working memory and threads every free list.
    pub fn first_boot(&self) {
        let start = self.layout.start;
        let end = self.layout.end;
        // SAFETY: start..end lies inside the region
        unsafe { core::ptr::write_bytes(self.memory.add(start), 0, end - start) };
        self.base_script_pointers.thread();
        self.base_script_objects.thread();
        self.actions.thread();
    }

    /// The part of the region left over for the plugin.
    ///
    /// # Safety
    /// The caller must not hold two of these slices at once.
    pub unsafe fn plugin_memory(&self) -> &mut [u8] {
        let start = self.layout.end.min(self.memory_size);
        // SAFETY: start..memory_size lies inside the region
        unsafe {
            core::slice::from_raw_parts_mut(self.memory.add(start), self.memory_size - start)
        }
    }

    /// Runs one managed call and turns an exception the managed side
    /// deposited meanwhile into `Err`.
    #[inline]
    pub fn call<R>(&self, trampoline: impl FnOnce(&Self) -> R) -> Result<R> {
        let value = trampoline(self);
        self.check()?;
        Ok(value)
    }

    /// Takes ownership of a pending managed exception, if any.
    pub fn check(&self) -> Result<()> {
        let pending = self.pending.borrow_mut().take();
        match pending {
            Some(exception) => Err(exception.into()),
            None => Ok(()),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    pub fn set_pending(&self, exception: ManagedException) {
        let previous = self.pending.replace(Some(exception));
        if let Some(previous) = previous {
            log::warn!("unobserved managed exception overwritten: {previous}");
        }
    }

    /// Installs `error` into the managed exception slot.
    ///
    /// Managed exceptions go back with their original handle. Everything
    /// else becomes a `System.Exception` carrying the error's message.
    pub fn throw_to_managed(&self, error: BridgeError) {
        match error {
            BridgeError::Managed(exception) => {
                // SAFETY: table entries were validated at init
                unsafe { (self.core.set_exception)(exception.handle()) };
            }
            other => {
                let message = other.to_string();
                match self.wrap_message(&message) {
                    // SAFETY: see above
                    Ok(exception) => unsafe {
                        (self.core.set_exception)(exception.handle())
                    },
                    Err(nested) => log::error!(
                        "could not raise `{message}` on the managed side: {nested}"
                    ),
                }
            }
        }
    }

    fn wrap_message(&self, message: &str) -> Result<Exception> {
        let message = String::new(message)?;
        Exception::new(&message)
    }
}

impl core::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("capacities", &self.capacities)
            .field("objects", &self.objects)
            .field("memory_size", &self.memory_size)
            .finish_non_exhaustive()
    }
}

pub fn try_current() -> Option<Rc<BridgeContext>> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

pub fn current() -> Result<Rc<BridgeContext>> {
    try_current().ok_or(BridgeError::NoContext)
}

/// Makes `context` the one mirrors on this thread talk to and returns the
/// previous one.
pub fn install(context: BridgeContext) -> Option<Rc<BridgeContext>> {
    CURRENT.with(|current| current.replace(Some(Rc::new(context))))
}

pub fn uninstall() -> Option<Rc<BridgeContext>> {
    CURRENT
        .try_with(|current| current.replace(None))
        .ok()
        .flatten()
}

pub(crate) fn panic_message(payload: &(dyn core::any::Any + Send)) -> std::string::String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<std::string::String>() {
        message.clone()
    } else {
        "native panic".to_owned()
    }
}

/// Runs the body of an exported entry point. Errors and panics end up in
/// the managed exception slot and `None` is returned.
pub fn boundary<T>(entry: &str, body: impl FnOnce() -> Result<T>) -> Option<T> {
    let error = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(error)) => error,
        Err(payload) => BridgeError::native(panic_message(payload.as_ref())),
    };
    log::debug!("{entry} failed: {error}");
    match try_current() {
        Some(context) => context.throw_to_managed(error),
        None => log::error!("{entry} failed with no context installed: {error}"),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_is_an_error_not_a_panic() {
        uninstall();
        assert!(matches!(current(), Err(BridgeError::NoContext)));
        assert!(boundary("test", || Ok(1)).is_some());
        assert!(boundary::<()>("test", || Err(BridgeError::NoContext)).is_none());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7))
            .expect_err("panicked");
        assert_eq!(panic_message(payload.as_ref()), "boom 7");

        let payload = panic::catch_unwind(|| panic!("static")).expect_err("panicked");
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
