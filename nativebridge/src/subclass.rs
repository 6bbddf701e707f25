//! Native subclasses of the managed abstract class `BaseScript`.
//!
//! A live subclass instance holds three things at once: a managed handle
//! to its companion object, a slot in the pointer pool (its "cpp handle",
//! which the companion stores and dispatches virtual calls with) and a
//! slot in the whole-object pool its value is constructed in.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};

use crate::{
    BridgeContext, BridgeError, Handle, NULL_HANDLE, ObjectPool, Result,
    current,
    system::{Object, managed_class},
};

/// Identity every subclass instance carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseScriptBase {
    handle: Handle,
    cpp_handle: i32,
}

impl BaseScriptBase {
    /// Handle of the managed companion.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Index in the pointer pool.
    pub fn cpp_handle(&self) -> i32 {
        self.cpp_handle
    }

    /// The managed companion, for calling its non-overridden members.
    pub fn managed(&self) -> ManagedBaseScript {
        ManagedBaseScript::acquire(self.handle)
    }
}

/// The overridable surface of `BaseScript`. Defaults match the managed
/// base implementation.
pub trait BaseScript: 'static {
    fn base(&self) -> &BaseScriptBase;

    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns whether the damage was lethal.
    fn receive_damage(&mut self, _amount: f32) -> Result<bool> {
        Ok(false)
    }
}

/// A concrete subclass that can be built in a pool slot.
pub trait Subclass: BaseScript + Sized {
    fn construct(base: BaseScriptBase) -> Self;
}

/// Placeholder stored in the pointer pool while a slot's value is still
/// under construction. Never dereferenced.
struct Vacant;

impl BaseScript for Vacant {
    fn base(&self) -> &BaseScriptBase {
        unreachable!("vacant BaseScript slot")
    }
}

fn vacant() -> *mut dyn BaseScript {
    ptr::null_mut::<Vacant>() as *mut dyn BaseScript
}

type Construct = unsafe fn(NonNull<u8>, BaseScriptBase) -> *mut dyn BaseScript;

/// How to build the plugin's concrete subclass when the managed side asks
/// for one through `NewBaseScript`.
#[derive(Clone, Copy)]
pub struct SubclassFactory {
    pub size: usize,
    pub align: usize,
    construct: Construct,
}

impl SubclassFactory {
    pub const fn of<D: Subclass>() -> Self {
        Self {
            size: size_of::<D>(),
            align: align_of::<D>(),
            construct: construct_in_place::<D>,
        }
    }
}

impl core::fmt::Debug for SubclassFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubclassFactory")
            .field("size", &self.size)
            .field("align", &self.align)
            .finish_non_exhaustive()
    }
}

/// # Safety
/// `storage` must be a free slot of the whole-object pool large enough for
/// `D`.
unsafe fn construct_in_place<D: Subclass>(
    storage: NonNull<u8>,
    base: BaseScriptBase,
) -> *mut dyn BaseScript {
    let slot = storage.as_ptr().cast::<D>();
    // SAFETY: guaranteed by the caller
    unsafe { slot.write(D::construct(base)) };
    slot as *mut dyn BaseScript
}

/// Whole-object slot size fitting every listed subclass size.
pub const fn slot_size_of(sizes: &[usize]) -> usize {
    let mut largest = 0;
    let mut i = 0;
    while i < sizes.len() {
        if sizes[i] > largest {
            largest = sizes[i];
        }
        i += 1;
    }
    largest
}

fn check_fits(pool: &ObjectPool, size: usize, align: usize) {
    assert!(
        size <= pool.slot_size(),
        "BaseScript subclass of {size} bytes does not fit {}-byte slots",
        pool.slot_size()
    );
    assert!(
        align <= ObjectPool::SLOT_ALIGN,
        "BaseScript subclass alignment {align} exceeds {}",
        ObjectPool::SLOT_ALIGN
    );
}

/// Constructs the value into reserved slots. On a panic both slots and the
/// handle reference go back before unwinding continues.
fn fill_slots(
    context: &BridgeContext,
    storage: NonNull<u8>,
    base: BaseScriptBase,
    construct: impl FnOnce(NonNull<u8>, BaseScriptBase) -> *mut dyn BaseScript,
) -> *mut dyn BaseScript {
    match panic::catch_unwind(AssertUnwindSafe(|| construct(storage, base))) {
        Ok(value) => {
            context.base_script_pointers.set(base.cpp_handle, value);
            value
        }
        Err(payload) => {
            context.base_script_objects.release(storage);
            context.base_script_pointers.release(base.cpp_handle);
            release_base_script(context, base.handle);
            panic::resume_unwind(payload)
        }
    }
}

/// Owner of a subclass instance the native side created. Dropping it
/// destroys the instance.
pub struct NativeScript<D: Subclass> {
    cpp_handle: i32,
    marker: PhantomData<*mut D>,
}

impl<D: Subclass> NativeScript<D> {
    /// Creates the managed companion and constructs `D` in a pool slot.
    pub fn new(init: impl FnOnce(BaseScriptBase) -> D) -> Result<Self> {
        let context = current()?;
        check_fits(&context.base_script_objects, size_of::<D>(), align_of::<D>());

        let (_, storage) = context.base_script_objects.reserve();
        let cpp_handle = context.base_script_pointers.reserve(vacant());

        let mut handle = NULL_HANDLE;
        let constructed = context.call(|context| {
            // SAFETY: table entries were validated at init, `handle`
            // outlives the call
            unsafe { (context.generated.base_script_new)(cpp_handle, &mut handle) }
        });
        if let Err(error) = constructed.and_then(|()| {
            if handle == NULL_HANDLE {
                Err(BridgeError::NullHandle("BaseScriptConstructor"))
            } else {
                Ok(())
            }
        }) {
            context.base_script_objects.release(storage);
            context.base_script_pointers.release(cpp_handle);
            return Err(error);
        }
        context.objects.reference(handle);

        let base = BaseScriptBase { handle, cpp_handle };
        fill_slots(&context, storage, base, |storage, base| {
            let slot = storage.as_ptr().cast::<D>();
            // SAFETY: the slot is reserved and fits `D`, checked above
            unsafe { slot.write(init(base)) };
            slot as *mut dyn BaseScript
        });
        log::debug!("BaseScript {cpp_handle} created natively, handle {handle}");
        Ok(Self {
            cpp_handle,
            marker: PhantomData,
        })
    }

    pub fn cpp_handle(&self) -> i32 {
        self.cpp_handle
    }

    /// Runs `f` on the instance. The instance must not be re-entered from
    /// inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R> {
        let context = current()?;
        let value = context.base_script_pointers.get(self.cpp_handle);
        // SAFETY: the slot holds a `D` for as long as this owner lives
        Ok(f(unsafe { &mut *value.cast::<D>() }))
    }

    pub fn base(&self) -> Result<BaseScriptBase> {
        self.with(|script| *script.base())
    }
}

impl<D: Subclass> Drop for NativeScript<D> {
    fn drop(&mut self) {
        match current() {
            Ok(context) => destroy(&context, self.cpp_handle),
            Err(_) => log::warn!(
                "BaseScript {} dropped with no bridge context",
                self.cpp_handle
            ),
        }
    }
}

impl<D: Subclass> core::fmt::Debug for NativeScript<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeScript")
            .field("cpp_handle", &self.cpp_handle)
            .finish()
    }
}

/// `NewBaseScript`: the managed side created a companion and wants the
/// plugin's subclass behind it.
pub(crate) fn construct_for_managed(handle: Handle) -> Result<i32> {
    let context = current()?;
    let factory = context.plugin.base_script.ok_or_else(|| {
        BridgeError::native("this plugin does not subclass BaseScript")
    })?;
    if handle == NULL_HANDLE {
        return Err(BridgeError::NullHandle("NewBaseScript"));
    }
    check_fits(&context.base_script_objects, factory.size, factory.align);

    let (_, storage) = context.base_script_objects.reserve();
    let cpp_handle = context.base_script_pointers.reserve(vacant());
    context.objects.reference(handle);
    let base = BaseScriptBase { handle, cpp_handle };
    fill_slots(&context, storage, base, |storage, base| {
        // SAFETY: the slot is reserved and fits the factory's type
        unsafe { (factory.construct)(storage, base) }
    });
    log::debug!("BaseScript {cpp_handle} created for managed handle {handle}");
    Ok(cpp_handle)
}

/// Destroys an instance: value, whole-object slot, pointer slot, then the
/// managed handle through `ReleaseBaseScript`.
pub(crate) fn destroy(context: &BridgeContext, cpp_handle: i32) {
    let value = context.base_script_pointers.get(cpp_handle);
    assert!(!value.is_null(), "BaseScript {cpp_handle} is under construction");
    // SAFETY: occupied slots hold constructed values
    let handle = unsafe { (*value).base().handle() };
    // SAFETY: see above, the value is not used after this
    unsafe { ptr::drop_in_place(value) };

    let storage = NonNull::new(value.cast::<u8>())
        .unwrap_or_else(|| unreachable!("checked non-null above"));
    context.base_script_objects.release(storage);
    context.base_script_pointers.release(cpp_handle);
    release_base_script(context, handle);
    log::debug!("BaseScript {cpp_handle} destroyed, handle {handle}");
}

/// Runs `f` on the instance behind `cpp_handle`.
pub(crate) fn dispatch<R>(
    cpp_handle: i32,
    f: impl FnOnce(&mut dyn BaseScript) -> Result<R>,
) -> Result<R> {
    let context = current()?;
    let value = context.base_script_pointers.get(cpp_handle);
    if value.is_null() {
        return Err(BridgeError::native(format!(
            "BaseScript {cpp_handle} is under construction"
        )));
    }
    // SAFETY: occupied, non-null slots hold constructed values
    f(unsafe { &mut *value })
}

pub(crate) fn release_base_script(context: &BridgeContext, handle: Handle) {
    if context.objects.dereference_no_release(handle) {
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.release_base_script)(handle) };
    }
}

managed_class! {
    /// The managed `BaseScript` companion. Its last release goes through
    /// `ReleaseBaseScript` so the companion can disconnect from native.
    pub struct ManagedBaseScript = "BaseScript"
        in objects release crate::subclass::release_base_script: Object;
}

impl ManagedBaseScript {
    /// The managed virtual `Update`, which dispatches back into native
    /// code for native subclasses.
    pub fn update(&self) -> Result<()> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.base_script_update)(self.handle()) }
        })
    }

    pub fn receive_damage(&self, amount: f32) -> Result<bool> {
        let context = current()?;
        let lethal = context.call(|context| {
            // SAFETY: see above
            unsafe {
                (context.generated.base_script_receive_damage)(self.handle(), amount)
            }
        })?;
        Ok(lethal != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExceptionClass, host};

    struct Turret {
        base: BaseScriptBase,
        health: f32,
        updates: u32,
    }

    impl BaseScript for Turret {
        fn base(&self) -> &BaseScriptBase {
            &self.base
        }

        fn update(&mut self) -> Result<()> {
            self.updates += 1;
            Ok(())
        }

        fn receive_damage(&mut self, amount: f32) -> Result<bool> {
            self.health -= amount;
            Ok(self.health <= 0.0)
        }
    }

    impl Subclass for Turret {
        fn construct(base: BaseScriptBase) -> Self {
            Turret {
                base,
                health: 10.0,
                updates: 0,
            }
        }
    }

    #[test]
    fn slot_size_fits_the_largest_subclass() {
        assert_eq!(slot_size_of(&[8, 40, 24]), 40);
        assert_eq!(slot_size_of(&[]), 0);
    }

    #[test]
    fn native_creation_holds_handle_pointer_slot_and_object_slot() {
        let _session = host::boot_with_script::<Turret>();
        let context = current().expect("booted");

        let turret = NativeScript::new(Turret::construct).expect("created");
        let base = turret.base().expect("base");
        assert_eq!(context.objects.count(base.handle()), 1);
        assert_eq!(context.base_script_pointers.occupied_len(), 1);
        assert_eq!(
            context.base_script_objects.free_len(),
            context.base_script_objects.capacity() - 2
        );
        assert_eq!(host::companion_cpp_handle(base.handle()), Some(base.cpp_handle()));

        base.managed().update().expect("managed Update");
        assert_eq!(turret.with(|turret| turret.updates).expect("live"), 1);
        assert!(!base.managed().receive_damage(4.0).expect("damage"));
        assert!(base.managed().receive_damage(6.0).expect("damage"));

        drop(turret);
        assert_eq!(context.base_script_pointers.occupied_len(), 0);
        assert_eq!(
            context.base_script_objects.free_len(),
            context.base_script_objects.capacity() - 1
        );
        assert_eq!(host::released_base_scripts(), vec![base.handle()]);
        assert!(host::released_objects().is_empty());
    }

    #[test]
    fn managed_creation_goes_through_the_plugin_factory() {
        let _session = host::boot_with_script::<Turret>();
        let context = current().expect("booted");

        let handle = host::create_base_script().expect("NewBaseScript");
        let cpp_handle = host::companion_cpp_handle(handle).expect("connected");
        assert_eq!(context.objects.count(handle), 1);

        host::update(handle).expect("Update");
        host::update(handle).expect("Update");
        let owner = dispatch(cpp_handle, |script| Ok(script.base().handle()))
            .expect("live");
        assert_eq!(owner, handle);

        host::destroy_base_script(handle).expect("DestroyBaseScript");
        assert_eq!(context.base_script_pointers.occupied_len(), 0);
        assert_eq!(host::companion_cpp_handle(handle), None);
    }

    #[test]
    fn failed_managed_construction_returns_both_slots() {
        let _session = host::boot_with_script::<Turret>();
        let context = current().expect("booted");

        host::fail_next_base_script_constructor(ExceptionClass::InvalidOperation);
        let error = NativeScript::new(Turret::construct).expect_err("refused");
        assert_eq!(
            error.managed().map(|exception| exception.class()),
            Some(ExceptionClass::InvalidOperation)
        );
        assert_eq!(context.base_script_pointers.occupied_len(), 0);
        assert_eq!(
            context.base_script_objects.free_len(),
            context.base_script_objects.capacity() - 1
        );
    }

    #[test]
    #[should_panic(expected = "is not occupied")]
    fn dispatch_to_a_destroyed_script_is_fatal() {
        let _session = host::boot_with_script::<Turret>();

        let turret = NativeScript::new(Turret::construct).expect("created");
        let cpp_handle = turret.cpp_handle();
        drop(turret);
        let _ = dispatch(cpp_handle, |script| script.update());
    }

    #[test]
    fn plugin_without_a_subclass_refuses_managed_creation() {
        let _session = host::boot_default();

        let error = host::create_base_script().expect_err("no factory");
        assert_eq!(error.class, ExceptionClass::Exception);
        assert!(error.message.contains("does not subclass BaseScript"));
    }
}
