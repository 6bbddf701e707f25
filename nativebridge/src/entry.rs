//! `Init` and the entry points the managed side calls by symbol or through
//! the native function tables.

use crate::{
    BridgeContext, BridgeError, Capacities, CoreFunctions, ExceptionClass,
    GeneratedFunctions, Handle, ManagedException, MemoryCursor,
    NativeCoreFunctions, NativeGeneratedFunctions, Result, SubclassFactory,
    WorkingLayout, boundary, current, delegates, install, subclass,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    FirstBoot = 0,
    Reload = 1,
}

impl TryFrom<u8> for InitMode {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InitMode::FirstBoot),
            1 => Ok(InitMode::Reload),
            other => Err(BridgeError::InvalidInitMode(other)),
        }
    }
}

/// `PluginMain(memory, isFirstBoot)`. `memory` is whatever the bridge left
/// of the region.
pub type PluginMain = fn(memory: &mut [u8], first_boot: bool) -> Result<()>;

/// What a plugin hands to [`export_plugin!`](crate::export_plugin).
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    pub main: PluginMain,
    /// Built when the managed side asks for a `BaseScript` through
    /// `NewBaseScript`.
    pub base_script: Option<SubclassFactory>,
    /// Whole-object slot size, see [`slot_size_of`](crate::slot_size_of).
    pub base_script_slot_size: usize,
}

impl PluginDescriptor {
    pub const fn new(main: PluginMain) -> Self {
        Self {
            main,
            base_script: None,
            base_script_slot_size: 0,
        }
    }

    pub const fn with_base_script(self, factory: SubclassFactory, slot_size: usize) -> Self {
        Self {
            base_script: Some(factory),
            base_script_slot_size: slot_size,
            ..self
        }
    }
}

/// Body of the exported `Init`.
///
/// # Safety
/// `memory` must be 16-byte aligned and valid for `memory_size` bytes for
/// the rest of the process. The out-pointers must be null or writable.
pub unsafe fn init(
    plugin: &PluginDescriptor,
    memory: *mut u8,
    memory_size: i32,
    init_mode: u8,
    core_out: *mut NativeCoreFunctions,
    generated_out: *mut NativeGeneratedFunctions,
) {
    // SAFETY: null or writable, guaranteed by the caller
    unsafe {
        if !core_out.is_null() {
            core_out.write(NativeCoreFunctions::EXPORTS);
        }
        if !generated_out.is_null() {
            generated_out.write(NativeGeneratedFunctions::EXPORTS);
        }
    }
    if memory.is_null() {
        log::error!("Init called without memory");
        return;
    }

    let size = memory_size.max(0) as usize;
    // SAFETY: guaranteed by the caller
    let mut cursor = unsafe { MemoryCursor::new(memory, size) };
    let core = match CoreFunctions::read(&mut cursor) {
        Ok(core) => core,
        Err(error) => {
            log::error!("cannot read the core function table: {error}");
            return;
        }
    };
    let (generated, capacities) = match read_rest_of_prefix(&mut cursor) {
        Ok(prefix) => prefix,
        Err(error) => {
            log::error!("cannot read the managed prefix: {error}");
            return;
        }
    };

    // SAFETY: guaranteed by the caller
    let booted = unsafe {
        boot(plugin, memory, size, init_mode, core, generated, capacities, &cursor)
    };
    let first_boot = match booted {
        Ok(first_boot) => first_boot,
        Err(error) => {
            log::error!("Init failed: {error}");
            report_without_context(&core, &generated, &error);
            return;
        }
    };

    boundary("PluginMain", || {
        let context = current()?;
        // SAFETY: the only view of the plugin's memory handed out
        let memory = unsafe { context.plugin_memory() };
        (plugin.main)(memory, first_boot)
    });
}

fn read_rest_of_prefix(cursor: &mut MemoryCursor) -> Result<(GeneratedFunctions, Capacities)> {
    let managed_objects = cursor.read_i32()?;
    let generated = GeneratedFunctions::read(cursor)?;
    let capacities = Capacities::read_trailing(cursor, managed_objects)?;
    Ok((generated, capacities))
}

#[allow(clippy::too_many_arguments)]
unsafe fn boot(
    plugin: &PluginDescriptor,
    memory: *mut u8,
    size: usize,
    init_mode: u8,
    core: CoreFunctions,
    generated: GeneratedFunctions,
    capacities: Capacities,
    cursor: &MemoryCursor,
) -> Result<bool> {
    let mode = InitMode::try_from(init_mode)?;
    let layout = WorkingLayout::compute(
        memory as usize,
        cursor.offset(),
        &capacities,
        plugin.base_script_slot_size,
    );
    if layout.required() > size {
        return Err(BridgeError::MemoryTooLow {
            required: layout.required(),
            provided: size,
        });
    }

    // SAFETY: the layout fits the region, checked above
    let context = unsafe {
        BridgeContext::new(memory, size, core, generated, capacities, layout, *plugin)
    };
    let first_boot = mode == InitMode::FirstBoot;
    if first_boot {
        context.first_boot();
    }
    log::info!(
        "bridge initialized ({mode:?}): {} of {size} bytes used, {:?}",
        layout.required(),
        capacities
    );
    install(context);
    Ok(first_boot)
}

/// Raises `error` on the managed side with nothing but the raw tables.
fn report_without_context(
    core: &CoreFunctions,
    generated: &GeneratedFunctions,
    error: &BridgeError,
) {
    let message = error.to_string();
    let len = message.len().min(i32::MAX as usize) as i32;
    // SAFETY: tables were read in full, `message` outlives the calls
    unsafe {
        let string = (core.string_new)(message.as_ptr(), len);
        let exception = (generated.exception_new)(string);
        (core.release_object)(string);
        (core.set_exception)(exception);
        (core.release_object)(exception);
    }
}

fn receive_exception(class: ExceptionClass, handle: Handle) {
    match current() {
        Ok(context) => {
            context.set_pending(ManagedException::acquire(class, handle))
        }
        Err(_) => log::error!(
            "{} {handle} raised with no bridge context",
            class.managed_name()
        ),
    }
}

pub extern "C" fn set_csharp_exception(handle: Handle) {
    receive_exception(ExceptionClass::Exception, handle);
}

pub extern "C" fn set_csharp_exception_null_reference(handle: Handle) {
    receive_exception(ExceptionClass::NullReference, handle);
}

pub extern "C" fn set_csharp_exception_argument(handle: Handle) {
    receive_exception(ExceptionClass::Argument, handle);
}

pub extern "C" fn set_csharp_exception_invalid_operation(handle: Handle) {
    receive_exception(ExceptionClass::InvalidOperation, handle);
}

pub extern "C" fn set_csharp_exception_invalid_cast(handle: Handle) {
    receive_exception(ExceptionClass::InvalidCast, handle);
}

pub extern "C" fn new_base_script(handle: Handle) -> i32 {
    boundary("NewBaseScript", || subclass::construct_for_managed(handle))
        .unwrap_or(0)
}

pub extern "C" fn destroy_base_script(cpp_handle: i32) {
    boundary("DestroyBaseScript", || {
        let context = current()?;
        subclass::destroy(&context, cpp_handle);
        Ok(())
    });
}

pub extern "C" fn base_script_update(cpp_handle: i32) {
    boundary("BaseScriptUpdate", || {
        subclass::dispatch(cpp_handle, |script| script.update())
    });
}

pub extern "C" fn base_script_receive_damage(cpp_handle: i32, amount: f32) -> u32 {
    boundary("BaseScriptReceiveDamage", || {
        subclass::dispatch(cpp_handle, |script| script.receive_damage(amount))
    })
    .map_or(0, u32::from)
}

pub extern "C" fn action_native_invoke(cpp_handle: i32) {
    boundary("ActionNativeInvoke", || delegates::invoke_native(cpp_handle));
}

impl NativeCoreFunctions {
    pub const EXPORTS: Self = Self {
        set_csharp_exception,
        set_csharp_exception_null_reference,
        set_csharp_exception_argument,
        set_csharp_exception_invalid_operation,
        set_csharp_exception_invalid_cast,
    };
}

impl NativeGeneratedFunctions {
    pub const EXPORTS: Self = Self {
        new_base_script,
        destroy_base_script,
        base_script_update,
        base_script_receive_damage,
        action_native_invoke,
    };
}

/// Exports the C ABI of a plugin: `Init` plus every entry point the
/// managed side may call by symbol.
///
/// ```ignore
/// const PLUGIN: PluginDescriptor = PluginDescriptor::new(plugin_main);
/// nativebridge::export_plugin!(PLUGIN);
/// ```
#[macro_export]
macro_rules! export_plugin {
    (@forward $(
        $symbol:ident = $target:ident($($arg:ident: $ty:ty),*) $(-> $ret:ty)?;
    )*) => {
        $(
            #[allow(non_snake_case)]
            #[unsafe(no_mangle)]
            pub extern "C" fn $symbol($($arg: $ty),*) $(-> $ret)? {
                $crate::entry::$target($($arg),*)
            }
        )*
    };

    ($plugin:expr) => {
        /// # Safety
        /// Called by the managed side with a region it lends for the rest
        /// of the process.
        #[allow(non_snake_case)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn Init(
            memory: *mut u8,
            memory_size: i32,
            init_mode: u8,
            core_out: *mut $crate::NativeCoreFunctions,
            generated_out: *mut $crate::NativeGeneratedFunctions,
        ) {
            const PLUGIN: $crate::PluginDescriptor = $plugin;
            // SAFETY: forwarded from the managed caller
            unsafe {
                $crate::entry::init(
                    &PLUGIN,
                    memory,
                    memory_size,
                    init_mode,
                    core_out,
                    generated_out,
                )
            }
        }

        $crate::export_plugin!(@forward
            SetCsharpException = set_csharp_exception(handle: $crate::Handle);
            SetCsharpExceptionSystemNullReferenceException =
                set_csharp_exception_null_reference(handle: $crate::Handle);
            SetCsharpExceptionSystemArgumentException =
                set_csharp_exception_argument(handle: $crate::Handle);
            SetCsharpExceptionSystemInvalidOperationException =
                set_csharp_exception_invalid_operation(handle: $crate::Handle);
            SetCsharpExceptionSystemInvalidCastException =
                set_csharp_exception_invalid_cast(handle: $crate::Handle);
            NewBaseScript = new_base_script(handle: $crate::Handle) -> i32;
            DestroyBaseScript = destroy_base_script(cpp_handle: i32);
            BaseScriptUpdate = base_script_update(cpp_handle: i32);
            BaseScriptReceiveDamage =
                base_script_receive_damage(cpp_handle: i32, amount: f32) -> u32;
            ActionNativeInvoke = action_native_invoke(cpp_handle: i32);
        );
    };

}
