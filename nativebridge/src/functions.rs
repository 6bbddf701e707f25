//! The two function-pointer tables that form the wire format of the bridge.
//!
//! Managed tables are read out of the memory prefix in declaration order.
//! Native tables are written by `Init` into out-parameters supplied by the
//! managed side. Each managed entry is named after the managed member it
//! calls: declaring type, operation kind, then argument types.

use crate::{BridgeError, ExceptionClass, Handle, MemoryCursor, Result, Vector3};

macro_rules! managed_functions {
    (
        $(#[$meta:meta])*
        pub struct $table:ident {
            $( $field:ident = $symbol:literal : fn($($arg:ty),* $(,)?) $(-> $ret:ty)?; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        pub struct $table {
            $( pub $field: unsafe extern "C" fn($($arg),*) $(-> $ret)?, )*
        }

        impl $table {
            pub const NAMES: &'static [&'static str] = &[$($symbol),*];
            pub const SIZE: usize = Self::NAMES.len() * size_of::<usize>();

            pub fn read(cursor: &mut MemoryCursor) -> Result<Self> {
                Ok(Self {
                    $( $field: {
                        let raw = cursor.read_pointer()?;
                        if raw == 0 {
                            return Err(BridgeError::MissingFunction($symbol));
                        }
                        // SAFETY: the managed side writes a function with
                        // this signature at this position
                        unsafe {
                            core::mem::transmute::<
                                usize,
                                unsafe extern "C" fn($($arg),*) $(-> $ret)?,
                            >(raw)
                        }
                    }, )*
                })
            }

            pub fn write(&self, cursor: &mut MemoryCursor) -> Result<()> {
                $( cursor.write_pointer(self.$field as usize)?; )*
                Ok(())
            }
        }

        impl core::fmt::Debug for $table {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_struct(stringify!($table))
                    .field("entries", &Self::NAMES.len())
                    .finish()
            }
        }
    };
}

managed_functions! {
    /// Fixed entries every managed host provides.
    pub struct CoreFunctions {
        release_object = "ReleaseObject": fn(Handle);
        string_new = "StringNew": fn(*const u8, i32) -> Handle;
        set_exception = "SetException": fn(Handle);
        array_get_length = "ArrayGetLength": fn(Handle) -> i32;
        array_get_rank = "ArrayGetRank": fn(Handle) -> i32;
        array_get_length_of_dimension = "ArrayGetLengthOfDimension": fn(Handle, i32) -> i32;
    }
}

managed_functions! {
    /// Entries generated per mirrored managed type.
    pub struct GeneratedFunctions {
        object_to_string = "SystemObjectMethodToString": fn(Handle) -> Handle;
        object_get_hash_code = "SystemObjectMethodGetHashCode": fn(Handle) -> i32;
        object_equals = "SystemObjectMethodEqualsSystemObject": fn(Handle, Handle) -> u32;

        string_get_length = "SystemStringPropertyGetLength": fn(Handle) -> i32;
        string_concat = "SystemStringMethodConcatSystemString_SystemString": fn(Handle, Handle) -> Handle;
        string_copy_utf8 = "SystemStringMethodCopyUtf8": fn(Handle, *mut u8, i32) -> i32;

        exception_new = "SystemExceptionConstructorSystemString": fn(Handle) -> Handle;
        exception_get_message = "SystemExceptionPropertyGetMessage": fn(Handle) -> Handle;
        null_reference_exception_new = "SystemNullReferenceExceptionConstructorSystemString": fn(Handle) -> Handle;
        argument_exception_new = "SystemArgumentExceptionConstructorSystemString": fn(Handle) -> Handle;
        invalid_operation_exception_new = "SystemInvalidOperationExceptionConstructorSystemString": fn(Handle) -> Handle;
        invalid_cast_exception_new = "SystemInvalidCastExceptionConstructorSystemString": fn(Handle) -> Handle;

        box_boolean = "BoxBoolean": fn(u32) -> Handle;
        unbox_boolean = "UnboxBoolean": fn(Handle) -> u32;
        box_char = "BoxChar": fn(u16) -> Handle;
        unbox_char = "UnboxChar": fn(Handle) -> u16;
        box_sbyte = "BoxSByte": fn(i8) -> Handle;
        unbox_sbyte = "UnboxSByte": fn(Handle) -> i8;
        box_byte = "BoxByte": fn(u8) -> Handle;
        unbox_byte = "UnboxByte": fn(Handle) -> u8;
        box_int16 = "BoxInt16": fn(i16) -> Handle;
        unbox_int16 = "UnboxInt16": fn(Handle) -> i16;
        box_uint16 = "BoxUInt16": fn(u16) -> Handle;
        unbox_uint16 = "UnboxUInt16": fn(Handle) -> u16;
        box_int32 = "BoxInt32": fn(i32) -> Handle;
        unbox_int32 = "UnboxInt32": fn(Handle) -> i32;
        box_uint32 = "BoxUInt32": fn(u32) -> Handle;
        unbox_uint32 = "UnboxUInt32": fn(Handle) -> u32;
        box_int64 = "BoxInt64": fn(i64) -> Handle;
        unbox_int64 = "UnboxInt64": fn(Handle) -> i64;
        box_uint64 = "BoxUInt64": fn(u64) -> Handle;
        unbox_uint64 = "UnboxUInt64": fn(Handle) -> u64;
        box_single = "BoxSingle": fn(f32) -> Handle;
        unbox_single = "UnboxSingle": fn(Handle) -> f32;
        box_double = "BoxDouble": fn(f64) -> Handle;
        unbox_double = "UnboxDouble": fn(Handle) -> f64;

        box_vector3 = "BoxVector3": fn(*mut Vector3) -> Handle;
        unbox_vector3 = "UnboxVector3": fn(Handle, *mut Vector3);
        vector3_get_magnitude = "UnityEngineVector3PropertyGetMagnitude": fn(*mut Vector3) -> f32;
        vector3_op_addition = "UnityEngineVector3MethodOp_AdditionUnityEngineVector3_UnityEngineVector3": fn(*mut Vector3, *mut Vector3, *mut Vector3);

        box_day_of_week = "BoxDayOfWeek": fn(i32) -> Handle;
        unbox_day_of_week = "UnboxDayOfWeek": fn(Handle) -> i32;

        release_raycast_hit = "ReleaseUnityEngineRaycastHit": fn(Handle);
        raycast_hit_get_distance = "UnityEngineRaycastHitPropertyGetDistance": fn(Handle) -> f32;
        raycast_hit_get_point = "UnityEngineRaycastHitPropertyGetPoint": fn(Handle, *mut Vector3);
        box_raycast_hit = "BoxRaycastHit": fn(Handle) -> Handle;
        unbox_raycast_hit = "UnboxRaycastHit": fn(Handle) -> Handle;
        physics_raycast = "UnityEnginePhysicsMethodRaycastUnityEngineVector3_UnityEngineVector3_UnityEngineRaycastHit": fn(*mut Vector3, *mut Vector3, *mut Handle) -> u32;

        array_int32_new = "SystemInt32Array1Constructor1": fn(i32) -> Handle;
        array_int32_get_item = "SystemInt32Array1GetItem1": fn(Handle, i32) -> i32;
        array_int32_set_item = "SystemInt32Array1SetItem1": fn(Handle, i32, i32);
        array_single2_new = "SystemSingleArray2Constructor2": fn(i32, i32) -> Handle;
        array_single2_get_item = "SystemSingleArray2GetItem2": fn(Handle, i32, i32) -> f32;
        array_single2_set_item = "SystemSingleArray2SetItem2": fn(Handle, i32, i32, f32);
        array_string_new = "SystemStringArray1Constructor1": fn(i32) -> Handle;
        array_string_get_item = "SystemStringArray1GetItem1": fn(Handle, i32) -> Handle;
        array_string_set_item = "SystemStringArray1SetItem1": fn(Handle, i32, Handle);

        list_string_new = "SystemCollectionsGenericListSystemStringConstructor": fn() -> Handle;
        list_string_add = "SystemCollectionsGenericListSystemStringMethodAddSystemString": fn(Handle, Handle);
        list_string_get_count = "SystemCollectionsGenericListSystemStringPropertyGetCount": fn(Handle) -> i32;
        list_string_get_item = "SystemCollectionsGenericListSystemStringPropertyGetItem": fn(Handle, i32) -> Handle;

        action_new = "SystemActionConstructor": fn(i32, *mut Handle) -> Handle;
        release_action = "ReleaseSystemAction": fn(Handle);
        action_invoke = "SystemActionMethodInvoke": fn(Handle);
        action_get_native_target = "SystemActionPropertyGetNativeTarget": fn(Handle, *mut Handle) -> i32;
        delegate_combine = "SystemDelegateMethodCombineSystemDelegate_SystemDelegate": fn(Handle, Handle) -> Handle;
        delegate_remove = "SystemDelegateMethodRemoveSystemDelegate_SystemDelegate": fn(Handle, Handle) -> Handle;

        base_script_new = "BaseScriptConstructor": fn(i32, *mut Handle);
        release_base_script = "ReleaseBaseScript": fn(Handle);
        base_script_update = "BaseScriptMethodUpdate": fn(Handle);
        base_script_receive_damage = "BaseScriptMethodReceiveDamageSystemSingle": fn(Handle, f32) -> u32;
    }
}

/// Fixed native entries handed to the managed side by `Init`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeCoreFunctions {
    pub set_csharp_exception: unsafe extern "C" fn(Handle),
    pub set_csharp_exception_null_reference: unsafe extern "C" fn(Handle),
    pub set_csharp_exception_argument: unsafe extern "C" fn(Handle),
    pub set_csharp_exception_invalid_operation: unsafe extern "C" fn(Handle),
    pub set_csharp_exception_invalid_cast: unsafe extern "C" fn(Handle),
}

impl NativeCoreFunctions {
    /// The setter that makes native code observe an exception of `class`.
    pub fn setter(&self, class: ExceptionClass) -> unsafe extern "C" fn(Handle) {
        match class {
            ExceptionClass::Exception => self.set_csharp_exception,
            ExceptionClass::NullReference => {
                self.set_csharp_exception_null_reference
            }
            ExceptionClass::Argument => self.set_csharp_exception_argument,
            ExceptionClass::InvalidOperation => {
                self.set_csharp_exception_invalid_operation
            }
            ExceptionClass::InvalidCast => {
                self.set_csharp_exception_invalid_cast
            }
        }
    }
}

/// Generated native entries: subclass factories and virtual overrides.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeGeneratedFunctions {
    pub new_base_script: unsafe extern "C" fn(Handle) -> i32,
    pub destroy_base_script: unsafe extern "C" fn(i32),
    pub base_script_update: unsafe extern "C" fn(i32),
    pub base_script_receive_damage: unsafe extern "C" fn(i32, f32) -> u32,
    pub action_native_invoke: unsafe extern "C" fn(i32),
}
