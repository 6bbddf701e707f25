//! Mirrors of the `System` namespace and the macro every reference mirror
//! is generated with.
//!
//! A reference mirror is one `Handle` and nothing else. Cloning takes a
//! reference, dropping gives one back, moving transfers it. Every "is-a"
//! edge of the managed hierarchy becomes a `From` conversion sharing the
//! handle, and the primary base is also reachable through `Deref`, so a
//! derived mirror can call its bases' methods directly.

use crate::{
    BridgeContext, BridgeError, Handle, InternalUse, ManagedException,
    NULL_HANDLE, Result, current,
};

/// Operations every reference mirror provides.
pub trait Mirror: Sized {
    /// Fully qualified managed type name.
    const MANAGED_NAME: &'static str;

    /// Wraps `handle` without taking a reference.
    fn from_raw(marker: InternalUse, handle: Handle) -> Self;

    /// Wraps `handle` and takes one reference.
    fn acquire(handle: Handle) -> Self;

    fn handle(&self) -> Handle;

    /// Gives the handle away without releasing the reference.
    fn into_raw(self) -> Handle;

    fn is_null(&self) -> bool {
        self.handle() == NULL_HANDLE
    }
}

pub(crate) fn release_object(context: &BridgeContext, handle: Handle) {
    context.objects.dereference(handle);
}

macro_rules! managed_class {
    (
        $(#[$meta:meta])*
        pub struct $name:ident = $managed:literal
            $(in $table:ident release $release:path)?
            $(: $primary:ident $(, $base:ident)*)?;
    ) => {
        $crate::system::managed_class!(@define
            [$(#[$meta])*] $name $managed [$($table $release)?]
            $(: $primary $(, $base)*)?
        );
    };

    (@define [$($attr:tt)*] $name:ident $managed:literal []
        $($bases:tt)*
    ) => {
        $crate::system::managed_class!(@define
            [$($attr)*] $name $managed
            [objects $crate::system::release_object]
            $($bases)*
        );
    };

    (@define [$($attr:tt)*] $name:ident $managed:literal
        [$table:ident $release:path]
        $(: $primary:ident $(, $base:ident)*)?
    ) => {
        $($attr)*
        #[repr(transparent)]
        pub struct $name {
            handle: $crate::Handle,
        }

        impl $name {
            pub const fn null() -> Self {
                Self { handle: $crate::NULL_HANDLE }
            }

            /// Wraps `handle` without taking a reference.
            pub const fn from_raw(_: $crate::InternalUse, handle: $crate::Handle) -> Self {
                Self { handle }
            }

            pub fn acquire(handle: $crate::Handle) -> Self {
                if handle != $crate::NULL_HANDLE {
                    match $crate::try_current() {
                        Some(context) => context.$table.reference(handle),
                        None => log::warn!(
                            "{} {handle} acquired with no bridge context",
                            $managed
                        ),
                    }
                }
                Self { handle }
            }

            /// Takes the reference for a handle a trampoline returned.
            #[allow(dead_code)]
            pub(crate) fn adopt(context: &$crate::BridgeContext, handle: $crate::Handle) -> Self {
                context.$table.reference(handle);
                Self { handle }
            }

            #[inline]
            pub const fn handle(&self) -> $crate::Handle {
                self.handle
            }

            #[inline]
            pub const fn is_null(&self) -> bool {
                self.handle == $crate::NULL_HANDLE
            }

            pub fn into_raw(self) -> $crate::Handle {
                let handle = self.handle;
                core::mem::forget(self);
                handle
            }
        }

        impl $crate::system::Mirror for $name {
            const MANAGED_NAME: &'static str = $managed;

            fn from_raw(marker: $crate::InternalUse, handle: $crate::Handle) -> Self {
                Self::from_raw(marker, handle)
            }

            fn acquire(handle: $crate::Handle) -> Self {
                Self::acquire(handle)
            }

            fn handle(&self) -> $crate::Handle {
                self.handle
            }

            fn into_raw(self) -> $crate::Handle {
                Self::into_raw(self)
            }
        }

        impl Clone for $name {
            fn clone(&self) -> Self {
                Self::acquire(self.handle)
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if self.handle == $crate::NULL_HANDLE {
                    return;
                }
                match $crate::try_current() {
                    Some(context) => $release(&context, self.handle),
                    None => log::warn!(
                        "{} {} dropped with no bridge context",
                        $managed,
                        self.handle
                    ),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::null()
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.handle)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.handle == other.handle
            }
        }

        impl Eq for $name {}

        impl PartialEq<$crate::Null> for $name {
            fn eq(&self, _: &$crate::Null) -> bool {
                self.is_null()
            }
        }

        impl PartialEq<$name> for $crate::Null {
            fn eq(&self, other: &$name) -> bool {
                other.is_null()
            }
        }

        $(
            impl core::ops::Deref for $name {
                type Target = $primary;

                fn deref(&self) -> &$primary {
                    // SAFETY: both mirrors are a transparent `Handle`
                    unsafe { &*(self as *const Self).cast::<$primary>() }
                }
            }

            $crate::system::managed_class!(@base $name $primary);
            $( $crate::system::managed_class!(@base $name $base); )*
        )?
    };

    (@base $name:ident $base:ident) => {
        impl From<&$name> for $base {
            fn from(value: &$name) -> Self {
                $base::acquire(value.handle())
            }
        }

        impl From<$name> for $base {
            fn from(value: $name) -> Self {
                $base::from_raw($crate::InternalUse::Only, value.into_raw())
            }
        }
    };
}

pub(crate) use managed_class;

managed_class! {
    /// `System.Object`, the root every reference mirror converts to.
    pub struct Object = "System.Object";
}

managed_class! {
    pub struct ValueType = "System.ValueType": Object;
}

managed_class! {
    pub struct Enum = "System.Enum":
        ValueType, Object, IComparable, IFormattable, IConvertible;
}

managed_class! {
    pub struct Array = "System.Array": Object, IEnumerable;
}

managed_class! {
    pub struct String = "System.String":
        Object, IComparable, IConvertible, IEnumerable, IEquatableString;
}

managed_class! {
    pub struct Delegate = "System.Delegate": Object;
}

managed_class! {
    pub struct Exception = "System.Exception": Object;
}

managed_class! {
    pub struct NullReferenceException = "System.NullReferenceException":
        Exception, Object;
}

managed_class! {
    pub struct ArgumentException = "System.ArgumentException":
        Exception, Object;
}

managed_class! {
    pub struct InvalidOperationException = "System.InvalidOperationException":
        Exception, Object;
}

managed_class! {
    pub struct InvalidCastException = "System.InvalidCastException":
        Exception, Object;
}

managed_class! { pub struct IComparable = "System.IComparable": Object; }
managed_class! { pub struct IFormattable = "System.IFormattable": Object; }
managed_class! { pub struct IConvertible = "System.IConvertible": Object; }
managed_class! {
    pub struct IEnumerable = "System.Collections.IEnumerable": Object;
}

// One mirror per instantiation of `IEquatable<T>`.
managed_class! { pub struct IEquatableBoolean = "System.IEquatable`1[System.Boolean]": Object; }
managed_class! { pub struct IEquatableChar = "System.IEquatable`1[System.Char]": Object; }
managed_class! { pub struct IEquatableSByte = "System.IEquatable`1[System.SByte]": Object; }
managed_class! { pub struct IEquatableByte = "System.IEquatable`1[System.Byte]": Object; }
managed_class! { pub struct IEquatableInt16 = "System.IEquatable`1[System.Int16]": Object; }
managed_class! { pub struct IEquatableUInt16 = "System.IEquatable`1[System.UInt16]": Object; }
managed_class! { pub struct IEquatableInt32 = "System.IEquatable`1[System.Int32]": Object; }
managed_class! { pub struct IEquatableUInt32 = "System.IEquatable`1[System.UInt32]": Object; }
managed_class! { pub struct IEquatableInt64 = "System.IEquatable`1[System.Int64]": Object; }
managed_class! { pub struct IEquatableUInt64 = "System.IEquatable`1[System.UInt64]": Object; }
managed_class! { pub struct IEquatableSingle = "System.IEquatable`1[System.Single]": Object; }
managed_class! { pub struct IEquatableDouble = "System.IEquatable`1[System.Double]": Object; }
managed_class! { pub struct IEquatableString = "System.IEquatable`1[System.String]": Object; }
managed_class! { pub struct IEquatableVector3 = "System.IEquatable`1[UnityEngine.Vector3]": Object; }

impl Object {
    pub fn to_managed_string(&self) -> Result<String> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.object_to_string)(self.handle) }
        })?;
        Ok(String::adopt(&context, handle))
    }

    pub fn get_hash_code(&self) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: see above
            unsafe { (context.generated.object_get_hash_code)(self.handle) }
        })
    }

    /// Managed `Equals`, which may be overridden to compare by value.
    pub fn equals(&self, other: &Object) -> Result<bool> {
        let context = current()?;
        let equal = context.call(|context| {
            // SAFETY: see above
            unsafe {
                (context.generated.object_equals)(self.handle, other.handle)
            }
        })?;
        Ok(equal != 0)
    }
}

impl String {
    pub fn new(value: &str) -> Result<Self> {
        let context = current()?;
        let len = i32::try_from(value.len()).map_err(|_| {
            BridgeError::native(format!(
                "string of {} bytes does not fit a managed string",
                value.len()
            ))
        })?;
        let handle = context.call(|context| {
            // SAFETY: `value` is valid for `len` bytes during the call
            unsafe { (context.core.string_new)(value.as_ptr(), len) }
        })?;
        if handle == NULL_HANDLE {
            return Err(BridgeError::NullHandle("StringNew"));
        }
        Ok(Self::adopt(&context, handle))
    }

    /// Length in UTF-16 code units, as the managed side counts it.
    pub fn len(&self) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.string_get_length)(self.handle) }
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn concat(&self, other: &String) -> Result<String> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: see above
            unsafe {
                (context.generated.string_concat)(self.handle, other.handle)
            }
        })?;
        Ok(Self::adopt(&context, handle))
    }

    /// Copies the contents out as UTF-8.
    pub fn to_rust_string(&self) -> Result<std::string::String> {
        let context = current()?;
        let required = context.call(|context| {
            // SAFETY: a null buffer only asks for the required length
            unsafe {
                (context.generated.string_copy_utf8)(self.handle, core::ptr::null_mut(), 0)
            }
        })?;
        let mut buffer = vec![0u8; required.max(0) as usize];
        let written = context.call(|context| {
            // SAFETY: buffer holds `required` writable bytes
            unsafe {
                (context.generated.string_copy_utf8)(self.handle, buffer.as_mut_ptr(), required)
            }
        })?;
        buffer.truncate(written.clamp(0, required.max(0)) as usize);
        std::string::String::from_utf8(buffer).map_err(|error| {
            BridgeError::native(format!("managed string is not UTF-8: {error}"))
        })
    }
}

impl Exception {
    pub fn message(&self) -> Result<String> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.exception_get_message)(self.handle) }
        })?;
        Ok(String::adopt(&context, handle))
    }
}

macro_rules! exception_class {
    ($name:ident, $variant:ident, $constructor:ident) => {
        impl $name {
            pub fn new(message: &String) -> Result<Self> {
                let context = current()?;
                let handle = context.call(|context| {
                    // SAFETY: table entries were validated at init
                    unsafe { (context.generated.$constructor)(message.handle()) }
                })?;
                if handle == NULL_HANDLE {
                    return Err(BridgeError::NullHandle(stringify!($constructor)));
                }
                Ok(Self::adopt(&context, handle))
            }

            pub fn with_message(message: &str) -> Result<Self> {
                Self::new(&String::new(message)?)
            }
        }

        impl From<$name> for ManagedException {
            fn from(exception: $name) -> Self {
                ManagedException::$variant(exception)
            }
        }

        impl From<$name> for BridgeError {
            fn from(exception: $name) -> Self {
                BridgeError::Managed(exception.into())
            }
        }
    };
}

exception_class!(Exception, Exception, exception_new);
exception_class!(NullReferenceException, NullReference, null_reference_exception_new);
exception_class!(ArgumentException, Argument, argument_exception_new);
exception_class!(
    InvalidOperationException,
    InvalidOperation,
    invalid_operation_exception_new
);
exception_class!(InvalidCastException, InvalidCast, invalid_cast_exception_new);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExceptionClass, NULL, host};

    #[test]
    fn conversions_share_the_handle() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let text = String::new("shared").expect("string");
        let handle = text.handle();
        assert_eq!(context.objects.count(handle), 1);

        let object = Object::from(&text);
        assert_eq!(object.handle(), handle);
        assert_eq!(context.objects.count(handle), 2);

        let comparable: IComparable = text.into();
        assert_eq!(comparable.handle(), handle);
        assert_eq!(context.objects.count(handle), 2, "move transfers");

        drop(object);
        drop(comparable);
        assert_eq!(context.objects.count(handle), 0);
        assert_eq!(host::released_objects(), vec![handle]);
    }

    #[test]
    fn null_mirrors_compare_equal_to_null_and_touch_nothing() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let text = String::null();
        assert!(text == NULL);
        assert!(NULL == text);
        let object = Object::from(&text);
        let copy = object.clone();
        assert!(copy.is_null());
        assert_eq!(context.objects.live(), 0);
        drop((object, copy));
        assert!(host::released_objects().is_empty());
    }

    #[test]
    fn derived_mirrors_reach_base_methods_through_deref() {
        let _session = host::boot_default();

        let text = String::new("abc").expect("string");
        let printed = text.to_managed_string().expect("ToString");
        assert_eq!(printed.to_rust_string().expect("utf8"), "abc");
        assert_eq!(text.len().expect("length"), 3);

        let other = String::new("abc").expect("string");
        assert!(text.equals(&Object::from(&other)).expect("Equals"));
        assert_eq!(
            text.get_hash_code().expect("hash"),
            other.get_hash_code().expect("hash")
        );
    }

    #[test]
    fn strings_survive_non_ascii_round_trips() {
        let _session = host::boot_default();

        let left = String::new("grüße, ").expect("string");
        let right = String::new("世界").expect("string");
        let joined = left.concat(&right).expect("Concat");
        assert_eq!(joined.to_rust_string().expect("utf8"), "grüße, 世界");
        assert_eq!(joined.len().expect("length"), 9);
        assert!(!joined.is_empty().expect("length"));
    }

    #[test]
    fn exceptions_carry_their_message_and_class() {
        let _session = host::boot_default();

        let error: BridgeError = ArgumentException::with_message("bad value")
            .expect("constructed")
            .into();
        let exception = error.managed().expect("managed");
        assert_eq!(exception.class(), ExceptionClass::Argument);
        assert_eq!(exception.message().expect("message"), "bad value");
        assert_eq!(
            exception.to_string(),
            format!("System.ArgumentException (handle {})", exception.handle())
        );
    }
}
