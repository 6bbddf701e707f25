//! Mirrored primitives.
//!
//! Each one is a transparent wrapper over the host's integer or float of
//! the documented width. Conversions to and from the machine type are
//! free. Conversions to a managed base box through a trampoline and are
//! therefore fallible, as is unboxing from an [`Object`].

use crate::{
    BridgeError, Result, current,
    system::{
        IComparable, IConvertible, IEquatableBoolean, IEquatableByte,
        IEquatableChar, IEquatableDouble, IEquatableInt16, IEquatableInt32,
        IEquatableInt64, IEquatableSByte, IEquatableSingle, IEquatableUInt16,
        IEquatableUInt32, IEquatableUInt64, IFormattable, Mirror, Object,
        ValueType,
    },
};

macro_rules! primitive {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty), $boxer:ident, $unboxer:ident: $($base:ident),*
    ) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
        pub struct $name(pub $repr);

        impl From<$repr> for $name {
            #[inline]
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $repr {
            #[inline]
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl $name {
            /// Boxes the value into a new managed object.
            pub fn to_object(self) -> Result<Object> {
                boxed(self)
            }
        }

        impl Boxable for $name {
            fn box_raw(self, context: &$crate::BridgeContext) -> $crate::Handle {
                // SAFETY: table entries were validated at init
                unsafe { (context.generated.$boxer)(self.0) }
            }
        }

        impl TryFrom<$name> for Object {
            type Error = BridgeError;

            fn try_from(value: $name) -> Result<Self> {
                boxed(value)
            }
        }

        $(
            impl TryFrom<$name> for $base {
                type Error = BridgeError;

                fn try_from(value: $name) -> Result<Self> {
                    boxed(value)
                }
            }
        )*

        impl TryFrom<&Object> for $name {
            type Error = BridgeError;

            fn try_from(object: &Object) -> Result<Self> {
                let context = current()?;
                let value = context.call(|context| {
                    // SAFETY: see above
                    unsafe { (context.generated.$unboxer)(object.handle()) }
                })?;
                Ok(Self(value))
            }
        }
    };
}

/// A value type that has a `Box` trampoline.
pub trait Boxable: Copy {
    /// Calls the trampoline. The caller checks for an exception and takes
    /// the reference.
    fn box_raw(self, context: &crate::BridgeContext) -> crate::Handle;
}

/// Boxes `value` and adopts the result as mirror `M`. Every boxed value
/// is an `Object`, so any base of the value's type shares the new handle.
pub fn boxed<V: Boxable, M: Mirror>(value: V) -> Result<M> {
    let context = current()?;
    let handle = context.call(|context| value.box_raw(context))?;
    Ok(M::acquire(handle))
}

primitive! {
    /// `System.Boolean`, 32 bits wide on the wire.
    Boolean(u32), box_boolean, unbox_boolean:
        ValueType, IComparable, IConvertible, IEquatableBoolean
}

primitive! {
    /// `System.Char`, one UTF-16 code unit.
    Char(u16), box_char, unbox_char:
        ValueType, IComparable, IConvertible, IEquatableChar
}

primitive! {
    SByte(i8), box_sbyte, unbox_sbyte:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableSByte
}

primitive! {
    Byte(u8), box_byte, unbox_byte:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableByte
}

primitive! {
    Int16(i16), box_int16, unbox_int16:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableInt16
}

primitive! {
    UInt16(u16), box_uint16, unbox_uint16:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableUInt16
}

primitive! {
    Int32(i32), box_int32, unbox_int32:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableInt32
}

primitive! {
    UInt32(u32), box_uint32, unbox_uint32:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableUInt32
}

primitive! {
    Int64(i64), box_int64, unbox_int64:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableInt64
}

primitive! {
    UInt64(u64), box_uint64, unbox_uint64:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableUInt64
}

primitive! {
    /// IEEE 754 binary32.
    Single(f32), box_single, unbox_single:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableSingle
}

primitive! {
    /// IEEE 754 binary64.
    Double(f64), box_double, unbox_double:
        ValueType, IComparable, IFormattable, IConvertible, IEquatableDouble
}

impl Boolean {
    pub const FALSE: Boolean = Boolean(0);
    pub const TRUE: Boolean = Boolean(1);

    /// Any non-zero value is true, as on the managed side.
    pub fn as_bool(self) -> bool {
        self.0 != 0
    }
}

impl From<bool> for Boolean {
    fn from(value: bool) -> Self {
        Boolean(value as u32)
    }
}

impl From<Boolean> for bool {
    fn from(value: Boolean) -> Self {
        value.as_bool()
    }
}

impl Char {
    /// `None` for characters outside the basic multilingual plane.
    pub fn from_char(value: char) -> Option<Self> {
        let mut units = [0u16; 2];
        match value.encode_utf16(&mut units) {
            [unit] => Some(Char(*unit)),
            _ => None,
        }
    }

    pub fn to_char(self) -> Option<char> {
        char::from_u32(self.0 as u32)
    }
}
