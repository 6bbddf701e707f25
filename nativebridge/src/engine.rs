//! Engine value types: a POD struct, an enum, an opaque value type with
//! its own handle space, and a static class.

use core::ops::{Add, Mul, Neg, Sub};

use crate::{
    BridgeContext, BridgeError, Handle, NULL_HANDLE, Result, current,
    primitives::{Boxable, boxed},
    system::{
        IComparable, IConvertible, IEquatableVector3, IFormattable, Object,
        ValueType, managed_class,
    },
};

/// `UnityEngine.Vector3`. Same layout as the managed struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);
    pub const ONE: Vector3 = Vector3::new(1.0, 1.0, 1.0);
    pub const UP: Vector3 = Vector3::new(0.0, 1.0, 0.0);
    pub const DOWN: Vector3 = Vector3::new(0.0, -1.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Vector3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn sqr_magnitude(self) -> f32 {
        self.dot(self)
    }

    /// `magnitude` as computed by the managed property.
    pub fn magnitude(&self) -> Result<f32> {
        let context = current()?;
        let mut value = *self;
        context.call(|context| {
            // SAFETY: `value` outlives the call
            unsafe { (context.generated.vector3_get_magnitude)(&mut value) }
        })
    }

    /// The managed `op_Addition`.
    pub fn managed_add(&self, other: &Vector3) -> Result<Vector3> {
        let context = current()?;
        let (mut left, mut right) = (*self, *other);
        let mut sum = Vector3::ZERO;
        context.call(|context| {
            // SAFETY: all three outlive the call
            unsafe {
                (context.generated.vector3_op_addition)(&mut left, &mut right, &mut sum)
            }
        })?;
        Ok(sum)
    }
}

impl Add for Vector3 {
    type Output = Vector3;

    fn add(self, other: Vector3) -> Vector3 {
        Vector3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vector3 {
    type Output = Vector3;

    fn sub(self, other: Vector3) -> Vector3 {
        Vector3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f32> for Vector3 {
    type Output = Vector3;

    fn mul(self, scale: f32) -> Vector3 {
        Vector3::new(self.x * scale, self.y * scale, self.z * scale)
    }
}

impl Neg for Vector3 {
    type Output = Vector3;

    fn neg(self) -> Vector3 {
        Vector3::new(-self.x, -self.y, -self.z)
    }
}

impl Boxable for Vector3 {
    fn box_raw(self, context: &BridgeContext) -> Handle {
        let mut value = self;
        // SAFETY: boxed by reference, `value` outlives the call
        unsafe { (context.generated.box_vector3)(&mut value) }
    }
}

impl TryFrom<Vector3> for Object {
    type Error = BridgeError;

    fn try_from(value: Vector3) -> Result<Self> {
        boxed(value)
    }
}

impl TryFrom<Vector3> for ValueType {
    type Error = BridgeError;

    fn try_from(value: Vector3) -> Result<Self> {
        boxed(value)
    }
}

impl TryFrom<Vector3> for IEquatableVector3 {
    type Error = BridgeError;

    fn try_from(value: Vector3) -> Result<Self> {
        boxed(value)
    }
}

impl TryFrom<&Object> for Vector3 {
    type Error = BridgeError;

    fn try_from(object: &Object) -> Result<Self> {
        let context = current()?;
        let mut value = Vector3::ZERO;
        context.call(|context| {
            // SAFETY: `value` outlives the call
            unsafe { (context.generated.unbox_vector3)(object.handle(), &mut value) }
        })?;
        Ok(value)
    }
}

/// `System.DayOfWeek`, an enum over `int32`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayOfWeek(pub i32);

impl DayOfWeek {
    pub const SUNDAY: DayOfWeek = DayOfWeek(0);
    pub const MONDAY: DayOfWeek = DayOfWeek(1);
    pub const TUESDAY: DayOfWeek = DayOfWeek(2);
    pub const WEDNESDAY: DayOfWeek = DayOfWeek(3);
    pub const THURSDAY: DayOfWeek = DayOfWeek(4);
    pub const FRIDAY: DayOfWeek = DayOfWeek(5);
    pub const SATURDAY: DayOfWeek = DayOfWeek(6);
}

impl From<i32> for DayOfWeek {
    fn from(value: i32) -> Self {
        DayOfWeek(value)
    }
}

impl From<DayOfWeek> for i32 {
    fn from(value: DayOfWeek) -> Self {
        value.0
    }
}

impl Boxable for DayOfWeek {
    fn box_raw(self, context: &BridgeContext) -> Handle {
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.box_day_of_week)(self.0) }
    }
}

macro_rules! enum_bases {
    ($value:ident: $($base:ident),*) => {
        $(
            impl TryFrom<$value> for $base {
                type Error = BridgeError;

                fn try_from(value: $value) -> Result<Self> {
                    boxed(value)
                }
            }
        )*
    };
}

enum_bases!(DayOfWeek: Object, ValueType, IComparable, IFormattable, IConvertible);

impl TryFrom<DayOfWeek> for crate::system::Enum {
    type Error = BridgeError;

    fn try_from(value: DayOfWeek) -> Result<Self> {
        boxed(value)
    }
}

impl TryFrom<&Object> for DayOfWeek {
    type Error = BridgeError;

    fn try_from(object: &Object) -> Result<Self> {
        let context = current()?;
        let value = context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.unbox_day_of_week)(object.handle()) }
        })?;
        Ok(DayOfWeek(value))
    }
}

pub(crate) fn release_raycast_hit(context: &BridgeContext, handle: Handle) {
    context.raycast_hits.dereference(handle);
}

managed_class! {
    /// `UnityEngine.RaycastHit`. The managed struct holds an internal
    /// pointer, so it crosses as a handle in its own space.
    pub struct RaycastHit = "UnityEngine.RaycastHit"
        in raycast_hits release crate::engine::release_raycast_hit;
}

impl RaycastHit {
    pub fn distance(&self) -> Result<f32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.raycast_hit_get_distance)(self.handle()) }
        })
    }

    pub fn point(&self) -> Result<Vector3> {
        let context = current()?;
        let mut point = Vector3::ZERO;
        context.call(|context| {
            // SAFETY: `point` outlives the call
            unsafe {
                (context.generated.raycast_hit_get_point)(self.handle(), &mut point)
            }
        })?;
        Ok(point)
    }
}

impl TryFrom<&RaycastHit> for Object {
    type Error = BridgeError;

    fn try_from(hit: &RaycastHit) -> Result<Self> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.box_raycast_hit)(hit.handle()) }
        })?;
        Ok(Object::adopt(&context, handle))
    }
}

impl TryFrom<&Object> for RaycastHit {
    type Error = BridgeError;

    fn try_from(object: &Object) -> Result<Self> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: see above
            unsafe { (context.generated.unbox_raycast_hit)(object.handle()) }
        })?;
        Ok(RaycastHit::adopt(&context, handle))
    }
}

/// `UnityEngine.Physics`.
#[derive(Debug)]
pub struct Physics;

impl Physics {
    /// Casts a ray and returns the first hit, if any.
    pub fn raycast(origin: Vector3, direction: Vector3) -> Result<Option<RaycastHit>> {
        let context = current()?;
        let (mut origin, mut direction) = (origin, direction);
        let mut hit = NULL_HANDLE;
        let found = context.call(|context| {
            // SAFETY: all three outlive the call
            unsafe {
                (context.generated.physics_raycast)(&mut origin, &mut direction, &mut hit)
            }
        })?;
        if found == 0 || hit == NULL_HANDLE {
            return Ok(None);
        }
        Ok(Some(RaycastHit::adopt(&context, hit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExceptionClass, host};

    #[test]
    fn vector3_matches_the_managed_layout() {
        assert_eq!(size_of::<Vector3>(), 12);
        assert_eq!(align_of::<Vector3>(), 4);
        assert_eq!(core::mem::offset_of!(Vector3, z), 8);
    }

    #[test]
    fn vector3_boxes_by_reference_and_unboxes_bit_for_bit() {
        let _session = host::boot_default();

        let value = Vector3::new(1.25, -0.0, f32::MAX);
        let object = Object::try_from(value).expect("box");
        let back = Vector3::try_from(&object).expect("unbox");
        assert_eq!(back.x.to_bits(), value.x.to_bits());
        assert_eq!(back.y.to_bits(), value.y.to_bits());
        assert_eq!(back.z.to_bits(), value.z.to_bits());
    }

    #[test]
    fn managed_vector_math_agrees_with_native() {
        let _session = host::boot_default();

        let a = Vector3::new(3.0, 0.0, 4.0);
        let b = Vector3::new(-1.0, 2.0, 0.5);
        assert_eq!(a.magnitude().expect("magnitude"), 5.0);
        assert_eq!(a.managed_add(&b).expect("op_Addition"), a + b);
    }

    #[test]
    fn enum_boxes_through_its_underlying_integer() {
        let _session = host::boot_default();

        let object = Object::try_from(DayOfWeek::FRIDAY).expect("box");
        assert_eq!(DayOfWeek::try_from(&object).expect("unbox"), DayOfWeek::FRIDAY);
        assert_eq!(
            object.to_managed_string().expect("ToString").to_rust_string().expect("utf8"),
            "Friday"
        );
    }

    #[test]
    fn raycast_hits_live_in_their_own_handle_space() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let hit = Physics::raycast(Vector3::new(0.0, 10.0, 0.0), Vector3::DOWN)
            .expect("raycast")
            .expect("hits the ground");
        assert_eq!(hit.distance().expect("distance"), 10.0);
        assert_eq!(hit.point().expect("point"), Vector3::ZERO);
        assert_eq!(context.raycast_hits.count(hit.handle()), 1);
        assert_eq!(context.objects.live(), 0);

        let object = Object::try_from(&hit).expect("box");
        let unboxed = RaycastHit::try_from(&object).expect("unbox");
        assert_eq!(unboxed.distance().expect("distance"), 10.0);

        let handle = hit.handle();
        drop(hit);
        assert_eq!(host::released_raycast_hits(), vec![handle]);
        assert!(host::released_objects().is_empty());

        let miss = Physics::raycast(Vector3::new(0.0, 10.0, 0.0), Vector3::UP)
            .expect("raycast");
        assert!(miss.is_none());
    }

    #[test]
    fn unboxing_a_raycast_hit_from_a_vector_fails() {
        let _session = host::boot_default();

        let object = Object::try_from(Vector3::ONE).expect("box");
        let error = RaycastHit::try_from(&object).expect_err("wrong type");
        assert_eq!(
            error.managed().map(|exception| exception.class()),
            Some(ExceptionClass::InvalidCast)
        );
    }
}
