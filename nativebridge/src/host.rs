//! A managed runtime in miniature that plays the managed side of the
//! bridge in-process.
//!
//! It owns a heap of managed values that is never collected, one handle
//! space per kind with free lists and identity dedupe, the managed
//! exception slot and the full managed function tables. All state is
//! thread-local. The host's `RefCell` is never borrowed across a call into
//! native code, because native code calls straight back.

use core::mem::MaybeUninit;
use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::HashMap;

use thiserror::Error;

use crate::{
    Capacities, CoreFunctions, ExceptionClass, GeneratedFunctions, Handle,
    InitMode, MemoryCursor, NULL_HANDLE, NativeCoreFunctions,
    NativeGeneratedFunctions, SECTION_ALIGN, Vector3, required_memory_size_at, uninstall,
};

pub type ObjectId = usize;

/// The exported `Init` as the host calls it.
pub type InitFn = unsafe extern "C" fn(
    *mut u8,
    i32,
    u8,
    *mut NativeCoreFunctions,
    *mut NativeGeneratedFunctions,
);

/// A managed exception as the managed side sees it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}: {}", .class.managed_name(), .message)]
pub struct HostException {
    pub class: ExceptionClass,
    pub message: String,
    pub object: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Hit {
    distance: f32,
    point: Vector3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Boxed {
    Boolean(u32),
    Char(u16),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Vector3(Vector3),
    DayOfWeek(i32),
    RaycastHit(Hit),
}

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

impl Boxed {
    fn type_name(&self) -> &'static str {
        match self {
            Boxed::Boolean(_) => "System.Boolean",
            Boxed::Char(_) => "System.Char",
            Boxed::SByte(_) => "System.SByte",
            Boxed::Byte(_) => "System.Byte",
            Boxed::Int16(_) => "System.Int16",
            Boxed::UInt16(_) => "System.UInt16",
            Boxed::Int32(_) => "System.Int32",
            Boxed::UInt32(_) => "System.UInt32",
            Boxed::Int64(_) => "System.Int64",
            Boxed::UInt64(_) => "System.UInt64",
            Boxed::Single(_) => "System.Single",
            Boxed::Double(_) => "System.Double",
            Boxed::Vector3(_) => "UnityEngine.Vector3",
            Boxed::DayOfWeek(_) => "System.DayOfWeek",
            Boxed::RaycastHit(_) => "UnityEngine.RaycastHit",
        }
    }

    fn display(&self) -> String {
        match *self {
            Boxed::Boolean(value) => {
                if value != 0 { "True" } else { "False" }.to_owned()
            }
            Boxed::Char(value) => char::from_u32(value as u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
                .to_string(),
            Boxed::SByte(value) => value.to_string(),
            Boxed::Byte(value) => value.to_string(),
            Boxed::Int16(value) => value.to_string(),
            Boxed::UInt16(value) => value.to_string(),
            Boxed::Int32(value) => value.to_string(),
            Boxed::UInt32(value) => value.to_string(),
            Boxed::Int64(value) => value.to_string(),
            Boxed::UInt64(value) => value.to_string(),
            Boxed::Single(value) => value.to_string(),
            Boxed::Double(value) => value.to_string(),
            Boxed::Vector3(v) => format!("({:.2}, {:.2}, {:.2})", v.x, v.y, v.z),
            Boxed::DayOfWeek(value) => usize::try_from(value)
                .ok()
                .and_then(|day| DAY_NAMES.get(day))
                .map_or_else(|| value.to_string(), |name| (*name).to_owned()),
            Boxed::RaycastHit(_) => "UnityEngine.RaycastHit".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Native { class: ObjectId },
    Log(String),
    Throw(ObjectId),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Exception { class: ExceptionClass, message: String },
    Boxed(Boxed),
    Int32Array(Vec<i32>),
    Single2Array { lengths: [i32; 2], items: Vec<f32> },
    StringArray(Vec<Option<ObjectId>>),
    StringList(Vec<Option<ObjectId>>),
    Delegate(Vec<Target>),
    ActionClass { cpp_handle: i32 },
    BaseScript { cpp_handle: i32, updates: u32 },
    RaycastHit(Hit),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "System.String",
            Value::Exception { class, .. } => class.managed_name(),
            Value::Boxed(boxed) => boxed.type_name(),
            Value::Int32Array(_) => "System.Int32[]",
            Value::Single2Array { .. } => "System.Single[,]",
            Value::StringArray(_) => "System.String[]",
            Value::StringList(_) => "System.Collections.Generic.List`1[System.String]",
            Value::Delegate(_) => "System.Action",
            Value::ActionClass { .. } => "NativeAction",
            Value::BaseScript { .. } => "BaseScript",
            Value::RaycastHit(_) => "UnityEngine.RaycastHit",
        }
    }
}

/// A managed exception on its way out of a managed call.
#[derive(Debug)]
enum Thrown {
    New { class: ExceptionClass, message: String },
    Object(ObjectId),
}

type Managed<T> = std::result::Result<T, Thrown>;

fn throw<T>(class: ExceptionClass, message: impl Into<String>) -> Managed<T> {
    Err(Thrown::New {
        class,
        message: message.into(),
    })
}

fn null_reference<T>() -> Managed<T> {
    throw(
        ExceptionClass::NullReference,
        "Object reference not set to an instance of an object.",
    )
}

fn invalid_cast<T>(value: &Value, to: &str) -> Managed<T> {
    throw(
        ExceptionClass::InvalidCast,
        format!("Unable to cast object of type '{}' to type '{to}'.", value.type_name()),
    )
}

fn index_out_of_range<T>() -> Managed<T> {
    throw(
        ExceptionClass::Exception,
        "Index was outside the bounds of the array.",
    )
}

fn check_index(index: i32, len: usize) -> Managed<usize> {
    match usize::try_from(index) {
        Ok(index) if index < len => Ok(index),
        _ => index_out_of_range(),
    }
}

/// Handles of one kind. Handles are dense, `0` is never handed out, and a
/// live object has at most one handle per space.
#[derive(Debug)]
struct HandleSpace {
    name: &'static str,
    capacity: usize,
    slots: Vec<Option<ObjectId>>,
    free: Vec<Handle>,
    by_object: HashMap<ObjectId, Handle>,
    released: Vec<Handle>,
}

impl HandleSpace {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            slots: vec![None],
            free: Vec::new(),
            by_object: HashMap::new(),
            released: Vec::new(),
        }
    }

    fn handle_for(&mut self, object: ObjectId) -> Handle {
        if let Some(&handle) = self.by_object.get(&object) {
            return handle;
        }
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                let handle = self.slots.len();
                assert!(
                    handle < self.capacity,
                    "{}: all {} handles in use",
                    self.name,
                    self.capacity
                );
                self.slots.push(None);
                handle as Handle
            }
        };
        self.slots[handle as usize] = Some(object);
        self.by_object.insert(object, handle);
        handle
    }

    fn object(&self, handle: Handle) -> Option<ObjectId> {
        usize::try_from(handle)
            .ok()
            .and_then(|index| self.slots.get(index))
            .copied()
            .flatten()
    }

    /// Recycles `handle` without recording it in the release log.
    fn free(&mut self, handle: Handle) -> Option<ObjectId> {
        if handle == NULL_HANDLE {
            return None;
        }
        let object = usize::try_from(handle)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::take);
        match object {
            Some(object) => {
                self.by_object.remove(&object);
                self.free.push(handle);
            }
            None => log::error!("{}: release of unallocated handle {handle}", self.name),
        }
        object
    }

    fn release(&mut self, handle: Handle) {
        if self.free(handle).is_some() {
            self.released.push(handle);
        }
    }

    fn live(&self) -> usize {
        self.by_object.len()
    }
}

/// The region lent to the plugin, 16-byte aligned.
/// Zeroed memory lent to the plugin, starting `skew` bytes past a 16-byte
/// boundary.
struct Region {
    base: NonNull<u8>,
    skew: usize,
    layout: Layout,
}

impl Region {
    fn new(size: usize, skew: usize) -> Self {
        let skew = skew % SECTION_ALIGN;
        let layout = Layout::from_size_align((size + skew).max(1), SECTION_ALIGN)
            .unwrap_or_else(|error| panic!("region of {size} bytes: {error}"));
        // SAFETY: the layout has a non-zero size
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { base, skew, layout }
    }

    fn start(&self) -> *mut u8 {
        // SAFETY: `skew` is inside the allocation
        unsafe { self.base.as_ptr().add(self.skew) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `Region::new` with this layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Where `Init` writes the native tables. Boxed so the address survives
/// the host being moved.
struct NativeOut {
    core: MaybeUninit<NativeCoreFunctions>,
    generated: MaybeUninit<NativeGeneratedFunctions>,
}

struct Host {
    heap: Vec<Value>,
    objects: HandleSpace,
    raycast_hits: HandleSpace,
    action_classes: HandleSpace,
    exception: Option<ObjectId>,
    native: Box<NativeOut>,
    region: Region,
    size: usize,
    released_base_scripts: Vec<Handle>,
    invocations: Vec<String>,
    fail_next_constructor: Option<ExceptionClass>,
}

thread_local! {
    static HOST: RefCell<Option<Host>> = const { RefCell::new(None) };
}

fn with_host<R>(f: impl FnOnce(&mut Host) -> R) -> R {
    HOST.with(|host| {
        let mut host = host.borrow_mut();
        f(host.as_mut().expect("managed host is not booted"))
    })
}

impl Host {
    fn new(region: Region, size: usize, capacities: &Capacities) -> Self {
        Self {
            heap: Vec::new(),
            objects: HandleSpace::new("objects", capacities.managed_objects),
            raycast_hits: HandleSpace::new("raycast hits", capacities.raycast_hits),
            action_classes: HandleSpace::new("action classes", capacities.actions),
            exception: None,
            native: Box::new(NativeOut {
                core: MaybeUninit::uninit(),
                generated: MaybeUninit::uninit(),
            }),
            region,
            size,
            released_base_scripts: Vec::new(),
            invocations: Vec::new(),
            fail_next_constructor: None,
        }
    }

    fn init_arguments(
        &mut self,
    ) -> (*mut u8, i32, *mut NativeCoreFunctions, *mut NativeGeneratedFunctions) {
        (
            self.region.start(),
            self.size.min(i32::MAX as usize) as i32,
            self.native.core.as_mut_ptr(),
            self.native.generated.as_mut_ptr(),
        )
    }

    fn native_core(&self) -> NativeCoreFunctions {
        // SAFETY: `Init` fills the out-tables before it calls into the
        // managed side, and nothing native runs before `Init`
        unsafe { self.native.core.assume_init_read() }
    }

    fn native_generated(&self) -> NativeGeneratedFunctions {
        // SAFETY: see above
        unsafe { self.native.generated.assume_init_read() }
    }

    fn alloc(&mut self, value: Value) -> ObjectId {
        self.heap.push(value);
        self.heap.len() - 1
    }

    fn new_handle(&mut self, value: Value) -> Handle {
        let object = self.alloc(value);
        self.objects.handle_for(object)
    }

    fn target(&self, handle: Handle) -> Managed<ObjectId> {
        if handle == NULL_HANDLE {
            return null_reference();
        }
        match self.objects.object(handle) {
            Some(object) => Ok(object),
            None => throw(
                ExceptionClass::InvalidOperation,
                format!("handle {handle} does not name a live object"),
            ),
        }
    }

    fn value(&self, handle: Handle) -> Managed<&Value> {
        let object = self.target(handle)?;
        Ok(&self.heap[object])
    }

    fn value_mut(&mut self, handle: Handle) -> Managed<&mut Value> {
        let object = self.target(handle)?;
        Ok(&mut self.heap[object])
    }

    fn text(&self, handle: Handle) -> Managed<String> {
        match self.value(handle)? {
            Value::Str(text) => Ok(text.clone()),
            other => invalid_cast(other, "System.String"),
        }
    }

    /// `null` reads as the empty string, as in `String.Concat`.
    fn text_or_empty(&self, handle: Handle) -> Managed<String> {
        if handle == NULL_HANDLE {
            return Ok(String::new());
        }
        self.text(handle)
    }

    fn hit(&self, handle: Handle) -> Managed<Hit> {
        if handle == NULL_HANDLE {
            return null_reference();
        }
        let object = self.raycast_hits.object(handle).ok_or_else(|| Thrown::New {
            class: ExceptionClass::InvalidOperation,
            message: format!("raycast hit {handle} is not live"),
        })?;
        match &self.heap[object] {
            Value::RaycastHit(hit) => Ok(*hit),
            other => invalid_cast(other, "UnityEngine.RaycastHit"),
        }
    }

    fn display(&self, object: ObjectId) -> String {
        match &self.heap[object] {
            Value::Str(text) => text.clone(),
            Value::Exception { class, message } => {
                format!("{}: {message}", class.managed_name())
            }
            Value::Boxed(boxed) => boxed.display(),
            other => other.type_name().to_owned(),
        }
    }

    fn new_exception(&mut self, class: ExceptionClass, message: Handle) -> Managed<Handle> {
        let message = if message == NULL_HANDLE {
            format!("Exception of type '{}' was thrown.", class.managed_name())
        } else {
            self.text(message)?
        };
        Ok(self.new_handle(Value::Exception { class, message }))
    }

    fn resolve(&mut self, thrown: Thrown) -> ObjectId {
        match thrown {
            Thrown::New { class, message } => {
                self.alloc(Value::Exception { class, message })
            }
            Thrown::Object(object) => object,
        }
    }

    fn class_of(&self, object: ObjectId) -> ExceptionClass {
        match &self.heap[object] {
            Value::Exception { class, .. } => *class,
            _ => ExceptionClass::Exception,
        }
    }

    fn describe(&self, object: ObjectId) -> HostException {
        let message = match &self.heap[object] {
            Value::Exception { message, .. } => message.clone(),
            _ => self.display(object),
        };
        HostException {
            class: self.class_of(object),
            message,
            object,
        }
    }

    /// Handle and setter that raise `thrown` on the native side.
    fn prepare_throw(&mut self, thrown: Thrown) -> (unsafe extern "C" fn(Handle), Handle) {
        let object = self.resolve(thrown);
        let handle = self.objects.handle_for(object);
        (self.native_core().setter(self.class_of(object)), handle)
    }

    fn delegate_targets(&self, handle: Handle) -> Managed<Vec<Target>> {
        if handle == NULL_HANDLE {
            return Ok(Vec::new());
        }
        match self.value(handle)? {
            Value::Delegate(targets) => Ok(targets.clone()),
            other => invalid_cast(other, "System.Delegate"),
        }
    }

    fn companion(&self, handle: Handle) -> Managed<i32> {
        match self.value(handle)? {
            Value::BaseScript { cpp_handle, .. } => Ok(*cpp_handle),
            other => invalid_cast(other, "BaseScript"),
        }
    }
}

/// Runs a managed function body. A thrown exception is raised on the
/// native side after the host is released, and `T::default()` returned.
fn managed<T: Default>(body: impl FnOnce(&mut Host) -> Managed<T>) -> T {
    let outcome =
        with_host(|host| body(&mut *host).map_err(|thrown| host.prepare_throw(thrown)));
    match outcome {
        Ok(value) => value,
        Err((setter, handle)) => {
            // SAFETY: the native table was filled by `Init`
            unsafe { setter(handle) };
            T::default()
        }
    }
}

fn raise(thrown: Thrown) {
    let (setter, handle) = with_host(|host| host.prepare_throw(thrown));
    // SAFETY: see above
    unsafe { setter(handle) };
}

/// Takes the exception native code left in the managed slot.
fn native_exception() -> Managed<()> {
    match with_host(|host| host.exception.take()) {
        Some(object) => Err(Thrown::Object(object)),
        None => Ok(()),
    }
}

fn describe_thrown(thrown: Thrown) -> HostException {
    with_host(|host| {
        let object = host.resolve(thrown);
        host.describe(object)
    })
}

// Core table.

extern "C" fn release_object(handle: Handle) {
    with_host(|host| host.objects.release(handle));
}

unsafe extern "C" fn string_new(utf8: *const u8, len: i32) -> Handle {
    let bytes = match usize::try_from(len) {
        // SAFETY: the caller passes `len` readable bytes
        Ok(len) if !utf8.is_null() => unsafe { core::slice::from_raw_parts(utf8, len) },
        _ => &[],
    };
    let text = String::from_utf8_lossy(bytes).into_owned();
    managed(|host| Ok(host.new_handle(Value::Str(text))))
}

extern "C" fn set_exception(handle: Handle) {
    with_host(|host| match host.objects.object(handle) {
        Some(object) => host.exception = Some(object),
        None => log::error!("SetException with dead handle {handle}"),
    });
}

extern "C" fn array_get_length(handle: Handle) -> i32 {
    managed(|host| match host.value(handle)? {
        Value::Int32Array(items) => Ok(items.len() as i32),
        Value::Single2Array { items, .. } => Ok(items.len() as i32),
        Value::StringArray(items) => Ok(items.len() as i32),
        other => invalid_cast(other, "System.Array"),
    })
}

extern "C" fn array_get_rank(handle: Handle) -> i32 {
    managed(|host| match host.value(handle)? {
        Value::Int32Array(_) | Value::StringArray(_) => Ok(1),
        Value::Single2Array { .. } => Ok(2),
        other => invalid_cast(other, "System.Array"),
    })
}

extern "C" fn array_get_length_of_dimension(handle: Handle, dimension: i32) -> i32 {
    managed(|host| match (host.value(handle)?, dimension) {
        (Value::Int32Array(items), 0) => Ok(items.len() as i32),
        (Value::StringArray(items), 0) => Ok(items.len() as i32),
        (Value::Single2Array { lengths, .. }, 0 | 1) => Ok(lengths[dimension as usize]),
        (Value::Int32Array(_) | Value::StringArray(_) | Value::Single2Array { .. }, _) => {
            index_out_of_range()
        }
        (other, _) => invalid_cast(other, "System.Array"),
    })
}

// System.Object and System.String.

extern "C" fn object_to_string(handle: Handle) -> Handle {
    managed(|host| {
        let object = host.target(handle)?;
        if let Value::Str(_) = host.heap[object] {
            return Ok(host.objects.handle_for(object));
        }
        let text = host.display(object);
        Ok(host.new_handle(Value::Str(text)))
    })
}

fn fnv1a(text: &str) -> i32 {
    let mut hash = 0x811c_9dc5u32;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as i32
}

extern "C" fn object_get_hash_code(handle: Handle) -> i32 {
    managed(|host| {
        let object = host.target(handle)?;
        Ok(match &host.heap[object] {
            Value::Str(_) | Value::Boxed(_) => fnv1a(&host.display(object)),
            _ => object as i32,
        })
    })
}

extern "C" fn object_equals(handle: Handle, other: Handle) -> u32 {
    managed(|host| {
        let object = host.target(handle)?;
        let Some(other) = host.objects.object(other) else {
            return Ok(0);
        };
        let equal = match (&host.heap[object], &host.heap[other]) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Boxed(a), Value::Boxed(b)) => a == b,
            _ => object == other,
        };
        Ok(equal as u32)
    })
}

extern "C" fn string_get_length(handle: Handle) -> i32 {
    managed(|host| Ok(host.text(handle)?.encode_utf16().count() as i32))
}

extern "C" fn string_concat(left: Handle, right: Handle) -> Handle {
    managed(|host| {
        let text = host.text_or_empty(left)? + &host.text_or_empty(right)?;
        Ok(host.new_handle(Value::Str(text)))
    })
}

unsafe extern "C" fn string_copy_utf8(handle: Handle, buffer: *mut u8, capacity: i32) -> i32 {
    managed(|host| {
        let text = host.text(handle)?;
        let required = text.len();
        if !buffer.is_null() && usize::try_from(capacity).is_ok_and(|cap| cap >= required) {
            // SAFETY: the caller passes `capacity` writable bytes
            unsafe { core::ptr::copy_nonoverlapping(text.as_ptr(), buffer, required) };
        }
        Ok(required as i32)
    })
}

// Exceptions.

extern "C" fn exception_new(message: Handle) -> Handle {
    managed(|host| host.new_exception(ExceptionClass::Exception, message))
}

extern "C" fn null_reference_exception_new(message: Handle) -> Handle {
    managed(|host| host.new_exception(ExceptionClass::NullReference, message))
}

extern "C" fn argument_exception_new(message: Handle) -> Handle {
    managed(|host| host.new_exception(ExceptionClass::Argument, message))
}

extern "C" fn invalid_operation_exception_new(message: Handle) -> Handle {
    managed(|host| host.new_exception(ExceptionClass::InvalidOperation, message))
}

extern "C" fn invalid_cast_exception_new(message: Handle) -> Handle {
    managed(|host| host.new_exception(ExceptionClass::InvalidCast, message))
}

extern "C" fn exception_get_message(handle: Handle) -> Handle {
    managed(|host| match host.value(handle)? {
        Value::Exception { message, .. } => {
            let message = message.clone();
            Ok(host.new_handle(Value::Str(message)))
        }
        other => invalid_cast(other, "System.Exception"),
    })
}

// Boxing.

macro_rules! boxing {
    ($($boxer:ident, $unboxer:ident: $variant:ident($ty:ty);)*) => {
        $(
            extern "C" fn $boxer(value: $ty) -> Handle {
                managed(|host| Ok(host.new_handle(Value::Boxed(Boxed::$variant(value)))))
            }

            extern "C" fn $unboxer(handle: Handle) -> $ty {
                managed(|host| match host.value(handle)? {
                    Value::Boxed(Boxed::$variant(value)) => Ok(*value),
                    other => invalid_cast(other, stringify!($variant)),
                })
            }
        )*
    };
}

boxing! {
    box_boolean, unbox_boolean: Boolean(u32);
    box_char, unbox_char: Char(u16);
    box_sbyte, unbox_sbyte: SByte(i8);
    box_byte, unbox_byte: Byte(u8);
    box_int16, unbox_int16: Int16(i16);
    box_uint16, unbox_uint16: UInt16(u16);
    box_int32, unbox_int32: Int32(i32);
    box_uint32, unbox_uint32: UInt32(u32);
    box_int64, unbox_int64: Int64(i64);
    box_uint64, unbox_uint64: UInt64(u64);
    box_single, unbox_single: Single(f32);
    box_double, unbox_double: Double(f64);
    box_day_of_week, unbox_day_of_week: DayOfWeek(i32);
}

// UnityEngine.Vector3, RaycastHit and Physics.

unsafe extern "C" fn box_vector3(value: *mut Vector3) -> Handle {
    // SAFETY: boxed by reference from a live value
    let value = unsafe { *value };
    managed(|host| Ok(host.new_handle(Value::Boxed(Boxed::Vector3(value)))))
}

unsafe extern "C" fn unbox_vector3(handle: Handle, out: *mut Vector3) {
    managed(|host| match host.value(handle)? {
        Value::Boxed(Boxed::Vector3(value)) => {
            // SAFETY: the caller passes a writable out-parameter
            unsafe { out.write(*value) };
            Ok(())
        }
        other => invalid_cast(other, "UnityEngine.Vector3"),
    })
}

unsafe extern "C" fn vector3_get_magnitude(value: *mut Vector3) -> f32 {
    // SAFETY: passed by reference from a live value
    let value = unsafe { *value };
    value.sqr_magnitude().sqrt()
}

unsafe extern "C" fn vector3_op_addition(a: *mut Vector3, b: *mut Vector3, out: *mut Vector3) {
    // SAFETY: all three are live values passed by reference
    unsafe { out.write(*a + *b) };
}

extern "C" fn release_raycast_hit(handle: Handle) {
    with_host(|host| host.raycast_hits.release(handle));
}

extern "C" fn raycast_hit_get_distance(handle: Handle) -> f32 {
    managed(|host| Ok(host.hit(handle)?.distance))
}

unsafe extern "C" fn raycast_hit_get_point(handle: Handle, out: *mut Vector3) {
    managed(|host| {
        let hit = host.hit(handle)?;
        // SAFETY: the caller passes a writable out-parameter
        unsafe { out.write(hit.point) };
        Ok(())
    })
}

extern "C" fn box_raycast_hit(handle: Handle) -> Handle {
    managed(|host| {
        let hit = host.hit(handle)?;
        Ok(host.new_handle(Value::Boxed(Boxed::RaycastHit(hit))))
    })
}

extern "C" fn unbox_raycast_hit(handle: Handle) -> Handle {
    managed(|host| match host.value(handle)? {
        Value::Boxed(Boxed::RaycastHit(hit)) => {
            let hit = *hit;
            let object = host.alloc(Value::RaycastHit(hit));
            Ok(host.raycast_hits.handle_for(object))
        }
        other => invalid_cast(other, "UnityEngine.RaycastHit"),
    })
}

/// The scene is a ground plane at `y = 0`.
unsafe extern "C" fn physics_raycast(
    origin: *mut Vector3,
    direction: *mut Vector3,
    out: *mut Handle,
) -> u32 {
    // SAFETY: all three are live values passed by reference
    let (origin, direction) = unsafe { (*origin, *direction) };
    // SAFETY: see above
    unsafe { out.write(NULL_HANDLE) };
    if direction.y >= 0.0 || origin.y < 0.0 {
        return 0;
    }
    let t = origin.y / -direction.y;
    let hit = Hit {
        distance: t * direction.sqr_magnitude().sqrt(),
        point: origin + direction * t,
    };
    let handle = managed(|host| {
        let object = host.alloc(Value::RaycastHit(hit));
        Ok(host.raycast_hits.handle_for(object))
    });
    // SAFETY: see above
    unsafe { out.write(handle) };
    1
}

// Arrays.

extern "C" fn array_int32_new(len: i32) -> Handle {
    managed(|host| match usize::try_from(len) {
        Ok(len) => Ok(host.new_handle(Value::Int32Array(vec![0; len]))),
        Err(_) => throw(ExceptionClass::Exception, "Arithmetic operation resulted in an overflow."),
    })
}

extern "C" fn array_int32_get_item(handle: Handle, index: i32) -> i32 {
    managed(|host| match host.value(handle)? {
        Value::Int32Array(items) => Ok(items[check_index(index, items.len())?]),
        other => invalid_cast(other, "System.Int32[]"),
    })
}

extern "C" fn array_int32_set_item(handle: Handle, index: i32, value: i32) {
    managed(|host| match host.value_mut(handle)? {
        Value::Int32Array(items) => {
            let index = check_index(index, items.len())?;
            items[index] = value;
            Ok(())
        }
        other => invalid_cast(other, "System.Int32[]"),
    })
}

extern "C" fn array_single2_new(len0: i32, len1: i32) -> Handle {
    managed(|host| match (usize::try_from(len0), usize::try_from(len1)) {
        (Ok(rows), Ok(columns)) => Ok(host.new_handle(Value::Single2Array {
            lengths: [len0, len1],
            items: vec![0.0; rows * columns],
        })),
        _ => throw(ExceptionClass::Exception, "Arithmetic operation resulted in an overflow."),
    })
}

fn single2_index(lengths: [i32; 2], i: i32, j: i32) -> Managed<usize> {
    let row = check_index(i, lengths[0] as usize)?;
    let column = check_index(j, lengths[1] as usize)?;
    Ok(row * lengths[1] as usize + column)
}

extern "C" fn array_single2_get_item(handle: Handle, i: i32, j: i32) -> f32 {
    managed(|host| match host.value(handle)? {
        Value::Single2Array { lengths, items } => Ok(items[single2_index(*lengths, i, j)?]),
        other => invalid_cast(other, "System.Single[,]"),
    })
}

extern "C" fn array_single2_set_item(handle: Handle, i: i32, j: i32, value: f32) {
    managed(|host| match host.value_mut(handle)? {
        Value::Single2Array { lengths, items } => {
            let index = single2_index(*lengths, i, j)?;
            items[index] = value;
            Ok(())
        }
        other => invalid_cast(other, "System.Single[,]"),
    })
}

extern "C" fn array_string_new(len: i32) -> Handle {
    managed(|host| match usize::try_from(len) {
        Ok(len) => Ok(host.new_handle(Value::StringArray(vec![None; len]))),
        Err(_) => throw(ExceptionClass::Exception, "Arithmetic operation resulted in an overflow."),
    })
}

extern "C" fn array_string_get_item(handle: Handle, index: i32) -> Handle {
    managed(|host| {
        let item = match host.value(handle)? {
            Value::StringArray(items) => items[check_index(index, items.len())?],
            other => return invalid_cast(other, "System.String[]"),
        };
        Ok(item.map_or(NULL_HANDLE, |object| host.objects.handle_for(object)))
    })
}

extern "C" fn array_string_set_item(handle: Handle, index: i32, value: Handle) {
    managed(|host| {
        let item = match value {
            NULL_HANDLE => None,
            value => {
                host.text(value)?;
                Some(host.target(value)?)
            }
        };
        match host.value_mut(handle)? {
            Value::StringArray(items) => {
                let index = check_index(index, items.len())?;
                items[index] = item;
                Ok(())
            }
            other => invalid_cast(other, "System.String[]"),
        }
    })
}

// List<String>.

extern "C" fn list_string_new() -> Handle {
    managed(|host| Ok(host.new_handle(Value::StringList(Vec::new()))))
}

extern "C" fn list_string_add(handle: Handle, item: Handle) {
    managed(|host| {
        let item = match item {
            NULL_HANDLE => None,
            item => Some(host.target(item)?),
        };
        match host.value_mut(handle)? {
            Value::StringList(items) => {
                items.push(item);
                Ok(())
            }
            other => invalid_cast(other, "List<String>"),
        }
    })
}

extern "C" fn list_string_get_count(handle: Handle) -> i32 {
    managed(|host| match host.value(handle)? {
        Value::StringList(items) => Ok(items.len() as i32),
        other => invalid_cast(other, "List<String>"),
    })
}

extern "C" fn list_string_get_item(handle: Handle, index: i32) -> Handle {
    managed(|host| {
        let item = match host.value(handle)? {
            Value::StringList(items) => match usize::try_from(index) {
                Ok(index) if index < items.len() => items[index],
                _ => {
                    return throw(
                        ExceptionClass::Argument,
                        "Index was out of range. Must be non-negative and less than the size of the collection.",
                    );
                }
            },
            other => return invalid_cast(other, "List<String>"),
        };
        Ok(item.map_or(NULL_HANDLE, |object| host.objects.handle_for(object)))
    })
}

// System.Action.

unsafe extern "C" fn action_new(cpp_handle: i32, class_handle: *mut Handle) -> Handle {
    managed(|host| {
        let class = host.alloc(Value::ActionClass { cpp_handle });
        let class_out = host.action_classes.handle_for(class);
        // SAFETY: the caller passes a writable out-parameter
        unsafe { class_handle.write(class_out) };
        Ok(host.new_handle(Value::Delegate(vec![Target::Native { class }])))
    })
}

extern "C" fn release_action(class_handle: Handle) {
    with_host(|host| {
        if let Some(class) = host.action_classes.object(class_handle) {
            if let Value::ActionClass { cpp_handle } = &mut host.heap[class] {
                *cpp_handle = 0;
            }
        }
        host.action_classes.release(class_handle);
    });
}

fn invoke_target(target: Target) -> Managed<()> {
    match target {
        Target::Native { class } => {
            let (cpp_handle, native) = with_host(|host| {
                let cpp_handle = match host.heap[class] {
                    Value::ActionClass { cpp_handle } => cpp_handle,
                    _ => 0,
                };
                (cpp_handle, host.native_generated())
            });
            if cpp_handle == 0 {
                return throw(
                    ExceptionClass::InvalidOperation,
                    "the native action behind this delegate was released",
                );
            }
            // SAFETY: the native table was filled by `Init`
            unsafe { (native.action_native_invoke)(cpp_handle) };
            native_exception()
        }
        Target::Log(label) => {
            with_host(|host| host.invocations.push(label));
            Ok(())
        }
        Target::Throw(object) => Err(Thrown::Object(object)),
    }
}

fn invoke_delegate(handle: Handle) -> Managed<()> {
    if handle == NULL_HANDLE {
        return null_reference();
    }
    let targets = with_host(|host| host.delegate_targets(handle))?;
    targets.into_iter().try_for_each(invoke_target)
}

extern "C" fn action_invoke(handle: Handle) {
    if let Err(thrown) = invoke_delegate(handle) {
        raise(thrown);
    }
}

/// The cpp handle of a delegate that is exactly one live native action,
/// `0` for anything else.
unsafe extern "C" fn action_get_native_target(handle: Handle, class_handle: *mut Handle) -> i32 {
    managed(|host| {
        let targets = host.delegate_targets(handle)?;
        let &[Target::Native { class }] = targets.as_slice() else {
            return Ok(0);
        };
        let Value::ActionClass { cpp_handle } = host.heap[class] else {
            return Ok(0);
        };
        if cpp_handle != 0 {
            let class_out = host.action_classes.handle_for(class);
            // SAFETY: the caller passes a writable out-parameter
            unsafe { class_handle.write(class_out) };
        }
        Ok(cpp_handle)
    })
}

fn remove_last(haystack: &[Target], needle: &[Target]) -> Vec<Target> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return haystack.to_vec();
    }
    match (0..=haystack.len() - needle.len())
        .rev()
        .find(|&start| &haystack[start..start + needle.len()] == needle)
    {
        Some(start) => [&haystack[..start], &haystack[start + needle.len()..]].concat(),
        None => haystack.to_vec(),
    }
}

extern "C" fn delegate_combine(left: Handle, right: Handle) -> Handle {
    managed(|host| {
        let mut targets = host.delegate_targets(left)?;
        targets.extend(host.delegate_targets(right)?);
        match (left, right) {
            (NULL_HANDLE, NULL_HANDLE) => Ok(NULL_HANDLE),
            (NULL_HANDLE, only) | (only, NULL_HANDLE) => Ok(only),
            _ => Ok(host.new_handle(Value::Delegate(targets))),
        }
    })
}

extern "C" fn delegate_remove(source: Handle, value: Handle) -> Handle {
    managed(|host| {
        let targets = host.delegate_targets(source)?;
        let remaining = remove_last(&targets, &host.delegate_targets(value)?);
        if remaining.is_empty() {
            Ok(NULL_HANDLE)
        } else if remaining == targets {
            Ok(source)
        } else {
            Ok(host.new_handle(Value::Delegate(remaining)))
        }
    })
}

// BaseScript.

unsafe extern "C" fn base_script_new(cpp_handle: i32, handle: *mut Handle) {
    managed(|host| {
        if let Some(class) = host.fail_next_constructor.take() {
            return throw(class, "BaseScript refused to construct");
        }
        let created = host.new_handle(Value::BaseScript {
            cpp_handle,
            updates: 0,
        });
        // SAFETY: the caller passes a writable out-parameter
        unsafe { handle.write(created) };
        Ok(())
    })
}

/// The companion disconnects from native before its handle is recycled.
extern "C" fn release_base_script(handle: Handle) {
    with_host(|host| {
        if let Some(object) = host.objects.free(handle) {
            if let Value::BaseScript { cpp_handle, .. } = &mut host.heap[object] {
                *cpp_handle = 0;
            }
            host.released_base_scripts.push(handle);
        }
    });
}

/// Managed virtual `Update`: the native override when connected, the
/// managed base body otherwise.
fn virtual_update(handle: Handle) -> Managed<()> {
    let (cpp_handle, native) = with_host(|host| {
        host.companion(handle).map(|cpp_handle| (cpp_handle, host.native_generated()))
    })?;
    if cpp_handle == 0 {
        return with_host(|host| match host.value_mut(handle)? {
            Value::BaseScript { updates, .. } => {
                *updates += 1;
                Ok(())
            }
            other => invalid_cast(other, "BaseScript"),
        });
    }
    // SAFETY: the native table was filled by `Init`
    unsafe { (native.base_script_update)(cpp_handle) };
    native_exception()
}

fn virtual_receive_damage(handle: Handle, amount: f32) -> Managed<bool> {
    let (cpp_handle, native) = with_host(|host| {
        host.companion(handle).map(|cpp_handle| (cpp_handle, host.native_generated()))
    })?;
    if cpp_handle == 0 {
        return Ok(false);
    }
    // SAFETY: see above
    let lethal = unsafe { (native.base_script_receive_damage)(cpp_handle, amount) };
    native_exception()?;
    Ok(lethal != 0)
}

extern "C" fn base_script_update(handle: Handle) {
    if let Err(thrown) = virtual_update(handle) {
        raise(thrown);
    }
}

extern "C" fn base_script_receive_damage(handle: Handle, amount: f32) -> u32 {
    match virtual_receive_damage(handle, amount) {
        Ok(lethal) => lethal as u32,
        Err(thrown) => {
            raise(thrown);
            0
        }
    }
}

const CORE: CoreFunctions = CoreFunctions {
    release_object,
    string_new,
    set_exception,
    array_get_length,
    array_get_rank,
    array_get_length_of_dimension,
};

const GENERATED: GeneratedFunctions = GeneratedFunctions {
    object_to_string,
    object_get_hash_code,
    object_equals,
    string_get_length,
    string_concat,
    string_copy_utf8,
    exception_new,
    exception_get_message,
    null_reference_exception_new,
    argument_exception_new,
    invalid_operation_exception_new,
    invalid_cast_exception_new,
    box_boolean,
    unbox_boolean,
    box_char,
    unbox_char,
    box_sbyte,
    unbox_sbyte,
    box_byte,
    unbox_byte,
    box_int16,
    unbox_int16,
    box_uint16,
    unbox_uint16,
    box_int32,
    unbox_int32,
    box_uint32,
    unbox_uint32,
    box_int64,
    unbox_int64,
    box_uint64,
    unbox_uint64,
    box_single,
    unbox_single,
    box_double,
    unbox_double,
    box_vector3,
    unbox_vector3,
    vector3_get_magnitude,
    vector3_op_addition,
    box_day_of_week,
    unbox_day_of_week,
    release_raycast_hit,
    raycast_hit_get_distance,
    raycast_hit_get_point,
    box_raycast_hit,
    unbox_raycast_hit,
    physics_raycast,
    array_int32_new,
    array_int32_get_item,
    array_int32_set_item,
    array_single2_new,
    array_single2_get_item,
    array_single2_set_item,
    array_string_new,
    array_string_get_item,
    array_string_set_item,
    list_string_new,
    list_string_add,
    list_string_get_count,
    list_string_get_item,
    action_new,
    release_action,
    action_invoke,
    action_get_native_target,
    delegate_combine,
    delegate_remove,
    base_script_new,
    release_base_script,
    base_script_update,
    base_script_receive_damage,
};

/// Capacities and sizing of a host boot.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub capacities: Capacities,
    /// Must match the plugin's `base_script_slot_size`.
    pub base_script_slot_size: usize,
    /// Bytes left for `PluginMain` past the bridge's working memory.
    pub plugin_memory: usize,
    /// Overrides the computed region size.
    pub memory_size: Option<usize>,
    /// Bytes the region starts past a 16-byte boundary.
    pub skew: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            capacities: Capacities {
                managed_objects: 256,
                raycast_hits: 16,
                base_scripts: 8,
                actions: 16,
            },
            base_script_slot_size: 0,
            plugin_memory: 256,
            memory_size: None,
            skew: 0,
        }
    }
}

impl HostConfig {
    /// Bytes the bridge itself needs.
    pub fn required_memory(&self) -> usize {
        required_memory_size_at(self.skew, &self.capacities, self.base_script_slot_size)
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
            .unwrap_or_else(|| self.required_memory() + self.plugin_memory)
    }
}

fn write_prefix(region: &Region, size: usize, capacities: &Capacities) {
    // SAFETY: the region is valid for `size` bytes
    let mut cursor = unsafe { MemoryCursor::new(region.start(), size) };
    let written = CORE
        .write(&mut cursor)
        .and_then(|()| cursor.write_i32(capacities.managed_objects as i32))
        .and_then(|()| GENERATED.write(&mut cursor))
        .and_then(|()| capacities.write_trailing(&mut cursor));
    if let Err(error) = written {
        log::warn!("managed prefix truncated: {error}");
    }
}

/// A booted host. Dropping it shuts the host down.
#[derive(Debug)]
pub struct Session {
    init: InitFn,
}

impl Session {
    /// Calls `Init` again in reload mode on the same memory.
    pub fn reload(&self) {
        reload(self.init);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        shutdown();
    }
}

/// Lays out a fresh region, writes the managed prefix and calls `Init` in
/// first-boot mode. An exception `Init` raised is left in the managed slot
/// for [`take_exception`].
pub fn boot(config: &HostConfig, init: InitFn) -> Session {
    shutdown();
    let size = config.memory_size();
    let region = Region::new(size, config.skew);
    write_prefix(&region, size, &config.capacities);

    let mut host = Host::new(region, size, &config.capacities);
    let (memory, memory_size, core_out, generated_out) = host.init_arguments();
    HOST.with(|slot| *slot.borrow_mut() = Some(host));
    log::debug!("host booting with {size} bytes");
    // SAFETY: the region and out-tables live as long as the host
    unsafe {
        init(
            memory,
            memory_size,
            InitMode::FirstBoot as u8,
            core_out,
            generated_out,
        )
    };
    Session { init }
}

pub fn reload(init: InitFn) {
    let (memory, memory_size, core_out, generated_out) =
        with_host(|host| host.init_arguments());
    // SAFETY: see `boot`
    unsafe { init(memory, memory_size, InitMode::Reload as u8, core_out, generated_out) };
}

/// Uninstalls the bridge context, then drops the host and its region.
pub fn shutdown() {
    drop(uninstall());
    let host = HOST
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten();
    drop(host);
}

pub fn is_booted() -> bool {
    HOST.try_with(|slot| slot.borrow().is_some()).unwrap_or(false)
}

/// Takes the exception native code left in the managed slot.
pub fn take_exception() -> Option<HostException> {
    with_host(|host| {
        let object = host.exception.take()?;
        Some(host.describe(object))
    })
}

pub fn object_id(handle: Handle) -> Option<ObjectId> {
    with_host(|host| host.objects.object(handle))
}

pub fn live_handles() -> usize {
    with_host(|host| host.objects.live())
}

pub fn released_objects() -> Vec<Handle> {
    with_host(|host| host.objects.released.clone())
}

pub fn released_raycast_hits() -> Vec<Handle> {
    with_host(|host| host.raycast_hits.released.clone())
}

pub fn released_action_classes() -> Vec<Handle> {
    with_host(|host| host.action_classes.released.clone())
}

pub fn released_base_scripts() -> Vec<Handle> {
    with_host(|host| host.released_base_scripts.clone())
}

pub fn clear_release_logs() {
    with_host(|host| {
        host.objects.released.clear();
        host.raycast_hits.released.clear();
        host.action_classes.released.clear();
        host.released_base_scripts.clear();
    });
}

/// Copy of the whole lent region.
pub fn region_bytes() -> Vec<u8> {
    with_host(|host| {
        // SAFETY: the region is valid for `size` bytes
        unsafe { core::slice::from_raw_parts(host.region.start(), host.size) }.to_vec()
    })
}

/// Creates a managed exception object without a handle.
pub fn new_exception(class: ExceptionClass, message: &str) -> ObjectId {
    with_host(|host| {
        host.alloc(Value::Exception {
            class,
            message: message.to_owned(),
        })
    })
}

/// A managed delegate that records `label` when invoked.
pub fn new_managed_action(label: &str) -> Handle {
    with_host(|host| host.new_handle(Value::Delegate(vec![Target::Log(label.to_owned())])))
}

/// A managed delegate that throws a new exception when invoked.
pub fn new_throwing_action(class: ExceptionClass, message: &str) -> Handle {
    let exception = new_exception(class, message);
    new_rethrowing_action(exception)
}

/// A managed delegate that throws the given exception object.
pub fn new_rethrowing_action(exception: ObjectId) -> Handle {
    with_host(|host| host.new_handle(Value::Delegate(vec![Target::Throw(exception)])))
}

/// Managed code calling `action()`.
pub fn invoke(handle: Handle) -> Result<(), HostException> {
    invoke_delegate(handle).map_err(describe_thrown)
}

/// The exception object behind a live handle.
pub fn exception_at(handle: Handle) -> Option<HostException> {
    with_host(|host| {
        let object = host.objects.object(handle)?;
        match host.heap[object] {
            Value::Exception { .. } => Some(host.describe(object)),
            _ => None,
        }
    })
}

pub fn invocations() -> Vec<String> {
    with_host(|host| host.invocations.clone())
}

/// Managed-side `new MyScript()`: creates a companion and asks the plugin
/// for its native half.
pub fn create_base_script() -> Result<Handle, HostException> {
    let (object, handle, native) = with_host(|host| {
        let object = host.alloc(Value::BaseScript {
            cpp_handle: 0,
            updates: 0,
        });
        let handle = host.objects.handle_for(object);
        (object, handle, host.native_generated())
    });
    // SAFETY: the native table was filled by `Init`
    let cpp_handle = unsafe { (native.new_base_script)(handle) };
    if let Err(thrown) = native_exception() {
        with_host(|host| {
            if host.objects.object(handle) == Some(object) {
                host.objects.free(handle);
            }
        });
        return Err(describe_thrown(thrown));
    }
    with_host(|host| {
        if let Value::BaseScript { cpp_handle: slot, .. } = &mut host.heap[object] {
            *slot = cpp_handle;
        }
    });
    Ok(handle)
}

/// Managed-side destruction of a companion created by
/// [`create_base_script`].
pub fn destroy_base_script(handle: Handle) -> Result<(), HostException> {
    let (cpp_handle, native) = with_host(|host| {
        host.companion(handle).map(|cpp_handle| (cpp_handle, host.native_generated()))
    })
    .map_err(describe_thrown)?;
    if cpp_handle == 0 {
        return Ok(());
    }
    // SAFETY: the native table was filled by `Init`
    unsafe { (native.destroy_base_script)(cpp_handle) };
    native_exception().map_err(describe_thrown)
}

/// The cpp handle a live companion dispatches with.
pub fn companion_cpp_handle(handle: Handle) -> Option<i32> {
    with_host(|host| match host.value(handle) {
        Ok(Value::BaseScript { cpp_handle, .. }) if *cpp_handle != 0 => Some(*cpp_handle),
        _ => None,
    })
}

/// How often the managed base `Update` body ran for `handle`.
pub fn managed_updates(handle: Handle) -> Option<u32> {
    with_host(|host| match host.value(handle) {
        Ok(Value::BaseScript { updates, .. }) => Some(*updates),
        _ => None,
    })
}

/// Managed code calling `script.Update()`.
pub fn update(handle: Handle) -> Result<(), HostException> {
    virtual_update(handle).map_err(describe_thrown)
}

/// Managed code calling `script.ReceiveDamage(amount)`.
pub fn receive_damage(handle: Handle, amount: f32) -> Result<bool, HostException> {
    virtual_receive_damage(handle, amount).map_err(describe_thrown)
}

/// Makes the next `BaseScriptConstructor` throw `class`.
pub fn fail_next_base_script_constructor(class: ExceptionClass) {
    with_host(|host| host.fail_next_constructor = Some(class));
}

#[cfg(test)]
pub(crate) use testing::*;

#[cfg(test)]
mod testing {
    use super::*;
    use crate::{PluginDescriptor, Result, Subclass, SubclassFactory, entry};

    fn idle(_: &mut [u8], _: bool) -> Result<()> {
        Ok(())
    }

    unsafe extern "C" fn init_idle(
        memory: *mut u8,
        memory_size: i32,
        init_mode: u8,
        core_out: *mut NativeCoreFunctions,
        generated_out: *mut NativeGeneratedFunctions,
    ) {
        const PLUGIN: PluginDescriptor = PluginDescriptor::new(idle);
        // SAFETY: forwarded from the host
        unsafe {
            entry::init(&PLUGIN, memory, memory_size, init_mode, core_out, generated_out)
        }
    }

    unsafe extern "C" fn init_with_script<D: Subclass>(
        memory: *mut u8,
        memory_size: i32,
        init_mode: u8,
        core_out: *mut NativeCoreFunctions,
        generated_out: *mut NativeGeneratedFunctions,
    ) {
        let plugin = PluginDescriptor::new(idle)
            .with_base_script(SubclassFactory::of::<D>(), size_of::<D>());
        // SAFETY: forwarded from the host
        unsafe {
            entry::init(&plugin, memory, memory_size, init_mode, core_out, generated_out)
        }
    }

    /// Boots and fails the test if `Init` raised.
    pub(crate) fn boot_checked(config: &HostConfig, init: InitFn) -> Session {
        let session = boot(config, init);
        if let Some(exception) = take_exception() {
            panic!("Init raised {exception}");
        }
        session
    }

    pub(crate) fn boot_default() -> Session {
        boot_checked(&HostConfig::default(), init_idle)
    }

    pub(crate) fn boot_with_script<D: Subclass>() -> Session {
        let config = HostConfig {
            base_script_slot_size: size_of::<D>(),
            ..HostConfig::default()
        };
        boot_checked(&config, init_with_script::<D>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_spaces_dedupe_and_recycle() {
        let mut space = HandleSpace::new("test", 4);
        let first = space.handle_for(10);
        assert_eq!(first, 1);
        assert_eq!(space.handle_for(10), first, "one handle per object");
        let second = space.handle_for(11);
        assert_eq!(second, 2);

        space.release(first);
        assert_eq!(space.object(first), None);
        assert_eq!(space.handle_for(12), first, "freed handles are reused");
        assert_eq!(space.released, vec![first]);
        assert_eq!(space.live(), 2);
    }

    #[test]
    fn remove_drops_the_last_matching_run() {
        let a = Target::Log("a".into());
        let b = Target::Log("b".into());
        let list = vec![a.clone(), b.clone(), a.clone(), b.clone()];
        assert_eq!(
            remove_last(&list, &[a.clone(), b.clone()]),
            vec![a.clone(), b.clone()]
        );
        assert_eq!(remove_last(&list, &[b.clone(), b.clone()]), list);
        assert_eq!(remove_last(&[a.clone()], &[a]), Vec::<Target>::new());
    }

    #[test]
    fn prefix_round_trips_through_the_bridge_reader() {
        let config = HostConfig::default();
        let size = config.memory_size();
        let region = Region::new(size, config.skew);
        write_prefix(&region, size, &config.capacities);

        // SAFETY: the region is valid for `size` bytes
        let mut cursor = unsafe { MemoryCursor::new(region.start(), size) };
        let core = CoreFunctions::read(&mut cursor).expect("core");
        assert_eq!(core.release_object as usize, release_object as usize);
        let managed_objects = cursor.read_i32().expect("count");
        GeneratedFunctions::read(&mut cursor).expect("generated");
        let capacities =
            Capacities::read_trailing(&mut cursor, managed_objects).expect("capacities");
        assert_eq!(capacities, config.capacities);
    }

    #[test]
    fn boot_and_shutdown_leave_nothing_behind() {
        let session = boot_default();
        assert!(is_booted());
        assert!(crate::try_current().is_some());
        drop(session);
        assert!(!is_booted());
        assert!(crate::try_current().is_none());
    }
}
