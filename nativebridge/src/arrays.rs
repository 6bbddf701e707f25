//! Array surrogates.
//!
//! An array mirror caches its lengths on construction. Element access goes
//! through a proxy that names `(array, index...)` and crosses the boundary
//! only when it is read or written.

use core::marker::PhantomData;
use core::ops::Deref;

use crate::{
    BridgeContext, BridgeError, Handle, NULL_HANDLE, Result, current,
    system::{Array, Object, String},
};

impl Array {
    /// Total number of elements across all dimensions.
    pub fn len(&self) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.core.array_get_length)(self.handle()) }
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn rank(&self) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: see above
            unsafe { (context.core.array_get_rank)(self.handle()) }
        })
    }

    pub fn length_of_dimension(&self, dimension: i32) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: see above
            unsafe {
                (context.core.array_get_length_of_dimension)(self.handle(), dimension)
            }
        })
    }
}

/// Element type of a one-dimensional managed array.
pub trait ArrayElement: Sized {
    const ARRAY_NAME: &'static str;

    fn new_array(context: &BridgeContext, len: i32) -> Handle;
    fn get_item(context: &BridgeContext, array: Handle, index: i32) -> Self;
    fn set_item(context: &BridgeContext, array: Handle, index: i32, value: &Self);
}

impl ArrayElement for i32 {
    const ARRAY_NAME: &'static str = "System.Int32[]";

    fn new_array(context: &BridgeContext, len: i32) -> Handle {
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.array_int32_new)(len) }
    }

    fn get_item(context: &BridgeContext, array: Handle, index: i32) -> Self {
        // SAFETY: see above
        unsafe { (context.generated.array_int32_get_item)(array, index) }
    }

    fn set_item(context: &BridgeContext, array: Handle, index: i32, value: &Self) {
        // SAFETY: see above
        unsafe { (context.generated.array_int32_set_item)(array, index, *value) }
    }
}

impl ArrayElement for String {
    const ARRAY_NAME: &'static str = "System.String[]";

    fn new_array(context: &BridgeContext, len: i32) -> Handle {
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.array_string_new)(len) }
    }

    fn get_item(context: &BridgeContext, array: Handle, index: i32) -> Self {
        // SAFETY: see above
        let handle = unsafe { (context.generated.array_string_get_item)(array, index) };
        String::adopt(context, handle)
    }

    fn set_item(context: &BridgeContext, array: Handle, index: i32, value: &Self) {
        // SAFETY: see above
        unsafe {
            (context.generated.array_string_set_item)(array, index, value.handle())
        }
    }
}

fn new_array(
    context: &BridgeContext,
    name: &'static str,
    create: impl FnOnce(&BridgeContext) -> Handle,
) -> Result<Array> {
    let handle = context.call(create)?;
    if handle == NULL_HANDLE {
        return Err(BridgeError::NullHandle(name));
    }
    Ok(Array::adopt(context, handle))
}

/// `T[]`.
pub struct Array1<T: ArrayElement> {
    array: Array,
    len: i32,
    marker: PhantomData<T>,
}

pub type Int32Array = Array1<i32>;
pub type StringArray = Array1<String>;

impl<T: ArrayElement> Array1<T> {
    pub fn new(len: i32) -> Result<Self> {
        let context = current()?;
        let array = new_array(&context, T::ARRAY_NAME, |context| {
            T::new_array(context, len)
        })?;
        Ok(Self {
            array,
            len,
            marker: PhantomData,
        })
    }

    /// Wraps an array the managed side handed over.
    pub fn from_array(array: Array) -> Result<Self> {
        let rank = array.rank()?;
        if rank != 1 {
            return Err(BridgeError::native(format!(
                "{} expects rank 1, got {rank}",
                T::ARRAY_NAME
            )));
        }
        let len = array.len()?;
        Ok(Self {
            array,
            len,
            marker: PhantomData,
        })
    }

    #[inline]
    pub fn len(&self) -> i32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn at(&self, index: i32) -> ElementProxy<'_, T> {
        ElementProxy { array: self, index }
    }

    pub fn get(&self, index: i32) -> Result<T> {
        let context = current()?;
        context.call(|context| T::get_item(context, self.array.handle(), index))
    }

    pub fn set(&self, index: i32, value: &T) -> Result<()> {
        let context = current()?;
        context.call(|context| {
            T::set_item(context, self.array.handle(), index, value)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<T>> + '_ {
        (0..self.len).map(move |index| self.get(index))
    }

    pub fn into_array(self) -> Array {
        self.array
    }
}

impl<T: ArrayElement> Deref for Array1<T> {
    type Target = Array;

    fn deref(&self) -> &Array {
        &self.array
    }
}

impl<T: ArrayElement> Clone for Array1<T> {
    fn clone(&self) -> Self {
        Self {
            array: self.array.clone(),
            len: self.len,
            marker: PhantomData,
        }
    }
}

impl<T: ArrayElement> core::fmt::Debug for Array1<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct(T::ARRAY_NAME)
            .field("handle", &self.array.handle())
            .field("len", &self.len)
            .finish()
    }
}

impl<T: ArrayElement> From<&Array1<T>> for Object {
    fn from(array: &Array1<T>) -> Self {
        Object::from(&array.array)
    }
}

/// One element of a `T[]`. Holds no reference of its own.
pub struct ElementProxy<'a, T: ArrayElement> {
    array: &'a Array1<T>,
    index: i32,
}

impl<T: ArrayElement> ElementProxy<'_, T> {
    pub fn get(&self) -> Result<T> {
        self.array.get(self.index)
    }

    pub fn set(&self, value: &T) -> Result<()> {
        self.array.set(self.index, value)
    }

    pub fn index(&self) -> i32 {
        self.index
    }
}

/// Element type of a two-dimensional managed array.
pub trait ArrayElement2: Sized {
    const ARRAY_NAME: &'static str;

    fn new_array(context: &BridgeContext, len0: i32, len1: i32) -> Handle;
    fn get_item(context: &BridgeContext, array: Handle, i: i32, j: i32) -> Self;
    fn set_item(context: &BridgeContext, array: Handle, i: i32, j: i32, value: Self);
}

impl ArrayElement2 for f32 {
    const ARRAY_NAME: &'static str = "System.Single[,]";

    fn new_array(context: &BridgeContext, len0: i32, len1: i32) -> Handle {
        // SAFETY: table entries were validated at init
        unsafe { (context.generated.array_single2_new)(len0, len1) }
    }

    fn get_item(context: &BridgeContext, array: Handle, i: i32, j: i32) -> Self {
        // SAFETY: see above
        unsafe { (context.generated.array_single2_get_item)(array, i, j) }
    }

    fn set_item(context: &BridgeContext, array: Handle, i: i32, j: i32, value: Self) {
        // SAFETY: see above
        unsafe { (context.generated.array_single2_set_item)(array, i, j, value) }
    }
}

/// `T[,]`.
pub struct Array2<T: ArrayElement2> {
    array: Array,
    lengths: [i32; 2],
    marker: PhantomData<T>,
}

pub type SingleArray2 = Array2<f32>;

impl<T: ArrayElement2 + Copy> Array2<T> {
    pub fn new(len0: i32, len1: i32) -> Result<Self> {
        let context = current()?;
        let array = new_array(&context, T::ARRAY_NAME, |context| {
            T::new_array(context, len0, len1)
        })?;
        Ok(Self {
            array,
            lengths: [len0, len1],
            marker: PhantomData,
        })
    }

    pub fn from_array(array: Array) -> Result<Self> {
        let rank = array.rank()?;
        if rank != 2 {
            return Err(BridgeError::native(format!(
                "{} expects rank 2, got {rank}",
                T::ARRAY_NAME
            )));
        }
        let lengths = [array.length_of_dimension(0)?, array.length_of_dimension(1)?];
        Ok(Self {
            array,
            lengths,
            marker: PhantomData,
        })
    }

    #[inline]
    pub fn lengths(&self) -> [i32; 2] {
        self.lengths
    }

    pub fn at(&self, i: i32, j: i32) -> ElementProxy2<'_, T> {
        ElementProxy2 {
            array: self,
            indices: [i, j],
        }
    }

    pub fn get(&self, i: i32, j: i32) -> Result<T> {
        let context = current()?;
        context.call(|context| T::get_item(context, self.array.handle(), i, j))
    }

    pub fn set(&self, i: i32, j: i32, value: T) -> Result<()> {
        let context = current()?;
        context.call(|context| {
            T::set_item(context, self.array.handle(), i, j, value)
        })
    }
}

impl<T: ArrayElement2> Deref for Array2<T> {
    type Target = Array;

    fn deref(&self) -> &Array {
        &self.array
    }
}

impl<T: ArrayElement2> core::fmt::Debug for Array2<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct(T::ARRAY_NAME)
            .field("handle", &self.array.handle())
            .field("lengths", &self.lengths)
            .finish()
    }
}

pub struct ElementProxy2<'a, T: ArrayElement2> {
    array: &'a Array2<T>,
    indices: [i32; 2],
}

impl<T: ArrayElement2 + Copy> ElementProxy2<'_, T> {
    pub fn get(&self) -> Result<T> {
        let [i, j] = self.indices;
        self.array.get(i, j)
    }

    pub fn set(&self, value: T) -> Result<()> {
        let [i, j] = self.indices;
        self.array.set(i, j, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExceptionClass, host};

    #[test]
    fn int_array_proxies_read_and_write_through() {
        let _session = host::boot_default();

        let array = Int32Array::new(4).expect("array");
        assert_eq!(array.len(), 4);
        array.at(2).set(&42).expect("set");
        assert_eq!(array.at(2).get().expect("get"), 42);

        let values: Vec<i32> = array.iter().collect::<Result<_>>().expect("all elements");
        assert_eq!(values, vec![0, 0, 42, 0]);
        assert_eq!(array.rank().expect("rank"), 1);
    }

    #[test]
    fn out_of_bounds_index_raises_a_managed_exception() {
        let _session = host::boot_default();

        let array = Int32Array::new(2).expect("array");
        let error = array.get(2).expect_err("past the end");
        assert_eq!(
            error.managed().map(|exception| exception.class()),
            Some(ExceptionClass::Exception)
        );
    }

    #[test]
    fn two_dimensional_arrays_cache_each_dimension() {
        let _session = host::boot_default();

        let grid = SingleArray2::new(2, 3).expect("array");
        grid.at(1, 2).set(0.5).expect("set");
        assert_eq!(grid.get(1, 2).expect("get"), 0.5);
        assert_eq!(grid.get(0, 2).expect("get"), 0.0);

        let reopened = SingleArray2::from_array((*grid).clone()).expect("rank 2");
        assert_eq!(reopened.lengths(), [2, 3]);
        assert_eq!(reopened.len().expect("length"), 6);
        assert!(Int32Array::from_array((*grid).clone()).is_err());
    }

    #[test]
    fn string_elements_are_reference_counted_mirrors() {
        let _session = host::boot_default();
        let context = current().expect("booted");

        let names = StringArray::new(3).expect("array");
        let name = String::new("ada").expect("string");
        names.at(0).set(&name).expect("set");

        let first = names.get(0).expect("get");
        assert_eq!(first, name, "same managed object, same handle");
        assert_eq!(context.objects.count(name.handle()), 2);
        assert!(names.get(1).expect("get").is_null());
    }
}
