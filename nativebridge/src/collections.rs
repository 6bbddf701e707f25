use crate::{
    BridgeError, NULL_HANDLE, Result, current,
    system::{IEnumerable, Object, String, managed_class},
};

managed_class! {
    /// `System.Collections.Generic.List<System.String>`.
    pub struct ListString = "System.Collections.Generic.List`1[System.String]":
        Object, IEnumerable;
}

impl ListString {
    pub fn new() -> Result<Self> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: table entries were validated at init
            unsafe { (context.generated.list_string_new)() }
        })?;
        if handle == NULL_HANDLE {
            return Err(BridgeError::NullHandle("List<String>()"));
        }
        Ok(Self::adopt(&context, handle))
    }

    pub fn add(&self, item: &String) -> Result<()> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: see above
            unsafe { (context.generated.list_string_add)(self.handle(), item.handle()) }
        })
    }

    pub fn count(&self) -> Result<i32> {
        let context = current()?;
        context.call(|context| {
            // SAFETY: see above
            unsafe { (context.generated.list_string_get_count)(self.handle()) }
        })
    }

    pub fn get(&self, index: i32) -> Result<String> {
        let context = current()?;
        let handle = context.call(|context| {
            // SAFETY: see above
            unsafe { (context.generated.list_string_get_item)(self.handle(), index) }
        })?;
        Ok(String::adopt(&context, handle))
    }
}
