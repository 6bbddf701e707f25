//! Layout of the memory region the managed side lends to the plugin.
//!
//! The region starts with a prefix written by the managed side:
//!
//! 1. the core managed function table ([`CoreFunctions`]),
//! 2. `maxManagedObjects` as `i32`,
//! 3. the generated managed function table ([`GeneratedFunctions`]),
//! 4. `maxRaycastHits`, `maxBaseScripts`, `maxActions` as `i32`.
//!
//! Working memory follows, each section 16-byte aligned: the object,
//! raycast-hit and action-class refcount arrays, then the `BaseScript`
//! pointer pool, the `BaseScript` whole-object pool and the action
//! pointer pool. Whatever is left after that belongs to `PluginMain`.

use crate::{
    ActionTarget, BaseScript, BridgeError, CoreFunctions, GeneratedFunctions,
    ObjectPool, PointerPool, RefCountTable, Result,
};

pub const SECTION_ALIGN: usize = 16;

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn read_unaligned<T: Copy>(ptr: *const u8) -> T {
    // SAFETY: caller validates pointer
    unsafe { (ptr as *const T).read_unaligned() }
}

fn write_unaligned<T>(ptr: *mut u8, value: T) {
    // SAFETY: caller validates pointer
    unsafe { (ptr as *mut T).write_unaligned(value) };
}

/// Sequential, bounds checked access to the region.
#[derive(Debug)]
pub struct MemoryCursor {
    base: *mut u8,
    len: usize,
    offset: usize,
}

impl MemoryCursor {
    /// # Safety
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the cursor.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len,
            offset: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, size: usize) -> Result<*mut u8> {
        let end = self.offset + size;
        if end > self.len {
            return Err(BridgeError::MemoryTooLow {
                required: end,
                provided: self.len,
            });
        }
        // SAFETY: checked against len above
        let ptr = unsafe { self.base.add(self.offset) };
        self.offset = end;
        Ok(ptr)
    }

    pub fn read_pointer(&mut self) -> Result<usize> {
        let ptr = self.take(size_of::<usize>())?;
        Ok(read_unaligned(ptr))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let ptr = self.take(size_of::<i32>())?;
        Ok(read_unaligned(ptr))
    }

    pub fn write_pointer(&mut self, value: usize) -> Result<()> {
        let ptr = self.take(size_of::<usize>())?;
        write_unaligned(ptr, value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        let ptr = self.take(size_of::<i32>())?;
        write_unaligned(ptr, value);
        Ok(())
    }
}

/// Capacities agreed with the managed side, as read from the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capacities {
    pub managed_objects: usize,
    pub raycast_hits: usize,
    pub base_scripts: usize,
    pub actions: usize,
}

fn capacity(value: i32) -> usize {
    value.max(0) as usize
}

impl Capacities {
    /// Reads the three capacities that trail the generated table.
    pub fn read_trailing(cursor: &mut MemoryCursor, managed_objects: i32) -> Result<Self> {
        Ok(Self {
            managed_objects: capacity(managed_objects),
            raycast_hits: capacity(cursor.read_i32()?),
            base_scripts: capacity(cursor.read_i32()?),
            actions: capacity(cursor.read_i32()?),
        })
    }

    pub fn write_trailing(&self, cursor: &mut MemoryCursor) -> Result<()> {
        cursor.write_i32(self.raycast_hits as i32)?;
        cursor.write_i32(self.base_scripts as i32)?;
        cursor.write_i32(self.actions as i32)
    }
}

/// Size in bytes of the managed-written prefix.
pub const fn prefix_size() -> usize {
    CoreFunctions::SIZE
        + size_of::<i32>()
        + GeneratedFunctions::SIZE
        + 3 * size_of::<i32>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub size: usize,
}

impl Section {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Working memory sections, as offsets from the start of the region. Each
/// section starts on a `SECTION_ALIGN` boundary in memory, so the offsets
/// depend on where the region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingLayout {
    pub start: usize,
    pub objects: Section,
    pub raycast_hits: Section,
    pub action_classes: Section,
    pub base_script_pointers: Section,
    pub base_script_objects: Section,
    pub action_pointers: Section,
    pub end: usize,
}

impl WorkingLayout {
    pub fn compute(
        address: usize,
        prefix_end: usize,
        capacities: &Capacities,
        base_script_slot_size: usize,
    ) -> Self {
        let skew = address % SECTION_ALIGN;
        let aligned = |offset: usize| align_up(skew + offset, SECTION_ALIGN) - skew;
        let start = aligned(prefix_end);
        let mut offset = start;
        let mut section = |size: usize| {
            let section = Section { offset, size };
            offset = aligned(offset + size);
            section
        };

        let objects = section(RefCountTable::required_size(capacities.managed_objects));
        let raycast_hits = section(RefCountTable::required_size(capacities.raycast_hits));
        let action_classes = section(RefCountTable::required_size(capacities.actions));
        let base_script_pointers =
            section(PointerPool::<dyn BaseScript>::required_size(capacities.base_scripts));
        let base_script_objects = section(ObjectPool::required_size(
            capacities.base_scripts,
            base_script_slot_size,
        ));
        let action_pointers =
            section(PointerPool::<ActionTarget>::required_size(capacities.actions));

        Self {
            start,
            objects,
            raycast_hits,
            action_classes,
            base_script_pointers,
            base_script_objects,
            action_pointers,
            end: offset,
        }
    }

    /// Total bytes the region must provide, prefix included.
    pub fn required(&self) -> usize {
        self.end
    }
}

/// Bytes a managed side must lend at `address` for the given capacities.
pub fn required_memory_size_at(
    address: usize,
    capacities: &Capacities,
    base_script_slot_size: usize,
) -> usize {
    WorkingLayout::compute(address, prefix_size(), capacities, base_script_slot_size).required()
}

/// Bytes a managed side must lend in a 16-byte aligned region. A region
/// off that boundary needs up to `SECTION_ALIGN - 1` more.
pub fn required_memory_size(capacities: &Capacities, base_script_slot_size: usize) -> usize {
    required_memory_size_at(0, capacities, base_script_slot_size)
}
