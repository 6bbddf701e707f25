//! Free-listed pools threaded through the lent region.
//!
//! Both pools keep their list head inside the region so that a reload
//! finds the exact state the previous load left behind. Links are slot
//! indices, never addresses. Slot `0` is reserved to line up with the
//! null handle, so a pool of capacity `K` hands out `K - 1` slots.

use core::ptr::NonNull;

use crate::layout::{SECTION_ALIGN, align_up};

pub const POOL_HEADER_SIZE: usize = 16;
const OBJECT_SLOT_HEADER_SIZE: usize = 16;

const FREE: u32 = 0;
const OCCUPIED: u32 = 1;
const RESERVED: u32 = 2;

#[repr(C)]
struct PoolHeader {
    next_free: i32,
    capacity: i32,
}

#[repr(C)]
union SlotPayload<T: ?Sized> {
    next: i32,
    value: *mut T,
}

#[repr(C)]
struct PointerSlot<T: ?Sized> {
    tag: u32,
    payload: SlotPayload<T>,
}

#[repr(C)]
struct ObjectSlotHeader {
    tag: u32,
    next: i32,
}

/// Native pointers indexed by a small integer, the "cpp handle" the
/// managed side uses to call back into native objects.
pub struct PointerPool<T: ?Sized> {
    name: &'static str,
    header: NonNull<PoolHeader>,
    slots: NonNull<PointerSlot<T>>,
    capacity: usize,
}

impl<T: ?Sized> PointerPool<T> {
    pub const fn required_size(capacity: usize) -> usize {
        POOL_HEADER_SIZE + capacity * size_of::<PointerSlot<T>>()
    }

    /// # Safety
    /// `memory` must be 16-byte aligned and valid for
    /// [`Self::required_size`] bytes for the lifetime of the pool.
    pub unsafe fn from_raw(name: &'static str, memory: *mut u8, capacity: usize) -> Self {
        debug_assert_eq!(memory as usize % SECTION_ALIGN, 0, "{name}: unaligned");
        // SAFETY: guaranteed by the caller
        let header = unsafe { NonNull::new_unchecked(memory.cast::<PoolHeader>()) };
        // SAFETY: slots follow the header inside the same allocation
        let slots = unsafe {
            NonNull::new_unchecked(memory.add(POOL_HEADER_SIZE).cast())
        };
        Self {
            name,
            header,
            slots,
            capacity,
        }
    }

    #[inline]
    fn slot(&self, index: i32) -> *mut PointerSlot<T> {
        assert!(
            index >= 0 && (index as usize) < self.capacity,
            "{}: slot {index} out of range 0..{}",
            self.name,
            self.capacity
        );
        // SAFETY: bounds checked above
        unsafe { self.slots.as_ptr().add(index as usize) }
    }

    #[inline]
    fn occupied_slot(&self, index: i32) -> *mut PointerSlot<T> {
        let slot = self.slot(index);
        // SAFETY: slot is in bounds
        let tag = unsafe { (*slot).tag };
        assert!(
            tag == OCCUPIED,
            "{}: slot {index} is not occupied",
            self.name
        );
        slot
    }

    /// Links every slot into the free list. First boot only.
    pub fn thread(&self) {
        // SAFETY: header and all slots are in bounds and exclusively ours
        unsafe {
            for i in 0..self.capacity {
                let slot = self.slots.as_ptr().add(i);
                (*slot).tag = if i == 0 { RESERVED } else { FREE };
                (*slot).payload.next =
                    if i + 1 < self.capacity { (i + 1) as i32 } else { 0 };
            }
            let header = self.header.as_ptr();
            (*header).next_free = if self.capacity > 1 { 1 } else { 0 };
            (*header).capacity = self.capacity as i32;
        }
    }

    /// Stores `value` in a free slot and returns its index.
    pub fn reserve(&self, value: *mut T) -> i32 {
        let header = self.header.as_ptr();
        // SAFETY: header is valid for the pool's lifetime
        let index = unsafe { (*header).next_free };
        assert!(
            index != 0,
            "{}: pool exhausted ({} slots)",
            self.name,
            self.capacity.saturating_sub(1)
        );
        let slot = self.slot(index);
        // SAFETY: free slots hold the `next` variant
        unsafe {
            debug_assert_eq!((*slot).tag, FREE, "{}: corrupt free list", self.name);
            (*header).next_free = (*slot).payload.next;
            (*slot).tag = OCCUPIED;
            (*slot).payload.value = value;
        }
        index
    }

    pub fn get(&self, index: i32) -> *mut T {
        let slot = self.occupied_slot(index);
        // SAFETY: occupied slots hold the `value` variant
        unsafe { (*slot).payload.value }
    }

    pub fn set(&self, index: i32, value: *mut T) {
        let slot = self.occupied_slot(index);
        // SAFETY: occupied
        unsafe { (*slot).payload.value = value };
    }

    /// Links `index` back into the free list and returns the pointer it held.
    pub fn release(&self, index: i32) -> *mut T {
        let slot = self.occupied_slot(index);
        let header = self.header.as_ptr();
        // SAFETY: occupied slot, valid header
        unsafe {
            let value = (*slot).payload.value;
            (*slot).tag = FREE;
            (*slot).payload.next = (*header).next_free;
            (*header).next_free = index;
            value
        }
    }

    pub fn is_occupied(&self, index: i32) -> bool {
        if index <= 0 || index as usize >= self.capacity {
            return false;
        }
        // SAFETY: in bounds
        unsafe { (*self.slot(index)).tag == OCCUPIED }
    }

    /// Walks the free list.
    pub fn free_len(&self) -> usize {
        let mut len = 0;
        // SAFETY: header valid, every link points at a free slot
        let mut next = unsafe { (*self.header.as_ptr()).next_free };
        while next != 0 {
            len += 1;
            assert!(len < self.capacity, "{}: free list has a cycle", self.name);
            // SAFETY: free slots hold `next`
            next = unsafe { (*self.slot(next)).payload.next };
        }
        len
    }

    pub fn occupied_len(&self) -> usize {
        (1..self.capacity as i32)
            .filter(|&i| self.is_occupied(i))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Raw storage slots big enough for the largest native subclass, used
/// to construct objects in place without a heap allocation.
pub struct ObjectPool {
    name: &'static str,
    header: NonNull<PoolHeader>,
    slots: NonNull<u8>,
    capacity: usize,
    slot_size: usize,
}

impl ObjectPool {
    pub const SLOT_ALIGN: usize = 16;

    pub const fn stride(slot_size: usize) -> usize {
        OBJECT_SLOT_HEADER_SIZE + align_up(slot_size, Self::SLOT_ALIGN)
    }

    pub const fn required_size(capacity: usize, slot_size: usize) -> usize {
        POOL_HEADER_SIZE + capacity * Self::stride(slot_size)
    }

    /// # Safety
    /// `memory` must be 16-byte aligned and valid for
    /// [`Self::required_size`] bytes for the lifetime of the pool.
    pub unsafe fn from_raw(
        name: &'static str,
        memory: *mut u8,
        capacity: usize,
        slot_size: usize,
    ) -> Self {
        debug_assert_eq!(memory as usize % SECTION_ALIGN, 0, "{name}: unaligned");
        // SAFETY: guaranteed by the caller
        let header = unsafe { NonNull::new_unchecked(memory.cast::<PoolHeader>()) };
        // SAFETY: see above
        let slots = unsafe { NonNull::new_unchecked(memory.add(POOL_HEADER_SIZE)) };
        Self {
            name,
            header,
            slots,
            capacity,
            slot_size,
        }
    }

    #[inline]
    fn slot_header(&self, index: i32) -> *mut ObjectSlotHeader {
        assert!(
            index >= 0 && (index as usize) < self.capacity,
            "{}: slot {index} out of range 0..{}",
            self.name,
            self.capacity
        );
        let offset = index as usize * Self::stride(self.slot_size);
        // SAFETY: bounds checked above
        unsafe { self.slots.as_ptr().add(offset).cast() }
    }

    #[inline]
    fn storage_of(&self, index: i32) -> NonNull<u8> {
        let header = self.slot_header(index).cast::<u8>();
        // SAFETY: storage follows the slot header within the stride
        unsafe { NonNull::new_unchecked(header.add(OBJECT_SLOT_HEADER_SIZE)) }
    }

    pub fn thread(&self) {
        // SAFETY: all slot headers are in bounds
        unsafe {
            for i in 0..self.capacity {
                let slot = self.slot_header(i as i32);
                (*slot).tag = if i == 0 { RESERVED } else { FREE };
                (*slot).next =
                    if i + 1 < self.capacity { (i + 1) as i32 } else { 0 };
            }
            let header = self.header.as_ptr();
            (*header).next_free = if self.capacity > 1 { 1 } else { 0 };
            (*header).capacity = self.capacity as i32;
        }
    }

    /// Takes an inactive slot off the free list. The returned storage is
    /// `slot_size` bytes, 16-byte aligned and uninitialized.
    pub fn reserve(&self) -> (i32, NonNull<u8>) {
        let header = self.header.as_ptr();
        // SAFETY: header valid
        let index = unsafe { (*header).next_free };
        assert!(
            index != 0,
            "{}: pool exhausted ({} slots)",
            self.name,
            self.capacity.saturating_sub(1)
        );
        let slot = self.slot_header(index);
        // SAFETY: free slot
        unsafe {
            debug_assert_eq!((*slot).tag, FREE, "{}: corrupt free list", self.name);
            (*header).next_free = (*slot).next;
            (*slot).tag = OCCUPIED;
            (*slot).next = 0;
        }
        (index, self.storage_of(index))
    }

    pub fn storage(&self, index: i32) -> NonNull<u8> {
        self.assert_occupied(index);
        self.storage_of(index)
    }

    fn assert_occupied(&self, index: i32) {
        let slot = self.slot_header(index);
        // SAFETY: in bounds
        let tag = unsafe { (*slot).tag };
        assert!(tag == OCCUPIED, "{}: slot {index} is not occupied", self.name);
    }

    /// Index of the slot whose storage starts at `storage`.
    pub fn index_of(&self, storage: NonNull<u8>) -> i32 {
        let base = self.storage_of(0).as_ptr() as usize;
        let address = storage.as_ptr() as usize;
        let stride = Self::stride(self.slot_size);
        assert!(
            address >= base && (address - base).is_multiple_of(stride),
            "{}: {address:#x} is not a slot of this pool",
            self.name
        );
        ((address - base) / stride) as i32
    }

    /// Links the slot owning `storage` back into the free list. The
    /// object that lived there must already be dropped.
    pub fn release(&self, storage: NonNull<u8>) {
        let index = self.index_of(storage);
        self.assert_occupied(index);
        let header = self.header.as_ptr();
        let slot = self.slot_header(index);
        // SAFETY: occupied slot, valid header
        unsafe {
            (*slot).tag = FREE;
            (*slot).next = (*header).next_free;
            (*header).next_free = index;
        }
    }

    pub fn free_len(&self) -> usize {
        let mut len = 0;
        // SAFETY: header valid
        let mut next = unsafe { (*self.header.as_ptr()).next_free };
        while next != 0 {
            len += 1;
            assert!(len < self.capacity, "{}: free list has a cycle", self.name);
            // SAFETY: free slots carry a link
            next = unsafe { (*self.slot_header(next)).next };
        }
        len
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned(bytes: usize) -> Vec<u128> {
        vec![0u128; bytes.div_ceil(16)]
    }

    fn pointer_pool(storage: &mut [u128], capacity: usize) -> PointerPool<u32> {
        // SAFETY: storage is 16 aligned and outlives the pool in each test
        let pool = unsafe {
            PointerPool::from_raw("test", storage.as_mut_ptr().cast(), capacity)
        };
        pool.thread();
        pool
    }

    #[test]
    fn fresh_pool_hands_out_slots_from_one() {
        let mut storage = aligned(PointerPool::<u32>::required_size(4));
        let pool = pointer_pool(&mut storage, 4);
        let mut values = [10u32, 20, 30];

        assert_eq!(pool.free_len(), 3);
        assert_eq!(pool.reserve(&mut values[0]), 1);
        assert_eq!(pool.reserve(&mut values[1]), 2);
        assert_eq!(pool.reserve(&mut values[2]), 3);
        assert_eq!(pool.free_len(), 0);

        // SAFETY: the stored pointers target `values`
        assert_eq!(unsafe { *pool.get(2) }, 20);
    }

    #[test]
    #[should_panic(expected = "pool exhausted")]
    fn exhausted_pool_is_fatal() {
        let mut storage = aligned(PointerPool::<u32>::required_size(2));
        let pool = pointer_pool(&mut storage, 2);
        let mut value = 1u32;
        pool.reserve(&mut value);
        pool.reserve(&mut value);
    }

    #[test]
    fn releasing_in_any_order_restores_every_slot() {
        let capacity = 9;
        let mut storage = aligned(PointerPool::<u32>::required_size(capacity));
        let pool = pointer_pool(&mut storage, capacity);
        let mut value = 0u32;

        let reserved: Vec<i32> = (1..capacity).map(|_| pool.reserve(&mut value)).collect();
        assert_eq!(pool.occupied_len(), capacity - 1);

        for &index in [5, 1, 8, 3, 2, 7, 4, 6].iter() {
            pool.release(reserved[index - 1]);
        }
        assert_eq!(pool.free_len(), capacity - 1);
        assert_eq!(pool.occupied_len(), 0);

        // the list is LIFO: the last released slot comes back first
        assert_eq!(pool.reserve(&mut value), 6);
    }

    #[test]
    #[should_panic(expected = "is not occupied")]
    fn released_index_cannot_be_dereferenced() {
        let mut storage = aligned(PointerPool::<u32>::required_size(4));
        let pool = pointer_pool(&mut storage, 4);
        let mut value = 3u32;
        let index = pool.reserve(&mut value);
        pool.release(index);
        pool.get(index);
    }

    #[test]
    #[should_panic(expected = "is not occupied")]
    fn reserved_slot_zero_is_never_occupied() {
        let mut storage = aligned(PointerPool::<u32>::required_size(4));
        let pool = pointer_pool(&mut storage, 4);
        pool.get(0);
    }

    #[test]
    fn trait_object_pointers_survive_the_round_trip() {
        trait Speak {
            fn word(&self) -> &'static str;
        }
        struct Dog;
        impl Speak for Dog {
            fn word(&self) -> &'static str {
                "woof"
            }
        }

        let mut storage = aligned(PointerPool::<dyn Speak>::required_size(3));
        // SAFETY: storage outlives the pool
        let pool: PointerPool<dyn Speak> = unsafe {
            PointerPool::from_raw("speak", storage.as_mut_ptr().cast(), 3)
        };
        pool.thread();

        let mut dog = Dog;
        let index = pool.reserve(&mut dog as *mut Dog as *mut dyn Speak);
        // SAFETY: dog is alive
        assert_eq!(unsafe { (*pool.get(index)).word() }, "woof");
    }

    #[test]
    fn object_slots_are_aligned_and_recycled() {
        let capacity = 4;
        let slot_size = 40;
        let mut storage = aligned(ObjectPool::required_size(capacity, slot_size));
        // SAFETY: storage outlives the pool
        let pool = unsafe {
            ObjectPool::from_raw("objects", storage.as_mut_ptr().cast(), capacity, slot_size)
        };
        pool.thread();

        let (first, a) = pool.reserve();
        let (second, b) = pool.reserve();
        assert_eq!((first, second), (1, 2));
        assert_eq!(a.as_ptr() as usize % ObjectPool::SLOT_ALIGN, 0);
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            ObjectPool::stride(slot_size)
        );
        assert_eq!(pool.index_of(b), 2);

        pool.release(a);
        assert_eq!(pool.free_len(), 2);
        let (again, c) = pool.reserve();
        assert_eq!(again, 1);
        assert_eq!(c, a);
    }

    #[test]
    #[should_panic(expected = "is not a slot of this pool")]
    fn foreign_address_is_rejected() {
        let mut storage = aligned(ObjectPool::required_size(3, 16));
        // SAFETY: storage outlives the pool
        let pool = unsafe {
            ObjectPool::from_raw("objects", storage.as_mut_ptr().cast(), 3, 16)
        };
        pool.thread();
        let (_, slot) = pool.reserve();
        // SAFETY: still inside the storage, just misaligned to the stride
        let inside = unsafe { NonNull::new_unchecked(slot.as_ptr().add(4)) };
        pool.release(inside);
    }
}
