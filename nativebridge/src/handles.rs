use core::ptr::NonNull;

/// 32-bit surrogate for a managed object. `0` is null.
pub type Handle = i32;

pub const NULL_HANDLE: Handle = 0;

/// Marker for constructors that wrap a raw handle without touching its
/// reference count. The caller is responsible for a matching `reference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalUse {
    Only,
}

/// The null literal mirrors compare against: `string == NULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Null;

pub const NULL: Null = Null;

/// Managed-side hook invoked when a count drops from 1 to 0.
pub type ReleaseFn = unsafe extern "C" fn(Handle);

/// Per-handle reference counts living in the memory region lent by the
/// managed side.
///
/// The table never allocates handles. The managed side hands them out and
/// recycles them once the release hook fired, so a count of `0` means
/// "free for reuse".
pub struct RefCountTable {
    name: &'static str,
    counts: NonNull<i32>,
    capacity: usize,
    release: ReleaseFn,
}

impl RefCountTable {
    pub const fn required_size(capacity: usize) -> usize {
        capacity * size_of::<i32>()
    }

    /// # Safety
    /// `counts` must point to `capacity` writable, 4-byte aligned `i32`s
    /// that outlive the table.
    pub unsafe fn from_raw(
        name: &'static str,
        counts: *mut i32,
        capacity: usize,
        release: ReleaseFn,
    ) -> Self {
        Self {
            name,
            counts: NonNull::new(counts).unwrap_or(NonNull::dangling()),
            capacity,
            release,
        }
    }

    #[inline]
    fn slot(&self, handle: Handle) -> *mut i32 {
        assert!(
            handle >= 0 && (handle as usize) < self.capacity,
            "{}: handle {handle} out of range 0..{}",
            self.name,
            self.capacity
        );
        // SAFETY: bounds checked above
        unsafe { self.counts.as_ptr().add(handle as usize) }
    }

    #[inline]
    pub fn reference(&self, handle: Handle) {
        if handle == NULL_HANDLE {
            return;
        }
        let slot = self.slot(handle);
        // SAFETY: in bounds, the bridge is single threaded
        unsafe { *slot += 1 };
    }

    /// Decrements and invokes the table's release hook on 1 -> 0.
    #[inline]
    pub fn dereference(&self, handle: Handle) {
        if self.dereference_no_release(handle) {
            log::trace!("{}: releasing handle {handle}", self.name);
            // SAFETY: release hooks are validated when the tables are read
            unsafe { (self.release)(handle) };
        }
    }

    /// Decrements and returns whether the count reached zero. The caller
    /// then runs its own type-specific release instead of the table's.
    #[inline]
    pub fn dereference_no_release(&self, handle: Handle) -> bool {
        if handle == NULL_HANDLE {
            return false;
        }
        let slot = self.slot(handle);
        // SAFETY: in bounds, the bridge is single threaded
        let count = unsafe { *slot };
        debug_assert!(
            count > 0,
            "{}: refcount underflow on handle {handle}",
            self.name
        );
        // SAFETY: in bounds
        unsafe { *slot = count - 1 };
        count == 1
    }

    pub fn count(&self, handle: Handle) -> i32 {
        if handle == NULL_HANDLE {
            return 0;
        }
        // SAFETY: in bounds
        unsafe { *self.slot(handle) }
    }

    /// Number of handles with a non-zero count.
    pub fn live(&self) -> usize {
        (1..self.capacity)
            // SAFETY: 1..capacity is in bounds
            .filter(|&i| unsafe { *self.counts.as_ptr().add(i) } != 0)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl core::fmt::Debug for RefCountTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefCountTable")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .finish()
    }
}
