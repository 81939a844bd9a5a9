use core::mem::{align_of, size_of};

/// A borrowed view over a contiguous byte range, typically a memory-mapped
/// file shared with another process.
///
/// `Region` is `Copy`: it carries no ownership. Whoever created the mapping
/// (or allocation) must keep it alive for as long as any `Region` derived
/// from it is in use.
#[derive(Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a base pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of every copy of the returned region.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer at `offset` bytes into the region.
    ///
    /// Panics if `offset` is out of range.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of region");
        unsafe { self.base.add(offset) }
    }

    /// Reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must contain a valid `T` and no thread may hold
    /// a conflicting `&mut T` to the same bytes. Cross-thread access must go
    /// through atomics inside `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + size_of::<T>() <= self.len, "read past region");
        debug_assert!(
            offset.is_multiple_of(align_of::<T>()),
            "misaligned region access"
        );
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutable reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// As [`Region::get`], and additionally no other reference to the same
    /// bytes may exist for the duration of the borrow.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        debug_assert!(offset + size_of::<T>() <= self.len, "write past region");
        debug_assert!(
            offset.is_multiple_of(align_of::<T>()),
            "misaligned region access"
        );
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }
}

/// An owned, zeroed, 64-byte-aligned heap allocation usable as a [`Region`].
///
/// Intended for tests and single-process use; production regions come from
/// `mmap`. Keep the `HeapRegion` alive while any derived [`Region`] is in
/// use (in threaded tests, move a clone of the `Arc`'d owner into each
/// thread).
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    base: *mut u8,
    len: usize,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    const ALIGN: usize = 64;

    /// Allocate `len` zeroed bytes, 64-byte aligned.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region must be non-empty");
        let layout = alloc::alloc::Layout::from_size_align(len, Self::ALIGN)
            .expect("invalid region layout");
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { base, len }
    }

    /// Borrowed view over the allocation.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as self; callers keep self
        // alive while the view is in use.
        unsafe { Region::from_raw(self.base, self.len) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        let layout = alloc::alloc::Layout::from_size_align(self.len, Self::ALIGN)
            .expect("invalid region layout");
        // SAFETY: base was allocated with this exact layout.
        unsafe { alloc::alloc::dealloc(self.base, layout) };
    }
}
