//! The page-granular backing primitive the heap draws from.

/// Page size the heap assumes unless overridden through the const generic.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Provides page-aligned backing memory to [`Heap`](crate::heap::Heap).
/// `PAGE_SIZE` must be a power of two and at least the allocator granularity.
///
/// # Safety
///
/// The heap trusts implementations completely. They must uphold:
///
///   - `allocate(pages)` returns either null or a pointer to
///     `pages * PAGE_SIZE` contiguous bytes, readable and writable, aligned
///     to `PAGE_SIZE`, and exclusive to the caller until freed
///   - `free` releases exactly a region previously returned by `allocate`
///   - both are safe to call from multiple threads concurrently
pub unsafe trait PageProvider<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    /// Allocate `pages` contiguous pages. Null means out of memory.
    fn allocate(&self, pages: usize) -> *mut u8;

    /// Release the `pages` pages starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate(pages)` on this provider and not
    /// have been freed since.
    unsafe fn free(&self, ptr: *mut u8, pages: usize);
}

#[cfg(feature = "mmap")]
mod mmap {
    use super::PageProvider;

    use core::ptr;

    /// Backs the heap with anonymous private mappings. `PAGE_SIZE` has to
    /// match the system page size (or a divisor of it) for the alignment
    /// guarantee to hold.
    pub struct MmapProvider;

    unsafe impl<const PAGE_SIZE: usize> PageProvider<PAGE_SIZE> for MmapProvider {
        fn allocate(&self, pages: usize) -> *mut u8 {
            let address = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    pages * PAGE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if address == libc::MAP_FAILED {
                return ptr::null_mut();
            }

            address.cast()
        }

        unsafe fn free(&self, ptr: *mut u8, pages: usize) {
            libc::munmap(ptr.cast(), pages * PAGE_SIZE);
        }
    }
}

#[cfg(feature = "mmap")]
pub use mmap::MmapProvider;
