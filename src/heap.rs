//! The heap: chunk-list management, free-and-coalesce, the direct-mapped
//! path, and the C-surface entry points.
//!
//! Small requests are served first-fit from the chunks, under the heap's one
//! mutex. Requests strictly above [`DIRECT_THRESHOLD`], and over-aligned
//! requests, get a dedicated mapping and never touch the mutex at all.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use log::trace;
use spin::Mutex;

use crate::block::{
    self, BlockHeader, DirectHeader, FreeBlock, ALIGNMENT, DIRECT_HEADER_SIZE, HEADER_SIZE,
    MIN_ALLOC,
};
use crate::chunk::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::provider::{PageProvider, DEFAULT_PAGE_SIZE};

/// Requests strictly above this many bytes bypass the chunks and map their
/// own pages.
pub const DIRECT_THRESHOLD: usize = 32768;

/// Extra pages tacked onto every new chunk to amortize future requests.
pub const PREALLOC_PAGES: usize = 16;

/// The chunk list. Lives behind the heap mutex.
struct ChunkList {
    first: Option<NonNull<ChunkHeader>>,
}

// SAFETY: chunk memory is only ever reached through the mutex owning this
// list.
unsafe impl Send for ChunkList {}

/// A boundary-tag heap over a [`PageProvider`].
///
/// All methods take `&self`; a `Heap` in a `static` serves a whole process.
/// The chunk state is serialized by one internal mutex, which is also held
/// across provider calls on the chunk path.
pub struct Heap<P, const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    provider: P,
    chunks: Mutex<ChunkList>,
}

impl<P: PageProvider<PAGE_SIZE>, const PAGE_SIZE: usize> Heap<P, PAGE_SIZE> {
    pub const fn new(provider: P) -> Self {
        assert!(PAGE_SIZE.is_power_of_two());
        assert!(PAGE_SIZE >= ALIGNMENT);
        Heap {
            provider,
            chunks: Mutex::new(ChunkList { first: None }),
        }
    }

    /// Allocate `size` bytes aligned to the 16-byte granularity. Null if
    /// `size` is 0 or the provider is out of memory.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        if size > DIRECT_THRESHOLD {
            return self.alloc_direct(size, ALIGNMENT);
        }

        let size = size.next_multiple_of(ALIGNMENT).max(MIN_ALLOC);

        let mut list = self.chunks.lock();
        let mut cursor = list.first;
        while let Some(chunk) = cursor {
            // SAFETY: listed chunks stay live while the mutex is held.
            unsafe {
                if let Some(ptr) = ChunkHeader::allocate(chunk, size) {
                    return ptr.as_ptr();
                }
                cursor = chunk.as_ref().next;
            }
        }

        self.grow(&mut list, size)
    }

    /// Allocate a zeroed array of `nelem` elements of `elsize` bytes.
    pub fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8 {
        // The multiplication is deliberately unchecked; a wrapped product is
        // the caller's bug.
        let total = nelem.wrapping_mul(elsize);
        let target = self.malloc(total);
        if !target.is_null() {
            unsafe { target.write_bytes(0, total) };
        }
        target
    }

    /// Move `ptr`'s contents into an allocation of `size` bytes. A null `ptr`
    /// acts like `malloc`; `size` 0 frees `ptr` and returns null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by this heap.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            // Some programs (grep, notably) take issue with realloc(NULL, 0)
            // returning null, so hand out a minimum-size block instead.
            if ptr.is_null() {
                return self.malloc(MIN_ALLOC);
            }
            self.free(ptr);
            return ptr::null_mut();
        }

        let target = self.malloc(size);
        if !target.is_null() && !ptr.is_null() {
            let header = ptr.cast::<BlockHeader>().sub(1).read();
            let old_size = header.bytes() - 2 * HEADER_SIZE;
            ptr::copy_nonoverlapping(ptr, target, size.min(old_size));
            self.free(ptr);
        }
        target
    }

    /// Release `ptr`. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by this heap.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let header = ptr.byte_sub(HEADER_SIZE).cast::<BlockHeader>();
        if header.read().direct() {
            return self.free_direct(header);
        }

        let mut list = self.chunks.lock();
        self.free_in_chunk(&mut list, header.cast::<FreeBlock>());
    }

    /// Allocate `size` bytes aligned to `alignment`. Null if either argument
    /// is 0. Alignments up to the granularity are plain `malloc`; anything
    /// larger gets a dedicated mapping regardless of size, since chunks
    /// cannot cheaply satisfy it.
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        if alignment == 0 || size == 0 {
            return ptr::null_mut();
        }

        if alignment <= ALIGNMENT {
            return self.malloc(size);
        }

        self.alloc_direct(size, alignment)
    }

    /// Store an `alignment`-aligned allocation of `size` bytes through
    /// `memptr`. Always returns 0; a failed allocation stores null.
    pub fn posix_memalign(&self, memptr: &mut *mut u8, alignment: usize, size: usize) -> i32 {
        *memptr = self.aligned_alloc(alignment, size);
        0
    }

    /// Create a chunk sized for `size` plus preallocation and serve the
    /// request from it. The list mutex must be held.
    fn grow(&self, list: &mut ChunkList, size: usize) -> *mut u8 {
        // Room for the chunk header, the new block's tags, the remainder's
        // tags, and the sentinel, rounded up to whole pages.
        let pages =
            (size + CHUNK_HEADER_SIZE + 5 * HEADER_SIZE).div_ceil(PAGE_SIZE) + PREALLOC_PAGES;

        let Some(mem) = NonNull::new(self.provider.allocate(pages)) else {
            return ptr::null_mut();
        };
        assert_eq!(mem.addr().get() % PAGE_SIZE, 0);

        trace!("new chunk: {} pages at {:p}", pages, mem);

        // SAFETY: the provider handed us `pages` exclusive writable pages.
        unsafe {
            let user = ChunkHeader::init(mem, pages * PAGE_SIZE, size);
            let mut chunk = mem.cast::<ChunkHeader>();
            chunk.as_mut().next = list.first;
            list.first = Some(chunk);
            user.as_ptr()
        }
    }

    /// Give `block` back to its chunk: mark it free, coalesce with both
    /// neighbors, and return the chunk to the provider if that emptied it
    /// (unless it is the last chunk standing). The list mutex must be held.
    unsafe fn free_in_chunk(&self, list: &mut ChunkList, mut block: NonNull<FreeBlock>) {
        // Find the owning chunk and its predecessor in the list.
        let mut prev_chunk: Option<NonNull<ChunkHeader>> = None;
        let mut cursor = list.first;
        let chunk = loop {
            let Some(candidate) = cursor else {
                // Not our pointer. Misuse is undefined; keep the heap intact.
                debug_assert!(false, "freed pointer belongs to no chunk");
                return;
            };
            if ChunkHeader::contains(candidate, block.cast()) {
                break candidate;
            }
            prev_chunk = Some(candidate);
            cursor = candidate.as_ref().next;
        };

        {
            let header = &mut block.as_mut().header;
            *header = header.with_free(true);
        }
        ChunkHeader::push_free(chunk, block);

        // Merge with the following block, unless it is the sentinel.
        let next = block
            .cast::<u8>()
            .byte_add(block.as_ref().header.bytes())
            .cast::<BlockHeader>();
        let next_header = next.read();
        if next_header.size() != 0 && next_header.free() {
            let header = &mut block.as_mut().header;
            *header = header.with_size(header.size() + next_header.size());
            ChunkHeader::unlink_free(chunk, next.cast::<FreeBlock>());
        }

        // Merge into the preceding block, located through its end tag. The
        // freed block is still the list head, so unlinking it is cheap.
        if block.addr().get() - CHUNK_HEADER_SIZE != chunk.addr().get() {
            let before = block.cast::<BlockHeader>().byte_sub(HEADER_SIZE).read();
            if before.free() {
                let mut prev = block
                    .cast::<u8>()
                    .byte_sub(before.bytes())
                    .cast::<FreeBlock>();
                {
                    let header = &mut prev.as_mut().header;
                    *header = header.with_size(header.size() + block.as_ref().header.size());
                }
                ChunkHeader::unlink_free(chunk, block);
                block = prev;
            }
        }

        // A chunk reduced to one free block goes back to the provider --
        // unless it is the only chunk left.
        let chunk_size = chunk.as_ref().size as usize;
        if block.addr().get() == chunk.addr().get() + CHUNK_HEADER_SIZE
            && chunk_size == block.as_ref().header.bytes() + CHUNK_HEADER_SIZE + HEADER_SIZE
        {
            let sole = prev_chunk.is_none() && chunk.as_ref().next.is_none();
            if !sole {
                match prev_chunk {
                    Some(mut prev) => prev.as_mut().next = chunk.as_ref().next,
                    None => list.first = chunk.as_ref().next,
                }
                trace!("chunk released: {} bytes at {:p}", chunk_size, chunk);
                self.provider
                    .free(chunk.cast::<u8>().as_ptr(), chunk_size / PAGE_SIZE);
                return;
            }
        }

        block::write_end_tag(block.cast());
    }

    /// Serve a request from its own mapping. The layout reserves enough lead
    /// room that the user pointer lands on `alignment` while still leaving
    /// space for the direct header and the block tag right before it.
    fn alloc_direct(&self, size: usize, alignment: usize) -> *mut u8 {
        let offset = (alignment + DIRECT_HEADER_SIZE + HEADER_SIZE - 1) / alignment * alignment
            - DIRECT_HEADER_SIZE
            - HEADER_SIZE;
        let pages = (offset + DIRECT_HEADER_SIZE + HEADER_SIZE + size).div_ceil(PAGE_SIZE);

        let mem = self.provider.allocate(pages);
        if mem.is_null() {
            return ptr::null_mut();
        }

        trace!("direct map: {} pages at {:p} for {} bytes", pages, mem, size);

        // SAFETY: the provider handed us `pages` exclusive writable pages.
        unsafe {
            let direct = mem.add(offset).cast::<DirectHeader>();
            direct.write(DirectHeader { map_start: mem });

            let header = direct.add(1).cast::<BlockHeader>();
            header.write(
                BlockHeader::zeroed()
                    .with_direct(true)
                    .with_size((pages * PAGE_SIZE / ALIGNMENT) as u64),
            );

            header.add(1).cast::<u8>()
        }
    }

    /// Unmap a direct allocation. Touches no shared state, so no lock.
    unsafe fn free_direct(&self, header: NonNull<BlockHeader>) {
        let direct = header.byte_sub(DIRECT_HEADER_SIZE).cast::<DirectHeader>();
        let map_start = direct.read().map_start;
        let pages = header.read().bytes() / PAGE_SIZE;

        trace!("direct unmap: {} pages at {:p}", pages, map_start);

        self.provider.free(map_start, pages);
    }
}

unsafe impl<P: PageProvider<PAGE_SIZE>, const PAGE_SIZE: usize> GlobalAlloc
    for Heap<P, PAGE_SIZE>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            self.malloc(layout.size())
        } else {
            self.aligned_alloc(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return Heap::realloc(self, ptr, new_size);
        }

        // Over-aligned storage must stay over-aligned; going through malloc
        // would lose that.
        let target = self.aligned_alloc(layout.align(), new_size);
        if !target.is_null() && !ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, target, layout.size().min(new_size));
            self.free(ptr);
        }
        target
    }
}



#[cfg(test)]
mod stress {
    //! Randomized interleaving of the entry points, re-checking every live
    //! region before each touch. This is the workhorse: it catches split,
    //! coalesce, and copy bugs that targeted tests miss.

    use super::test_support::*;
    use super::*;

    use std::vec;
    use std::vec::Vec;

    use proptest::prelude::*;

    const MAGIC: u8 = 0xc9;
    const SLOTS: usize = 16;
    const MAX_SIZE: usize = 65_536;

    #[derive(Clone, Debug)]
    enum Op {
        Malloc { slot: usize, size: usize },
        Realloc { slot: usize, size: usize },
        Free { slot: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..SLOTS, 0..MAX_SIZE).prop_map(|(slot, size)| Op::Malloc { slot, size }),
            (0..SLOTS, 0..MAX_SIZE).prop_map(|(slot, size)| Op::Realloc { slot, size }),
            (0..SLOTS).prop_map(|slot| Op::Free { slot }),
        ]
    }

    unsafe fn fill(ptr: *mut u8, len: usize) {
        ptr.write_bytes(MAGIC, len);
    }

    unsafe fn verify(ptr: *mut u8, len: usize) {
        let region = std::slice::from_raw_parts(ptr, len);
        let overwritten = region.iter().filter(|&&byte| byte != MAGIC).count();
        assert_eq!(overwritten, 0, "{overwritten} bytes of a live region lost");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn random_interleaving_corrupts_nothing(
            ops in proptest::collection::vec(op_strategy(), 1..150),
        ) {
            let (heap, state) = new_heap();
            let mut slots: Vec<Option<(*mut u8, usize)>> = vec![None; SLOTS];

            for op in ops {
                match op {
                    Op::Malloc { slot, size } => unsafe {
                        if let Some((old, old_size)) = slots[slot].take() {
                            verify(old, old_size);
                            heap.free(old);
                        }

                        let p = heap.malloc(size);
                        if size == 0 {
                            prop_assert!(p.is_null());
                        } else {
                            prop_assert!(!p.is_null());
                            prop_assert_eq!(p as usize % ALIGNMENT, 0);
                            fill(p, size);
                            slots[slot] = Some((p, size));
                        }
                    },
                    Op::Realloc { slot, size } => unsafe {
                        let (old, old_size) = slots[slot].take().unwrap_or((ptr::null_mut(), 0));
                        if !old.is_null() {
                            verify(old, old_size);
                        }

                        let p = heap.realloc(old, size);
                        if size == 0 && !old.is_null() {
                            // Frees and returns nothing.
                            prop_assert!(p.is_null());
                        } else {
                            prop_assert!(!p.is_null());
                            prop_assert_eq!(p as usize % ALIGNMENT, 0);
                            verify(p, old_size.min(size));
                            let size = size.max(if old.is_null() { MIN_ALLOC } else { size });
                            fill(p, size);
                            slots[slot] = Some((p, size));
                        }
                    },
                    Op::Free { slot } => unsafe {
                        if let Some((old, old_size)) = slots[slot].take() {
                            verify(old, old_size);
                            heap.free(old);
                        }
                    },
                }

                check_heap(&heap);
            }

            for entry in &mut slots {
                if let Some((ptr, size)) = entry.take() {
                    unsafe {
                        verify(ptr, size);
                        heap.free(ptr);
                    }
                }
            }

            // With everything freed, the heap holds at most the one retained
            // chunk and not a single direct mapping.
            check_heap(&heap);
            prop_assert!(chunk_count(&heap) <= 1);
            prop_assert_eq!(state.outstanding_regions(), chunk_count(&heap));
        }
    }
}
