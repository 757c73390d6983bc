//! A boundary-tag heap allocator built on a page-granular backing primitive.
//!
//! Small requests are carved out of *chunks*: page-aligned regions obtained
//! from a [`PageProvider`] and subdivided into blocks delimited by matching
//! headers at both ends (boundary tags). Within a chunk, free blocks form a
//! doubly-linked list searched first-fit; frees coalesce eagerly with both
//! neighbors. Requests above a threshold, and all over-aligned requests, map
//! their own pages instead.
//!
//! [`Heap`] exposes the classic C surface (`malloc`, `calloc`, `realloc`,
//! `free`, `aligned_alloc`, `posix_memalign`) and implements
//! [`core::alloc::GlobalAlloc`], so a `static` heap can replace the platform
//! allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: nalloc::Heap<nalloc::MmapProvider> = nalloc::Heap::new(nalloc::MmapProvider);
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

mod block;
mod chunk;
pub mod heap;
pub mod provider;

pub use heap::{Heap, DIRECT_THRESHOLD, PREALLOC_PAGES};
#[cfg(feature = "mmap")]
pub use provider::MmapProvider;
pub use provider::{PageProvider, DEFAULT_PAGE_SIZE};
