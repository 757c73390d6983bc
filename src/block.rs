//! The boundary-tag block model shared by the chunk and direct paths.

use core::mem;
use core::ptr::NonNull;

use bitstruct::bitstruct;
use static_assertions::const_assert_eq;

/// Granularity of the allocator: user pointers are aligned to this, and
/// block sizes are stored in these units.
pub const ALIGNMENT: usize = 16;

/// Size in bytes of one boundary tag.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Smallest user body a block may carry. A block freed later must be able to
/// hold its free-list links in the body, so nothing smaller is ever handed
/// out.
pub const MIN_ALLOC: usize = mem::size_of::<FreeLinks>();

pub const DIRECT_HEADER_SIZE: usize = mem::size_of::<DirectHeader>();

bitstruct! {
    /// One boundary tag. A copy lives at the start *and* the end of every
    /// in-chunk block, and the two must always agree; backward coalescing
    /// reads the predecessor's end copy.
    ///
    /// `size` counts `ALIGNMENT` units and includes both tags. Size 0 is the
    /// sentinel terminating a chunk's block sequence. For a direct block,
    /// `size` covers the whole mapping and only serves to recover the page
    /// count on release.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[repr(transparent)]
    pub struct BlockHeader(u64) {
        pub size: u64 = 0..62;
        pub direct: bool = 62;
        pub free: bool = 63;
    }
}

impl BlockHeader {
    pub const fn zeroed() -> Self {
        Self(0)
    }

    /// Total block length in bytes, both tags included.
    pub fn bytes(self) -> usize {
        self.size() as usize * ALIGNMENT
    }
}

/// Free-list links, overlaid on the first bytes of a free block's body.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FreeLinks {
    pub next: Option<NonNull<FreeBlock>>,
    pub prev: Option<NonNull<FreeBlock>>,
}

impl FreeLinks {
    pub const NONE: FreeLinks = FreeLinks {
        next: None,
        prev: None,
    };
}

/// A free block as it sits in chunk memory: start tag, then links.
#[repr(C)]
pub struct FreeBlock {
    pub header: BlockHeader,
    pub links: FreeLinks,
}

/// Ties a direct allocation back to its mapping. Sits immediately before the
/// block tag of a direct allocation, inside the mapped region itself.
#[repr(C)]
pub struct DirectHeader {
    pub map_start: *mut u8,
}

// The layout arithmetic all over this crate counts on these exact sizes.
const_assert_eq!(HEADER_SIZE, 8);
const_assert_eq!(MIN_ALLOC, 16);
const_assert_eq!(DIRECT_HEADER_SIZE, 8);
const_assert_eq!(mem::size_of::<FreeBlock>(), HEADER_SIZE + MIN_ALLOC);

/// Rewrite `block`'s end tag from its start tag.
///
/// # Safety
///
/// `block` must point at the start tag of a block whose `size` field is
/// accurate for the memory it occupies.
pub unsafe fn write_end_tag(block: NonNull<BlockHeader>) {
    let header = block.read();
    let end = block.byte_add(header.bytes() - HEADER_SIZE);
    end.write(header);
}
