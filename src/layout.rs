//! Segment geometry and handle address decoding.
//!
//! A segment is a [SEGMENT_SIZE] region aligned to its own size.
//! The first [HEADER_SIZE] bytes hold a small identifying tag,
//! and the rest is an array of handle-sized value slots,
//! grouped into blocks of [HANDLES_PER_BLOCK].
//!
//! Because segments are aligned, a handle's segment is recovered
//! by masking off the low bits of its address.
use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::handle::Handle;

/// The size (and alignment) of a segment in bytes
pub const SEGMENT_SIZE: usize = 0x10000;
/// The bytes reserved at the start of every segment for its header
pub const HEADER_SIZE: usize = 0x1000;
/// The size of a single value slot
pub const HANDLE_SIZE: usize = mem::size_of::<usize>();
/// The number of handles in a block
pub const HANDLES_PER_BLOCK: usize = 64;
/// The number of handles tracked by a single free mask
pub const HANDLES_PER_MASK: usize = 32;
/// The number of free masks per block
pub const MASKS_PER_BLOCK: usize = HANDLES_PER_BLOCK / HANDLES_PER_MASK;
/// The number of handles sharing a single generation tag
pub const HANDLES_PER_CLUMP: usize = 16;
/// The number of generation tags per block
pub const CLUMPS_PER_BLOCK: usize = HANDLES_PER_BLOCK / HANDLES_PER_CLUMP;
/// The size of a block's values in bytes
pub const BYTES_PER_BLOCK: usize = HANDLES_PER_BLOCK * HANDLE_SIZE;
/// The number of blocks that fit in a segment after its header
pub const BLOCKS_PER_SEGMENT: usize = (SEGMENT_SIZE - HEADER_SIZE) / BYTES_PER_BLOCK;
/// The number of handles in a segment
pub const HANDLES_PER_SEGMENT: usize = BLOCKS_PER_SEGMENT * HANDLES_PER_BLOCK;
/// A mask word with every handle free
pub const MASK_EMPTY: u32 = u32::MAX;
/// A mask word with every handle allocated
pub const MASK_FULL: u32 = 0;

const _: () = assert!(BLOCKS_PER_SEGMENT <= u8::MAX as usize);
const _: () = assert!(HANDLES_PER_MASK == u32::BITS as usize);

/// The index of a block inside its segment.
///
/// Links between blocks are `Option<BlockIndex>`,
/// with `None` terminating a chain.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockIndex(u8);
impl BlockIndex {
    #[inline]
    pub fn new(index: usize) -> BlockIndex {
        assert!(index < BLOCKS_PER_SEGMENT, "Invalid block: {}", index);
        BlockIndex(index as u8)
    }
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
    /// The index of the block's first handle in the segment
    #[inline]
    pub const fn first_slot(self) -> usize {
        self.index() * HANDLES_PER_BLOCK
    }
    /// Iterate over every block in a segment, lowest address first
    pub fn all() -> impl DoubleEndedIterator<Item = BlockIndex> {
        (0..BLOCKS_PER_SEGMENT).map(|index| BlockIndex(index as u8))
    }
}
impl Debug for BlockIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a segment by its base address
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SegmentId(usize);
impl SegmentId {
    #[inline]
    pub(crate) const fn from_base(base: usize) -> SegmentId {
        SegmentId(base)
    }
    /// The base address of the segment
    #[inline]
    pub const fn base(self) -> usize {
        self.0
    }
}
impl Debug for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({:#x})", self.0)
    }
}
impl slog::Value for SegmentId {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:#x}", self.0))
    }
}

/// A handle split into its segment and slot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodedHandle {
    pub segment: SegmentId,
    /// The index of the value slot, relative to the first slot of the segment
    pub slot: usize,
}
impl DecodedHandle {
    #[inline]
    pub fn block(&self) -> BlockIndex {
        BlockIndex((self.slot / HANDLES_PER_BLOCK) as u8)
    }
    /// The index of the slot within its block
    #[inline]
    pub fn slot_in_block(&self) -> usize {
        self.slot % HANDLES_PER_BLOCK
    }
}

/// Split a handle into its segment base and slot index.
///
/// This only validates the shape of the address
/// (a properly aligned slot past the header).
/// Whether the segment actually belongs to a table is checked by the table.
#[inline]
pub fn decode(handle: Handle) -> Option<DecodedHandle> {
    let addr = handle.addr();
    let base = addr & !(SEGMENT_SIZE - 1);
    let offset = addr & (SEGMENT_SIZE - 1);
    if offset < HEADER_SIZE || (offset - HEADER_SIZE) % HANDLE_SIZE != 0 {
        return None;
    }
    Some(DecodedHandle {
        segment: SegmentId(base),
        slot: (offset - HEADER_SIZE) / HANDLE_SIZE,
    })
}

/// Compute the address of a slot in the segment with the specified base
#[inline]
pub(crate) const fn slot_address(base: usize, slot: usize) -> usize {
    base + HEADER_SIZE + slot * HANDLE_SIZE
}
