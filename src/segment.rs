//! Segments: the unit of memory a handle table grows by.
//!
//! All of the bookkeeping for a segment lives here in ordinary Rust memory
//! (guarded by the table's structural lock),
//! while the value slots themselves live in the segment's mapped region.
//! The first page of the region is committed eagerly and carries
//! a [SegmentTag] identifying the owning table.
//!
//! Blocks move between the segment's free list and one circular
//! allocation chain per [BlockTag]. See [chains] for the list surgery,
//! [block] for the per-block free masks and [pages] for commit management.
use std::ptr::NonNull;
use std::sync::Arc;

use zerogc_vmem::{MemoryError, Region, VirtualMemory};

use crate::handle::{BlockTag, Handle, HandleSlot, HandleType, ObjectRef};
use crate::layout::*;
use crate::utils::{round_up, TableId};

mod block;
mod chains;
mod pages;

pub(crate) use self::block::FreeOutcome;

const SEGMENT_MAGIC: u64 = u64::from_be_bytes(*b"zghandle");

/// Written at the start of every segment's header page
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct SegmentTag {
    magic: u64,
    table: u64,
    sequence: u32,
}

/// A snapshot of a segment's bookkeeping
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub id: SegmentId,
    /// Monotonic creation order within the table
    pub sequence: u32,
    pub read_only: bool,
    /// The number of blocks whose pages are committed
    pub committed_blocks: usize,
    /// Blocks below this line stay committed when trimming
    pub decommit_line: usize,
    /// Every block at or past this line is free
    pub empty_line: usize,
    /// The free list, in link order
    pub free_list: Vec<BlockIndex>,
    /// The number of blocks in each handle type's chain, indexed by [HandleType::index]
    pub handle_blocks: [usize; HandleType::COUNT],
    /// The number of blocks holding user data
    pub data_blocks: usize,
    /// The number of allocated handles
    pub live_handles: usize,
    pub needs_resort: bool,
    pub needs_scavenging: bool,
}

pub(crate) struct Segment {
    region: Region,
    page_size: usize,
    pub(crate) sequence: u32,
    /// Registered as a pre-existing region.
    ///
    /// Read-only segments are never allocated from or restructured.
    pub(crate) read_only: bool,
    block_tags: [Option<BlockTag>; BLOCKS_PER_SEGMENT],
    /// Next block in either an allocation chain or the free list
    links: [Option<BlockIndex>; BLOCKS_PER_SEGMENT],
    /// The data block paired with each block (if any)
    user_data: [Option<BlockIndex>; BLOCKS_PER_SEGMENT],
    locks: [u8; BLOCKS_PER_SEGMENT],
    /// One bit per handle, set when the handle is free
    free_masks: [u32; BLOCKS_PER_SEGMENT * MASKS_PER_BLOCK],
    /// One generation tag per clump of handles
    generations: [u8; BLOCKS_PER_SEGMENT * CLUMPS_PER_BLOCK],
    free_list: Option<BlockIndex>,
    tails: [Option<BlockIndex>; BlockTag::COUNT],
    hints: [Option<BlockIndex>; BlockTag::COUNT],
    free_counts: [usize; BlockTag::COUNT],
    commit_line: usize,
    decommit_line: usize,
    empty_line: usize,
    needs_resort: bool,
    needs_scavenging: bool,
    /// Out-of-order insertions and scavenged blocks since the last resort
    disorder: u32,
}
impl Segment {
    /// Reserve a segment and commit its header page
    pub(crate) fn new(
        memory: &Arc<dyn VirtualMemory>,
        table: TableId,
        sequence: u32,
    ) -> Result<Segment, MemoryError> {
        let region = Region::reserve(memory, SEGMENT_SIZE, SEGMENT_SIZE)?;
        let page_size = region.page_size();
        let initial = round_up(HEADER_SIZE, page_size).min(SEGMENT_SIZE);
        region.commit(0, initial)?;
        unsafe {
            region.base().cast::<SegmentTag>().as_ptr().write(SegmentTag {
                magic: SEGMENT_MAGIC,
                table: table.value(),
                sequence,
            });
        }
        let mut links = [None; BLOCKS_PER_SEGMENT];
        for (index, link) in links.iter_mut().enumerate().take(BLOCKS_PER_SEGMENT - 1) {
            *link = Some(BlockIndex::new(index + 1));
        }
        Ok(Segment {
            region,
            page_size,
            sequence,
            read_only: false,
            block_tags: [None; BLOCKS_PER_SEGMENT],
            links,
            user_data: [None; BLOCKS_PER_SEGMENT],
            locks: [0; BLOCKS_PER_SEGMENT],
            free_masks: [MASK_EMPTY; BLOCKS_PER_SEGMENT * MASKS_PER_BLOCK],
            generations: [0; BLOCKS_PER_SEGMENT * CLUMPS_PER_BLOCK],
            free_list: Some(BlockIndex::new(0)),
            tails: [None; BlockTag::COUNT],
            hints: [None; BlockTag::COUNT],
            free_counts: [0; BlockTag::COUNT],
            commit_line: (initial - HEADER_SIZE) / BYTES_PER_BLOCK,
            decommit_line: 0,
            empty_line: 0,
            needs_resort: false,
            needs_scavenging: false,
            disorder: 0,
        })
    }
    #[inline]
    pub(crate) fn id(&self) -> SegmentId {
        SegmentId::from_base(self.base())
    }
    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.region.base().as_ptr() as usize
    }
    #[inline]
    pub(crate) fn tag(&self) -> SegmentTag {
        unsafe { self.region.base().cast::<SegmentTag>().as_ptr().read() }
    }
    /// Check the header tag was written by the specified table
    pub(crate) fn is_owned_by(&self, table: TableId) -> bool {
        let tag = self.tag();
        tag.magic == SEGMENT_MAGIC && tag.table == table.value() && tag.sequence == self.sequence
    }
    #[inline]
    fn values_ptr(&self) -> NonNull<HandleSlot> {
        unsafe {
            NonNull::new_unchecked(self.region.base().as_ptr().add(HEADER_SIZE) as *mut HandleSlot)
        }
    }
    #[inline]
    pub(crate) fn slot(&self, slot: usize) -> &HandleSlot {
        debug_assert!(
            slot < self.commit_line * HANDLES_PER_BLOCK,
            "Slot {} is not committed",
            slot
        );
        unsafe { &*self.values_ptr().as_ptr().add(slot) }
    }
    #[inline]
    pub(crate) fn handle_at(&self, slot: usize) -> Handle {
        unsafe { Handle::from_addr_unchecked(slot_address(self.base(), slot)) }
    }
    /// The user-data slot paired with the specified handle slot
    #[inline]
    pub(crate) fn user_data_slot(&self, slot: usize) -> Option<&HandleSlot> {
        let data = self.user_data[slot / HANDLES_PER_BLOCK]?;
        Some(self.slot(data.first_slot() + slot % HANDLES_PER_BLOCK))
    }
    #[inline]
    pub(crate) fn block_tag(&self, block: BlockIndex) -> Option<BlockTag> {
        self.block_tags[block.index()]
    }
    /// The type of an allocated handle, or `None` if the slot is not allocated
    pub(crate) fn allocated_type(&self, slot: usize) -> Option<HandleType> {
        let block = BlockIndex::new(slot / HANDLES_PER_BLOCK);
        let ty = self.block_tag(block)?.handle_type()?;
        if self.is_slot_free(slot) {
            None
        } else {
            Some(ty)
        }
    }
    #[inline]
    pub(crate) fn free_count(&self, tag: BlockTag) -> usize {
        self.free_counts[tag.chain()]
    }
    /// Whether no block is in use
    pub(crate) fn is_empty(&self) -> bool {
        self.block_tags.iter().all(Option::is_none)
    }
    #[inline]
    pub(crate) fn needs_resort(&self) -> bool {
        self.needs_resort
    }
    /// The number of allocated handles, computed from the free masks
    pub(crate) fn live_handles(&self) -> usize {
        BlockIndex::all()
            .filter(|&block| matches!(self.block_tag(block), Some(BlockTag::Handles(_))))
            .map(|block| self.allocated_in_block(block))
            .sum()
    }
    /// Reset the generation of the clump containing `slot`,
    /// so the next young collection scans it
    #[inline]
    pub(crate) fn reset_generation(&mut self, slot: usize) {
        self.generations[slot / HANDLES_PER_CLUMP] = 0;
    }
    #[inline]
    pub(crate) fn generation(&self, slot: usize) -> u8 {
        self.generations[slot / HANDLES_PER_CLUMP]
    }

    /// Visit every allocated handle of the specified type
    /// in clumps accepted by `scan_clump`, lowest address first.
    ///
    /// The callback receives the slot index, the value and the paired user data.
    pub(crate) fn for_each_handle<F>(
        &self,
        ty: HandleType,
        scan_clump: impl Fn(u8) -> bool,
        mut func: F,
    ) where
        F: FnMut(usize, &HandleSlot, Option<&HandleSlot>),
    {
        for block in BlockIndex::all().take(self.empty_line) {
            if self.block_tag(block) != Some(BlockTag::Handles(ty)) {
                continue;
            }
            for clump in 0..CLUMPS_PER_BLOCK {
                let first = block.first_slot() + clump * HANDLES_PER_CLUMP;
                if !scan_clump(self.generations[first / HANDLES_PER_CLUMP]) {
                    continue;
                }
                for slot in first..first + HANDLES_PER_CLUMP {
                    if self.is_slot_free(slot) {
                        continue;
                    }
                    func(slot, self.slot(slot), self.user_data_slot(slot));
                }
            }
        }
    }

    /// Age every in-use clump accepted by `scan_clump`, up to `max_generation`
    pub(crate) fn age_clumps(&mut self, scan_clump: impl Fn(u8) -> bool, max_generation: u8) {
        for block in BlockIndex::all().take(self.empty_line) {
            if !matches!(self.block_tag(block), Some(BlockTag::Handles(_))) {
                continue;
            }
            let first = block.index() * CLUMPS_PER_BLOCK;
            for age in &mut self.generations[first..first + CLUMPS_PER_BLOCK] {
                if scan_clump(*age) && *age < max_generation {
                    *age += 1;
                }
            }
        }
    }

    /// Lower the generation of clumps accepted by `scan_clump`
    /// to the youngest generation they reference
    pub(crate) fn demote_clumps(
        &mut self,
        scan_clump: impl Fn(u8) -> bool,
        mut generation_of: impl FnMut(ObjectRef) -> u8,
    ) {
        for block in BlockIndex::all().take(self.empty_line) {
            if !matches!(self.block_tag(block), Some(BlockTag::Handles(_))) {
                continue;
            }
            for clump in 0..CLUMPS_PER_BLOCK {
                let first = block.first_slot() + clump * HANDLES_PER_CLUMP;
                let age = self.generations[first / HANDLES_PER_CLUMP];
                if !scan_clump(age) {
                    continue;
                }
                let mut youngest = age;
                for slot in first..first + HANDLES_PER_CLUMP {
                    if self.is_slot_free(slot) {
                        continue;
                    }
                    let values = [
                        self.slot(slot).load(),
                        self.user_data_slot(slot).and_then(HandleSlot::load),
                    ];
                    for value in values.into_iter().flatten() {
                        youngest = youngest.min(generation_of(value));
                    }
                }
                self.generations[first / HANDLES_PER_CLUMP] = youngest;
            }
        }
    }

    /// Lock every block of the specified types and describe them,
    /// so their values can be read without holding the structural lock.
    pub(crate) fn begin_concurrent_scan(&mut self, types: &[HandleType]) -> SegmentView {
        let mut blocks = Vec::new();
        for block in BlockIndex::all().take(self.empty_line) {
            let Some(BlockTag::Handles(ty)) = self.block_tag(block) else {
                continue;
            };
            if types.contains(&ty) {
                self.lock_block(block);
                blocks.push((block, self.user_data[block.index()]));
            }
        }
        SegmentView {
            id: self.id(),
            values: self.values_ptr(),
            blocks,
        }
    }
    pub(crate) fn end_concurrent_scan(&mut self, view: &SegmentView) {
        debug_assert_eq!(view.id, self.id());
        for &(block, _) in &view.blocks {
            self.unlock_block(block);
        }
    }

    pub(crate) fn stats(&self) -> SegmentStats {
        let mut free_list = Vec::new();
        let mut next = self.free_list;
        while let Some(block) = next {
            if free_list.len() > BLOCKS_PER_SEGMENT {
                break; // Corrupt, but `verify` is the place to say so
            }
            free_list.push(block);
            next = self.links[block.index()];
        }
        let mut handle_blocks = [0; HandleType::COUNT];
        let mut data_blocks = 0;
        for tag in self.block_tags.iter().flatten() {
            match *tag {
                BlockTag::Handles(ty) => handle_blocks[ty.index()] += 1,
                BlockTag::UserData => data_blocks += 1,
            }
        }
        SegmentStats {
            id: self.id(),
            sequence: self.sequence,
            read_only: self.read_only,
            committed_blocks: self.commit_line,
            decommit_line: self.decommit_line,
            empty_line: self.empty_line,
            free_list,
            handle_blocks,
            data_blocks,
            live_handles: self.live_handles(),
            needs_resort: self.needs_resort,
            needs_scavenging: self.needs_scavenging,
        }
    }

    /// Check every structural invariant of the segment
    pub(crate) fn verify(&self) -> Result<(), String> {
        let mut seen = [false; BLOCKS_PER_SEGMENT];
        for chain in 0..BlockTag::COUNT {
            let tag = BlockTag::from_chain(chain);
            let Some(tail) = self.tails[chain] else {
                if self.free_counts[chain] != 0 {
                    return Err(format!(
                        "Empty {:?} chain has a free count of {}",
                        tag, self.free_counts[chain]
                    ));
                }
                if self.hints[chain].is_some() {
                    return Err(format!("Empty {:?} chain has an allocation hint", tag));
                }
                continue;
            };
            let Some(head) = self.links[tail.index()] else {
                return Err(format!("{:?} chain is not circular at {:?}", tag, tail));
            };
            let mut block = head;
            let mut free = 0;
            let mut hint_found = false;
            loop {
                if seen[block.index()] {
                    return Err(format!("{:?} is linked twice ({:?} chain)", block, tag));
                }
                seen[block.index()] = true;
                if self.block_tag(block) != Some(tag) {
                    return Err(format!(
                        "{:?} has tag {:?} but is linked in the {:?} chain",
                        block,
                        self.block_tag(block),
                        tag
                    ));
                }
                if block.index() >= self.empty_line {
                    return Err(format!("{:?} is in use past the empty line", block));
                }
                hint_found |= self.hints[chain] == Some(block);
                free += HANDLES_PER_BLOCK - self.allocated_in_block(block);
                if block == tail {
                    break;
                }
                block = match self.links[block.index()] {
                    Some(next) => next,
                    None => return Err(format!("{:?} chain is broken after {:?}", tag, block)),
                };
            }
            if !hint_found {
                return Err(format!(
                    "{:?} chain hint {:?} is not in the chain",
                    tag, self.hints[chain]
                ));
            }
            if free != self.free_counts[chain] {
                return Err(format!(
                    "{:?} chain has {} free handles but a free count of {}",
                    tag, free, self.free_counts[chain]
                ));
            }
        }
        let mut next = self.free_list;
        while let Some(block) = next {
            if seen[block.index()] {
                return Err(format!("{:?} is linked twice (free list)", block));
            }
            seen[block.index()] = true;
            if self.block_tag(block).is_some() {
                return Err(format!("{:?} is on the free list but tagged", block));
            }
            if !self.block_is_empty(block) {
                return Err(format!("{:?} is on the free list with allocated handles", block));
            }
            next = self.links[block.index()];
        }
        if let Some(missing) = seen.iter().position(|seen| !seen) {
            return Err(format!("Block #{} is unreachable", missing));
        }
        for block in BlockIndex::all() {
            if let Some(data) = self.user_data[block.index()] {
                let paired = matches!(
                    self.block_tag(block),
                    Some(BlockTag::Handles(ty)) if ty.has_user_data()
                );
                if !paired || self.block_tag(data) != Some(BlockTag::UserData) {
                    return Err(format!("{:?} has a bad user data pairing with {:?}", block, data));
                }
                if !self.block_is_locked(data) {
                    return Err(format!("Data block {:?} is not locked", data));
                }
            }
        }
        if self.empty_line > self.commit_line {
            return Err(format!(
                "Empty line {} is past the commit line {}",
                self.empty_line, self.commit_line
            ));
        }
        Ok(())
    }
}

/// The blocks of a segment locked for a concurrent scan.
///
/// The view holds raw pointers into the segment,
/// which stay valid because the table refuses to free or trim
/// the segment while it is the async scan target,
/// and locked blocks are never scavenged.
pub(crate) struct SegmentView {
    pub(crate) id: SegmentId,
    values: NonNull<HandleSlot>,
    blocks: Vec<(BlockIndex, Option<BlockIndex>)>,
}
impl SegmentView {
    /// Visit the non-null handles in the locked blocks
    ///
    /// ## Safety
    /// The segment must still be the table's async scan target,
    /// with the view's blocks locked.
    pub(crate) unsafe fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(Handle, &HandleSlot, Option<&HandleSlot>),
    {
        for &(block, data) in &self.blocks {
            for index in 0..HANDLES_PER_BLOCK {
                let slot = block.first_slot() + index;
                let value = &*self.values.as_ptr().add(slot);
                if value.is_null() {
                    continue;
                }
                let user_data =
                    data.map(|data| &*self.values.as_ptr().add(data.first_slot() + index));
                func(
                    Handle::from_addr_unchecked(slot_address(self.id.base(), slot)),
                    value,
                    user_data,
                );
            }
        }
    }
}
