//! Handle allocation within a single block.
//!
//! Each block has [MASKS_PER_BLOCK] mask words with one bit per handle.
//! A set bit means the handle is free.
use crate::handle::{BlockTag, Handle};
use crate::layout::*;

use super::Segment;

/// Tallies from freeing a batch of handles
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub(crate) struct FreeOutcome {
    /// Handles actually returned to their block
    pub freed: usize,
    /// Handles that were already free
    pub double_frees: usize,
    /// Handles that don't point into an allocated block
    pub invalid: usize,
    /// Handles freed from a block of a different type than requested
    pub type_mismatches: usize,
    /// Handles that still held a value when they reached the prepared path
    pub live_values: usize,
}
impl FreeOutcome {
    #[inline]
    pub(crate) fn has_violations(&self) -> bool {
        self.double_frees != 0
            || self.invalid != 0
            || self.type_mismatches != 0
            || self.live_values != 0
    }
}

/// Claim up to `count` free bits from `mask`, lowest first,
/// passing each claimed bit index to `func`.
///
/// Returns the number of bits claimed.
#[inline]
fn claim_bits(mask: &mut u32, count: usize, mut func: impl FnMut(usize)) -> usize {
    let mut claimed = 0;
    while claimed < count && *mask != 0 {
        let bit = mask.trailing_zeros();
        *mask &= *mask - 1;
        func(bit as usize);
        claimed += 1;
    }
    claimed
}

/// The mask of a fresh block after allocating its first `count` handles
#[inline]
fn initial_mask(count: usize) -> u32 {
    if count >= HANDLES_PER_MASK {
        MASK_FULL
    } else {
        MASK_EMPTY << count
    }
}

impl Segment {
    #[inline]
    fn mask_index(block: BlockIndex, mask: usize) -> usize {
        block.index() * MASKS_PER_BLOCK + mask
    }
    #[inline]
    pub(super) fn block_masks(&self, block: BlockIndex) -> &[u32] {
        let first = Self::mask_index(block, 0);
        &self.free_masks[first..first + MASKS_PER_BLOCK]
    }
    #[inline]
    pub(crate) fn is_slot_free(&self, slot: usize) -> bool {
        self.free_masks[slot / HANDLES_PER_MASK] & (1 << (slot % HANDLES_PER_MASK)) != 0
    }
    /// Whether every handle in the block is free
    #[inline]
    pub(crate) fn block_is_empty(&self, block: BlockIndex) -> bool {
        self.block_masks(block).iter().all(|&mask| mask == MASK_EMPTY)
    }
    #[inline]
    pub(crate) fn allocated_in_block(&self, block: BlockIndex) -> usize {
        self.block_masks(block)
            .iter()
            .map(|mask| mask.count_zeros() as usize)
            .sum()
    }
    #[inline]
    pub(crate) fn block_is_locked(&self, block: BlockIndex) -> bool {
        self.locks[block.index()] != 0
    }
    #[inline]
    pub(crate) fn lock_block(&mut self, block: BlockIndex) {
        let lock = &mut self.locks[block.index()];
        *lock = lock.checked_add(1).unwrap_or_else(|| panic!("Too many locks on {:?}", block));
    }
    #[inline]
    pub(crate) fn unlock_block(&mut self, block: BlockIndex) {
        let lock = &mut self.locks[block.index()];
        debug_assert!(*lock > 0, "{:?} is not locked", block);
        *lock = lock.saturating_sub(1);
    }

    /// Allocate handles from a block fresh off the free list.
    ///
    /// Every mask must still be empty, so the first `count` handles are taken.
    pub(super) fn alloc_initial(
        &mut self,
        block: BlockIndex,
        out: &mut Vec<Handle>,
        count: usize,
    ) -> usize {
        debug_assert!(count > 0 && count <= HANDLES_PER_BLOCK);
        let count = count.min(HANDLES_PER_BLOCK);
        let mut remaining = count;
        for mask in 0..MASKS_PER_BLOCK {
            if remaining == 0 {
                break;
            }
            let word = &mut self.free_masks[Self::mask_index(block, mask)];
            debug_assert_eq!(*word, MASK_EMPTY);
            let taken = remaining.min(HANDLES_PER_MASK);
            *word = initial_mask(taken);
            remaining -= taken;
        }
        out.extend((0..count).map(|index| self.handle_at(block.first_slot() + index)));
        count
    }

    /// Allocate up to `count` handles from a block that may already be in use
    pub(super) fn alloc_from_block(
        &mut self,
        block: BlockIndex,
        out: &mut Vec<Handle>,
        count: usize,
    ) -> usize {
        let base = self.base();
        let mut allocated = 0;
        for mask in 0..MASKS_PER_BLOCK {
            if allocated == count {
                break;
            }
            let first_slot = block.first_slot() + mask * HANDLES_PER_MASK;
            let word = &mut self.free_masks[Self::mask_index(block, mask)];
            allocated += claim_bits(word, count - allocated, |bit| {
                out.push(unsafe {
                    Handle::from_addr_unchecked(slot_address(base, first_slot + bit))
                })
            });
        }
        allocated
    }

    /// Free a run of handles that belong to `block`.
    ///
    /// Returns the number of handles consumed,
    /// stopping at the first handle outside the block.
    /// `scavenge` is set when the block is left empty.
    pub(super) fn free_in_block(
        &mut self,
        block: BlockIndex,
        handles: &[Handle],
        outcome: &mut FreeOutcome,
        scavenge: &mut bool,
    ) -> usize {
        let data = self.user_data[block.index()];
        let mut consumed = 0;
        let mut all_free = true;
        let mut freed = 0;
        while let Some(&handle) = handles.get(consumed) {
            let Some(decoded) = decode(handle) else { break };
            if decoded.segment != self.id() || decoded.block() != block {
                break;
            }
            let slot = decoded.slot;
            if !self.slot(slot).is_null() {
                outcome.live_values += 1;
                self.slot(slot).store(None);
            }
            if let Some(data) = data {
                self.slot(data.first_slot() + decoded.slot_in_block()).store(None);
            }
            let word = &mut self.free_masks[slot / HANDLES_PER_MASK];
            let bit = 1 << (slot % HANDLES_PER_MASK);
            if *word & bit != 0 {
                outcome.double_frees += 1;
            } else {
                *word |= bit;
                freed += 1;
            }
            consumed += 1;
        }
        for &mask in self.block_masks(block) {
            all_free &= mask == MASK_EMPTY;
        }
        outcome.freed += freed;
        if let Some(tag) = self.block_tag(block) {
            self.free_counts[tag.chain()] += freed;
            *scavenge |= all_free;
        }
        debug_assert!(matches!(self.block_tag(block), Some(BlockTag::Handles(_))));
        consumed
    }
}
