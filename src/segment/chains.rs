//! Allocation chains and the block free list.
//!
//! Every [BlockTag] with blocks in use has a circular chain,
//! addressed through its tail (so the head is one link away).
//! Free blocks form a singly linked list ending in `None`.
//! A resort rebuilds everything in ascending address order.
use crate::handle::{BlockTag, Handle, HandleType};
use crate::layout::*;

use super::{FreeOutcome, Segment};

/// The result of taking a block (and its data block) off the free list
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BlockGrant {
    /// A block for a type without user data
    Single(BlockIndex),
    /// A block together with its paired data block
    Both { block: BlockIndex, data: BlockIndex },
    /// The free list could not supply everything that was needed
    NeitherAvailable,
    /// Only one of the pair could be supplied and it was returned
    PartialRolledBack,
}
impl BlockGrant {
    #[inline]
    pub(crate) fn block(self) -> Option<BlockIndex> {
        match self {
            BlockGrant::Single(block) | BlockGrant::Both { block, .. } => Some(block),
            BlockGrant::NeitherAvailable | BlockGrant::PartialRolledBack => None,
        }
    }
}

impl Segment {
    /// Move the head of the free list onto the chain for `tag`,
    /// committing its page if needed.
    fn take_free_block(&mut self, tag: BlockTag, mut update_hint: bool) -> Option<BlockIndex> {
        let block = self.free_list?;
        if block.index() >= self.empty_line {
            if block.index() >= self.commit_line && !self.commit_next_page() {
                return None;
            }
            self.empty_line = block.index() + 1;
        }
        self.free_list = self.links[block.index()];
        let chain = tag.chain();
        match self.tails[chain] {
            None => {
                self.links[block.index()] = Some(block);
                update_hint = true;
            }
            Some(tail) => {
                self.links[block.index()] = self.links[tail.index()];
                self.links[tail.index()] = Some(block);
                self.needs_resort = true;
                if block < tail {
                    self.disorder += 1;
                }
            }
        }
        self.block_tags[block.index()] = Some(tag);
        self.tails[chain] = Some(block);
        if update_hint {
            self.hints[chain] = Some(block);
        }
        self.free_counts[chain] += HANDLES_PER_BLOCK;
        let first_clump = block.index() * CLUMPS_PER_BLOCK;
        self.generations[first_clump..first_clump + CLUMPS_PER_BLOCK].fill(0);
        debug_assert!(self.block_is_empty(block));
        Some(block)
    }

    /// Take a block for `ty` off the free list.
    ///
    /// Types with user data need two blocks, which are granted together or not at all.
    pub(crate) fn insert_block(&mut self, ty: HandleType, update_hint: bool) -> BlockGrant {
        if !ty.has_user_data() {
            return match self.take_free_block(BlockTag::Handles(ty), update_hint) {
                Some(block) => BlockGrant::Single(block),
                None => BlockGrant::NeitherAvailable,
            };
        }
        match self.free_list {
            Some(first) if self.links[first.index()].is_some() => {}
            _ => return BlockGrant::NeitherAvailable,
        }
        let data = self.take_free_block(BlockTag::UserData, false);
        let block = self.take_free_block(BlockTag::Handles(ty), update_hint);
        match (block, data) {
            (Some(block), Some(data)) => {
                self.user_data[block.index()] = Some(data);
                self.lock_block(data);
                BlockGrant::Both { block, data }
            }
            (None, None) => BlockGrant::NeitherAvailable,
            (block, data) => {
                if block.is_some() {
                    self.remove_free_blocks(BlockTag::Handles(ty), None);
                }
                if data.is_some() {
                    self.remove_free_blocks(BlockTag::UserData, None);
                }
                BlockGrant::PartialRolledBack
            }
        }
    }

    /// Return every empty, unlocked block on the chain for `tag` to the free list.
    ///
    /// Empty blocks that are locked are left alone and reported through `scavenge_later`.
    pub(crate) fn remove_free_blocks(
        &mut self,
        tag: BlockTag,
        mut scavenge_later: Option<&mut bool>,
    ) {
        let chain = tag.chain();
        let Some(mut prev) = self.tails[chain] else {
            return;
        };
        let Some(mut start) = self.links[prev.index()] else {
            debug_assert!(false, "{:?} chain is not circular", tag);
            return;
        };
        let mut block = start;
        let mut cleanup_user_data = false;
        let mut removed = 0;
        let mut first_freed: Option<BlockIndex> = None;
        let mut last_freed: Option<BlockIndex> = None;
        loop {
            let Some(next) = self.links[block.index()] else {
                debug_assert!(false, "{:?} chain is broken at {:?}", tag, block);
                return;
            };
            if self.block_is_empty(block) {
                if self.block_is_locked(block) {
                    if let Some(ref mut flag) = scavenge_later {
                        **flag = true;
                    }
                } else {
                    if let Some(data) = self.user_data[block.index()].take() {
                        self.unlock_block(data);
                        cleanup_user_data = true;
                    }
                    self.block_tags[block.index()] = None;
                    match last_freed {
                        None => first_freed = Some(block),
                        Some(last) => self.links[last.index()] = Some(block),
                    }
                    last_freed = Some(block);
                    if prev != block {
                        self.links[prev.index()] = Some(next);
                        if self.tails[chain] == Some(block) {
                            self.tails[chain] = Some(prev);
                        }
                        if self.hints[chain] == Some(block) {
                            self.hints[chain] = Some(next);
                        }
                        block = prev;
                    } else {
                        // This was the last block in the chain
                        debug_assert_eq!(next, start);
                        self.tails[chain] = None;
                        self.hints[chain] = None;
                    }
                    removed += 1;
                }
            }
            if next == start {
                break;
            }
            if Some(start) == last_freed {
                start = next;
            }
            prev = block;
            block = next;
        }
        if let (Some(first), Some(last)) = (first_freed, last_freed) {
            self.links[last.index()] = self.free_list;
            self.free_list = Some(first);
            self.free_counts[chain] -= removed * HANDLES_PER_BLOCK;
            self.needs_resort = true;
            self.disorder += removed as u32;
        }
        if cleanup_user_data {
            self.remove_free_blocks(BlockTag::UserData, None);
        }
    }

    /// Rebuild every chain and the free list in ascending address order.
    ///
    /// If scavenging was deferred, empty unlocked blocks are returned first.
    pub(crate) fn resort_chains(&mut self) {
        if self.needs_scavenging {
            let mut cleanup_user_data = false;
            for block in BlockIndex::all().take(self.empty_line) {
                let Some(BlockTag::Handles(ty)) = self.block_tag(block) else {
                    continue;
                };
                if self.block_is_empty(block) && !self.block_is_locked(block) {
                    if let Some(data) = self.user_data[block.index()].take() {
                        self.unlock_block(data);
                        cleanup_user_data = true;
                    }
                    self.block_tags[block.index()] = None;
                    self.free_counts[ty.index()] -= HANDLES_PER_BLOCK;
                }
            }
            if cleanup_user_data {
                self.remove_free_blocks(BlockTag::UserData, None);
            }
            self.needs_scavenging = false;
        }
        let mut heads: [Option<BlockIndex>; BlockTag::COUNT] = [None; BlockTag::COUNT];
        let mut highest: [Option<BlockIndex>; BlockTag::COUNT] = [None; BlockTag::COUNT];
        let mut free_chain = None;
        let mut empty_line = None;
        let mut trailing_free = true;
        for block in BlockIndex::all().rev() {
            match self.block_tag(block) {
                Some(tag) => {
                    let chain = tag.chain();
                    trailing_free = false;
                    highest[chain].get_or_insert(block);
                    self.links[block.index()] = heads[chain];
                    heads[chain] = Some(block);
                }
                None => {
                    if trailing_free {
                        empty_line = Some(block);
                    }
                    self.links[block.index()] = free_chain;
                    free_chain = Some(block);
                }
            }
        }
        for chain in 0..BlockTag::COUNT {
            match (heads[chain], highest[chain]) {
                (Some(head), Some(tail)) => {
                    self.tails[chain] = Some(tail);
                    self.links[tail.index()] = Some(head);
                    let tag = BlockTag::from_chain(chain);
                    let hint_valid = self.hints[chain]
                        .map_or(false, |hint| self.block_tag(hint) == Some(tag));
                    if !hint_valid {
                        self.hints[chain] = Some(head);
                    }
                }
                _ => {
                    self.tails[chain] = None;
                    self.hints[chain] = None;
                    self.free_counts[chain] = 0;
                }
            }
        }
        self.free_list = free_chain;
        self.empty_line = empty_line.map_or(BLOCKS_PER_SEGMENT, BlockIndex::index);
        self.needs_resort = false;
        self.disorder = 0;
    }

    /// Resort eagerly once the chains have drifted too far out of order
    pub(crate) fn settle(&mut self, resort_threshold: u32) -> bool {
        if !self.read_only && self.needs_resort && self.disorder >= resort_threshold {
            self.resort_chains();
            true
        } else {
            false
        }
    }

    /// Allocate from blocks already on the chain for `ty`, starting at the hint
    fn alloc_from_chain(&mut self, ty: HandleType, out: &mut Vec<Handle>, count: usize) -> usize {
        let chain = ty.index();
        let count = self.free_counts[chain].min(count);
        if count == 0 {
            return 0;
        }
        let Some(mut block) = self.hints[chain] else {
            debug_assert!(false, "Free {:?} handles without a hint", ty);
            return 0;
        };
        let last = block;
        let mut remaining = count;
        let allocated = loop {
            let satisfied = self.alloc_from_block(block, out, remaining);
            if satisfied == remaining {
                self.hints[chain] = Some(block);
                break count;
            }
            remaining -= satisfied;
            match self.links[block.index()] {
                Some(next) if next != last => block = next,
                _ => {
                    debug_assert!(false, "{:?} free count is out of sync with the masks", ty);
                    break count - remaining;
                }
            }
        };
        self.free_counts[chain] -= allocated;
        allocated
    }

    /// Allocate by pulling fresh blocks off the free list
    fn alloc_from_free_list(
        &mut self,
        ty: HandleType,
        out: &mut Vec<Handle>,
        count: usize,
    ) -> usize {
        let mut remaining = count;
        while remaining > 0 {
            let Some(block) = self.insert_block(ty, remaining == count).block() else {
                break;
            };
            remaining -= self.alloc_initial(block, out, remaining.min(HANDLES_PER_BLOCK));
        }
        let allocated = count - remaining;
        self.free_counts[ty.index()] -= allocated;
        allocated
    }

    /// Allocate up to `count` handles, appending them to `out`
    pub(crate) fn alloc_handles(
        &mut self,
        ty: HandleType,
        out: &mut Vec<Handle>,
        count: usize,
    ) -> usize {
        if self.read_only {
            return 0;
        }
        let mut allocated = self.alloc_from_chain(ty, out, count);
        if allocated < count {
            allocated += self.alloc_from_free_list(ty, out, count - allocated);
        }
        allocated
    }

    /// Free handles belonging to this segment from the front of `handles`.
    ///
    /// Returns how many handles were consumed,
    /// stopping at the first handle from another segment.
    pub(crate) fn free_handles(
        &mut self,
        ty: HandleType,
        handles: &[Handle],
        outcome: &mut FreeOutcome,
    ) -> usize {
        let mut consumed = 0;
        let mut scavenge = [false; BlockTag::COUNT];
        while let Some(&handle) = handles.get(consumed) {
            let Some(decoded) = decode(handle) else { break };
            if decoded.segment != self.id() {
                break;
            }
            let block = decoded.block();
            match self.block_tag(block) {
                Some(BlockTag::Handles(actual)) => {
                    if actual != ty {
                        outcome.type_mismatches += 1;
                    }
                    let mut empty = false;
                    consumed +=
                        self.free_in_block(block, &handles[consumed..], outcome, &mut empty);
                    scavenge[actual.index()] |= empty;
                }
                _ => {
                    outcome.invalid += 1;
                    consumed += 1;
                }
            }
        }
        for (chain, &needed) in scavenge.iter().enumerate() {
            if needed {
                let mut scavenge_later = false;
                self.remove_free_blocks(BlockTag::from_chain(chain), Some(&mut scavenge_later));
                if scavenge_later {
                    self.needs_resort = true;
                    self.needs_scavenging = true;
                }
            }
        }
        consumed
    }
}
