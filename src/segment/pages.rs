//! Committing and decommitting the pages behind a segment's blocks.
//!
//! Blocks below the commit line are backed by memory.
//! The decommit line trails one page behind the high water mark,
//! so freeing a few blocks doesn't immediately give their page back.
use zerogc_vmem::MemoryError;

use crate::layout::*;
use crate::utils::round_up;

use super::Segment;

/// The byte range released by a trim
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Trimmed {
    pub offset: usize,
    pub len: usize,
}

impl Segment {
    /// Commit the page following the commit line
    pub(super) fn commit_next_page(&mut self) -> bool {
        let offset = HEADER_SIZE + self.commit_line * BYTES_PER_BLOCK;
        debug_assert_eq!(offset % self.page_size, 0);
        let len = self.page_size.min(SEGMENT_SIZE - offset);
        if len == 0 || self.region.commit(offset, len).is_err() {
            return false;
        }
        self.decommit_line = self.commit_line;
        self.commit_line = (self.commit_line + len / BYTES_PER_BLOCK).min(BLOCKS_PER_SEGMENT);
        true
    }

    /// The page-aligned range past the empty line that is committed but unused
    fn excess_pages(&self) -> Option<(usize, usize)> {
        if self.empty_line >= self.decommit_line {
            return None;
        }
        let low = round_up(HEADER_SIZE + self.empty_line * BYTES_PER_BLOCK, self.page_size);
        let high = HEADER_SIZE + self.commit_line * BYTES_PER_BLOCK;
        if high > low {
            Some((low, high))
        } else {
            None
        }
    }

    /// Whether trimming would release any pages
    #[inline]
    pub(crate) fn needs_trim(&self) -> bool {
        !self.read_only && self.excess_pages().is_some()
    }

    /// Decommit pages past the empty line.
    ///
    /// The empty line must be accurate (a resort must have run since
    /// the last blocks were scavenged) for this to release anything.
    pub(crate) fn trim_excess_pages(&mut self) -> Result<Option<Trimmed>, MemoryError> {
        if self.read_only {
            return Ok(None);
        }
        let Some((low, high)) = self.excess_pages() else {
            return Ok(None);
        };
        unsafe { self.region.decommit(low, high - low)? };
        self.commit_line = (low - HEADER_SIZE) / BYTES_PER_BLOCK;
        self.decommit_line = match low.checked_sub(self.page_size) {
            Some(decommit) if decommit > HEADER_SIZE => (decommit - HEADER_SIZE) / BYTES_PER_BLOCK,
            _ => 0,
        };
        Ok(Some(Trimmed {
            offset: low,
            len: high - low,
        }))
    }
}
