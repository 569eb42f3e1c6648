//! Errors reported by handle tables
use zerogc_vmem::MemoryError;

use crate::handle::{Handle, HandleType};

/// An error from a handle table operation.
///
/// Bulk allocation never fails outright (it returns fewer handles),
/// these errors come from the single-handle conveniences,
/// from checked accessors and from invariant verification.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("Out of memory: requested {requested} handles but only allocated {allocated}")]
    OutOfMemory { requested: usize, allocated: usize },
    #[error("Table already has the maximum of {max} segments")]
    SegmentLimit { max: usize },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("Not a live handle of this table: {0:?}")]
    InvalidHandle(Handle),
    #[error("Handles of type {0:?} have no user data")]
    NoUserData(HandleType),
    #[error("Invalid heap {heap} (only {num_heaps} heaps)")]
    InvalidHeap { heap: usize, num_heaps: usize },
    #[error("Corrupt handle table: {0}")]
    Corrupt(String),
}
impl HandleError {
    /// Whether the error came from exhausting memory
    /// (either the operating system's or the configured limits)
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            HandleError::OutOfMemory { .. }
                | HandleError::SegmentLimit { .. }
                | HandleError::Memory(_)
        )
    }
}
