//! Segmented GC handle tables.
//!
//! Handles are slots the runtime gives out so native code can refer to
//! managed objects: strong and pinned roots, weak references,
//! and dependent handles that keep a secondary object alive
//! for exactly as long as a primary one.
//!
//! Handles live in 64 KiB [segments](layout::SEGMENT_SIZE),
//! which are split into blocks of 64 handles. Each [HandleTable] grows
//! segment by segment and commits pages lazily as blocks are handed out.
//! A [HandleStore] holds one table per heap and implements
//! the scans a generational collector needs, including the
//! dependent handle fixed point.

pub mod config;
pub mod errors;
pub mod handle;
pub mod layout;
pub mod scan;
mod segment;
pub mod store;
pub mod table;
pub mod utils;

pub use crate::config::HandleTableConfig;
pub use crate::errors::HandleError;
pub use crate::handle::{Handle, HandleSlot, HandleType, ObjectRef};
pub use crate::layout::{BlockIndex, SegmentId};
pub use crate::scan::dependent::{DhContext, DhState};
pub use crate::scan::{GcScanner, PromoteFlags, ScanContext, ScanPhase};
pub use crate::segment::SegmentStats;
pub use crate::store::HandleStore;
pub use crate::table::{AsyncScanGuard, HandleTable, MaintenanceReport, TableStats};
pub use zerogc_vmem::{MemoryError, SystemMemory, VirtualMemory};
