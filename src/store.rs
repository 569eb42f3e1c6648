//! A handle table per heap.
//!
//! The store is the collector's entry point: every scan names its heap
//! through [ScanContext::heap], which selects both the table to walk
//! and the heap's dependent handle context.
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use slog::{debug, o, Logger};
use zerogc_vmem::{SystemMemory, VirtualMemory};

use crate::config::HandleTableConfig;
use crate::errors::HandleError;
use crate::scan::dependent::{DhContext, DhState};
use crate::scan::{self, GcScanner, ScanContext};
use crate::table::{HandleTable, MaintenanceReport};

/// The handle tables and dependent handle contexts of every heap
pub struct HandleStore {
    tables: Vec<HandleTable>,
    contexts: Vec<Mutex<DhContext>>,
    logger: Logger,
}
impl HandleStore {
    /// Create a store with the default configuration, discarding logs
    pub fn create(num_heaps: usize) -> Result<HandleStore, HandleError> {
        HandleStore::with_config(
            num_heaps,
            HandleTableConfig::default(),
            Logger::root(slog::Discard, o!()),
        )
    }
    pub fn with_config(
        num_heaps: usize,
        config: HandleTableConfig,
        logger: Logger,
    ) -> Result<HandleStore, HandleError> {
        HandleStore::with_memory(num_heaps, config, SystemMemory::shared(), logger)
    }
    pub fn with_memory(
        num_heaps: usize,
        config: HandleTableConfig,
        memory: Arc<dyn VirtualMemory>,
        logger: Logger,
    ) -> Result<HandleStore, HandleError> {
        if num_heaps == 0 {
            return Err(HandleError::InvalidHeap {
                heap: 0,
                num_heaps: 0,
            });
        }
        let tables = (0..num_heaps)
            .map(|heap| HandleTable::new(heap, config.clone(), Arc::clone(&memory), &logger))
            .collect::<Result<Vec<_>, _>>()?;
        let contexts = (0..num_heaps)
            .map(|heap| Mutex::new(DhContext::new(heap)))
            .collect();
        debug!(logger, "Created handle store"; "num_heaps" => num_heaps);
        Ok(HandleStore {
            tables,
            contexts,
            logger,
        })
    }
    #[inline]
    pub fn num_heaps(&self) -> usize {
        self.tables.len()
    }
    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
    #[inline]
    pub fn tables(&self) -> &[HandleTable] {
        &self.tables
    }
    /// The table of the specified heap
    pub fn table(&self, heap: usize) -> Result<&HandleTable, HandleError> {
        self.tables.get(heap).ok_or(HandleError::InvalidHeap {
            heap,
            num_heaps: self.tables.len(),
        })
    }
    fn context(&self, heap: usize) -> Result<(&HandleTable, &Mutex<DhContext>), HandleError> {
        Ok((self.table(heap)?, &self.contexts[heap]))
    }
    /// Where the heap's dependent handle scan currently stands
    pub fn dependent_state(&self, heap: usize) -> Result<DhState, HandleError> {
        Ok(self.context(heap)?.1.lock().state())
    }
    /// The number of dependent handle passes made in the heap's current collection
    pub fn dependent_passes(&self, heap: usize) -> Result<usize, HandleError> {
        Ok(self.context(heap)?.1.lock().passes())
    }

    /// Promote everything referenced by strong and pinned handles
    pub fn trace_roots<S: GcScanner + ?Sized>(
        &self,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> Result<(), HandleError> {
        scan::trace_roots(self.table(ctx.heap)?, scanner, ctx);
        Ok(())
    }

    /// Begin the dependent handle fixed point for a collection.
    ///
    /// Returns whether any secondary was promoted.
    pub fn initial_scan<S: GcScanner + ?Sized>(
        &self,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> Result<bool, HandleError> {
        let (table, context) = self.context(ctx.heap)?;
        Ok(context.lock().initial_scan(table, scanner, ctx))
    }

    /// Whether the last dependent handle pass saw primaries that weren't promoted.
    ///
    /// If there are none, promoting more objects can't make any difference.
    pub fn unpromoted_handles_exist(&self, ctx: &ScanContext) -> Result<bool, HandleError> {
        let (_, context) = self.context(ctx.heap)?;
        Ok(context.lock().unpromoted_primaries())
    }

    /// Repeat the dependent handle scan, returning whether anything was promoted
    pub fn rescan<S: GcScanner + ?Sized>(
        &self,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> Result<bool, HandleError> {
        let (table, context) = self.context(ctx.heap)?;
        Ok(context.lock().rescan(table, scanner, ctx))
    }

    /// Drive the dependent handle scan to its fixed point,
    /// returning the number of passes.
    ///
    /// This suits collectors whose `promote` marks transitively;
    /// otherwise interleave [Self::rescan] with tracing.
    pub fn scan_dependent_handles<S: GcScanner + ?Sized>(
        &self,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> Result<usize, HandleError> {
        let (table, context) = self.context(ctx.heap)?;
        let mut context = context.lock();
        context.initial_scan(table, scanner, ctx);
        while context.state() == DhState::Converging {
            context.rescan(table, scanner, ctx);
        }
        Ok(context.passes())
    }

    /// Clear short weak handles whose referents were not promoted,
    /// returning how many were cleared
    pub fn short_weak_ptr_scan<S: GcScanner + ?Sized>(
        &self,
        scanner: &S,
        ctx: &ScanContext,
    ) -> Result<usize, HandleError> {
        Ok(scan::short_weak_ptr_scan(self.table(ctx.heap)?, scanner, ctx))
    }

    /// Clear long weak handles whose referents were not promoted,
    /// and dependent handles whose primaries were not promoted.
    ///
    /// The dependent handle scan must have reached its fixed point.
    pub fn weak_ptr_scan<S: GcScanner + ?Sized>(
        &self,
        scanner: &S,
        ctx: &ScanContext,
    ) -> Result<usize, HandleError> {
        let (table, context) = self.context(ctx.heap)?;
        debug_assert_ne!(
            context.lock().state(),
            DhState::Converging,
            "Clearing dependent handles before they converged"
        );
        Ok(scan::weak_ptr_scan(table, scanner, ctx))
    }

    /// Give the collector a chance to update every reference to a moved object
    pub fn relocate_handles<S: GcScanner + ?Sized>(
        &self,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> Result<(), HandleError> {
        scan::relocate_handles(self.table(ctx.heap)?, scanner, ctx);
        Ok(())
    }

    /// Age the generation tags of every clump the collection visited
    pub fn age_handles(&self, ctx: &ScanContext) -> Result<(), HandleError> {
        scan::age_handles(self.table(ctx.heap)?, ctx);
        Ok(())
    }

    /// Lower generation tags to the youngest generation each clump references
    pub fn demote_handles<S: GcScanner + ?Sized>(
        &self,
        scanner: &S,
        ctx: &ScanContext,
    ) -> Result<(), HandleError> {
        scan::demote_handles(self.table(ctx.heap)?, scanner, ctx);
        Ok(())
    }

    /// Post-collection bookkeeping for the heap's table
    pub fn end_collection(&self, ctx: &ScanContext) -> Result<MaintenanceReport, HandleError> {
        Ok(self.table(ctx.heap)?.maintain())
    }
}
impl Debug for HandleStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleStore")
            .field("tables", &self.tables)
            .finish()
    }
}
