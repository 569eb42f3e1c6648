//! Dependent handle promotion.
//!
//! A dependent handle keeps its secondary alive only while its primary is alive.
//! Promoting a secondary can make another handle's primary reachable,
//! so the scan repeats until a pass promotes nothing new.
//!
//! Each heap has its own [DhContext], which moves
//! `Init -> Converging -> Done` within a collection
//! and is reset by the next collection's initial scan.
use slog::{debug, trace};

use crate::handle::HandleType;
use crate::table::HandleTable;

use super::{GcScanner, PromoteFlags, ScanContext};

/// Where a heap is in the dependent handle fixed point
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DhState {
    /// Not yet scanned in the current collection
    Init,
    /// The last pass promoted something, so another is needed
    Converging,
    /// The last pass promoted nothing
    Done,
}

/// Per-heap dependent handle scanning state
#[derive(Debug)]
pub struct DhContext {
    state: DhState,
    heap: usize,
    condemned: u8,
    max_generation: u8,
    /// Whether the last pass promoted any secondary
    promoted: bool,
    /// Whether the last pass saw a primary that wasn't promoted
    unpromoted_primaries: bool,
    passes: usize,
}
impl DhContext {
    pub fn new(heap: usize) -> DhContext {
        DhContext {
            state: DhState::Init,
            heap,
            condemned: 0,
            max_generation: 0,
            promoted: false,
            unpromoted_primaries: false,
            passes: 0,
        }
    }
    #[inline]
    pub fn state(&self) -> DhState {
        self.state
    }
    #[inline]
    pub fn heap(&self) -> usize {
        self.heap
    }
    /// The number of passes made in the current collection
    #[inline]
    pub fn passes(&self) -> usize {
        self.passes
    }
    #[inline]
    pub fn promoted(&self) -> bool {
        self.promoted
    }
    /// Whether the last pass found dependent handles whose primary
    /// is not (yet) promoted
    #[inline]
    pub fn unpromoted_primaries(&self) -> bool {
        self.unpromoted_primaries
    }

    fn bind(&mut self, ctx: &ScanContext) {
        debug_assert_eq!(ctx.heap, self.heap);
        self.state = DhState::Init;
        self.condemned = ctx.condemned;
        self.max_generation = ctx.max_generation;
        self.promoted = false;
        self.unpromoted_primaries = false;
        self.passes = 0;
    }

    /// Make a single pass over the heap's dependent handles,
    /// returning whether any secondary was promoted
    fn scan_pass<S: GcScanner + ?Sized>(
        &mut self,
        table: &HandleTable,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> bool {
        debug_assert_eq!(ctx.condemned, self.condemned);
        let mut promoted = 0usize;
        let mut unpromoted_primaries = false;
        {
            let state = table.lock_state();
            for segment in &state.segments {
                segment.for_each_handle(
                    HandleType::Dependent,
                    |age| ctx.scans_clump(age),
                    |_, primary, secondary| {
                        let Some(primary) = primary.load() else { return };
                        if !scanner.is_promoted(primary, ctx) {
                            unpromoted_primaries = true;
                            return;
                        }
                        let Some(secondary) = secondary else { return };
                        match secondary.load() {
                            Some(object) if !scanner.is_promoted(object, ctx) => {
                                scanner.promote(secondary, ctx, PromoteFlags::empty());
                                promoted += 1;
                            }
                            _ => {}
                        }
                    },
                );
            }
        }
        self.passes += 1;
        self.promoted = promoted > 0;
        self.unpromoted_primaries = unpromoted_primaries;
        trace!(
            table.logger(), "Scanned dependent handles";
            "pass" => self.passes,
            "promoted" => promoted,
            "unpromoted_primaries" => unpromoted_primaries,
        );
        self.promoted
    }

    /// The first pass of a collection, binding the context to `ctx`
    pub(crate) fn initial_scan<S: GcScanner + ?Sized>(
        &mut self,
        table: &HandleTable,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> bool {
        self.bind(ctx);
        let promoted = self.scan_pass(table, scanner, ctx);
        self.state = if promoted {
            DhState::Converging
        } else {
            DhState::Done
        };
        promoted
    }

    /// Another pass after the collector has traced what the last pass promoted.
    ///
    /// Once a pass promotes nothing the context is done,
    /// and further passes are idempotent.
    pub(crate) fn rescan<S: GcScanner + ?Sized>(
        &mut self,
        table: &HandleTable,
        scanner: &mut S,
        ctx: &ScanContext,
    ) -> bool {
        if self.state == DhState::Init {
            return self.initial_scan(table, scanner, ctx);
        }
        let promoted = self.scan_pass(table, scanner, ctx);
        if promoted {
            self.state = DhState::Converging;
        } else {
            if self.state != DhState::Done {
                debug!(
                    table.logger(), "Dependent handles converged";
                    "passes" => self.passes,
                    "unpromoted_primaries" => self.unpromoted_primaries,
                );
            }
            self.state = DhState::Done;
        }
        promoted
    }
}
