//! Scanning handle tables on behalf of a collector.
//!
//! The collector implements [GcScanner] and describes each pass with a [ScanContext].
//! Generational scans only visit clumps whose generation tag
//! is no older than the condemned generation,
//! except on a full collection where everything is visited.
use crate::handle::{HandleSlot, HandleType, ObjectRef};
use crate::table::HandleTable;

pub mod dependent;

/// Which half of a collection a scan belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScanPhase {
    /// Marking reachable objects
    Promote,
    /// Updating references to objects that moved
    Relocate,
}

/// Describes a single scan of a heap's handles
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanContext {
    /// The heap being scanned, which selects the table and dependent-handle context
    pub heap: usize,
    /// The oldest generation being collected
    pub condemned: u8,
    /// The oldest generation there is
    pub max_generation: u8,
    pub phase: ScanPhase,
    /// Whether the scan runs alongside mutators
    pub concurrent: bool,
}
impl ScanContext {
    pub fn promotion(heap: usize, condemned: u8, max_generation: u8) -> ScanContext {
        ScanContext {
            heap,
            condemned,
            max_generation,
            phase: ScanPhase::Promote,
            concurrent: false,
        }
    }
    pub fn relocation(heap: usize, condemned: u8, max_generation: u8) -> ScanContext {
        ScanContext {
            phase: ScanPhase::Relocate,
            ..ScanContext::promotion(heap, condemned, max_generation)
        }
    }
    /// Whether every generation is condemned
    #[inline]
    pub fn is_full(&self) -> bool {
        self.condemned >= self.max_generation
    }
    /// Whether a clump with the specified generation tag must be visited
    #[inline]
    pub fn scans_clump(&self, generation: u8) -> bool {
        self.is_full() || generation <= self.condemned
    }
}

bitflags::bitflags! {
    /// Extra information passed along with a promotion
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct PromoteFlags: u8 {
        /// The reference may point into the middle of an object
        const INTERIOR = 1 << 0;
        /// The referent must not move
        const PINNED = 1 << 1;
        /// Verify the referent belongs to the heap being scanned
        const CHECK_HEAP = 1 << 2;
    }
}

/// The collector's side of a handle scan.
///
/// Callbacks run while the table's structural lock is held,
/// so they must not call back into the table.
pub trait GcScanner {
    /// Report a live reference.
    ///
    /// During promotion this marks the referent,
    /// during relocation the collector rewrites the slot
    /// if the referent has moved.
    fn promote(&mut self, slot: &HandleSlot, ctx: &ScanContext, flags: PromoteFlags);
    /// Whether the object has been found reachable in this collection.
    ///
    /// Objects outside the condemned generations count as promoted.
    fn is_promoted(&self, object: ObjectRef, ctx: &ScanContext) -> bool;
    /// The generation the object currently lives in
    fn generation_of(&self, object: ObjectRef) -> u8 {
        let _ = object;
        0
    }
}

/// Visit every allocated handle of the specified type that the context scans
fn scan_type<F>(table: &HandleTable, ty: HandleType, ctx: &ScanContext, mut func: F)
where
    F: FnMut(&HandleSlot, Option<&HandleSlot>),
{
    let state = table.lock_state();
    for segment in &state.segments {
        segment.for_each_handle(ty, |age| ctx.scans_clump(age), |_, value, data| func(value, data));
    }
}

/// Promote the referents of strong and pinned handles
pub(crate) fn trace_roots<S: GcScanner + ?Sized>(
    table: &HandleTable,
    scanner: &mut S,
    ctx: &ScanContext,
) {
    let base = if table.config().verify_heap {
        PromoteFlags::CHECK_HEAP
    } else {
        PromoteFlags::empty()
    };
    for (ty, flags) in [
        (HandleType::Strong, base),
        (HandleType::Pinned, base | PromoteFlags::PINNED),
    ] {
        scan_type(table, ty, ctx, |slot, _| {
            if !slot.is_null() {
                scanner.promote(slot, ctx, flags);
            }
        });
    }
}

/// Clear weak handles of the specified type whose referents were not promoted
fn clear_unpromoted<S: GcScanner + ?Sized>(
    table: &HandleTable,
    ty: HandleType,
    scanner: &S,
    ctx: &ScanContext,
) -> usize {
    let mut cleared = 0;
    scan_type(table, ty, ctx, |slot, _| {
        if let Some(object) = slot.load() {
            if !scanner.is_promoted(object, ctx) {
                slot.store(None);
                cleared += 1;
            }
        }
    });
    cleared
}

pub(crate) fn short_weak_ptr_scan<S: GcScanner + ?Sized>(
    table: &HandleTable,
    scanner: &S,
    ctx: &ScanContext,
) -> usize {
    clear_unpromoted(table, HandleType::WeakShort, scanner, ctx)
}

/// Clear long weak handles, along with dependent handles whose primary died
pub(crate) fn weak_ptr_scan<S: GcScanner + ?Sized>(
    table: &HandleTable,
    scanner: &S,
    ctx: &ScanContext,
) -> usize {
    let mut cleared = clear_unpromoted(table, HandleType::WeakLong, scanner, ctx);
    scan_type(table, HandleType::Dependent, ctx, |primary, secondary| {
        if let Some(object) = primary.load() {
            if !scanner.is_promoted(object, ctx) {
                primary.store(None);
                if let Some(secondary) = secondary {
                    secondary.store(None);
                }
                cleared += 1;
            }
        }
    });
    cleared
}

/// Report every live reference so the collector can update moved objects
pub(crate) fn relocate_handles<S: GcScanner + ?Sized>(
    table: &HandleTable,
    scanner: &mut S,
    ctx: &ScanContext,
) {
    debug_assert_eq!(ctx.phase, ScanPhase::Relocate);
    for ty in HandleType::ALL {
        let flags = if ty == HandleType::Pinned {
            PromoteFlags::PINNED
        } else {
            PromoteFlags::empty()
        };
        scan_type(table, ty, ctx, |value, data| {
            if !value.is_null() {
                scanner.promote(value, ctx, flags);
            }
            if let Some(data) = data {
                if !data.is_null() {
                    scanner.promote(data, ctx, flags);
                }
            }
        });
    }
}

/// Advance the generation of every clump the collection visited
pub(crate) fn age_handles(table: &HandleTable, ctx: &ScanContext) {
    let mut state = table.lock_state();
    for segment in &mut state.segments {
        segment.age_clumps(|age| ctx.scans_clump(age), ctx.max_generation);
    }
}

/// Lower clump generations to match the youngest referent
pub(crate) fn demote_handles<S: GcScanner + ?Sized>(
    table: &HandleTable,
    scanner: &S,
    ctx: &ScanContext,
) {
    let mut state = table.lock_state();
    for segment in &mut state.segments {
        segment.demote_clumps(|age| ctx.scans_clump(age), |object| scanner.generation_of(object));
    }
}
