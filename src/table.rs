//! Handle tables.
//!
//! A table owns an address-ordered list of segments behind a single
//! structural lock. Every operation that touches block linkage takes the lock,
//! while reads and writes of handle values go straight to the (atomic) slots.
use std::cmp::Reverse;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use slog::{debug, o, trace, warn, Logger};
use zerogc_vmem::{SystemMemory, VirtualMemory};

use crate::config::HandleTableConfig;
use crate::errors::HandleError;
use crate::handle::{BlockTag, Handle, HandleSlot, HandleType, ObjectRef};
use crate::layout::{decode, DecodedHandle, SegmentId, HANDLES_PER_BLOCK, HANDLES_PER_SEGMENT};
use crate::segment::{FreeOutcome, Segment, SegmentStats};
use crate::utils::{MemorySize, TableId};

/// The number of handles the unprepared free path sorts on the stack
const SCRATCH_HANDLES: usize = HANDLES_PER_BLOCK;

/// A snapshot of a table's bookkeeping
#[derive(Debug, Clone)]
pub struct TableStats {
    pub live_handles: usize,
    /// Tolerated invariant violations (double frees, foreign handles)
    pub violations: usize,
    /// The segment currently targeted by a concurrent scan
    pub async_scan: Option<SegmentId>,
    pub segments: Vec<SegmentStats>,
}

/// What a maintenance pass did
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct MaintenanceReport {
    /// Segments whose chains were rebuilt
    pub resorted: usize,
    /// Bytes of pages returned to the operating system
    pub decommitted: usize,
    /// Empty segments that were released
    pub reclaimed: usize,
    /// Whether the cached live-handle count had drifted from the free masks
    pub resynced: bool,
}

pub(crate) struct TableState {
    /// Sorted by base address
    pub(crate) segments: Vec<Segment>,
    next_sequence: u32,
    /// The segment currently being walked by a concurrent scan
    async_scan: Option<SegmentId>,
}
impl TableState {
    #[inline]
    fn segment_index(&self, id: SegmentId) -> Option<usize> {
        self.segments.binary_search_by_key(&id, Segment::id).ok()
    }
    /// Find the segment holding a handle
    #[inline]
    pub(crate) fn locate(&self, handle: Handle) -> Option<(usize, DecodedHandle)> {
        let decoded = decode(handle)?;
        Some((self.segment_index(decoded.segment)?, decoded))
    }
    /// Older segments first, then descending addresses within a segment.
    ///
    /// Handles outside the table sort before everything else.
    fn free_order_key(&self, handle: Handle) -> (bool, u32, Reverse<usize>) {
        match self.locate(handle) {
            Some((index, _)) => (true, self.segments[index].sequence, Reverse(handle.addr())),
            None => (false, 0, Reverse(handle.addr())),
        }
    }
    /// Whether the segment may be released right now.
    ///
    /// A segment being walked by a concurrent scan must stay alive.
    #[inline]
    pub(crate) fn can_free_segment_now(&self, id: SegmentId) -> bool {
        self.async_scan != Some(id)
    }
}

/// A table of GC handles for a single heap
pub struct HandleTable {
    id: TableId,
    heap: usize,
    config: HandleTableConfig,
    memory: Arc<dyn VirtualMemory>,
    logger: Logger,
    state: Mutex<TableState>,
    live_handles: AtomicCell<usize>,
    violations: AtomicCell<usize>,
}
impl HandleTable {
    /// Create a table with the default configuration, discarding logs
    pub fn create() -> Result<HandleTable, HandleError> {
        HandleTable::with_config(
            HandleTableConfig::default(),
            Logger::root(slog::Discard, o!()),
        )
    }
    pub fn with_config(
        config: HandleTableConfig,
        logger: Logger,
    ) -> Result<HandleTable, HandleError> {
        HandleTable::new(0, config, SystemMemory::shared(), &logger)
    }
    /// Create a table for the specified heap,
    /// allocating its first segment from `memory`
    pub fn new(
        heap: usize,
        config: HandleTableConfig,
        memory: Arc<dyn VirtualMemory>,
        logger: &Logger,
    ) -> Result<HandleTable, HandleError> {
        let id = TableId::acquire();
        let logger = logger.new(o!("heap" => heap, "table" => id));
        let table = HandleTable {
            id,
            heap,
            config,
            memory,
            logger,
            state: Mutex::new(TableState {
                segments: Vec::new(),
                next_sequence: 0,
                async_scan: None,
            }),
            live_handles: AtomicCell::new(0),
            violations: AtomicCell::new(0),
        };
        {
            let mut state = table.state.lock();
            table.grow(&mut state)?;
        }
        Ok(table)
    }
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }
    #[inline]
    pub fn heap(&self) -> usize {
        self.heap
    }
    #[inline]
    pub fn config(&self) -> &HandleTableConfig {
        &self.config
    }
    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
    /// The number of allocated handles
    #[inline]
    pub fn live_handles(&self) -> usize {
        self.live_handles.load()
    }
    /// The number of handles of the specified type that can be allocated
    /// without taking new blocks off a free list
    pub fn free_count(&self, ty: HandleType) -> usize {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .map(|segment| segment.free_count(BlockTag::Handles(ty)))
            .sum()
    }
    #[inline]
    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, TableState> {
        self.state.lock()
    }

    /// Allocate a new segment and insert it in address order,
    /// returning its index
    #[cold]
    #[inline(never)]
    fn grow(&self, state: &mut TableState) -> Result<usize, HandleError> {
        if let Some(max) = self.config.max_segments {
            if state.segments.len() >= max {
                return Err(HandleError::SegmentLimit { max });
            }
        }
        let sequence = state.next_sequence;
        let segment = Segment::new(&self.memory, self.id, sequence)?;
        state.next_sequence = sequence.wrapping_add(1);
        let index = state
            .segments
            .partition_point(|existing| existing.base() < segment.base());
        debug!(
            self.logger, "Allocated handle segment";
            "segment" => segment.id(),
            "sequence" => sequence,
            "num_segments" => state.segments.len() + 1,
        );
        state.segments.insert(index, segment);
        Ok(index)
    }

    /// Allocate up to `count` handles of the specified type.
    ///
    /// Fewer handles are returned only when memory runs out.
    pub fn allocate_handles(&self, ty: HandleType, count: usize) -> Vec<Handle> {
        let mut handles = Vec::with_capacity(count.min(HANDLES_PER_SEGMENT));
        if count == 0 {
            return handles;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for segment in &mut state.segments {
            if handles.len() == count {
                break;
            }
            let wanted = count - handles.len();
            segment.alloc_handles(ty, &mut handles, wanted);
            segment.settle(self.config.resort_threshold);
        }
        while handles.len() < count {
            let index = match self.grow(state) {
                Ok(index) => index,
                Err(cause) => {
                    warn!(
                        self.logger, "Unable to allocate all handles";
                        "type" => ?ty,
                        "requested" => count,
                        "allocated" => handles.len(),
                        "cause" => %cause,
                    );
                    break;
                }
            };
            let segment = &mut state.segments[index];
            let wanted = count - handles.len();
            let allocated = segment.alloc_handles(ty, &mut handles, wanted);
            segment.settle(self.config.resort_threshold);
            if allocated == 0 {
                warn!(
                    self.logger, "Fresh segment could not supply handles";
                    "type" => ?ty,
                    "segment" => segment.id(),
                );
                break;
            }
        }
        self.live_handles.fetch_add(handles.len());
        drop(guard);
        trace!(
            self.logger, "Allocated handles";
            "type" => ?ty,
            "requested" => count,
            "allocated" => handles.len(),
        );
        handles
    }

    /// Allocate a single handle holding `value`
    pub fn allocate_handle(
        &self,
        ty: HandleType,
        value: Option<ObjectRef>,
    ) -> Result<Handle, HandleError> {
        let handle = self
            .allocate_handles(ty, 1)
            .pop()
            .ok_or(HandleError::OutOfMemory {
                requested: 1,
                allocated: 0,
            })?;
        if value.is_some() {
            self.store(handle, value)?;
        }
        Ok(handle)
    }

    /// Allocate a dependent handle keeping `secondary` alive while `primary` is
    pub fn allocate_dependent(
        &self,
        primary: ObjectRef,
        secondary: ObjectRef,
    ) -> Result<Handle, HandleError> {
        let handle = self.allocate_handle(HandleType::Dependent, Some(primary))?;
        self.set_user_data(handle, Some(secondary))?;
        Ok(handle)
    }

    /// Free handles that are already null and sorted in free order.
    ///
    /// Handles that still hold values are cleared, but count as violations.
    pub fn free_handles_prepared(&self, ty: HandleType, handles: &[Handle]) {
        if handles.is_empty() {
            return;
        }
        let outcome = {
            let mut guard = self.state.lock();
            self.free_locked(&mut guard, ty, handles)
        };
        self.finish_free(ty, handles.len(), outcome);
    }

    /// Free a batch of handles in any order, clearing their values
    pub fn free_handles(&self, ty: HandleType, handles: &[Handle]) {
        if handles.len() <= SCRATCH_HANDLES {
            let mut scratch = handles
                .iter()
                .copied()
                .collect::<ArrayVec<Handle, SCRATCH_HANDLES>>();
            self.free_unprepared(ty, &mut scratch);
            return;
        }
        let mut buffer = Vec::new();
        match buffer.try_reserve_exact(handles.len()) {
            Ok(()) => {
                buffer.extend_from_slice(handles);
                self.free_unprepared(ty, &mut buffer);
            }
            Err(_) => {
                warn!(
                    self.logger, "Unable to allocate a sort buffer, freeing in small batches";
                    "count" => handles.len(),
                );
                for chunk in handles.chunks(SCRATCH_HANDLES) {
                    let mut scratch = chunk
                        .iter()
                        .copied()
                        .collect::<ArrayVec<Handle, SCRATCH_HANDLES>>();
                    self.free_unprepared(ty, &mut scratch);
                }
            }
        }
    }

    #[inline]
    pub fn free_handle(&self, ty: HandleType, handle: Handle) {
        self.free_handles(ty, &[handle])
    }

    fn free_unprepared(&self, ty: HandleType, handles: &mut [Handle]) {
        if handles.is_empty() {
            return;
        }
        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            handles.sort_unstable_by_key(|&handle| state.free_order_key(handle));
            for &handle in handles.iter() {
                if let Some((index, decoded)) = state.locate(handle) {
                    let segment = &state.segments[index];
                    // Frozen segments reject the free, so their values stay put
                    if !segment.read_only && segment.allocated_type(decoded.slot).is_some() {
                        segment.slot(decoded.slot).store(None);
                    }
                }
            }
            self.free_locked(state, ty, handles)
        };
        self.finish_free(ty, handles.len(), outcome);
    }

    fn free_locked(
        &self,
        state: &mut TableState,
        ty: HandleType,
        handles: &[Handle],
    ) -> FreeOutcome {
        let mut outcome = FreeOutcome::default();
        let mut index = 0;
        while index < handles.len() {
            match state.locate(handles[index]) {
                Some((segment_index, _)) if !state.segments[segment_index].read_only => {
                    let segment = &mut state.segments[segment_index];
                    let consumed = segment.free_handles(ty, &handles[index..], &mut outcome);
                    debug_assert!(consumed > 0);
                    index += consumed.max(1);
                    segment.settle(self.config.resort_threshold);
                }
                _ => {
                    outcome.invalid += 1;
                    index += 1;
                }
            }
        }
        self.live_handles.fetch_sub(outcome.freed);
        outcome
    }

    fn finish_free(&self, ty: HandleType, requested: usize, outcome: FreeOutcome) {
        trace!(
            self.logger, "Freed handles";
            "type" => ?ty,
            "requested" => requested,
            "freed" => outcome.freed,
        );
        if outcome.has_violations() {
            self.report_violation(ty, &outcome);
        }
    }

    #[cold]
    #[inline(never)]
    fn report_violation(&self, ty: HandleType, outcome: &FreeOutcome) {
        let total = outcome.double_frees
            + outcome.invalid
            + outcome.type_mismatches
            + outcome.live_values;
        self.violations.fetch_add(total);
        if self.config.strict_assertions {
            if outcome.double_frees > 0 {
                panic!("Detected double free of {} {:?} handles", outcome.double_frees, ty);
            }
            panic!("Invalid free of {:?} handles: {:?}", ty, outcome);
        }
        warn!(
            self.logger, "Tolerating invalid handle free";
            "type" => ?ty,
            "double_frees" => outcome.double_frees,
            "invalid" => outcome.invalid,
            "type_mismatches" => outcome.type_mismatches,
            "live_values" => outcome.live_values,
        );
    }

    fn with_slot<R>(
        &self,
        handle: Handle,
        func: impl FnOnce(&mut Segment, usize, HandleType) -> R,
    ) -> Result<R, HandleError> {
        let mut state = self.state.lock();
        let (index, decoded) = state.locate(handle).ok_or(HandleError::InvalidHandle(handle))?;
        let segment = &mut state.segments[index];
        debug_assert!(segment.is_owned_by(self.id));
        let ty = segment
            .allocated_type(decoded.slot)
            .ok_or(HandleError::InvalidHandle(handle))?;
        Ok(func(segment, decoded.slot, ty))
    }

    /// Load the object referenced by a handle
    pub fn load(&self, handle: Handle) -> Result<Option<ObjectRef>, HandleError> {
        self.with_slot(handle, |segment, slot, _| segment.slot(slot).load())
    }

    /// Store an object into a handle.
    ///
    /// This also resets the generation of the handle's clump,
    /// so the next young collection sees the new referent.
    pub fn store(&self, handle: Handle, value: Option<ObjectRef>) -> Result<(), HandleError> {
        self.with_slot(handle, |segment, slot, _| {
            segment.slot(slot).store(value);
            segment.reset_generation(slot);
        })
    }

    /// Replace the handle's value if it is still `current`
    pub fn compare_exchange(
        &self,
        handle: Handle,
        current: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<Result<Option<ObjectRef>, Option<ObjectRef>>, HandleError> {
        self.with_slot(handle, |segment, slot, _| {
            let res = segment.slot(slot).compare_exchange(current, new);
            if res.is_ok() {
                segment.reset_generation(slot);
            }
            res
        })
    }

    fn with_user_data<R>(
        &self,
        handle: Handle,
        func: impl FnOnce(&HandleSlot) -> R,
    ) -> Result<R, HandleError> {
        self.with_slot(handle, |segment, slot, ty| {
            let data = segment.user_data_slot(slot).ok_or(HandleError::NoUserData(ty))?;
            Ok(func(data))
        })?
    }

    /// The user data paired with a handle (the secondary of a dependent handle)
    pub fn user_data(&self, handle: Handle) -> Result<Option<ObjectRef>, HandleError> {
        self.with_user_data(handle, HandleSlot::load)
    }

    pub fn set_user_data(
        &self,
        handle: Handle,
        value: Option<ObjectRef>,
    ) -> Result<(), HandleError> {
        self.with_slot(handle, |segment, slot, ty| {
            let data = segment.user_data_slot(slot).ok_or(HandleError::NoUserData(ty))?;
            data.store(value);
            segment.reset_generation(slot);
            Ok(())
        })?
    }

    /// The type of an allocated handle, or `None` if the table doesn't own it
    pub fn handle_type(&self, handle: Handle) -> Option<HandleType> {
        self.with_slot(handle, |_, _, ty| ty).ok()
    }

    /// Whether the handle points into one of this table's segments
    pub fn contains_handle(&self, handle: Handle) -> bool {
        self.state.lock().locate(handle).is_some()
    }

    /// Find the segment containing a handle
    pub fn segment_of(&self, handle: Handle) -> Option<SegmentId> {
        let state = self.state.lock();
        let (index, _) = state.locate(handle)?;
        Some(state.segments[index].id())
    }

    /// Whether the segment could be released right now,
    /// which is never the case while a concurrent scan is walking it
    pub fn can_free_segment_now(&self, segment: SegmentId) -> bool {
        self.state.lock().can_free_segment_now(segment)
    }

    /// Publish the segment as the target of an asynchronous scan
    /// until the returned guard is dropped.
    ///
    /// Only one asynchronous scan may be outstanding at a time.
    pub fn begin_async_scan(&self, segment: SegmentId) -> AsyncScanGuard<'_> {
        let mut state = self.state.lock();
        assert_eq!(state.async_scan, None, "Asynchronous scan already in progress");
        state.async_scan = Some(segment);
        AsyncScanGuard { table: self, segment }
    }

    /// Visit non-null handles of the specified types without holding
    /// the structural lock while values are read.
    ///
    /// Segments are walked one at a time. While a segment is being walked
    /// it is published as the async scan target and its blocks are locked,
    /// which keeps its memory in place until the walk moves on.
    pub fn scan_concurrent<F>(&self, types: &[HandleType], mut visitor: F)
    where
        F: FnMut(Handle, &HandleSlot, Option<&HandleSlot>),
    {
        let ids = self
            .state
            .lock()
            .segments
            .iter()
            .map(Segment::id)
            .collect::<Vec<_>>();
        for id in ids {
            let view = {
                let mut state = self.state.lock();
                assert_eq!(state.async_scan, None, "Asynchronous scan already in progress");
                let Some(index) = state.segment_index(id) else {
                    continue; // Reclaimed in the meantime
                };
                state.async_scan = Some(id);
                state.segments[index].begin_concurrent_scan(types)
            };
            let view = scopeguard::guard(view, |view| {
                let mut state = self.state.lock();
                state.async_scan = None;
                if let Some(index) = state.segment_index(view.id) {
                    state.segments[index].end_concurrent_scan(&view);
                }
            });
            trace!(self.logger, "Scanning segment concurrently"; "segment" => id);
            unsafe { view.for_each(&mut visitor) };
        }
    }

    /// Mark every existing segment as a read-only pre-existing region.
    ///
    /// Their handles stay valid and are still scanned,
    /// but new handles always come from newer segments.
    pub fn freeze_segments(&self) -> usize {
        let mut state = self.state.lock();
        let mut frozen = 0;
        for segment in state.segments.iter_mut().filter(|segment| !segment.read_only) {
            segment.read_only = true;
            frozen += 1;
        }
        debug!(self.logger, "Froze handle segments"; "frozen" => frozen);
        frozen
    }

    /// Rebuild the chains of every segment, whether or not it is flagged
    pub fn resort_segments(&self) -> usize {
        let mut state = self.state.lock();
        let mut resorted = 0;
        for segment in state.segments.iter_mut().filter(|segment| !segment.read_only) {
            segment.resort_chains();
            resorted += 1;
        }
        resorted
    }

    /// Release empty segments, returning how many were released.
    ///
    /// The last segment is always kept,
    /// as is any segment targeted by an asynchronous scan.
    pub fn reclaim_empty_segments(&self) -> usize {
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state)
    }

    fn reclaim_locked(&self, state: &mut TableState) -> usize {
        let mut reclaimed = 0;
        let mut index = 0;
        while index < state.segments.len() {
            let segment = &state.segments[index];
            let removable = state.segments.len() > 1
                && !segment.read_only
                && segment.is_empty()
                && state.can_free_segment_now(segment.id());
            if removable {
                let segment = state.segments.remove(index);
                debug!(
                    self.logger, "Released empty handle segment";
                    "segment" => segment.id(),
                    "sequence" => segment.sequence,
                );
                reclaimed += 1;
            } else {
                index += 1;
            }
        }
        reclaimed
    }

    /// Post-collection bookkeeping.
    ///
    /// Resorts flagged segments, trims excess pages,
    /// reclaims empty segments and resyncs the live-handle count.
    pub fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let async_scan = state.async_scan;
        for segment in state.segments.iter_mut().filter(|segment| !segment.read_only) {
            if segment.needs_resort() {
                segment.resort_chains();
                report.resorted += 1;
            }
            if self.config.trim_pages && async_scan != Some(segment.id()) && segment.needs_trim() {
                match segment.trim_excess_pages() {
                    Ok(Some(trimmed)) => {
                        debug!(
                            self.logger, "Decommitted excess pages";
                            "segment" => segment.id(),
                            "offset" => trimmed.offset,
                            "size" => %MemorySize { bytes: trimmed.len },
                        );
                        report.decommitted += trimmed.len;
                    }
                    Ok(None) => {}
                    Err(cause) => {
                        warn!(
                            self.logger, "Unable to decommit pages";
                            "segment" => segment.id(),
                            "cause" => %cause,
                        );
                    }
                }
            }
        }
        if self.config.reclaim_empty_segments {
            report.reclaimed = self.reclaim_locked(state);
        }
        let live = state.segments.iter().map(Segment::live_handles).sum::<usize>();
        let cached = self.live_handles.swap(live);
        report.resynced = cached != live;
        if report.resynced {
            warn!(
                self.logger, "Live handle count drifted";
                "cached" => cached,
                "actual" => live,
            );
        }
        drop(guard);
        debug!(
            self.logger, "Finished handle table maintenance";
            "resorted" => report.resorted,
            "decommitted" => %MemorySize { bytes: report.decommitted },
            "reclaimed" => report.reclaimed,
        );
        report
    }

    pub fn stats(&self) -> TableStats {
        let state = self.state.lock();
        TableStats {
            live_handles: self.live_handles.load(),
            violations: self.violations.load(),
            async_scan: state.async_scan,
            segments: state.segments.iter().map(Segment::stats).collect(),
        }
    }

    /// Check every structural invariant of the table and its segments
    pub fn verify(&self) -> Result<(), HandleError> {
        let state = self.state.lock();
        for pair in state.segments.windows(2) {
            if pair[0].base() >= pair[1].base() {
                return Err(HandleError::Corrupt(format!(
                    "Segments out of address order: {:?} before {:?}",
                    pair[0].id(),
                    pair[1].id()
                )));
            }
        }
        let mut live = 0;
        for segment in &state.segments {
            if !segment.is_owned_by(self.id) {
                return Err(HandleError::Corrupt(format!(
                    "{:?} has a foreign header",
                    segment.id()
                )));
            }
            segment
                .verify()
                .map_err(|cause| HandleError::Corrupt(format!("{:?}: {}", segment.id(), cause)))?;
            live += segment.live_handles();
        }
        if live != self.live_handles.load() {
            return Err(HandleError::Corrupt(format!(
                "Counted {} live handles but cached {}",
                live,
                self.live_handles.load()
            )));
        }
        Ok(())
    }
}
impl Debug for HandleTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("id", &self.id)
            .field("heap", &self.heap)
            .field("live_handles", &self.live_handles())
            .finish()
    }
}

/// Keeps a segment published as the asynchronous scan target
#[must_use]
pub struct AsyncScanGuard<'a> {
    table: &'a HandleTable,
    segment: SegmentId,
}
impl AsyncScanGuard<'_> {
    #[inline]
    pub fn segment(&self) -> SegmentId {
        self.segment
    }
}
impl Drop for AsyncScanGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.table.state.lock();
        if state.async_scan == Some(self.segment) {
            state.async_scan = None;
        }
    }
}
