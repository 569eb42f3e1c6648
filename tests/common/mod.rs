#![allow(dead_code)]
use std::collections::{HashMap, HashSet};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use slog::{o, Drain, Logger};

use zerogc_handletable::{
    GcScanner, HandleSlot, HandleStore, HandleTable, HandleTableConfig, ObjectRef, PromoteFlags,
    ScanContext, ScanPhase, SystemMemory, VirtualMemory,
};

/// A fake object, which the tables never dereference
pub fn obj(id: usize) -> ObjectRef {
    ObjectRef::from_addr(id * 16).unwrap()
}

pub fn test_config() -> HandleTableConfig {
    HandleTableConfig {
        strict_assertions: true,
        ..HandleTableConfig::default()
    }
}

/// Tolerate violations, so tests can observe how they are counted
pub fn lenient_config() -> HandleTableConfig {
    HandleTableConfig {
        strict_assertions: false,
        ..HandleTableConfig::default()
    }
}

pub fn test_table() -> HandleTable {
    HandleTable::with_config(test_config(), Logger::root(::slog::Discard, o!())).unwrap()
}

pub fn test_store(num_heaps: usize) -> HandleStore {
    HandleStore::with_config(num_heaps, test_config(), Logger::root(::slog::Discard, o!())).unwrap()
}

/// A logger that prints through the test harness
pub fn terminal_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("test" => true))
}

/// A collector that only records what the tables tell it.
///
/// Promotion marks the referent without tracing through it,
/// so every dependent handle step takes its own pass.
#[derive(Debug, Default)]
pub struct MockCollector {
    pub marked: HashSet<ObjectRef>,
    /// Where objects move during relocation
    pub forwarding: HashMap<ObjectRef, ObjectRef>,
    /// Objects absent from this map live in generation zero
    pub generations: HashMap<ObjectRef, u8>,
    pub promotions: Vec<(ObjectRef, PromoteFlags)>,
}
impl MockCollector {
    pub fn new() -> MockCollector {
        MockCollector::default()
    }
    pub fn mark(&mut self, object: ObjectRef) {
        self.marked.insert(object);
    }
    pub fn is_marked(&self, object: ObjectRef) -> bool {
        self.marked.contains(&object)
    }
}
impl GcScanner for MockCollector {
    fn promote(&mut self, slot: &HandleSlot, ctx: &ScanContext, flags: PromoteFlags) {
        let Some(object) = slot.load() else { return };
        match ctx.phase {
            ScanPhase::Promote => {
                self.marked.insert(object);
                self.promotions.push((object, flags));
            }
            ScanPhase::Relocate => {
                if let Some(&moved) = self.forwarding.get(&object) {
                    slot.store(Some(moved));
                }
            }
        }
    }

    fn is_promoted(&self, object: ObjectRef, ctx: &ScanContext) -> bool {
        self.marked.contains(&object) || self.generation_of(object) > ctx.condemned
    }

    fn generation_of(&self, object: ObjectRef) -> u8 {
        self.generations.get(&object).copied().unwrap_or(0)
    }
}

/// System memory that refuses to commit once its budget runs out
#[derive(Debug)]
pub struct LimitedMemory {
    inner: Arc<dyn VirtualMemory>,
    commits_left: AtomicUsize,
}
impl LimitedMemory {
    pub fn new(commits: usize) -> Arc<LimitedMemory> {
        Arc::new(LimitedMemory {
            inner: SystemMemory::shared(),
            commits_left: AtomicUsize::new(commits),
        })
    }
    pub fn set_commits_left(&self, commits: usize) {
        self.commits_left.store(commits, Ordering::SeqCst);
    }
}
unsafe impl VirtualMemory for LimitedMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
    fn reserve(&self, size: usize, align: usize) -> Result<NonNull<u8>, io::Error> {
        self.inner.reserve(size, align)
    }
    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error> {
        let budget = self
            .commits_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if budget.is_err() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "commit budget exhausted"));
        }
        self.inner.commit(ptr, len)
    }
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), io::Error> {
        self.inner.decommit(ptr, len)
    }
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.inner.release(ptr, size, align)
    }
}
