use rayon::prelude::*;

use zerogc_handletable::layout::decode;
use zerogc_handletable::{
    BlockIndex, DhState, Handle, HandleError, HandleStore, HandleType, ScanContext,
};

mod common;

use common::{obj, test_store, test_table, MockCollector};

/// Dependent handles forming the chain `1 -> 2 -> 3 -> 4`,
/// allocated so each pass only discovers one more link.
fn build_chain(store: &HandleStore, heap: usize) -> Vec<Handle> {
    let table = store.table(heap).unwrap();
    let handles = vec![
        table.allocate_dependent(obj(3), obj(4)).unwrap(),
        table.allocate_dependent(obj(2), obj(3)).unwrap(),
        table.allocate_dependent(obj(1), obj(2)).unwrap(),
    ];
    assert!(handles.windows(2).all(|pair| pair[0] < pair[1]));
    handles
}

fn full_collection(heap: usize) -> ScanContext {
    ScanContext::promotion(heap, 2, 2)
}

#[test]
fn paired_user_data_blocks() {
    let table = test_table();
    let handle = table.allocate_dependent(obj(1), obj(2)).unwrap();
    // The data block is taken off the free list first
    assert_eq!(decode(handle).unwrap().block(), BlockIndex::new(1));
    let stats = table.stats();
    assert_eq!(stats.segments[0].handle_blocks[HandleType::Dependent.index()], 1);
    assert_eq!(stats.segments[0].data_blocks, 1);
    assert_eq!(stats.segments[0].free_list[0], BlockIndex::new(2));
    table.verify().unwrap();

    table.free_handle(HandleType::Dependent, handle);
    let stats = table.stats();
    assert_eq!(stats.segments[0].handle_blocks, [0; HandleType::COUNT]);
    assert_eq!(stats.segments[0].data_blocks, 0);
    table.verify().unwrap();
    table.resort_segments();
    assert_eq!(table.stats().segments[0].free_list, BlockIndex::all().collect::<Vec<_>>());

    // Fresh secondaries start out null
    let handle = table.allocate_handle(HandleType::Dependent, Some(obj(3))).unwrap();
    assert_eq!(table.user_data(handle).unwrap(), None);
    table.verify().unwrap();
}

#[test]
fn single_pass_is_not_enough() {
    let store = test_store(1);
    build_chain(&store, 0);
    let ctx = full_collection(0);
    let mut collector = MockCollector::new();
    collector.mark(obj(1));
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Init);

    assert!(store.initial_scan(&mut collector, &ctx).unwrap());
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Converging);
    assert!(collector.is_marked(obj(2)));
    assert!(!collector.is_marked(obj(3)));
    assert!(store.unpromoted_handles_exist(&ctx).unwrap());

    assert!(store.rescan(&mut collector, &ctx).unwrap());
    assert!(collector.is_marked(obj(3)));
    assert!(!collector.is_marked(obj(4)));
    assert!(store.rescan(&mut collector, &ctx).unwrap());
    assert!(collector.is_marked(obj(4)));
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Converging);

    assert!(!store.rescan(&mut collector, &ctx).unwrap());
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Done);
    assert!(!store.unpromoted_handles_exist(&ctx).unwrap());
    assert_eq!(store.dependent_passes(0).unwrap(), 4);

    // Further passes change nothing
    assert!(!store.rescan(&mut collector, &ctx).unwrap());
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Done);
    assert_eq!(collector.promotions.len(), 3);
}

#[test]
fn fixed_point_in_one_call() {
    let store = test_store(1);
    build_chain(&store, 0);
    let ctx = full_collection(0);
    let mut collector = MockCollector::new();
    collector.mark(obj(1));
    assert_eq!(store.scan_dependent_handles(&mut collector, &ctx).unwrap(), 4);
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Done);
    for id in 1..=4 {
        assert!(collector.is_marked(obj(id)), "Object {} was not promoted", id);
    }
}

#[test]
fn unreachable_primaries_keep_secondaries_dead() {
    let store = test_store(1);
    let handles = build_chain(&store, 0);
    let table = store.table(0).unwrap();
    let ctx = full_collection(0);
    let mut collector = MockCollector::new();
    assert!(!store.initial_scan(&mut collector, &ctx).unwrap());
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Done);
    assert!(store.unpromoted_handles_exist(&ctx).unwrap());
    assert!(collector.marked.is_empty());

    assert_eq!(store.weak_ptr_scan(&collector, &ctx).unwrap(), 3);
    for &handle in &handles {
        assert_eq!(table.load(handle).unwrap(), None);
        assert_eq!(table.user_data(handle).unwrap(), None);
    }
}

#[test]
fn weak_scan_clears_only_dead_dependents() {
    let store = test_store(1);
    let table = store.table(0).unwrap();
    let chain = build_chain(&store, 0);
    let orphan = table.allocate_dependent(obj(5), obj(6)).unwrap();
    let weak = table.allocate_handle(HandleType::WeakLong, Some(obj(7))).unwrap();
    let ctx = full_collection(0);
    let mut collector = MockCollector::new();
    collector.mark(obj(1));
    store.scan_dependent_handles(&mut collector, &ctx).unwrap();
    assert!(!collector.is_marked(obj(6)));

    assert_eq!(store.weak_ptr_scan(&collector, &ctx).unwrap(), 2);
    assert_eq!(table.load(orphan).unwrap(), None);
    assert_eq!(table.user_data(orphan).unwrap(), None);
    assert_eq!(table.load(weak).unwrap(), None);
    assert_eq!(table.load(chain[0]).unwrap(), Some(obj(3)));
    assert_eq!(table.user_data(chain[0]).unwrap(), Some(obj(4)));
}

#[test]
fn next_collection_starts_over() {
    let store = test_store(1);
    build_chain(&store, 0);
    let ctx = full_collection(0);
    let mut collector = MockCollector::new();
    collector.mark(obj(1));
    store.scan_dependent_handles(&mut collector, &ctx).unwrap();
    store.end_collection(&ctx).unwrap();

    let mut collector = MockCollector::new();
    collector.mark(obj(3));
    assert!(store.initial_scan(&mut collector, &ctx).unwrap());
    assert_eq!(store.dependent_passes(0).unwrap(), 1);
    assert_eq!(store.dependent_state(0).unwrap(), DhState::Converging);
    assert!(!store.rescan(&mut collector, &ctx).unwrap());
    assert!(collector.is_marked(obj(4)));
    assert!(!collector.is_marked(obj(2)));
}

#[test]
fn heaps_converge_independently() {
    let store = test_store(4);
    for heap in 0..store.num_heaps() {
        build_chain(&store, heap);
    }
    let passes = (0..store.num_heaps())
        .into_par_iter()
        .map(|heap| {
            let ctx = full_collection(heap);
            let mut collector = MockCollector::new();
            // Odd heaps have nothing reachable
            if heap % 2 == 0 {
                collector.mark(obj(1));
            }
            store.scan_dependent_handles(&mut collector, &ctx).unwrap()
        })
        .collect::<Vec<_>>();
    assert_eq!(passes, vec![4, 1, 4, 1]);
    for heap in 0..store.num_heaps() {
        assert_eq!(store.dependent_state(heap).unwrap(), DhState::Done);
    }
}

#[test]
fn invalid_heap() {
    let store = test_store(2);
    let mut collector = MockCollector::new();
    let ctx = full_collection(2);
    assert!(store.initial_scan(&mut collector, &ctx).is_err());
    assert!(store.table(2).is_err());
}

#[test]
fn stores_need_a_heap() {
    let err = HandleStore::create(0).unwrap_err();
    assert!(
        matches!(err, HandleError::InvalidHeap { heap: 0, num_heaps: 0 }),
        "{:?}",
        err
    );
}
