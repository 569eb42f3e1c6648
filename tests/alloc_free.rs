use std::collections::HashSet;

use rayon::prelude::*;
use slog::{o, Logger};

use zerogc_handletable::layout::{decode, HANDLES_PER_BLOCK, HANDLES_PER_SEGMENT};
use zerogc_handletable::{
    BlockIndex, Handle, HandleError, HandleTable, HandleTableConfig, HandleType,
};

mod common;

use common::{lenient_config, obj, test_config, test_table};

fn table_with(config: HandleTableConfig) -> HandleTable {
    HandleTable::with_config(config, Logger::root(::slog::Discard, o!())).unwrap()
}

#[test]
fn two_hundred_handles_return_to_initial_state() {
    let table = test_table();
    let handles = table.allocate_handles(HandleType::Strong, 200);
    assert_eq!(handles.len(), 200);
    assert_eq!(handles.iter().collect::<HashSet<_>>().len(), 200);
    let stats = table.stats();
    assert_eq!(stats.segments.len(), 1);
    let segment = &stats.segments[0];
    assert!(segment.committed_blocks >= 4, "Committed {}", segment.committed_blocks);
    assert_eq!(segment.handle_blocks[HandleType::Strong.index()], 4);
    assert_eq!(segment.live_handles, 200);
    assert_eq!(table.live_handles(), 200);
    assert_eq!(table.free_count(HandleType::Strong), 4 * HANDLES_PER_BLOCK - 200);
    for handle in &handles {
        assert_eq!(decode(*handle).unwrap().segment, segment.id);
        assert_eq!(table.handle_type(*handle), Some(HandleType::Strong));
    }
    table.verify().unwrap();

    let reversed = handles.iter().rev().copied().collect::<Vec<_>>();
    table.free_handles(HandleType::Strong, &reversed);
    assert_eq!(table.live_handles(), 0);
    assert_eq!(table.free_count(HandleType::Strong), 0);
    table.verify().unwrap();

    table.resort_segments();
    let stats = table.stats();
    let segment = &stats.segments[0];
    assert_eq!(segment.free_list, BlockIndex::all().collect::<Vec<_>>());
    assert_eq!(segment.handle_blocks, [0; HandleType::COUNT]);
    assert_eq!(segment.empty_line, 0);
    assert!(!segment.needs_resort);
    assert_eq!(stats.violations, 0);
    table.verify().unwrap();
}

#[test]
fn freed_slots_are_reused_lowest_first() {
    let table = test_table();
    let handles = table.allocate_handles(HandleType::WeakShort, 10);
    table.free_handles(HandleType::WeakShort, &handles[2..7]);
    assert_eq!(table.live_handles(), 5);
    assert_eq!(table.free_count(HandleType::WeakShort), HANDLES_PER_BLOCK - 5);
    let mut reused = table.allocate_handles(HandleType::WeakShort, 5);
    reused.sort();
    let mut expected = handles[2..7].to_vec();
    expected.sort();
    assert_eq!(reused, expected);
    table.verify().unwrap();
}

#[test]
fn handle_types_use_separate_blocks() {
    let table = test_table();
    let mut blocks = HashSet::new();
    for ty in HandleType::ALL {
        let handle = table.allocate_handle(ty, Some(obj(1))).unwrap();
        assert_eq!(table.handle_type(handle), Some(ty));
        assert!(blocks.insert(decode(handle).unwrap().block()), "{:?} shares a block", ty);
    }
    let stats = table.stats();
    assert_eq!(stats.segments[0].handle_blocks, [1; HandleType::COUNT]);
    // Dependent handles also take a block for their secondaries
    assert_eq!(stats.segments[0].data_blocks, 1);
    table.verify().unwrap();
}

#[test]
fn double_free_is_counted_when_tolerated() {
    let table = table_with(lenient_config());
    let handles = table.allocate_handles(HandleType::Strong, 3);
    table.free_handle(HandleType::Strong, handles[0]);
    table.free_handle(HandleType::Strong, handles[0]);
    let stats = table.stats();
    assert_eq!(stats.violations, 1);
    assert_eq!(stats.live_handles, 2);
    assert_eq!(table.free_count(HandleType::Strong), HANDLES_PER_BLOCK - 2);
    table.verify().unwrap();
}

#[test]
#[should_panic(expected = "Detected double free")]
fn double_free_panics_with_strict_assertions() {
    let table = test_table();
    let handles = table.allocate_handles(HandleType::Strong, 2);
    table.free_handle(HandleType::Strong, handles[1]);
    table.free_handle(HandleType::Strong, handles[1]);
}

#[test]
fn foreign_handles_are_rejected() {
    let table = table_with(lenient_config());
    let kept = table.allocate_handle(HandleType::Strong, Some(obj(1))).unwrap();
    let foreign = Handle::from_addr(0x18).unwrap();
    assert!(!table.contains_handle(foreign));
    assert_eq!(table.handle_type(foreign), None);
    assert!(matches!(table.load(foreign), Err(HandleError::InvalidHandle(_))));
    table.free_handles(HandleType::Strong, &[foreign, kept]);
    let stats = table.stats();
    assert_eq!(stats.violations, 1);
    assert_eq!(stats.live_handles, 0);
    table.verify().unwrap();
}

#[test]
fn type_mismatch_still_frees() {
    let table = table_with(lenient_config());
    let handle = table.allocate_handle(HandleType::WeakLong, None).unwrap();
    table.free_handle(HandleType::Strong, handle);
    assert_eq!(table.stats().violations, 1);
    assert_eq!(table.live_handles(), 0);
    table.verify().unwrap();
}

#[test]
fn prepared_free_clears_live_values() {
    let table = table_with(lenient_config());
    let handle = table.allocate_handle(HandleType::Strong, Some(obj(7))).unwrap();
    let second = table.allocate_handle(HandleType::Strong, None).unwrap();
    table.free_handles_prepared(HandleType::Strong, &[second, handle]);
    assert_eq!(table.stats().violations, 1);
    assert_eq!(table.live_handles(), 0);
    table.verify().unwrap();
}

#[test]
fn freed_slots_come_back_null() {
    let table = table_with(lenient_config());
    let handles = table.allocate_handles(HandleType::Strong, 5);
    for (index, &handle) in handles.iter().enumerate() {
        table.store(handle, Some(obj(index + 1))).unwrap();
    }
    table.free_handles(HandleType::Strong, &[handles[1], handles[0]]);
    // Prepared frees arrive in descending address order
    table.store(handles[2], None).unwrap();
    table.free_handles_prepared(HandleType::Strong, &[handles[3], handles[2]]);
    assert_eq!(table.stats().violations, 1);
    assert_eq!(table.live_handles(), 1);

    let mut reused = table.allocate_handles(HandleType::Strong, 4);
    reused.sort();
    let mut expected = handles[..4].to_vec();
    expected.sort();
    assert_eq!(reused, expected);
    for &handle in &reused {
        assert_eq!(table.load(handle).unwrap(), None);
    }
    assert_eq!(table.load(handles[4]).unwrap(), Some(obj(5)));

    let dependent = table.allocate_dependent(obj(6), obj(7)).unwrap();
    let kept = table.allocate_dependent(obj(8), obj(9)).unwrap();
    table.free_handle(HandleType::Dependent, dependent);
    let again = table.allocate_handle(HandleType::Dependent, None).unwrap();
    assert_eq!(again, dependent);
    assert_eq!(table.load(again).unwrap(), None);
    assert_eq!(table.user_data(again).unwrap(), None);
    assert_eq!(table.user_data(kept).unwrap(), Some(obj(9)));
    table.verify().unwrap();
}

#[test]
fn frees_into_frozen_segments_keep_their_values() {
    let table = table_with(lenient_config());
    let handle = table.allocate_handle(HandleType::Strong, Some(obj(1))).unwrap();
    assert_eq!(table.freeze_segments(), 1);
    table.free_handle(HandleType::Strong, handle);
    assert_eq!(table.stats().violations, 1);
    assert_eq!(table.live_handles(), 1);
    assert_eq!(table.handle_type(handle), Some(HandleType::Strong));
    assert_eq!(table.load(handle).unwrap(), Some(obj(1)));
    table.verify().unwrap();
}

#[test]
fn values_and_user_data() {
    let table = test_table();
    let strong = table.allocate_handle(HandleType::Strong, Some(obj(1))).unwrap();
    assert_eq!(table.load(strong).unwrap(), Some(obj(1)));
    table.store(strong, Some(obj(2))).unwrap();
    assert_eq!(table.load(strong).unwrap(), Some(obj(2)));
    assert_eq!(table.compare_exchange(strong, Some(obj(1)), None).unwrap(), Err(Some(obj(2))));
    assert_eq!(
        table.compare_exchange(strong, Some(obj(2)), Some(obj(3))).unwrap(),
        Ok(Some(obj(2)))
    );
    assert_eq!(table.load(strong).unwrap(), Some(obj(3)));
    assert!(matches!(
        table.user_data(strong),
        Err(HandleError::NoUserData(HandleType::Strong))
    ));

    let dependent = table.allocate_dependent(obj(4), obj(5)).unwrap();
    assert_eq!(table.load(dependent).unwrap(), Some(obj(4)));
    assert_eq!(table.user_data(dependent).unwrap(), Some(obj(5)));
    table.set_user_data(dependent, Some(obj(6))).unwrap();
    assert_eq!(table.user_data(dependent).unwrap(), Some(obj(6)));
    assert_eq!(table.segment_of(dependent), table.segment_of(strong));

    table.free_handle(HandleType::Dependent, dependent);
    assert!(matches!(table.load(dependent), Err(HandleError::InvalidHandle(_))));
    // The slot memory is still part of the table
    assert!(table.contains_handle(dependent));
    table.free_handle(HandleType::Strong, strong);
    table.verify().unwrap();
}

#[test]
fn grows_into_new_segments() {
    let table = test_table();
    let handles = table.allocate_handles(HandleType::Pinned, HANDLES_PER_SEGMENT + 100);
    assert_eq!(handles.len(), HANDLES_PER_SEGMENT + 100);
    let stats = table.stats();
    assert_eq!(stats.segments.len(), 2);
    let mut sequences = stats.segments.iter().map(|segment| segment.sequence).collect::<Vec<_>>();
    sequences.sort();
    assert_eq!(sequences, vec![0, 1]);
    assert!(stats.segments[0].id < stats.segments[1].id);
    table.verify().unwrap();

    table.free_handles(HandleType::Pinned, &handles);
    assert_eq!(table.live_handles(), 0);
    let report = table.maintain();
    assert_eq!(report.reclaimed, 1);
    assert!(!report.resynced);
    assert_eq!(table.stats().segments.len(), 1);
    table.verify().unwrap();

    // The remaining segment is still usable
    assert_eq!(table.allocate_handles(HandleType::Pinned, 10).len(), 10);
    table.verify().unwrap();
}

#[test]
fn segment_limit_truncates_allocation() {
    let table = table_with(HandleTableConfig {
        max_segments: Some(1),
        ..test_config()
    });
    let handles = table.allocate_handles(HandleType::Strong, HANDLES_PER_SEGMENT + 10);
    assert_eq!(handles.len(), HANDLES_PER_SEGMENT);
    let err = table.allocate_handle(HandleType::Strong, None).unwrap_err();
    assert!(err.is_out_of_memory());
    table.verify().unwrap();
    table.free_handles(HandleType::Strong, &handles[..HANDLES_PER_BLOCK]);
    assert!(table.allocate_handle(HandleType::Strong, None).is_ok());
}

#[test]
fn huge_requests_come_back_short() {
    let table = table_with(HandleTableConfig {
        max_segments: Some(1),
        ..test_config()
    });
    let handles = table.allocate_handles(HandleType::Strong, usize::MAX / 4);
    assert_eq!(handles.len(), HANDLES_PER_SEGMENT);
    assert_eq!(table.live_handles(), HANDLES_PER_SEGMENT);
    table.verify().unwrap();
}

#[test]
fn unprepared_free_accepts_any_order() {
    let table = test_table();
    let handles = table.allocate_handles(HandleType::WeakLong, 300);
    let shuffled = (0..handles.len())
        .map(|index| handles[(index * 7) % handles.len()])
        .collect::<Vec<_>>();
    assert_eq!(shuffled.iter().collect::<HashSet<_>>().len(), 300);
    table.free_handles(HandleType::WeakLong, &shuffled);
    assert_eq!(table.live_handles(), 0);
    assert_eq!(table.stats().violations, 0);
    table.verify().unwrap();
}

#[test]
fn eager_resort_after_disorder() {
    let eager = table_with(HandleTableConfig {
        resort_threshold: 1,
        ..test_config()
    });
    let lazy = test_table();
    for table in [&eager, &lazy] {
        let handles = table.allocate_handles(HandleType::Strong, 2 * HANDLES_PER_BLOCK);
        table.free_handles(HandleType::Strong, &handles[..HANDLES_PER_BLOCK]);
        table.verify().unwrap();
    }
    let eager = eager.stats();
    assert!(!eager.segments[0].needs_resort);
    assert_eq!(eager.segments[0].free_list[0], BlockIndex::new(0));
    assert_eq!(eager.segments[0].free_list[1], BlockIndex::new(2));
    assert!(lazy.stats().segments[0].needs_resort);
    assert_eq!(lazy.maintain().resorted, 1);
    assert!(!lazy.stats().segments[0].needs_resort);
}

#[test]
fn concurrent_allocation() {
    let table = test_table();
    (0..16usize).into_par_iter().for_each(|thread| {
        let ty = HandleType::ALL[thread % HandleType::COUNT];
        for round in 0..20 {
            let handles = table.allocate_handles(ty, 50 + round);
            assert_eq!(handles.len(), 50 + round);
            table.free_handles(ty, &handles);
        }
    });
    assert_eq!(table.live_handles(), 0);
    assert_eq!(table.stats().violations, 0);
    table.verify().unwrap();
}
