//! Tests for arenas that use the `LeakChecked` lifetime policy.

use std::alloc::Layout;
use std::cell::RefCell;
use std::rc::Rc;

use block_arena::{BlockArena, Error, LeakCounter, LifetimeToken};

/// An object that keeps its own lifetime token, as tracked objects are expected to.
struct Tracked {
    value: u32,
    _token: LifetimeToken,
}

#[test]
fn clean_teardown_reports_no_leak() {
    let mut arena = BlockArena::builder().leak_checked().build();

    for value in 0..100 {
        let tracked = arena
            .allocate_tracked(|token| Tracked {
                value,
                _token: token,
            })
            .unwrap();
        assert_eq!(tracked.value, value);
    }

    assert_eq!(arena.outstanding_objects(), 100);

    arena.clear().unwrap();
    assert_eq!(arena.outstanding_objects(), 0);
}

#[test]
fn managed_values_are_counted_without_holding_tokens() {
    let mut arena = BlockArena::builder().leak_checked().build();

    arena.allocate_and_construct(String::from("value")).unwrap();
    arena.allocate_default::<Vec<u8>>().unwrap();
    arena.allocate_lazy::<u64>().unwrap().construct(3);
    arena.allocate_fixed_vec::<u16>(8).unwrap().push(1).unwrap();

    assert_eq!(arena.outstanding_objects(), 4);

    arena.clear().unwrap();
    assert_eq!(arena.outstanding_objects(), 0);
}

#[test]
fn unmanaged_allocations_are_not_counted() {
    let arena = BlockArena::builder().leak_checked().build();

    arena.allocate_unmanaged::<u64>().unwrap().write(1);

    assert_eq!(arena.outstanding_objects(), 0);
}

#[test]
fn escaped_token_is_reported_as_leak() {
    let escaped = Rc::new(RefCell::new(Vec::new()));
    let mut arena = BlockArena::builder()
        .initial_block_size(1000)
        .leak_checked()
        .build();

    // Spread the objects over several blocks, some of which get retired.
    for value in 0..50_u32 {
        arena
            .allocate_tracked(|token| Tracked {
                value,
                _token: token,
            })
            .unwrap();
        arena.allocate_bytes(Layout::new::<[u8; 100]>()).unwrap();
    }

    let sink = Rc::clone(&escaped);
    arena
        .allocate_tracked(move |token| sink.borrow_mut().push(token))
        .unwrap();

    assert_eq!(arena.outstanding_objects(), 51);

    let result = arena.clear();
    assert!(matches!(result, Err(Error::ResourceLeak { outstanding: 1 })));

    // The arena was torn down regardless and is empty.
    assert_eq!(arena.active_block_count(), 0);

    // Once the escaped token is gone, teardown is clean again.
    escaped.borrow_mut().clear();
    arena.clear().unwrap();
}

#[test]
fn leak_error_is_distinct_from_allocation_failure() {
    let mut arena = BlockArena::builder().leak_checked().build();

    arena.allocate_tracked(std::mem::forget).unwrap();

    let error = arena.clear().unwrap_err();

    assert!(matches!(error, Error::ResourceLeak { .. }));
    assert!(!matches!(error, Error::AllocationFailed { .. }));

    // Nothing can resolve a forgotten token, so the arena would panic when dropped.
    std::mem::forget(arena);
}

#[test]
#[should_panic]
fn dropping_leaking_arena_panics() {
    let escaped = Rc::new(RefCell::new(Vec::new()));
    let arena = BlockArena::builder().leak_checked().build();

    let sink = Rc::clone(&escaped);
    arena
        .allocate_tracked(move |token| sink.borrow_mut().push(token))
        .unwrap();

    drop(arena);
}

#[test]
fn unchecked_arena_ignores_escaped_tokens() {
    let counter = LeakCounter::new();
    let mut arena = BlockArena::new();

    let token = counter.issue();
    arena.allocate_and_construct(7_u8).unwrap();

    arena.clear().unwrap();
    assert_eq!(counter.count(), 1);

    drop(token);
    assert_eq!(counter.count(), 0);
}
