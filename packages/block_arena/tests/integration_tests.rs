//! Integration tests for the `block_arena` package.
//!
//! These tests exercise `BlockArena` through its public API only: alignment and accounting,
//! the bounded active block set, retirement of exhausted blocks, destruction order and the
//! collaborating `Lazy` and `FixedVec` types.

#![allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::alloc::Layout;
use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::rc::Rc;

use block_arena::{
    BLOCK_HEADER_SIZE, BlockArena, DESTRUCTOR_ENTRY_SIZE, Error, MAX_ACTIVE_BLOCKS,
    MIN_BLOCK_SIZE, RETIREMENT_CUTOFF_BYTES,
};

const BLOCK_SIZE: usize = MIN_BLOCK_SIZE;
const CAPACITY: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

type DropLog = Rc<RefCell<Vec<&'static str>>>;

#[derive(Debug)]
struct Logged {
    name: &'static str,
    log: DropLog,
}

impl Drop for Logged {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.name);
    }
}

fn small_arena() -> BlockArena {
    BlockArena::builder().initial_block_size(BLOCK_SIZE).build()
}

fn bytes(size: usize) -> Layout {
    Layout::from_size_align(size, 1).unwrap()
}

#[test]
fn allocations_respect_alignment() {
    let arena = small_arena();

    for round in 0..50 {
        for align in [1_usize, 2, 4, 8, 16, 32, 64, 128] {
            let size = 1 + (round * 7) % 90;
            let ptr = arena
                .allocate_bytes(Layout::from_size_align(size, align).unwrap())
                .unwrap();

            assert_eq!(ptr.as_ptr().addr() % align, 0);
        }
    }

    assert!(arena.active_block_count() <= MAX_ACTIVE_BLOCKS);
}

#[test]
fn typed_allocations_respect_alignment() {
    #[repr(align(64))]
    struct CacheLine([u8; 64]);

    let arena = small_arena();

    for _ in 0..20 {
        _ = arena.allocate_and_construct(1_u8).unwrap();
        let line = arena.allocate_and_construct(CacheLine([7; 64])).unwrap();

        assert_eq!(std::ptr::from_mut(line).addr() % 64, 0);
        assert_eq!(line.0[63], 7);
    }
}

#[test]
fn free_bytes_track_unmanaged_and_managed_usage() {
    let arena = small_arena();

    arena.allocate_bytes(bytes(100)).unwrap();
    assert_eq!(arena.active_block_free_bytes(), vec![CAPACITY - 100]);

    // The cursor is at an 8-aligned offset again after 4 more bytes.
    arena.allocate_bytes(bytes(4)).unwrap();
    arena.allocate_and_construct(9_u64).unwrap();

    assert_eq!(
        arena.active_block_free_bytes(),
        vec![CAPACITY - 104 - 8 - DESTRUCTOR_ENTRY_SIZE]
    );
}

#[test]
fn eviction_keeps_active_blocks_bounded() {
    let arena = small_arena();

    let first = arena.allocate_bytes(bytes(700)).unwrap();
    // SAFETY: The allocation is 700 bytes long and nothing else uses it.
    unsafe { first.as_ptr().write_bytes(0xC3, 700) };

    for _ in 0..3 {
        arena.allocate_bytes(bytes(600)).unwrap();
    }

    assert_eq!(arena.active_block_count(), MAX_ACTIVE_BLOCKS);
    assert_eq!(
        arena.active_block_free_bytes(),
        vec![CAPACITY - 700, CAPACITY - 600, CAPACITY - 600, CAPACITY - 600]
    );

    arena.allocate_bytes(bytes(600)).unwrap();

    // The block with 700 bytes used was the smallest and is gone from the active set.
    assert_eq!(arena.active_block_count(), MAX_ACTIVE_BLOCKS);
    assert_eq!(arena.active_block_free_bytes(), vec![CAPACITY - 600; 4]);

    // Its content is still intact.
    // SAFETY: Retired blocks stay allocated until the arena is cleared.
    let content = unsafe { std::slice::from_raw_parts(first.as_ptr(), 700) };
    assert!(content.iter().all(|b| *b == 0xC3));
}

#[test]
fn evicted_block_does_not_run_destructors_early() {
    let log = DropLog::default();
    let mut arena = small_arena();

    let survivor = arena
        .allocate_and_construct(Logged {
            name: "survivor",
            log: Rc::clone(&log),
        })
        .unwrap();

    // Forces several evictions of the block holding the survivor.
    for _ in 0..10 {
        arena.allocate_bytes(bytes(800)).unwrap();
    }

    assert!(log.borrow().is_empty());
    assert_eq!(survivor.name, "survivor");

    arena.clear().unwrap();
    assert_eq!(*log.borrow(), vec!["survivor"]);
}

#[test]
fn exhausted_block_is_retired_immediately() {
    let arena = small_arena();

    arena.allocate_bytes(bytes(100)).unwrap();
    arena.allocate_bytes(bytes(200)).unwrap();
    assert_eq!(arena.active_block_count(), 1);

    // Does not fit in the first block and leaves its own block at the cutoff.
    arena
        .allocate_bytes(bytes(CAPACITY - RETIREMENT_CUTOFF_BYTES))
        .unwrap();

    assert_eq!(arena.active_block_count(), 1);
    assert_eq!(arena.active_block_free_bytes(), vec![CAPACITY - 300]);

    // The retired block never comes back.
    for _ in 0..5 {
        arena.allocate_bytes(bytes(10)).unwrap();
        assert_eq!(arena.active_block_count(), 1);
    }
}

#[test]
fn managed_values_are_dropped_in_reverse_order() {
    let log = DropLog::default();
    let mut arena = BlockArena::new();

    for name in ["first", "second", "third"] {
        arena
            .allocate_and_construct(Logged {
                name,
                log: Rc::clone(&log),
            })
            .unwrap();
    }

    assert!(log.borrow().is_empty());
    arena.clear().unwrap();

    assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
}

#[test]
fn dropping_arena_drops_managed_values() {
    let log = DropLog::default();

    {
        let arena = small_arena();

        for name in ["a", "b", "c", "d", "e"] {
            arena
                .allocate_and_construct(Logged {
                    name,
                    log: Rc::clone(&log),
                })
                .unwrap();
            arena.allocate_bytes(bytes(400)).unwrap();
        }
    }

    let mut dropped = log.borrow().clone();
    dropped.sort_unstable();
    assert_eq!(dropped, vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn unmanaged_values_are_not_dropped() {
    let tracker = Rc::new(());
    let mut arena = BlockArena::new();

    let slot = arena.allocate_unmanaged::<Rc<()>>().unwrap();
    let stored = slot.write(Rc::clone(&tracker));
    assert_eq!(Rc::strong_count(stored), 2);

    arena.clear().unwrap();
    assert_eq!(Rc::strong_count(&tracker), 2);
}

#[test]
fn unmanaged_data_round_trips() {
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Sample {
        id: u32,
        weight: f64,
        tag: [u8; 6],
    }

    let arena = small_arena();

    let samples: Vec<&mut Sample> = (0..40)
        .map(|id| {
            let slot: &mut MaybeUninit<Sample> = arena.allocate_unmanaged().unwrap();
            slot.write(Sample {
                id,
                weight: f64::from(id) * 0.5,
                tag: *b"tagged",
            })
        })
        .collect();

    for (id, sample) in (0_u32..).zip(&samples) {
        assert_eq!(
            **sample,
            Sample {
                id,
                weight: f64::from(id) * 0.5,
                tag: *b"tagged",
            }
        );
    }
}

#[test]
fn clear_on_empty_arena_is_noop() {
    let mut arena = small_arena();

    arena.clear().unwrap();
    arena.clear().unwrap();

    assert_eq!(arena.active_block_count(), 0);
    assert_eq!(arena.initial_block_size(), BLOCK_SIZE);
}

#[test]
fn arena_is_reusable_after_clear() {
    let mut arena = small_arena();

    arena.allocate_and_construct(String::from("before")).unwrap();
    arena.clear().unwrap();

    let value = arena.allocate_and_construct(String::from("after")).unwrap();
    assert_eq!(value, "after");
    assert_eq!(arena.active_block_count(), 1);
}

#[test]
fn create_first_block_prewarms_arena() {
    let arena = small_arena();

    arena.create_first_block().unwrap();
    assert_eq!(arena.active_block_free_bytes(), vec![CAPACITY]);

    assert!(matches!(
        arena.create_first_block(),
        Err(Error::InvalidArgument { .. })
    ));

    arena.allocate_bytes(bytes(10)).unwrap();
    assert_eq!(arena.active_block_free_bytes(), vec![CAPACITY - 10]);
}

#[test]
fn prewarmed_block_is_zeroed() {
    let arena = small_arena();
    arena.create_first_block().unwrap();

    let slot = arena.allocate_unmanaged::<[u64; 32]>().unwrap();

    // SAFETY: The first block was zero-initialized and all-zero is a valid [u64; 32].
    let values = unsafe { slot.assume_init_ref() };
    assert!(values.iter().all(|v| *v == 0));
}

#[test]
fn zero_sized_byte_request_is_invalid() {
    let arena = BlockArena::new();

    let result = arena.allocate_bytes(Layout::new::<()>());

    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
}

#[test]
fn oversized_value_gets_its_own_block() {
    let arena = small_arena();

    let big = arena.allocate_and_construct([5_u8; 10_000]).unwrap();

    assert!(big.iter().all(|b| *b == 5));
    assert!(arena.active_block_count() >= 1);
}

#[test]
fn lazy_values_are_dropped_only_once_constructed() {
    let log = DropLog::default();
    let mut arena = BlockArena::new();

    let empty = arena.allocate_lazy::<Logged>().unwrap();
    let filled = arena.allocate_lazy::<Logged>().unwrap();

    assert!(!empty.is_constructed());

    filled.construct(Logged {
        name: "filled",
        log: Rc::clone(&log),
    });
    assert_eq!(filled.get().map(|l| l.name), Some("filled"));

    arena.clear().unwrap();
    assert_eq!(*log.borrow(), vec!["filled"]);
}

#[test]
fn fixed_vec_holds_exactly_its_capacity() {
    let log = DropLog::default();
    let mut arena = BlockArena::new();

    let mut vec = arena.allocate_fixed_vec::<Logged>(3).unwrap();
    assert_eq!(vec.capacity(), 3);

    for name in ["x", "y", "z"] {
        vec.as_mut()
            .push(Logged {
                name,
                log: Rc::clone(&log),
            })
            .unwrap();
    }

    let rejected = vec
        .as_mut()
        .push(Logged {
            name: "overflow",
            log: Rc::clone(&log),
        })
        .unwrap_err();
    assert_eq!(rejected.name, "overflow");
    drop(rejected);
    assert_eq!(*log.borrow(), vec!["overflow"]);

    let names: Vec<_> = vec.iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["x", "y", "z"]);

    arena.clear().unwrap();
    assert_eq!(*log.borrow(), vec!["overflow", "x", "y", "z"]);
}

#[test]
fn fixed_vecs_do_not_overlap() {
    let arena = small_arena();

    let mut first = arena.allocate_fixed_vec::<u32>(50).unwrap();
    let mut second = arena.allocate_fixed_vec::<u32>(50).unwrap();

    for i in 0..50 {
        first.as_mut().push(i).unwrap();
        second.as_mut().push(1000 + i).unwrap();
    }

    assert!(first.iter().copied().eq(0..50));
    assert!(second.iter().copied().eq(1000..1050));
}

#[test]
fn fixed_vec_contents_stay_with_their_arena() {
    let arena_a = BlockArena::new();
    let mut arena_b = BlockArena::new();

    let mut kept = arena_a.allocate_fixed_vec::<u32>(64).unwrap();

    {
        let mut other = arena_b.allocate_fixed_vec::<u32>(64).unwrap();

        for i in 0..64 {
            kept.as_mut().push(i).unwrap();
            other.as_mut().push(1000 + i).unwrap();
        }

        // The handles trade places, the vectors stay next to their elements.
        let mut first = kept.as_mut();
        let mut second = other.as_mut();
        std::mem::swap(&mut first, &mut second);

        assert!(first.iter().copied().eq(1000..1064));
        assert!(second.iter().copied().eq(0..64));
    }

    arena_b.clear().unwrap();

    // Give the allocator a chance to reuse the memory released by the cleared arena.
    let churn: Vec<Vec<u32>> = (0..64).map(|_| vec![0xDEAD_BEEF; 512]).collect();

    assert!(kept.iter().copied().eq(0..64));
    assert_eq!(churn.len(), 64);
}

#[test]
fn fixed_vec_of_zero_capacity() {
    let arena = BlockArena::new();

    let vec = arena.allocate_fixed_vec::<String>(0).unwrap();

    assert!(vec.is_full());
    assert!(vec.is_empty());
}
