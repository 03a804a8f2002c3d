use std::alloc::Layout;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::align::round_up;
use crate::block::{BLOCK_HEADER_SIZE, MemoryBlock};
use crate::destructor::{DESTRUCTOR_ENTRY_ALIGN, DESTRUCTOR_ENTRY_SIZE, DestructorEntry};
use crate::error::{Error, Result};

/// The maximum number of blocks that may serve new allocations at the same time.
///
/// When a new block is needed while this many blocks are active, the block with the least free
/// space is retired to make room for it.
pub const MAX_ACTIVE_BLOCKS: usize = 4;

/// A block with this many free bytes or fewer is retired instead of being kept active,
/// unless it is the only active block.
pub const RETIREMENT_CUTOFF_BYTES: usize = 64;

/// Routes allocations to a bounded set of active memory blocks.
///
/// Blocks that are retired (evicted to make room for a new block or exhausted down to the
/// cutoff) are never freed early. They are chained onto the tail of an active block and are
/// destroyed, together with every managed object in them, only when the pool is torn down.
#[derive(Debug)]
pub(crate) struct BlockPool {
    blocks: heapless::Vec<MemoryBlock, MAX_ACTIVE_BLOCKS>,

    /// Free bytes of each active block, at the same index as the block itself. Kept separately
    /// so that the scans for a fitting block and for the smallest block stay on one cache line.
    free_bytes: heapless::Vec<usize, MAX_ACTIVE_BLOCKS>,

    initial_block_size: usize,
    subsequent_block_size: usize,
}

impl BlockPool {
    /// Creates an empty pool. No memory is allocated until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if either block size is too small to hold the block header or too large to be
    /// aligned to the registry slot alignment.
    #[must_use]
    pub(crate) fn new(initial_block_size: usize, subsequent_block_size: usize) -> Self {
        Self {
            blocks: heapless::Vec::new(),
            free_bytes: heapless::Vec::new(),
            initial_block_size: normalize_block_size(initial_block_size),
            subsequent_block_size: normalize_block_size(subsequent_block_size),
        }
    }

    #[must_use]
    pub(crate) fn initial_block_size(&self) -> usize {
        self.initial_block_size
    }

    #[must_use]
    pub(crate) fn subsequent_block_size(&self) -> usize {
        self.subsequent_block_size
    }

    /// The number of blocks that currently serve new allocations.
    #[must_use]
    pub(crate) fn active_block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Free bytes of each active block, in table order.
    #[must_use]
    pub(crate) fn active_block_free_bytes(&self) -> &[usize] {
        &self.free_bytes
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Allocates a zero-initialized block of the initial size so that the first allocations do
    /// not have to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the pool already has blocks and
    /// [`Error::AllocationFailed`] if the memory cannot be obtained.
    pub(crate) fn create_first_block(&mut self) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::InvalidArgument {
                problem: "the first block can only be created while the arena has no blocks",
            });
        }

        self.create_another_block(self.initial_block_size, true)
    }

    /// Allocates raw bytes whose destruction is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    /// Nothing is modified in that case.
    pub(crate) fn allocate_bytes(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero-sized allocations are rejected by the arena");

        let (index, ptr) = self.reserve(layout, false)?;
        self.settle(index);

        Ok(ptr)
    }

    /// Moves `value` into a region described by `layout` and registers it for destruction when
    /// the block holding it is destroyed.
    ///
    /// The value is placed at the start of the region. A layout larger than `T` leaves room for
    /// trailing data that `T` itself is responsible for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    /// Nothing is modified in that case and `value` is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `layout` cannot hold a `T` at its start.
    pub(crate) fn allocate_managed<T: 'static>(
        &mut self,
        layout: Layout,
        value: T,
    ) -> Result<NonNull<T>> {
        assert!(
            layout.size() >= size_of::<T>() && layout.align() >= align_of::<T>(),
            "layout {layout:?} cannot hold the managed value"
        );
        debug_assert!(layout.size() > 0, "zero-sized values are padded by the arena");

        let (index, ptr) = self.reserve(layout, true)?;
        let ptr = ptr.cast::<T>();

        let block = self
            .blocks
            .get_mut(index)
            .expect("reserve() returns the index of an active block");

        // SAFETY: The region was just carved out for this layout, which is large enough and
        // aligned for T as asserted above. Nothing else references it yet.
        unsafe {
            ptr.write(value);
        }

        // SAFETY: The value was initialized above and from now on is only dropped by the block.
        let entry = unsafe { DestructorEntry::new(ptr) };

        // SAFETY: The value lives in this block, which reserved a registry slot for it.
        unsafe {
            block.register_for_destruction(entry);
        }

        // Only now, with the registry slot filled, may the block be retired from the table.
        self.settle(index);

        Ok(ptr)
    }

    /// Destroys every block, including retired ones, returning the pool to its empty state.
    ///
    /// Blocks are destroyed in table order. Each block destroys its own managed objects
    /// (most recently allocated first) and then its chain of retired blocks.
    pub(crate) fn teardown(&mut self) {
        if self.is_empty() {
            return;
        }

        debug!(
            active_blocks = self.blocks.len(),
            retired_blocks = self
                .blocks
                .iter()
                .fold(0_usize, |total, block| total.wrapping_add(block.tail_len())),
            "tearing down all blocks"
        );

        while !self.blocks.is_empty() {
            // Take the block out of the table before dropping it so that a panicking destructor
            // cannot leave a half-destroyed block in the table.
            let block = self.blocks.remove(0);
            self.free_bytes.remove(0);
            drop(block);
        }

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Finds room for `layout`, creating a new block if no active block can hold it.
    ///
    /// Returns the index of the block that satisfied the request. The caller must call
    /// [`settle()`][Self::settle] with that index once it is done with the block.
    fn reserve(&mut self, layout: Layout, managed: bool) -> Result<(usize, NonNull<u8>)> {
        if self.is_empty() {
            self.create_another_block(self.block_size_for(layout, managed)?, false)?;
        }

        let slot = if managed { DESTRUCTOR_ENTRY_SIZE } else { 0 };

        // If this overflows, no existing block can hold it and we fall through to a new block
        // whose size calculation reports the failure.
        if let Some(minimum) = layout.size().checked_add(slot) {
            for (index, (block, free)) in self
                .blocks
                .iter_mut()
                .zip(self.free_bytes.iter())
                .enumerate()
            {
                if *free < minimum {
                    continue;
                }

                // Padding may still push the request over the edge, in which case we move on.
                if let Some(ptr) = block.try_use(layout, managed) {
                    return Ok((index, ptr));
                }
            }
        }

        self.create_another_block(self.block_size_for(layout, managed)?, false)?;

        // The new block is always pushed to the end of the table.
        let index = self.blocks.len().wrapping_sub(1);

        let ptr = self
            .blocks
            .get_mut(index)
            .expect("a block was just added")
            .try_use(layout, managed)
            .expect("a new block is always sized to hold the allocation that required it");

        trace!(
            size = layout.size(),
            align = layout.align(),
            managed,
            block_index = index,
            "allocation spilled into a new block"
        );

        Ok((index, ptr))
    }

    /// Refreshes the cached free bytes of the block at `index` and retires the block if it is
    /// no longer worth keeping active.
    fn settle(&mut self, index: usize) {
        let remaining = self
            .blocks
            .get(index)
            .expect("settle() is only called with the index of an active block")
            .remaining();

        *self
            .free_bytes
            .get_mut(index)
            .expect("free byte table has an entry for every block") = remaining;

        if self.blocks.len() > 1 && remaining <= RETIREMENT_CUTOFF_BYTES {
            self.retire(index);
        }

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Removes the block at `index` from the table and chains it onto a surviving block.
    ///
    /// The parent is the block that followed the retired one in the table, or the first block if
    /// the retired block was the last one.
    fn retire(&mut self, index: usize) {
        debug_assert!(self.blocks.len() > 1, "the only active block is never retired");

        let last = self.blocks.len().wrapping_sub(1);

        let block = self.blocks.remove(index);
        let free = self.free_bytes.remove(index);

        // After the removal, the block that followed the retired one has moved into its index.
        let parent_index = if index == last { 0 } else { index };

        debug!(
            retired_index = index,
            parent_index,
            free_bytes = free,
            managed_objects = block.managed_count(),
            "retiring exhausted block"
        );

        self.blocks
            .get_mut(parent_index)
            .expect("at least one block remains after retirement")
            .attach_tail(Box::new(block));
    }

    /// Adds a new block of `total_size` bytes to the end of the table.
    ///
    /// If the table is full, the block with the least free space is evicted and becomes the new
    /// block's tail. If the only active block is at or below the retirement cutoff, it is
    /// retired in the same way even though the table is not full.
    ///
    /// The memory is obtained before anything else happens, so a failure leaves the pool as it
    /// was.
    fn create_another_block(&mut self, total_size: usize, zero_initialize: bool) -> Result<()> {
        let mut block = MemoryBlock::new(total_size, zero_initialize)?;

        if self.blocks.is_full() {
            let smallest = self
                .smallest_block_index()
                .expect("a full table has at least one block");

            let evicted = self.blocks.remove(smallest);
            let free = self.free_bytes.remove(smallest);

            debug!(
                evicted_index = smallest,
                free_bytes = free,
                managed_objects = evicted.managed_count(),
                "evicting smallest active block"
            );

            block.attach_tail(Box::new(evicted));
        } else if self.blocks.len() == 1
            && self
                .free_bytes
                .first()
                .is_some_and(|free| *free <= RETIREMENT_CUTOFF_BYTES)
        {
            let retired = self.blocks.remove(0);
            let free = self.free_bytes.remove(0);

            debug!(
                free_bytes = free,
                managed_objects = retired.managed_count(),
                "retiring exhausted lone block"
            );

            block.attach_tail(Box::new(retired));
        }

        let free = block.remaining();

        debug!(
            total_size,
            free_bytes = free,
            zero_initialize,
            active_blocks = self.blocks.len().wrapping_add(1),
            "created memory block"
        );

        self.blocks
            .push(block)
            .expect("table has room after eviction");
        self.free_bytes
            .push(free)
            .expect("free byte table mirrors the block table");

        #[cfg(debug_assertions)]
        self.integrity_check();

        Ok(())
    }

    /// The index of the active block with the least free space, preferring the lowest index
    /// on ties. `None` if there are no active blocks.
    #[must_use]
    fn smallest_block_index(&self) -> Option<usize> {
        self.free_bytes
            .iter()
            .enumerate()
            .min_by_key(|(_, free)| **free)
            .map(|(index, _)| index)
    }

    /// The total size of a block that can hold `layout` in the worst case, or the configured
    /// block size if that is larger.
    fn block_size_for(&self, layout: Layout, managed: bool) -> Result<usize> {
        let padding = if layout.align() > 1 { layout.align() } else { 0 };
        let slot = if managed { DESTRUCTOR_ENTRY_SIZE } else { 0 };

        let required = layout
            .size()
            .checked_add(BLOCK_HEADER_SIZE)
            .and_then(|bytes| bytes.checked_add(padding))
            .and_then(|bytes| bytes.checked_add(slot))
            .and_then(|bytes| round_up(bytes, DESTRUCTOR_ENTRY_ALIGN))
            .ok_or(Error::AllocationFailed {
                requested_bytes: usize::MAX,
            })?;

        let configured = if self.is_empty() {
            self.initial_block_size
        } else {
            self.subsequent_block_size
        };

        Ok(required.max(configured))
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    fn integrity_check(&self) {
        assert_eq!(
            self.blocks.len(),
            self.free_bytes.len(),
            "block table and free byte table have different lengths"
        );

        let multiple = self.blocks.len() > 1;

        for (index, (block, free)) in self.blocks.iter().zip(self.free_bytes.iter()).enumerate() {
            block.integrity_check();

            assert_eq!(
                block.remaining(),
                *free,
                "cached free bytes of block {index} are stale"
            );

            assert!(
                !multiple || *free > RETIREMENT_CUTOFF_BYTES,
                "block {index} with {free} free bytes should have been retired"
            );
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn normalize_block_size(size: usize) -> usize {
    let size = round_up(size, DESTRUCTOR_ENTRY_ALIGN).expect("block size is too large to align");

    assert!(
        size > BLOCK_HEADER_SIZE,
        "block size {size} cannot hold the {BLOCK_HEADER_SIZE} byte block header"
    );

    size
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::items_after_statements,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const BLOCK_SIZE: usize = 1000;
    const CAPACITY: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

    fn bytes(size: usize) -> Layout {
        Layout::from_size_align(size, 1).unwrap()
    }

    fn base_addrs(pool: &BlockPool) -> Vec<usize> {
        pool.blocks.iter().map(MemoryBlock::base_addr).collect()
    }

    #[test]
    fn new_pool_has_no_blocks() {
        let pool = BlockPool::new(BLOCK_SIZE, 2000);

        assert!(pool.is_empty());
        assert_eq!(pool.active_block_count(), 0);
        assert_eq!(pool.initial_block_size(), BLOCK_SIZE);
        assert_eq!(pool.subsequent_block_size(), 2000);
        assert_eq!(pool.smallest_block_index(), None);
    }

    #[test]
    fn block_sizes_are_rounded_to_slot_alignment() {
        let pool = BlockPool::new(1001, 1001);

        assert_eq!(pool.initial_block_size() % DESTRUCTOR_ENTRY_ALIGN, 0);
        assert!(pool.initial_block_size() >= 1001);
    }

    #[test]
    fn first_allocation_creates_first_block() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(100)).unwrap();

        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.active_block_free_bytes(), &[CAPACITY - 100]);
    }

    #[test]
    fn small_allocations_share_a_block() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        for _ in 0..10 {
            pool.allocate_bytes(bytes(50)).unwrap();
        }

        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.active_block_free_bytes(), &[CAPACITY - 500]);
    }

    #[test]
    fn oversized_allocation_gets_dedicated_block() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(10)).unwrap();
        let ptr = pool.allocate_bytes(bytes(5000)).unwrap();

        // The new block has exactly enough room, so it is exhausted and retired at once.
        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.blocks[0].tail_len(), 1);

        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 5000);
            assert_eq!(*ptr.as_ptr().add(4999), 0xAB);
        }
    }

    #[test]
    fn eviction_removes_smallest_block_and_keeps_its_content() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        let first = pool.allocate_bytes(bytes(700)).unwrap();
        unsafe { first.as_ptr().write_bytes(0x5A, 700) };

        for _ in 0..3 {
            pool.allocate_bytes(bytes(600)).unwrap();
        }

        assert_eq!(pool.active_block_count(), MAX_ACTIVE_BLOCKS);
        assert_eq!(
            pool.active_block_free_bytes(),
            &[CAPACITY - 700, CAPACITY - 600, CAPACITY - 600, CAPACITY - 600]
        );
        assert_eq!(pool.smallest_block_index(), Some(0));

        let evicted_addr = pool.blocks[0].base_addr();

        pool.allocate_bytes(bytes(600)).unwrap();

        assert_eq!(pool.active_block_count(), MAX_ACTIVE_BLOCKS);
        assert!(!base_addrs(&pool).contains(&evicted_addr));
        assert_eq!(
            pool.active_block_free_bytes()[pool.smallest_block_index().unwrap()],
            CAPACITY - 600
        );

        // The evicted block is now the tail of the newest block and its memory is intact.
        let newest = pool.blocks.last().unwrap();
        assert_eq!(newest.tail_len(), 1);

        let content = unsafe { std::slice::from_raw_parts(first.as_ptr(), 700) };
        assert!(content.iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn smallest_block_ties_prefer_lowest_index() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(600)).unwrap();
        pool.allocate_bytes(bytes(600)).unwrap();

        assert_eq!(pool.active_block_count(), 2);
        assert_eq!(pool.smallest_block_index(), Some(0));
    }

    #[test]
    fn block_at_cutoff_is_retired_onto_first_block_when_last() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(100)).unwrap();
        let first_addr = pool.blocks[0].base_addr();

        // Does not fit into the first block, leaves the new block exactly at the cutoff.
        pool.allocate_bytes(bytes(CAPACITY - RETIREMENT_CUTOFF_BYTES))
            .unwrap();

        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.blocks[0].base_addr(), first_addr);
        assert_eq!(pool.blocks[0].tail_len(), 1);
    }

    #[test]
    fn block_above_cutoff_stays_active() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(100)).unwrap();
        pool.allocate_bytes(bytes(CAPACITY - RETIREMENT_CUTOFF_BYTES - 1))
            .unwrap();

        assert_eq!(pool.active_block_count(), 2);
        assert_eq!(
            pool.active_block_free_bytes(),
            &[CAPACITY - 100, RETIREMENT_CUTOFF_BYTES + 1]
        );
    }

    #[test]
    fn retired_block_is_chained_onto_its_successor() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(600)).unwrap();
        pool.allocate_bytes(bytes(600)).unwrap();
        pool.allocate_bytes(bytes(600)).unwrap();

        let addrs = base_addrs(&pool);

        // The first block is the first to fit, so this drains it down to the cutoff.
        pool.allocate_bytes(bytes(CAPACITY - 600 - RETIREMENT_CUTOFF_BYTES))
            .unwrap();

        assert_eq!(base_addrs(&pool), vec![addrs[1], addrs[2]]);
        assert_eq!(pool.blocks[0].tail_len(), 1);
        assert_eq!(pool.blocks[1].tail_len(), 0);
    }

    #[test]
    fn lone_block_is_not_retired_by_cutoff() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(CAPACITY - 10)).unwrap();

        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.active_block_free_bytes(), &[10]);
    }

    #[test]
    fn exhausted_lone_block_is_retired_when_next_block_is_created() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(CAPACITY - RETIREMENT_CUTOFF_BYTES))
            .unwrap();
        let first_addr = pool.blocks[0].base_addr();

        pool.allocate_bytes(bytes(100)).unwrap();

        assert_eq!(pool.active_block_count(), 1);
        assert_ne!(pool.blocks[0].base_addr(), first_addr);
        assert_eq!(pool.blocks[0].tail_len(), 1);
    }

    #[test]
    fn lone_block_above_cutoff_is_kept_when_next_block_is_created() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(CAPACITY - RETIREMENT_CUTOFF_BYTES - 1))
            .unwrap();
        pool.allocate_bytes(bytes(100)).unwrap();

        assert_eq!(pool.active_block_count(), 2);
    }

    #[test]
    fn subsequent_blocks_use_subsequent_size() {
        let mut pool = BlockPool::new(BLOCK_SIZE, 3000);

        pool.allocate_bytes(bytes(600)).unwrap();
        pool.allocate_bytes(bytes(600)).unwrap();

        assert_eq!(pool.blocks[0].capacity(), CAPACITY);
        assert_eq!(pool.blocks[1].capacity(), 3000 - BLOCK_HEADER_SIZE);
    }

    #[test]
    fn padding_is_reserved_in_new_blocks() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        let layout = Layout::from_size_align(4000, 64).unwrap();
        let ptr = pool.allocate_bytes(layout).unwrap();

        assert_eq!(ptr.as_ptr().addr() % 64, 0);
    }

    #[test]
    fn managed_values_are_destroyed_at_teardown_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));

        struct Logged(u32, Rc<RefCell<Vec<u32>>>);

        impl Drop for Logged {
            fn drop(&mut self) {
                self.1.borrow_mut().push(self.0);
            }
        }

        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        for id in 1..=3 {
            let ptr = pool
                .allocate_managed(Layout::new::<Logged>(), Logged(id, Rc::clone(&log)))
                .unwrap();
            assert_eq!(unsafe { ptr.as_ref() }.0, id);
        }

        assert!(log.borrow().is_empty());

        pool.teardown();

        assert_eq!(*log.borrow(), vec![3, 2, 1]);
        assert!(pool.is_empty());
    }

    #[test]
    fn managed_allocation_accounts_for_registry_slot() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_managed(Layout::new::<u64>(), 5_u64).unwrap();

        assert_eq!(
            pool.active_block_free_bytes(),
            &[CAPACITY - 8 - DESTRUCTOR_ENTRY_SIZE]
        );
    }

    #[test]
    fn managed_value_in_retired_block_survives_until_teardown() {
        let tracker = Rc::new(());
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(100)).unwrap();

        // Fills a fresh block down to the cutoff with a managed value, retiring it immediately.
        let size = CAPACITY - DESTRUCTOR_ENTRY_SIZE - RETIREMENT_CUTOFF_BYTES;
        let layout = Layout::from_size_align(size, align_of::<Rc<()>>()).unwrap();
        let ptr = pool.allocate_managed(layout, Rc::clone(&tracker)).unwrap();

        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(Rc::strong_count(&tracker), 2);
        assert!(Rc::ptr_eq(unsafe { ptr.as_ref() }, &tracker));

        pool.teardown();
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn failed_block_allocation_changes_nothing() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);
        pool.allocate_bytes(bytes(100)).unwrap();

        let huge = Layout::from_size_align((usize::MAX >> 1) - 7, 8).unwrap();
        let result = pool.allocate_bytes(huge);

        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.active_block_free_bytes(), &[CAPACITY - 100]);
    }

    #[test]
    fn create_first_block_only_when_empty() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.create_first_block().unwrap();
        assert_eq!(pool.active_block_count(), 1);
        assert_eq!(pool.active_block_free_bytes(), &[CAPACITY]);

        assert!(matches!(
            pool.create_first_block(),
            Err(Error::InvalidArgument { .. })
        ));
        assert_eq!(pool.active_block_count(), 1);
    }

    #[test]
    fn teardown_of_empty_pool_is_noop() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.teardown();
        pool.teardown();

        assert!(pool.is_empty());
        assert_eq!(pool.initial_block_size(), BLOCK_SIZE);
    }

    #[test]
    fn pool_is_reusable_after_teardown() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        pool.allocate_bytes(bytes(600)).unwrap();
        pool.allocate_bytes(bytes(600)).unwrap();
        pool.teardown();

        pool.allocate_bytes(bytes(600)).unwrap();
        assert_eq!(pool.active_block_count(), 1);
    }

    #[test]
    fn many_allocations_never_exceed_block_limit() {
        let mut pool = BlockPool::new(BLOCK_SIZE, BLOCK_SIZE);

        for size in (1..2000).step_by(37) {
            pool.allocate_bytes(bytes(size)).unwrap();
            assert!(pool.active_block_count() <= MAX_ACTIVE_BLOCKS);
        }
    }
}
