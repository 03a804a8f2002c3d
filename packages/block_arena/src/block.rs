use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use std::mem;
use std::ptr::NonNull;

use crate::align::padding_for;
use crate::destructor::{DESTRUCTOR_ENTRY_ALIGN, DESTRUCTOR_ENTRY_SIZE, DestructorEntry};
use crate::error::{Error, Result};

/// A single contiguous buffer that serves allocations from both ends.
///
/// Raw bytes are handed out by a forward bump cursor starting at the beginning of the buffer.
/// Managed objects additionally get a [`DestructorEntry`] slot in a registry that grows backward
/// from the end of the buffer. The two regions share the buffer and must never cross:
///
/// ```text
/// [ allocated bytes ... | bump -> free <- allocatable_end | registry slots (newest first) ]
/// ```
///
/// A block may also own a chain of retired blocks (its tail). Those stay alive, with every object
/// in them, until this block is dropped.
///
/// # Out of band access
///
/// The block never creates references to the memory it hands out. Callers are free to keep
/// pointers and references into the buffer for as long as the block is alive.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    /// Start of the buffer, aligned to [`DESTRUCTOR_ENTRY_ALIGN`].
    buffer: NonNull<u8>,

    /// Layout the buffer was allocated with. Its size is the usable region of the block and is
    /// a multiple of [`DESTRUCTOR_ENTRY_ALIGN`].
    layout: Layout,

    /// Offset of the next free byte from the start of the buffer.
    bump: usize,

    /// Number of registry slots in use at the back of the buffer.
    managed_count: usize,

    /// Retired blocks whose destruction has been deferred until this block is dropped.
    tail: Option<Box<MemoryBlock>>,
}

/// Fixed bookkeeping footprint of one block.
///
/// The size requested for a block covers this header plus the usable buffer, so a block created
/// for `N` bytes offers `N - BLOCK_HEADER_SIZE` bytes to allocations.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<MemoryBlock>();

impl MemoryBlock {
    /// Allocates a new block whose total footprint is `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the system allocator cannot provide the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `total_size` does not exceed [`BLOCK_HEADER_SIZE`] or if the usable size is not
    /// a multiple of the registry slot alignment.
    pub(crate) fn new(total_size: usize, zero_initialize: bool) -> Result<Self> {
        assert!(
            total_size > BLOCK_HEADER_SIZE,
            "block of {total_size} bytes cannot hold its own {BLOCK_HEADER_SIZE} byte header"
        );

        // Cannot underflow, checked above.
        let capacity = total_size.wrapping_sub(BLOCK_HEADER_SIZE);

        assert!(
            capacity % DESTRUCTOR_ENTRY_ALIGN == 0,
            "usable block size {capacity} is not a multiple of {DESTRUCTOR_ENTRY_ALIGN}"
        );

        let layout = Layout::from_size_align(capacity, DESTRUCTOR_ENTRY_ALIGN).map_err(|_| {
            Error::AllocationFailed {
                requested_bytes: total_size,
            }
        })?;

        // SAFETY: The layout has a non-zero size because capacity > 0 is implied by the
        // assertion on total_size above.
        let raw = unsafe {
            if zero_initialize {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };

        let buffer = NonNull::new(raw).ok_or(Error::AllocationFailed {
            requested_bytes: total_size,
        })?;

        let block = Self {
            buffer,
            layout,
            bump: 0,
            managed_count: 0,
            tail: None,
        };

        #[cfg(debug_assertions)]
        block.integrity_check();

        Ok(block)
    }

    /// Size of the usable region of the block, excluding the header.
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Offset one past the last byte that may still be handed out by the bump cursor.
    fn allocatable_end(&self) -> usize {
        // Cannot underflow: every registered slot was reserved out of the remaining space.
        self.capacity()
            .wrapping_sub(self.managed_count.wrapping_mul(DESTRUCTOR_ENTRY_SIZE))
    }

    /// The number of bytes that can still be handed out, before alignment padding.
    #[must_use]
    pub(crate) fn remaining(&self) -> usize {
        // Cannot underflow, the bump cursor never passes the allocatable end.
        self.allocatable_end().wrapping_sub(self.bump)
    }

    /// The number of bytes consumed by allocations, padding and registry slots.
    #[must_use]
    pub(crate) fn used(&self) -> usize {
        // Cannot overflow, both terms are bounded by the capacity and do not overlap.
        self.bump
            .wrapping_add(self.managed_count.wrapping_mul(DESTRUCTOR_ENTRY_SIZE))
    }

    /// The number of objects whose destruction this block is responsible for.
    #[must_use]
    pub(crate) fn managed_count(&self) -> usize {
        self.managed_count
    }

    /// Address of the start of the buffer. Uniquely identifies the block while it is alive.
    #[must_use]
    pub(crate) fn base_addr(&self) -> usize {
        self.buffer.as_ptr().addr()
    }

    /// Attempts to carve `layout` out of the free region.
    ///
    /// When `managed` is set, the free region must also have room for one registry slot, which
    /// the caller is expected to fill via [`register_for_destruction()`][1] once the object
    /// has been initialized.
    ///
    /// Returns `None` without changing anything if the block cannot hold the allocation.
    ///
    /// [1]: Self::register_for_destruction
    #[must_use]
    pub(crate) fn try_use(&mut self, layout: Layout, managed: bool) -> Option<NonNull<u8>> {
        let addr = self.base_addr().wrapping_add(self.bump);
        let padding = padding_for(addr, layout.align());
        let slot = if managed { DESTRUCTOR_ENTRY_SIZE } else { 0 };

        let needed = padding.checked_add(layout.size())?.checked_add(slot)?;

        if needed > self.remaining() {
            return None;
        }

        // Cannot overflow, the whole allocation fits below the allocatable end.
        let offset = self.bump.wrapping_add(padding);

        // SAFETY: offset + layout.size() <= allocatable_end <= capacity, so the resulting
        // pointer stays within our buffer.
        let ptr = unsafe { self.buffer.add(offset) };

        self.bump = offset.wrapping_add(layout.size());

        debug_assert_eq!(ptr.as_ptr().addr() % layout.align(), 0);

        #[cfg(debug_assertions)]
        self.integrity_check();

        Some(ptr)
    }

    /// Records that the object described by `entry` must be destroyed when this block is.
    ///
    /// # Panics
    ///
    /// Panics if the free region has no room for the slot, which can only happen if the object
    /// was not allocated from this block with `managed` set.
    ///
    /// # Safety
    ///
    /// The entry must target an initialized object that was allocated from this block with
    /// `managed` set and that is not registered anywhere else.
    pub(crate) unsafe fn register_for_destruction(&mut self, entry: DestructorEntry) {
        assert!(
            self.remaining() >= DESTRUCTOR_ENTRY_SIZE,
            "no registry slot was reserved for the object at {:?}",
            entry.target()
        );

        debug_assert!(self.holds(entry.target()));

        let slot = self.slot_ptr(self.managed_count);

        // SAFETY: The slot lies between the bump cursor and the registry (asserted above), it is
        // aligned for DestructorEntry and nothing else references that memory.
        unsafe {
            slot.write(entry);
        }

        // Cannot overflow, each slot occupies buffer space.
        self.managed_count = self.managed_count.wrapping_add(1);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Runs every registered destructor, most recently registered first, and empties the registry.
    ///
    /// # Safety
    ///
    /// No references to managed objects in this block may be used afterwards.
    pub(crate) unsafe fn destroy_all(&mut self) {
        // Shrink the registry before running each entry so that a panicking destructor can never
        // cause an entry to run twice.
        while let Some(index) = self.managed_count.checked_sub(1) {
            self.managed_count = index;

            // SAFETY: Slots below the old managed_count were written by register_for_destruction().
            let entry = unsafe { self.slot_ptr(index).read() };

            // SAFETY: The entry was removed from the registry above so it runs exactly once and
            // the caller guarantees nobody uses the object afterwards.
            unsafe {
                entry.run();
            }
        }
    }

    /// Appends `block` to the end of this block's tail chain.
    ///
    /// The appended block, together with its own tail, is dropped when this block is dropped.
    pub(crate) fn attach_tail(&mut self, block: Box<Self>) {
        let mut cursor = &mut self.tail;

        while cursor.is_some() {
            cursor = &mut cursor
                .as_mut()
                .expect("guarded by the loop condition")
                .tail;
        }

        *cursor = Some(block);
    }

    /// The number of retired blocks chained behind this one.
    #[must_use]
    pub(crate) fn tail_len(&self) -> usize {
        let mut len = 0_usize;
        let mut cursor = self.tail.as_deref();

        while let Some(block) = cursor {
            // Cannot overflow, every block in the chain is a live allocation.
            len = len.wrapping_add(1);
            cursor = block.tail.as_deref();
        }

        len
    }

    /// Whether `ptr` points into the allocated (bumped) part of this block.
    fn holds(&self, ptr: NonNull<()>) -> bool {
        let addr = ptr.as_ptr().addr();
        addr >= self.base_addr() && addr < self.base_addr().wrapping_add(self.bump)
    }

    /// Pointer to registry slot `index`, counting from the end of the buffer.
    #[allow(
        clippy::cast_ptr_alignment,
        reason = "buffer is aligned to DESTRUCTOR_ENTRY_ALIGN and sized as a multiple of it"
    )]
    fn slot_ptr(&self, index: usize) -> NonNull<DestructorEntry> {
        let from_end = index
            .checked_add(1)
            .and_then(|count| count.checked_mul(DESTRUCTOR_ENTRY_SIZE))
            .filter(|bytes| *bytes <= self.capacity())
            .expect("registry slot index out of bounds");

        // Cannot underflow, checked above.
        let offset = self.capacity().wrapping_sub(from_end);

        // SAFETY: offset is within the buffer as checked above.
        unsafe { self.buffer.add(offset).cast::<DestructorEntry>() }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    pub(crate) fn integrity_check(&self) {
        let registry_bytes = self
            .managed_count
            .checked_mul(DESTRUCTOR_ENTRY_SIZE)
            .expect("registry size overflowed");

        assert!(
            registry_bytes <= self.capacity(),
            "registry of {} slots exceeds block capacity {}",
            self.managed_count,
            self.capacity()
        );

        assert!(
            self.bump <= self.allocatable_end(),
            "bump cursor {} crossed into the registry at {}",
            self.bump,
            self.allocatable_end()
        );

        assert_eq!(
            self.remaining().wrapping_add(self.used()),
            self.capacity(),
            "remaining and used bytes do not add up to the block capacity"
        );

        assert!(
            self.managed_count <= self.used(),
            "more managed objects ({}) than bytes used ({})",
            self.managed_count,
            self.used()
        );
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        // SAFETY: Blocks are only dropped by the pool when it has exclusive access to the arena,
        // at which point no references handed out by the arena can still be alive.
        unsafe {
            self.destroy_all();
        }

        // Walk the chain instead of recursing so that long chains cannot exhaust the stack.
        let mut next = self.tail.take();

        while let Some(mut block) = next {
            next = block.tail.take();
            drop(block);
        }

        // SAFETY: The buffer was allocated in new() with this exact layout and every object
        // within it has been destroyed above.
        unsafe {
            dealloc(self.buffer.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const TEST_BLOCK_SIZE: usize = 1000;

    type DropLog = Rc<RefCell<Vec<u32>>>;

    struct Logged {
        id: u32,
        log: DropLog,
    }

    impl Drop for Logged {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    fn emplace<T>(block: &mut MemoryBlock, value: T) -> NonNull<T> {
        let ptr = block
            .try_use(Layout::new::<T>(), true)
            .expect("test block has room")
            .cast::<T>();

        unsafe {
            ptr.write(value);
            block.register_for_destruction(DestructorEntry::new(ptr));
        }

        ptr
    }

    fn assert_accounting(block: &MemoryBlock) {
        assert_eq!(block.remaining() + block.used(), block.capacity());
    }

    #[test]
    fn new_block_is_empty() {
        let block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();

        assert_eq!(block.capacity(), TEST_BLOCK_SIZE - BLOCK_HEADER_SIZE);
        assert_eq!(block.remaining(), TEST_BLOCK_SIZE - BLOCK_HEADER_SIZE);
        assert_eq!(block.used(), 0);
        assert_eq!(block.managed_count(), 0);
        assert_eq!(block.tail_len(), 0);
    }

    #[test]
    fn zero_initialized_block_reads_zero() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, true).unwrap();
        let capacity = block.capacity();

        let ptr = block
            .try_use(Layout::from_size_align(capacity, 1).unwrap(), false)
            .unwrap();

        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), capacity) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn try_use_returns_aligned_addresses() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();

        for align in [1_usize, 2, 4, 8, 16, 32] {
            // Knock the cursor off any natural alignment first.
            _ = block.try_use(Layout::from_size_align(1, 1).unwrap(), false);

            let ptr = block
                .try_use(Layout::from_size_align(3, align).unwrap(), false)
                .unwrap();

            assert_eq!(ptr.as_ptr().addr() % align, 0);
            assert_accounting(&block);
        }
    }

    #[test]
    fn try_use_fails_without_partial_commit() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();
        let capacity = block.capacity();

        _ = block.try_use(Layout::from_size_align(1, 1).unwrap(), false);
        let remaining_before = block.remaining();

        // Fits by size alone but not after padding for 8-byte alignment.
        let layout = Layout::from_size_align(remaining_before - 1, 8).unwrap();
        assert!(block.try_use(layout, false).is_none());
        assert_eq!(block.remaining(), remaining_before);

        let layout = Layout::from_size_align(capacity, 1).unwrap();
        assert!(block.try_use(layout, false).is_none());
        assert_eq!(block.remaining(), remaining_before);
        assert_accounting(&block);
    }

    #[test]
    fn managed_allocation_requires_room_for_slot() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();
        let capacity = block.capacity();

        let exact = Layout::from_size_align(capacity, 1).unwrap();
        assert!(block.try_use(exact, true).is_none());

        let with_slot = Layout::from_size_align(capacity - DESTRUCTOR_ENTRY_SIZE, 1).unwrap();
        assert!(block.try_use(with_slot, true).is_some());
        assert_eq!(block.remaining(), DESTRUCTOR_ENTRY_SIZE);
    }

    #[test]
    fn registering_consumes_one_slot() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();
        let capacity = block.capacity();

        _ = emplace(&mut block, 7_u64);

        assert_eq!(block.managed_count(), 1);
        assert_eq!(block.used(), 8 + DESTRUCTOR_ENTRY_SIZE);
        assert_eq!(block.remaining(), capacity - 8 - DESTRUCTOR_ENTRY_SIZE);
        assert_accounting(&block);
    }

    #[test]
    fn destroys_in_reverse_registration_order() {
        let log = DropLog::default();
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();

        for id in 1..=3 {
            _ = emplace(
                &mut block,
                Logged {
                    id,
                    log: Rc::clone(&log),
                },
            );
        }

        unsafe { block.destroy_all() };

        assert_eq!(*log.borrow(), vec![3, 2, 1]);
        assert_eq!(block.managed_count(), 0);

        // Nothing runs twice when the block itself is dropped.
        drop(block);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn values_survive_until_block_is_dropped() {
        let mut block = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();

        let a = emplace(&mut block, String::from("first"));
        let b = emplace(&mut block, vec![1_u32, 2, 3]);

        unsafe {
            assert_eq!(a.as_ref(), "first");
            assert_eq!(b.as_ref(), &[1, 2, 3]);
        }
    }

    #[test]
    fn attach_tail_appends_to_end_of_chain() {
        let mut head = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();
        let first = Box::new(MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap());
        let second = Box::new(MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap());
        let second_addr = second.base_addr();

        head.attach_tail(first);
        head.attach_tail(second);

        assert_eq!(head.tail_len(), 2);

        let last = head.tail.as_ref().unwrap().tail.as_ref().unwrap();
        assert_eq!(last.base_addr(), second_addr);
    }

    #[test]
    fn drop_destroys_own_objects_then_tail() {
        let log = DropLog::default();

        let mut retired = Box::new(MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap());
        _ = emplace(
            &mut retired,
            Logged {
                id: 10,
                log: Rc::clone(&log),
            },
        );

        let mut head = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();
        _ = emplace(
            &mut head,
            Logged {
                id: 1,
                log: Rc::clone(&log),
            },
        );
        head.attach_tail(retired);

        assert!(log.borrow().is_empty());
        drop(head);

        assert_eq!(*log.borrow(), vec![1, 10]);
    }

    #[test]
    fn long_tail_chain_drops_without_recursion() {
        let mut head = MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap();

        for _ in 0..500 {
            head.attach_tail(Box::new(MemoryBlock::new(TEST_BLOCK_SIZE, false).unwrap()));
        }

        assert_eq!(head.tail_len(), 500);
        drop(head);
    }

    #[test]
    fn impossible_size_is_allocation_failure() {
        let result = MemoryBlock::new(usize::MAX & !(DESTRUCTOR_ENTRY_ALIGN - 1), false);
        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    }

    #[test]
    #[should_panic]
    fn block_smaller_than_header_panics() {
        _ = MemoryBlock::new(BLOCK_HEADER_SIZE, false);
    }
}
