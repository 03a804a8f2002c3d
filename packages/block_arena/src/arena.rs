use std::alloc::Layout;
use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::ptr::NonNull;
use std::thread;

use tracing::error;

use crate::builder::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::pool::BlockPool;
use crate::{
    BlockArenaBuilder, FixedVec, Lazy, LeakChecked, LifetimePolicy, LifetimeToken, Unchecked,
};

/// A single-threaded arena that serves allocations from a bounded set of large memory blocks.
///
/// Objects are never freed individually. Instead, every allocation lives until the arena is
/// [cleared][Self::clear] or dropped. Two kinds of allocations are supported:
///
/// * **Unmanaged** allocations ([`allocate_bytes()`][Self::allocate_bytes],
///   [`allocate_unmanaged()`][Self::allocate_unmanaged]) are plain memory. The arena never drops
///   anything placed there.
/// * **Managed** allocations ([`allocate_and_construct()`][Self::allocate_and_construct] and
///   friends) hold a value that the arena drops at teardown. Values are dropped in reverse
///   allocation order within each block.
///
/// At most [`MAX_ACTIVE_BLOCKS`][crate::MAX_ACTIVE_BLOCKS] blocks serve new allocations at any
/// time. When more room is needed, the block with the least free space is retired to make room
/// for a new one. Retired blocks are kept alive until teardown, so references into them remain
/// valid for as long as the arena is borrowed.
///
/// # Lifetimes
///
/// Allocating methods take `&self` and return references that borrow the arena. Teardown
/// requires `&mut self`, so the borrow checker guarantees that no reference into the arena
/// survives it. Managed values must be `'static` so that their destructors cannot observe
/// other arena objects that may already have been dropped.
///
/// # Leak detection
///
/// An arena built with [`BlockArenaBuilder::leak_checked()`] counts its live managed objects.
/// If any of them is still alive after teardown, [`clear()`][Self::clear] returns
/// [`Error::ResourceLeak`] and dropping the arena panics.
///
/// # Thread safety
///
/// The arena is neither [`Send`] nor [`Sync`]. Use one arena per thread.
///
/// # Examples
///
/// ```
/// use block_arena::BlockArena;
///
/// let mut arena = BlockArena::new();
///
/// let greeting = arena.allocate_and_construct(String::from("hello")).unwrap();
/// greeting.push_str(", world");
///
/// let count = arena.allocate_default::<u64>().unwrap();
/// *count += 1;
///
/// assert_eq!(greeting, "hello, world");
/// assert_eq!(*count, 1);
///
/// // Drops the string and releases all blocks.
/// arena.clear().unwrap();
/// assert_eq!(arena.active_block_count(), 0);
/// ```
#[derive(Debug)]
pub struct BlockArena<P: LifetimePolicy = Unchecked> {
    pool: RefCell<BlockPool>,
    policy: P,
}

/// Storage for a managed value together with the lifetime token issued for it.
///
/// The token is declared after the value and is therefore dropped after it.
struct Managed<T, K> {
    value: T,
    _token: K,
}

impl BlockArena {
    /// Creates an arena with [`DEFAULT_BLOCK_SIZE`][crate::DEFAULT_BLOCK_SIZE] blocks and no
    /// leak detection.
    ///
    /// No memory is allocated until the first allocation.
    #[must_use]
    pub fn new() -> Self {
        Self::new_inner(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE)
    }

    /// Starts configuring a new arena.
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> BlockArenaBuilder {
        BlockArenaBuilder::new()
    }
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LifetimePolicy> BlockArena<P> {
    #[must_use]
    pub(crate) fn new_inner(initial_block_size: usize, subsequent_block_size: usize) -> Self {
        Self {
            pool: RefCell::new(BlockPool::new(initial_block_size, subsequent_block_size)),
            policy: P::default(),
        }
    }

    /// Allocates uninitialized memory for `layout`. The arena never drops anything placed there.
    ///
    /// The memory remains valid until the arena is cleared or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `layout` has a size of zero and
    /// [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    pub fn allocate_bytes(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::InvalidArgument {
                problem: "cannot allocate zero bytes",
            });
        }

        self.pool.borrow_mut().allocate_bytes(layout)
    }

    /// Allocates uninitialized storage for a `T`. The arena never drops the value.
    ///
    /// The caller may initialize the storage and use it like any other `T`. If the value needs
    /// to be dropped, that is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_arena::BlockArena;
    ///
    /// let arena = BlockArena::new();
    ///
    /// let slot = arena.allocate_unmanaged::<[u32; 4]>().unwrap();
    /// let numbers = slot.write([1, 2, 3, 4]);
    ///
    /// assert_eq!(numbers.iter().sum::<u32>(), 10);
    /// ```
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_unmanaged<T>(&self) -> Result<&mut MaybeUninit<T>> {
        let ptr = self
            .pool
            .borrow_mut()
            .allocate_bytes(storage_layout::<T>())?
            .cast::<MaybeUninit<T>>();

        // SAFETY: The region is sized and aligned for T, is not referenced by anything else and
        // stays allocated until teardown, which requires an exclusive borrow of the arena.
        Ok(unsafe { &mut *ptr.as_ptr() })
    }

    /// Moves `value` into the arena. The arena drops it at teardown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    /// The value is dropped in that case.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_and_construct<T: 'static>(&self, value: T) -> Result<&mut T> {
        self.place(value)
    }

    /// Places `T::default()` into the arena. The arena drops it at teardown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_default<T: Default + 'static>(&self) -> Result<&mut T> {
        self.place(T::default())
    }

    /// Places the value returned by `f` into the arena. The arena drops it at teardown.
    ///
    /// `f` runs before the arena is touched, so a panic in `f` leaves the arena unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    /// The value is dropped in that case.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_with<T: 'static>(&self, f: impl FnOnce() -> T) -> Result<&mut T> {
        self.place(f())
    }

    /// Allocates managed storage for a `T` that is constructed later.
    ///
    /// Whatever value the storage holds at teardown is dropped by the arena.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_lazy<T: 'static>(&self) -> Result<&mut Lazy<T>> {
        self.place(Lazy::new())
    }

    /// Allocates a vector with room for exactly `capacity` elements of `T`.
    ///
    /// The vector header and its elements occupy a single managed allocation. Elements still
    /// in the vector at teardown are dropped by the arena. The header is pinned in place because
    /// it refers to the element storage that follows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `capacity` elements cannot fit in the address space
    /// and [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_fixed_vec<T: 'static>(
        &self,
        capacity: usize,
    ) -> Result<Pin<&mut FixedVec<T>>> {
        const TOO_LARGE: Error = Error::InvalidArgument {
            problem: "fixed vector capacity exceeds the address space",
        };

        let elements = Layout::array::<T>(capacity).map_err(|_| TOO_LARGE)?;
        let (layout, elements_offset) = Layout::new::<Managed<FixedVec<T>, P::Token>>()
            .extend(elements)
            .map_err(|_| TOO_LARGE)?;

        let managed = Managed {
            value: FixedVec::unbound(capacity),
            _token: self.policy.issue_token(),
        };

        let ptr = self.pool.borrow_mut().allocate_managed(layout, managed)?;

        // SAFETY: The allocation was made with a layout that places the element array at this
        // offset, so the resulting pointer is within the allocation and aligned for T.
        let elements = unsafe { ptr.cast::<u8>().add(elements_offset).cast::<T>() };

        // SAFETY: The header was initialized by the pool and nothing else references it. It
        // stays allocated until teardown, which requires an exclusive borrow of the arena.
        let managed = unsafe { &mut *ptr.as_ptr() };

        // SAFETY: The element array belongs to this allocation alone and lives as long as the
        // header, since both are released by the same block.
        unsafe {
            managed.value.bind(elements);
        }

        // SAFETY: The header stays at this address until the block holding it is released,
        // which also drops it in place. Only the pinned reference is ever handed out.
        Ok(unsafe { Pin::new_unchecked(&mut managed.value) })
    }

    /// Allocates the first block up front, with its memory zero-initialized, so that the first
    /// allocations do not pay for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the arena already has blocks and
    /// [`Error::AllocationFailed`] if the block cannot be allocated.
    pub fn create_first_block(&self) -> Result<()> {
        self.pool.borrow_mut().create_first_block()
    }

    /// Drops every managed object and releases every block, returning the arena to its
    /// initial empty state.
    ///
    /// Calling this on an arena with no blocks does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceLeak`] if the arena uses the [`LeakChecked`] policy and some
    /// managed objects are still alive after teardown. The arena is empty either way.
    pub fn clear(&mut self) -> Result<()> {
        self.pool.get_mut().teardown();

        match self.policy.outstanding() {
            0 => Ok(()),
            outstanding => {
                error!(outstanding, "managed objects outlived arena teardown");
                Err(Error::ResourceLeak { outstanding })
            }
        }
    }

    /// The number of blocks that currently serve new allocations.
    #[must_use]
    pub fn active_block_count(&self) -> usize {
        self.pool.borrow().active_block_count()
    }

    /// The free bytes in each block that currently serves new allocations.
    #[must_use]
    pub fn active_block_free_bytes(&self) -> Vec<usize> {
        self.pool.borrow().active_block_free_bytes().to_vec()
    }

    /// The size of the first block, rounded up to the registry slot alignment.
    #[must_use]
    pub fn initial_block_size(&self) -> usize {
        self.pool.borrow().initial_block_size()
    }

    /// The size of every block after the first, rounded up to the registry slot alignment.
    #[must_use]
    pub fn subsequent_block_size(&self) -> usize {
        self.pool.borrow().subsequent_block_size()
    }

    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    fn place<T: 'static>(&self, value: T) -> Result<&mut T> {
        let managed = Managed {
            value,
            _token: self.policy.issue_token(),
        };

        let ptr = self
            .pool
            .borrow_mut()
            .allocate_managed(storage_layout::<Managed<T, P::Token>>(), managed)?;

        // SAFETY: The pool initialized the value and nothing else references it. It stays
        // allocated until teardown, which requires an exclusive borrow of the arena.
        let managed = unsafe { &mut *ptr.as_ptr() };

        Ok(&mut managed.value)
    }
}

impl BlockArena<LeakChecked> {
    /// Places the value returned by `f` into the arena, handing `f` the lifetime token that
    /// tracks the new object.
    ///
    /// The object is responsible for holding the token until it is dropped. An object that
    /// lets the token escape (or forgets it) is reported as a leak at teardown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if a new block is needed and cannot be allocated.
    /// The value is dropped in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_arena::{BlockArena, LifetimeToken};
    ///
    /// struct Connection {
    ///     id: u32,
    ///     _token: LifetimeToken,
    /// }
    ///
    /// let mut arena = BlockArena::builder().leak_checked().build();
    ///
    /// let connection = arena
    ///     .allocate_tracked(|token| Connection { id: 7, _token: token })
    ///     .unwrap();
    /// assert_eq!(connection.id, 7);
    /// assert_eq!(arena.outstanding_objects(), 1);
    ///
    /// arena.clear().unwrap();
    /// assert_eq!(arena.outstanding_objects(), 0);
    /// ```
    #[allow(
        clippy::mut_from_ref,
        reason = "every call returns a distinct region that nothing else references"
    )]
    pub fn allocate_tracked<T: 'static>(
        &self,
        f: impl FnOnce(LifetimeToken) -> T,
    ) -> Result<&mut T> {
        let value = f(self.policy.issue_token());

        let ptr = self
            .pool
            .borrow_mut()
            .allocate_managed(storage_layout::<T>(), value)?;

        // SAFETY: The pool initialized the value and nothing else references it. It stays
        // allocated until teardown, which requires an exclusive borrow of the arena.
        Ok(unsafe { &mut *ptr.as_ptr() })
    }

    /// The number of managed objects issued by this arena that are still alive.
    #[must_use]
    pub fn outstanding_objects(&self) -> usize {
        self.policy.outstanding()
    }
}

impl<P: LifetimePolicy> Drop for BlockArena<P> {
    fn drop(&mut self) {
        self.pool.get_mut().teardown();

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was.
        if thread::panicking() {
            return;
        }

        let outstanding = self.policy.outstanding();

        if outstanding != 0 {
            error!(outstanding, "managed objects outlived arena teardown");
        }

        assert!(
            outstanding == 0,
            "dropped a BlockArena while {outstanding} of its managed objects are still alive"
        );
    }
}

/// The layout used to store a `T`. Zero-sized types occupy one byte so that every allocation
/// has its own address.
fn storage_layout<T>() -> Layout {
    let layout = Layout::new::<T>();

    Layout::from_size_align(layout.size().max(1), layout.align())
        .expect("growing a layout to one byte cannot make it invalid")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::rc::Rc;

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{BLOCK_HEADER_SIZE, DESTRUCTOR_ENTRY_SIZE};

    assert_not_impl_any!(BlockArena: Send, Sync);
    assert_not_impl_any!(BlockArena<LeakChecked>: Send, Sync);

    #[test]
    fn new_arena_has_no_blocks() {
        let arena = BlockArena::new();

        assert_eq!(arena.active_block_count(), 0);
        assert!(arena.active_block_free_bytes().is_empty());
    }

    #[test]
    fn zero_sized_byte_allocation_is_rejected() {
        let arena = BlockArena::new();

        let result = arena.allocate_bytes(Layout::from_size_align(0, 1).unwrap());

        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
        assert_eq!(arena.active_block_count(), 0);
    }

    #[test]
    fn managed_value_costs_value_plus_slot() {
        let arena = BlockArena::new();

        arena.allocate_and_construct(1_u64).unwrap();

        assert_eq!(
            arena.active_block_free_bytes(),
            vec![DEFAULT_BLOCK_SIZE - BLOCK_HEADER_SIZE - 8 - DESTRUCTOR_ENTRY_SIZE]
        );
    }

    #[test]
    fn zero_sized_values_get_distinct_addresses() {
        #[derive(Default)]
        struct Marker;

        let arena = BlockArena::new();

        let a: *const Marker = arena.allocate_default::<Marker>().unwrap();
        let b: *const Marker = arena.allocate_default::<Marker>().unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn allocate_with_does_not_touch_arena_when_constructor_panics() {
        let arena = BlockArena::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            _ = arena.allocate_with::<u32>(|| panic!("constructor failed"));
        }));

        assert!(result.is_err());
        assert_eq!(arena.active_block_count(), 0);

        assert_eq!(*arena.allocate_with(|| 5_u32).unwrap(), 5);
    }

    #[test]
    fn clear_drops_managed_values() {
        let tracker = Rc::new(());
        let mut arena = BlockArena::new();

        arena.allocate_and_construct(Rc::clone(&tracker)).unwrap();
        arena
            .allocate_lazy::<Rc<()>>()
            .unwrap()
            .construct(Rc::clone(&tracker));
        assert_eq!(Rc::strong_count(&tracker), 3);

        arena.clear().unwrap();

        assert_eq!(Rc::strong_count(&tracker), 1);
        assert_eq!(arena.active_block_count(), 0);
    }

    #[test]
    fn fixed_vec_elements_are_dropped_at_teardown() {
        let tracker = Rc::new(());
        let mut arena = BlockArena::new();

        let mut vec = arena.allocate_fixed_vec::<Rc<()>>(4).unwrap();
        vec.as_mut().push(Rc::clone(&tracker)).unwrap();
        vec.as_mut().push(Rc::clone(&tracker)).unwrap();
        assert_eq!(Rc::strong_count(&tracker), 3);

        arena.clear().unwrap();
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn fixed_vec_with_impossible_capacity_is_rejected() {
        let arena = BlockArena::new();

        let result = arena.allocate_fixed_vec::<u64>(usize::MAX);

        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn tracked_objects_release_their_tokens_at_teardown() {
        let mut arena = BlockArena::builder().leak_checked().build();

        for value in 0..10_u32 {
            arena.allocate_tracked(|token| (value, token)).unwrap();
        }
        arena.allocate_and_construct(String::from("also counted")).unwrap();

        assert_eq!(arena.outstanding_objects(), 11);

        arena.clear().unwrap();
        assert_eq!(arena.outstanding_objects(), 0);
    }

    #[test]
    fn escaped_token_is_reported_as_leak() {
        let smuggled = Rc::new(RefCell::new(Vec::new()));
        let mut arena = BlockArena::builder().leak_checked().build();

        arena.allocate_tracked(|token| (1_u8, token)).unwrap();
        arena
            .allocate_tracked(|token| {
                smuggled.borrow_mut().push(token);
            })
            .unwrap();

        let result = arena.clear();
        assert!(matches!(result, Err(Error::ResourceLeak { outstanding: 1 })));

        // Releasing the token resolves the leak.
        smuggled.borrow_mut().clear();
        arena.clear().unwrap();
    }

    #[test]
    #[should_panic]
    fn dropping_arena_with_leak_panics() {
        let arena = BlockArena::builder().leak_checked().build();

        arena
            .allocate_tracked(|token| std::mem::forget(token))
            .unwrap();

        drop(arena);
    }
}
