use std::fmt;
use std::marker::{PhantomData, PhantomPinned};
use std::ops::Deref;
use std::pin::Pin;
use std::ptr::{self, NonNull};

/// A fixed-capacity sequence of `T` stored contiguously in arena memory.
///
/// Obtained from [`BlockArena::allocate_fixed_vec()`][crate::BlockArena::allocate_fixed_vec],
/// which places this header and room for `capacity` elements in a single managed allocation.
/// Elements are constructed one at a time with [`push()`][Self::push] and are dropped when they
/// are popped, when the vector is cleared or when the arena is torn down.
///
/// The capacity never changes. Dereferences to a slice of the constructed elements, so all the
/// usual read-only slice operations are available. Mutable access to the elements goes through
/// [`as_mut_slice()`][Self::as_mut_slice].
///
/// The header refers to element storage inside the same arena allocation, so the vector is
/// handed out pinned and can never be moved away from its elements.
///
/// # Examples
///
/// ```
/// use block_arena::BlockArena;
///
/// let arena = BlockArena::new();
///
/// let mut numbers = arena.allocate_fixed_vec::<u32>(3).unwrap();
/// numbers.as_mut().push(10).unwrap();
/// numbers.as_mut().push(20).unwrap();
///
/// assert_eq!(numbers.len(), 2);
/// assert_eq!(numbers.iter().sum::<u32>(), 30);
///
/// numbers.as_mut().push(30).unwrap();
/// assert_eq!(numbers.as_mut().push(40), Err(40));
/// ```
///
/// Vectors cannot trade places, not even with a vector of another arena:
///
/// ```compile_fail
/// use block_arena::BlockArena;
///
/// let first_arena = BlockArena::new();
/// let second_arena = BlockArena::new();
///
/// let mut first = first_arena.allocate_fixed_vec::<u32>(4).unwrap();
/// let mut second = second_arena.allocate_fixed_vec::<u32>(4).unwrap();
///
/// std::mem::swap(&mut *first, &mut *second);
/// ```
pub struct FixedVec<T> {
    /// First element slot. Dangling until the vector is bound to its storage.
    elements: NonNull<T>,
    len: usize,
    capacity: usize,

    _owns: PhantomData<T>,
    _pinned: PhantomPinned,
}

impl<T> FixedVec<T> {
    /// Creates a vector header that is not yet connected to any element storage.
    ///
    /// The header must be [bound][Self::bind] before it is handed to anyone.
    pub(crate) fn unbound(capacity: usize) -> Self {
        Self {
            elements: NonNull::dangling(),
            len: 0,
            capacity,
            _owns: PhantomData,
            _pinned: PhantomPinned,
        }
    }

    /// Connects the vector to the storage for its elements.
    ///
    /// # Safety
    ///
    /// `elements` must be valid for reads and writes of `capacity` consecutive `T`s, aligned for
    /// `T`, for as long as this vector is alive. The storage must not be used by anything else.
    /// The vector must not move after this call.
    pub(crate) unsafe fn bind(&mut self, elements: NonNull<T>) {
        debug_assert_eq!(self.len, 0, "a vector is bound before any element is pushed");

        self.elements = elements;
    }

    /// The number of elements that have been constructed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no elements have been constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The maximum number of elements the vector can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the vector has reached its capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Constructs `value` in the next free slot, returning a reference to it.
    ///
    /// # Errors
    ///
    /// Returns the value back if the vector is already full.
    pub fn push(self: Pin<&mut Self>, value: T) -> Result<&mut T, T> {
        let this = self.header_mut();

        if this.is_full() {
            return Err(value);
        }

        // SAFETY: len < capacity, so the slot is within the bound storage.
        let mut slot = unsafe { this.elements.add(this.len) };

        // SAFETY: The slot is valid, aligned and not yet initialized.
        unsafe {
            slot.write(value);
        }

        // Cannot overflow, bounded by the capacity.
        this.len = this.len.wrapping_add(1);

        // SAFETY: Just initialized above and exclusively borrowed through self.
        Ok(unsafe { slot.as_mut() })
    }

    /// Moves the last element out of the vector.
    #[must_use]
    pub fn pop(self: Pin<&mut Self>) -> Option<T> {
        let this = self.header_mut();

        let last = this.len.checked_sub(1)?;
        this.len = last;

        // SAFETY: The element at the old len - 1 was initialized and is no longer counted as
        // part of the vector, so it will not be dropped again.
        Some(unsafe { this.elements.add(last).read() })
    }

    /// Drops every constructed element. The capacity is unchanged.
    pub fn clear(self: Pin<&mut Self>) {
        self.header_mut().drop_elements();
    }

    /// The constructed elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The first len elements are initialized and the storage is valid while self is.
        unsafe { std::slice::from_raw_parts(self.elements.as_ptr(), self.len) }
    }

    /// The constructed elements.
    ///
    /// The elements are not pinned, only the vector itself is.
    #[must_use]
    pub fn as_mut_slice(self: Pin<&mut Self>) -> &mut [T] {
        let this = self.header_mut();

        // SAFETY: The first len elements are initialized and we hold an exclusive borrow.
        unsafe { std::slice::from_raw_parts_mut(this.elements.as_ptr(), this.len) }
    }

    fn header_mut(self: Pin<&mut Self>) -> &mut Self {
        // SAFETY: Nothing here moves the header. Only the length changes, the element pointer
        // stays bound to the storage next to the header.
        unsafe { self.get_unchecked_mut() }
    }

    fn drop_elements(&mut self) {
        let constructed = ptr::slice_from_raw_parts_mut(self.elements.as_ptr(), self.len);

        // Forget the elements before dropping them so that a panicking destructor cannot lead
        // to a double drop.
        self.len = 0;

        // SAFETY: The first len elements were initialized and are no longer counted.
        unsafe {
            ptr::drop_in_place(constructed);
        }
    }
}

impl<T> Deref for FixedVec<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl<'a, T> IntoIterator for &'a FixedVec<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: fmt::Debug> fmt::Debug for FixedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T> Drop for FixedVec<T> {
    fn drop(&mut self) {
        self.drop_elements();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::RefCell;
    use std::mem::MaybeUninit;
    use std::pin::pin;
    use std::rc::Rc;

    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(FixedVec<u8>: Unpin, Send, Sync);

    /// Binds a pinned vector to stack storage that outlives it.
    fn with_storage<T>(storage: &mut [MaybeUninit<T>], f: impl FnOnce(Pin<&mut FixedVec<T>>)) {
        let mut vec = FixedVec::unbound(storage.len());
        unsafe { vec.bind(NonNull::from(&mut *storage).cast::<T>()) };
        f(pin!(vec));
    }

    #[derive(Debug)]
    struct Logged(u32, Rc<RefCell<Vec<u32>>>);

    impl Drop for Logged {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn push_until_full() {
        let mut storage = [const { MaybeUninit::<u64>::uninit() }; 3];

        with_storage(&mut storage, |mut vec| {
            assert!(vec.is_empty());
            assert_eq!(vec.capacity(), 3);

            *vec.as_mut().push(1).unwrap() += 10;
            vec.as_mut().push(2).unwrap();
            vec.as_mut().push(3).unwrap();

            assert!(vec.is_full());
            assert_eq!(vec.as_mut().push(4), Err(4));
            assert_eq!(vec.as_slice(), &[11, 2, 3]);
        });
    }

    #[test]
    fn behaves_as_slice() {
        let mut storage = [const { MaybeUninit::<i32>::uninit() }; 4];

        with_storage(&mut storage, |mut vec| {
            for value in [3, 1, 2] {
                vec.as_mut().push(value).unwrap();
            }

            vec.as_mut().as_mut_slice().sort_unstable();
            assert_eq!(vec[0], 1);
            assert_eq!((&*vec).into_iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

            for value in vec.as_mut().as_mut_slice() {
                *value *= 2;
            }
            assert_eq!(vec.as_slice(), &[2, 4, 6]);
        });
    }

    #[test]
    fn pop_returns_last_element() {
        let mut storage = [const { MaybeUninit::<String>::uninit() }; 2];

        with_storage(&mut storage, |mut vec| {
            vec.as_mut().push("a".to_string()).unwrap();
            vec.as_mut().push("b".to_string()).unwrap();

            assert_eq!(vec.as_mut().pop().as_deref(), Some("b"));
            assert_eq!(vec.len(), 1);
            assert_eq!(vec.as_mut().pop().as_deref(), Some("a"));
            assert_eq!(vec.as_mut().pop(), None);
        });
    }

    #[test]
    fn clear_and_drop_destroy_elements_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut storage = [const { MaybeUninit::<Logged>::uninit() }; 3];

        with_storage(&mut storage, |mut vec| {
            vec.as_mut().push(Logged(1, Rc::clone(&log))).unwrap();
            vec.as_mut().push(Logged(2, Rc::clone(&log))).unwrap();

            vec.as_mut().clear();
            assert_eq!(*log.borrow(), vec![1, 2]);
            assert!(vec.is_empty());

            vec.as_mut().push(Logged(3, Rc::clone(&log))).unwrap();
        });

        // The vector was dropped when with_storage returned.
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn zero_capacity_is_always_full() {
        let mut storage: [MaybeUninit<u8>; 0] = [];

        with_storage(&mut storage, |mut vec| {
            assert!(vec.is_full());
            assert_eq!(vec.as_mut().push(1), Err(1));
        });
    }
}
