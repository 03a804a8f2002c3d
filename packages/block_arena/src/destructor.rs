use std::mem;
use std::ptr::{self, NonNull};

/// A type-erased obligation to destroy one managed object.
///
/// Entries are stored by value in the registry at the back of a memory block. They do nothing
/// on their own; the block explicitly [runs][Self::run] each entry exactly once at teardown.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DestructorEntry {
    target: NonNull<()>,
    destroy: unsafe fn(NonNull<()>),
}

/// Bytes consumed from the back of a block by the registry slot of one managed object.
pub const DESTRUCTOR_ENTRY_SIZE: usize = mem::size_of::<DestructorEntry>();

/// Alignment of registry slots. Block buffers are aligned to this and sized as a multiple of it
/// so that slots growing backward from the end of the buffer are always aligned.
pub(crate) const DESTRUCTOR_ENTRY_ALIGN: usize = mem::align_of::<DestructorEntry>();

impl DestructorEntry {
    /// Creates an entry that will drop the `T` at `target` when run.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// 1. `target` points to an initialized `T` that remains valid until the entry is run.
    /// 2. The `T` is not dropped through any other path.
    /// 3. The entry (or any copy of it) is run at most once.
    #[must_use]
    pub(crate) unsafe fn new<T>(target: NonNull<T>) -> Self {
        Self {
            target: target.cast(),
            destroy: destroy_in_place::<T>,
        }
    }

    /// Returns the address of the object this entry is responsible for.
    #[must_use]
    pub(crate) fn target(&self) -> NonNull<()> {
        self.target
    }

    /// Drops the target object in place.
    ///
    /// # Safety
    ///
    /// This entry must not have been run before and the target must still be valid.
    pub(crate) unsafe fn run(self) {
        // SAFETY: Forwarding the guarantees of `new()` and of our own caller.
        unsafe {
            (self.destroy)(self.target);
        }
    }
}

unsafe fn destroy_in_place<T>(target: NonNull<()>) {
    // SAFETY: `DestructorEntry::new()` paired this function with a pointer to a live `T`
    // and the caller of `run()` guarantees it is only dropped once.
    unsafe {
        ptr::drop_in_place(target.cast::<T>().as_ptr());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::mem::ManuallyDrop;
    use std::rc::Rc;

    use super::*;

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn run_drops_target() {
        let dropped = Rc::new(Cell::new(false));
        let mut value = ManuallyDrop::new(DropFlag(Rc::clone(&dropped)));

        let entry = unsafe { DestructorEntry::new(NonNull::from(&mut *value)) };
        assert!(!dropped.get());

        unsafe { entry.run() };
        assert!(dropped.get());
    }

    #[test]
    fn entry_remembers_target_address() {
        let mut value = ManuallyDrop::new(42_u64);
        let target = NonNull::from(&mut *value);

        let entry = unsafe { DestructorEntry::new(target) };
        assert_eq!(entry.target(), target.cast::<()>());
    }

    #[test]
    fn drops_owned_heap_data() {
        let tracker = Rc::new(());
        let mut value = ManuallyDrop::new(vec![Rc::clone(&tracker), Rc::clone(&tracker)]);
        assert_eq!(Rc::strong_count(&tracker), 3);

        let entry = unsafe { DestructorEntry::new(NonNull::from(&mut *value)) };
        unsafe { entry.run() };

        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn slot_is_two_words() {
        assert_eq!(DESTRUCTOR_ENTRY_SIZE, 2 * mem::size_of::<usize>());
        assert!(DESTRUCTOR_ENTRY_ALIGN.is_power_of_two());
    }
}
