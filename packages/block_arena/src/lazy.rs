use std::fmt;

/// Arena storage for a value that is constructed some time after the storage is allocated.
///
/// Obtained from [`BlockArena::allocate_lazy()`][crate::BlockArena::allocate_lazy]. The storage
/// itself is a managed allocation, so whatever value it holds when the arena is torn down is
/// dropped together with the rest of the block.
///
/// # Examples
///
/// ```
/// use block_arena::BlockArena;
///
/// let arena = BlockArena::new();
///
/// let slot = arena.allocate_lazy::<String>().unwrap();
/// assert!(!slot.is_constructed());
///
/// slot.construct("late arrival".to_string());
/// assert_eq!(slot.get().map(String::as_str), Some("late arrival"));
/// ```
pub struct Lazy<T> {
    value: Option<T>,
}

impl<T> Lazy<T> {
    pub(crate) fn new() -> Self {
        Self { value: None }
    }

    /// Constructs the value, dropping any previously constructed value first.
    ///
    /// Returns a reference to the newly constructed value.
    pub fn construct(&mut self, value: T) -> &mut T {
        // Drop the old value before storing the new one so the two never coexist.
        self.value = None;
        self.value.insert(value)
    }

    /// Constructs the value with [`Default::default()`], dropping any previously
    /// constructed value first.
    pub fn construct_default(&mut self) -> &mut T
    where
        T: Default,
    {
        self.construct(T::default())
    }

    /// Constructs the value by calling `f`, dropping any previously constructed value first.
    ///
    /// The previous value is dropped before `f` is called.
    pub fn construct_with(&mut self, f: impl FnOnce() -> T) -> &mut T {
        self.value = None;
        self.value.insert(f())
    }

    /// Whether a value has been constructed and not cleared since.
    #[must_use]
    pub fn is_constructed(&self) -> bool {
        self.value.is_some()
    }

    /// The constructed value, if any.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The constructed value, if any.
    #[must_use]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Drops the constructed value, if any, returning the storage to its unconstructed state.
    pub fn clear(&mut self) {
        self.value = None;
    }

    /// Moves the constructed value, if any, out of the storage.
    #[must_use]
    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T: fmt::Debug> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy").field("value", &self.value).finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct CountDrops(Rc<Cell<u32>>);

    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn starts_unconstructed() {
        let lazy = Lazy::<u32>::new();

        assert!(!lazy.is_constructed());
        assert!(lazy.get().is_none());
    }

    #[test]
    fn construct_then_read() {
        let mut lazy = Lazy::new();

        *lazy.construct(5_u32) += 1;

        assert!(lazy.is_constructed());
        assert_eq!(lazy.get(), Some(&6));
    }

    #[test]
    fn construct_default_uses_default() {
        let mut lazy = Lazy::<Vec<u8>>::new();

        lazy.construct_default().push(1);

        assert_eq!(lazy.get().map(Vec::len), Some(1));
    }

    #[test]
    fn reconstruct_drops_previous_value() {
        let drops = Rc::new(Cell::new(0));
        let mut lazy = Lazy::new();

        lazy.construct(CountDrops(Rc::clone(&drops)));
        lazy.construct_with(|| CountDrops(Rc::clone(&drops)));

        assert_eq!(drops.get(), 1);

        lazy.clear();
        assert_eq!(drops.get(), 2);
        assert!(!lazy.is_constructed());
    }

    #[test]
    fn take_moves_value_out() {
        let mut lazy = Lazy::new();
        lazy.construct(String::from("owned"));

        assert_eq!(lazy.take().as_deref(), Some("owned"));
        assert!(!lazy.is_constructed());
    }
}
