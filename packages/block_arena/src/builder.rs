use std::marker::PhantomData;

use crate::{BlockArena, LeakChecked, LifetimePolicy, Unchecked};

/// The smallest block size, in bytes, that an arena can be configured with.
pub const MIN_BLOCK_SIZE: usize = 1000;

/// The block size, in bytes, used by [`BlockArena::new()`] and by builders that do not
/// set a size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Builder for creating an instance of [`BlockArena`].
///
/// All settings are optional. Block sizes include the fixed per-block bookkeeping overhead
/// ([`BLOCK_HEADER_SIZE`][crate::BLOCK_HEADER_SIZE]) and are rounded up to the registry slot
/// alignment. A single allocation larger than the configured size always gets a block of its
/// own, sized to fit.
///
/// # Examples
///
/// ```
/// use block_arena::BlockArena;
///
/// let arena = BlockArena::builder()
///     .initial_block_size(64 * 1024)
///     .subsequent_block_size(16 * 1024)
///     .build();
///
/// assert_eq!(arena.initial_block_size(), 64 * 1024);
/// assert_eq!(arena.subsequent_block_size(), 16 * 1024);
/// ```
///
/// Enabling leak detection:
///
/// ```
/// use block_arena::BlockArena;
///
/// let mut arena = BlockArena::builder().leak_checked().build();
///
/// arena.allocate_tracked(|token| (42_u32, token)).unwrap();
///
/// // Every tracked object was destroyed by the arena itself.
/// arena.clear().unwrap();
/// ```
#[derive(Debug)]
#[must_use]
pub struct BlockArenaBuilder<P = Unchecked> {
    initial_block_size: usize,
    subsequent_block_size: Option<usize>,

    _policy: PhantomData<P>,
}

impl BlockArenaBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            initial_block_size: DEFAULT_BLOCK_SIZE,
            subsequent_block_size: None,
            _policy: PhantomData,
        }
    }
}

impl<P: LifetimePolicy> BlockArenaBuilder<P> {
    /// Sets the size of the first block the arena allocates.
    ///
    /// # Panics
    ///
    /// Panics if `size` is smaller than [`MIN_BLOCK_SIZE`].
    #[inline]
    pub fn initial_block_size(mut self, size: usize) -> Self {
        assert!(
            size >= MIN_BLOCK_SIZE,
            "initial block size {size} is smaller than the minimum of {MIN_BLOCK_SIZE} bytes"
        );

        self.initial_block_size = size;
        self
    }

    /// Sets the size of every block after the first one.
    ///
    /// Defaults to the initial block size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is smaller than [`MIN_BLOCK_SIZE`].
    #[inline]
    pub fn subsequent_block_size(mut self, size: usize) -> Self {
        assert!(
            size >= MIN_BLOCK_SIZE,
            "subsequent block size {size} is smaller than the minimum of {MIN_BLOCK_SIZE} bytes"
        );

        self.subsequent_block_size = Some(size);
        self
    }

    /// Makes the arena count its live managed objects and report any that survive teardown
    /// as [`Error::ResourceLeak`][crate::Error::ResourceLeak].
    ///
    /// See [`LeakChecked`] for details.
    #[inline]
    pub fn leak_checked(self) -> BlockArenaBuilder<LeakChecked> {
        BlockArenaBuilder {
            initial_block_size: self.initial_block_size,
            subsequent_block_size: self.subsequent_block_size,
            _policy: PhantomData,
        }
    }

    /// Builds the arena with the configured settings. No memory is allocated until the arena
    /// is first used.
    #[must_use]
    #[inline]
    pub fn build(self) -> BlockArena<P> {
        BlockArena::new_inner(
            self.initial_block_size,
            self.subsequent_block_size
                .unwrap_or(self.initial_block_size),
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let arena = BlockArenaBuilder::new().build();

        assert_eq!(arena.initial_block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(arena.subsequent_block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(arena.active_block_count(), 0);
    }

    #[test]
    fn subsequent_size_defaults_to_initial() {
        let arena = BlockArenaBuilder::new().initial_block_size(8192).build();

        assert_eq!(arena.subsequent_block_size(), 8192);
    }

    #[test]
    fn sizes_survive_policy_switch() {
        let arena = BlockArenaBuilder::new()
            .initial_block_size(2000)
            .subsequent_block_size(3000)
            .leak_checked()
            .build();

        assert_eq!(arena.initial_block_size(), 2000);
        assert_eq!(arena.subsequent_block_size(), 3000);
        assert_eq!(arena.outstanding_objects(), 0);
    }

    #[test]
    fn minimum_size_is_accepted() {
        let arena = BlockArenaBuilder::new()
            .initial_block_size(MIN_BLOCK_SIZE)
            .build();

        assert_eq!(arena.initial_block_size(), MIN_BLOCK_SIZE);
    }

    #[test]
    #[should_panic]
    fn initial_size_below_minimum_panics() {
        _ = BlockArenaBuilder::new().initial_block_size(MIN_BLOCK_SIZE - 1);
    }

    #[test]
    #[should_panic]
    fn subsequent_size_below_minimum_panics() {
        _ = BlockArenaBuilder::new().subsequent_block_size(10);
    }
}
