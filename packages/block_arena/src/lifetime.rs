//! Lifetime policies that decide whether an arena verifies, at teardown, that every managed
//! object it vended has actually been destroyed.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

mod sealed {
    #[allow(
        unnameable_types,
        reason = "sealed trait pattern"
    )]
    pub trait Sealed {}
}

/// Selects what an arena attaches to each managed object in order to observe its destruction.
///
/// The policy is chosen at compile time through the type parameter of
/// [`BlockArena`][crate::BlockArena]:
///
/// * [`Unchecked`] attaches nothing and never reports leaks. This is the default.
/// * [`LeakChecked`] attaches a [`LifetimeToken`] to every managed object and fails teardown
///   with [`Error::ResourceLeak`][crate::Error::ResourceLeak] if any token outlives it.
///
/// This trait is sealed and cannot be implemented outside this crate.
pub trait LifetimePolicy: fmt::Debug + Default + sealed::Sealed {
    /// Stored next to each managed object and dropped right after it.
    type Token: 'static;

    /// Issues the token for a managed object that is about to be placed in the arena.
    #[must_use]
    fn issue_token(&self) -> Self::Token;

    /// The number of issued tokens that have not yet been dropped.
    #[must_use]
    fn outstanding(&self) -> usize;
}

/// Lifetime policy that does not track managed objects. This is the default.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Unchecked;

impl sealed::Sealed for Unchecked {}

impl LifetimePolicy for Unchecked {
    type Token = ();

    #[inline]
    fn issue_token(&self) -> Self::Token {}

    #[inline]
    fn outstanding(&self) -> usize {
        0
    }
}

/// Lifetime policy that counts live managed objects and verifies the count is zero at teardown.
///
/// Intended as a debugging aid. Every managed object carries a [`LifetimeToken`] that
/// increments a counter shared with the arena when issued and decrements it when dropped.
#[derive(Debug, Default)]
pub struct LeakChecked {
    counter: LeakCounter,
}

impl sealed::Sealed for LeakChecked {}

impl LifetimePolicy for LeakChecked {
    type Token = LifetimeToken;

    #[inline]
    fn issue_token(&self) -> Self::Token {
        self.counter.issue()
    }

    #[inline]
    fn outstanding(&self) -> usize {
        self.counter.count()
    }
}

/// Shared count of live [`LifetimeToken`]s.
///
/// Cloning the counter yields another view of the same count.
#[derive(Clone, Debug, Default)]
pub struct LeakCounter {
    count: Rc<Cell<usize>>,
}

impl LeakCounter {
    /// Creates a counter with no live tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of tokens issued by this counter that are still alive.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.get()
    }

    /// Issues a new token, incrementing the count until the token is dropped.
    #[must_use]
    pub fn issue(&self) -> LifetimeToken {
        // Cannot overflow, each live token is a separate allocation in memory.
        self.count.set(self.count.get().wrapping_add(1));

        LifetimeToken {
            count: Rc::clone(&self.count),
        }
    }
}

/// Proof that a managed object is still alive.
///
/// Owned by (or stored next to) a managed object. Dropping the token tells the
/// [`LeakCounter`] that issued it that the object has been destroyed. A token that is
/// forgotten or moved somewhere that outlives the arena is reported as a leak at teardown.
pub struct LifetimeToken {
    count: Rc<Cell<usize>>,
}

impl fmt::Debug for LifetimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeToken")
            .field("live_tokens", &self.count.get())
            .finish()
    }
}

impl Drop for LifetimeToken {
    fn drop(&mut self) {
        let live = self.count.get();

        debug_assert!(live > 0, "lifetime token count underflow");

        self.count.set(live.saturating_sub(1));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(LifetimeToken: Send, Sync, Clone);
    assert_not_impl_any!(LeakCounter: Send, Sync);

    #[test]
    fn tokens_are_counted_while_alive() {
        let counter = LeakCounter::new();
        assert_eq!(counter.count(), 0);

        let first = counter.issue();
        let second = counter.issue();
        assert_eq!(counter.count(), 2);

        drop(first);
        assert_eq!(counter.count(), 1);

        drop(second);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn cloned_counter_shares_count() {
        let counter = LeakCounter::new();
        let view = counter.clone();

        let token = counter.issue();
        assert_eq!(view.count(), 1);

        drop(token);
        assert_eq!(view.count(), 0);
    }

    #[test]
    fn token_outliving_counter_is_harmless() {
        let counter = LeakCounter::new();
        let token = counter.issue();

        drop(counter);
        drop(token);
    }

    #[test]
    fn unchecked_never_reports_outstanding() {
        let policy = Unchecked;
        assert_eq!(policy.outstanding(), 0);
    }

    #[test]
    fn leak_checked_counts_issued_tokens() {
        let policy = LeakChecked::default();

        let token = policy.issue_token();
        assert_eq!(policy.outstanding(), 1);

        drop(token);
        assert_eq!(policy.outstanding(), 0);
    }
}
