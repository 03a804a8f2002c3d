use thiserror::Error;

/// Errors that can occur when allocating from or tearing down a [`BlockArena`][crate::BlockArena].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The system allocator could not supply the backing memory for a new block.
    ///
    /// The arena does not retry with a smaller block. No arena state was modified.
    #[error("failed to allocate a memory block of {requested_bytes} bytes")]
    AllocationFailed {
        /// The total size of the block that could not be allocated, including the
        /// per-block bookkeeping overhead.
        requested_bytes: usize,
    },

    /// Teardown finished but some managed objects never released their lifetime token.
    ///
    /// This indicates a bug in the calling code: an object (or its token) outlived the
    /// block that was responsible for destroying it. Only reported by arenas using the
    /// [`LeakChecked`][crate::LeakChecked] lifetime policy.
    #[error("resource leak detected: {outstanding} managed objects are still alive after teardown")]
    ResourceLeak {
        /// The number of lifetime tokens still alive after every block was destroyed.
        outstanding: usize,
    },

    /// The caller violated the contract of the operation, e.g. by requesting zero bytes.
    #[error("invalid argument: {problem}")]
    InvalidArgument {
        /// A human-readable description of the problem.
        problem: &'static str,
    },
}

/// A specialized `Result` type for arena operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn allocation_failure_is_distinct_from_leak() {
        let oom = Error::AllocationFailed {
            requested_bytes: 4096,
        };
        let leak = Error::ResourceLeak { outstanding: 2 };

        assert!(matches!(oom, Error::AllocationFailed { .. }));
        assert!(matches!(leak, Error::ResourceLeak { .. }));
        assert_ne!(oom.to_string(), leak.to_string());
    }

    #[test]
    fn messages_include_details() {
        let error = Error::ResourceLeak { outstanding: 3 };
        assert!(error.to_string().contains('3'));

        let error = Error::InvalidArgument {
            problem: "zero-sized allocation",
        };
        assert!(error.to_string().contains("zero-sized allocation"));
    }
}
