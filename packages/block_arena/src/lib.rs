#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! This package provides [`BlockArena`], a single-threaded arena allocator that serves
//! allocations from a small, bounded set of large memory blocks.
//!
//! Individual allocations are never freed. Everything lives until the arena is
//! [cleared][BlockArena::clear] or dropped, at which point every value the arena is responsible
//! for is dropped and the blocks are released in one sweep.
//!
//! # Key Features
//!
//! - **Managed and unmanaged allocations**: Values placed with
//!   [`allocate_and_construct()`][BlockArena::allocate_and_construct] are dropped by the arena at
//!   teardown, in reverse allocation order. Raw memory from
//!   [`allocate_bytes()`][BlockArena::allocate_bytes] is never touched.
//! - **Bounded active set**: At most [`MAX_ACTIVE_BLOCKS`] blocks accept new allocations. When
//!   a new block is needed, the block with the least free space is retired. Blocks whose free
//!   space drops to [`RETIREMENT_CUTOFF_BYTES`] are retired as well.
//! - **Stable memory**: Retired blocks are not freed. They are chained onto an active block and
//!   stay alive until teardown, so references handed out earlier remain valid.
//! - **Lazy and fixed-capacity storage**: [`Lazy<T>`] reserves managed storage for a value that
//!   is constructed later. [`FixedVec<T>`] holds up to a fixed number of elements in a single
//!   allocation.
//! - **Leak detection**: An arena built with [`BlockArenaBuilder::leak_checked()`] verifies at
//!   teardown that every managed object it issued has been destroyed.
//!
//! # Memory layout
//!
//! Each block is one buffer. Allocations are bumped forward from its start, while the
//! bookkeeping for managed values grows backward from its end:
//!
//! ```text
//! [ values and raw bytes -> | free | <- destruction registry ]
//! ```
//!
//! Every block costs [`BLOCK_HEADER_SIZE`] bytes of its configured size for bookkeeping, and
//! every managed value costs an extra [`DESTRUCTOR_ENTRY_SIZE`] bytes from the back of its block.
//!
//! # Examples
//!
//! ```rust
//! use std::alloc::Layout;
//!
//! use block_arena::BlockArena;
//!
//! let mut arena = BlockArena::builder().initial_block_size(16 * 1024).build();
//!
//! // Managed: dropped by the arena.
//! let names = arena.allocate_and_construct(vec!["alpha", "beta"]).unwrap();
//! names.push("gamma");
//!
//! // Unmanaged: plain memory, never dropped by the arena.
//! let raw = arena
//!     .allocate_bytes(Layout::from_size_align(256, 64).unwrap())
//!     .unwrap();
//! assert_eq!(raw.as_ptr().addr() % 64, 0);
//!
//! // Constructed later.
//! let config = arena.allocate_lazy::<String>().unwrap();
//! config.construct("verbose".to_string());
//!
//! assert_eq!(names.len(), 3);
//! assert_eq!(config.get().map(String::as_str), Some("verbose"));
//!
//! arena.clear().unwrap();
//! ```
//!
//! ## Detecting leaked objects
//!
//! ```rust
//! use block_arena::{BlockArena, Error};
//!
//! let mut arena = BlockArena::builder().leak_checked().build();
//!
//! let mut escaped = Vec::new();
//!
//! // This object lets its lifetime token escape, so the arena cannot observe its destruction.
//! arena.allocate_tracked(|token| escaped.push(token)).unwrap();
//!
//! assert!(matches!(
//!     arena.clear(),
//!     Err(Error::ResourceLeak { outstanding: 1 })
//! ));
//!
//! drop(escaped);
//! arena.clear().unwrap();
//! ```

mod align;
mod arena;
mod block;
mod builder;
mod destructor;
mod error;
mod fixed_vec;
mod lazy;
mod lifetime;
mod pool;

pub use arena::BlockArena;
pub use block::BLOCK_HEADER_SIZE;
pub use builder::*;
pub use destructor::DESTRUCTOR_ENTRY_SIZE;
pub use error::Error;
pub use fixed_vec::FixedVec;
pub use lazy::Lazy;
pub use lifetime::*;
pub use pool::{MAX_ACTIVE_BLOCKS, RETIREMENT_CUTOFF_BYTES};
