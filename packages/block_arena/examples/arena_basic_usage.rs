//! Example demonstrating basic usage of `BlockArena`.
//!
//! Shows managed and unmanaged allocations, lazy construction, fixed-capacity vectors
//! and how the arena keeps its number of active blocks bounded.

use std::alloc::Layout;

use block_arena::{BlockArena, MAX_ACTIVE_BLOCKS};

#[derive(Debug)]
struct Session {
    user: String,
    requests: u32,
}

impl Drop for Session {
    fn drop(&mut self) {
        println!("Session for {} closed after {} requests", self.user, self.requests);
    }
}

fn main() {
    println!("=== BlockArena: basic usage ===");

    let mut arena = BlockArena::builder()
        .initial_block_size(8 * 1024)
        .subsequent_block_size(4 * 1024)
        .build();

    // Managed values are dropped by the arena when it is cleared.
    let alice = arena
        .allocate_and_construct(Session {
            user: "alice".to_string(),
            requests: 0,
        })
        .unwrap();
    let bob = arena
        .allocate_with(|| Session {
            user: "bob".to_string(),
            requests: 0,
        })
        .unwrap();

    alice.requests += 3;
    bob.requests += 1;
    println!("Live sessions: {alice:?}, {bob:?}");

    // Unmanaged storage is plain memory.
    let scratch = arena
        .allocate_bytes(Layout::from_size_align(512, 64).unwrap())
        .unwrap();
    println!("Scratch buffer at {:p}", scratch.as_ptr());

    // Lazy storage is allocated now and filled in later.
    let pending = arena.allocate_lazy::<Session>().unwrap();
    println!("Pending constructed: {}", pending.is_constructed());
    pending.construct(Session {
        user: "carol".to_string(),
        requests: 0,
    });

    // A fixed-capacity vector lives in a single allocation.
    let mut ids = arena.allocate_fixed_vec::<u64>(16).unwrap();
    for id in 1..=5 {
        ids.as_mut().push(id * 100).unwrap();
    }
    println!("Ids: {:?}", ids.as_slice());

    // Many large allocations: the active set never grows beyond the limit.
    for _ in 0..20 {
        arena
            .allocate_bytes(Layout::from_size_align(3000, 8).unwrap())
            .unwrap();
    }
    println!(
        "Active blocks: {} (limit {MAX_ACTIVE_BLOCKS}), free bytes: {:?}",
        arena.active_block_count(),
        arena.active_block_free_bytes()
    );

    // Sessions are dropped here, most recently allocated first within each block.
    arena.clear().unwrap();
    println!("Active blocks after clear: {}", arena.active_block_count());
}
