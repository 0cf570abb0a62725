#[cfg(not(target_pointer_width = "64"))]
compile_error!("nodealloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::allocator::{GlobalNodeAllocator, NodeAllocator};
pub use memory::slab::{OsSlabs, SlabSource};

// config
pub use memory::config::{
    ALIGNMENT, BATCH, GROWTH_DIVISOR, MAX_CLASSES, OomHandler, PoolConfig, SMALL_THRESHOLD,
};

// stats
pub use memory::stats::StatsSnapshot;

// errors
pub use memory::error::AllocError;
