use super::arena::Arena;
use super::config::PoolConfig;
use super::error::AllocError;
use super::refill::refill;
use super::registry::{CacheRegistry, RegistryRef};
use super::size_class::SizeClasses;
use super::slab::{OsSlabs, SlabSource};
use super::stats::{Counter, StatsSnapshot};
use crate::sync::{Arc, OnceLock};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::{self, NonNull};

/// Fixed-size-class node allocator.
///
/// Requests up to `small_threshold` bytes are rounded to a size class and
/// served from the calling thread's cache, refilled in batches from a shared
/// arena. Larger requests go straight to the system allocator.
///
/// Each instance owns its own arena and cache registry. A thread binds one
/// cache per instance on first use and hands it back when it exits.
///
/// # Example
///
/// ```
/// use nodealloc::NodeAllocator;
///
/// let pool = NodeAllocator::new();
/// let block = pool.allocate(24).unwrap();
/// // Safety: block was allocated from `pool` with the same size.
/// unsafe { pool.deallocate(block.as_ptr(), 24) };
/// ```
pub struct NodeAllocator<S: SlabSource = OsSlabs> {
    config: PoolConfig,
    classes: SizeClasses,
    arena: Arena<S>,
    registry: RegistryRef,

    refills: Counter,
    large_live: Counter,
}

impl NodeAllocator<OsSlabs> {
    /// Allocator with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        let config = PoolConfig::default();
        let registry = RegistryRef::Scoped(Arc::new(CacheRegistry::new(config.class_count())));
        Self::from_parts(config, OsSlabs, registry)
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `config` fails validation.
    pub fn with_config(config: PoolConfig) -> Result<Self, AllocError> {
        Self::with_source(config, OsSlabs)
    }
}

impl Default for NodeAllocator<OsSlabs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SlabSource> NodeAllocator<S> {
    /// Allocator drawing its slabs from `source`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `config` fails validation.
    pub fn with_source(config: PoolConfig, source: S) -> Result<Self, AllocError> {
        config.validate()?;
        let registry = RegistryRef::Scoped(Arc::new(CacheRegistry::new(config.class_count())));
        Ok(Self::from_parts(config, source, registry))
    }

    /// `config` must be valid. Performs no heap allocation beyond what
    /// `registry` already holds.
    fn from_parts(config: PoolConfig, source: S, registry: RegistryRef) -> Self {
        let classes = SizeClasses::from_config(&config);
        Self {
            arena: Arena::new(source, classes, config.growth_divisor),
            classes,
            config,
            registry,
            refills: Counter::new(),
            large_live: Counter::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Allocate `size` bytes, aligned to the configured granularity.
    ///
    /// A zero-byte request is served as a one-byte request.
    ///
    /// # Errors
    ///
    /// - `AllocError::OutOfMemory` when the system is exhausted and the
    ///   out-of-memory handler (if any) gives up.
    /// - `AllocError::InvalidLayout` when a large `size` overflows a layout.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if self.classes.is_small(size) {
            self.allocate_small(size)
        } else {
            self.allocate_large(size)
        }
    }

    fn allocate_small(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.classes.round_up(size);
        let idx = self.classes.index(block);
        loop {
            let result = self.registry.with_cache(|cache| match cache.pop(idx) {
                Some(ptr) => Ok(ptr),
                None => {
                    self.refills.add(1);
                    refill(&self.arena, &self.classes, cache, block, self.config.batch)
                }
            });
            match result {
                Err(AllocError::OutOfMemory { .. }) => self.after_exhaustion(size)?,
                other => return other,
            }
        }
    }

    fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = self.large_layout(size)?;
        loop {
            // Safety: layout size is above the threshold, hence non-zero.
            if let Some(ptr) = NonNull::new(unsafe { System.alloc(layout) }) {
                self.large_live.add(1);
                return Ok(ptr);
            }
            self.after_exhaustion(size)?;
        }
    }

    /// Consult the out-of-memory handler. `Ok` means retry.
    fn after_exhaustion(&self, size: usize) -> Result<(), AllocError> {
        match self.config.oom_handler {
            Some(handler) if handler() => {
                tracing::warn!(size, "out-of-memory handler released memory, retrying");
                Ok(())
            }
            _ => {
                tracing::error!(size, "out of memory");
                Err(AllocError::OutOfMemory { size })
            }
        }
    }

    fn large_layout(&self, size: usize) -> Result<Layout, AllocError> {
        let align = self.classes.alignment();
        Layout::from_size_align(size, align).map_err(|_| AllocError::InvalidLayout { size, align })
    }

    /// Return a block to the calling thread's cache, or to the system for
    /// large sizes. A null `ptr` is ignored.
    ///
    /// # Safety
    /// - `ptr` must be null or have come from this allocator's
    ///   [`allocate`](Self::allocate) (or [`reallocate`](Self::reallocate))
    ///   with exactly `size` bytes.
    /// - `ptr` must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if self.classes.is_small(size) {
            let idx = self.classes.index(size);
            self.registry.with_cache(|cache| cache.push(idx, ptr));
        } else {
            // Safety: allocate_large built this exact layout, so it is valid.
            unsafe {
                let layout = Layout::from_size_align_unchecked(size, self.classes.alignment());
                System.dealloc(ptr.as_ptr(), layout);
            }
            self.large_live.sub(1);
        }
    }

    /// Resize a block, preserving its first `min(old_size, new_size)` bytes.
    ///
    /// Stays in place when both sizes share a size class. Large-to-large
    /// resizes go through the system `realloc`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate). On error the old block is left
    /// untouched and still owned by the caller.
    ///
    /// # Safety
    /// Same contract as [`deallocate`](Self::deallocate) for `ptr` and `old_size`.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };

        let old_small = self.classes.is_small(old_size);
        let new_small = self.classes.is_small(new_size);

        if old_small && new_small && self.classes.round_up(old_size) == self.classes.round_up(new_size) {
            return Ok(old);
        }

        if !old_small && !new_small {
            let layout = self.large_layout(old_size)?;
            self.large_layout(new_size)?;
            loop {
                // Safety: ptr was allocated with `layout`; new_size is non-zero
                // and forms a valid layout with the same alignment.
                if let Some(fresh) = NonNull::new(unsafe { System.realloc(ptr, layout, new_size) }) {
                    return Ok(fresh);
                }
                self.after_exhaustion(new_size)?;
            }
        }

        let fresh = self.allocate(new_size)?;
        // Safety: both blocks hold at least min(old, new) bytes and are distinct.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
            self.deallocate(ptr, old_size);
        }
        Ok(fresh)
    }

    /// Allocate uninitialised storage for one `T`.
    ///
    /// # Errors
    ///
    /// `AllocError::InvalidLayout` if `T` needs more alignment than the
    /// configured granularity; otherwise as [`allocate`](Self::allocate).
    pub fn allocate_node<T>(&self) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::new::<T>();
        if layout.align() > self.classes.alignment() {
            return Err(AllocError::InvalidLayout {
                size: layout.size(),
                align: layout.align(),
            });
        }
        self.allocate(layout.size()).map(NonNull::cast)
    }

    /// Free storage from [`allocate_node`](Self::allocate_node). Does not
    /// drop the value.
    ///
    /// # Safety
    /// `node` must come from `allocate_node::<T>` on this allocator and not
    /// have been freed already.
    pub unsafe fn deallocate_node<T>(&self, node: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe { self.deallocate(node.as_ptr().cast(), size_of::<T>()) };
    }

    /// Whether a `GlobalAlloc` layout can be served from the size classes.
    #[inline]
    fn serves(&self, layout: Layout) -> bool {
        layout.align() <= self.classes.alignment() && self.classes.is_small(layout.size())
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            heap_size: self.arena.heap_size(),
            slabs_obtained: self.arena.slabs_obtained.get(),
            os_bytes_obtained: self.arena.os_bytes.get(),
            refills: self.refills.get(),
            leftovers_absorbed: self.arena.leftovers.get(),
            salvaged_blocks: self.arena.salvaged.get(),
            last_resort_slabs: self.arena.last_resort.get(),
            caches_created: self.registry.created.get(),
            caches_recycled: self.registry.recycled.get(),
            large_live: self.large_live.get(),
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        self.arena.source()
    }
}

static GLOBAL_REGISTRY: OnceLock<CacheRegistry> = OnceLock::new();
static GLOBAL_NODE_ALLOCATOR: OnceLock<NodeAllocator> = OnceLock::new();

/// The process-wide node allocator.
///
/// Set up lazily with the default configuration on first use, or explicitly
/// through [`init`](Self::init). Can be installed with `#[global_allocator]`:
/// layouts with an alignment above the granularity or a size above the
/// threshold are forwarded to [`System`] as-is.
///
/// ```no_run
/// use nodealloc::GlobalNodeAllocator;
///
/// #[global_allocator]
/// static ALLOC: GlobalNodeAllocator = GlobalNodeAllocator;
///
/// fn main() {
///     let nodes: Vec<Box<u64>> = (0..16).map(Box::new).collect();
///     assert_eq!(*nodes[3], 3);
/// }
/// ```
pub struct GlobalNodeAllocator;

impl GlobalNodeAllocator {
    /// Set up the process-wide allocator with `config`.
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidConfig` if `config` fails validation.
    /// - `AllocError::AlreadyInitialized` if the allocator was already set up,
    ///   explicitly or by an earlier allocation.
    pub fn init(config: PoolConfig) -> Result<(), AllocError> {
        config.validate()?;
        let mut installed = false;
        GLOBAL_NODE_ALLOCATOR.get_or_init(|| {
            installed = true;
            Self::build(config)
        });
        if installed {
            Ok(())
        } else {
            Err(AllocError::AlreadyInitialized)
        }
    }

    /// Never allocates, so it is safe to run from inside `GlobalAlloc::alloc`.
    fn build(config: PoolConfig) -> NodeAllocator {
        let registry = GLOBAL_REGISTRY.get_or_init(|| CacheRegistry::new(config.class_count()));
        NodeAllocator::from_parts(config, OsSlabs, RegistryRef::Global(registry))
    }

    pub fn get() -> &'static NodeAllocator {
        GLOBAL_NODE_ALLOCATOR.get_or_init(|| Self::build(PoolConfig::default()))
    }

    /// See [`NodeAllocator::allocate`].
    ///
    /// # Errors
    ///
    /// Same as [`NodeAllocator::allocate`].
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::get().allocate(size)
    }

    /// See [`NodeAllocator::deallocate`].
    ///
    /// # Safety
    /// Same as [`NodeAllocator::deallocate`], for the process-wide instance.
    pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
        // Safety: upheld by caller.
        unsafe { Self::get().deallocate(ptr, size) }
    }

    /// See [`NodeAllocator::reallocate`].
    ///
    /// # Errors
    ///
    /// Same as [`NodeAllocator::reallocate`].
    ///
    /// # Safety
    /// Same as [`NodeAllocator::reallocate`], for the process-wide instance.
    pub unsafe fn reallocate(
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: upheld by caller.
        unsafe { Self::get().reallocate(ptr, old_size, new_size) }
    }

    pub fn stats() -> StatsSnapshot {
        Self::get().stats()
    }
}

// Safety: small layouts are served at the pool granularity, which satisfies
// their alignment; every other layout goes to System unchanged, and dealloc
// routes by the same predicate.
unsafe impl GlobalAlloc for GlobalNodeAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let pool = Self::get();
        if pool.serves(layout) {
            pool.allocate(layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        } else {
            // Safety: forwarded GlobalAlloc contract.
            unsafe { System.alloc(layout) }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let pool = Self::get();
        if pool.serves(layout) {
            // Safety: ptr came from `alloc` with this layout, i.e. from the pool.
            unsafe { pool.deallocate(ptr, layout.size()) }
        } else {
            // Safety: ptr came from System with this layout.
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let pool = Self::get();
        // Safety: GlobalAlloc guarantees new_size forms a valid layout with
        // the old alignment.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        match (pool.serves(layout), pool.serves(new_layout)) {
            // Safety: ptr is a pool block of layout.size() bytes.
            (true, true) => unsafe { pool.reallocate(ptr, layout.size(), new_size) }
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            // Safety: ptr came from System with `layout`.
            (false, false) => unsafe { System.realloc(ptr, layout, new_size) },
            _ => {
                // Safety: new_layout is non-zero-sized per the GlobalAlloc contract.
                let fresh = unsafe { self.alloc(new_layout) };
                if !fresh.is_null() {
                    // Safety: both blocks hold min(old, new) bytes and are distinct.
                    unsafe {
                        ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
                        self.dealloc(ptr, layout);
                    }
                }
                fresh
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::slab::testing::ScriptedSlabs;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use std::collections::HashSet;

    fn scripted(source: ScriptedSlabs) -> NodeAllocator<ScriptedSlabs> {
        NodeAllocator::with_source(PoolConfig::default(), source).unwrap()
    }

    fn offset(base: NonNull<u8>, bytes: usize) -> NonNull<u8> {
        // Safety: Test code; offsets stay within one slab.
        unsafe { base.add(bytes) }
    }

    #[test]
    fn test_two_small_allocations_share_first_batch() {
        let pool = scripted(ScriptedSlabs::new());
        let a = pool.allocate(8).unwrap();
        let b = pool.allocate(8).unwrap();

        assert_ne!(a, b);
        let batch = a.as_ptr() as usize..a.as_ptr() as usize + 20 * 8;
        assert!(batch.contains(&(b.as_ptr() as usize)));
        assert_eq!(pool.stats().refills, 1);
    }

    #[test]
    fn test_round_trip_reuses_exact_address_set() {
        let pool = scripted(ScriptedSlabs::new());
        let first: Vec<_> = (0..50).map(|_| pool.allocate(24).unwrap()).collect();
        let before: HashSet<_> = first.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(before.len(), 50);

        for p in &first {
            // Safety: Test code.
            unsafe { pool.deallocate(p.as_ptr(), 24) };
        }
        let refills = pool.stats().refills;

        let after: HashSet<_> = (0..50)
            .map(|_| pool.allocate(24).unwrap().as_ptr() as usize)
            .collect();
        assert_eq!(before, after);
        assert_eq!(pool.stats().refills, refills);
    }

    #[test]
    fn test_null_deallocate_is_noop() {
        let pool = scripted(ScriptedSlabs::new());
        let a = pool.allocate(8).unwrap();
        let stats = pool.stats();

        // Safety: Test code; null is always accepted.
        unsafe {
            pool.deallocate(ptr::null_mut(), 8);
            pool.deallocate(ptr::null_mut(), 4096);
        }
        assert_eq!(pool.stats(), stats);
        assert_eq!(pool.allocate(8).unwrap(), offset(a, 8));
    }

    #[test]
    fn test_zero_size_uses_smallest_class() {
        let pool = scripted(ScriptedSlabs::new());
        let a = pool.allocate(0).unwrap();
        let b = pool.allocate(1).unwrap();
        assert_eq!(b, offset(a, 8));
        // Safety: Test code.
        unsafe {
            pool.deallocate(b.as_ptr(), 1);
            pool.deallocate(a.as_ptr(), 0);
        }
        assert_eq!(pool.allocate(8).unwrap(), a);
    }

    #[test]
    fn test_growth_follows_heap_slack() {
        let pool = scripted(ScriptedSlabs::new());
        let header = 16;

        for _ in 0..40 {
            pool.allocate(8).unwrap();
        }
        assert_eq!(pool.source().granted(), vec![320 + header]);

        // 2 * 160 + 320 / 16 = 340 -> 344
        pool.allocate(8).unwrap();
        assert_eq!(pool.source().granted(), vec![320 + header, 344 + header]);

        // Two more full batches, then a partial batch of 3 drains the slab.
        for _ in 41..83 {
            pool.allocate(8).unwrap();
        }
        assert_eq!(pool.source().granted().len(), 2);

        // 2 * 160 + 664 / 16 = 361 -> 368
        pool.allocate(8).unwrap();
        assert_eq!(
            pool.source().granted(),
            vec![320 + header, 344 + header, 368 + header]
        );

        let stats = pool.stats();
        assert_eq!(stats.heap_size, 320 + 344 + 368);
        assert_eq!(stats.slabs_obtained, 3);
        assert_eq!(stats.os_bytes_obtained, 320 + 344 + 368 + 3 * header);
        assert_eq!(stats.refills, 6);
    }

    #[test]
    fn test_arena_leftover_lands_in_calling_cache() {
        let pool = scripted(ScriptedSlabs::new());
        let base = pool.allocate(8).unwrap(); // 160 bytes left in the slab
        for _ in 0..6 {
            pool.allocate(24).unwrap(); // partial batch of 6, 16 bytes left
        }
        pool.allocate(24).unwrap(); // leftover pushed, slab grown

        let stats = pool.stats();
        assert_eq!(stats.leftovers_absorbed, 1);
        assert_eq!(stats.slabs_obtained, 2);
        assert_eq!(pool.source().granted()[1], 984 + 16);
        assert_eq!(pool.allocate(16).unwrap(), offset(base, 304));
    }

    #[test]
    fn test_salvages_cached_block_after_refused_slab() {
        let pool = scripted(ScriptedSlabs::failing_from(1));
        let base = pool.allocate(8).unwrap(); // only slab ever granted
        let b = pool.allocate(64).unwrap(); // partial batch of 2
        let c = pool.allocate(64).unwrap();
        assert_eq!(c, offset(b, 64));
        // Safety: Test code.
        unsafe { pool.deallocate(c.as_ptr(), 64) };

        // 32 bytes left in the arena: absorbed, growth refused, c salvaged.
        let d = pool.allocate(40).unwrap();
        assert_eq!(d, c);

        let stats = pool.stats();
        assert_eq!(stats.salvaged_blocks, 1);
        assert_eq!(stats.leftovers_absorbed, 1);
        assert_eq!(stats.slabs_obtained, 1);
        assert_eq!(pool.allocate(32).unwrap(), offset(base, 288));
    }

    #[test]
    fn test_last_resort_exact_slab() {
        let pool = scripted(ScriptedSlabs::refusing_above(100));
        let a = pool.allocate(64).unwrap();
        // Safety: Test code.
        unsafe { a.as_ptr().write_bytes(0xAB, 64) };

        let stats = pool.stats();
        assert_eq!(stats.last_resort_slabs, 1);
        assert_eq!(stats.slabs_obtained, 1);
        assert_eq!(stats.heap_size, 64);
        assert_eq!(pool.source().granted(), vec![64 + 16]);
    }

    #[test]
    fn test_out_of_memory_without_handler() {
        let pool = scripted(ScriptedSlabs::failing_from(0));
        assert_eq!(pool.allocate(8), Err(AllocError::OutOfMemory { size: 8 }));
        assert_eq!(pool.stats().heap_size, 0);
    }

    #[test]
    fn test_oom_handler_retries_until_it_gives_up() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn handler() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed) < 2
        }

        let config = PoolConfig {
            oom_handler: Some(handler),
            ..PoolConfig::default()
        };
        let pool = NodeAllocator::with_source(config, ScriptedSlabs::failing_from(0)).unwrap();

        assert_eq!(pool.allocate(16), Err(AllocError::OutOfMemory { size: 16 }));
        assert_eq!(CALLS.load(Ordering::Relaxed), 3);
        // Every attempt went through growth and the last resort.
        assert_eq!(pool.source().requests().len(), 6);
    }

    #[test]
    fn test_oom_handler_consulted_for_large_requests() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn handler() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            false
        }

        let config = PoolConfig {
            oom_handler: Some(handler),
            ..PoolConfig::default()
        };
        let pool = NodeAllocator::with_config(config).unwrap();
        let huge = usize::MAX / 4;
        assert_eq!(pool.allocate(huge), Err(AllocError::OutOfMemory { size: huge }));
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().large_live, 0);
    }

    #[test]
    fn test_large_allocation_bypasses_pool() {
        let pool = scripted(ScriptedSlabs::new());
        let big = pool.allocate(4096).unwrap();
        // Safety: Test code.
        unsafe {
            big.as_ptr().write_bytes(0x5A, 4096);
            assert_eq!(*big.as_ptr().add(4095), 0x5A);
        }
        let just_over = pool.allocate(129).unwrap();

        assert!(pool.source().requests().is_empty());
        assert_eq!(pool.stats().large_live, 2);

        // Safety: Test code.
        unsafe {
            pool.deallocate(big.as_ptr(), 4096);
            pool.deallocate(just_over.as_ptr(), 129);
        }
        assert_eq!(pool.stats().large_live, 0);
        assert_eq!(pool.stats().refills, 0);
    }

    #[test]
    fn test_large_size_overflowing_layout() {
        let pool = NodeAllocator::new();
        assert_eq!(
            pool.allocate(usize::MAX),
            Err(AllocError::InvalidLayout {
                size: usize::MAX,
                align: 8
            })
        );
    }

    #[test]
    fn test_reallocate_within_class_keeps_pointer() {
        let pool = scripted(ScriptedSlabs::new());
        let p = pool.allocate(10).unwrap();
        // Safety: Test code.
        let q = unsafe { pool.reallocate(p.as_ptr(), 10, 16) }.unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn test_reallocate_moves_and_copies() {
        let pool = scripted(ScriptedSlabs::new());
        let p = pool.allocate(16).unwrap();
        // Safety: Test code.
        unsafe {
            for i in 0..16 {
                p.as_ptr().add(i).write(i as u8);
            }
            let q = pool.reallocate(p.as_ptr(), 16, 48).unwrap();
            assert_ne!(p, q);
            for i in 0..16 {
                assert_eq!(*q.as_ptr().add(i), i as u8);
            }

            // Out to the large path and back.
            let r = pool.reallocate(q.as_ptr(), 48, 1000).unwrap();
            assert_eq!(*r.as_ptr().add(15), 15);
            assert_eq!(pool.stats().large_live, 1);
            let s = pool.reallocate(r.as_ptr(), 1000, 4000).unwrap();
            assert_eq!(*s.as_ptr().add(7), 7);
            let t = pool.reallocate(s.as_ptr(), 4000, 8).unwrap();
            assert_eq!(*t.as_ptr().add(7), 7);
            assert_eq!(pool.stats().large_live, 0);
            pool.deallocate(t.as_ptr(), 8);
        }
        // The old 16-byte block went back to its class.
        assert_eq!(pool.allocate(16).unwrap(), p);
    }

    #[test]
    fn test_reallocate_null_allocates() {
        let pool = scripted(ScriptedSlabs::new());
        // Safety: Test code.
        let p = unsafe { pool.reallocate(ptr::null_mut(), 0, 32) }.unwrap();
        // Safety: Test code.
        unsafe { pool.deallocate(p.as_ptr(), 32) };
    }

    #[test]
    fn test_typed_nodes() {
        struct ListNode {
            value: u64,
            next: *mut ListNode,
        }

        #[allow(dead_code)]
        #[repr(align(64))]
        struct Wide([u8; 64]);

        let pool = NodeAllocator::new();
        let node = pool.allocate_node::<ListNode>().unwrap();
        // Safety: Test code; storage is sized and aligned for ListNode.
        unsafe {
            node.as_ptr().write(ListNode {
                value: 7,
                next: ptr::null_mut(),
            });
            assert_eq!((*node.as_ptr()).value, 7);
            assert!((*node.as_ptr()).next.is_null());
            pool.deallocate_node(node);
        }

        assert!(matches!(
            pool.allocate_node::<Wide>(),
            Err(AllocError::InvalidLayout { size: 64, align: 64 })
        ));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PoolConfig {
            batch: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(
            NodeAllocator::with_config(config),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_custom_threshold_and_batch() {
        let config = PoolConfig {
            small_threshold: 64,
            batch: 4,
            ..PoolConfig::default()
        };
        let pool = NodeAllocator::with_source(config, ScriptedSlabs::new()).unwrap();
        let small = pool.allocate(64).unwrap();
        let large = pool.allocate(72).unwrap();
        assert_eq!(pool.stats().large_live, 1);
        // 2 * 4 * 64 bytes for the first slab.
        assert_eq!(pool.source().granted(), vec![512 + 16]);
        // Safety: Test code.
        unsafe {
            pool.deallocate(small.as_ptr(), 64);
            pool.deallocate(large.as_ptr(), 72);
        }
    }

    #[test]
    fn test_instances_keep_separate_caches() {
        let a = scripted(ScriptedSlabs::new());
        let b = scripted(ScriptedSlabs::new());
        let from_a = a.allocate(32).unwrap();
        // Safety: Test code.
        unsafe { a.deallocate(from_a.as_ptr(), 32) };

        let from_b = b.allocate(32).unwrap();
        assert_ne!(from_a, from_b);
        assert_eq!(a.allocate(32).unwrap(), from_a);
    }

    #[test]
    fn test_global_allocate_deallocate() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = GlobalNodeAllocator::allocate(48).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x11, 48);
            GlobalNodeAllocator::deallocate(p.as_ptr(), 48);
        }
        assert_eq!(GlobalNodeAllocator::allocate(48).unwrap(), p);
        // Safety: Test code.
        unsafe { GlobalNodeAllocator::deallocate(p.as_ptr(), 48) };
        assert!(GlobalNodeAllocator::stats().caches_created >= 1);
    }

    #[test]
    fn test_global_init_only_once() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Whichever of these runs first may or may not win the race with
        // other tests touching the global instance.
        drop(GlobalNodeAllocator::init(PoolConfig::default()));
        assert_eq!(
            GlobalNodeAllocator::init(PoolConfig::default()),
            Err(AllocError::AlreadyInitialized)
        );
        let bad = PoolConfig {
            alignment: 3,
            ..PoolConfig::default()
        };
        assert!(matches!(
            GlobalNodeAllocator::init(bad),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_global_alloc_routes_by_layout() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GlobalNodeAllocator;
        // Safety: Test code; every layout is non-zero-sized.
        unsafe {
            let small = Layout::from_size_align(24, 8).unwrap();
            let wide = Layout::from_size_align(32, 64).unwrap();
            let big = Layout::from_size_align(1024, 8).unwrap();

            let a = alloc.alloc(small);
            let b = alloc.alloc(wide);
            let c = alloc.alloc(big);
            assert!(!a.is_null() && !b.is_null() && !c.is_null());
            assert!((a as usize).is_multiple_of(8));
            assert!((b as usize).is_multiple_of(64));

            a.write_bytes(1, 24);
            let grown = alloc.realloc(a, small, 256);
            assert_eq!(*grown.add(23), 1);
            let shrunk = alloc.realloc(grown, Layout::from_size_align(256, 8).unwrap(), 16);
            assert_eq!(*shrunk.add(15), 1);

            alloc.dealloc(shrunk, Layout::from_size_align(16, 8).unwrap());
            alloc.dealloc(b, wide);
            alloc.dealloc(c, big);
        }
    }
}
