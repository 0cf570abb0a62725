//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent while other threads allocate. This is acceptable for
//! diagnostic display and for tests that quiesce before reading.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers always go through `get()`, which
/// clamps negative values to zero.
#[derive(Debug)]
pub(crate) struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub(crate) fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

/// Point-in-time view of one allocator's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Usable arena bytes obtained so far; drives slab growth.
    pub heap_size: usize,
    /// Successful slab requests to the slab source, last-resort ones included.
    pub slabs_obtained: usize,
    /// Bytes requested from the slab source, headers included.
    pub os_bytes_obtained: usize,
    /// Arena round trips made on cache misses.
    pub refills: usize,
    /// Arena tails too small for a batch that were pushed onto a thread cache.
    pub leftovers_absorbed: usize,
    /// Cached blocks repurposed as arena ranges after a slab request failed.
    pub salvaged_blocks: usize,
    /// Exact-size slabs obtained after growth and salvage both failed.
    pub last_resort_slabs: usize,
    /// Thread caches built from scratch.
    pub caches_created: usize,
    /// Bindings satisfied from the reuse list.
    pub caches_recycled: usize,
    /// Large (system) allocations currently outstanding.
    pub large_live: usize,
}
