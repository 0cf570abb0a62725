use super::arena::{Arena, CarveEvents};
use super::error::AllocError;
use super::free_list::FreeChain;
use super::size_class::SizeClasses;
use super::slab::SlabSource;
use super::thread_cache::ThreadCache;
use std::ptr::NonNull;

/// Replenish `cache` for the class serving `block`-byte objects and return
/// one object to the caller.
///
/// Asks the arena for `batch` objects; whatever comes back beyond the first
/// is linked into a chain and spliced onto the class list in one CAS.
///
/// # Errors
///
/// Propagates `AllocError::OutOfMemory` from the arena.
pub(crate) fn refill<S: SlabSource>(
    arena: &Arena<S>,
    classes: &SizeClasses,
    cache: &ThreadCache,
    block: usize,
    batch: usize,
) -> Result<NonNull<u8>, AllocError> {
    let carve = arena.chunk_allocate(cache, block, batch)?;
    report(carve.events, block);

    if carve.objects > 1 {
        // Safety: the arena handed over `objects * block` bytes starting at
        // `start`; the first block goes to the caller, the rest are unused.
        let chain = unsafe { FreeChain::from_run(carve.start.add(block), block, carve.objects - 1) };
        debug_assert_eq!(chain.len, carve.objects - 1);
        cache.splice(classes.index(block), chain);
    }
    Ok(carve.start)
}

/// Log the slow-path work of a carve. Called with no lock held.
fn report(events: CarveEvents, block: usize) {
    if let Some(bytes) = events.leftover {
        tracing::trace!(bytes, "absorbed arena leftover into thread cache");
    }
    if let Some(slab) = events.grown {
        tracing::debug!(slab, block, "grew arena");
    }
    if let Some(bytes) = events.salvaged {
        tracing::warn!(bytes, block, "slab refused, salvaged a cached block");
    }
    if let Some(bytes) = events.last_resort {
        tracing::warn!(bytes, "slab refused, fell back to an exact-size slab");
    }
}
