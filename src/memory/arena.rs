use super::error::AllocError;
use super::size_class::SizeClasses;
use super::slab::SlabSource;
use super::stats::Counter;
use super::thread_cache::ThreadCache;
use crate::sync::Mutex;
use std::ptr::{self, NonNull};
use std::sync::PoisonError;

/// Prefix written at the start of every slab so the arena can walk and
/// release them on drop.
#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
    size: usize,
}

/// Bump range plus slab bookkeeping. Only ever touched under the arena mutex.
struct ArenaState {
    start: *mut u8,
    end: *mut u8,
    /// Usable bytes installed from the slab source so far. Never decreases.
    heap_size: usize,
    slabs: *mut SlabHeader,
}

// Safety: ArenaState owns the slabs it points into and is only reachable
// through the arena mutex.
unsafe impl Send for ArenaState {}

impl ArenaState {
    #[inline]
    fn room(&self) -> usize {
        self.end as usize - self.start as usize
    }

    /// Carve `bytes` off the front of the range. `bytes <= room()`.
    #[inline]
    fn bump(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(bytes <= self.room());
        let result = self.start;
        // Safety: bytes fits inside [start, end).
        self.start = unsafe { self.start.add(bytes) };
        // Safety: start is non-null whenever room() > 0.
        unsafe { NonNull::new_unchecked(result) }
    }

    #[inline]
    fn install(&mut self, start: NonNull<u8>, bytes: usize) {
        self.start = start.as_ptr();
        // Safety: the range was just obtained or salvaged with `bytes` bytes.
        self.end = unsafe { start.as_ptr().add(bytes) };
    }
}

/// What a carve produced: `objects` contiguous blocks starting at `start`.
#[derive(Debug)]
pub(crate) struct Carve {
    pub(crate) start: NonNull<u8>,
    pub(crate) objects: usize,
    pub(crate) events: CarveEvents,
}

/// Slow-path work done during a carve, reported back so the caller can log
/// it once the arena mutex is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CarveEvents {
    /// Usable size of a freshly grown slab.
    pub(crate) grown: Option<usize>,
    /// Bytes of the old range handed to the calling cache.
    pub(crate) leftover: Option<usize>,
    /// Size of a cached block turned into an arena range.
    pub(crate) salvaged: Option<usize>,
    /// Size of the exact-fit slab obtained as a last resort.
    pub(crate) last_resort: Option<usize>,
}

/// The global chunk pool: a bump range refilled from the slab source in
/// geometrically growing slabs.
///
/// All state sits behind a single mutex. Slabs are only returned when the
/// arena itself is dropped.
pub(crate) struct Arena<S: SlabSource> {
    state: Mutex<ArenaState>,
    source: S,
    classes: SizeClasses,
    growth_divisor: usize,
    header: usize,

    pub(crate) slabs_obtained: Counter,
    pub(crate) os_bytes: Counter,
    pub(crate) leftovers: Counter,
    pub(crate) salvaged: Counter,
    pub(crate) last_resort: Counter,
}

impl<S: SlabSource> Arena<S> {
    pub(crate) fn new(source: S, classes: SizeClasses, growth_divisor: usize) -> Self {
        let header = std::mem::size_of::<SlabHeader>().next_multiple_of(classes.alignment());
        Self {
            state: Mutex::new(ArenaState {
                start: ptr::null_mut(),
                end: ptr::null_mut(),
                heap_size: 0,
                slabs: ptr::null_mut(),
            }),
            source,
            classes,
            growth_divisor,
            header,
            slabs_obtained: Counter::new(),
            os_bytes: Counter::new(),
            leftovers: Counter::new(),
            salvaged: Counter::new(),
            last_resort: Counter::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    /// Bytes of slab header preceding every slab's usable range.
    #[cfg(test)]
    pub(crate) fn header_size(&self) -> usize {
        self.header
    }

    pub(crate) fn heap_size(&self) -> usize {
        self.lock().heap_size
    }

    /// Bytes left in the current bump range.
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.lock().room()
    }

    fn lock(&self) -> crate::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Usable size of the next slab for a request of `want` bytes.
    pub(crate) fn next_slab_size(&self, heap_size: usize, want: usize) -> Option<usize> {
        want.checked_mul(2)?
            .checked_add(heap_size / self.growth_divisor)?
            .checked_next_multiple_of(self.classes.alignment())
    }

    /// Carve up to `count` objects of `size` bytes for the calling thread.
    ///
    /// `size` must be a block size of one of the classes. Fewer than `count`
    /// objects come back when the current range only holds a partial batch;
    /// at least one object comes back on success.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::OutOfMemory` when the slab source refuses a new
    /// slab, `cache` holds no block of `size` bytes or more, and the source
    /// also refuses an exact `size`-byte slab.
    pub(crate) fn chunk_allocate(
        &self,
        cache: &ThreadCache,
        size: usize,
        count: usize,
    ) -> Result<Carve, AllocError> {
        debug_assert!(size.is_multiple_of(self.classes.alignment()) && size > 0);
        debug_assert!(count >= 1);

        let want = size.saturating_mul(count);
        let mut events = CarveEvents::default();
        let mut state = self.lock();

        loop {
            let room = state.room();
            if room >= want {
                let start = state.bump(want);
                return Ok(Carve {
                    start,
                    objects: count,
                    events,
                });
            }
            if room >= size {
                let objects = room / size;
                let start = state.bump(objects * size);
                return Ok(Carve {
                    start,
                    objects,
                    events,
                });
            }

            // The range cannot hold a single object. Keep the tail instead of
            // abandoning it: the calling thread's cache absorbs it.
            if room > 0 {
                self.absorb_leftover(&mut state, cache);
                events.leftover = Some(room);
            }

            let slab = self.next_slab_size(state.heap_size, want);
            if let Some(slab) = slab.filter(|&slab| self.grow(&mut state, slab)) {
                events.grown = Some(slab);
                continue;
            }

            if let Some((block, bytes)) = self.salvage(cache, size) {
                state.install(block, bytes);
                self.salvaged.add(1);
                events.salvaged = Some(bytes);
                continue;
            }

            if self.grow(&mut state, size) {
                self.last_resort.add(1);
                events.last_resort = Some(size);
                continue;
            }

            return Err(AllocError::OutOfMemory { size });
        }
    }

    fn absorb_leftover(&self, state: &mut ArenaState, cache: &ThreadCache) {
        let room = state.room();
        debug_assert!(room.is_multiple_of(self.classes.alignment()));
        if self.classes.is_small(room) {
            let block = state.bump(room);
            cache.push(self.classes.index(room), block);
            self.leftovers.add(1);
        }
        state.start = state.end;
    }

    /// Request a slab with `usable` bytes after its header and install it.
    fn grow(&self, state: &mut ArenaState, usable: usize) -> bool {
        let Some(total) = usable.checked_add(self.header) else {
            return false;
        };
        let Some(raw) = self.source.obtain(total, self.classes.alignment()) else {
            return false;
        };

        let header = raw.cast::<SlabHeader>();
        // Safety: raw points at `total` fresh bytes, aligned for the header.
        unsafe {
            header.as_ptr().write(SlabHeader {
                next: state.slabs,
                size: total,
            });
        }
        state.slabs = header.as_ptr();
        state.heap_size += usable;
        // Safety: header < total.
        state.install(unsafe { raw.add(self.header) }, usable);

        self.slabs_obtained.add(1);
        self.os_bytes.add(total);
        true
    }

    /// Take one cached block of at least `size` bytes from the calling
    /// thread's cache, scanning classes upwards.
    fn salvage(&self, cache: &ThreadCache, size: usize) -> Option<(NonNull<u8>, usize)> {
        (self.classes.index(size)..cache.classes()).find_map(|idx| {
            cache
                .pop(idx)
                .map(|block| (block, self.classes.block_size(idx)))
        })
    }
}

impl<S: SlabSource> Drop for Arena<S> {
    fn drop(&mut self) {
        let state = self.lock();
        let mut slab = state.slabs;
        while let Some(header) = NonNull::new(slab) {
            // Safety: every header was written by `grow` and is still intact;
            // client blocks never overlap the header bytes.
            let SlabHeader { next, size } = unsafe { header.as_ptr().read() };
            // Safety: (header, size, alignment) is exactly what `obtain` returned.
            unsafe {
                self.source
                    .release(header.cast(), size, self.classes.alignment());
            }
            slab = next;
        }
    }
}
