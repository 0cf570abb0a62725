use super::stats::Counter;
use super::thread_cache::ThreadCache;
use crate::sync::{Arc, Mutex, MutexGuard};
use std::alloc::{GlobalAlloc, Layout, System, handle_alloc_error};
use std::cell::RefCell;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::PoisonError;

/// Intrusive stack of unbound caches, linked through `ThreadCache::next_unbound`.
struct ReuseList {
    head: *mut ThreadCache,
}

// Safety: the list owns the unbound caches and is only reachable through the
// registry mutex.
unsafe impl Send for ReuseList {}

/// Hands thread caches out to threads and takes them back when threads exit.
///
/// Caches are allocated straight from [`System`] so that binding never
/// re-enters a process-wide allocator built on top of this registry. A
/// retired cache keeps whatever blocks it holds; the next thread to bind
/// inherits them.
pub(crate) struct CacheRegistry {
    unbound: Mutex<ReuseList>,
    classes: usize,

    pub(crate) created: Counter,
    pub(crate) recycled: Counter,
}

impl CacheRegistry {
    pub(crate) fn new(classes: usize) -> Self {
        Self {
            unbound: Mutex::new(ReuseList {
                head: ptr::null_mut(),
            }),
            classes,
            created: Counter::new(),
            recycled: Counter::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReuseList> {
        self.unbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an unbound cache, building a fresh one when none is parked.
    ///
    /// Emits nothing; callers report the [`Binding`] once no lease slot is
    /// borrowed.
    pub(crate) fn acquire(&self) -> (NonNull<ThreadCache>, Binding) {
        let parked = {
            let mut list = self.lock();
            NonNull::new(list.head).inspect(|cache| {
                // Safety: unbound cache, mutex held.
                unsafe {
                    list.head = cache.as_ref().next_unbound();
                    cache.as_ref().set_next_unbound(ptr::null_mut());
                }
            })
        };

        if let Some(cache) = parked {
            self.recycled.add(1);
            return (cache, Binding::Recycled);
        }

        let layout = Layout::new::<ThreadCache>();
        // Safety: ThreadCache is not zero-sized.
        let raw = unsafe { System.alloc(layout) }.cast::<ThreadCache>();
        let Some(cache) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        // Safety: fresh, correctly sized and aligned allocation.
        unsafe { cache.as_ptr().write(ThreadCache::new(self.classes)) };
        self.created.add(1);
        (cache, Binding::Created)
    }

    /// Park a cache for the next thread.
    ///
    /// The caller must no longer touch `cache`; it belongs to the registry
    /// until handed out again by [`CacheRegistry::acquire`].
    pub(crate) fn retire(&self, cache: NonNull<ThreadCache>) {
        let mut list = self.lock();
        // Safety: the cache was just unbound and the mutex is held.
        unsafe { cache.as_ref().set_next_unbound(list.head) };
        list.head = cache.as_ptr();
    }

    /// Number of caches currently parked.
    #[cfg(test)]
    pub(crate) fn unbound_len(&self) -> usize {
        let list = self.lock();
        let mut count = 0;
        let mut cache = list.head;
        while let Some(c) = NonNull::new(cache) {
            count += 1;
            // Safety: mutex held.
            cache = unsafe { c.as_ref().next_unbound() };
        }
        count
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        let list = self.lock();
        let mut cache = list.head;
        while let Some(c) = NonNull::new(cache) {
            // Safety: every cache on the list came from `acquire`, and nothing
            // else references it once parked.
            unsafe {
                cache = c.as_ref().next_unbound();
                ptr::drop_in_place(c.as_ptr());
                System.dealloc(c.as_ptr().cast(), Layout::new::<ThreadCache>());
            }
        }
    }
}

/// How [`CacheRegistry::acquire`] came by a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Binding {
    Created,
    Recycled,
}

impl Binding {
    fn report(self, cache: NonNull<ThreadCache>) {
        match self {
            Self::Created => {
                tracing::trace!(cache = ?cache, "created thread cache");
            }
            Self::Recycled => {
                tracing::trace!(cache = ?cache, "recycled thread cache");
            }
        }
    }
}

/// Which registry an allocator binds its threads through.
///
/// The process-wide allocator uses a `'static` registry so that binding
/// needs no reference counting. Instance allocators share theirs with the
/// leases held in thread-local storage.
#[derive(Clone)]
pub(crate) enum RegistryRef {
    Global(&'static CacheRegistry),
    Scoped(Arc<CacheRegistry>),
}

impl Deref for RegistryRef {
    type Target = CacheRegistry;

    fn deref(&self) -> &CacheRegistry {
        match self {
            Self::Global(registry) => registry,
            Self::Scoped(registry) => registry,
        }
    }
}

impl RegistryRef {
    fn same_as(&self, other: &RegistryRef) -> bool {
        match (self, other) {
            (Self::Global(a), Self::Global(b)) => ptr::eq(*a, *b),
            (Self::Scoped(a), Self::Scoped(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Run `f` with the calling thread's cache for this registry, binding one
    /// on first use.
    ///
    /// Once thread-local storage is gone (allocations from other TLS
    /// destructors during thread exit), `f` runs against a cache borrowed
    /// for the duration of the call and parked again right after.
    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&ThreadCache) -> R) -> R {
        match self.bound_cache() {
            Some((cache, bound)) => {
                if let Some(binding) = bound {
                    binding.report(cache);
                }
                // Safety: the lease owning this cache stays in thread-local
                // storage until this thread exits, and only this thread uses it.
                f(unsafe { cache.as_ref() })
            }
            None => {
                let (lease, binding) = CacheLease::acquire(self.clone());
                binding.report(lease.cache);
                f(lease.cache())
            }
        }
    }

    /// The cache leased to this thread, if thread-local storage is usable.
    ///
    /// No borrow of the lease slots outlives this call, so `f` in
    /// [`RegistryRef::with_cache`] may re-enter freely. The [`Binding`] is
    /// set when this call bound a new lease.
    fn bound_cache(&self) -> Option<(NonNull<ThreadCache>, Option<Binding>)> {
        match self {
            Self::Global(_) => GLOBAL_LEASE
                .try_with(|slot| {
                    let mut slot = slot.try_borrow_mut().ok()?;
                    if let Some(lease) = slot.as_ref() {
                        return Some((lease.cache, None));
                    }
                    let (lease, binding) = CacheLease::acquire(self.clone());
                    let cache = slot.insert(lease).cache;
                    Some((cache, Some(binding)))
                })
                .ok()
                .flatten(),
            Self::Scoped(_) => SCOPED_LEASES
                .try_with(|slots| {
                    let mut leases = slots.try_borrow_mut().ok()?;
                    if let Some(lease) = leases.iter().find(|l| l.registry.same_as(self)) {
                        return Some((lease.cache, None));
                    }
                    leases.retain(|lease| !lease.is_orphaned());
                    let (lease, binding) = CacheLease::acquire(self.clone());
                    let cache = lease.cache;
                    leases.push(lease);
                    Some((cache, Some(binding)))
                })
                .ok()
                .flatten(),
        }
    }
}

/// A cache bound to one thread. Dropping the lease parks the cache.
pub(crate) struct CacheLease {
    registry: RegistryRef,
    cache: NonNull<ThreadCache>,
}

impl CacheLease {
    fn acquire(registry: RegistryRef) -> (Self, Binding) {
        let (cache, binding) = registry.acquire();
        (Self { registry, cache }, binding)
    }

    fn cache(&self) -> &ThreadCache {
        // Safety: the cache is bound to this lease until it drops.
        unsafe { self.cache.as_ref() }
    }

    /// The allocator behind a scoped registry is gone; only this lease keeps
    /// the registry alive.
    fn is_orphaned(&self) -> bool {
        matches!(&self.registry, RegistryRef::Scoped(registry) if Arc::strong_count(registry) == 1)
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.registry.retire(self.cache);
    }
}

crate::sync::thread_local! {
    static GLOBAL_LEASE: RefCell<Option<CacheLease>> = RefCell::new(None);
    static SCOPED_LEASES: RefCell<Vec<CacheLease>> = RefCell::new(Vec::new());
}
