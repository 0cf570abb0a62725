use super::config::MAX_CLASSES;
use super::free_list::{FreeChain, FreeNode};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::cell::UnsafeCell;
use std::ptr::{self, NonNull};

/// One free list per size class, owned by whichever thread currently holds
/// the binding.
///
/// Every list is a Treiber stack. There is no generation tag: a node popped
/// and pushed back between another thread's load and CAS would go unnoticed.
/// That window needs two threads on the same cache, which the registry never
/// allows while the cache is bound, and blocks are never returned to the OS
/// while the allocator is alive.
pub(crate) struct ThreadCache {
    heads: [AtomicPtr<FreeNode>; MAX_CLASSES],
    classes: usize,
    /// Reuse-list link. Only touched under the registry mutex while unbound.
    next_unbound: UnsafeCell<*mut ThreadCache>,
}

// Safety: the heads are atomics; `next_unbound` is only accessed under the
// registry mutex while no thread holds the cache.
unsafe impl Send for ThreadCache {}
// Safety: see above.
unsafe impl Sync for ThreadCache {}

impl ThreadCache {
    pub(crate) fn new(classes: usize) -> Self {
        debug_assert!(classes <= MAX_CLASSES);
        Self {
            heads: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            classes,
            next_unbound: UnsafeCell::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn classes(&self) -> usize {
        self.classes
    }

    /// Pop the most recently freed block of class `idx`.
    #[inline]
    pub(crate) fn pop(&self, idx: usize) -> Option<NonNull<u8>> {
        let head = &self.heads[idx];
        let mut observed = head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(observed)?;
            // Safety: nodes on a free list are free blocks of this class.
            let next = unsafe { FreeNode::next(node) };
            match head.compare_exchange_weak(observed, next, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => return Some(node.cast()),
                Err(current) => observed = current,
            }
        }
    }

    /// Push a free block onto class `idx`.
    #[inline]
    pub(crate) fn push(&self, idx: usize, block: NonNull<u8>) {
        let node = block.cast::<FreeNode>();
        let head = &self.heads[idx];
        let mut observed = head.load(Ordering::Relaxed);
        loop {
            // Safety: the caller gave the block up; its first word is ours.
            unsafe { FreeNode::set_next(node, observed) };
            match head.compare_exchange_weak(
                observed,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => observed = current,
            }
        }
    }

    /// Prepend a whole chain to class `idx` with a single successful CAS.
    pub(crate) fn splice(&self, idx: usize, chain: FreeChain) {
        let head = &self.heads[idx];
        let mut observed = head.load(Ordering::Relaxed);
        loop {
            // Safety: the chain is detached and owned by the caller.
            unsafe { FreeNode::set_next(chain.tail, observed) };
            match head.compare_exchange_weak(
                observed,
                chain.head.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => observed = current,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self, idx: usize) -> bool {
        self.heads[idx].load(Ordering::Acquire).is_null()
    }

    /// Count the blocks cached for class `idx`.
    ///
    /// Walks the list; only meaningful while no other thread mutates it.
    #[cfg(test)]
    pub(crate) fn len(&self, idx: usize) -> usize {
        let mut count = 0;
        let mut node = self.heads[idx].load(Ordering::Acquire);
        while let Some(n) = NonNull::new(node) {
            count += 1;
            // Safety: list nodes are free blocks.
            node = unsafe { FreeNode::next(n) };
        }
        count
    }

    /// Reuse-list link.
    ///
    /// # Safety
    /// The cache must be unbound and the registry mutex held.
    pub(crate) unsafe fn next_unbound(&self) -> *mut ThreadCache {
        *crate::sync::unsafe_cell_get_mut!(self.next_unbound)
    }

    /// # Safety
    /// Same as [`ThreadCache::next_unbound`].
    pub(crate) unsafe fn set_next_unbound(&self, next: *mut ThreadCache) {
        *crate::sync::unsafe_cell_get_mut!(self.next_unbound) = next;
    }
}
