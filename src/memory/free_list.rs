use std::ptr::{self, NonNull};

/// Free-list link overlaid on the first word of an unused block.
///
/// Only valid while the block is free. Once a block is handed out the caller
/// owns every byte of it, link included.
#[repr(C)]
pub(crate) struct FreeNode {
    next: *mut FreeNode,
}

impl FreeNode {
    /// Read the link stored in a free block.
    ///
    /// # Safety
    /// `node` must point to a free block at least pointer-sized and aligned.
    #[inline]
    pub(crate) unsafe fn next(node: NonNull<FreeNode>) -> *mut FreeNode {
        // Safety: upheld by caller.
        unsafe { ptr::addr_of!((*node.as_ptr()).next).read() }
    }

    /// Store `next` as the link of a free block.
    ///
    /// # Safety
    /// Same as [`FreeNode::next`]; the block must not be live.
    #[inline]
    pub(crate) unsafe fn set_next(node: NonNull<FreeNode>, next: *mut FreeNode) {
        // Safety: upheld by caller.
        unsafe { ptr::addr_of_mut!((*node.as_ptr()).next).write(next) };
    }
}

/// A detached, null-terminated run of free blocks.
#[derive(Debug)]
pub(crate) struct FreeChain {
    pub(crate) head: NonNull<FreeNode>,
    pub(crate) tail: NonNull<FreeNode>,
    pub(crate) len: usize,
}

impl FreeChain {
    /// Thread `count` contiguous blocks of `stride` bytes starting at `start`
    /// into a chain, in address order.
    ///
    /// # Safety
    /// - `count >= 1`.
    /// - `[start, start + stride * count)` must be writable, unused memory.
    /// - `start` and `stride` must be pointer-aligned, `stride >= size_of::<usize>()`.
    pub(crate) unsafe fn from_run(start: NonNull<u8>, stride: usize, count: usize) -> Self {
        debug_assert!(count >= 1, "empty run");
        debug_assert!(stride >= std::mem::size_of::<usize>());

        let head = start.cast::<FreeNode>();
        let mut tail = head;
        for i in 1..count {
            // Safety: i * stride stays inside the run.
            let next = unsafe { start.add(i * stride) }.cast::<FreeNode>();
            // Safety: tail is inside the run and unused.
            unsafe { FreeNode::set_next(tail, next.as_ptr()) };
            tail = next;
        }
        // Safety: tail is inside the run and unused.
        unsafe { FreeNode::set_next(tail, ptr::null_mut()) };

        Self {
            head,
            tail,
            len: count,
        }
    }
}
