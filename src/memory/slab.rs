use std::ptr::NonNull;

/// Where the arena gets its raw memory from.
///
/// `obtain` must not panic or abort on exhaustion: the arena has a recovery
/// chain for a refused slab and needs to see the `None`.
pub trait SlabSource: Send + Sync {
    /// Request `size` bytes aligned to at least `align`.
    /// Returns `None` when the request cannot be satisfied.
    fn obtain(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Hand a slab back.
    ///
    /// # Safety
    /// `ptr`, `size` and `align` must be exactly those of an earlier successful
    /// `obtain` on this source, and the slab must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Slabs straight from the platform allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsSlabs;

#[cfg(unix)]
mod unix {
    use super::{NonNull, OsSlabs, SlabSource};

    /// `malloc` alignment guaranteed by every supported libc.
    const MALLOC_ALIGN: usize = 2 * std::mem::size_of::<usize>();

    impl SlabSource for OsSlabs {
        fn obtain(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
            if align <= MALLOC_ALIGN {
                // Safety: FFI call to malloc.
                NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>())
            } else {
                let mut out: *mut libc::c_void = std::ptr::null_mut();
                // Safety: FFI call to posix_memalign; align is a power of two
                // and a multiple of the pointer size (validated config).
                let rc = unsafe { libc::posix_memalign(&mut out, align, size) };
                if rc != 0 {
                    return None;
                }
                NonNull::new(out.cast::<u8>())
            }
        }

        unsafe fn release(&self, ptr: NonNull<u8>, _size: usize, _align: usize) {
            // Safety: FFI call to free; ptr came from malloc/posix_memalign.
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use super::{NonNull, OsSlabs, SlabSource};
    use std::alloc::{GlobalAlloc, Layout, System};

    impl SlabSource for OsSlabs {
        fn obtain(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(size, align).ok()?;
            // Safety: size is non-zero (the arena never asks for zero bytes).
            NonNull::new(unsafe { System.alloc(layout) })
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
            // Safety: same layout as `obtain` per the caller contract.
            unsafe {
                System.dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, align));
            }
        }
    }
}
