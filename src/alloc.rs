use crate::arena::BOOTSTRAP_ARENA_SIZE;
use crate::context::MallocCount;
use crate::header::MIN_ALIGN;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// A global allocator that sends every call through a [`MallocCount`].
///
/// To use this struct, use the `#[global_allocator]` compiler directive and
/// point it at a `static` counter, usually [`MALLOC_COUNT`](crate::MALLOC_COUNT).
/// Note that [`MallocCount::new`] is a `const fn`.
///
/// Requests with an alignment up to [`MIN_ALIGN`] take the `malloc` path,
/// stricter ones take the `aligned_alloc` path.
pub struct CountingAlloc<'a, const N: usize = BOOTSTRAP_ARENA_SIZE> {
    /// Counter that does the bookkeeping and delegation
    pub counter: &'a MallocCount<N>,
}

impl<'a, const N: usize> CountingAlloc<'a, N> {
    /// A new instance of the allocator.
    #[inline]
    pub const fn new(counter: &'a MallocCount<N>) -> Self {
        Self { counter }
    }
}

unsafe impl<'a, const N: usize> GlobalAlloc for CountingAlloc<'a, N> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            self.counter.malloc(layout.size())
        } else {
            self.counter.aligned_alloc(layout.align(), layout.size())
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.counter.free(ptr);
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return self.counter.calloc(1, layout.size());
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return self.counter.realloc(ptr, new_size);
        }
        // `realloc` only promises malloc alignment, so over-aligned blocks
        // are moved by hand.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Libc;

    #[test]
    fn layouts_are_accounted_by_size() {
        static C: MallocCount<4096> = MallocCount::new();
        C.initialize(&Libc);
        let a = CountingAlloc::new(&C);
        unsafe {
            let small = Layout::from_size_align(24, 8).unwrap();
            let p = a.alloc(small);
            assert_eq!(C.current(), 24);

            let big = Layout::from_size_align(100, 128).unwrap();
            let q = a.alloc_zeroed(big);
            assert_eq!(q as usize % 128, 0);
            assert!((0..100).all(|i| q.add(i).read() == 0));
            assert_eq!(C.current(), 124);

            let q = a.realloc(q, big, 300);
            assert_eq!(q as usize % 128, 0);
            assert_eq!(C.current(), 324);

            let p = a.realloc(p, small, 8);
            assert_eq!(C.current(), 308);

            a.dealloc(p, Layout::from_size_align(8, 8).unwrap());
            a.dealloc(q, Layout::from_size_align(300, 128).unwrap());
        }
        assert_eq!(C.current(), 0);
        assert_eq!(C.num_allocations(), 4);
    }
}
