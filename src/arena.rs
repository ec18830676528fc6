//! A bump arena for allocations made before the real allocator is known.
//!
//! Looking up `malloc` may itself call `malloc`, so those first requests are
//! carved out of a static buffer. Nothing is ever returned to the arena; it
//! goes away with the process.

use crate::header::{HEADER_SIZE, MIN_ALIGN};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Default arena size of [`MallocCount`](crate::MallocCount).
pub const BOOTSTRAP_ARENA_SIZE: usize = 1024 * 1024;

#[repr(C, align(32))]
struct Bytes<const N: usize>([u8; N]);

pub struct BootstrapArena<const N: usize> {
    bytes: UnsafeCell<Bytes<N>>,
    used: AtomicUsize,
}

// SAFETY: disjoint slots are handed out through an atomic bump pointer, the
// arena never touches a slot's contents after that.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new(Bytes([0; N])),
            used: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.bytes.get() as *mut u8
    }

    /// Reserve room for a header plus `size` bytes. Returns the header base,
    /// or `None` when the arena is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let slot = size
            .checked_add(HEADER_SIZE + MIN_ALIGN - 1)
            .map(|n| n & !(MIN_ALIGN - 1))?;
        let start = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(slot).filter(|&end| end <= N)
            })
            .ok()?;
        // SAFETY: `start + slot <= N`, so the offset stays inside `bytes`.
        NonNull::new(unsafe { self.base().add(start) })
    }

    /// Whether `ptr` points into the part of the arena handed out so far.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.used.load(Ordering::Acquire)
    }

    /// Bytes handed out so far, headers and padding included.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
