//! The hidden block in front of every user pointer.
//!
//! ```text
//! | requested size | extra alignment | reserved | sentinel | user data ...
//! ^ header base                                            ^ user pointer
//! <------------------------ HEADER_SIZE ------------------->
//! ```
//!
//! For over-aligned requests the real allocator's pointer sits
//! `extra_alignment` bytes *before* the header base.

use core::mem::size_of;
use core::ptr::NonNull;
use static_assertions::const_assert;

/// Size of the header, and therefore the offset from header base to user
/// pointer.
pub const HEADER_SIZE: usize = 32;

/// Alignment guaranteed by the underlying `malloc` and kept by every pointer
/// this crate hands out.
pub const MIN_ALIGN: usize = 2 * size_of::<usize>();

/// Written into every header, checked on release.
pub const SENTINEL: usize = 0xDEAD_C0DE;

const SIZE_OFFSET: usize = 0;
const EXTRA_OFFSET: usize = size_of::<usize>();
const SENTINEL_OFFSET: usize = HEADER_SIZE - size_of::<usize>();

const_assert!(HEADER_SIZE % MIN_ALIGN == 0);
const_assert!(EXTRA_OFFSET + size_of::<usize>() <= SENTINEL_OFFSET);

/// What a header says about the block behind a user pointer.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Decoded {
    /// Size the caller asked for.
    pub size: usize,
    /// Padding inserted before the header for an over-aligned request.
    pub extra_alignment: usize,
    /// Start of the header, `HEADER_SIZE` bytes before the user pointer.
    pub header_base: NonNull<u8>,
    /// Whether the sentinel was found where it should be.
    pub intact: bool,
}

impl Decoded {
    /// The pointer the real allocator returned, i.e. the one it must get back.
    pub fn allocation_base(&self) -> *mut u8 {
        self.header_base
            .as_ptr()
            .wrapping_sub(self.extra_alignment)
    }
}

/// Write a header at `header_base` and return the user pointer behind it.
///
/// # Safety
///
/// `header_base` must be valid for writes of `HEADER_SIZE` bytes and aligned
/// to `MIN_ALIGN`.
pub unsafe fn encode(header_base: NonNull<u8>, size: usize, extra_alignment: usize) -> NonNull<u8> {
    let base = header_base.as_ptr();
    write_word(base, SIZE_OFFSET, size);
    write_word(base, EXTRA_OFFSET, extra_alignment);
    write_word(base, SENTINEL_OFFSET, SENTINEL);
    NonNull::new_unchecked(base.add(HEADER_SIZE))
}

/// Read the header in front of `user`.
///
/// # Safety
///
/// `user` must be a pointer previously returned by [`encode`] whose block
/// has not been released. A damaged header is reported through
/// [`Decoded::intact`], not rejected.
pub unsafe fn decode(user: NonNull<u8>) -> Decoded {
    let base = user.as_ptr().sub(HEADER_SIZE);
    Decoded {
        size: read_word(base, SIZE_OFFSET),
        extra_alignment: read_word(base, EXTRA_OFFSET),
        header_base: NonNull::new_unchecked(base),
        intact: read_word(base, SENTINEL_OFFSET) == SENTINEL,
    }
}

/// Overwrite only the recorded size, leaving the rest of the header alone.
///
/// # Safety
///
/// Same as [`decode`].
pub unsafe fn set_size(user: NonNull<u8>, size: usize) {
    write_word(user.as_ptr().sub(HEADER_SIZE), SIZE_OFFSET, size);
}

#[inline]
unsafe fn write_word(base: *mut u8, offset: usize, value: usize) {
    (base.add(offset) as *mut usize).write(value);
}

#[inline]
unsafe fn read_word(base: *mut u8, offset: usize) -> usize {
    (base.add(offset) as *const usize).read()
}
