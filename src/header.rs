use std::{mem, ptr::NonNull};

use bitflags::bitflags;

use crate::{ALIGNMENT, RETRY_LIMIT, utils::align};

/// Size in bytes of the [`Header`] written in front of every allocation.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

bitflags! {
    /// State bits of an allocation header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HeaderFlags: u8 {
        /// The allocation bypassed the blocks and lives in its own system region.
        const LARGE = 1 << 0;
        /// The owner gave the allocation back.
        const RELEASED = 1 << 1;
    }
}

/// Metadata that precedes every span handed out by the pool.
///
/// ```text
/// +---------------------+ <------+
/// |     len (u32)       |        |
/// +---------------------+        |
/// |   retries (u8)      |        | -> Header
/// +---------------------+        |
/// |    flags (u8)       |        |
/// +---------------------+ <------+
/// |      Content        |        |
/// |        ...          |        | -> What the caller sees
/// +---------------------+ <------+
/// ```
///
/// For small allocations `len` is the aligned span from this header to the
/// next one inside the block, which is what the recycling scan relies on to
/// walk a block without any other index.
#[repr(C)]
pub(crate) struct Header {
    /// Aligned effective size: header plus payload.
    pub len: u32,
    /// How many recycling scans stopped on this header.
    pub retries: u8,
    pub flags: HeaderFlags,
    _padding: u16,
}

impl Header {
    /// Writes a fresh header at `addr` and returns a pointer to it.
    ///
    /// **SAFETY**: `addr` must be valid for writes of `len` bytes and aligned
    /// to [`ALIGNMENT`].
    pub unsafe fn write(addr: NonNull<u8>, len: usize, large: bool) -> NonNull<Header> {
        debug_assert!(len >= HEADER_SIZE, "allocation shorter than its header");
        debug_assert_eq!(addr.as_ptr() as usize % ALIGNMENT, 0);

        let header = addr.cast::<Header>();
        let flags = if large {
            HeaderFlags::LARGE
        } else {
            HeaderFlags::empty()
        };

        unsafe {
            header.as_ptr().write(Header {
                // Large lengths live in their descriptor, the header copy is informative.
                len: u32::try_from(len).unwrap_or(u32::MAX),
                retries: 0,
                flags,
                _padding: 0,
            });
        }

        header
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.flags.contains(HeaderFlags::LARGE)
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.flags.contains(HeaderFlags::RELEASED)
    }

    #[inline]
    pub fn release(&mut self) {
        self.flags.insert(HeaderFlags::RELEASED);
    }

    /// Bumps the retry counter, saturating at [`RETRY_LIMIT`]. Returns `true`
    /// the first time the limit is reached.
    pub fn retry(&mut self) -> bool {
        if self.retries >= RETRY_LIMIT {
            return false;
        }
        self.retries += 1;
        self.retries == RETRY_LIMIT
    }

    /// First byte after the header, where the caller's data starts.
    #[inline]
    pub fn payload(header: NonNull<Header>) -> NonNull<u8> {
        unsafe { header.cast::<u8>().add(HEADER_SIZE) }
    }
}

/// Size a request of `size` bytes really occupies: the payload plus its header,
/// rounded up to [`ALIGNMENT`]. `None` when that overflows.
pub fn effective_size(size: usize) -> Option<usize> {
    let len = size.checked_add(HEADER_SIZE)?;
    len.checked_add(ALIGNMENT - 1)?;
    Some(align(len, ALIGNMENT))
}
