//! A `ChunkHeader` is a fixed-layout header immediately preceding a
//! user data payload. Each chunk participates in two intrusive
//! doubly-linked lists: its owning region's chunk list (address
//! order, via `next_in_region`), and the owning arena's global free
//! list (via `prev_in_free`/`next_in_free`).
use std::ptr::NonNull;

use crate::region::RegionHeader;

/// Chunks are bump-allocated and never moved or split, so a raw
/// address is stable for the chunk's entire lifetime.
#[repr(C)]
pub struct ChunkHeader {
    /// Bytes available to the user, immediately following this header.
    pub payload_size: usize,
    /// Next chunk carved from the same region, in address order.
    pub next_in_region: Option<NonNull<ChunkHeader>>,
    /// Previous/next links in the owning arena's global free list.
    /// Chunks currently handed out to a caller are not linked here.
    pub prev_in_free: Option<NonNull<ChunkHeader>>,
    pub next_in_free: Option<NonNull<ChunkHeader>>,
    /// Back-pointer to the region this chunk was carved from.
    pub owner_region: NonNull<RegionHeader>,
}

static_assertions::assert_eq_size!(Option<NonNull<ChunkHeader>>, *mut ChunkHeader);

impl ChunkHeader {
    /// Returns the header for a payload pointer previously returned by
    /// this crate's allocation path.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer returned by a prior allocation from
    /// this crate that has not been released.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<ChunkHeader> {
        let addr = payload.as_ptr() as usize - std::mem::size_of::<ChunkHeader>();
        NonNull::new_unchecked(addr as *mut ChunkHeader)
    }

    /// Returns the payload address for this chunk.
    #[inline]
    pub fn payload(header: NonNull<ChunkHeader>) -> NonNull<u8> {
        let addr = header.as_ptr() as usize + std::mem::size_of::<ChunkHeader>();
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Returns the address immediately past this chunk's payload: the
    /// address a subsequent bump-allocated chunk in the same region
    /// would occupy.
    #[inline]
    pub fn end_address(header: NonNull<ChunkHeader>) -> usize {
        let this = unsafe { header.as_ref() };

        header.as_ptr() as usize + std::mem::size_of::<ChunkHeader>() + this.payload_size
    }

    /// Rounds `n` up to a multiple of this header's alignment. Bump
    /// allocation always stores a payload size rounded through this
    /// function, so that one chunk's end address — where the next
    /// chunk's header is placed — is itself a valid `ChunkHeader`
    /// alignment, given that the region header (and thus the first
    /// chunk's address) is already aligned that way.
    #[inline]
    pub fn align_payload(n: usize) -> usize {
        let align = std::mem::align_of::<ChunkHeader>();

        (n + align - 1) & !(align - 1)
    }
}

#[test]
fn test_payload_roundtrip() {
    let mut storage = [0u8; 256];
    let header_ptr = storage.as_mut_ptr() as *mut ChunkHeader;
    let header = NonNull::new(header_ptr).unwrap();

    let payload = ChunkHeader::payload(header);
    let recovered = unsafe { ChunkHeader::from_payload(payload) };

    assert_eq!(recovered, header);
}
