//! A `RegionHeader` sits at the base of a page-aligned OS-mapped
//! block; the remainder of the block is a bump-allocated, monotonic
//! sequence of chunks that the region owns for its entire lifetime.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::chunk::ChunkHeader;
use crate::map;

/// Amortizes the cost of mapping a fresh region by over-provisioning
/// it relative to the allocation size that triggered its creation.
#[cfg(not(feature = "test_only_small_constants"))]
pub const REDUNDANCY_MULTIPLIER: usize = 32;
#[cfg(feature = "test_only_small_constants")]
pub const REDUNDANCY_MULTIPLIER: usize = 2;

#[repr(C)]
pub struct RegionHeader {
    /// Page-aligned size of the whole mapped block, including this header.
    pub total_size: usize,
    /// First and last chunks carved from this region, in address order.
    pub chunks_head: Option<NonNull<ChunkHeader>>,
    pub chunks_tail: Option<NonNull<ChunkHeader>>,
    /// This region's contiguous run inside the arena's global free
    /// list. Both sentinel iff the region contributes no free chunks.
    pub local_free_head: Option<NonNull<ChunkHeader>>,
    pub local_free_tail: Option<NonNull<ChunkHeader>>,
    /// This region's position in its arena's region list.
    pub prev_region: Option<NonNull<RegionHeader>>,
    pub next_region: Option<NonNull<RegionHeader>>,
    /// Number of live (non-free) chunks. The region is unmapped when
    /// this reaches zero.
    pub occupied_count: usize,
}

impl RegionHeader {
    /// Returns the smallest power-of-two multiple of the page size
    /// large enough that, after subtracting this header, there is
    /// room for `REDUNDANCY_MULTIPLIER` chunks the size of the
    /// triggering `payload_size` request (plus one chunk header).
    pub fn size_for_request(payload_size: usize) -> usize {
        let header_size = std::mem::size_of::<ChunkHeader>();
        let required = REDUNDANCY_MULTIPLIER
            .checked_mul(payload_size)
            .and_then(|v| v.checked_add(header_size))
            .expect("requested size is too large to size a region for");

        let mut region_size = map::page_size();
        while region_size - std::mem::size_of::<RegionHeader>() < required {
            region_size = region_size
                .checked_mul(2)
                .expect("region size doubled past usize::MAX");
        }

        region_size
    }

    /// Maps and initializes a fresh region sized to comfortably host
    /// the triggering `payload_size` request (and, per
    /// `REDUNDANCY_MULTIPLIER`, many more like it).
    pub fn new(payload_size: usize) -> Result<NonNull<RegionHeader>, i32> {
        let total_size = Self::size_for_request(payload_size);
        let base = map::map_region(total_size)?;

        let header_ptr = base.as_ptr() as *mut RegionHeader;
        unsafe {
            std::ptr::write(
                header_ptr,
                RegionHeader {
                    total_size,
                    chunks_head: None,
                    chunks_tail: None,
                    local_free_head: None,
                    local_free_tail: None,
                    prev_region: None,
                    next_region: None,
                    occupied_count: 0,
                },
            );
        }

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        crate::debug_region_map::register_region(base.as_ptr() as usize, total_size)
            .expect("freshly mapped region must not overlap an already-registered one");

        Ok(unsafe { NonNull::new_unchecked(header_ptr) })
    }

    /// Unmaps `region`. The caller must have already unlinked it from
    /// every list it participated in.
    ///
    /// # Safety
    ///
    /// `region` must not be referenced again after this call.
    pub unsafe fn unmap(region: NonNull<RegionHeader>) -> Result<(), i32> {
        let total_size = region.as_ref().total_size;
        let base = NonNull::new_unchecked(region.as_ptr() as *mut c_void);

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        crate::debug_region_map::unregister_region(base.as_ptr() as usize, total_size)
            .expect("region being unmapped must have been registered");

        map::unmap_region(base, total_size)
    }

    /// Bytes remaining for new chunks at the tail of this region, not
    /// counting any space recoverable only via the free list.
    pub fn space_remaining(region: NonNull<RegionHeader>) -> usize {
        let this = unsafe { region.as_ref() };
        let capacity = this.total_size - std::mem::size_of::<RegionHeader>();

        match this.chunks_tail {
            None => capacity,
            Some(tail) => {
                let tail_end = ChunkHeader::end_address(tail);
                let region_base = region.as_ptr() as usize;

                this.total_size - (tail_end - region_base)
            }
        }
    }

    /// Bump-allocates a new chunk for at least `payload_size` bytes at
    /// the tail of `region`. The stored payload size is rounded up to
    /// `ChunkHeader`'s alignment, so the caller must have already
    /// verified `space_remaining(region) >= sizeof(ChunkHeader) +
    /// ChunkHeader::align_payload(payload_size)`.
    pub fn bump_allocate(
        mut region: NonNull<RegionHeader>,
        payload_size: usize,
    ) -> NonNull<ChunkHeader> {
        let payload_size = ChunkHeader::align_payload(payload_size);
        let this = unsafe { region.as_mut() };

        debug_assert!(
            Self::space_remaining(region) >= std::mem::size_of::<ChunkHeader>() + payload_size
        );

        let new_chunk_addr = match this.chunks_tail {
            None => region.as_ptr() as usize + std::mem::size_of::<RegionHeader>(),
            Some(tail) => ChunkHeader::end_address(tail),
        };
        let mut new_chunk =
            unsafe { NonNull::new_unchecked(new_chunk_addr as *mut ChunkHeader) };

        unsafe {
            std::ptr::write(
                new_chunk.as_ptr(),
                ChunkHeader {
                    payload_size,
                    next_in_region: None,
                    prev_in_free: None,
                    next_in_free: None,
                    owner_region: region,
                },
            );
        }

        match this.chunks_tail {
            None => this.chunks_head = Some(new_chunk),
            Some(mut tail) => unsafe { tail.as_mut().next_in_region = Some(new_chunk) },
        }
        this.chunks_tail = Some(new_chunk);
        this.occupied_count += 1;

        unsafe {
            new_chunk.as_mut();
        }
        new_chunk
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_for_request_is_page_aligned_and_sufficient() {
        for n in [1usize, 8, 4096, 65536] {
            let size = RegionHeader::size_for_request(n);

            assert_eq!(size % map::page_size(), 0);
            assert!(size.is_power_of_two());
            assert!(
                size - std::mem::size_of::<RegionHeader>()
                    >= REDUNDANCY_MULTIPLIER * n + std::mem::size_of::<ChunkHeader>()
            );
        }
    }

    #[test]
    fn new_region_bump_allocate_and_unmap() {
        let region = RegionHeader::new(64).expect("map should succeed");

        assert_eq!(RegionHeader::space_remaining(region), unsafe {
            region.as_ref().total_size - std::mem::size_of::<RegionHeader>()
        });

        let chunk = RegionHeader::bump_allocate(region, 64);
        assert_eq!(unsafe { chunk.as_ref().payload_size }, 64);
        assert_eq!(unsafe { region.as_ref().occupied_count }, 1);
        assert_eq!(unsafe { region.as_ref().chunks_head }, Some(chunk));
        assert_eq!(unsafe { region.as_ref().chunks_tail }, Some(chunk));

        unsafe {
            RegionHeader::unmap(region).expect("unmap should succeed");
        }
    }

    #[test]
    fn bump_allocated_chunks_stay_header_aligned() {
        let region = RegionHeader::new(64).expect("map should succeed");
        let align = std::mem::align_of::<ChunkHeader>();

        let mut previous = None;
        for payload_size in [1usize, 3, 7, 17, 100, 64] {
            let chunk = RegionHeader::bump_allocate(region, payload_size);
            assert_eq!(chunk.as_ptr() as usize % align, 0);

            if let Some(prev) = previous {
                assert_eq!(unsafe { prev.as_ref().next_in_region }, Some(chunk));
            }
            previous = Some(chunk);
        }

        unsafe {
            RegionHeader::unmap(region).expect("unmap should succeed");
        }
    }
}
