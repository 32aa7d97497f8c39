//! Wrappers around the two OS primitives the rest of this crate is
//! built on: program-break extension, and anonymous page mapping.
//!
//! Unlike the teacher crate this was derived from, which farms this
//! out to a small C shim built by `cc`, the two primitives needed here
//! are simple enough to call directly through `libc`.
use std::ffi::c_void;
use std::ptr::NonNull;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// Extends (or, for a negative `delta`, contracts) the process's
/// program break by `delta` bytes, and returns the break's value
/// *before* the adjustment.
///
/// This primitive backs only the arena registry's backing array: the
/// registry must be the first consumer of the program break, so that
/// all of its growth is contiguous.
pub fn extend_program_break(delta: isize) -> Result<*mut c_void, i32> {
    let previous = unsafe { libc::sbrk(delta) };

    if previous == (-1isize as *mut c_void) {
        Err(errno())
    } else {
        Ok(previous)
    }
}

/// Maps a fresh, private, anonymous, read-write region of `size`
/// bytes, zero-filled by the kernel. `size` must be a multiple of the
/// page size.
pub fn map_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(ret).expect("mmap should never return NULL on success"))
    }
}

/// Unmaps a region of `size` bytes starting at `base`, previously
/// obtained from a single call to [`map_region`].
pub fn unmap_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}

#[test]
fn test_round_up_to_page() {
    let page = page_size();

    assert_eq!(round_up_to_page(1), page);
    assert_eq!(round_up_to_page(page), page);
    assert_eq!(round_up_to_page(page + 1), 2 * page);
}

#[test]
fn smoke_test_map_unmap() {
    let size = 4 * page_size();
    let region = map_region(size).expect("map should succeed");

    unsafe {
        std::ptr::write_bytes(region.as_ptr() as *mut u8, 0xA5, size);
    }

    unmap_region(region, size).expect("unmap should succeed");
}
