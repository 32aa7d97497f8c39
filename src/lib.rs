//! A thread-arena chunked region allocator meant to replace the
//! system allocator.
//!
//! Each thread is assigned a private [`arena::Arena`] the first time it
//! allocates, tracked by [`registry`] under a single process-wide
//! mutex. Once a thread has its arena, further allocation and release
//! work touches no shared state: the hot path is `registry::lookup_arena`
//! (locked), arena work (unlocked), `registry::store_arena` (locked).
mod arena;
mod chunk;
mod map;
mod region;
mod registry;
mod thread_id;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_free_list_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_region_map;

use std::ffi::c_void;
use std::ptr::NonNull;

pub use arena::Arena;
pub use thread_id::ThreadId;

/// Allocates `size` writable bytes, not overlapping any other live
/// allocation in any arena. Returns `None` if `size == 0`, or if the
/// underlying OS mapping primitive fails.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    let tid = ThreadId::current();
    let mut arena = registry::lookup_arena(tid);
    if arena.thread_id != tid {
        // Registry capacity-growth failed; surfaced to us as a
        // sentinel arena whose id doesn't match what we asked for.
        return None;
    }

    let payload = arena.allocate(size).ok()?;

    registry::store_arena(arena)
        .expect("arena was just looked up under this thread's own id");

    Some(payload)
}

/// Releases `payload`, previously returned by [`allocate`] and not yet
/// released.
///
/// # Safety
///
/// `payload` must have been returned by a prior call to `allocate` (on
/// any thread; see the module docs on arena exclusivity) and must not
/// already have been released. Behavior is undefined otherwise.
pub unsafe fn release(payload: NonNull<u8>) {
    let tid = ThreadId::current();
    let mut arena = registry::lookup_arena(tid);
    assert_eq!(
        arena.thread_id, tid,
        "registry lookup failed while releasing a pointer; the owning arena must already exist"
    );

    arena.release(payload);

    registry::store_arena(arena)
        .expect("arena was just looked up under this thread's own id");
}

/// Allocates `size` bytes, for callers linking against this crate as a
/// C library. Returns `NULL` on failure, matching `malloc`'s contract.
///
/// This symbol is deliberately not named `malloc`: shadowing the
/// platform allocator's own symbol table entries is a linking concern
/// left to the embedder, not part of this allocator's core.
///
/// # Safety
///
/// Safe to call from any thread; the returned pointer, if non-null, is
/// valid for reads and writes of `size` bytes until released.
#[no_mangle]
pub unsafe extern "C" fn arena_malloc_allocate(size: usize) -> *mut c_void {
    match allocate(size) {
        Some(ptr) => ptr.as_ptr() as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

/// Releases a pointer obtained from [`arena_malloc_allocate`], for
/// callers linking against this crate as a C library. A `NULL`
/// argument is a no-op, matching `free`'s contract.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by
/// `arena_malloc_allocate` and not yet released.
#[no_mangle]
pub unsafe extern "C" fn arena_malloc_release(ptr: *mut c_void) {
    if let Some(payload) = NonNull::new(ptr as *mut u8) {
        release(payload);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_zero_size_returns_none() {
        assert!(allocate(0).is_none());
    }

    #[test]
    fn allocate_write_release_round_trip() {
        let payload = allocate(128).expect("allocation should succeed");

        unsafe {
            std::ptr::write_bytes(payload.as_ptr(), 0x5A, 128);
            for i in 0..128 {
                assert_eq!(*payload.as_ptr().add(i), 0x5A);
            }
            release(payload);
        }
    }

    #[test]
    fn c_abi_round_trip() {
        unsafe {
            let ptr = arena_malloc_allocate(64);
            assert!(!ptr.is_null());

            std::ptr::write_bytes(ptr as *mut u8, 0x11, 64);
            arena_malloc_release(ptr);

            arena_malloc_release(std::ptr::null_mut());
        }
    }

    #[test]
    fn distinct_threads_get_distinct_arenas_through_the_public_api() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    let own = ThreadId::current();
                    let payload = allocate(256).expect("allocation should succeed");

                    let arena = registry::lookup_arena(own);
                    assert_eq!(arena.thread_id, own);

                    unsafe {
                        std::ptr::write_bytes(payload.as_ptr(), 0x7E, 256);
                        release(payload);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread should not panic");
        }
    }
}
