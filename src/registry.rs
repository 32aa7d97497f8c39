//! The process-wide, mutex-guarded table mapping a thread id to that
//! thread's [`Arena`]. Backed by a tightly-packed array sorted
//! ascending by thread id, grown in place by extending the program
//! break — the registry is expected to be the first and only
//! consumer of the program break in the process, so its growth is
//! always contiguous and existing entries never relocate.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::arena::Arena;
use crate::map;
use crate::thread_id::ThreadId;

#[cfg(not(feature = "test_only_small_constants"))]
const MIN_CAPACITY: usize = 32;
#[cfg(feature = "test_only_small_constants")]
const MIN_CAPACITY: usize = 4;

struct RegistryInner {
    base: Option<NonNull<Arena>>,
    count: usize,
    capacity: usize,
}

// `base` points into process memory obtained via the program break and
// is only ever touched while holding `REGISTRY`'s mutex.
unsafe impl Send for RegistryInner {}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<RegistryInner> = Mutex::new(RegistryInner {
        base: None,
        count: 0,
        capacity: 0,
    });
}

impl RegistryInner {
    fn arena_ptr(&self, index: usize) -> NonNull<Arena> {
        let base = self.base.expect("registry is initialized by the time this is called");

        unsafe { NonNull::new_unchecked(base.as_ptr().add(index)) }
    }

    fn as_slice(&self) -> &[Arena] {
        match self.base {
            Some(base) => unsafe { std::slice::from_raw_parts(base.as_ptr(), self.count) },
            None => &[],
        }
    }

    /// Ensures the backing array exists and has room for one more
    /// entry, growing (or creating) it via program-break extension.
    fn ensure_capacity(&mut self) -> Result<(), i32> {
        if self.base.is_none() {
            let bytes = MIN_CAPACITY * std::mem::size_of::<Arena>();
            let base = map::extend_program_break(bytes as isize)?;

            self.base = Some(unsafe { NonNull::new_unchecked(base as *mut Arena) });
            self.capacity = MIN_CAPACITY;
            return Ok(());
        }

        if self.count < self.capacity {
            return Ok(());
        }

        let bytes = self.capacity * std::mem::size_of::<Arena>();
        map::extend_program_break(bytes as isize)?;
        self.capacity *= 2;

        Ok(())
    }

    /// Index of the first entry with `thread_id >= tid`, or `count`
    /// if every entry's id is lower.
    fn lower_bound(&self, tid: ThreadId) -> usize {
        match self.as_slice().binary_search_by_key(&tid, |arena| arena.thread_id) {
            Ok(index) | Err(index) => index,
        }
    }

    /// Shifts the suffix starting at `index` one slot right and
    /// writes `arena` into the freed slot.
    fn insert_at(&mut self, index: usize, arena: Arena) {
        let base = self
            .base
            .expect("registry is initialized by the time this is called")
            .as_ptr();

        unsafe {
            std::ptr::copy(base.add(index), base.add(index + 1), self.count - index);
            std::ptr::write(base.add(index), arena);
        }
        self.count += 1;
    }
}

/// Returns the arena for `tid`, creating one (with no regions and an
/// empty free list) if this is the first lookup for that thread.
///
/// On registry capacity-growth failure, returns a sentinel arena
/// whose `thread_id` does not equal `tid`; callers must check for
/// this before using the snapshot.
#[ensures(ret.thread_id == tid || ret.thread_id == ThreadId::sentinel(),
          "Either the snapshot is keyed for the requested thread id, or capacity growth failed and a sentinel was returned.")]
pub fn lookup_arena(tid: ThreadId) -> Arena {
    let mut registry = REGISTRY.lock().unwrap();

    if registry.ensure_capacity().is_err() {
        return Arena::new(ThreadId::sentinel());
    }

    let index = registry.lower_bound(tid);

    if index < registry.count {
        let existing = unsafe { *registry.arena_ptr(index).as_ref() };
        if existing.thread_id == tid {
            return existing;
        }
    }

    let arena = Arena::new(tid);
    registry.insert_at(index, arena);
    arena
}

/// Writes a caller-modified arena snapshot back to the registry.
/// Fails if no entry for `arena.thread_id` exists (it must have been
/// obtained from a prior `lookup_arena`).
#[ensures(ret.is_ok() -> lookup_arena(arena.thread_id) == arena,
          "On success, a subsequent lookup for this thread id returns exactly what was stored.")]
pub fn store_arena(arena: Arena) -> Result<(), ()> {
    let mut registry = REGISTRY.lock().unwrap();
    let index = registry.lower_bound(arena.thread_id);

    if index >= registry.count {
        return Err(());
    }

    let mut slot = registry.arena_ptr(index);
    if unsafe { slot.as_ref().thread_id } != arena.thread_id {
        return Err(());
    }

    unsafe { *slot.as_mut() = arena };
    Ok(())
}

/// Documented no-op: arena teardown (unmapping regions, removing the
/// registry entry) is left to implementer discretion and is not
/// performed here. See the crate-level design notes.
pub fn destroy_arena(_tid: ThreadId) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_per_thread_exclusive() {
        for raw in [900_001i32, 900_002, 900_003] {
            let tid = ThreadId::from_raw(raw);
            let arena = lookup_arena(tid);
            assert_eq!(arena.thread_id, tid);

            let again = lookup_arena(tid);
            assert_eq!(again.thread_id, tid);
        }
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let tid = ThreadId::from_raw(900_101);
        let arena = lookup_arena(tid);

        store_arena(arena).expect("store should succeed for a registered thread id");

        let reloaded = lookup_arena(tid);
        assert_eq!(reloaded, arena);
    }

    #[test]
    fn store_rejects_id_mismatch() {
        let tid_a = ThreadId::from_raw(900_201);
        let tid_b = ThreadId::from_raw(900_202);

        let _ = lookup_arena(tid_a);
        let mut mismatched = lookup_arena(tid_b);
        mismatched.thread_id = ThreadId::from_raw(900_999);

        assert!(store_arena(mismatched).is_err());
    }

    #[test]
    fn out_of_order_insertions_end_up_sorted() {
        let ids = [900_500i32, 900_100, 900_300, 900_200, 900_400];
        for &raw in &ids {
            lookup_arena(ThreadId::from_raw(raw));
        }

        let registry = REGISTRY.lock().unwrap();
        let observed: Vec<i32> = registry
            .as_slice()
            .iter()
            .map(|arena| arena.thread_id.get())
            .filter(|&raw| (900_000..900_600).contains(&raw))
            .collect();

        assert_eq!(observed, vec![900_100, 900_200, 900_300, 900_400, 900_500]);
    }

    #[test]
    fn registry_is_always_monotone() {
        lookup_arena(ThreadId::from_raw(900_777));

        let registry = REGISTRY.lock().unwrap();
        let slice = registry.as_slice();
        for window in slice.windows(2) {
            assert!(window[0].thread_id < window[1].thread_id);
        }
    }

    #[test]
    fn many_threads_each_see_their_own_arena() {
        let handles: Vec<_> = (0..100)
            .map(|_| {
                std::thread::spawn(|| {
                    let own = ThreadId::current();
                    for _ in 0..100 {
                        let arena = lookup_arena(own);
                        assert_eq!(arena.thread_id, own);
                        std::thread::sleep(std::time::Duration::from_micros(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread should not panic");
        }
    }
}
