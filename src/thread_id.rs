//! The arena registry is keyed on the OS-level thread id (Linux
//! `gettid`, distinct both from the process id and from
//! `std::thread::ThreadId`), matching the `pid_t thread_id` the
//! original implementation this crate's design is distilled from
//! keys its arenas on.
use std::num::NonZeroI32;

/// An OS-level thread identifier, unique among currently-live threads.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[repr(transparent)]
pub struct ThreadId(NonZeroI32);

impl ThreadId {
    /// Returns the calling thread's id.
    #[inline]
    pub fn current() -> ThreadId {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;

        ThreadId(NonZeroI32::new(tid).expect("gettid should never return 0"))
    }

    #[inline]
    pub(crate) fn get(self) -> i32 {
        self.0.get()
    }

    /// Wraps an arbitrary non-zero id. Used by tests to simulate many
    /// distinct threads without actually spawning them, and by the
    /// registry to mint a sentinel id that can never collide with a
    /// real `gettid()` result.
    pub(crate) fn from_raw(id: i32) -> ThreadId {
        ThreadId(NonZeroI32::new(id).expect("ids must be non-zero"))
    }

    /// An id no real thread can have (`gettid` never returns a
    /// negative value), used to mark a registry lookup that failed.
    pub(crate) fn sentinel() -> ThreadId {
        ThreadId::from_raw(-1)
    }
}

#[test]
fn test_current_is_stable() {
    let a = ThreadId::current();
    let b = ThreadId::current();

    assert_eq!(a, b);
}

#[test]
fn test_distinct_threads_have_distinct_ids() {
    let main_id = ThreadId::current();

    let other_id = std::thread::spawn(ThreadId::current)
        .join()
        .expect("thread should not panic");

    assert_ne!(main_id, other_id);
}
