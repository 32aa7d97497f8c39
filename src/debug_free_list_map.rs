//! Tracks, in debug builds, which payload addresses are currently
//! live so that disjointness and double-free/double-allocate bugs are
//! caught independent of the allocator's own chunk and free-list
//! bookkeeping.
use std::collections::BTreeMap;
use std::sync::Mutex;

struct LiveSpan {
    size: usize,
}

lazy_static::lazy_static! {
    static ref LIVE_SPANS: Mutex<BTreeMap<usize, LiveSpan>> = Default::default();
}

/// Confirms `[addr, addr + size)` overlaps no other live span, then
/// records it as live.
pub fn mark_allocated(addr: usize, size: usize) -> Result<(), &'static str> {
    let mut spans = LIVE_SPANS.lock().unwrap();

    if let Some((&prev_addr, prev)) = spans.range(..=addr).next_back() {
        if prev_addr + prev.size > addr {
            return Err("allocation overlaps a preceding live span");
        }
    }
    if let Some((&next_addr, _)) = spans.range(addr..).next() {
        if addr + size > next_addr {
            return Err("allocation overlaps a following live span");
        }
    }

    spans.insert(addr, LiveSpan { size });
    Ok(())
}

/// Confirms `addr` is currently live with exactly `size` bytes, then
/// forgets it.
pub fn mark_released(addr: usize, size: usize) -> Result<(), &'static str> {
    let mut spans = LIVE_SPANS.lock().unwrap();

    match spans.remove(&addr) {
        Some(span) if span.size == size => Ok(()),
        Some(_) => Err("released size does not match the live span"),
        None => Err("released an address with no live span"),
    }
}

/// Number of currently-live spans.
pub fn live_count() -> usize {
    LIVE_SPANS.lock().unwrap().len()
}
