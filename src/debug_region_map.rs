//! Tracks the set of currently-mapped region address ranges in debug
//! builds, independent of the allocator's own region lists. Used to
//! verify disjointness and to observe net mapped bytes across a test
//! scenario without trusting the structures under test.
use std::collections::BTreeMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref REGIONS: Mutex<BTreeMap<usize, usize>> = Default::default();
}

/// Records a freshly mapped region. Must not overlap any region
/// already recorded.
pub fn register_region(base: usize, size: usize) -> Result<(), &'static str> {
    let mut regions = REGIONS.lock().unwrap();

    if let Some((&prev_base, &prev_size)) = regions.range(..=base).next_back() {
        if prev_base + prev_size > base {
            return Err("new region overlaps a preceding region");
        }
    }
    if let Some((&next_base, _)) = regions.range(base..).next() {
        if base + size > next_base {
            return Err("new region overlaps a following region");
        }
    }

    regions.insert(base, size);
    Ok(())
}

/// Forgets a previously registered region, exactly as registered.
pub fn unregister_region(base: usize, size: usize) -> Result<(), &'static str> {
    let mut regions = REGIONS.lock().unwrap();

    match regions.remove(&base) {
        Some(recorded_size) if recorded_size == size => Ok(()),
        Some(_) => Err("region size mismatch on release"),
        None => Err("region was not registered"),
    }
}

/// Total bytes across all currently-registered regions.
pub fn total_mapped_bytes() -> usize {
    REGIONS.lock().unwrap().values().sum()
}

/// Number of currently-registered regions.
pub fn region_count() -> usize {
    REGIONS.lock().unwrap().len()
}
