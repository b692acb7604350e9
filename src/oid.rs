//! Object and type identifiers, and the monotonic oid allocator (design §3,
//! Open Question 1 as resolved in SPEC_FULL.md §9).

use std::sync::atomic::{AtomicU64, Ordering};

/// A non-zero 64-bit object identifier. `0` is reserved for null.
pub type Oid = u64;

/// A non-zero 32-bit type identifier. `0` is reserved.
pub type Tid = u32;

/// Reserved oid meaning "no object" (a null reference in a stored graph).
pub const NULL_OID: Oid = 0;

/// Reserved tid meaning "no type" (only ever seen on gravestone records,
/// which carry no body).
pub const NULL_TID: Tid = 0;

/// Per-store monotonic oid allocator, seeded from the root file's
/// high-water mark and cross-checked against the index rebuild's maximum
/// observed oid on open — whichever is larger wins, since trusting a stale
/// persisted counter could hand out an oid that is already in use.
pub struct OidAllocator {
    next: AtomicU64,
}

impl OidAllocator {
    /// Creates an allocator that will hand out `high_water + 1` next.
    pub fn starting_after(high_water: Oid) -> Self {
        OidAllocator { next: AtomicU64::new(high_water + 1) }
    }

    /// Atomically reserves and returns the next oid.
    pub fn allocate(&self) -> Oid {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The oid that would be returned by the next `allocate()` call, without
    /// consuming it. Used when persisting the high-water mark into `root.bin`.
    pub fn peek_next(&self) -> Oid {
        self.next.load(Ordering::SeqCst)
    }

    /// Raises the allocator's floor if `candidate` is higher than what it
    /// would currently allocate. Used after an index rebuild discovers an
    /// oid higher than the persisted high-water mark (e.g. because the
    /// process crashed after a commit but before the root was rewritten).
    pub fn observe(&self, candidate: Oid) {
        self.next.fetch_max(candidate + 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_strictly_increasing_oids() {
        let alloc = OidAllocator::starting_after(0);
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn observe_only_raises_the_floor() {
        let alloc = OidAllocator::starting_after(0);
        alloc.allocate(); // consumes oid 1
        alloc.observe(100);
        assert_eq!(alloc.peek_next(), 101);
        alloc.observe(5); // lower than current floor, must be a no-op
        assert_eq!(alloc.peek_next(), 101);
    }

    #[test]
    fn starting_after_high_water_resumes_correctly() {
        let alloc = OidAllocator::starting_after(41);
        assert_eq!(alloc.allocate(), 42);
    }
}
