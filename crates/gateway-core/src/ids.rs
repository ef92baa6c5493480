//! Random identifier allocation for sessions and handles.
//!
//! Identifiers are uniform random non-zero 64-bit integers. Uniqueness is
//! guaranteed against the registry the identifier will live in: the
//! lookup-then-insert is atomic through the map's entry API, so two
//! concurrent allocations can never race into the same slot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Generate a random non-zero identifier. Zero is reserved as "absent" in
/// request paths, so it is never handed out.
pub fn random_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

/// Insert a freshly built value under a new unique identifier and return the
/// identifier. Collisions are vanishingly rare for a 64-bit space but the
/// retry loop makes the guarantee unconditional.
pub fn insert_unique<V>(map: &DashMap<u64, V>, mut build: impl FnMut(u64) -> V) -> u64 {
    loop {
        let id = random_id();
        if let Entry::Vacant(slot) = map.entry(id) {
            slot.insert(build(id));
            return id;
        }
    }
}
