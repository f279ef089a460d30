//! The one ordering both listing producers must agree on.
//!
//! Remote keys and local relative paths are compared by their UTF-8 byte
//! representation. Rust's `str` ordering already is byte-lexicographic, but
//! the reconciler's cursor alignment depends on two independent producers
//! sorting identically, so the comparator is pinned here by name instead of
//! being an implementation detail of `Ord for str`.

use std::cmp::Ordering;

/// Lexicographic comparison over the UTF-8 encodings of two strings.
///
/// A directory entry `D/` sorts strictly before any of its descendants
/// `D/x`: the separator byte of the shorter string is compared against
/// itself and the shorter string wins on length.
pub fn cmp_utf8(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}
