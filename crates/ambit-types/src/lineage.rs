//! Static key-set expansion for wildcard pushes.
//!
//! A wildcard push injects one value under its own key plus every ancestor
//! and interface key the caller declares for it. The expansion is computed
//! once from this static description; the engine itself never walks a type
//! graph.

use smallvec::SmallVec;

use crate::Key;

/// Caller-supplied description of a key's ancestry.
///
/// `ancestors` are ordered root-ward (nearest ancestor first); `interfaces`
/// carry everything the declared key implements, directly or indirectly.
#[derive(Debug, Clone)]
pub struct KeyLineage {
    own: Key,
    ancestors: SmallVec<[Key; 4]>,
    interfaces: SmallVec<[Key; 4]>,
}

impl KeyLineage {
    /// A lineage with no ancestry: the wildcard degenerates to one key.
    #[must_use]
    pub fn new(own: Key) -> Self {
        Self {
            own,
            ancestors: SmallVec::new(),
            interfaces: SmallVec::new(),
        }
    }

    /// Append the next ancestor, root-ward.
    #[must_use]
    pub fn ancestor(mut self, key: Key) -> Self {
        self.ancestors.push(key);
        self
    }

    /// Append an implemented interface key.
    #[must_use]
    pub fn interface(mut self, key: Key) -> Self {
        self.interfaces.push(key);
        self
    }

    /// The value's own key.
    #[must_use]
    pub const fn own(&self) -> Key {
        self.own
    }

    /// The full deduplicated key set: own key first, then ancestors
    /// root-ward, then interfaces, each key at most once.
    #[must_use]
    pub fn expand(&self) -> KeySet {
        let mut set = KeySet::default();
        set.insert(self.own);
        for &key in &self.ancestors {
            set.insert(key);
        }
        for &key in &self.interfaces {
            set.insert(key);
        }
        set
    }
}

/// An ordered, duplicate-free set of keys.
///
/// Small enough to live inline in handles; order is insertion order, which
/// for an expanded lineage puts the most specific key first.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: SmallVec<[Key; 8]>,
}

impl KeySet {
    /// Insert a key, keeping first-insertion order. Returns `false` when the
    /// key was already present.
    pub fn insert(&mut self, key: Key) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    #[must_use]
    pub fn contains(&self, key: Key) -> bool {
        self.keys.contains(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Key] {
        &self.keys
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Key> + '_ {
        self.keys.iter().copied()
    }
}

impl<'a> IntoIterator for &'a KeySet {
    type Item = Key;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, Key>>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(id: u64) -> Key {
        Key::token(id, "k").unwrap()
    }

    #[test]
    fn test_expand_orders_own_first() {
        let lineage = KeyLineage::new(key(1))
            .ancestor(key(2))
            .ancestor(key(3))
            .interface(key(4));
        let set = lineage.expand();
        assert_eq!(set.as_slice(), &[key(1), key(2), key(3), key(4)]);
    }

    #[test]
    fn test_expand_dedups_shared_ancestry() {
        // A diamond: the interface repeats an ancestor.
        let lineage = KeyLineage::new(key(1))
            .ancestor(key(2))
            .interface(key(2))
            .interface(key(3));
        let set = lineage.expand();
        assert_eq!(set.len(), 3);
        assert_eq!(set.as_slice(), &[key(1), key(2), key(3)]);
    }

    #[test]
    fn test_degenerate_lineage_is_single_key() {
        let set = KeyLineage::new(key(9)).expand();
        assert_eq!(set.as_slice(), &[key(9)]);
    }

    #[test]
    fn test_keyset_insert_reports_duplicates() {
        let mut set = KeySet::default();
        assert!(set.insert(key(1)));
        assert!(!set.insert(key(1)));
        assert!(set.contains(key(1)));
        assert!(!set.contains(key(2)));
    }

    proptest! {
        #[test]
        fn prop_expand_is_duplicate_free_and_complete(
            own in 1_u64..20,
            ancestors in proptest::collection::vec(1_u64..20, 0..6),
            interfaces in proptest::collection::vec(1_u64..20, 0..6),
        ) {
            let mut lineage = KeyLineage::new(key(own));
            for &a in &ancestors {
                lineage = lineage.ancestor(key(a));
            }
            for &i in &interfaces {
                lineage = lineage.interface(key(i));
            }
            let set = lineage.expand();

            // Own key leads.
            prop_assert_eq!(set.as_slice()[0], key(own));
            // No duplicates.
            for (i, &a) in set.as_slice().iter().enumerate() {
                for &b in &set.as_slice()[i + 1..] {
                    prop_assert_ne!(a, b);
                }
            }
            // Every declared key is present.
            for &a in ancestors.iter().chain(&interfaces) {
                prop_assert!(set.contains(key(a)));
            }
        }
    }
}
