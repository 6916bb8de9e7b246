//! Immutable point-in-time captures of the visible value set.
//!
//! A snapshot holds exactly one entry per key: the topmost entry visible at
//! capture time across a stack and (optionally) its fallback chain, with the
//! state its `on_snapshot` hook returned. Snapshots are independent of the
//! stacks that produced them, freely shared across execution contexts, and
//! can seed a brand-new stack without re-running push side effects.

use std::collections::HashMap;
use std::fmt;

use ambit_error::{AmbitError, Result};
use ambit_types::{Key, LifecycleState, ScopedValue};

use crate::hook;

/// One captured entry: the payload plus its inject and snapshot states.
#[derive(Clone)]
pub(crate) struct SnapshotEntry {
    pub(crate) value: ScopedValue,
    pub(crate) inject_state: Option<LifecycleState>,
    pub(crate) snapshot_state: Option<LifecycleState>,
}

/// An immutable capture of the topmost visible entry per key.
pub struct Snapshot {
    entries: HashMap<Key, SnapshotEntry>,
}

impl Snapshot {
    pub(crate) fn from_entries(entries: HashMap<Key, SnapshotEntry>) -> Self {
        Self { entries }
    }

    /// Fetch a captured value, dispatching its snapshot-fetch hook.
    ///
    /// An explicit-absence capture behaves exactly like a live stack: the
    /// key is present but the fetch reports [`AmbitError::NotFound`].
    ///
    /// # Errors
    ///
    /// [`AmbitError::NotFound`] when the key was not captured or captured
    /// as explicit absence.
    pub fn fetch(&self, key: Key) -> Result<ScopedValue> {
        match self.entries.get(&key) {
            None => Err(AmbitError::NotFound { key }),
            Some(entry) if entry.value.is_absent() => Err(AmbitError::NotFound { key }),
            Some(entry) => {
                hook::on_snapshot_fetch(
                    &entry.value,
                    entry.inject_state.as_ref(),
                    entry.snapshot_state.as_ref(),
                );
                Ok(entry.value.clone())
            }
        }
    }

    /// Whether the key was captured (including explicit-absence captures).
    #[must_use]
    pub fn contains(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.entries.keys().copied()
    }

    pub(crate) fn entry(&self, key: Key) -> Option<&SnapshotEntry> {
        self.entries.get(&key)
    }

    /// Merge captured entries into a capture under construction; keys the
    /// child already captured win.
    pub(crate) fn merge_into(&self, out: &mut HashMap<Key, SnapshotEntry>) {
        for (key, entry) in &self.entries {
            out.entry(*key).or_insert_with(|| entry.clone());
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("entry_count", &self.entries.len())
            .finish_non_exhaustive()
    }
}
