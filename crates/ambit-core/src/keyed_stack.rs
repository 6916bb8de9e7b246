//! Per-key LIFO backed by an append-only array.
//!
//! Pushes are monotonic in sequence number, so the backing array is always
//! sorted and historical lookups ("the entry most recently pushed before
//! sequence N") are a binary search, no re-sorting ever.

use ambit_types::{SequencedEntry, SequenceNo};

/// One key's stack of entries, innermost last.
#[derive(Debug, Default)]
pub struct KeyedStack {
    entries: Vec<SequencedEntry>,
}

impl KeyedStack {
    /// Append an entry. The caller guarantees its sequence number is
    /// strictly greater than the current top's.
    pub(crate) fn push(&mut self, entry: SequencedEntry) {
        debug_assert!(
            self.entries.last().map_or(true, |top| top.seq < entry.seq),
            "KeyedStack::push: non-ascending sequence number"
        );
        self.entries.push(entry);
    }

    /// The innermost entry, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&SequencedEntry> {
        self.entries.last()
    }

    /// Remove and return the innermost entry.
    pub(crate) fn pop(&mut self) -> Option<SequencedEntry> {
        self.entries.pop()
    }

    /// The entry with the greatest sequence number strictly below `bound`.
    ///
    /// This is the outer-resolution primitive: "what was visible for this
    /// key at the instant `bound` was minted". Ties are excluded — an entry
    /// pushed exactly at `bound` is never returned.
    #[must_use]
    pub fn latest_below(&self, bound: SequenceNo) -> Option<&SequencedEntry> {
        let idx = self.entries.partition_point(|e| e.seq < bound);
        idx.checked_sub(1).map(|i| &self.entries[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
