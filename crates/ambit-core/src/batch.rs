//! Atomic multi-key pushes.
//!
//! Every contribution to a batch lands at the batch's single sequence
//! number, so no contributed key shadows another: fetching any of them sees
//! the rest as pushed at the same instant. The batch borrows its stack
//! mutably, which is what guarantees no unrelated push interleaves while it
//! is open.
//!
//! `finish` seals the batch into one multi-key handle; dropping an
//! unfinished batch rolls its contributions back.

use std::mem;

use ambit_error::Result;
use ambit_types::{Key, KeyLineage, KeySet, ScopedValue, SequenceNo, SharedValue};

use crate::handle::MultiHandle;
use crate::scope_stack::ScopeStack;

/// Accumulator for one atomic multi-key push.
#[must_use = "finish the batch to obtain its handle; dropping rolls it back"]
pub struct Batch<'a> {
    stack: &'a mut ScopeStack,
    seq: SequenceNo,
    keys: KeySet,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(stack: &'a mut ScopeStack) -> Self {
        let seq = stack.sequence();
        Self {
            stack,
            seq,
            keys: KeySet::default(),
        }
    }

    /// The sequence number every contribution shares.
    #[must_use]
    pub fn sequence(&self) -> SequenceNo {
        self.seq
    }

    /// Number of keys contributed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Contribute one key.
    ///
    /// # Errors
    ///
    /// [`ambit_error::AmbitError::DuplicateAtLevel`] when the key was
    /// already contributed to this batch; the failed contribution leaves the
    /// batch (and the stack) as they were, earlier contributions stand.
    pub fn push(&mut self, key: Key, value: impl Into<ScopedValue>) -> Result<()> {
        debug_assert_eq!(
            self.stack.sequence(),
            self.seq,
            "stack sequence moved while a batch was open"
        );
        self.stack.push_entry(self.seq, key, value.into())?;
        self.keys.insert(key);
        Ok(())
    }

    /// Contribute a value under its whole key lineage.
    ///
    /// # Errors
    ///
    /// [`ambit_error::AmbitError::DuplicateAtLevel`] when any expanded key
    /// collides with one already in the batch (including two wildcards
    /// sharing an ancestor); the whole contribution is rejected atomically.
    pub fn push_wildcard(&mut self, value: SharedValue, lineage: &KeyLineage) -> Result<()> {
        debug_assert_eq!(
            self.stack.sequence(),
            self.seq,
            "stack sequence moved while a batch was open"
        );
        let expanded = lineage.expand();
        self.stack.push_key_set(self.seq, &expanded, &value)?;
        for key in &expanded {
            self.keys.insert(key);
        }
        Ok(())
    }

    /// Seal the batch into one multi-key handle covering every contributed
    /// key. A batch with no contributions mints no scope: its handle closes
    /// as a no-op.
    pub fn finish(mut self) -> MultiHandle {
        let keys = mem::take(&mut self.keys);
        let seq = self.seq;
        let handle = self.stack.seal_batch(seq, keys);
        mem::forget(self);
        handle
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        for key in self.keys.iter().rev() {
            self.stack.rollback_entry(key, self.seq);
        }
        tracing::debug!(
            stack = %self.stack.stack_id(),
            seq = self.seq.get(),
            key_count = self.keys.len(),
            "batch dropped unfinished; contributions rolled back"
        );
    }
}
