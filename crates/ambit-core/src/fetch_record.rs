//! Fetch records: where a fetched value was found.
//!
//! Outer resolution needs to answer "what was visible when this value was
//! originally found?", long after the fetch itself returned. The table maps
//! a value's reference identity to the (layer, sequence) at which the most
//! recent fetch found it. Re-fetching the same value nests: the displaced
//! record is saved and restored when the inner fetch releases.
//!
//! Records are kept by the stack on which `fetch` was invoked, never by the
//! layer that satisfied the lookup — fallback layers stay immutable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ambit_error::{AmbitError, Result};
use ambit_types::{SequenceNo, SharedValue, ValueIdentity};

use crate::scope_stack::ScopeStack;
use crate::snapshot::Snapshot;

/// The layer and position at which a fetch found its value.
#[derive(Clone)]
pub enum FoundIn {
    /// This stack, at the given sequence number.
    Local(SequenceNo),
    /// A fallback stack in the chain, at that stack's own sequence number.
    Layer(Arc<ScopeStack>, SequenceNo),
    /// A snapshot fallback; snapshots carry no push history.
    Snapshot(Arc<Snapshot>),
}

impl fmt::Debug for FoundIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(seq) => write!(f, "Local({seq})"),
            Self::Layer(stack, seq) => write!(f, "Layer({}, {seq})", stack.stack_id()),
            Self::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

/// One live fetch record, with the record it displaced (if any).
pub struct FetchRecord {
    pub(crate) found: FoundIn,
    /// Keeps the subject's allocation alive so its identity cannot be
    /// reused while the record exists.
    pub(crate) subject: SharedValue,
    pub(crate) prior: Option<Box<FetchRecord>>,
}

impl FetchRecord {
    /// Nesting depth of saved records under this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut cursor = self.prior.as_deref();
        while let Some(record) = cursor {
            depth += 1;
            cursor = record.prior.as_deref();
        }
        depth
    }
}

impl fmt::Debug for FetchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRecord")
            .field("found", &self.found)
            .field("subject", &self.subject.identity())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Identity-keyed table of live fetch records.
#[derive(Debug, Default)]
pub struct FetchRecordTable {
    records: HashMap<ValueIdentity, FetchRecord>,
}

impl FetchRecordTable {
    /// Record where `subject` was just found, saving any displaced record
    /// for restoration on release.
    pub(crate) fn record(&mut self, subject: SharedValue, found: FoundIn) {
        let identity = subject.identity();
        let prior = self.records.remove(&identity).map(Box::new);
        self.records.insert(
            identity,
            FetchRecord {
                found,
                subject,
                prior,
            },
        );
    }

    /// Where the most recent fetch found this identity.
    #[must_use]
    pub(crate) fn found_for(&self, identity: ValueIdentity) -> Option<&FoundIn> {
        self.records.get(&identity).map(|record| &record.found)
    }

    /// Release the innermost record for this identity, restoring the one it
    /// displaced.
    ///
    /// # Errors
    ///
    /// [`AmbitError::MissingFetchRecord`] when no record exists — the table
    /// was corrupted by misuse and the stack state is undefined.
    pub(crate) fn release(&mut self, identity: ValueIdentity) -> Result<()> {
        let record = self
            .records
            .remove(&identity)
            .ok_or(AmbitError::MissingFetchRecord { identity })?;
        if let Some(prior) = record.prior {
            self.records.insert(identity, *prior);
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
