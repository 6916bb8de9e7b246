//! Scope handles: single-use tokens returned by push and fetch operations.
//!
//! A handle carries enough to validate and perform exact-reverse-order
//! release: the owning stack's id, the sequence number minted at open, and
//! the key set. Handles are consumed by value on release, so releasing one
//! twice is unrepresentable rather than a runtime check.

use ambit_types::{Key, KeySet, SequenceNo, SharedValue, StackId};

/// Token for one open single-key push.
#[must_use = "an open scope must be closed, in exact reverse push order"]
#[derive(Debug)]
pub struct PushHandle {
    pub(crate) stack: StackId,
    pub(crate) seq: SequenceNo,
    pub(crate) key: Key,
}

impl PushHandle {
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn sequence(&self) -> SequenceNo {
        self.seq
    }

    #[must_use]
    pub fn stack(&self) -> StackId {
        self.stack
    }
}

/// Token for one open multi-key push (wildcard or batch).
///
/// All keys share a single sequence number; closing removes every one of
/// them at once.
#[must_use = "an open scope must be closed, in exact reverse push order"]
#[derive(Debug)]
pub struct MultiHandle {
    pub(crate) stack: StackId,
    pub(crate) seq: SequenceNo,
    pub(crate) keys: KeySet,
}

impl MultiHandle {
    #[must_use]
    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    #[must_use]
    pub fn sequence(&self) -> SequenceNo {
        self.seq
    }

    #[must_use]
    pub fn stack(&self) -> StackId {
        self.stack
    }
}

/// Token for one fetch.
///
/// For reference-identity values it keeps the subject alive, pinning its
/// identity until the fetch record is released. Fetches of by-value
/// payloads carry no record and release as a no-op.
#[must_use = "a fetch should be released so nested re-fetch records unwind"]
#[derive(Debug)]
pub struct FetchHandle {
    pub(crate) stack: StackId,
    pub(crate) subject: Option<SharedValue>,
}

impl FetchHandle {
    /// Whether a fetch record backs this handle.
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.subject.is_some()
    }

    #[must_use]
    pub fn stack(&self) -> StackId {
        self.stack
    }
}
