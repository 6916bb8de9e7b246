//! Foundation types for the ambit scoped-value resolution engine.
//!
//! This crate defines the cross-cutting vocabulary shared by the engine and
//! its callers: keys, sequence numbers, stack identities, the scoped value
//! model, wildcard key lineage, and the lifecycle capability traits.

pub mod lifecycle;
pub mod lineage;
pub mod value;

pub use lifecycle::{AmbientObject, LifecycleState, ScopeLifecycle};
pub use lineage::{KeyLineage, KeySet};
pub use value::{PlainValue, ScopedValue, SharedValue, ValueIdentity};

use std::any::TypeId;
use std::fmt;
use std::num::NonZeroU64;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Opaque identity tag used to index scoped values.
///
/// Keys are compared by identity only; the stack never performs subtype
/// search. Subtype-aware injection is expressed by pushing one value under
/// many keys (see [`KeyLineage`]).
///
/// Two forms exist: a type tag ([`Key::of`]) and a caller-minted token
/// ([`Key::token`]). Both carry a static label for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(KeyRepr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum KeyRepr {
    Type(TypeId, &'static str),
    Token(NonZeroU64, &'static str),
}

impl Key {
    /// The key for a Rust type.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(KeyRepr::Type(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
        ))
    }

    /// A caller-minted token key.
    ///
    /// Returns `None` when `id` is 0. Token ids live in a namespace disjoint
    /// from type keys; callers are responsible for their uniqueness.
    #[must_use]
    pub const fn token(id: u64, label: &'static str) -> Option<Self> {
        match NonZeroU64::new(id) {
            Some(nz) => Some(Self(KeyRepr::Token(nz, label))),
            None => None,
        }
    }

    /// Diagnostic label: the type name or the token label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self.0 {
            KeyRepr::Type(_, name) | KeyRepr::Token(_, name) => name,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            KeyRepr::Type(_, name) => write!(f, "key<{name}>"),
            KeyRepr::Token(id, name) => write!(f, "key:{name}#{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// SequenceNo
// ---------------------------------------------------------------------------

/// Monotonically increasing push-order marker within one scope stack.
///
/// Starts at 0 and never rewinds: closing a scope does not reuse its
/// sequence number, which is what keeps historical binary search valid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SequenceNo(u64);

impl SequenceNo {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SequenceNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StackId
// ---------------------------------------------------------------------------

/// Process-unique identity of one scope stack.
///
/// Carried inside handles so a handle presented to the wrong stack is
/// rejected instead of silently corrupting another stack's bracket order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StackId(NonZeroU64);

impl StackId {
    /// Construct from a raw id. Returns `None` when `raw` is 0.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SequencedEntry
// ---------------------------------------------------------------------------

/// One pushed value: its push-order marker, key, payload, and any state the
/// value's `on_push` hook returned.
///
/// Within one per-key stack, sequence numbers strictly increase bottom to
/// top; two entries for the same key never share a sequence number.
#[derive(Clone)]
pub struct SequencedEntry {
    pub seq: SequenceNo,
    pub key: Key,
    pub value: ScopedValue,
    pub inject_state: Option<LifecycleState>,
}

impl fmt::Debug for SequencedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencedEntry")
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("has_inject_state", &self.inject_state.is_some())
            .finish()
    }
}
