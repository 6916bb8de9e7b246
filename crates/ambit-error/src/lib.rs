//! Error taxonomy for the ambit scoped-value resolution engine.
//!
//! Two classes exist and they propagate differently:
//!
//! - [`AmbitError::NotFound`] is an expected, recoverable result: the key has
//!   no visible value (or an explicit absence shadows it).
//! - Everything else is caller misuse or state corruption. `DuplicateAtLevel`
//!   is surfaced at push time and leaves the stack untouched. The
//!   close-discipline variants (`CloseOrderViolation`, `MissingFetchRecord`,
//!   `StaleHandle`) mean the stack's bracket structure no longer matches
//!   reality; continued use after one of these is undefined and the stack
//!   should be torn down and rebuilt.
//!
//! The engine never swallows a structural violation, and a release failure
//! never replaces an error already in flight: scoped helpers surface both
//! through [`AmbitError::ReleaseFailure`].

use thiserror::Error;

use ambit_types::{Key, SequenceNo, StackId, ValueIdentity};

/// Primary error type for scope-stack operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmbitError {
    /// No visible value for the key. Recoverable; the only variant callers
    /// are expected to branch on.
    #[error("no scoped value visible for {key}")]
    NotFound { key: Key },

    /// Two pushes targeted the same key at the same sequence instant
    /// (same-key contributions to one batch, or colliding wildcard ancestor
    /// keys). The failed call left the stack unchanged.
    #[error("duplicate scoped value for {key} at {seq}")]
    DuplicateAtLevel { key: Key, seq: SequenceNo },

    /// A scope handle was closed out of exact reverse push order. The stack
    /// is in an undefined state from this point.
    #[error("close-order violation on {stack}: {detail}")]
    CloseOrderViolation { stack: StackId, detail: String },

    /// A fetch record was already gone when its handle was released. Only
    /// reachable through misuse; the record table is corrupt.
    #[error("fetch record missing on release for {identity:?}")]
    MissingFetchRecord { identity: ValueIdentity },

    /// A handle was presented to a stack that did not create it.
    #[error("handle belongs to {handle_stack}, not {stack}")]
    StaleHandle {
        handle_stack: StackId,
        stack: StackId,
    },

    /// Outer resolution was asked about a value that was never fetched
    /// through this stack.
    #[error("value has no fetch record on this stack")]
    NoFetchRecord,

    /// Outer resolution was asked about a by-value or absent payload;
    /// only reference-identity values carry fetch records.
    #[error("outer resolution requires a reference-identity value")]
    NotReferenceType,

    /// A scoped release failed while another error was already in flight.
    /// Both are preserved; neither replaces the other.
    #[error("scope release failed while another error was in flight: {release} (primary: {primary})")]
    ReleaseFailure {
        primary: Box<AmbitError>,
        release: Box<AmbitError>,
    },
}

impl AmbitError {
    /// Whether this is the expected, recoverable miss (as opposed to misuse
    /// or state corruption).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the stack must be considered corrupt after this error.
    #[must_use]
    pub const fn is_state_corruption(&self) -> bool {
        matches!(
            self,
            Self::CloseOrderViolation { .. }
                | Self::MissingFetchRecord { .. }
                | Self::StaleHandle { .. }
        )
    }
}

/// Result alias used across the workspace.
pub type Result<T, E = AmbitError> = std::result::Result<T, E>;
