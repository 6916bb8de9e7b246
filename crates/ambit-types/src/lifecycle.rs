//! Lifecycle capability traits for stateful scoped values.
//!
//! A pushed value may opt into observing its own push/fetch/snapshot
//! lifecycle by exposing a [`ScopeLifecycle`] implementation from
//! [`AmbientObject::lifecycle`]. Values that return `None` are stateless:
//! the engine skips every hook and stores no state for them.
//!
//! Capability detection is ordinary dynamic dispatch; no reflection over the
//! value's type graph happens anywhere.

use std::any::Any;
use std::sync::Arc;

/// Opaque state captured by a lifecycle hook and stored by the engine.
///
/// Inject state lives alongside the stack entry that produced it; snapshot
/// state lives inside the snapshot that captured it. Both are shared
/// immutably once handed to the engine.
pub type LifecycleState = Arc<dyn Any + Send + Sync>;

/// A value that can live on a scope stack behind shared ownership.
///
/// The `Any` supertrait gives callers typed access back out of the stack via
/// downcasting; `Send + Sync` lets values cross execution contexts through
/// fallback chains and snapshots.
pub trait AmbientObject: Any + Send + Sync {
    /// The value's lifecycle capability, if it has one.
    fn lifecycle(&self) -> Option<&dyn ScopeLifecycle> {
        None
    }
}

/// Hooks dispatched by the engine at the value's lifecycle points.
///
/// All methods default to no-ops so implementors override only the points
/// they care about.
pub trait ScopeLifecycle: Send + Sync {
    /// Called when the value is pushed. The returned state is stored with
    /// the entry and handed back to every later hook.
    fn on_push(&self) -> Option<LifecycleState> {
        None
    }

    /// Called when the value is fetched from a live stack.
    fn on_fetch(&self, _inject: Option<&LifecycleState>) {}

    /// Called when a snapshot captures the value. The returned state is the
    /// immutable captured copy stored inside the snapshot.
    fn on_snapshot(&self, _inject: Option<&LifecycleState>) -> Option<LifecycleState> {
        None
    }

    /// Called when the value is fetched out of a snapshot, with both the
    /// original inject state and the captured snapshot state.
    fn on_snapshot_fetch(
        &self,
        _inject: Option<&LifecycleState>,
        _snapshot: Option<&LifecycleState>,
    ) {
    }
}
