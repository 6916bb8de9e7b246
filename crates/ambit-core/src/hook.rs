//! Lifecycle hook dispatch.
//!
//! Only `Shared` payloads can carry the capability; `Plain` and `Absent`
//! payloads are stateless and every dispatch below is a no-op for them.

use ambit_types::{LifecycleState, ScopedValue};

pub(crate) fn on_push(value: &ScopedValue) -> Option<LifecycleState> {
    let lifecycle = value.as_shared()?.lifecycle()?;
    lifecycle.on_push()
}

pub(crate) fn on_fetch(value: &ScopedValue, inject: Option<&LifecycleState>) {
    if let Some(lifecycle) = value.as_shared().and_then(|sv| sv.lifecycle()) {
        lifecycle.on_fetch(inject);
    }
}

pub(crate) fn on_snapshot(
    value: &ScopedValue,
    inject: Option<&LifecycleState>,
) -> Option<LifecycleState> {
    let lifecycle = value.as_shared()?.lifecycle()?;
    lifecycle.on_snapshot(inject)
}

pub(crate) fn on_snapshot_fetch(
    value: &ScopedValue,
    inject: Option<&LifecycleState>,
    snapshot: Option<&LifecycleState>,
) {
    if let Some(lifecycle) = value.as_shared().and_then(|sv| sv.lifecycle()) {
        lifecycle.on_snapshot_fetch(inject, snapshot);
    }
}
