//! Scoped value resolution: push named values onto an ambient, per-context
//! stack, resolve the innermost one, and close exactly what you opened, in
//! exact reverse order.
//!
//! Beyond the basic bracket discipline, the engine supports injecting one
//! value under a whole key lineage ([`ScopeStack::push_wildcard`]), atomic
//! multi-key groups ([`ScopeStack::batch`]), recovering the view a value was
//! born into ([`ScopeStack::fetch_outer`]), read-only fallback chaining
//! between stacks, and immutable snapshots that can seed a stack on another
//! execution context.
//!
//! ```
//! use ambit::{Key, Reach, ScopeStack};
//!
//! let mut stack = ScopeStack::new();
//! let key = Key::token(1, "greeting").expect("nonzero token");
//!
//! let scope = stack.push(key, "hello")?;
//! let (value, fetched) = stack.fetch(key, Reach::Local)?;
//! assert_eq!(value.as_plain().and_then(|p| p.as_text()), Some("hello"));
//! stack.close_fetch(fetched)?;
//! stack.close(scope)?;
//! # Ok::<(), ambit::AmbitError>(())
//! ```

pub use ambit_core::{
    Batch, FallbackLayer, FetchHandle, FetchRecord, FetchRecordTable, FoundIn, KeyedStack,
    MultiHandle, PushHandle, Reach, ScopeStack, Snapshot,
};
pub use ambit_error::{AmbitError, Result};
pub use ambit_types::{
    AmbientObject, Key, KeyLineage, KeySet, LifecycleState, PlainValue, ScopeLifecycle,
    ScopedValue, SequenceNo, SequencedEntry, SharedValue, StackId, ValueIdentity,
};
