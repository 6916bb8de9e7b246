//! The ambit scope-stack engine.
//!
//! A [`ScopeStack`] lets code push named values onto an ambient, per-context
//! stack, have inner code retrieve the most recently pushed value for a key,
//! and remove exactly the values it pushed, in exact reverse order. On top of
//! that bracket discipline it supports wildcard pushes (one value under a
//! whole key lineage), atomic multi-key batches, outer-scope resolution
//! ("what was visible when this value was pushed?"), read-only fallback
//! chaining between stacks, and immutable point-in-time snapshots.
//!
//! One stack exists per execution context and is mutated only through
//! `&mut self`; sharing a stack as a fallback (`Arc`) freezes it, so the
//! no-mutation-while-shared precondition is enforced by the type system
//! rather than by locks.

pub mod batch;
pub mod fetch_record;
pub mod handle;
mod hook;
pub mod keyed_stack;
pub mod scope_stack;
pub mod snapshot;

pub use batch::Batch;
pub use fetch_record::{FetchRecord, FetchRecordTable, FoundIn};
pub use handle::{FetchHandle, MultiHandle, PushHandle};
pub use keyed_stack::KeyedStack;
pub use scope_stack::{FallbackLayer, Reach, ScopeStack};
pub use snapshot::Snapshot;
