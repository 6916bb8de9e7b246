//! The per-context scope stack: push, fetch, outer-fetch, close, snapshot.
//!
//! Exactly one `ScopeStack` exists per independent execution context. All
//! mutation goes through `&mut self`; a stack shared as a fallback sits
//! behind an `Arc` and can only be read, which is precisely the contract a
//! fallback must obey. No operation blocks or locks.
//!
//! Ordering discipline: every push mints a sequence number from a counter
//! that only ever moves forward, and every open scope is tracked in a
//! bracket LIFO. Closing must match the innermost bracket exactly — like
//! nested brackets in source text, scopes close in exact reverse open
//! order or the stack is declared corrupt.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use ambit_error::{AmbitError, Result};
use ambit_types::{
    Key, KeyLineage, KeySet, LifecycleState, ScopedValue, SequenceNo, SequencedEntry, SharedValue,
    StackId,
};

use crate::batch::Batch;
use crate::fetch_record::{FetchRecordTable, FoundIn};
use crate::handle::{FetchHandle, MultiHandle, PushHandle};
use crate::hook;
use crate::keyed_stack::KeyedStack;
use crate::snapshot::{Snapshot, SnapshotEntry};

// ---------------------------------------------------------------------------
// Reach / FallbackLayer
// ---------------------------------------------------------------------------

/// How far a lookup may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reach {
    /// This stack only.
    Local,
    /// This stack, then the fallback chain, outermost layer last.
    Chained,
}

/// A read-only layer consulted when a lookup misses locally.
#[derive(Clone)]
pub enum FallbackLayer {
    /// A live parent stack, frozen by shared ownership for the duration of
    /// the sharing.
    Stack(Arc<ScopeStack>),
    /// A point-in-time capture seeding this stack's reads.
    Snapshot(Arc<Snapshot>),
}

impl fmt::Debug for FallbackLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack(stack) => write!(f, "Stack({})", stack.stack_id()),
            Self::Snapshot(snap) => write!(f, "Snapshot(len={})", snap.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// ScopeStack
// ---------------------------------------------------------------------------

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

fn mint_stack_id() -> StackId {
    let raw = NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed);
    StackId::new(raw).expect("stack id counter overflowed u64")
}

/// One execution context's scope stack.
pub struct ScopeStack {
    stack_id: StackId,
    /// Next sequence number to assign. Never rewinds.
    seq: SequenceNo,
    stacks: HashMap<Key, KeyedStack>,
    fetch_records: FetchRecordTable,
    /// Sequence numbers of open scopes, innermost last.
    open_brackets: SmallVec<[SequenceNo; 8]>,
    fallback: Option<FallbackLayer>,
    snapshot_cache: SnapshotCache,
}

impl ScopeStack {
    /// A root stack with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::with_layer(None)
    }

    /// A stack that reads through to a frozen parent stack on local misses.
    #[must_use]
    pub fn with_fallback(fallback: Arc<ScopeStack>) -> Self {
        Self::with_layer(Some(FallbackLayer::Stack(fallback)))
    }

    /// A stack seeded from a snapshot: local misses read the capture,
    /// without re-running any push side effects.
    #[must_use]
    pub fn from_snapshot(snapshot: Arc<Snapshot>) -> Self {
        Self::with_layer(Some(FallbackLayer::Snapshot(snapshot)))
    }

    fn with_layer(fallback: Option<FallbackLayer>) -> Self {
        Self {
            stack_id: mint_stack_id(),
            seq: SequenceNo::ZERO,
            stacks: HashMap::new(),
            fetch_records: FetchRecordTable::default(),
            open_brackets: SmallVec::new(),
            fallback,
            snapshot_cache: SnapshotCache::default(),
        }
    }

    #[must_use]
    pub fn stack_id(&self) -> StackId {
        self.stack_id
    }

    /// The next sequence number a push would use.
    #[must_use]
    pub fn sequence(&self) -> SequenceNo {
        self.seq
    }

    /// Number of scopes currently open (push brackets not yet closed).
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.open_brackets.len()
    }

    /// Number of live fetch records.
    #[must_use]
    pub fn recorded_fetches(&self) -> usize {
        self.fetch_records.len()
    }

    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    // -- push ---------------------------------------------------------------

    /// Push a value for `key`, opening a scope.
    ///
    /// # Errors
    ///
    /// [`AmbitError::DuplicateAtLevel`] when the key's innermost entry
    /// already carries the sequence number this push would use (two
    /// simultaneous pushes targeting one key); the stack is left unchanged.
    pub fn push(&mut self, key: Key, value: impl Into<ScopedValue>) -> Result<PushHandle> {
        let seq = self.seq;
        self.push_entry(seq, key, value.into())?;
        self.open_brackets.push(seq);
        self.seq = seq.next();
        tracing::trace!(stack = %self.stack_id, %key, seq = seq.get(), "scope_push");
        Ok(PushHandle {
            stack: self.stack_id,
            seq,
            key,
        })
    }

    /// Push one value under its whole key lineage at a single sequence
    /// number, opening one scope covering every expanded key.
    ///
    /// The call is atomic: every key is checked before any entry lands, so
    /// a failure leaves the stack untouched.
    ///
    /// # Errors
    ///
    /// [`AmbitError::DuplicateAtLevel`] when any expanded key collides at
    /// this sequence instant.
    pub fn push_wildcard(
        &mut self,
        value: SharedValue,
        lineage: &KeyLineage,
    ) -> Result<MultiHandle> {
        let keys = lineage.expand();
        let seq = self.seq;
        self.push_key_set(seq, &keys, &value)?;
        self.open_brackets.push(seq);
        self.seq = seq.next();
        tracing::trace!(
            stack = %self.stack_id,
            own = %lineage.own(),
            key_count = keys.len(),
            seq = seq.get(),
            "scope_push_wildcard"
        );
        Ok(MultiHandle {
            stack: self.stack_id,
            seq,
            keys,
        })
    }

    /// Begin an atomic multi-key batch. All contributions share one
    /// sequence number and none shadows another; the exclusive borrow keeps
    /// unrelated pushes from interleaving while the batch is open.
    pub fn batch(&mut self) -> Batch<'_> {
        Batch::new(self)
    }

    pub(crate) fn push_entry(&mut self, seq: SequenceNo, key: Key, value: ScopedValue) -> Result<()> {
        if self.top_collides(key, seq) {
            tracing::warn!(stack = %self.stack_id, %key, seq = seq.get(), "scope_push: duplicate at level");
            return Err(AmbitError::DuplicateAtLevel { key, seq });
        }
        self.push_entry_unchecked(seq, key, value);
        Ok(())
    }

    pub(crate) fn push_key_set(
        &mut self,
        seq: SequenceNo,
        keys: &KeySet,
        value: &SharedValue,
    ) -> Result<()> {
        for key in keys {
            if self.top_collides(key, seq) {
                tracing::warn!(stack = %self.stack_id, %key, seq = seq.get(), "scope_push: duplicate at level in key set");
                return Err(AmbitError::DuplicateAtLevel { key, seq });
            }
        }
        for key in keys {
            self.push_entry_unchecked(seq, key, ScopedValue::Shared(value.clone()));
        }
        Ok(())
    }

    fn top_collides(&self, key: Key, seq: SequenceNo) -> bool {
        self.stacks
            .get(&key)
            .and_then(KeyedStack::latest)
            .map_or(false, |top| top.seq == seq)
    }

    fn push_entry_unchecked(&mut self, seq: SequenceNo, key: Key, value: ScopedValue) {
        let inject_state = hook::on_push(&value);
        self.stacks.entry(key).or_default().push(SequencedEntry {
            seq,
            key,
            value,
            inject_state,
        });
        self.snapshot_cache.clear();
    }

    // -- fetch --------------------------------------------------------------

    /// Fetch the innermost visible value for `key`.
    ///
    /// An entry pushed as explicit absence blocks: the fetch reports
    /// [`AmbitError::NotFound`] without consulting any outer layer, which is
    /// how a scope deliberately hides an outer value.
    ///
    /// For reference-identity values a fetch record is written (displacing
    /// and saving any existing record for the same identity), enabling
    /// later outer resolution; release the returned handle with
    /// [`ScopeStack::close_fetch`] to unwind it.
    ///
    /// # Errors
    ///
    /// [`AmbitError::NotFound`] when no layer within `reach` has a visible
    /// value.
    pub fn fetch(&mut self, key: Key, reach: Reach) -> Result<(ScopedValue, FetchHandle)> {
        let local = match self.stacks.get(&key).and_then(KeyedStack::latest) {
            Some(entry) if entry.value.is_absent() => {
                return Err(AmbitError::NotFound { key });
            }
            Some(entry) => Some((entry.value.clone(), entry.inject_state.clone(), entry.seq)),
            None => None,
        };
        if let Some((value, inject, seq)) = local {
            return Ok(self.admit_entry(value, inject.as_ref(), FoundIn::Local(seq)));
        }
        if reach == Reach::Chained {
            if let ChainOutcome::Hit(hit) = chain_lookup(self.fallback.as_ref(), key) {
                return Ok(self.admit_chain_hit(hit));
            }
        }
        Err(AmbitError::NotFound { key })
    }

    /// Resolve what was visible for `outer_key` at the moment `subject`
    /// itself became visible.
    ///
    /// `subject` must have been fetched through this stack; the search runs
    /// in the layer that satisfied that fetch, strictly below the sequence
    /// number it was found at — an entry pushed at or after that instant is
    /// never returned. When the layer has nothing older and `reach` allows
    /// it, the layer's own fallback chain is consulted with plain fetch
    /// semantics (fallback layers carry no further outer history).
    ///
    /// # Errors
    ///
    /// - [`AmbitError::NotReferenceType`] for by-value or absent subjects.
    /// - [`AmbitError::NoFetchRecord`] when `subject` was never fetched
    ///   through this stack.
    /// - [`AmbitError::NotFound`] when nothing older is visible.
    pub fn fetch_outer(
        &mut self,
        subject: &ScopedValue,
        outer_key: Key,
        reach: Reach,
    ) -> Result<(ScopedValue, FetchHandle)> {
        let shared = subject.as_shared().ok_or(AmbitError::NotReferenceType)?;
        let found = self
            .fetch_records
            .found_for(shared.identity())
            .cloned()
            .ok_or(AmbitError::NoFetchRecord)?;

        match found {
            FoundIn::Local(origin) => {
                let below = match self
                    .stacks
                    .get(&outer_key)
                    .and_then(|ks| ks.latest_below(origin))
                {
                    Some(entry) if entry.value.is_absent() => {
                        return Err(AmbitError::NotFound { key: outer_key });
                    }
                    Some(entry) => {
                        Some((entry.value.clone(), entry.inject_state.clone(), entry.seq))
                    }
                    None => None,
                };
                if let Some((value, inject, seq)) = below {
                    return Ok(self.admit_entry(value, inject.as_ref(), FoundIn::Local(seq)));
                }
                if reach == Reach::Chained {
                    if let ChainOutcome::Hit(hit) = chain_lookup(self.fallback.as_ref(), outer_key)
                    {
                        return Ok(self.admit_chain_hit(hit));
                    }
                }
                Err(AmbitError::NotFound { key: outer_key })
            }
            FoundIn::Layer(layer, origin) => {
                let below = match layer
                    .stacks
                    .get(&outer_key)
                    .and_then(|ks| ks.latest_below(origin))
                {
                    Some(entry) if entry.value.is_absent() => {
                        return Err(AmbitError::NotFound { key: outer_key });
                    }
                    Some(entry) => {
                        Some((entry.value.clone(), entry.inject_state.clone(), entry.seq))
                    }
                    None => None,
                };
                if let Some((value, inject, seq)) = below {
                    let found = FoundIn::Layer(Arc::clone(&layer), seq);
                    return Ok(self.admit_entry(value, inject.as_ref(), found));
                }
                if reach == Reach::Chained {
                    if let ChainOutcome::Hit(hit) = chain_lookup(layer.fallback.as_ref(), outer_key)
                    {
                        return Ok(self.admit_chain_hit(hit));
                    }
                }
                Err(AmbitError::NotFound { key: outer_key })
            }
            FoundIn::Snapshot(snap) => match snap.entry(outer_key) {
                None => Err(AmbitError::NotFound { key: outer_key }),
                Some(entry) if entry.value.is_absent() => {
                    Err(AmbitError::NotFound { key: outer_key })
                }
                Some(entry) => {
                    hook::on_snapshot_fetch(
                        &entry.value,
                        entry.inject_state.as_ref(),
                        entry.snapshot_state.as_ref(),
                    );
                    let value = entry.value.clone();
                    let handle = self.record_fetch(&value, FoundIn::Snapshot(Arc::clone(&snap)));
                    Ok((value, handle))
                }
            },
        }
    }

    /// Visibility probe: the innermost visible value within `reach`,
    /// without hook dispatch or fetch-record bookkeeping.
    #[must_use]
    pub fn peek(&self, key: Key, reach: Reach) -> Option<ScopedValue> {
        match self.stacks.get(&key).and_then(KeyedStack::latest) {
            Some(entry) if entry.value.is_absent() => return None,
            Some(entry) => return Some(entry.value.clone()),
            None => {}
        }
        if reach == Reach::Chained {
            if let ChainOutcome::Hit(hit) = chain_lookup(self.fallback.as_ref(), key) {
                return Some(hit.value);
            }
        }
        None
    }

    fn admit_entry(
        &mut self,
        value: ScopedValue,
        inject: Option<&LifecycleState>,
        found: FoundIn,
    ) -> (ScopedValue, FetchHandle) {
        hook::on_fetch(&value, inject);
        let handle = self.record_fetch(&value, found);
        (value, handle)
    }

    fn admit_chain_hit(&mut self, hit: ChainHit) -> (ScopedValue, FetchHandle) {
        hit.dispatch_hook();
        let ChainHit { value, found, .. } = hit;
        let handle = self.record_fetch(&value, found);
        (value, handle)
    }

    fn record_fetch(&mut self, value: &ScopedValue, found: FoundIn) -> FetchHandle {
        match value.as_shared() {
            Some(shared) => {
                self.fetch_records.record(shared.clone(), found);
                FetchHandle {
                    stack: self.stack_id,
                    subject: Some(shared.clone()),
                }
            }
            None => FetchHandle {
                stack: self.stack_id,
                subject: None,
            },
        }
    }

    // -- close --------------------------------------------------------------

    /// Close a single-key scope. Must be the innermost open scope.
    ///
    /// # Errors
    ///
    /// - [`AmbitError::StaleHandle`] when the handle belongs to another
    ///   stack.
    /// - [`AmbitError::CloseOrderViolation`] when this is not the innermost
    ///   open scope; the stack is in an undefined state afterwards.
    pub fn close(&mut self, handle: PushHandle) -> Result<()> {
        let PushHandle { stack, seq, key } = handle;
        self.close_bracket(stack, seq, std::slice::from_ref(&key))
    }

    /// Close a multi-key scope, removing every key's entry at once.
    ///
    /// # Errors
    ///
    /// Same as [`ScopeStack::close`].
    pub fn close_many(&mut self, handle: MultiHandle) -> Result<()> {
        let MultiHandle { stack, seq, keys } = handle;
        if keys.is_empty() {
            // A batch that never contributed opened no bracket.
            return Ok(());
        }
        self.close_bracket(stack, seq, keys.as_slice())
    }

    fn close_bracket(&mut self, handle_stack: StackId, seq: SequenceNo, keys: &[Key]) -> Result<()> {
        if handle_stack != self.stack_id {
            tracing::warn!(
                stack = %self.stack_id,
                handle_stack = %handle_stack,
                "scope_close: handle from another stack"
            );
            return Err(AmbitError::StaleHandle {
                handle_stack,
                stack: self.stack_id,
            });
        }
        match self.open_brackets.last().copied() {
            Some(innermost) if innermost == seq => {}
            Some(innermost) => {
                tracing::warn!(
                    stack = %self.stack_id,
                    handle_seq = seq.get(),
                    innermost = innermost.get(),
                    "scope_close: out of order"
                );
                return Err(AmbitError::CloseOrderViolation {
                    stack: self.stack_id,
                    detail: format!(
                        "handle opened at {seq} but the innermost open scope is {innermost}"
                    ),
                });
            }
            None => {
                tracing::warn!(stack = %self.stack_id, handle_seq = seq.get(), "scope_close: no scope open");
                return Err(AmbitError::CloseOrderViolation {
                    stack: self.stack_id,
                    detail: format!("handle opened at {seq} but no scope is open"),
                });
            }
        }
        for &key in keys {
            match self.stacks.get_mut(&key).and_then(KeyedStack::pop) {
                Some(entry) if entry.seq == seq => {}
                Some(entry) => {
                    return Err(AmbitError::CloseOrderViolation {
                        stack: self.stack_id,
                        detail: format!("popped {} for {key}, expected {seq}", entry.seq),
                    });
                }
                None => {
                    return Err(AmbitError::CloseOrderViolation {
                        stack: self.stack_id,
                        detail: format!("nothing to pop for {key} at {seq}"),
                    });
                }
            }
        }
        self.open_brackets.pop();
        self.snapshot_cache.clear();
        tracing::trace!(stack = %self.stack_id, seq = seq.get(), key_count = keys.len(), "scope_close");
        Ok(())
    }

    /// Release a fetch, restoring the record the fetch displaced.
    ///
    /// # Errors
    ///
    /// - [`AmbitError::StaleHandle`] when the handle belongs to another
    ///   stack.
    /// - [`AmbitError::MissingFetchRecord`] when the record is already gone
    ///   (table corrupted by misuse).
    pub fn close_fetch(&mut self, handle: FetchHandle) -> Result<()> {
        let FetchHandle { stack, subject } = handle;
        if stack != self.stack_id {
            return Err(AmbitError::StaleHandle {
                handle_stack: stack,
                stack: self.stack_id,
            });
        }
        match subject {
            None => Ok(()),
            Some(shared) => self.fetch_records.release(shared.identity()),
        }
    }

    // -- scoped helpers -----------------------------------------------------

    /// Push, run `f`, and close on every exit path. A release failure never
    /// replaces an error `f` already raised; both surface through
    /// [`AmbitError::ReleaseFailure`].
    ///
    /// # Errors
    ///
    /// Push errors, `f`'s error, close errors, or both of the latter.
    pub fn with_value<T>(
        &mut self,
        key: Key,
        value: impl Into<ScopedValue>,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let handle = self.push(key, value)?;
        let outcome = f(self);
        let released = self.close(handle);
        join_release(outcome, released)
    }

    /// Wildcard-push, run `f`, and close on every exit path; error handling
    /// as in [`ScopeStack::with_value`].
    ///
    /// # Errors
    ///
    /// Push errors, `f`'s error, close errors, or both of the latter.
    pub fn with_wildcard<T>(
        &mut self,
        value: SharedValue,
        lineage: &KeyLineage,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let handle = self.push_wildcard(value, lineage)?;
        let outcome = f(self);
        let released = self.close_many(handle);
        join_release(outcome, released)
    }

    // -- snapshot -----------------------------------------------------------

    /// The current snapshot, cached until the next push or close on this
    /// stack. Mutations of fallback layers do not invalidate the cache;
    /// fallbacks are frozen for the duration of the sharing.
    pub fn snapshot(&mut self, reach: Reach) -> Arc<Snapshot> {
        if let Some(cached) = self.snapshot_cache.get(reach) {
            return cached;
        }
        let snap = Arc::new(self.capture(reach));
        self.snapshot_cache.put(reach, Arc::clone(&snap));
        snap
    }

    /// Build a snapshot without touching the cache. Usable on a shared
    /// (fallback) stack, which cannot be borrowed mutably.
    #[must_use]
    pub fn capture(&self, reach: Reach) -> Snapshot {
        let mut entries = HashMap::new();
        self.collect_tops(&mut entries);
        if reach == Reach::Chained {
            let mut layer = self.fallback.as_ref();
            while let Some(current) = layer {
                match current {
                    FallbackLayer::Stack(stack) => {
                        stack.collect_tops(&mut entries);
                        layer = stack.fallback.as_ref();
                    }
                    FallbackLayer::Snapshot(snap) => {
                        snap.merge_into(&mut entries);
                        layer = None;
                    }
                }
            }
        }
        tracing::debug!(stack = %self.stack_id, entry_count = entries.len(), "snapshot_capture");
        Snapshot::from_entries(entries)
    }

    /// Capture this stack's own top entries into a map under construction;
    /// keys already present (from an inner layer) win.
    fn collect_tops(&self, out: &mut HashMap<Key, SnapshotEntry>) {
        for (key, keyed) in &self.stacks {
            if out.contains_key(key) {
                continue;
            }
            let Some(entry) = keyed.latest() else {
                continue;
            };
            let snapshot_state = hook::on_snapshot(&entry.value, entry.inject_state.as_ref());
            out.insert(
                *key,
                SnapshotEntry {
                    value: entry.value.clone(),
                    inject_state: entry.inject_state.clone(),
                    snapshot_state,
                },
            );
        }
    }

    // -- batch support ------------------------------------------------------

    pub(crate) fn seal_batch(&mut self, seq: SequenceNo, keys: KeySet) -> MultiHandle {
        if !keys.is_empty() {
            self.open_brackets.push(seq);
            self.seq = seq.next();
        }
        tracing::trace!(stack = %self.stack_id, seq = seq.get(), key_count = keys.len(), "batch_seal");
        MultiHandle {
            stack: self.stack_id,
            seq,
            keys,
        }
    }

    pub(crate) fn rollback_entry(&mut self, key: Key, seq: SequenceNo) {
        let popped = self.stacks.get_mut(&key).and_then(KeyedStack::pop);
        debug_assert!(
            popped.as_ref().map_or(false, |entry| entry.seq == seq),
            "batch rollback popped a mismatched entry"
        );
        let _ = popped;
        self.snapshot_cache.clear();
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStack")
            .field("stack_id", &self.stack_id)
            .field("sequence", &self.seq)
            .field("key_count", &self.stacks.len())
            .field("open_scopes", &self.open_brackets.len())
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl Drop for ScopeStack {
    fn drop(&mut self) {
        if !self.open_brackets.is_empty() {
            tracing::warn!(
                stack = %self.stack_id,
                open_scopes = self.open_brackets.len(),
                "scope stack dropped with open scopes"
            );
        }
    }
}

fn join_release<T>(outcome: Result<T>, released: Result<()>) -> Result<T> {
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(release),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(release)) => Err(AmbitError::ReleaseFailure {
            primary: Box::new(primary),
            release: Box::new(release),
        }),
    }
}

// ---------------------------------------------------------------------------
// Fallback chain lookup
// ---------------------------------------------------------------------------

enum ChainOutcome {
    Hit(ChainHit),
    /// An explicit-absence entry shadows everything further out.
    Blocked,
    Miss,
}

struct ChainHit {
    value: ScopedValue,
    found: FoundIn,
    hook: HookPoint,
}

enum HookPoint {
    Fetch {
        inject: Option<LifecycleState>,
    },
    SnapshotFetch {
        inject: Option<LifecycleState>,
        snapshot: Option<LifecycleState>,
    },
}

impl ChainHit {
    fn dispatch_hook(&self) {
        match &self.hook {
            HookPoint::Fetch { inject } => hook::on_fetch(&self.value, inject.as_ref()),
            HookPoint::SnapshotFetch { inject, snapshot } => {
                hook::on_snapshot_fetch(&self.value, inject.as_ref(), snapshot.as_ref());
            }
        }
    }
}

/// Walk the fallback chain outward looking for `key`, read-only.
fn chain_lookup(start: Option<&FallbackLayer>, key: Key) -> ChainOutcome {
    let mut layer = start;
    while let Some(current) = layer {
        match current {
            FallbackLayer::Stack(stack) => {
                match stack.stacks.get(&key).and_then(KeyedStack::latest) {
                    Some(entry) if entry.value.is_absent() => return ChainOutcome::Blocked,
                    Some(entry) => {
                        return ChainOutcome::Hit(ChainHit {
                            value: entry.value.clone(),
                            found: FoundIn::Layer(Arc::clone(stack), entry.seq),
                            hook: HookPoint::Fetch {
                                inject: entry.inject_state.clone(),
                            },
                        });
                    }
                    None => layer = stack.fallback.as_ref(),
                }
            }
            FallbackLayer::Snapshot(snap) => {
                return match snap.entry(key) {
                    Some(entry) if entry.value.is_absent() => ChainOutcome::Blocked,
                    Some(entry) => ChainOutcome::Hit(ChainHit {
                        value: entry.value.clone(),
                        found: FoundIn::Snapshot(Arc::clone(snap)),
                        hook: HookPoint::SnapshotFetch {
                            inject: entry.inject_state.clone(),
                            snapshot: entry.snapshot_state.clone(),
                        },
                    }),
                    None => ChainOutcome::Miss,
                };
            }
        }
    }
    ChainOutcome::Miss
}

// ---------------------------------------------------------------------------
// Snapshot cache
// ---------------------------------------------------------------------------

/// One cached capture per reach mode; any mutation clears both.
#[derive(Debug, Default)]
struct SnapshotCache {
    local: Option<Arc<Snapshot>>,
    chained: Option<Arc<Snapshot>>,
}

impl SnapshotCache {
    fn get(&self, reach: Reach) -> Option<Arc<Snapshot>> {
        match reach {
            Reach::Local => self.local.clone(),
            Reach::Chained => self.chained.clone(),
        }
    }

    fn put(&mut self, reach: Reach, snap: Arc<Snapshot>) {
        match reach {
            Reach::Local => self.local = Some(snap),
            Reach::Chained => self.chained = Some(snap),
        }
    }

    fn clear(&mut self) {
        self.local = None;
        self.chained = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use ambit_types::{AmbientObject, PlainValue, ScopeLifecycle};

    fn key(id: u64) -> Key {
        Key::token(id, "k").unwrap()
    }

    fn int(value: &ScopedValue) -> i64 {
        value
            .as_plain()
            .and_then(PlainValue::as_integer)
            .expect("integer payload")
    }

    struct Obj;
    impl AmbientObject for Obj {}

    #[test]
    fn test_push_fetch_close_roundtrip() {
        let mut stack = ScopeStack::new();
        let handle = stack.push(key(1), 10_i64).unwrap();
        let (value, fetched) = stack.fetch(key(1), Reach::Local).unwrap();
        assert_eq!(int(&value), 10);
        stack.close_fetch(fetched).unwrap();
        stack.close(handle).unwrap();
        assert!(stack.fetch(key(1), Reach::Local).unwrap_err().is_not_found());
        assert_eq!(stack.open_scopes(), 0);
    }

    #[test]
    fn test_inner_push_shadows_outer() {
        let mut stack = ScopeStack::new();
        let outer = stack.push(key(1), 1_i64).unwrap();
        let inner = stack.push(key(1), 2_i64).unwrap();
        let (value, f) = stack.fetch(key(1), Reach::Local).unwrap();
        assert_eq!(int(&value), 2);
        stack.close_fetch(f).unwrap();
        stack.close(inner).unwrap();
        let (value, f) = stack.fetch(key(1), Reach::Local).unwrap();
        assert_eq!(int(&value), 1);
        stack.close_fetch(f).unwrap();
        stack.close(outer).unwrap();
    }

    #[test]
    fn test_absence_blocks_fallback() {
        let mut parent = ScopeStack::new();
        let _outer = parent.push(key(1), 7_i64).unwrap();
        let parent = Arc::new(parent);

        let mut child = ScopeStack::with_fallback(Arc::clone(&parent));
        let block = child.push(key(1), ScopedValue::Absent).unwrap();
        assert!(child
            .fetch(key(1), Reach::Chained)
            .unwrap_err()
            .is_not_found());

        child.close(block).unwrap();
        let (value, f) = child.fetch(key(1), Reach::Chained).unwrap();
        assert_eq!(int(&value), 7);
        child.close_fetch(f).unwrap();
    }

    #[test]
    fn test_fallback_chain_two_deep() {
        let mut root = ScopeStack::new();
        let _a = root.push(key(1), 1_i64).unwrap();
        let root = Arc::new(root);

        let mut mid = ScopeStack::with_fallback(Arc::clone(&root));
        let _b = mid.push(key(2), 2_i64).unwrap();
        let mid = Arc::new(mid);

        let mut leaf = ScopeStack::with_fallback(Arc::clone(&mid));
        let (value, f) = leaf.fetch(key(1), Reach::Chained).unwrap();
        assert_eq!(int(&value), 1);
        leaf.close_fetch(f).unwrap();
        let (value, f) = leaf.fetch(key(2), Reach::Chained).unwrap();
        assert_eq!(int(&value), 2);
        leaf.close_fetch(f).unwrap();

        // Local reach never crosses into the chain.
        assert!(leaf.fetch(key(1), Reach::Local).unwrap_err().is_not_found());
    }

    #[test]
    fn test_close_out_of_order_is_violation() {
        let mut stack = ScopeStack::new();
        let first = stack.push(key(1), 1_i64).unwrap();
        let _second = stack.push(key(2), 2_i64).unwrap();
        let err = stack.close(first).unwrap_err();
        assert!(err.is_state_corruption());
        assert!(matches!(err, AmbitError::CloseOrderViolation { .. }));
    }

    #[test]
    fn test_handle_from_other_stack_is_stale() {
        let mut a = ScopeStack::new();
        let mut b = ScopeStack::new();
        let handle = a.push(key(1), 1_i64).unwrap();
        let err = b.close(handle).unwrap_err();
        assert!(matches!(err, AmbitError::StaleHandle { .. }));
        assert_eq!(b.open_scopes(), 0, "failed close must not touch the stack");
    }

    #[test]
    fn test_wildcard_visible_under_every_key() {
        let mut stack = ScopeStack::new();
        let lineage = KeyLineage::new(key(1)).ancestor(key(2)).interface(key(3));
        let value = SharedValue::new(Obj);
        let identity = value.identity();
        let handle = stack.push_wildcard(value, &lineage).unwrap();

        for k in [key(1), key(2), key(3)] {
            let (value, f) = stack.fetch(k, Reach::Local).unwrap();
            assert_eq!(value.as_shared().unwrap().identity(), identity);
            stack.close_fetch(f).unwrap();
        }

        stack.close_many(handle).unwrap();
        for k in [key(1), key(2), key(3)] {
            assert!(stack.fetch(k, Reach::Local).unwrap_err().is_not_found());
        }
    }

    #[test]
    fn test_outer_resolution_local() {
        let mut stack = ScopeStack::new();
        let _outer10 = stack.push(key(1), 10_i64).unwrap();
        let _subject = stack.push(key(2), ScopedValue::shared(Obj)).unwrap();
        let (subject, subject_fetch) = stack.fetch(key(2), Reach::Local).unwrap();
        let _outer20 = stack.push(key(1), 20_i64).unwrap();

        // The subject's birth-time view of key 1 is 10, never 20.
        let (value, f) = stack.fetch_outer(&subject, key(1), Reach::Local).unwrap();
        assert_eq!(int(&value), 10);
        stack.close_fetch(f).unwrap();
        stack.close_fetch(subject_fetch).unwrap();
    }

    #[test]
    fn test_outer_resolution_requires_reference() {
        let mut stack = ScopeStack::new();
        let plain = ScopedValue::plain(5_i64);
        let err = stack.fetch_outer(&plain, key(1), Reach::Local).unwrap_err();
        assert!(matches!(err, AmbitError::NotReferenceType));

        let never_fetched = ScopedValue::shared(Obj);
        let err = stack
            .fetch_outer(&never_fetched, key(1), Reach::Local)
            .unwrap_err();
        assert!(matches!(err, AmbitError::NoFetchRecord));
    }

    #[test]
    fn test_snapshot_cached_until_mutation() {
        let mut stack = ScopeStack::new();
        let handle = stack.push(key(1), 1_i64).unwrap();
        let first = stack.snapshot(Reach::Local);
        let second = stack.snapshot(Reach::Local);
        assert!(Arc::ptr_eq(&first, &second), "cache must return the same capture");

        let inner = stack.push(key(2), 2_i64).unwrap();
        let third = stack.snapshot(Reach::Local);
        assert!(!Arc::ptr_eq(&first, &third), "push must invalidate the cache");

        stack.close(inner).unwrap();
        let fourth = stack.snapshot(Reach::Local);
        assert!(!Arc::ptr_eq(&third, &fourth), "close must invalidate the cache");
        stack.close(handle).unwrap();
    }

    #[test]
    fn test_from_snapshot_seeds_reads() {
        let mut origin = ScopeStack::new();
        let _h = origin.push(key(1), 42_i64).unwrap();
        let snap = origin.snapshot(Reach::Local);

        let mut seeded = ScopeStack::from_snapshot(snap);
        let (value, f) = seeded.fetch(key(1), Reach::Chained).unwrap();
        assert_eq!(int(&value), 42);
        seeded.close_fetch(f).unwrap();

        // Local pushes shadow the seed.
        let h = seeded.push(key(1), 1_i64).unwrap();
        let (value, f) = seeded.fetch(key(1), Reach::Chained).unwrap();
        assert_eq!(int(&value), 1);
        seeded.close_fetch(f).unwrap();
        seeded.close(h).unwrap();
    }

    #[test]
    fn test_with_value_closes_on_error() {
        let mut stack = ScopeStack::new();
        let err = stack
            .with_value(key(1), 1_i64, |inner| {
                assert_eq!(inner.open_scopes(), 1);
                Err::<(), _>(AmbitError::NotFound { key: key(9) })
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(stack.open_scopes(), 0, "scope must close on the error path");
    }

    #[test]
    fn test_peek_has_no_side_effects() {
        let mut stack = ScopeStack::new();
        let _h = stack.push(key(1), ScopedValue::shared(Obj)).unwrap();
        assert!(stack.peek(key(1), Reach::Local).is_some());
        assert_eq!(stack.recorded_fetches(), 0);
        assert!(stack.peek(key(2), Reach::Local).is_none());
    }

    // -- lifecycle dispatch --------------------------------------------------

    #[derive(Default)]
    struct Probe {
        pushes: AtomicU32,
        fetches: AtomicU32,
        snapshots: AtomicU32,
        snapshot_fetches: AtomicU32,
    }

    impl AmbientObject for Probe {
        fn lifecycle(&self) -> Option<&dyn ScopeLifecycle> {
            Some(self)
        }
    }

    impl ScopeLifecycle for Probe {
        fn on_push(&self) -> Option<LifecycleState> {
            self.pushes.fetch_add(1, Ordering::Relaxed);
            Some(Arc::new(7_u32))
        }

        fn on_fetch(&self, inject: Option<&LifecycleState>) {
            assert!(inject.is_some_and(|s| s.downcast_ref::<u32>() == Some(&7)));
            self.fetches.fetch_add(1, Ordering::Relaxed);
        }

        fn on_snapshot(&self, inject: Option<&LifecycleState>) -> Option<LifecycleState> {
            assert!(inject.is_some());
            self.snapshots.fetch_add(1, Ordering::Relaxed);
            Some(Arc::new("captured"))
        }

        fn on_snapshot_fetch(
            &self,
            inject: Option<&LifecycleState>,
            snapshot: Option<&LifecycleState>,
        ) {
            assert!(inject.is_some());
            assert!(snapshot.is_some_and(|s| s.downcast_ref::<&str>() == Some(&"captured")));
            self.snapshot_fetches.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_lifecycle_hooks_dispatch() {
        let probe = SharedValue::new(Probe::default());
        let mut stack = ScopeStack::new();
        let handle = stack
            .push(key(1), ScopedValue::Shared(probe.clone()))
            .unwrap();

        let (_, f) = stack.fetch(key(1), Reach::Local).unwrap();
        stack.close_fetch(f).unwrap();

        let snap = stack.snapshot(Reach::Local);
        let _ = snap.fetch(key(1)).unwrap();

        let typed = probe.downcast_ref::<Probe>().unwrap();
        assert_eq!(typed.pushes.load(Ordering::Relaxed), 1);
        assert_eq!(typed.fetches.load(Ordering::Relaxed), 1);
        assert_eq!(typed.snapshots.load(Ordering::Relaxed), 1);
        assert_eq!(typed.snapshot_fetches.load(Ordering::Relaxed), 1);

        stack.close(handle).unwrap();
    }

    #[test]
    fn test_stateless_value_skips_hooks() {
        let mut stack = ScopeStack::new();
        let handle = stack.push(key(1), ScopedValue::shared(Obj)).unwrap();
        let (value, f) = stack.fetch(key(1), Reach::Local).unwrap();
        assert!(value.as_shared().is_some());
        stack.close_fetch(f).unwrap();
        stack.close(handle).unwrap();
    }

    #[test]
    fn test_stack_is_send_and_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ScopeStack>();
        assert_send_sync::<Snapshot>();
    }
}
