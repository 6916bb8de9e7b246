//! Wildcard atomicity, batch mutual non-priority, and randomized
//! batch/wildcard interleavings of the duplicate-at-level check.

use std::collections::HashMap;

use ambit::{
    AmbientObject, AmbitError, Key, KeyLineage, PlainValue, Reach, ScopeStack, ScopedValue,
    SharedValue, ValueIdentity,
};
use proptest::prelude::*;

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
fn wildcard_covers_lineage_and_restores_prior_state() {
    let mut stack = ScopeStack::new();

    // One lineage key already carries a value.
    let base = stack.push(key(2), 5_i64).unwrap();

    let lineage = KeyLineage::new(key(1)).ancestor(key(2)).ancestor(key(3));
    let value = SharedValue::new(Obj);
    let identity = value.identity();
    let wildcard = stack.push_wildcard(value, &lineage).unwrap();

    for k in [key(1), key(2), key(3)] {
        let (got, fetched) = stack.fetch(k, Reach::Local).unwrap();
        assert_eq!(got.as_shared().unwrap().identity(), identity);
        stack.close_fetch(fetched).unwrap();
    }

    // One close removes all three simultaneously and reveals what was
    // visible before the wildcard.
    stack.close_many(wildcard).unwrap();
    assert!(stack.peek(key(1), Reach::Local).is_none());
    assert_eq!(int(&stack.peek(key(2), Reach::Local).unwrap()), 5);
    assert!(stack.peek(key(3), Reach::Local).is_none());

    stack.close(base).unwrap();
}

#[test]
fn batch_keys_never_shadow_each_other() {
    let mut stack = ScopeStack::new();

    let mut batch = stack.batch();
    batch.push(key(1), 1_i64).unwrap();
    batch.push(key(2), 2_i64).unwrap();
    let group = batch.finish();

    // Both resolve while the batch is open, in either order.
    let (b, fb) = stack.fetch(key(2), Reach::Local).unwrap();
    let (a, fa) = stack.fetch(key(1), Reach::Local).unwrap();
    assert_eq!(int(&a), 1);
    assert_eq!(int(&b), 2);
    stack.close_fetch(fa).unwrap();
    stack.close_fetch(fb).unwrap();

    stack.close_many(group).unwrap();
    assert!(stack.peek(key(1), Reach::Local).is_none());
    assert!(stack.peek(key(2), Reach::Local).is_none());
}

#[test]
fn wildcard_collision_is_atomic() {
    let mut stack = ScopeStack::new();

    let mut batch = stack.batch();
    batch.push(key(2), 1_i64).unwrap();

    // This wildcard's ancestor collides; its own key must not land either.
    let err = batch
        .push_wildcard(
            SharedValue::new(Obj),
            &KeyLineage::new(key(1)).ancestor(key(2)),
        )
        .unwrap_err();
    assert!(matches!(err, AmbitError::DuplicateAtLevel { .. }));

    let group = batch.finish();
    assert!(stack.peek(key(1), Reach::Local).is_none());
    stack.close_many(group).unwrap();
}

// ---------------------------------------------------------------------------
// Randomized interleavings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Contribution {
    Single(u64, i64),
    Wildcard { own: u64, ancestors: Vec<u64> },
}

#[derive(Debug, Clone, PartialEq)]
enum Expected {
    Int(i64),
    Shared(ValueIdentity),
}

impl Contribution {
    fn key_set(&self) -> Vec<u64> {
        match self {
            Self::Single(k, _) => vec![*k],
            Self::Wildcard { own, ancestors } => {
                let mut keys = vec![*own];
                for &a in ancestors {
                    if !keys.contains(&a) {
                        keys.push(a);
                    }
                }
                keys
            }
        }
    }
}

fn contribution_strategy() -> impl Strategy<Value = Contribution> {
    prop_oneof![
        (1_u64..7, -100_i64..100).prop_map(|(k, v)| Contribution::Single(k, v)),
        (1_u64..7, proptest::collection::vec(1_u64..7, 0..3))
            .prop_map(|(own, ancestors)| Contribution::Wildcard { own, ancestors }),
    ]
}

proptest! {
    /// Any interleaving of single and wildcard contributions either lands
    /// cleanly or fails with DuplicateAtLevel leaving every per-key top and
    /// the sequence counter untouched.
    #[test]
    fn prop_batch_interleavings_fail_atomically(
        ops in proptest::collection::vec(contribution_strategy(), 1..12),
    ) {
        let mut stack = ScopeStack::new();
        let baseline_seq = stack.sequence();

        let mut visible: HashMap<u64, Expected> = HashMap::new();
        let mut batch = stack.batch();

        for op in &ops {
            let keys = op.key_set();
            let collides = keys.iter().any(|k| visible.contains_key(k));

            match op {
                Contribution::Single(k, v) => {
                    let outcome = batch.push(key(*k), *v);
                    if collides {
                        prop_assert!(
                            matches!(outcome.unwrap_err(), AmbitError::DuplicateAtLevel { .. }),
                            "expected DuplicateAtLevel"
                        );
                    } else {
                        prop_assert!(outcome.is_ok());
                        visible.insert(*k, Expected::Int(*v));
                    }
                }
                Contribution::Wildcard { own, ancestors } => {
                    let lineage = ancestors
                        .iter()
                        .fold(KeyLineage::new(key(*own)), |l, &a| l.ancestor(key(a)));
                    let value = SharedValue::new(Obj);
                    let identity = value.identity();
                    let outcome = batch.push_wildcard(value, &lineage);
                    if collides {
                        prop_assert!(
                            matches!(outcome.unwrap_err(), AmbitError::DuplicateAtLevel { .. }),
                            "expected DuplicateAtLevel"
                        );
                    } else {
                        prop_assert!(outcome.is_ok());
                        for k in keys {
                            visible.insert(k, Expected::Shared(identity));
                        }
                    }
                }
            }

            prop_assert_eq!(batch.len(), visible.len());
        }

        let group = batch.finish();

        // The surviving contributions, and only those, are visible.
        for k in 1..7_u64 {
            let got = stack.peek(key(k), Reach::Local);
            match visible.get(&k) {
                None => prop_assert!(got.is_none()),
                Some(Expected::Int(v)) => {
                    prop_assert_eq!(int(&got.unwrap()), *v);
                }
                Some(Expected::Shared(identity)) => {
                    prop_assert_eq!(got.unwrap().as_shared().unwrap().identity(), *identity);
                }
            }
        }

        // Exactly one sequence number was spent iff anything landed.
        let spent = u64::from(!visible.is_empty());
        prop_assert_eq!(stack.sequence().get(), baseline_seq.get() + spent);

        stack.close_many(group).unwrap();
        for k in 1..7_u64 {
            prop_assert!(stack.peek(key(k), Reach::Local).is_none());
        }
    }
}
