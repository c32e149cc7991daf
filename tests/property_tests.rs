//! Property-based tests for element-session
//!
//! - Test constraint invariants over generated tuples
//! - Test cascade and restriction properties over generated tables
//! - Run with ProptestConfig::with_cases(100)

use std::collections::BTreeSet;
use std::sync::Arc;

use element_session::error::ConstraintKind;
use element_session::query::Restriction;
use element_session::schema::{
    ActivationHandle, Attribute, AttributeType, Entity, EntityDefinition, OnDelete, Reference, Row,
    SchemaBuilder, SchemaModule, SchemaRegistry, Value,
};
use element_session::store::{MemoryRecordStore, RecordStore};
use proptest::prelude::*;

// ============================================================================
// Fixture
// ============================================================================

struct Trials;

impl SchemaModule for Trials {
    fn name(&self) -> &str {
        "trials"
    }

    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> element_session::Result<()> {
        let subject = schema.define(
            EntityDefinition::manual("Subject")
                .primary(Attribute::new("subject_id", AttributeType::Int))
                .secondary(Attribute::new("label", AttributeType::Varchar(12)))
                .secondary(Attribute::new("score", AttributeType::Int).nullable()),
        )?;
        schema.define(
            EntityDefinition::manual("Session")
                .reference(Reference::to(&subject).on_delete(OnDelete::Cascade))
                .primary(Attribute::new("session_id", AttributeType::Int))
                .with_part(
                    EntityDefinition::part("Attribute")
                        .primary(Attribute::new("attribute_name", AttributeType::Varchar(32))),
                ),
        )?;
        Ok(())
    }
}

struct Fixture {
    store: MemoryRecordStore,
    subject: Arc<Entity>,
    session: Arc<Entity>,
    attribute: Arc<Entity>,
}

fn fixture() -> Fixture {
    let registry = SchemaRegistry::default();
    let handle = registry
        .activate("p_", &(Arc::new(Trials) as ActivationHandle))
        .unwrap();
    Fixture {
        subject: handle.get("Subject").unwrap(),
        session: handle.get("Session").unwrap(),
        attribute: handle.get("Session.Attribute").unwrap(),
        store: MemoryRecordStore::new(registry),
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Subjects: distinct ids with optional scores.
fn arb_subjects() -> impl Strategy<Value = Vec<(i64, Option<i64>)>> {
    proptest::collection::btree_map(-500i64..500, proptest::option::of(-100i64..100), 0..40)
        .prop_map(|m| m.into_iter().collect())
}

/// Per subject: number of sessions, and attributes per session.
fn arb_tree() -> impl Strategy<Value = Vec<Vec<usize>>> {
    proptest::collection::vec(proptest::collection::vec(0usize..4, 0..5), 1..6)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: varchar(n) accepts exactly the strings of at most n characters
    #[test]
    fn prop_varchar_length_enforced(label in "[a-zé]{0,20}") {
        let f = fixture();
        let row = Row::new().with("subject_id", 1).with("label", label.as_str());
        let result = block_on(f.store.insert(&f.subject, row));
        if label.chars().count() <= 12 {
            prop_assert!(result.is_ok());
        } else {
            let err = result.unwrap_err();
            prop_assert_eq!(err.violation().map(|v| v.kind), Some(ConstraintKind::ValueTooLong));
            prop_assert!(f.store.is_empty(&f.subject).unwrap());
        }
    }

    /// Property: fetch returns rows in ascending key order, each exactly once
    #[test]
    fn prop_fetch_in_key_order(subjects in arb_subjects()) {
        let f = fixture();
        let mut shuffled = subjects.clone();
        shuffled.reverse();
        block_on(async {
            for (id, score) in &shuffled {
                let row = Row::new().with("subject_id", *id).with("label", "s").with("score", *score);
                f.store.insert(&f.subject, row).await.unwrap();
            }
        });
        let fetched = block_on(f.store.fetch(&f.subject, Restriction::All)).unwrap();
        let ids: Vec<i64> = fetched
            .iter()
            .filter_map(|row| row.get("subject_id").and_then(Value::as_int))
            .collect();
        let expected: Vec<i64> = subjects.iter().map(|(id, _)| *id).collect();
        prop_assert_eq!(ids, expected);
    }

    /// Property: a condition, its negation and the NULL rows partition the table
    #[test]
    fn prop_three_valued_partition(subjects in arb_subjects(), pivot in -100i64..100) {
        let f = fixture();
        block_on(async {
            for (id, score) in &subjects {
                let row = Row::new().with("subject_id", *id).with("label", "s").with("score", *score);
                f.store.insert(&f.subject, row).await.unwrap();
            }
        });
        let condition = Restriction::condition(format!("score < {pivot}"));
        let count = |r: Restriction| block_on(f.store.fetch(&f.subject, r)).unwrap().count();

        let matching = count(condition.clone());
        let negated = count(condition.not());
        let nulls = count(Restriction::condition("score IS NULL"));
        prop_assert_eq!(matching + negated + nulls, subjects.len());
        prop_assert_eq!(
            matching,
            subjects.iter().filter(|(_, s)| s.is_some_and(|s| s < pivot)).count()
        );
    }

    /// Property: key restriction selects exactly the record with that key
    #[test]
    fn prop_key_restriction_selects_one(subjects in arb_subjects(), probe in -500i64..500) {
        let f = fixture();
        block_on(async {
            for (id, _) in &subjects {
                let row = Row::new().with("subject_id", *id).with("label", "s");
                f.store.insert(&f.subject, row).await.unwrap();
            }
        });
        let key = Row::new().with("subject_id", probe);
        let fetched = block_on(f.store.fetch(&f.subject, Restriction::key(key.clone()))).unwrap();
        let present = subjects.iter().any(|(id, _)| *id == probe);
        prop_assert_eq!(fetched.count(), usize::from(present));
        prop_assert_eq!(f.store.get(&f.subject, &key).unwrap().is_some(), present);
    }

    /// Property: deleting a subject removes exactly its cascade set
    #[test]
    fn prop_cascade_removes_exactly_descendants(tree in arb_tree(), victim in 0usize..6) {
        let f = fixture();
        let victim = victim % tree.len();
        block_on(async {
            for (subject_id, sessions) in tree.iter().enumerate() {
                let subject_id = i64::try_from(subject_id).unwrap();
                f.store
                    .insert(&f.subject, Row::new().with("subject_id", subject_id).with("label", "s"))
                    .await
                    .unwrap();
                for (session_id, attributes) in sessions.iter().enumerate() {
                    let key = Row::new()
                        .with("subject_id", subject_id)
                        .with("session_id", i64::try_from(session_id).unwrap());
                    f.store.insert(&f.session, key.clone()).await.unwrap();
                    for a in 0..*attributes {
                        f.store
                            .insert(&f.attribute, key.clone().with("attribute_name", format!("a{a}")))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let victim_id = i64::try_from(victim).unwrap();
        let summary = block_on(
            f.store.delete(&f.subject, &Row::new().with("subject_id", victim_id)),
        )
        .unwrap();

        let sessions = tree[victim].len();
        let attributes: usize = tree[victim].iter().sum();
        prop_assert_eq!(summary.deleted("p_trials.Subject"), 1);
        prop_assert_eq!(summary.deleted("p_trials.Session"), sessions);
        prop_assert_eq!(summary.deleted("p_trials.Session.Attribute"), attributes);

        let remaining_attributes: usize = tree.iter().flatten().sum::<usize>() - attributes;
        prop_assert_eq!(f.store.len(&f.attribute).unwrap(), remaining_attributes);
        let owners: BTreeSet<i64> = block_on(f.store.fetch(&f.session, Restriction::All))
            .unwrap()
            .iter()
            .filter_map(|row| row.get("subject_id").and_then(Value::as_int))
            .collect();
        prop_assert!(!owners.contains(&victim_id));
    }
}
