//! Property-based tests for operator semantics and store invariants

mod common;

use common::*;
use proptest::prelude::*;
use rebac_engine::*;
use std::collections::BTreeSet;

const OPERATOR_SCHEMA: &str = r#"
    definition user {}
    definition doc {
        relation a: user
        relation b: user
        permission either = a + b
        permission both = a & b
        permission only_a = a - b
    }
"#;

/// (doc index, relation is `a`, user index)
type Fact = (usize, bool, usize);

fn arb_facts() -> impl Strategy<Value = BTreeSet<Fact>> {
    prop::collection::btree_set((0..3usize, any::<bool>(), 0..3usize), 0..12)
}

fn relationship(fact: &Fact) -> String {
    let (doc, is_a, user) = *fact;
    format!("doc:d{}#{}@user:u{}", doc, if is_a { "a" } else { "b" }, user)
}

fn touches(facts: &BTreeSet<Fact>) -> Vec<RelationshipUpdate> {
    facts.iter().map(|fact| touch(&relationship(fact))).collect()
}

async fn visible(engine: &AuthorizationEngine, consistency: &Consistency) -> BTreeSet<String> {
    engine
        .read_relationships(&RelationshipFilter::new(), consistency)
        .await
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn expected(facts: &BTreeSet<Fact>) -> BTreeSet<String> {
    facts.iter().map(relationship).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Union, intersection and exclusion agree with set semantics
    #[test]
    fn prop_operator_semantics(facts in arb_facts()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = create_test_engine(OPERATOR_SCHEMA).await;
            engine.write_relationships(touches(&facts)).await.unwrap();

            for doc in 0..3 {
                for user in 0..3 {
                    let has_a = facts.contains(&(doc, true, user));
                    let has_b = facts.contains(&(doc, false, user));
                    let who = format!("user:u{}", user);
                    let resource = format!("doc:d{}", doc);

                    assert_eq!(check(&engine, &who, "either", &resource).await, has_a || has_b);
                    assert_eq!(check(&engine, &who, "both", &resource).await, has_a && has_b);
                    assert_eq!(check(&engine, &who, "only_a", &resource).await, has_a && !has_b);
                }
            }
        });
    }

    /// Touching the same relationships twice leaves the same visible set
    #[test]
    fn prop_touch_is_idempotent(facts in arb_facts()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = create_test_engine(OPERATOR_SCHEMA).await;

            engine.write_relationships(touches(&facts)).await.unwrap();
            let once = visible(&engine, &Consistency::Latest).await;
            engine.write_relationships(touches(&facts)).await.unwrap();
            let twice = visible(&engine, &Consistency::Latest).await;

            assert_eq!(once, expected(&facts));
            assert_eq!(once, twice);
        });
    }

    /// Deleting a relationship that does not exist succeeds and changes nothing
    #[test]
    fn prop_delete_absent_is_noop(facts in arb_facts(), absent in (0..3usize, any::<bool>(), 3..6usize)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = create_test_engine(OPERATOR_SCHEMA).await;
            engine.write_relationships(touches(&facts)).await.unwrap();
            let before = visible(&engine, &Consistency::Latest).await;

            let result = engine
                .write_relationships(vec![delete(&relationship(&absent))])
                .await;
            assert!(result.is_ok());
            assert_eq!(visible(&engine, &Consistency::Latest).await, before);
        });
    }

    /// Reads pinned to a revision never observe later writes
    #[test]
    fn prop_snapshot_isolation(
        first in arb_facts(),
        added in arb_facts(),
        removed in arb_facts(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = create_test_engine(OPERATOR_SCHEMA).await;
            let written = engine.write_relationships(touches(&first)).await.unwrap();
            let snapshot = Consistency::AtExactSnapshot(written.written_at);

            let mut updates = touches(&added);
            updates.extend(removed.iter().map(|fact| delete(&relationship(fact))));
            engine.write_relationships(updates).await.unwrap();

            assert_eq!(visible(&engine, &snapshot).await, expected(&first));

            // a delete later in the batch wins over a touch of the same key
            let latest = &(&first | &added) - &removed;
            assert_eq!(visible(&engine, &Consistency::Latest).await, expected(&latest));
        });
    }
}
