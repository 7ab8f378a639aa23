//! Property-based tests for tier routing, sizing and table chunking.

use metasync_repl::config::TierThresholds;
use metasync_repl::export::chunk_tables;
use metasync_repl::model::{Partition, Table, TableUnit};
use metasync_repl::reconcile::ReconcilePlan;
use metasync_repl::sizer;
use metasync_repl::{Tier, TierRouter};
use proptest::prelude::*;

fn thresholds() -> impl Strategy<Value = TierThresholds> {
    (0usize..64, 1usize..1_000_000).prop_map(|(p, s)| TierThresholds {
        max_inline_partitions: p,
        max_message_bytes: s,
    })
}

fn unit() -> impl Strategy<Value = TableUnit> {
    (
        "[a-z]{1,12}",
        "[a-z_]{1,16}",
        prop::collection::vec(prop::collection::vec("[a-z0-9=-]{0,10}", 1..4), 0..30),
    )
        .prop_map(|(db, name, values)| {
            let partitions = values.into_iter().map(Partition::with_values).collect();
            TableUnit::new(Table::new(db, name), partitions)
        })
}

proptest! {
    #[test]
    fn prop_oversized_units_always_overflow(t in thresholds(), count in 0usize..10_000, extra in 0usize..1_000_000) {
        let router = TierRouter::new(t);
        prop_assert_eq!(router.decide(count, t.max_message_bytes + extra), Tier::Overflow);
    }

    #[test]
    fn prop_small_units_route_on_partition_count(t in thresholds(), count in 0usize..10_000, bytes in 0usize..1_000_000) {
        prop_assume!(bytes < t.max_message_bytes);
        let expected = if count > t.max_inline_partitions { Tier::Deferred } else { Tier::Inline };
        prop_assert_eq!(TierRouter::new(t).decide(count, bytes), expected);
    }

    #[test]
    fn prop_routing_is_deterministic(t in thresholds(), count in 0usize..10_000, bytes in 0usize..2_000_000) {
        let router = TierRouter::new(t);
        prop_assert_eq!(router.decide(count, bytes), router.decide(count, bytes));
    }

    #[test]
    fn prop_size_matches_encoding(unit in unit()) {
        let bytes = sizer::encode(&unit).unwrap();
        prop_assert_eq!(sizer::size(&unit).unwrap(), bytes.len());
        let measured = sizer::measure(unit.clone()).unwrap();
        prop_assert_eq!(measured.encoded, bytes);
        prop_assert_eq!(measured.metrics.partition_count, unit.partitions.len());
    }

    #[test]
    fn prop_chunks_cover_input_in_order(n in 0usize..400, chunk in 1usize..80) {
        let tables: Vec<Table> = (0..n).map(|i| Table::new("db", format!("t{}", i))).collect();
        let chunks = chunk_tables(tables.clone(), chunk);
        prop_assert_eq!(chunks.len(), n.div_ceil(chunk));
        prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= chunk));
        let flat: Vec<Table> = chunks.into_iter().flatten().collect();
        prop_assert_eq!(flat, tables);
    }

    #[test]
    fn prop_reconcile_plan_follows_counts(exported in 0usize..500, existing in 0usize..500) {
        let plan = ReconcilePlan::new(exported, existing);
        prop_assert_eq!(plan.delete_existing, existing > 0);
        prop_assert_eq!(plan.add_exported, exported > 0);
        prop_assert_eq!(plan.is_noop(), exported == 0 && existing == 0);
    }
}

#[test]
fn test_default_thresholds_boundaries() {
    let router = TierRouter::new(TierThresholds::default());
    assert_eq!(router.decide(10, 244_999), Tier::Inline);
    assert_eq!(router.decide(11, 244_999), Tier::Deferred);
    assert_eq!(router.decide(0, 245_000), Tier::Overflow);
}

#[test]
fn test_fifty_table_chunks() {
    let tables: Vec<Table> = (0..101).map(|i| Table::new("db", format!("t{}", i))).collect();
    let sizes: Vec<usize> = chunk_tables(tables, 50).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![50, 50, 1]);
}
