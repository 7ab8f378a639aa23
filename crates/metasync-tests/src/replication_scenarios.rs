//! End-to-end replication scenarios over the in-memory services.

use crate::harness::{partitions, ReplHarness, SOURCE, TARGET};
use metasync_repl::envelope::{self, Correlation, QueueRecord, SchemaType};
use metasync_repl::model::{Database, Table, TableRef};
use metasync_repl::ReplError;

fn huge_table(database: &str, name: &str) -> Table {
    let mut table = Table::new(database, name);
    table.description = Some("x".repeat(300_000));
    table
}

async fn seeded() -> (ReplHarness, Vec<TableRef>) {
    let harness = ReplHarness::new();
    harness.seed_database("sales").await;
    let tables = vec![
        harness.seed_table(Table::new("sales", "orders"), partitions("o", 3)).await,
        harness.seed_table(Table::new("sales", "events"), partitions("e", 40)).await,
        harness.seed_table(huge_table("sales", "blob"), partitions("b", 2)).await,
        harness.seed_table(Table::new("sales", "empty"), Vec::new()).await,
    ];
    (harness, tables)
}

#[tokio::test]
async fn test_sweep_replicates_every_tier() {
    let (harness, tables) = seeded().await;

    let stages = harness.sweep().await;
    for stage in &stages {
        assert!(stage.result.is_ok(), "stage {} failed: {:?}", stage.stage, stage.result);
    }

    for table in &tables {
        assert!(harness.target_has_table(table).await, "{} missing", table);
        assert_eq!(
            harness.target_partitions(table).await,
            harness.services.catalog.partitions(SOURCE, table).await,
            "{} partitions differ",
            table
        );
    }

    let imports = harness.rows(&harness.config.ledger.table_import).await;
    assert_eq!(imports.len(), 4);
    assert!(imports.iter().all(|row| row["error"] == false));

    let exports = harness.rows(&harness.config.ledger.table_export).await;
    assert_eq!(exports.len(), 4);
    let large: Vec<_> = exports.iter().filter(|row| row["is_large_table"] == true).collect();
    assert_eq!(large.len(), 2);
}

#[tokio::test]
async fn test_resweep_is_idempotent_and_appends_rows() {
    let (harness, tables) = seeded().await;

    harness.sweep().await;
    let mut first = Vec::new();
    for table in &tables {
        first.push(harness.target_partitions(table).await);
    }

    harness.sweep().await;
    for (table, before) in tables.iter().zip(first) {
        assert_eq!(harness.target_partitions(table).await, before);
    }

    assert_eq!(harness.rows(&harness.config.ledger.table_import).await.len(), 8);
    assert_eq!(harness.rows(&harness.config.ledger.db_export).await.len(), 2);
}

#[tokio::test]
async fn test_stale_target_partitions_are_replaced() {
    let (harness, _) = seeded().await;
    let orders = TableRef::new("sales", "orders");
    let empty = TableRef::new("sales", "empty");
    for (table, stale) in [(&orders, 7), (&empty, 4)] {
        harness
            .services
            .catalog
            .insert_database(TARGET, Database::named("sales"))
            .await;
        harness.services.catalog.insert_table(TARGET, Table::new("sales", &table.table)).await;
        harness
            .services
            .catalog
            .insert_partitions(TARGET, table, partitions("stale", stale))
            .await;
    }

    harness.sweep().await;

    assert_eq!(harness.target_partitions(&orders).await, partitions("o", 3));
    assert!(harness.target_partitions(&empty).await.is_empty());
}

#[tokio::test]
async fn test_write_failure_dead_letters_then_replays() {
    let (harness, _) = seeded().await;
    harness
        .services
        .catalog
        .insert_database(TARGET, Database::named("sales"))
        .await;
    harness.services.catalog.fail_table_writes("sales", "orders").await;

    let stages = harness.sweep().await;
    assert!(stages.iter().all(|s| s.result.is_ok()));
    let orders = TableRef::new("sales", "orders");
    assert!(!harness.target_has_table(&orders).await);

    let dead = harness.services.queue.take(&harness.config.queues.dead_letter).await;
    assert_eq!(dead.len(), 1);
    let record = QueueRecord::decode(&dead[0]).unwrap();
    assert_eq!(record.schema_type, SchemaType::Table);
    assert_eq!(record.correlation.source_catalog_id, SOURCE);
    let batch_id = record.correlation.export_batch_id.clone();

    // still failing: dead-lettered again with the same correlation
    harness.import().handle_dead_letter_batch(&dead).await.unwrap();
    let again = harness.services.queue.take(&harness.config.queues.dead_letter).await;
    assert_eq!(again.len(), 1);
    assert_eq!(QueueRecord::decode(&again[0]).unwrap().correlation.export_batch_id, batch_id);

    harness.services.catalog.clear_failures().await;
    harness.import().handle_dead_letter_batch(&again).await.unwrap();
    assert!(harness.target_has_table(&orders).await);
    assert_eq!(harness.target_partitions(&orders).await, partitions("o", 3));
    assert!(harness
        .services
        .queue
        .take(&harness.config.queues.dead_letter)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_transient_faults_are_absorbed_by_retry() {
    let (harness, tables) = seeded().await;
    let harness = harness.with_retry(5);
    harness.services.bus.fail_next(2);
    harness.services.catalog.fail_next(3);
    harness.services.status.fail_next(1);

    let stages = harness.sweep().await;
    for stage in &stages {
        assert!(stage.result.is_ok(), "stage {} failed: {:?}", stage.stage, stage.result);
    }
    for table in &tables {
        assert!(harness.target_has_table(table).await);
    }
}

#[tokio::test]
async fn test_exhausted_publish_requests_redelivery() {
    let (harness, _) = seeded().await;
    let harness = harness.with_retry(2);
    harness.services.bus.fail_topic(&harness.config.topics.export).await;

    let stages = harness.sweep().await;
    let chunks = stages.iter().find(|s| s.stage == "export chunks").unwrap();
    assert!(matches!(chunks.result, Err(ReplError::Incomplete { .. })));

    let exports = harness.rows(&harness.config.ledger.table_export).await;
    assert!(!exports.is_empty());
    assert!(exports.iter().all(|row| row["is_exported"] == false));
}

#[tokio::test]
async fn test_tables_before_database_are_imported() {
    let (harness, tables) = seeded().await;
    harness.planner().plan().await.unwrap();
    let export = harness.export();
    let planned = harness.services.bus.take(&harness.config.topics.planner).await;
    export.handle_event(&planned).await.unwrap();
    let chunks = harness.services.bus.take(&harness.config.topics.table_list).await;
    export.handle_event(&chunks).await.unwrap();

    let mut published = harness.services.bus.take(&harness.config.topics.export).await;
    published.reverse();
    harness.import().handle_bus_batch(&published).await.unwrap();

    assert!(harness.services.catalog.database(TARGET, "sales").await.is_some());
    assert!(harness.target_has_table(&tables[0]).await);
    let db_rows = harness.rows(&harness.config.ledger.db_import).await;
    assert_eq!(db_rows.len(), 1);
    assert_eq!(db_rows[0]["is_created"], false);
}

#[tokio::test]
async fn test_duplicate_delivery_converges() {
    let harness = ReplHarness::new();
    harness.seed_database("sales").await;
    let orders = harness
        .seed_table(Table::new("sales", "orders"), partitions("o", 12))
        .await;
    harness.planner().plan().await.unwrap();
    let export = harness.export();
    let planned = harness.services.bus.take(&harness.config.topics.planner).await;
    export.handle_event(&planned).await.unwrap();
    let chunks = harness.services.bus.take(&harness.config.topics.table_list).await;
    export.handle_event(&chunks).await.unwrap();
    let published = harness.services.bus.take(&harness.config.topics.export).await;

    let import = harness.import();
    import.handle_bus_batch(&published).await.unwrap();
    let once = harness.target_partitions(&orders).await;
    import.handle_bus_batch(&published).await.unwrap();

    assert_eq!(harness.target_partitions(&orders).await, once);
    assert_eq!(once, partitions("o", 12));
}

#[tokio::test]
async fn test_planner_prefix_filter_limits_sweep() {
    let mut harness = ReplHarness::new();
    harness.config.planner.database_prefixes = "sales".into();
    harness.seed_database("sales").await;
    harness.seed_database("hr").await;
    harness.seed_table(Table::new("hr", "people"), partitions("p", 1)).await;
    harness.seed_table(Table::new("sales", "orders"), partitions("o", 1)).await;

    harness.sweep().await;

    assert!(harness.services.catalog.database(TARGET, "hr").await.is_none());
    assert!(harness.target_has_table(&TableRef::new("sales", "orders")).await);
}

#[tokio::test]
async fn test_legacy_pointer_body_is_imported() {
    let harness = ReplHarness::new();
    let unit = metasync_repl::model::TableUnit::new(Table::new("sales", "orders"), partitions("o", 2));
    let bucket = harness.config.object_store.bucket.clone();
    harness
        .services
        .objects
        .insert(&bucket, "legacy.txt", serde_json::to_vec(&unit).unwrap())
        .await;

    let correlation = Correlation::new("batch-legacy", SOURCE);
    let mut message = envelope::table_message(b"", &correlation);
    message.body = format!("{{'bucket_name': '{}', 'object_key': 'legacy.txt'}}", bucket);
    harness.import().handle_bus_batch(&[message]).await.unwrap();

    assert_eq!(
        harness.target_partitions(&TableRef::new("sales", "orders")).await,
        partitions("o", 2)
    );
}
