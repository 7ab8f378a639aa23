//! Export pipeline.
//!
//! Two kinds of bus batches arrive here:
//!
//! - `database` messages from the planner. Each database is re-checked in
//!   the source catalog, republished to the export topic and its tables are
//!   listed and published as `table_list` chunks.
//! - `table_list` chunks. Every table in a chunk is measured, routed to a
//!   tier and dispatched.
//!
//! The source-side large-table stage lives in [`crate::export_large`].

use crate::catalog::CatalogBridge;
use crate::config::ReplConfig;
use crate::envelope::{self, Correlation, InboundEnvelope, MessageKind, ReplicationRun};
use crate::error::Result;
use crate::ledger::{DatabaseExportRecord, StatusLedger, StatusRecord, TableExportRecord};
use crate::messaging::{Message, MessageBus, WorkQueue};
use crate::model::{Database, Table, TableRef};
use crate::object_store::{self, ObjectPointer, ObjectStore};
use crate::outcome::{BatchSummary, Disposition};
use crate::services::Collaborators;
use crate::sizer::UnitMetrics;
use crate::tier::{Tier, TierPayload, TierRouter};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Split `tables` into chunks of at most `chunk_size`, preserving order.
pub fn chunk_tables(tables: Vec<Table>, chunk_size: usize) -> Vec<Vec<Table>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(tables.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(tables.len()));
    for table in tables {
        current.push(table);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// What happened to one table of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Published to the export topic.
    Published {
        /// Bus delivery id.
        delivery_id: String,
        /// Overflow object, for the Overflow tier.
        pointer: Option<ObjectPointer>,
    },
    /// Sent to the large-table export queue.
    Queued,
    /// The unit could not be encoded. Recorded, never retried.
    Unencodable {
        /// Why.
        reason: String,
    },
    /// A collaborator failed after retries.
    Failed {
        /// Why.
        reason: String,
    },
}

/// Per-table result of [`ExportPipeline::export_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableExportReport {
    /// The table.
    pub table: TableRef,
    /// The tier, once routed.
    pub tier: Option<Tier>,
    /// Sizes, once measured.
    pub metrics: Option<UnitMetrics>,
    /// Outcome.
    pub outcome: ExportOutcome,
}

impl TableExportReport {
    /// The table needs the chunk to be redelivered.
    pub fn needs_retry(&self) -> bool {
        matches!(self.outcome, ExportOutcome::Failed { .. })
    }
}

/// Result of exporting one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    /// The run the chunk belongs to.
    pub run: ReplicationRun,
    /// One report per table, in chunk order.
    pub tables: Vec<TableExportReport>,
    /// Ledger rows written for the chunk.
    pub ledger_rows: usize,
}

impl ChunkReport {
    /// Tables routed to `tier`.
    pub fn count(&self, tier: Tier) -> usize {
        self.tables.iter().filter(|t| t.tier == Some(tier)).count()
    }

    /// Every table was delivered and recorded, or recorded as unencodable.
    pub fn is_complete(&self) -> bool {
        !self.tables.iter().any(TableExportReport::needs_retry)
    }
}

/// Result of listing one database's tables into `table_list` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableListReport {
    /// Tables listed.
    pub tables: usize,
    /// Chunks built.
    pub chunks: usize,
    /// Chunks published.
    pub published: usize,
}

/// Source-side pipeline.
pub struct ExportPipeline {
    pub(crate) config: ReplConfig,
    pub(crate) catalog: CatalogBridge,
    router: TierRouter,
    pub(crate) bus: Arc<dyn MessageBus>,
    queue: Arc<dyn WorkQueue>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) ledger: StatusLedger,
}

impl ExportPipeline {
    /// Create a pipeline.
    pub fn new(config: ReplConfig, services: &Collaborators) -> Self {
        Self {
            catalog: CatalogBridge::new(services.catalog.clone()),
            router: TierRouter::new(config.tiering),
            bus: services.bus.clone(),
            queue: services.queue.clone(),
            objects: services.objects.clone(),
            ledger: StatusLedger::new(services.status.clone(), &config),
            config,
        }
    }

    /// Handle one bus batch. A batch whose first record is a `table_list`
    /// is processed as chunks, anything else as database messages.
    ///
    /// Returns [`crate::error::ReplError::Incomplete`] if any record needs redelivery.
    pub async fn handle_event(&self, records: &[Message]) -> Result<BatchSummary> {
        let summary = match records.first().and_then(envelope::peek_kind) {
            Some(MessageKind::TableList) => self.handle_table_lists(records).await,
            _ => self.handle_database_messages(records).await,
        };
        summary.into_result()
    }

    async fn handle_table_lists(&self, records: &[Message]) -> BatchSummary {
        let mut summary = BatchSummary::new(records.len());
        for record in records {
            let disposition = match InboundEnvelope::decode(record) {
                Ok(InboundEnvelope::TableList { run, tables, .. }) => match self.export_chunk(run, tables).await {
                    Ok(report) if report.is_complete() => Disposition::Processed,
                    Ok(report) => {
                        warn!(
                            batch_id = %report.run.batch_id,
                            failed = report.tables.iter().filter(|t| t.needs_retry()).count(),
                            "chunk not fully exported"
                        );
                        Disposition::Failed
                    }
                    Err(e) => {
                        error!(error = %e, "chunk export failed");
                        Disposition::Failed
                    }
                },
                Ok(other) => {
                    warn!(kind = %other.kind().as_str(), "unexpected message in table list batch, dropping");
                    Disposition::Dropped
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed table list message");
                    Disposition::Dropped
                }
            };
            summary.count(disposition);
        }
        summary
    }

    /// Handle `database` messages from the planner.
    pub async fn handle_database_messages(&self, records: &[Message]) -> BatchSummary {
        let mut summary = BatchSummary::new(records.len());
        let invocation = ReplicationRun::start();

        for record in records {
            let disposition = match InboundEnvelope::decode(record) {
                Ok(InboundEnvelope::Database {
                    correlation, database, ..
                }) => {
                    let run = ReplicationRun::resume(invocation.run_id, &correlation.export_batch_id);
                    self.export_database(&run, &database.name).await
                }
                Ok(other) => {
                    warn!(kind = %other.kind().as_str(), "expected a database message, dropping");
                    Disposition::Dropped
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed database message");
                    Disposition::Dropped
                }
            };
            summary.count(disposition);
        }

        info!(
            run_id = invocation.run_id,
            received = summary.received,
            processed = summary.processed,
            failed = summary.failed,
            "database messages handled"
        );
        summary
    }

    async fn export_database(&self, run: &ReplicationRun, name: &str) -> Disposition {
        let source = &self.config.source_catalog_id;
        let database = match self.catalog.get_database(source, name).await {
            Ok(Some(database)) => database,
            Ok(None) => {
                warn!(database = %name, "database no longer in source catalog, skipping");
                return Disposition::Processed;
            }
            Err(e) => {
                error!(database = %name, error = %e, "could not read source database");
                return Disposition::Failed;
            }
        };

        let published = match self.publish_database(run, &database).await {
            Ok(()) => true,
            Err(e) => {
                error!(database = %name, error = %e, "database export failed");
                false
            }
        };

        match self.list_and_chunk_tables(run, name).await {
            Ok(report) if report.published == report.chunks && published => Disposition::Processed,
            Ok(report) => {
                warn!(
                    database = %name,
                    chunks = report.chunks,
                    published = report.published,
                    "not every table list was published"
                );
                Disposition::Failed
            }
            Err(e) => {
                error!(database = %name, error = %e, "could not list tables");
                Disposition::Failed
            }
        }
    }

    async fn publish_database(&self, run: &ReplicationRun, database: &Database) -> Result<()> {
        let source = &self.config.source_catalog_id;
        let message = envelope::database_message(database, &run.correlation(source))?;
        let delivery = self.bus.publish(&self.config.topics.export, &message).await;
        if let Err(e) = &delivery {
            warn!(database = %database.name, error = %e, "database message not published");
        }

        let published = delivery.is_ok();
        let record = StatusRecord::DatabaseExport(DatabaseExportRecord {
            db_id: database.name.clone(),
            export_run_id: run.run_id,
            export_batch_id: run.batch_id.clone(),
            source_glue_catalog_id: source.clone(),
            database_schema: message.body,
            is_exported: published,
            sns_msg_id: delivery.as_ref().map(String::clone).unwrap_or_default(),
        });
        self.ledger.record(&record).await?;
        delivery.map(|_| ())
    }

    /// List a database's tables and publish one `table_list` message per
    /// chunk. A chunk that fails to publish is logged; later chunks still go.
    pub async fn list_and_chunk_tables(&self, run: &ReplicationRun, database: &str) -> Result<TableListReport> {
        let source = &self.config.source_catalog_id;
        let tables = self.catalog.list_tables(source, database).await?;
        let listed = tables.len();
        let chunks = chunk_tables(tables, self.config.batching.tables_per_chunk);

        let mut report = TableListReport {
            tables: listed,
            chunks: chunks.len(),
            published: 0,
        };
        for (index, chunk) in chunks.iter().enumerate() {
            let message = envelope::table_list_message(chunk, run, source)?;
            match self.bus.publish(&self.config.topics.table_list, &message).await {
                Ok(id) => {
                    debug!(database = %database, chunk = index, tables = chunk.len(), delivery_id = %id, "table list published");
                    report.published += 1;
                }
                Err(e) => warn!(database = %database, chunk = index, error = %e, "table list not published"),
            }
        }

        info!(
            database = %database,
            batch_id = %run.batch_id,
            tables = report.tables,
            chunks = report.chunks,
            "tables chunked"
        );
        Ok(report)
    }

    /// Export every table of a chunk in order.
    ///
    /// Inline rows are written in one batched ledger write at the end;
    /// Overflow rows are written as they happen. Deferred tables get their
    /// row from the large-table stage. Fails only if the batched ledger
    /// write cannot be completed.
    pub async fn export_chunk(&self, run: ReplicationRun, tables: Vec<Table>) -> Result<ChunkReport> {
        let correlation = run.correlation(&self.config.source_catalog_id);
        let mut reports = Vec::with_capacity(tables.len());
        let mut inline_rows = Vec::new();
        let mut ledger_rows = 0;

        for table in tables {
            let table_ref = table.table_ref();
            let partitions = match self
                .catalog
                .list_partitions(&self.config.source_catalog_id, &table_ref)
                .await
            {
                Ok(partitions) => partitions,
                Err(e) => {
                    error!(table = %table_ref, error = %e, "could not list partitions");
                    let schema = serde_json::to_string(&table).unwrap_or_default();
                    inline_rows.push(StatusRecord::TableExport(self.export_row(&run, &table_ref, schema, false)));
                    reports.push(TableExportReport {
                        table: table_ref,
                        tier: None,
                        metrics: None,
                        outcome: ExportOutcome::Failed { reason: e.to_string() },
                    });
                    continue;
                }
            };

            let routed = match self.router.route(table, partitions, &self.config.source_catalog_id) {
                Ok(routed) => routed,
                Err(e) => {
                    error!(table = %table_ref, error = %e, "table unit cannot be encoded");
                    let mut row = self.export_row(&run, &table_ref, String::new(), false);
                    row.is_large_table = true;
                    let outcome = if self.record_now(row).await {
                        ledger_rows += 1;
                        ExportOutcome::Unencodable { reason: e.to_string() }
                    } else {
                        ExportOutcome::Failed {
                            reason: format!("{}; ledger row not written", e),
                        }
                    };
                    reports.push(TableExportReport {
                        table: table_ref,
                        tier: Some(Tier::Overflow),
                        metrics: None,
                        outcome,
                    });
                    continue;
                }
            };

            let tier = routed.tier();
            let metrics = routed.metrics;
            let outcome = match routed.payload {
                TierPayload::Inline { body } => {
                    let (outcome, row) = self.export_inline(&run, &correlation, &table_ref, body).await;
                    inline_rows.push(StatusRecord::TableExport(row));
                    outcome
                }
                TierPayload::Deferred { request } => {
                    self.export_deferred(&correlation, &table_ref, &request, metrics).await
                }
                TierPayload::Overflow { body } => {
                    let (outcome, row) = self.export_overflow(&run, &correlation, &table_ref, body).await;
                    if self.record_now(row).await {
                        ledger_rows += 1;
                        outcome
                    } else {
                        ExportOutcome::Failed {
                            reason: "ledger row not written".to_string(),
                        }
                    }
                }
            };
            reports.push(TableExportReport {
                table: table_ref,
                tier: Some(tier),
                metrics: Some(metrics),
                outcome,
            });
        }

        ledger_rows += self.ledger.batch_record(&inline_rows).await.map_err(|e| {
            error!(batch_id = %run.batch_id, error = %e, "inline ledger rows not written");
            e
        })?;

        let report = ChunkReport {
            run,
            tables: reports,
            ledger_rows,
        };
        info!(
            batch_id = %report.run.batch_id,
            run_id = report.run.run_id,
            inline = report.count(Tier::Inline),
            deferred = report.count(Tier::Deferred),
            overflow = report.count(Tier::Overflow),
            "chunk exported"
        );
        Ok(report)
    }

    async fn export_inline(
        &self,
        run: &ReplicationRun,
        correlation: &Correlation,
        table: &TableRef,
        body: Vec<u8>,
    ) -> (ExportOutcome, TableExportRecord) {
        let message = envelope::table_message(&body, correlation);
        let mut row = self.export_row(run, table, message.body.clone(), false);
        let outcome = match self.bus.publish(&self.config.topics.export, &message).await {
            Ok(id) => {
                row.is_exported = true;
                row.sns_msg_id = id.clone();
                ExportOutcome::Published {
                    delivery_id: id,
                    pointer: None,
                }
            }
            Err(e) => {
                warn!(table = %table, error = %e, "table message not published");
                ExportOutcome::Failed { reason: e.to_string() }
            }
        };
        (outcome, row)
    }

    async fn export_deferred(
        &self,
        correlation: &Correlation,
        table: &TableRef,
        request: &envelope::LargeTableRequest,
        metrics: UnitMetrics,
    ) -> ExportOutcome {
        let sent = match envelope::large_table_request_message(request, correlation) {
            Ok(message) => self.queue.send(&self.config.queues.large_table_export, &message).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                debug!(table = %table, partitions = metrics.partition_count, "table deferred to large table queue");
                ExportOutcome::Queued
            }
            Err(e) => {
                warn!(table = %table, error = %e, "large table request not sent");
                ExportOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    async fn export_overflow(
        &self,
        run: &ReplicationRun,
        correlation: &Correlation,
        table: &TableRef,
        body: Vec<u8>,
    ) -> (ExportOutcome, TableExportRecord) {
        let schema = String::from_utf8_lossy(&body).into_owned();
        let mut row = self.export_row(run, table, schema, true);
        let pointer = ObjectPointer::new(
            &self.config.object_store.bucket,
            object_store::object_key(Utc::now(), &self.config.source_catalog_id, &table.database, &table.table),
        );

        if let Err(e) = self.objects.put(&pointer.bucket_name, &pointer.object_key, body).await {
            warn!(table = %table, key = %pointer.object_key, error = %e, "overflow object not written");
            return (ExportOutcome::Failed { reason: e.to_string() }, row);
        }

        let delivery = match envelope::pointer_message(&pointer, correlation, &self.config.region) {
            Ok(message) => self.bus.publish(&self.config.topics.export, &message).await,
            Err(e) => Err(e),
        };
        match delivery {
            Ok(id) => {
                debug!(table = %table, key = %pointer.object_key, "overflow pointer published");
                row = row.with_pointer(&pointer);
                row.is_exported = true;
                row.sns_msg_id = id.clone();
                (
                    ExportOutcome::Published {
                        delivery_id: id,
                        pointer: Some(pointer),
                    },
                    row,
                )
            }
            Err(e) => {
                warn!(table = %table, error = %e, "overflow pointer not published");
                (ExportOutcome::Failed { reason: e.to_string() }, row)
            }
        }
    }

    pub(crate) fn export_row(
        &self,
        run: &ReplicationRun,
        table: &TableRef,
        table_schema: String,
        is_large_table: bool,
    ) -> TableExportRecord {
        TableExportRecord {
            table_id: table.ledger_key(),
            export_run_id: run.run_id,
            export_batch_id: run.batch_id.clone(),
            source_glue_catalog_id: self.config.source_catalog_id.clone(),
            table_schema,
            sns_msg_id: String::new(),
            is_exported: false,
            is_large_table,
            s3_bucket_name: None,
            object_key: None,
        }
    }

    /// Write one table-export row; failures are logged.
    pub(crate) async fn record_now(&self, row: TableExportRecord) -> bool {
        let table_id = row.table_id.clone();
        match self.ledger.record(&StatusRecord::TableExport(row)).await {
            Ok(()) => true,
            Err(e) => {
                error!(table_id = %table_id, error = %e, "table export row not written");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogApi;
    use crate::envelope::{LargeTableRequest, QueueRecord, SchemaType, TablePayload};
    use crate::memory::MemoryServices;
    use crate::error::ReplError;
    use crate::model::{Partition, TableUnit};

    fn tables(n: usize) -> Vec<Table> {
        (0..n).map(|i| Table::new("sales", format!("t{:03}", i))).collect()
    }

    fn parts(n: usize) -> Vec<Partition> {
        (0..n).map(|i| Partition::with_values([format!("2024-01-{:02}", i % 28 + 1), i.to_string()])).collect()
    }

    async fn seeded(config: &ReplConfig) -> MemoryServices {
        let services = MemoryServices::new();
        let source = &config.source_catalog_id;
        services.catalog.insert_database(source, Database::named("sales")).await;

        services.catalog.insert_table(source, Table::new("sales", "small")).await;
        services
            .catalog
            .insert_partitions(source, &TableRef::new("sales", "small"), parts(3))
            .await;

        services.catalog.insert_table(source, Table::new("sales", "wide")).await;
        services
            .catalog
            .insert_partitions(source, &TableRef::new("sales", "wide"), parts(40))
            .await;

        let mut huge = Table::new("sales", "huge");
        huge.description = Some("x".repeat(300_000));
        services.catalog.insert_table(source, huge).await;
        services
    }

    #[test]
    fn test_chunk_tables() {
        let chunks = chunk_tables(tables(120), 50);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![50, 50, 20]);
        assert_eq!(chunks.concat(), tables(120));

        assert!(chunk_tables(Vec::new(), 50).is_empty());
        assert_eq!(chunk_tables(tables(50), 50).len(), 1);
    }

    #[tokio::test]
    async fn test_export_chunk_routes_each_tier() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());
        let listed = services
            .catalog
            .get_tables(&config.source_catalog_id, "sales", None)
            .await
            .unwrap()
            .items;

        let report = pipeline.export_chunk(ReplicationRun::start(), listed).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.count(Tier::Inline), 1);
        assert_eq!(report.count(Tier::Deferred), 1);
        assert_eq!(report.count(Tier::Overflow), 1);
        // one batched inline row plus one overflow row
        assert_eq!(report.ledger_rows, 2);

        let published = services.bus.take(&config.topics.export).await;
        assert_eq!(published.len(), 2);
        let mut saw_pointer = false;
        for message in &published {
            assert_eq!(message.attribute("message_type"), Some("table"));
            if let TablePayload::Pointer(pointer) = TablePayload::decode(&message.body).unwrap() {
                assert_eq!(message.attribute("bucket_name"), Some(pointer.bucket_name.as_str()));
                assert!(pointer.object_key.ends_with("_sales_huge.txt"));
                saw_pointer = true;
            }
        }
        assert!(saw_pointer);

        let queued = services.queue.take(&config.queues.large_table_export).await;
        assert_eq!(queued.len(), 1);
        let record = QueueRecord::decode(&queued[0]).unwrap();
        assert_eq!(record.schema_type, SchemaType::LargeTable);
        let request: LargeTableRequest = serde_json::from_str(&record.body).unwrap();
        assert!(request.large_table);
        assert_eq!(request.number_of_partitions, 40);
        assert_eq!(request.table.name, "wide");

        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["is_exported"] == true));
        assert!(rows.iter().all(|r| r["table_id"] != "wide|sales"));
    }

    #[tokio::test]
    async fn test_inline_publish_failure_is_recorded() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        services.bus.fail_topic(&config.topics.export).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let report = pipeline
            .export_chunk(ReplicationRun::start(), vec![Table::new("sales", "small")])
            .await
            .unwrap();

        assert!(!report.is_complete());
        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_exported"], false);
        assert_eq!(rows[0]["is_large_table"], false);
        assert_eq!(rows[0]["sns_msg_id"], "");
    }

    #[tokio::test]
    async fn test_overflow_publish_failure_leaves_pointer_empty() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        services.bus.fail_topic(&config.topics.export).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let mut huge = Table::new("sales", "huge");
        huge.description = Some("x".repeat(300_000));
        let report = pipeline.export_chunk(ReplicationRun::start(), vec![huge]).await.unwrap();

        assert_eq!(report.count(Tier::Overflow), 1);
        assert_eq!(services.objects.keys(&config.object_store.bucket).await.len(), 1);
        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_large_table"], true);
        assert_eq!(rows[0]["is_exported"], false);
        assert!(rows[0].get("object_key").map_or(true, |v| v.is_null()));
    }

    #[tokio::test]
    async fn test_unrecorded_overflow_row_fails_chunk() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        services.status.fail_next(1);
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let mut huge = Table::new("sales", "huge");
        huge.description = Some("x".repeat(300_000));
        let report = pipeline.export_chunk(ReplicationRun::start(), vec![huge]).await.unwrap();

        assert_eq!(report.count(Tier::Overflow), 1);
        assert_eq!(report.ledger_rows, 0);
        assert!(report.tables[0].needs_retry());
        assert!(!report.is_complete());
        assert!(services.status.rows(&config.ledger.table_export).await.is_empty());
    }

    #[tokio::test]
    async fn test_inline_rows_are_batched() {
        let config = ReplConfig::default();
        let services = MemoryServices::new();
        let source = &config.source_catalog_id;
        services.catalog.insert_database(source, Database::named("sales")).await;
        for table in tables(30) {
            services.catalog.insert_table(source, table).await;
        }
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let report = pipeline.export_chunk(ReplicationRun::start(), tables(30)).await.unwrap();

        assert_eq!(report.count(Tier::Inline), 30);
        assert_eq!(services.status.batch_sizes().await, vec![25, 5]);
        assert_eq!(services.bus.take(&config.topics.export).await.len(), 30);
    }

    #[tokio::test]
    async fn test_handle_database_messages_publishes_chunks() {
        let mut config = ReplConfig::default();
        config.batching.tables_per_chunk = 2;
        let services = seeded(&config).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let correlation = Correlation::new("batch-1", &config.source_catalog_id);
        let records = vec![
            envelope::database_message(&Database::named("sales"), &correlation).unwrap(),
            envelope::database_message(&Database::named("gone"), &correlation).unwrap(),
            Message::new("{}"),
        ];
        let summary = pipeline.handle_event(&records).await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.dropped, 1);

        let lists = services.bus.take(&config.topics.table_list).await;
        assert_eq!(lists.len(), 2);
        let mut names = Vec::new();
        for message in &lists {
            assert_eq!(message.attribute("message_type"), Some("table_list"));
            assert_eq!(message.attribute("msg_attr_export_batch_id"), Some("batch-1"));
            let chunk: Vec<Table> = serde_json::from_str(&message.body).unwrap();
            names.extend(chunk.into_iter().map(|t| t.name));
        }
        assert_eq!(names, vec!["huge", "small", "wide"]);

        let republished = services.bus.take(&config.topics.export).await;
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].attribute("message_type"), Some("database"));
        assert_eq!(services.status.rows(&config.ledger.db_export).await.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_event_dispatches_table_lists() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let run = ReplicationRun::resume(7, "batch-9");
        let message =
            envelope::table_list_message(&[Table::new("sales", "small")], &run, &config.source_catalog_id).unwrap();
        let summary = pipeline.handle_event(&[message]).await.unwrap();
        assert_eq!(summary.processed, 1);

        let published = services.bus.take(&config.topics.export).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].attribute("export_batch_id"), Some("batch-9"));
        match TablePayload::decode(&published[0].body).unwrap() {
            TablePayload::Unit(TableUnit { table, partitions }) => {
                assert_eq!(table.name, "small");
                assert_eq!(partitions.len(), 3);
            }
            other => panic!("expected inline unit, got {:?}", other),
        }

        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows[0]["export_run_id"], 7);
    }

    #[tokio::test]
    async fn test_failed_chunk_requests_redelivery() {
        let config = ReplConfig::default();
        let services = seeded(&config).await;
        services.bus.fail_topic(&config.topics.export).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let run = ReplicationRun::start();
        let message =
            envelope::table_list_message(&[Table::new("sales", "small")], &run, &config.source_catalog_id).unwrap();
        let err = pipeline.handle_event(&[message]).await.unwrap_err();
        assert!(matches!(err, ReplError::Incomplete { failed: 1, total: 1 }));
    }
}
