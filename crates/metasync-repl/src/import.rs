//! Import pipeline.
//!
//! Consumes the export topic on the target side. `database` messages create
//! the database if needed. `table` messages carry either an inline unit or
//! a pointer to an overflow object; both end in [`ImportPipeline::apply_unit`],
//! which walks the per-table state machine. `largeTable` messages are
//! forwarded to the import large-table queue (see [`crate::import_large`]).
//!
//! Every attempt writes exactly one ledger row. Terminal catalog write
//! failures are forwarded to the dead-letter queue with the original body.

use crate::catalog::{CatalogBridge, DatabaseWriteOutcome, TableWriteOutcome};
use crate::config::ReplConfig;
use crate::envelope::{self, Correlation, InboundEnvelope, ReplicationRun, SchemaType, TablePayload};
use crate::error::{ReplError, Result};
use crate::ledger::{DatabaseImportRecord, StatusLedger, StatusRecord, TableImportRecord};
use crate::messaging::{Message, WorkQueue};
use crate::model::{Database, TableUnit};
use crate::object_store::{self, ObjectPointer, ObjectStore};
use crate::outcome::{BatchSummary, Disposition, ImportState, PartitionSync, StateTrail, TableOutcome};
use crate::reconcile::replace_partitions;
use crate::services::Collaborators;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a database import did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseImport {
    /// The database was already in the target catalog.
    Existing,
    /// The database was created.
    Created,
    /// Creation failed; the message went to the dead-letter queue.
    DeadLettered,
}

/// Target-side pipeline.
pub struct ImportPipeline {
    pub(crate) config: ReplConfig,
    catalog: CatalogBridge,
    queue: Arc<dyn WorkQueue>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    ledger: StatusLedger,
}

impl ImportPipeline {
    /// Create a pipeline.
    pub fn new(config: ReplConfig, services: &Collaborators) -> Self {
        Self {
            catalog: CatalogBridge::new(services.catalog.clone()),
            queue: services.queue.clone(),
            objects: services.objects.clone(),
            ledger: StatusLedger::new(services.status.clone(), &config),
            config,
        }
    }

    /// Handle one batch from the export topic.
    pub async fn handle_bus_batch(&self, records: &[Message]) -> Result<BatchSummary> {
        let import_run_id = ReplicationRun::start().run_id;
        let mut summary = BatchSummary::new(records.len());

        for record in records {
            let disposition = match InboundEnvelope::decode(record) {
                Ok(InboundEnvelope::Database {
                    correlation,
                    database,
                    raw,
                }) => match self.import_database(import_run_id, &correlation, &database, &raw).await {
                    Ok(_) => Disposition::Processed,
                    Err(e) => {
                        error!(database = %database.name, error = %e, "database import failed");
                        Disposition::Failed
                    }
                },
                Ok(InboundEnvelope::Table {
                    correlation,
                    payload,
                    raw,
                }) => table_disposition(&self.import_table(import_run_id, &correlation, payload, &raw).await),
                Ok(InboundEnvelope::LargeTable { correlation, raw, .. }) => {
                    self.forward_large_table(&correlation, &raw).await
                }
                Ok(InboundEnvelope::TableList { .. }) => {
                    warn!("table list message on the import side, dropping");
                    Disposition::Dropped
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed import message");
                    Disposition::Dropped
                }
            };
            summary.count(disposition);
        }

        info!(
            run_id = import_run_id,
            received = summary.received,
            processed = summary.processed,
            dropped = summary.dropped,
            failed = summary.failed,
            "import batch handled"
        );
        summary.into_result()
    }

    async fn forward_large_table(&self, correlation: &Correlation, raw: &str) -> Disposition {
        let message = envelope::forward_message(raw, correlation, SchemaType::LargeTable);
        match self.queue.send(&self.config.queues.large_table_import, &message).await {
            Ok(()) => {
                debug!(batch_id = %correlation.export_batch_id, "large table forwarded");
                Disposition::Processed
            }
            Err(e) => {
                error!(error = %e, "large table not forwarded");
                Disposition::Failed
            }
        }
    }

    /// Import one database definition. Writes one ledger row.
    pub async fn import_database(
        &self,
        import_run_id: u64,
        correlation: &Correlation,
        database: &Database,
        raw: &str,
    ) -> Result<DatabaseImport> {
        let result = self.ensure_database(correlation, database, raw).await;

        let record = StatusRecord::DatabaseImport(DatabaseImportRecord {
            db_id: database.name.clone(),
            import_run_id,
            export_batch_id: correlation.export_batch_id.clone(),
            target_glue_catalog_id: self.config.target_catalog_id.clone(),
            source_glue_catalog_id: correlation.source_catalog_id.clone(),
            is_created: matches!(result, Ok(DatabaseImport::Created)),
            error: !matches!(result, Ok(DatabaseImport::Existing | DatabaseImport::Created)),
        });
        self.ledger.record(&record).await?;
        result
    }

    async fn ensure_database(&self, correlation: &Correlation, database: &Database, raw: &str) -> Result<DatabaseImport> {
        let target = &self.config.target_catalog_id;
        if self.catalog.get_database(target, &database.name).await?.is_some() {
            debug!(database = %database.name, "database already in target");
            return Ok(DatabaseImport::Existing);
        }

        match self.catalog.create_database(target, &database.to_input()).await {
            DatabaseWriteOutcome::Created => Ok(DatabaseImport::Created),
            DatabaseWriteOutcome::AlreadyExists => Ok(DatabaseImport::Existing),
            DatabaseWriteOutcome::Failed { reason } => {
                warn!(database = %database.name, reason = %reason, "database not created, dead-lettering");
                self.dead_letter(raw, correlation, SchemaType::Database).await?;
                Ok(DatabaseImport::DeadLettered)
            }
        }
    }

    /// Import a `table` payload: an inline unit, or a pointer whose object
    /// is fetched first.
    ///
    /// An unreadable object fails with the store's error so the message is
    /// redelivered; an object that is not a table unit fails with
    /// [`ReplError::Parse`]. Both write an error row.
    pub async fn import_table(
        &self,
        import_run_id: u64,
        correlation: &Correlation,
        payload: TablePayload,
        raw: &str,
    ) -> Result<TableOutcome> {
        let unit = match payload {
            TablePayload::Unit(unit) => unit,
            TablePayload::Pointer(pointer) => {
                let fetched = match self.objects.get(&pointer.bucket_name, &pointer.object_key).await {
                    Ok(body) => object_store::decode_table_unit(&pointer, &body),
                    Err(e) => Err(e),
                };
                match fetched {
                    Ok(unit) => unit,
                    Err(e) => {
                        self.record_unreadable(import_run_id, correlation, &pointer, raw, &e).await;
                        return Err(e);
                    }
                }
            }
        };
        self.apply_unit(import_run_id, correlation, unit, raw, SchemaType::Table).await
    }

    /// Write one table unit to the target catalog and reconcile its
    /// partitions.
    ///
    /// A missing parent database is created and the write retried once. A
    /// table that still cannot be written is dead-lettered with `raw` tagged
    /// as `schema_type`. Fails only if the dead-letter send or the ledger
    /// write fails.
    pub async fn apply_unit(
        &self,
        import_run_id: u64,
        correlation: &Correlation,
        unit: TableUnit,
        raw: &str,
        schema_type: SchemaType,
    ) -> Result<TableOutcome> {
        let target = &self.config.target_catalog_id;
        let skip_archive = self.config.skip_archive;
        let table_ref = unit.table.table_ref();
        let export_has_partitions = !unit.partitions.is_empty();
        let mut trail = StateTrail::new();
        let mut parent_created = false;

        let mut write = self.catalog.create_or_update_table(target, &unit.table, skip_archive).await;
        if write == TableWriteOutcome::ParentNotFound {
            trail.advance(&table_ref, ImportState::ParentMissing);
            let parent = Database::named(&table_ref.database).to_input();
            let created = self.catalog.create_database(target, &parent).await;
            if created.exists() {
                trail.advance(&table_ref, ImportState::ParentCreated);
                parent_created = created == DatabaseWriteOutcome::Created;
                write = self.catalog.create_or_update_table(target, &unit.table, skip_archive).await;
                if write == TableWriteOutcome::ParentNotFound {
                    trail.advance(&table_ref, ImportState::ParentMissingFatal);
                }
            } else {
                trail.advance(&table_ref, ImportState::ParentMissingFatal);
            }
        }

        let partitions = match &write {
            written if written.is_written() => {
                trail.advance(&table_ref, ImportState::TableWritten);
                match replace_partitions(&self.catalog, target, &table_ref, &unit.partitions, &self.config.batching)
                    .await
                {
                    Ok(report) => {
                        let state = if report.is_complete() {
                            ImportState::PartitionsReconciled
                        } else {
                            ImportState::PartitionsFailed
                        };
                        trail.advance(&table_ref, state);
                        PartitionSync::Reconciled(report)
                    }
                    Err(e) => {
                        warn!(table = %table_ref, error = %e, "partitions not reconciled");
                        trail.advance(&table_ref, ImportState::PartitionsFailed);
                        PartitionSync::Failed {
                            export_has_partitions,
                            reason: e.to_string(),
                        }
                    }
                }
            }
            TableWriteOutcome::Failed { .. } => {
                trail.advance(&table_ref, ImportState::TableWriteFailed);
                PartitionSync::NotAttempted { export_has_partitions }
            }
            _ => PartitionSync::NotAttempted { export_has_partitions },
        };
        trail.advance(&table_ref, ImportState::Done);

        let outcome = TableOutcome {
            table_schema: serde_json::to_string(&unit.table).unwrap_or_default(),
            table: table_ref,
            write,
            parent_created,
            partitions,
            trail,
        };

        let escalated = if outcome.needs_dead_letter() {
            warn!(table = %outcome.table, reason = ?outcome.error_message(), "table not written, dead-lettering");
            self.dead_letter(raw, correlation, schema_type).await
        } else {
            Ok(())
        };

        let record = outcome.ledger_record(import_run_id, correlation, target);
        self.ledger.record(&StatusRecord::TableImport(record)).await?;
        escalated?;

        info!(
            table = %outcome.table,
            created = outcome.created(),
            updated = outcome.updated(),
            partitions_replicated = outcome.partitions_replicated(),
            "table imported"
        );
        Ok(outcome)
    }

    pub(crate) async fn dead_letter(&self, raw: &str, correlation: &Correlation, schema_type: SchemaType) -> Result<()> {
        let message = envelope::forward_message(raw, correlation, schema_type);
        self.queue.send(&self.config.queues.dead_letter, &message).await
    }

    /// Error row for a unit whose object could not be read or parsed.
    pub(crate) async fn record_unreadable(
        &self,
        import_run_id: u64,
        correlation: &Correlation,
        pointer: &ObjectPointer,
        raw: &str,
        cause: &ReplError,
    ) {
        warn!(key = %pointer.object_key, error = %cause, "object not readable");
        let record = StatusRecord::TableImport(TableImportRecord {
            table_id: pointer.object_key.clone(),
            import_run_id,
            export_batch_id: correlation.export_batch_id.clone(),
            table_name: String::new(),
            database_name: String::new(),
            table_schema: raw.to_string(),
            target_glue_catalog_id: self.config.target_catalog_id.clone(),
            source_glue_catalog_id: correlation.source_catalog_id.clone(),
            table_created: false,
            table_updated: false,
            export_has_partitions: false,
            partitions_updated: false,
            error: true,
            error_message: Some(cause.to_string()),
        });
        if let Err(e) = self.ledger.record(&record).await {
            error!(key = %pointer.object_key, error = %e, "table import row not written");
        }
    }
}

/// Disposition of one table import.
///
/// Dead-lettered units count as processed. Partition failures and
/// collaborator failures need redelivery. Unparseable units are dropped.
pub(crate) fn table_disposition(result: &Result<TableOutcome>) -> Disposition {
    match result {
        Ok(outcome) if outcome.needs_dead_letter() || outcome.partitions_replicated() => Disposition::Processed,
        Ok(outcome) => {
            warn!(table = %outcome.table, reason = ?outcome.error_message(), "partitions not fully replicated");
            Disposition::Failed
        }
        Err(ReplError::Parse { msg }) => {
            warn!(error = %msg, "dropping unparseable table unit");
            Disposition::Dropped
        }
        Err(e) => {
            error!(error = %e, "table import failed");
            Disposition::Failed
        }
    }
}
