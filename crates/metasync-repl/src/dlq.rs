//! Dead-letter replay.
//!
//! Replays dead-letter queue records through the regular import logic, so a
//! unit that still fails is dead-lettered again with the same correlation.

use crate::envelope::{QueueRecord, ReplicationRun, SchemaType, TablePayload};
use crate::error::Result;
use crate::import::{table_disposition, ImportPipeline};
use crate::messaging::Message;
use crate::model::Database;
use crate::outcome::{BatchSummary, Disposition};
use tracing::{error, info, warn};

impl ImportPipeline {
    /// Replay one batch of dead-letter records.
    ///
    /// `Table` records replay as table imports (inline or pointer),
    /// `largeTable` records through the large-table stage, anything else as
    /// a database import.
    pub async fn handle_dead_letter_batch(&self, records: &[Message]) -> Result<BatchSummary> {
        let import_run_id = ReplicationRun::start().run_id;
        let mut summary = BatchSummary::new(records.len());

        for record in records {
            let disposition = match QueueRecord::decode(record) {
                Ok(queued) => self.replay(import_run_id, &queued).await,
                Err(e) => {
                    warn!(error = %e, "dropping malformed dead-letter record");
                    Disposition::Dropped
                }
            };
            summary.count(disposition);
        }

        info!(
            run_id = import_run_id,
            received = summary.received,
            processed = summary.processed,
            failed = summary.failed,
            "dead-letter batch replayed"
        );
        summary.into_result()
    }

    async fn replay(&self, import_run_id: u64, queued: &QueueRecord) -> Disposition {
        match queued.schema_type {
            SchemaType::Table => {
                let result = match TablePayload::decode(&queued.body) {
                    Ok(payload) => {
                        self.import_table(import_run_id, &queued.correlation, payload, &queued.body)
                            .await
                    }
                    Err(e) => Err(e),
                };
                table_disposition(&result)
            }
            SchemaType::LargeTable => table_disposition(&self.import_large_record(import_run_id, queued).await),
            SchemaType::Database => {
                let database: Database = match serde_json::from_str(&queued.body) {
                    Ok(database) => database,
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable database record");
                        return Disposition::Dropped;
                    }
                };
                match self
                    .import_database(import_run_id, &queued.correlation, &database, &queued.body)
                    .await
                {
                    Ok(_) => Disposition::Processed,
                    Err(e) => {
                        error!(database = %database.name, error = %e, "database replay failed");
                        Disposition::Failed
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplConfig;
    use crate::envelope::{self, Correlation};
    use crate::memory::MemoryServices;
    use crate::model::{Partition, Table, TableRef, TableUnit};
    use crate::sizer;

    fn correlation(config: &ReplConfig) -> Correlation {
        Correlation::new("batch-2", &config.source_catalog_id)
    }

    #[tokio::test]
    async fn test_table_record_replays_as_table_import() {
        let config = ReplConfig::default();
        let services = MemoryServices::new();
        let pipeline = ImportPipeline::new(config.clone(), &services.collaborators());
        let unit = TableUnit::new(Table::new("sales", "orders"), vec![Partition::with_values(["a"])]);
        let body = String::from_utf8(sizer::encode(&unit).unwrap()).unwrap();

        let message = envelope::forward_message(&body, &correlation(&config), SchemaType::Table);
        let summary = pipeline.handle_dead_letter_batch(&[message]).await.unwrap();

        assert_eq!(summary.processed, 1);
        let table = TableRef::new("sales", "orders");
        assert!(services.catalog.table(&config.target_catalog_id, &table).await.is_some());
    }

    #[tokio::test]
    async fn test_untagged_record_replays_as_database() {
        let config = ReplConfig::default();
        let services = MemoryServices::new();
        let pipeline = ImportPipeline::new(config.clone(), &services.collaborators());

        let message = Message::new(r#"{"Name":"sales"}"#)
            .with_attribute("exportbatchid", "batch-2")
            .with_attribute("sourcegluedatacatalogid", &config.source_catalog_id);
        pipeline.handle_dead_letter_batch(&[message]).await.unwrap();

        assert!(services
            .catalog
            .database(&config.target_catalog_id, "sales")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_still_failing_unit_is_dead_lettered_again() {
        let config = ReplConfig::default();
        let services = MemoryServices::new();
        services.catalog.fail_database_creates("sales").await;
        let pipeline = ImportPipeline::new(config.clone(), &services.collaborators());

        let body = serde_json::to_string(&Database::named("sales")).unwrap();
        let message = envelope::forward_message(&body, &correlation(&config), SchemaType::Database);
        pipeline.handle_dead_letter_batch(&[message]).await.unwrap();

        let dead = services.queue.take(&config.queues.dead_letter).await;
        assert_eq!(dead.len(), 1);
        let replayed = QueueRecord::decode(&dead[0]).unwrap();
        assert_eq!(replayed.correlation, correlation(&config));
        assert_eq!(replayed.body, body);
    }
}
