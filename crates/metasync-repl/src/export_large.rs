//! Source-side large-table stage.
//!
//! Consumes the large-table export queue. Each record names a table the
//! router deferred; its partitions are re-read from the source catalog,
//! written as newline-delimited JSON and announced with a `largeTable`
//! envelope on the export topic.

use crate::envelope::{self, LargeTableEnvelope, LargeTableRequest, QueueRecord, ReplicationRun, SchemaType};
use crate::error::Result;
use crate::export::ExportPipeline;
use crate::ledger::StatusRecord;
use crate::messaging::Message;
use crate::model::TableRef;
use crate::object_store::{self, ObjectPointer};
use crate::outcome::{BatchSummary, Disposition};
use chrono::Utc;
use tracing::{error, info, warn};

impl ExportPipeline {
    /// Handle one batch of large-table queue records.
    ///
    /// Every record that could not be fully exported is counted as failed,
    /// and the call then returns [`crate::error::ReplError::Incomplete`].
    pub async fn handle_large_table_batch(&self, records: &[Message]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::new(records.len());
        for record in records {
            let disposition = match QueueRecord::decode(record) {
                Ok(queued) if queued.schema_type == SchemaType::LargeTable => self.export_large_record(&queued).await,
                Ok(queued) => {
                    warn!(schema_type = %queued.schema_type.as_str(), "not a large table record, dropping");
                    Disposition::Dropped
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed large table record");
                    Disposition::Dropped
                }
            };
            summary.count(disposition);
        }

        info!(
            received = summary.received,
            processed = summary.processed,
            failed = summary.failed,
            "large table batch handled"
        );
        summary.into_result()
    }

    async fn export_large_record(&self, queued: &QueueRecord) -> Disposition {
        let request: LargeTableRequest = match serde_json::from_str(&queued.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping unparseable large table request");
                return Disposition::Dropped;
            }
        };
        let run = ReplicationRun::within(&queued.correlation.export_batch_id);
        let table_ref = request.table_ref();

        if !request.large_table {
            warn!(table = %table_ref, "large table record without the large table flag");
            let row = self.export_row(&run, &table_ref, String::new(), true);
            self.record_now(row).await;
            return Disposition::Failed;
        }

        match self.export_large_table(&run, &table_ref).await {
            Ok(()) => Disposition::Processed,
            Err(e) => {
                error!(table = %table_ref, error = %e, "large table export failed");
                Disposition::Failed
            }
        }
    }

    /// Re-read `table` and its partitions, write the partitions object and
    /// publish the envelope. Writes one ledger row.
    async fn export_large_table(&self, run: &ReplicationRun, table_ref: &TableRef) -> Result<()> {
        let source = &self.config.source_catalog_id;
        let Some(table) = self.catalog.get_table(source, table_ref).await? else {
            warn!(table = %table_ref, "large table no longer in source catalog, skipping");
            return Ok(());
        };
        let partitions = self.catalog.list_partitions(source, table_ref).await?;

        let limit = self.config.tiering.max_inline_partitions;
        if partitions.len() <= limit {
            warn!(
                table = %table_ref,
                partitions = partitions.len(),
                max_inline = limit,
                "deferred table no longer exceeds the inline partition limit"
            );
        }

        let pointer = ObjectPointer::new(
            &self.config.object_store.bucket,
            object_store::object_key(Utc::now(), source, &table_ref.database, &table_ref.table),
        );
        let announcement = LargeTableEnvelope {
            catalog_id: source.clone(),
            large_table: true,
            number_of_partitions: partitions.len(),
            table,
            s3_object_key: pointer.object_key.clone(),
            s3_bucket_name: pointer.bucket_name.clone(),
        };
        let message = envelope::large_table_message(&announcement, &run.correlation(source), &self.config.region)?;
        let mut row = self.export_row(run, table_ref, message.body.clone(), true);

        let body = object_store::encode_partition_lines(&partitions)?;
        if let Err(e) = self.objects.put(&pointer.bucket_name, &pointer.object_key, body).await {
            self.record_now(row).await;
            return Err(e);
        }

        let delivery = self.bus.publish(&self.config.topics.export, &message).await;
        if let Ok(id) = &delivery {
            row = row.with_pointer(&pointer);
            row.is_exported = true;
            row.sns_msg_id = id.clone();
        }
        let recorded = self.ledger.record(&StatusRecord::TableExport(row)).await;

        delivery?;
        recorded?;
        info!(
            table = %table_ref,
            partitions = announcement.number_of_partitions,
            key = %pointer.object_key,
            "large table exported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplConfig;
    use crate::envelope::{Correlation, InboundEnvelope};
    use crate::error::ReplError;
    use crate::memory::MemoryServices;
    use crate::model::{Database, Partition, Table};
    use crate::object_store::{decode_partition_lines, ObjectStore};

    fn request(table: &str, partitions: usize, flagged: bool, config: &ReplConfig) -> Message {
        let request = LargeTableRequest {
            table: Table::new("sales", table),
            large_table: flagged,
            number_of_partitions: partitions,
            catalog_id: config.source_catalog_id.clone(),
        };
        let correlation = Correlation::new("batch-3", &config.source_catalog_id);
        envelope::large_table_request_message(&request, &correlation).unwrap()
    }

    async fn seeded(config: &ReplConfig, partitions: usize) -> MemoryServices {
        let services = MemoryServices::new();
        let source = &config.source_catalog_id;
        services.catalog.insert_database(source, Database::named("sales")).await;
        services.catalog.insert_table(source, Table::new("sales", "wide")).await;
        let parts = (0..partitions).map(|i| Partition::with_values([i.to_string()])).collect();
        services
            .catalog
            .insert_partitions(source, &TableRef::new("sales", "wide"), parts)
            .await;
        services
    }

    #[tokio::test]
    async fn test_large_table_is_written_and_announced() {
        let config = ReplConfig::default();
        let services = seeded(&config, 40).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let summary = pipeline
            .handle_large_table_batch(&[request("wide", 40, true, &config)])
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);

        let published = services.bus.take(&config.topics.export).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].attribute("message_type"), Some("largeTable"));
        assert_eq!(published[0].attribute("export_batch_id"), Some("batch-3"));
        assert_eq!(published[0].attribute("region_name"), Some(config.region.as_str()));

        let announced = match InboundEnvelope::decode(&published[0]).unwrap() {
            InboundEnvelope::LargeTable { envelope, .. } => envelope,
            other => panic!("expected large table envelope, got {:?}", other),
        };
        assert_eq!(announced.number_of_partitions, 40);
        assert!(announced.large_table);

        let body = services
            .objects
            .get(&announced.s3_bucket_name, &announced.s3_object_key)
            .await
            .unwrap();
        let (partitions, skipped) = decode_partition_lines(&body);
        assert_eq!(partitions.len(), 40);
        assert_eq!(skipped, 0);

        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_large_table"], true);
        assert_eq!(rows[0]["is_exported"], true);
        assert_eq!(rows[0]["object_key"], announced.s3_object_key.as_str());
    }

    #[tokio::test]
    async fn test_flag_is_honored_even_when_small() {
        let config = ReplConfig::default();
        let services = seeded(&config, 2).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let summary = pipeline
            .handle_large_table_batch(&[request("wide", 40, true, &config)])
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(services.bus.take(&config.topics.export).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unflagged_record_fails_batch() {
        let config = ReplConfig::default();
        let services = seeded(&config, 40).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let err = pipeline
            .handle_large_table_batch(&[request("wide", 40, false, &config)])
            .await
            .unwrap_err();

        assert!(matches!(err, ReplError::Incomplete { failed: 1, total: 1 }));
        assert!(services.bus.take(&config.topics.export).await.is_empty());
        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_exported"], false);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_batch_and_is_recorded() {
        let config = ReplConfig::default();
        let services = seeded(&config, 40).await;
        services.bus.fail_topic(&config.topics.export).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let result = pipeline
            .handle_large_table_batch(&[request("wide", 40, true, &config)])
            .await;

        assert!(result.is_err());
        let rows = services.status.rows(&config.ledger.table_export).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_exported"], false);
        assert!(rows[0].get("object_key").map_or(true, |v| v.is_null()));
    }

    #[tokio::test]
    async fn test_wrong_schema_type_is_dropped() {
        let config = ReplConfig::default();
        let services = seeded(&config, 40).await;
        let pipeline = ExportPipeline::new(config.clone(), &services.collaborators());

        let correlation = Correlation::new("batch-3", &config.source_catalog_id);
        let message = envelope::forward_message("{}", &correlation, SchemaType::Table);
        let summary = pipeline.handle_large_table_batch(&[message]).await.unwrap();

        assert_eq!(summary.dropped, 1);
    }
}
