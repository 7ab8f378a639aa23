//! Target-side large-table stage.
//!
//! Consumes the import large-table queue. Each record carries a
//! `largeTable` envelope; the partitions object it points at is read as
//! newline-delimited JSON and the unit goes through the same state machine
//! as inline imports.

use crate::envelope::{LargeTableEnvelope, QueueRecord, ReplicationRun, SchemaType};
use crate::error::{ReplError, Result};
use crate::import::{table_disposition, ImportPipeline};
use crate::messaging::Message;
use crate::model::TableUnit;
use crate::object_store;
use crate::outcome::{BatchSummary, Disposition, TableOutcome};
use tracing::{info, warn};

impl ImportPipeline {
    /// Handle one batch of large-table queue records.
    ///
    /// A unit whose partitions were not fully reconciled, or whose object
    /// could not be fetched, fails the batch for redelivery. An object with
    /// no parseable partition lines is recorded and dropped. Units whose
    /// table write failed are dead-lettered and count as processed.
    pub async fn handle_large_table_batch(&self, records: &[Message]) -> Result<BatchSummary> {
        let import_run_id = ReplicationRun::start().run_id;
        let mut summary = BatchSummary::new(records.len());

        for record in records {
            let disposition = match QueueRecord::decode(record) {
                Ok(queued) if queued.schema_type == SchemaType::LargeTable => {
                    table_disposition(&self.import_large_record(import_run_id, &queued).await)
                }
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
            run_id = import_run_id,
            received = summary.received,
            processed = summary.processed,
            failed = summary.failed,
            "large table import batch handled"
        );
        summary.into_result()
    }

    /// Import one large-table record.
    pub async fn import_large_record(&self, import_run_id: u64, queued: &QueueRecord) -> Result<TableOutcome> {
        let announcement: LargeTableEnvelope = serde_json::from_str(&queued.body)
            .map_err(|e| ReplError::parse(format!("large table body: {}", e)))?;
        let pointer = announcement.pointer();

        let body = match self.objects.get(&pointer.bucket_name, &pointer.object_key).await {
            Ok(body) => body,
            Err(e) => {
                self.record_unreadable(import_run_id, &queued.correlation, &pointer, &queued.body, &e)
                    .await;
                return Err(e);
            }
        };

        let (partitions, skipped) = object_store::decode_partition_lines(&body);
        if partitions.is_empty() && skipped > 0 {
            let e = ReplError::parse(format!(
                "large table object {}/{} has no parseable partition lines ({} skipped)",
                pointer.bucket_name, pointer.object_key, skipped
            ));
            self.record_unreadable(import_run_id, &queued.correlation, &pointer, &queued.body, &e)
                .await;
            return Err(e);
        }
        if skipped > 0 {
            warn!(
                table = %announcement.table.table_ref(),
                skipped,
                parsed = partitions.len(),
                "some partition lines were skipped"
            );
        }
        if partitions.len() != announcement.number_of_partitions {
            warn!(
                table = %announcement.table.table_ref(),
                expected = announcement.number_of_partitions,
                parsed = partitions.len(),
                "partition count differs from the envelope"
            );
        }

        let unit = TableUnit::new(announcement.table, partitions);
        self.apply_unit(import_run_id, &queued.correlation, unit, &queued.body, SchemaType::LargeTable)
            .await
    }
}
