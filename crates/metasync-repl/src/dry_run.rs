//! End-to-end dry run over the in-memory collaborators.
//!
//! Loads a source catalog snapshot, then drains every topic and queue stage
//! by stage: planner, database export, chunk export, large-table export,
//! import, large-table import. Source and target share one in-memory
//! catalog under different catalog ids.

use crate::config::ReplConfig;
use crate::error::{ReplError, Result};
use crate::export::ExportPipeline;
use crate::import::ImportPipeline;
use crate::ledger::{latest_attempts, LedgerTable, StatusRecord};
use crate::memory::{CatalogSnapshot, MemoryServices};
use crate::messaging::Message;
use crate::outcome::BatchSummary;
use crate::planner::{PlanReport, ReplicationPlanner};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Counts for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub stage: String,
    /// Records delivered to the stage.
    pub received: usize,
    /// Records processed.
    pub processed: usize,
    /// Records dropped as malformed.
    pub dropped: usize,
    /// Records that would have been redelivered.
    pub failed: usize,
}

/// Rows of one ledger table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    /// Every row written.
    pub rows: usize,
    /// Entities whose latest attempt succeeded.
    pub succeeded: usize,
    /// Entities whose latest attempt failed.
    pub failed: usize,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    /// Batch id of the sweep.
    pub batch_id: String,
    /// Databases published by the planner.
    pub databases_planned: usize,
    /// Per-stage counts, in execution order.
    pub stages: Vec<StageReport>,
    /// Ledger summary per store table.
    pub ledger: BTreeMap<String, LedgerCounts>,
    /// Messages left on the dead-letter queue.
    pub dead_letters: usize,
}

/// Drives one replication sweep through in-memory collaborators.
pub struct DryRun {
    config: ReplConfig,
    services: MemoryServices,
}

impl DryRun {
    /// A dry run over fresh in-memory services.
    pub fn new(config: ReplConfig) -> Result<Self> {
        config.validate()?;
        if config.source_catalog_id == config.target_catalog_id {
            return Err(ReplError::Config {
                msg: "dry run needs distinct source and target catalog ids".into(),
            });
        }
        Ok(Self {
            config,
            services: MemoryServices::new(),
        })
    }

    /// The services, for inspection after [`DryRun::run`].
    pub fn services(&self) -> &MemoryServices {
        &self.services
    }

    /// Load `snapshot` as the source catalog.
    pub async fn load(&self, snapshot: CatalogSnapshot) {
        self.services
            .catalog
            .load_snapshot(&self.config.source_catalog_id, snapshot)
            .await;
    }

    /// Run every stage until the topics and queues are drained.
    pub async fn run(&self) -> Result<DryRunReport> {
        let collaborators = self.services.collaborators();
        let planner = ReplicationPlanner::new(self.config.clone(), &collaborators);
        let export = ExportPipeline::new(self.config.clone(), &collaborators);
        let import = ImportPipeline::new(self.config.clone(), &collaborators);
        let topics = &self.config.topics;
        let queues = &self.config.queues;

        let plan: PlanReport = planner.plan().await?;
        let mut stages = Vec::new();

        let batch = self.services.bus.take(&topics.planner).await;
        stages.push(stage("export databases", &batch, export.handle_event(&batch).await));

        let batch = self.services.bus.take(&topics.table_list).await;
        stages.push(stage("export chunks", &batch, export.handle_event(&batch).await));

        let batch = self.services.queue.take(&queues.large_table_export).await;
        stages.push(stage(
            "export large tables",
            &batch,
            export.handle_large_table_batch(&batch).await,
        ));

        let batch = self.services.bus.take(&topics.export).await;
        stages.push(stage("import", &batch, import.handle_bus_batch(&batch).await));

        let batch = self.services.queue.take(&queues.large_table_import).await;
        stages.push(stage(
            "import large tables",
            &batch,
            import.handle_large_table_batch(&batch).await,
        ));

        let mut ledger = BTreeMap::new();
        for table in [
            LedgerTable::Planner,
            LedgerTable::DbExport,
            LedgerTable::TableExport,
            LedgerTable::DbImport,
            LedgerTable::TableImport,
        ] {
            let name = self.config.ledger.name(table).to_string();
            ledger.insert(name.clone(), self.ledger_counts(table, &name).await?);
        }

        let dead_letters = self.services.queue.take(&queues.dead_letter).await.len();
        info!(batch_id = %plan.run.batch_id, dead_letters, "dry run finished");
        Ok(DryRunReport {
            batch_id: plan.run.batch_id,
            databases_planned: plan.published,
            stages,
            ledger,
            dead_letters,
        })
    }

    async fn ledger_counts(&self, table: LedgerTable, name: &str) -> Result<LedgerCounts> {
        let records = self
            .services
            .status
            .rows(name)
            .await
            .into_iter()
            .map(|item| StatusRecord::from_item(table, item))
            .collect::<Result<Vec<_>>>()?;
        let latest = latest_attempts(&records);
        let succeeded = latest.iter().filter(|r| r.succeeded()).count();
        Ok(LedgerCounts {
            rows: records.len(),
            succeeded,
            failed: latest.len() - succeeded,
        })
    }
}

fn stage(name: &str, batch: &[Message], result: Result<BatchSummary>) -> StageReport {
    let mut report = StageReport {
        stage: name.to_string(),
        received: batch.len(),
        processed: 0,
        dropped: 0,
        failed: 0,
    };
    match result {
        Ok(summary) => {
            report.processed = summary.processed;
            report.dropped = summary.dropped;
        }
        Err(ReplError::Incomplete { failed, total }) => {
            warn!(stage = name, failed, total, "stage incomplete");
            report.processed = total.saturating_sub(failed);
            report.failed = failed;
        }
        Err(e) => {
            warn!(stage = name, error = %e, "stage failed");
            report.failed = batch.len();
        }
    }
    report
}
