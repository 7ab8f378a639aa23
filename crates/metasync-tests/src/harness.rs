//! Test harness: one source and one target catalog over in-memory services,
//! with helpers to seed the source and pump a sweep through every stage.

use metasync_repl::config::ReplConfig;
use metasync_repl::memory::MemoryServices;
use metasync_repl::messaging::Message;
use metasync_repl::model::{Database, Partition, Table, TableRef};
use metasync_repl::outcome::BatchSummary;
use metasync_repl::retry::RetryConfig;
use metasync_repl::services::Collaborators;
use metasync_repl::{ExportPipeline, ImportPipeline, ReplicationPlanner, Result};

/// Source catalog id used by the harness.
pub const SOURCE: &str = "111111111111";
/// Target catalog id used by the harness.
pub const TARGET: &str = "222222222222";

/// `n` single-key partitions named `prefix0..prefixN`.
pub fn partitions(prefix: &str, n: usize) -> Vec<Partition> {
    (0..n)
        .map(|i| Partition::with_values([format!("{}{}", prefix, i)]))
        .collect()
}

/// Results of one stage of a sweep.
#[derive(Debug)]
pub struct StageResult {
    /// Stage name.
    pub stage: &'static str,
    /// Messages delivered to the stage.
    pub delivered: Vec<Message>,
    /// What the stage returned.
    pub result: Result<BatchSummary>,
}

/// In-memory replication environment.
pub struct ReplHarness {
    /// Pipeline configuration.
    pub config: ReplConfig,
    /// The in-memory services.
    pub services: MemoryServices,
    retry: Option<RetryConfig>,
}

impl ReplHarness {
    /// Harness with default thresholds and distinct catalog ids.
    pub fn new() -> Self {
        let mut config = ReplConfig::default();
        config.source_catalog_id = SOURCE.to_string();
        config.target_catalog_id = TARGET.to_string();
        Self::with_config(config)
    }

    /// Harness with a custom configuration.
    pub fn with_config(config: ReplConfig) -> Self {
        Self {
            config,
            services: MemoryServices::new(),
            retry: None,
        }
    }

    /// Route collaborator calls through a fast retry policy.
    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.retry = Some(RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        });
        self
    }

    /// Collaborators for a fresh pipeline.
    pub fn collaborators(&self) -> Collaborators {
        let collaborators = self.services.collaborators();
        match &self.retry {
            Some(retry) => collaborators.with_retry(retry),
            None => collaborators,
        }
    }

    /// A planner over the harness services.
    pub fn planner(&self) -> ReplicationPlanner {
        ReplicationPlanner::new(self.config.clone(), &self.collaborators())
    }

    /// An export pipeline over the harness services.
    pub fn export(&self) -> ExportPipeline {
        ExportPipeline::new(self.config.clone(), &self.collaborators())
    }

    /// An import pipeline over the harness services.
    pub fn import(&self) -> ImportPipeline {
        ImportPipeline::new(self.config.clone(), &self.collaborators())
    }

    /// Add a database to the source catalog.
    pub async fn seed_database(&self, name: &str) {
        self.services
            .catalog
            .insert_database(SOURCE, Database::named(name))
            .await;
    }

    /// Add a table with partitions to the source catalog.
    pub async fn seed_table(&self, table: Table, parts: Vec<Partition>) -> TableRef {
        let table_ref = table.table_ref();
        self.services.catalog.insert_table(SOURCE, table).await;
        self.services
            .catalog
            .insert_partitions(SOURCE, &table_ref, parts)
            .await;
        table_ref
    }

    /// Partitions of a table in the target catalog.
    pub async fn target_partitions(&self, table: &TableRef) -> Vec<Partition> {
        self.services.catalog.partitions(TARGET, table).await
    }

    /// Whether a table exists in the target catalog.
    pub async fn target_has_table(&self, table: &TableRef) -> bool {
        self.services.catalog.table(TARGET, table).await.is_some()
    }

    /// Run the planner, then drain every topic and queue in stage order.
    pub async fn sweep(&self) -> Vec<StageResult> {
        let mut stages = Vec::new();
        if let Err(e) = self.planner().plan().await {
            stages.push(StageResult {
                stage: "plan",
                delivered: Vec::new(),
                result: Err(e),
            });
            return stages;
        }
        stages.extend(self.drain().await);
        stages
    }

    /// Drain every topic and queue once, in stage order.
    pub async fn drain(&self) -> Vec<StageResult> {
        let export = self.export();
        let import = self.import();
        let bus = &self.services.bus;
        let queue = &self.services.queue;
        let mut stages = Vec::new();

        let delivered = bus.take(&self.config.topics.planner).await;
        let result = export.handle_event(&delivered).await;
        stages.push(StageResult { stage: "export databases", delivered, result });

        let delivered = bus.take(&self.config.topics.table_list).await;
        let result = export.handle_event(&delivered).await;
        stages.push(StageResult { stage: "export chunks", delivered, result });

        let delivered = queue.take(&self.config.queues.large_table_export).await;
        let result = export.handle_large_table_batch(&delivered).await;
        stages.push(StageResult { stage: "export large tables", delivered, result });

        let delivered = bus.take(&self.config.topics.export).await;
        let result = import.handle_bus_batch(&delivered).await;
        stages.push(StageResult { stage: "import", delivered, result });

        let delivered = queue.take(&self.config.queues.large_table_import).await;
        let result = import.handle_large_table_batch(&delivered).await;
        stages.push(StageResult { stage: "import large tables", delivered, result });

        stages
    }

    /// Ledger rows written to the configured store table.
    pub async fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.services.status.rows(table).await
    }
}

impl Default for ReplHarness {
    fn default() -> Self {
        Self::new()
    }
}
