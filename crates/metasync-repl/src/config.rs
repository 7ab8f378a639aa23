//! Replication configuration.
//!
//! Every tunable the pipelines read lives here and is passed explicitly into
//! their constructors. A config can be built in code, loaded from a TOML or
//! JSON file, and overlaid with the deployment's environment variables.
//!
//! ```text
//! ReplConfig
//! ├── source_catalog_id / target_catalog_id / region
//! ├── skip_archive
//! ├── tiering:  TierThresholds   # P and S
//! ├── batching: BatchLimits      # chunk and batch sizes
//! ├── topics / queues / object_store
//! ├── ledger:   LedgerTables     # status store table names
//! ├── planner:  PlannerConfig    # database prefix filter
//! └── retry:    RetryConfig      # transport-level backoff
//! ```

use crate::error::{ReplError, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard service limit on partitions per batch-create call.
pub const MAX_PARTITION_CREATE_BATCH: usize = 100;
/// Hard service limit on partitions per batch-delete call.
pub const MAX_PARTITION_DELETE_BATCH: usize = 25;
/// Hard service limit on items per status-store batch write.
pub const MAX_LEDGER_BATCH: usize = 25;

/// Thresholds that drive tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// P: the most partitions a table may carry inline.
    pub max_inline_partitions: usize,
    /// S: serialized units at or above this many bytes overflow to the object store.
    pub max_message_bytes: usize,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            max_inline_partitions: 10,
            max_message_bytes: 245_000,
        }
    }
}

/// Chunk and batch sizes bounding message and request size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    /// Tables per `table_list` message.
    pub tables_per_chunk: usize,
    /// Items per status-store batch write.
    pub ledger_batch_size: usize,
    /// Resubmissions of unprocessed ledger items before giving up.
    pub ledger_max_resubmits: u32,
    /// Partitions per batch-create call.
    pub partition_create_batch: usize,
    /// Partitions per batch-delete call.
    pub partition_delete_batch: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            tables_per_chunk: 50,
            ledger_batch_size: MAX_LEDGER_BATCH,
            ledger_max_resubmits: 8,
            partition_create_batch: MAX_PARTITION_CREATE_BATCH,
            partition_delete_batch: MAX_PARTITION_DELETE_BATCH,
        }
    }
}

/// Bus topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    /// Database and table definitions bound for the target account.
    pub export: String,
    /// `table_list` chunks consumed by the export stage itself.
    pub table_list: String,
    /// Planner output: one `database` message per database to replicate.
    pub planner: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            export: "catalog-export".to_string(),
            table_list: "catalog-table-list".to_string(),
            planner: "catalog-replication-planner".to_string(),
        }
    }
}

/// Queue identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Queues {
    /// Source-side queue for deferred (large) tables.
    pub large_table_export: String,
    /// Target-side queue for large-table imports.
    pub large_table_import: String,
    /// Target-side dead-letter queue.
    pub dead_letter: String,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            large_table_export: "large-table-export".to_string(),
            large_table_import: "large-table-import".to_string(),
            dead_letter: "catalog-import-dlq".to_string(),
        }
    }
}

/// Object store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Bucket holding overflow and large-table objects.
    pub bucket: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: "catalog-large-table-schema".to_string(),
        }
    }
}

/// Status store table names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerTables {
    /// Database export rows.
    pub db_export: String,
    /// Table export rows.
    pub table_export: String,
    /// Database import rows.
    pub db_import: String,
    /// Table import rows.
    pub table_import: String,
    /// Planner rows.
    pub planner: String,
}

impl Default for LedgerTables {
    fn default() -> Self {
        Self {
            db_export: "db_export_status".to_string(),
            table_export: "table_export_status".to_string(),
            db_import: "db_import_status".to_string(),
            table_import: "table_import_status".to_string(),
            planner: "replication_planner_status".to_string(),
        }
    }
}

/// Planner database selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Separator-delimited database name prefixes; empty selects everything.
    pub database_prefixes: String,
    /// Separator between prefixes.
    pub separator: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            database_prefixes: String::new(),
            separator: "|".to_string(),
        }
    }
}

impl PlannerConfig {
    /// Split the prefix list into trimmed, non-empty prefixes.
    pub fn prefixes(&self) -> Vec<String> {
        if self.separator.is_empty() {
            let prefix = self.database_prefixes.trim();
            return if prefix.is_empty() {
                vec![]
            } else {
                vec![prefix.to_string()]
            };
        }
        self.database_prefixes
            .split(self.separator.as_str())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    }
}

/// The top-level config passed to every pipeline constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Catalog (account) id replicated from.
    pub source_catalog_id: String,
    /// Catalog (account) id replicated into.
    pub target_catalog_id: String,
    /// Region tag carried on large-table envelopes.
    pub region: String,
    /// Skip archiving the previous table version on update.
    pub skip_archive: bool,
    /// Tier thresholds.
    pub tiering: TierThresholds,
    /// Chunk and batch sizes.
    pub batching: BatchLimits,
    /// Bus topics.
    pub topics: Topics,
    /// Queue identifiers.
    pub queues: Queues,
    /// Object store settings.
    pub object_store: ObjectStoreConfig,
    /// Status store table names.
    pub ledger: LedgerTables,
    /// Planner selection.
    pub planner: PlannerConfig,
    /// Transport-level retry policy.
    pub retry: RetryConfig,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            source_catalog_id: "1234567890".to_string(),
            target_catalog_id: "1234567890".to_string(),
            region: "us-east-1".to_string(),
            skip_archive: true,
            tiering: TierThresholds::default(),
            batching: BatchLimits::default(),
            topics: Topics::default(),
            queues: Queues::default(),
            object_store: ObjectStoreConfig::default(),
            ledger: LedgerTables::default(),
            planner: PlannerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReplConfig {
    /// Load a config from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ReplError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Overlay values from the deployment's environment variable names.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `source_glue_catalog_id` | `source_catalog_id` |
    /// | `target_glue_catalog_id` | `target_catalog_id` |
    /// | `region` | `region` |
    /// | `skip_archive` | `skip_archive` (`true` enables) |
    /// | `sns_topic_arn_export_dbs_tables` | `topics.export` |
    /// | `sns_topic_arn_table_list` | `topics.table_list` |
    /// | `sns_topic_arn_gdc_replication_planner` | `topics.planner` |
    /// | `sqs_queue_url_large_tables` | `queues.large_table_export` and `queues.large_table_import` |
    /// | `dlq_url_sqs` | `queues.dead_letter` |
    /// | `s3_large_table_schema` / `s3_bucket_name` | `object_store.bucket` |
    /// | `ddb_name_db_export_status` | `ledger.db_export` |
    /// | `ddb_name_table_export_status` | `ledger.table_export` |
    /// | `ddb_name_db_import_status` | `ledger.db_import` |
    /// | `ddb_name_table_import_status` | `ledger.table_import` |
    /// | `ddb_name_gdc_replication_planner` | `ledger.planner` |
    /// | `database_prefix_list` | `planner.database_prefixes` |
    /// | `separator` | `planner.separator` |
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, name: &str| {
            if let Some(value) = lookup(name) {
                *target = value;
            }
        };

        set(&mut self.source_catalog_id, "source_glue_catalog_id");
        set(&mut self.target_catalog_id, "target_glue_catalog_id");
        set(&mut self.region, "region");
        set(&mut self.topics.export, "sns_topic_arn_export_dbs_tables");
        set(&mut self.topics.table_list, "sns_topic_arn_table_list");
        set(&mut self.topics.planner, "sns_topic_arn_gdc_replication_planner");
        set(&mut self.queues.large_table_export, "sqs_queue_url_large_tables");
        set(&mut self.queues.large_table_import, "sqs_queue_url_large_tables");
        set(&mut self.queues.dead_letter, "dlq_url_sqs");
        set(&mut self.object_store.bucket, "s3_bucket_name");
        set(&mut self.object_store.bucket, "s3_large_table_schema");
        set(&mut self.ledger.db_export, "ddb_name_db_export_status");
        set(&mut self.ledger.table_export, "ddb_name_table_export_status");
        set(&mut self.ledger.db_import, "ddb_name_db_import_status");
        set(&mut self.ledger.table_import, "ddb_name_table_import_status");
        set(&mut self.ledger.planner, "ddb_name_gdc_replication_planner");
        set(&mut self.planner.database_prefixes, "database_prefix_list");
        set(&mut self.planner.separator, "separator");

        if let Some(value) = lookup("skip_archive") {
            self.skip_archive = value.trim().eq_ignore_ascii_case("true");
        }
    }

    /// Reject settings the pipelines or backing services cannot honor.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ReplError::Config { msg });

        if self.tiering.max_message_bytes == 0 {
            return fail("tiering.max_message_bytes must be positive".into());
        }
        if self.batching.tables_per_chunk == 0 {
            return fail("batching.tables_per_chunk must be positive".into());
        }
        let bounded = [
            ("batching.ledger_batch_size", self.batching.ledger_batch_size, MAX_LEDGER_BATCH),
            (
                "batching.partition_create_batch",
                self.batching.partition_create_batch,
                MAX_PARTITION_CREATE_BATCH,
            ),
            (
                "batching.partition_delete_batch",
                self.batching.partition_delete_batch,
                MAX_PARTITION_DELETE_BATCH,
            ),
        ];
        for (name, value, max) in bounded {
            if value == 0 || value > max {
                return fail(format!("{} must be between 1 and {}, got {}", name, max, value));
            }
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be positive".into());
        }
        if self.source_catalog_id.is_empty() || self.target_catalog_id.is_empty() {
            return fail("catalog ids must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ReplConfig::default();
        assert_eq!(config.tiering.max_inline_partitions, 10);
        assert_eq!(config.tiering.max_message_bytes, 245_000);
        assert_eq!(config.batching.tables_per_chunk, 50);
        assert_eq!(config.batching.ledger_batch_size, 25);
        assert_eq!(config.batching.partition_create_batch, 100);
        assert_eq!(config.batching.partition_delete_batch, 25);
        assert_eq!(config.retry.max_attempts, 10);
        assert!(config.skip_archive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
source_catalog_id = "111111111111"
target_catalog_id = "222222222222"

[tiering]
max_inline_partitions = 20

[object_store]
bucket = "schemas"
"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source_catalog_id, "111111111111");
        assert_eq!(config.target_catalog_id, "222222222222");
        assert_eq!(config.tiering.max_inline_partitions, 20);
        assert_eq!(config.tiering.max_message_bytes, 245_000);
        assert_eq!(config.object_store.bucket, "schemas");
        assert_eq!(config.batching, BatchLimits::default());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"region": "eu-west-1", "batching": {{"tables_per_chunk": 10}}}}"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.batching.tables_per_chunk, 10);
        assert_eq!(config.batching.ledger_batch_size, 25);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = ReplConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[test]
    fn test_apply_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("source_glue_catalog_id", "111"),
            ("target_glue_catalog_id", "222"),
            ("dlq_url_sqs", "https://queue/dlq"),
            ("s3_large_table_schema", "overflow-bucket"),
            ("skip_archive", "false"),
            ("database_prefix_list", "sales_|hr_"),
        ]
        .into_iter()
        .collect();

        let mut config = ReplConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.source_catalog_id, "111");
        assert_eq!(config.target_catalog_id, "222");
        assert_eq!(config.queues.dead_letter, "https://queue/dlq");
        assert_eq!(config.object_store.bucket, "overflow-bucket");
        assert!(!config.skip_archive);
        assert_eq!(config.planner.prefixes(), vec!["sales_", "hr_"]);
        assert_eq!(config.topics, Topics::default());
    }

    #[test]
    fn test_validate_rejects_oversized_batches() {
        let mut config = ReplConfig::default();
        config.batching.partition_create_batch = 101;
        assert!(config.validate().is_err());

        let mut config = ReplConfig::default();
        config.batching.partition_delete_batch = 0;
        assert!(config.validate().is_err());

        let mut config = ReplConfig::default();
        config.batching.tables_per_chunk = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_planner_prefixes() {
        let planner = PlannerConfig {
            database_prefixes: " sales_ || hr_ |".to_string(),
            separator: "|".to_string(),
        };
        assert_eq!(planner.prefixes(), vec!["sales_", "hr_"]);
        assert!(PlannerConfig::default().prefixes().is_empty());
    }
}
