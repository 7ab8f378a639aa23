//! Status ledger: the append-only audit trail of export and import attempts.
//!
//! Every attempt writes a new row. Nothing is merged or updated in place;
//! readers that want "the current state" of an entity pick the row with the
//! highest run id (see [`latest_attempts`]). Row field names are the ones the
//! status tables have always used, so existing dashboards keep working.

use crate::config::{LedgerTables, ReplConfig};
use crate::error::{ReplError, Result};
use crate::object_store::ObjectPointer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Upsert access to the status store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write one item.
    async fn put_item(&self, table: &str, item: Value) -> Result<()>;

    /// Write up to the store's batch limit of items. Returns the items the
    /// store did not process.
    async fn batch_write(&self, table: &str, items: Vec<Value>) -> Result<Vec<Value>>;
}

/// The status tables the pipelines write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedgerTable {
    /// Database export attempts.
    DbExport,
    /// Table export attempts.
    TableExport,
    /// Database import attempts.
    DbImport,
    /// Table import attempts.
    TableImport,
    /// Planner sweeps; holds database export rows.
    Planner,
}

impl LedgerTables {
    /// Configured store table name for a ledger table.
    pub fn name(&self, table: LedgerTable) -> &str {
        match table {
            LedgerTable::DbExport => &self.db_export,
            LedgerTable::TableExport => &self.table_export,
            LedgerTable::DbImport => &self.db_import,
            LedgerTable::TableImport => &self.table_import,
            LedgerTable::Planner => &self.planner,
        }
    }
}

/// One database export attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseExportRecord {
    /// Database name.
    pub db_id: String,
    /// Run id of the export sweep.
    pub export_run_id: u64,
    /// Batch id correlating the sweep's messages.
    pub export_batch_id: String,
    /// Source catalog id.
    pub source_glue_catalog_id: String,
    /// Exported database definition (JSON).
    pub database_schema: String,
    /// Bus delivery id; empty when the publish failed.
    pub sns_msg_id: String,
    /// Whether the publish succeeded.
    pub is_exported: bool,
}

/// One table export attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableExportRecord {
    /// `table|database`.
    pub table_id: String,
    /// Run id of the export sweep.
    pub export_run_id: u64,
    /// Batch id correlating the sweep's messages.
    pub export_batch_id: String,
    /// Source catalog id.
    pub source_glue_catalog_id: String,
    /// Exported payload (JSON), or empty when it could not be encoded.
    pub table_schema: String,
    /// Bus delivery id; empty when the publish failed.
    pub sns_msg_id: String,
    /// Whether the publish succeeded.
    pub is_exported: bool,
    /// Whether the table went through a non-inline tier.
    pub is_large_table: bool,
    /// Object bucket, set only when the pointer envelope was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket_name: Option<String>,
    /// Object key, set only when the pointer envelope was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
}

impl TableExportRecord {
    /// Attach the object pointer, as done once a pointer envelope is published.
    pub fn with_pointer(mut self, pointer: &ObjectPointer) -> Self {
        self.s3_bucket_name = Some(pointer.bucket_name.clone());
        self.object_key = Some(pointer.object_key.clone());
        self
    }
}

/// One database import attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseImportRecord {
    /// Database name.
    pub db_id: String,
    /// Run id of the import invocation.
    pub import_run_id: u64,
    /// Batch id the database was exported under.
    pub export_batch_id: String,
    /// Target catalog id.
    pub target_glue_catalog_id: String,
    /// Source catalog id.
    pub source_glue_catalog_id: String,
    /// Whether this attempt created the database.
    pub is_created: bool,
    /// Whether this attempt failed.
    #[serde(default)]
    pub error: bool,
}

/// One table import attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableImportRecord {
    /// `table|database`.
    pub table_id: String,
    /// Run id of the import invocation.
    pub import_run_id: u64,
    /// Batch id the table was exported under.
    pub export_batch_id: String,
    /// Table name.
    pub table_name: String,
    /// Database name.
    pub database_name: String,
    /// Imported table definition (JSON), or the object pointer for
    /// units that could not be fetched.
    pub table_schema: String,
    /// Target catalog id.
    pub target_glue_catalog_id: String,
    /// Source catalog id.
    pub source_glue_catalog_id: String,
    /// The table was created.
    pub table_created: bool,
    /// The table was updated.
    pub table_updated: bool,
    /// The exported unit carried partitions.
    pub export_has_partitions: bool,
    /// Partition reconciliation completed without failures.
    pub partitions_updated: bool,
    /// The attempt failed.
    #[serde(default)]
    pub error: bool,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A ledger row of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusRecord {
    /// Database export attempt.
    DatabaseExport(DatabaseExportRecord),
    /// Table export attempt.
    TableExport(TableExportRecord),
    /// Database import attempt.
    DatabaseImport(DatabaseImportRecord),
    /// Table import attempt.
    TableImport(TableImportRecord),
}

impl StatusRecord {
    /// The ledger table this row belongs to.
    pub fn table(&self) -> LedgerTable {
        match self {
            StatusRecord::DatabaseExport(_) => LedgerTable::DbExport,
            StatusRecord::TableExport(_) => LedgerTable::TableExport,
            StatusRecord::DatabaseImport(_) => LedgerTable::DbImport,
            StatusRecord::TableImport(_) => LedgerTable::TableImport,
        }
    }

    /// Entity key: database name or `table|database`.
    pub fn entity_key(&self) -> &str {
        match self {
            StatusRecord::DatabaseExport(r) => &r.db_id,
            StatusRecord::TableExport(r) => &r.table_id,
            StatusRecord::DatabaseImport(r) => &r.db_id,
            StatusRecord::TableImport(r) => &r.table_id,
        }
    }

    /// Export or import run id.
    pub fn run_id(&self) -> u64 {
        match self {
            StatusRecord::DatabaseExport(r) => r.export_run_id,
            StatusRecord::TableExport(r) => r.export_run_id,
            StatusRecord::DatabaseImport(r) => r.import_run_id,
            StatusRecord::TableImport(r) => r.import_run_id,
        }
    }

    /// Whether the attempt this row records succeeded.
    pub fn succeeded(&self) -> bool {
        match self {
            StatusRecord::DatabaseExport(r) => r.is_exported,
            StatusRecord::TableExport(r) => r.is_exported,
            StatusRecord::DatabaseImport(r) => !r.error,
            StatusRecord::TableImport(r) => !r.error,
        }
    }

    /// Store item for this row.
    pub fn to_item(&self) -> Result<Value> {
        let value = match self {
            StatusRecord::DatabaseExport(r) => serde_json::to_value(r)?,
            StatusRecord::TableExport(r) => serde_json::to_value(r)?,
            StatusRecord::DatabaseImport(r) => serde_json::to_value(r)?,
            StatusRecord::TableImport(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    /// Decode a store item read back from `table`.
    pub fn from_item(table: LedgerTable, item: Value) -> Result<Self> {
        let record = match table {
            LedgerTable::DbExport | LedgerTable::Planner => {
                StatusRecord::DatabaseExport(serde_json::from_value(item)?)
            }
            LedgerTable::TableExport => StatusRecord::TableExport(serde_json::from_value(item)?),
            LedgerTable::DbImport => StatusRecord::DatabaseImport(serde_json::from_value(item)?),
            LedgerTable::TableImport => StatusRecord::TableImport(serde_json::from_value(item)?),
        };
        Ok(record)
    }
}

/// Writer for the status ledger.
#[derive(Clone)]
pub struct StatusLedger {
    store: Arc<dyn StatusStore>,
    tables: LedgerTables,
    batch_size: usize,
    max_resubmits: u32,
}

impl StatusLedger {
    /// Create a ledger over `store` using the configured table names and batch limits.
    pub fn new(store: Arc<dyn StatusStore>, config: &ReplConfig) -> Self {
        Self {
            store,
            tables: config.ledger.clone(),
            batch_size: config.batching.ledger_batch_size.max(1),
            max_resubmits: config.batching.ledger_max_resubmits,
        }
    }

    /// Append one row to its own ledger table.
    pub async fn record(&self, record: &StatusRecord) -> Result<()> {
        self.record_in(record.table(), record).await
    }

    /// Append one row to an explicitly chosen ledger table.
    pub async fn record_in(&self, ledger_table: LedgerTable, record: &StatusRecord) -> Result<()> {
        let table = self.tables.name(ledger_table);
        let item = record.to_item()?;
        self.store.put_item(table, item).await.map_err(|e| {
            error!(table, entity = record.entity_key(), error = %e, "ledger write failed");
            e
        })?;
        debug!(table, entity = record.entity_key(), run_id = record.run_id(), "ledger row written");
        Ok(())
    }

    /// Append many rows using batched writes.
    ///
    /// Rows are grouped per ledger table and sent in slices of the batch
    /// size. Items the store leaves unprocessed are resubmitted, alone, up
    /// to the resubmit budget. Returns the number of rows written, or
    /// [`ReplError::PartialBatch`] naming the first table left incomplete.
    pub async fn batch_record(&self, records: &[StatusRecord]) -> Result<usize> {
        let mut grouped: BTreeMap<LedgerTable, Vec<Value>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.table()).or_default().push(record.to_item()?);
        }

        let mut written = 0;
        let mut incomplete: Option<ReplError> = None;

        for (ledger_table, items) in grouped {
            let table = self.tables.name(ledger_table);
            let total = items.len();
            let mut remaining = 0;

            for slice in items.chunks(self.batch_size) {
                let left = self.write_slice(table, slice.to_vec()).await?;
                remaining += left;
            }

            written += total - remaining;
            if remaining > 0 {
                error!(table, failed = remaining, total, "ledger batch left items unprocessed");
                incomplete.get_or_insert(ReplError::PartialBatch {
                    target: table.to_string(),
                    failed: remaining,
                    total,
                });
            } else {
                debug!(table, rows = total, "ledger batch written");
            }
        }

        match incomplete {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Write one slice, resubmitting unprocessed items. Returns how many
    /// items were still unprocessed when the budget ran out.
    async fn write_slice(&self, table: &str, items: Vec<Value>) -> Result<usize> {
        let mut pending = self.store.batch_write(table, items).await?;
        let mut resubmits = 0;

        while !pending.is_empty() && resubmits < self.max_resubmits {
            resubmits += 1;
            warn!(table, unprocessed = pending.len(), resubmit = resubmits, "resubmitting unprocessed ledger items");
            pending = self.store.batch_write(table, pending).await?;
        }

        Ok(pending.len())
    }
}

/// The most recent attempt per entity and ledger table, by run id. On equal
/// run ids the later row wins.
pub fn latest_attempts(records: &[StatusRecord]) -> Vec<&StatusRecord> {
    let mut latest: BTreeMap<(LedgerTable, &str), &StatusRecord> = BTreeMap::new();
    for record in records {
        let key = (record.table(), record.entity_key());
        match latest.get(&key) {
            Some(current) if current.run_id() > record.run_id() => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    latest.into_values().collect()
}
