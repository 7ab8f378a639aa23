//! Catalog bridge.
//!
//! [`CatalogApi`] is the raw service surface of the metadata catalog: one
//! call per service request, pagination exposed as continuation tokens.
//! [`CatalogBridge`] is the thin wrapper the pipelines use. It drains
//! paginated listings, slices partition batches to service limits and turns
//! write errors into structured outcomes.

use crate::error::{ReplError, Result};
use crate::model::{Database, DatabaseInput, Partition, PartitionInput, Table, TableInput, TableRef};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page, in catalog order.
    pub items: Vec<T>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A final page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// A partition a batch call did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionError {
    /// Values of the rejected partition.
    pub values: Vec<String>,
    /// Service error message.
    pub message: String,
}

/// Raw catalog service calls.
///
/// Missing entities surface as `Ok(None)` on reads and as
/// [`ReplError::NotFound`] on writes whose parent is absent.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// One page of databases.
    async fn get_databases(&self, catalog_id: &str, next_token: Option<String>) -> Result<Page<Database>>;

    /// A single database.
    async fn get_database(&self, catalog_id: &str, name: &str) -> Result<Option<Database>>;

    /// Create a database.
    async fn create_database(&self, catalog_id: &str, input: &DatabaseInput) -> Result<()>;

    /// One page of tables in a database.
    async fn get_tables(
        &self,
        catalog_id: &str,
        database: &str,
        next_token: Option<String>,
    ) -> Result<Page<Table>>;

    /// A single table.
    async fn get_table(&self, catalog_id: &str, database: &str, name: &str) -> Result<Option<Table>>;

    /// Create a table.
    async fn create_table(&self, catalog_id: &str, database: &str, input: &TableInput) -> Result<()>;

    /// Replace an existing table definition.
    async fn update_table(
        &self,
        catalog_id: &str,
        database: &str,
        input: &TableInput,
        skip_archive: bool,
    ) -> Result<()>;

    /// One page of partitions of a table.
    async fn get_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        next_token: Option<String>,
    ) -> Result<Page<Partition>>;

    /// Create partitions. Returns the partitions that were not created.
    async fn batch_create_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        inputs: &[PartitionInput],
    ) -> Result<Vec<PartitionError>>;

    /// Delete partitions by values. Returns the partitions that were not deleted.
    async fn batch_delete_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        values: &[Vec<String>],
    ) -> Result<Vec<PartitionError>>;
}

/// Result of writing a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableWriteOutcome {
    /// The table did not exist and was created.
    Created,
    /// The table existed and was updated.
    Updated,
    /// The parent database does not exist.
    ParentNotFound,
    /// Any other write failure.
    Failed {
        /// Catalog error message.
        reason: String,
    },
}

impl TableWriteOutcome {
    /// True when the table definition is now in the catalog.
    pub fn is_written(&self) -> bool {
        matches!(self, TableWriteOutcome::Created | TableWriteOutcome::Updated)
    }
}

/// Result of creating a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseWriteOutcome {
    /// The database was created.
    Created,
    /// Creation failed but the database exists now (created concurrently).
    AlreadyExists,
    /// Creation failed.
    Failed {
        /// Catalog error message.
        reason: String,
    },
}

impl DatabaseWriteOutcome {
    /// True when the database exists after the call.
    pub fn exists(&self) -> bool {
        !matches!(self, DatabaseWriteOutcome::Failed { .. })
    }
}

/// Accounting for a sliced batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items submitted.
    pub requested: usize,
    /// Service calls issued.
    pub calls: usize,
    /// Items the service rejected, including every item of a failed call.
    pub failures: Vec<PartitionError>,
}

impl BatchReport {
    /// Items applied.
    pub fn applied(&self) -> usize {
        self.requested.saturating_sub(self.failures.len())
    }

    /// True when every item was applied.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Thin wrapper over [`CatalogApi`] used by the pipelines.
#[derive(Clone)]
pub struct CatalogBridge {
    api: Arc<dyn CatalogApi>,
}

impl CatalogBridge {
    /// Wrap a catalog service.
    pub fn new(api: Arc<dyn CatalogApi>) -> Self {
        Self { api }
    }

    /// All databases, in pagination order.
    pub async fn list_databases(&self, catalog_id: &str) -> Result<Vec<Database>> {
        let mut all = Vec::new();
        let mut token = None;
        loop {
            let page = self.api.get_databases(catalog_id, token).await?;
            all.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(catalog_id, databases = all.len(), "listed databases");
        Ok(all)
    }

    /// A single database, `None` if absent.
    pub async fn get_database(&self, catalog_id: &str, name: &str) -> Result<Option<Database>> {
        self.api.get_database(catalog_id, name).await
    }

    /// Create a database. A failed create is re-checked so that a database
    /// created concurrently by another invocation counts as present.
    pub async fn create_database(&self, catalog_id: &str, input: &DatabaseInput) -> DatabaseWriteOutcome {
        match self.api.create_database(catalog_id, input).await {
            Ok(()) => {
                info!(catalog_id, database = %input.name, "database created");
                DatabaseWriteOutcome::Created
            }
            Err(e) => match self.api.get_database(catalog_id, &input.name).await {
                Ok(Some(_)) => {
                    debug!(catalog_id, database = %input.name, "database already exists");
                    DatabaseWriteOutcome::AlreadyExists
                }
                _ => {
                    warn!(catalog_id, database = %input.name, error = %e, "database create failed");
                    DatabaseWriteOutcome::Failed { reason: e.to_string() }
                }
            },
        }
    }

    /// All tables of a database, in pagination order.
    pub async fn list_tables(&self, catalog_id: &str, database: &str) -> Result<Vec<Table>> {
        let mut all = Vec::new();
        let mut token = None;
        loop {
            let page = self.api.get_tables(catalog_id, database, token).await?;
            all.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(catalog_id, database, tables = all.len(), "listed tables");
        Ok(all)
    }

    /// A single table, `None` if absent.
    pub async fn get_table(&self, catalog_id: &str, table: &TableRef) -> Result<Option<Table>> {
        self.api.get_table(catalog_id, &table.database, &table.table).await
    }

    /// All partitions of a table, in pagination order.
    pub async fn list_partitions(&self, catalog_id: &str, table: &TableRef) -> Result<Vec<Partition>> {
        let mut all = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .api
                .get_partitions(catalog_id, &table.database, &table.table, token)
                .await?;
            all.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(all)
    }

    /// Create the table, or update it if it already exists.
    pub async fn create_or_update_table(
        &self,
        catalog_id: &str,
        table: &Table,
        skip_archive: bool,
    ) -> TableWriteOutcome {
        let table_ref = table.table_ref();
        let input = table.to_input();

        let existing = match self.get_table(catalog_id, &table_ref).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(table = %table_ref, error = %e, "could not read target table, attempting create");
                None
            }
        };

        let (result, written) = if existing.is_some() {
            let result = self
                .api
                .update_table(catalog_id, &table_ref.database, &input, skip_archive)
                .await;
            (result, TableWriteOutcome::Updated)
        } else {
            let result = self.api.create_table(catalog_id, &table_ref.database, &input).await;
            (result, TableWriteOutcome::Created)
        };

        match result {
            Ok(()) => {
                info!(table = %table_ref, outcome = ?written, "table written");
                written
            }
            Err(ReplError::NotFound { entity }) => {
                warn!(table = %table_ref, missing = %entity, "parent database not found");
                TableWriteOutcome::ParentNotFound
            }
            Err(e) => {
                warn!(table = %table_ref, error = %e, "table write failed");
                TableWriteOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    /// Create partitions in slices of at most `batch_size`. A failed slice
    /// is logged and recorded; later slices still run.
    pub async fn add_partitions(
        &self,
        catalog_id: &str,
        table: &TableRef,
        partitions: &[Partition],
        batch_size: usize,
    ) -> BatchReport {
        let inputs: Vec<PartitionInput> = partitions.iter().map(Partition::to_input).collect();
        let mut report = BatchReport {
            requested: inputs.len(),
            ..Default::default()
        };

        for slice in inputs.chunks(batch_size.max(1)) {
            report.calls += 1;
            match self
                .api
                .batch_create_partitions(catalog_id, &table.database, &table.table, slice)
                .await
            {
                Ok(errors) if errors.is_empty() => {
                    debug!(table = %table, added = slice.len(), "partition batch created");
                }
                Ok(errors) => {
                    for error in &errors {
                        warn!(table = %table, values = ?error.values, error = %error.message, "partition not created");
                    }
                    report.failures.extend(errors);
                }
                Err(e) => {
                    warn!(table = %table, batch = slice.len(), error = %e, "partition create batch failed");
                    report.failures.extend(slice.iter().map(|p| PartitionError {
                        values: p.values.clone(),
                        message: e.to_string(),
                    }));
                }
            }
        }

        info!(table = %table, requested = report.requested, applied = report.applied(), "partitions added");
        report
    }

    /// Delete partitions in slices of at most `batch_size`. A failed slice
    /// is logged and recorded; later slices still run.
    pub async fn delete_partitions(
        &self,
        catalog_id: &str,
        table: &TableRef,
        partitions: &[Partition],
        batch_size: usize,
    ) -> BatchReport {
        let values: Vec<Vec<String>> = partitions.iter().map(|p| p.values.clone()).collect();
        let mut report = BatchReport {
            requested: values.len(),
            ..Default::default()
        };

        for slice in values.chunks(batch_size.max(1)) {
            report.calls += 1;
            match self
                .api
                .batch_delete_partitions(catalog_id, &table.database, &table.table, slice)
                .await
            {
                Ok(errors) if errors.is_empty() => {
                    debug!(table = %table, deleted = slice.len(), "partition batch deleted");
                }
                Ok(errors) => {
                    for error in &errors {
                        warn!(table = %table, values = ?error.values, error = %error.message, "partition not deleted");
                    }
                    report.failures.extend(errors);
                }
                Err(e) => {
                    warn!(table = %table, batch = slice.len(), error = %e, "partition delete batch failed");
                    report.failures.extend(slice.iter().map(|v| PartitionError {
                        values: v.clone(),
                        message: e.to_string(),
                    }));
                }
            }
        }

        info!(table = %table, requested = report.requested, applied = report.applied(), "partitions deleted");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCatalog;

    const CAT: &str = "222222222222";

    fn partitions(n: usize) -> Vec<Partition> {
        (0..n).map(|i| Partition::with_values([format!("p{:04}", i)])).collect()
    }

    async fn seeded() -> (Arc<MemoryCatalog>, CatalogBridge, TableRef) {
        let catalog = Arc::new(MemoryCatalog::with_page_size(7));
        catalog.insert_database(CAT, Database::named("sales")).await;
        catalog.insert_table(CAT, Table::new("sales", "orders")).await;
        let bridge = CatalogBridge::new(catalog.clone());
        (catalog, bridge, TableRef::new("sales", "orders"))
    }

    #[tokio::test]
    async fn test_add_partitions_respects_batch_limit() {
        let (catalog, bridge, table) = seeded().await;
        let report = bridge.add_partitions(CAT, &table, &partitions(250), 100).await;

        assert_eq!(report.calls, 3);
        assert!(report.is_complete());
        assert_eq!(catalog.create_batch_sizes().await, vec![100, 100, 50]);
        assert_eq!(catalog.partitions(CAT, &table).await.len(), 250);
    }

    #[tokio::test]
    async fn test_delete_partitions_respects_batch_limit() {
        let (catalog, bridge, table) = seeded().await;
        let parts = partitions(60);
        catalog.insert_partitions(CAT, &table, parts.clone()).await;

        let report = bridge.delete_partitions(CAT, &table, &parts, 25).await;

        assert_eq!(report.calls, 3);
        assert!(report.is_complete());
        assert_eq!(catalog.delete_batch_sizes().await, vec![25, 25, 10]);
        assert!(catalog.partitions(CAT, &table).await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_failure_does_not_abort() {
        let (catalog, bridge, table) = seeded().await;
        catalog.reject_partition(vec!["p0003".to_string()]).await;

        let report = bridge.add_partitions(CAT, &table, &partitions(30), 10).await;

        assert_eq!(report.calls, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].values, vec!["p0003"]);
        assert_eq!(report.applied(), 29);
        assert_eq!(catalog.partitions(CAT, &table).await.len(), 29);
    }

    #[tokio::test]
    async fn test_listing_drains_all_pages() {
        let (catalog, bridge, table) = seeded().await;
        catalog.insert_partitions(CAT, &table, partitions(20)).await;

        let listed = bridge.list_partitions(CAT, &table).await.unwrap();
        assert_eq!(listed.len(), 20);
        assert_eq!(listed[0].values, vec!["p0000"]);
        assert_eq!(listed[19].values, vec!["p0019"]);
    }

    #[tokio::test]
    async fn test_create_or_update_outcomes() {
        let (catalog, bridge, _) = seeded().await;

        let outcome = bridge
            .create_or_update_table(CAT, &Table::new("sales", "orders"), true)
            .await;
        assert_eq!(outcome, TableWriteOutcome::Updated);

        let outcome = bridge
            .create_or_update_table(CAT, &Table::new("sales", "customers"), true)
            .await;
        assert_eq!(outcome, TableWriteOutcome::Created);

        let outcome = bridge
            .create_or_update_table(CAT, &Table::new("hr", "staff"), true)
            .await;
        assert_eq!(outcome, TableWriteOutcome::ParentNotFound);

        catalog.fail_table_writes("sales", "customers").await;
        let outcome = bridge
            .create_or_update_table(CAT, &Table::new("sales", "customers"), true)
            .await;
        assert!(matches!(outcome, TableWriteOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_create_database_already_exists() {
        let (_, bridge, _) = seeded().await;
        let outcome = bridge.create_database(CAT, &Database::named("sales").to_input()).await;
        assert_eq!(outcome, DatabaseWriteOutcome::AlreadyExists);

        let outcome = bridge.create_database(CAT, &Database::named("hr").to_input()).await;
        assert_eq!(outcome, DatabaseWriteOutcome::Created);
    }
}
