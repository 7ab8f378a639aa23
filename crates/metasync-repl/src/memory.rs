//! In-memory collaborators.
//!
//! Each type implements one of the collaborator traits against process
//! memory, records the calls it receives and can be told to fail. They back
//! the unit and integration tests and the CLI's dry run.

use crate::catalog::{CatalogApi, Page, PartitionError};
use crate::error::{ReplError, Result};
use crate::ledger::StatusStore;
use crate::messaging::{Message, MessageBus, WorkQueue};
use crate::model::{Database, DatabaseInput, Partition, PartitionInput, Table, TableInput, TableRef, TableUnit};
use crate::object_store::ObjectStore;
use crate::services::Collaborators;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Remaining injected transport faults.
#[derive(Debug, Default)]
struct FaultBudget(AtomicU32);

impl FaultBudget {
    fn arm(&self, calls: u32) {
        self.0.store(calls, Ordering::SeqCst);
    }

    /// Consume one fault if any remain.
    fn trip(&self, service: &str) -> Result<()> {
        let tripped = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(ReplError::transport(service, "injected fault"))
        } else {
            Ok(())
        }
    }
}

/// A source catalog snapshot, as loaded by the dry run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Databases.
    #[serde(default)]
    pub databases: Vec<Database>,
    /// Tables with their partitions.
    #[serde(default)]
    pub tables: Vec<TableUnit>,
}

#[derive(Debug, Default)]
struct CatalogData {
    databases: BTreeMap<String, Database>,
    tables: BTreeMap<(String, String), Table>,
    partitions: BTreeMap<(String, String), Vec<Partition>>,
}

#[derive(Debug, Default)]
struct CatalogState {
    catalogs: BTreeMap<String, CatalogData>,
    create_batches: Vec<usize>,
    delete_batches: Vec<usize>,
    rejected_partitions: BTreeSet<Vec<String>>,
    failing_tables: BTreeSet<(String, String)>,
    failing_databases: BTreeSet<String>,
    table_writes: usize,
}

/// In-memory metadata catalog holding any number of catalog ids.
#[derive(Debug)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
    page_size: usize,
    faults: FaultBudget,
}

impl MemoryCatalog {
    /// Empty catalog with a page size of 100.
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Empty catalog with a custom page size.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
            page_size: page_size.max(1),
            faults: FaultBudget::default(),
        }
    }

    /// Add or replace a database.
    pub async fn insert_database(&self, catalog_id: &str, database: Database) {
        let mut state = self.state.lock().await;
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        data.databases.insert(database.name.clone(), database);
    }

    /// Add or replace a table. Its database need not exist.
    pub async fn insert_table(&self, catalog_id: &str, table: Table) {
        let mut state = self.state.lock().await;
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        data.tables
            .insert((table.database_name.clone(), table.name.clone()), table);
    }

    /// Append partitions to a table.
    pub async fn insert_partitions(&self, catalog_id: &str, table: &TableRef, partitions: Vec<Partition>) {
        let mut state = self.state.lock().await;
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        data.partitions
            .entry((table.database.clone(), table.table.clone()))
            .or_default()
            .extend(partitions);
    }

    /// Load databases, tables and partitions from a snapshot.
    pub async fn load_snapshot(&self, catalog_id: &str, snapshot: CatalogSnapshot) {
        for database in snapshot.databases {
            self.insert_database(catalog_id, database).await;
        }
        for unit in snapshot.tables {
            let table_ref = unit.table.table_ref();
            self.insert_table(catalog_id, unit.table).await;
            self.insert_partitions(catalog_id, &table_ref, unit.partitions).await;
        }
    }

    /// A database, if present.
    pub async fn database(&self, catalog_id: &str, name: &str) -> Option<Database> {
        let state = self.state.lock().await;
        state.catalogs.get(catalog_id)?.databases.get(name).cloned()
    }

    /// A table, if present.
    pub async fn table(&self, catalog_id: &str, table: &TableRef) -> Option<Table> {
        let state = self.state.lock().await;
        state
            .catalogs
            .get(catalog_id)?
            .tables
            .get(&(table.database.clone(), table.table.clone()))
            .cloned()
    }

    /// Current partitions of a table, in insertion order.
    pub async fn partitions(&self, catalog_id: &str, table: &TableRef) -> Vec<Partition> {
        let state = self.state.lock().await;
        state
            .catalogs
            .get(catalog_id)
            .and_then(|data| data.partitions.get(&(table.database.clone(), table.table.clone())))
            .cloned()
            .unwrap_or_default()
    }

    /// Sizes of every batch-create call so far.
    pub async fn create_batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.create_batches.clone()
    }

    /// Sizes of every batch-delete call so far.
    pub async fn delete_batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.delete_batches.clone()
    }

    /// Number of create/update table calls so far.
    pub async fn table_writes(&self) -> usize {
        self.state.lock().await.table_writes
    }

    /// Reject the partition with these values in batch calls.
    pub async fn reject_partition(&self, values: Vec<String>) {
        self.state.lock().await.rejected_partitions.insert(values);
    }

    /// Make every create/update of this table fail with a write error.
    pub async fn fail_table_writes(&self, database: &str, table: &str) {
        self.state
            .lock()
            .await
            .failing_tables
            .insert((database.to_string(), table.to_string()));
    }

    /// Make creating this database fail.
    pub async fn fail_database_creates(&self, name: &str) {
        self.state.lock().await.failing_databases.insert(name.to_string());
    }

    /// Fail the next `calls` calls of any kind with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.faults.arm(calls);
    }

    /// Drop every injected table, database and partition failure.
    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.failing_tables.clear();
        state.failing_databases.clear();
        state.rejected_partitions.clear();
    }

    fn page<T: Clone>(&self, items: Vec<T>, next_token: Option<String>) -> Result<Page<T>> {
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ReplError::parse(format!("invalid next token {}", token)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let page_items = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        let next_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: page_items,
            next_token,
        })
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn table_from_input(database: &str, input: &TableInput) -> Table {
    Table {
        name: input.name.clone(),
        database_name: database.to_string(),
        description: input.description.clone(),
        owner: input.owner.clone(),
        partition_keys: input.partition_keys.clone(),
        table_type: input.table_type.clone(),
        view_original_text: input.view_original_text.clone(),
        view_expanded_text: input.view_expanded_text.clone(),
        parameters: input.parameters.clone(),
        storage_descriptor: input.storage_descriptor.clone(),
        retention: input.retention,
        ..Default::default()
    }
}

fn partition_from_input(input: &PartitionInput) -> Partition {
    Partition {
        values: input.values.clone(),
        storage_descriptor: input.storage_descriptor.clone(),
        parameters: input.parameters.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl CatalogApi for MemoryCatalog {
    async fn get_databases(&self, catalog_id: &str, next_token: Option<String>) -> Result<Page<Database>> {
        self.faults.trip("catalog")?;
        let items: Vec<Database> = {
            let state = self.state.lock().await;
            state
                .catalogs
                .get(catalog_id)
                .map(|data| data.databases.values().cloned().collect())
                .unwrap_or_default()
        };
        self.page(items, next_token)
    }

    async fn get_database(&self, catalog_id: &str, name: &str) -> Result<Option<Database>> {
        self.faults.trip("catalog")?;
        Ok(self.database(catalog_id, name).await)
    }

    async fn create_database(&self, catalog_id: &str, input: &DatabaseInput) -> Result<()> {
        self.faults.trip("catalog")?;
        let mut state = self.state.lock().await;
        if state.failing_databases.contains(&input.name) {
            return Err(ReplError::Write {
                entity: input.name.clone(),
                msg: "injected database failure".into(),
            });
        }
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        if data.databases.contains_key(&input.name) {
            return Err(ReplError::Write {
                entity: input.name.clone(),
                msg: "AlreadyExistsException".into(),
            });
        }
        data.databases.insert(
            input.name.clone(),
            Database {
                name: input.name.clone(),
                description: input.description.clone(),
                location_uri: input.location_uri.clone(),
                parameters: input.parameters.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_tables(
        &self,
        catalog_id: &str,
        database: &str,
        next_token: Option<String>,
    ) -> Result<Page<Table>> {
        self.faults.trip("catalog")?;
        let items: Vec<Table> = {
            let state = self.state.lock().await;
            let data = state.catalogs.get(catalog_id);
            if !data.is_some_and(|d| d.databases.contains_key(database)) {
                return Err(ReplError::NotFound {
                    entity: database.to_string(),
                });
            }
            data.map(|d| {
                d.tables
                    .values()
                    .filter(|t| t.database_name == database)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        };
        self.page(items, next_token)
    }

    async fn get_table(&self, catalog_id: &str, database: &str, name: &str) -> Result<Option<Table>> {
        self.faults.trip("catalog")?;
        Ok(self.table(catalog_id, &TableRef::new(database, name)).await)
    }

    async fn create_table(&self, catalog_id: &str, database: &str, input: &TableInput) -> Result<()> {
        self.faults.trip("catalog")?;
        let mut state = self.state.lock().await;
        state.table_writes += 1;
        let key = (database.to_string(), input.name.clone());
        if state.failing_tables.contains(&key) {
            return Err(ReplError::Write {
                entity: format!("{}.{}", database, input.name),
                msg: "injected table failure".into(),
            });
        }
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        if !data.databases.contains_key(database) {
            return Err(ReplError::NotFound {
                entity: database.to_string(),
            });
        }
        if data.tables.contains_key(&key) {
            return Err(ReplError::Write {
                entity: format!("{}.{}", database, input.name),
                msg: "AlreadyExistsException".into(),
            });
        }
        data.tables.insert(key, table_from_input(database, input));
        Ok(())
    }

    async fn update_table(
        &self,
        catalog_id: &str,
        database: &str,
        input: &TableInput,
        _skip_archive: bool,
    ) -> Result<()> {
        self.faults.trip("catalog")?;
        let mut state = self.state.lock().await;
        state.table_writes += 1;
        let key = (database.to_string(), input.name.clone());
        if state.failing_tables.contains(&key) {
            return Err(ReplError::Write {
                entity: format!("{}.{}", database, input.name),
                msg: "injected table failure".into(),
            });
        }
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        if !data.databases.contains_key(database) {
            return Err(ReplError::NotFound {
                entity: database.to_string(),
            });
        }
        if !data.tables.contains_key(&key) {
            return Err(ReplError::Write {
                entity: format!("{}.{}", database, input.name),
                msg: "table does not exist".into(),
            });
        }
        data.tables.insert(key, table_from_input(database, input));
        Ok(())
    }

    async fn get_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        next_token: Option<String>,
    ) -> Result<Page<Partition>> {
        self.faults.trip("catalog")?;
        let items = self.partitions(catalog_id, &TableRef::new(database, table)).await;
        self.page(items, next_token)
    }

    async fn batch_create_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        inputs: &[PartitionInput],
    ) -> Result<Vec<PartitionError>> {
        self.faults.trip("catalog")?;
        let mut state = self.state.lock().await;
        state.create_batches.push(inputs.len());
        let rejected = state.rejected_partitions.clone();
        let key = (database.to_string(), table.to_string());
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        if !data.tables.contains_key(&key) {
            return Err(ReplError::NotFound {
                entity: format!("{}.{}", database, table),
            });
        }
        let current = data.partitions.entry(key).or_default();

        let mut errors = Vec::new();
        for input in inputs {
            if rejected.contains(&input.values) {
                errors.push(PartitionError {
                    values: input.values.clone(),
                    message: "InternalServiceException".into(),
                });
            } else if current.iter().any(|p| p.values == input.values) {
                errors.push(PartitionError {
                    values: input.values.clone(),
                    message: "AlreadyExistsException".into(),
                });
            } else {
                current.push(partition_from_input(input));
            }
        }
        Ok(errors)
    }

    async fn batch_delete_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        values: &[Vec<String>],
    ) -> Result<Vec<PartitionError>> {
        self.faults.trip("catalog")?;
        let mut state = self.state.lock().await;
        state.delete_batches.push(values.len());
        let rejected = state.rejected_partitions.clone();
        let data = state.catalogs.entry(catalog_id.to_string()).or_default();
        let current = data
            .partitions
            .entry((database.to_string(), table.to_string()))
            .or_default();

        let mut errors = Vec::new();
        for value in values {
            if rejected.contains(value) {
                errors.push(PartitionError {
                    values: value.clone(),
                    message: "InternalServiceException".into(),
                });
                continue;
            }
            match current.iter().position(|p| &p.values == value) {
                Some(pos) => {
                    current.remove(pos);
                }
                None => errors.push(PartitionError {
                    values: value.clone(),
                    message: "EntityNotFoundException".into(),
                }),
            }
        }
        Ok(errors)
    }
}

/// A message captured by [`MemoryBus`] or [`MemoryQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    /// Topic or queue.
    pub destination: String,
    /// The message.
    pub message: Message,
    /// Delivery id.
    pub id: String,
}

/// In-memory pub/sub bus.
#[derive(Debug, Default)]
pub struct MemoryBus {
    published: Mutex<Vec<Delivered>>,
    failing_topics: Mutex<BTreeSet<String>>,
    faults: FaultBudget,
}

impl MemoryBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    pub async fn published(&self) -> Vec<Delivered> {
        self.published.lock().await.clone()
    }

    /// Remove and return the messages published to `topic`.
    pub async fn take(&self, topic: &str) -> Vec<Message> {
        let mut published = self.published.lock().await;
        let (taken, kept): (Vec<_>, Vec<_>) = published.drain(..).partition(|d| d.destination == topic);
        *published = kept;
        taken.into_iter().map(|d| d.message).collect()
    }

    /// Fail the next `calls` publishes with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.faults.arm(calls);
    }

    /// Fail every publish to `topic`.
    pub async fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().await.insert(topic.to_string());
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, message: &Message) -> Result<String> {
        self.faults.trip("bus")?;
        if self.failing_topics.lock().await.contains(topic) {
            return Err(ReplError::transport("bus", format!("topic {} unavailable", topic)));
        }
        let id = Uuid::new_v4().to_string();
        self.published.lock().await.push(Delivered {
            destination: topic.to_string(),
            message: message.clone(),
            id: id.clone(),
        });
        Ok(id)
    }
}

/// In-memory work queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    sent: Mutex<Vec<Delivered>>,
    faults: FaultBudget,
}

impl MemoryQueue {
    /// Empty queue service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub async fn sent(&self) -> Vec<Delivered> {
        self.sent.lock().await.clone()
    }

    /// Remove and return the messages sent to `queue`.
    pub async fn take(&self, queue: &str) -> Vec<Message> {
        let mut sent = self.sent.lock().await;
        let (taken, kept): (Vec<_>, Vec<_>) = sent.drain(..).partition(|d| d.destination == queue);
        *sent = kept;
        taken.into_iter().map(|d| d.message).collect()
    }

    /// Fail the next `calls` sends with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.faults.arm(calls);
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, queue: &str, message: &Message) -> Result<()> {
        self.faults.trip("queue")?;
        self.sent.lock().await.push(Delivered {
            destination: queue.to_string(),
            message: message.clone(),
            id: Uuid::new_v4().to_string(),
        });
        Ok(())
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    faults: FaultBudget,
}

impl MemoryObjectStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys stored in `bucket`.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Store an object directly.
    pub async fn insert(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
    }

    /// Fail the next `calls` puts or gets with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.faults.arm(calls);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.faults.trip("objects")?;
        self.insert(bucket, key, body).await;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.faults.trip("objects")?;
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ReplError::ObjectStore {
                bucket: bucket.to_string(),
                key: key.to_string(),
                msg: "NoSuchKey".into(),
            })
    }
}

#[derive(Debug, Default)]
struct StatusState {
    rows: Vec<(String, Value)>,
    batch_sizes: Vec<usize>,
    unprocessed_per_call: usize,
    unprocessed_calls: u32,
}

/// In-memory status store. Rows are only ever appended.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    state: Mutex<StatusState>,
    faults: FaultBudget,
}

impl MemoryStatusStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows written to `table`, in write order.
    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Sizes of every batch-write call so far.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }

    /// For the next `calls` batch writes, leave the last `items` items unprocessed.
    pub async fn leave_unprocessed(&self, items: usize, calls: u32) {
        let mut state = self.state.lock().await;
        state.unprocessed_per_call = items;
        state.unprocessed_calls = calls;
    }

    /// Fail the next `calls` writes with a transport error.
    pub fn fail_next(&self, calls: u32) {
        self.faults.arm(calls);
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn put_item(&self, table: &str, item: Value) -> Result<()> {
        self.faults.trip("status")?;
        self.state.lock().await.rows.push((table.to_string(), item));
        Ok(())
    }

    async fn batch_write(&self, table: &str, mut items: Vec<Value>) -> Result<Vec<Value>> {
        self.faults.trip("status")?;
        let mut state = self.state.lock().await;
        state.batch_sizes.push(items.len());

        let unprocessed = if state.unprocessed_calls > 0 {
            state.unprocessed_calls -= 1;
            let keep = state.unprocessed_per_call.min(items.len());
            items.split_off(items.len() - keep)
        } else {
            Vec::new()
        };

        for item in items {
            state.rows.push((table.to_string(), item));
        }
        Ok(unprocessed)
    }
}

/// One of each in-memory collaborator.
#[derive(Debug, Clone, Default)]
pub struct MemoryServices {
    /// Catalog shared by source and target catalog ids.
    pub catalog: Arc<MemoryCatalog>,
    /// Bus.
    pub bus: Arc<MemoryBus>,
    /// Queue service.
    pub queue: Arc<MemoryQueue>,
    /// Object store.
    pub objects: Arc<MemoryObjectStore>,
    /// Status store.
    pub status: Arc<MemoryStatusStore>,
}

impl MemoryServices {
    /// Fresh, empty services.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trait-object handles for a pipeline.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            catalog: self.catalog.clone(),
            bus: self.bus.clone(),
            queue: self.queue.clone(),
            objects: self.objects.clone(),
            status: self.status.clone(),
        }
    }
}
