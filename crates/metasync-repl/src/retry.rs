//! Bounded retry with exponential backoff for collaborator calls.
//!
//! [`RetryExecutor`] retries transient faults only (see
//! [`crate::error::ReplError::is_retryable`]). [`Retrying`] wraps any collaborator and
//! applies the executor to each call, so pipelines never see a fault that
//! the retry budget could have absorbed.

use crate::catalog::{CatalogApi, Page, PartitionError};
use crate::error::Result;
use crate::ledger::StatusStore;
use crate::messaging::{Message, MessageBus, WorkQueue};
use crate::model::{Database, DatabaseInput, Partition, PartitionInput, Table, TableInput};
use crate::object_store::ObjectStore;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 10).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds (default: 10 000).
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays (default: 2.0).
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter to each delay (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new executor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The last error is returned unchanged.
    pub async fn run<F, Fut, T>(&self, op_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(op = op_name, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `initial_backoff * multiplier^attempt` plus up to 50% jitter when
    /// enabled, never more than `max_backoff`.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_backoff_ms;
        let base = self.config.initial_backoff_ms as f64;
        let computed = base * self.config.backoff_multiplier.powi(attempt as i32);
        let delay = computed.min(max as f64).max(0.0) as u64;

        if self.config.jitter && delay > 1 {
            let jitter = rand::thread_rng().gen_range(0..delay / 2 + 1);
            Duration::from_millis(delay.saturating_add(jitter).min(max))
        } else {
            Duration::from_millis(delay)
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// A collaborator whose every call goes through a [`RetryExecutor`].
pub struct Retrying<T: ?Sized> {
    inner: Arc<T>,
    executor: RetryExecutor,
}

impl<T: ?Sized> Retrying<T> {
    /// Wrap `inner` with the given retry policy.
    pub fn new(inner: Arc<T>, config: RetryConfig) -> Self {
        Self {
            inner,
            executor: RetryExecutor::new(config),
        }
    }
}

#[async_trait]
impl<T: CatalogApi + ?Sized> CatalogApi for Retrying<T> {
    async fn get_databases(&self, catalog_id: &str, next_token: Option<String>) -> Result<Page<Database>> {
        self.executor
            .run("catalog.get_databases", || {
                self.inner.get_databases(catalog_id, next_token.clone())
            })
            .await
    }

    async fn get_database(&self, catalog_id: &str, name: &str) -> Result<Option<Database>> {
        self.executor
            .run("catalog.get_database", || self.inner.get_database(catalog_id, name))
            .await
    }

    async fn create_database(&self, catalog_id: &str, input: &DatabaseInput) -> Result<()> {
        self.executor
            .run("catalog.create_database", || self.inner.create_database(catalog_id, input))
            .await
    }

    async fn get_tables(
        &self,
        catalog_id: &str,
        database: &str,
        next_token: Option<String>,
    ) -> Result<Page<Table>> {
        self.executor
            .run("catalog.get_tables", || {
                self.inner.get_tables(catalog_id, database, next_token.clone())
            })
            .await
    }

    async fn get_table(&self, catalog_id: &str, database: &str, name: &str) -> Result<Option<Table>> {
        self.executor
            .run("catalog.get_table", || self.inner.get_table(catalog_id, database, name))
            .await
    }

    async fn create_table(&self, catalog_id: &str, database: &str, input: &TableInput) -> Result<()> {
        self.executor
            .run("catalog.create_table", || {
                self.inner.create_table(catalog_id, database, input)
            })
            .await
    }

    async fn update_table(
        &self,
        catalog_id: &str,
        database: &str,
        input: &TableInput,
        skip_archive: bool,
    ) -> Result<()> {
        self.executor
            .run("catalog.update_table", || {
                self.inner.update_table(catalog_id, database, input, skip_archive)
            })
            .await
    }

    async fn get_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        next_token: Option<String>,
    ) -> Result<Page<Partition>> {
        self.executor
            .run("catalog.get_partitions", || {
                self.inner
                    .get_partitions(catalog_id, database, table, next_token.clone())
            })
            .await
    }

    async fn batch_create_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        inputs: &[PartitionInput],
    ) -> Result<Vec<PartitionError>> {
        self.executor
            .run("catalog.batch_create_partitions", || {
                self.inner.batch_create_partitions(catalog_id, database, table, inputs)
            })
            .await
    }

    async fn batch_delete_partitions(
        &self,
        catalog_id: &str,
        database: &str,
        table: &str,
        values: &[Vec<String>],
    ) -> Result<Vec<PartitionError>> {
        self.executor
            .run("catalog.batch_delete_partitions", || {
                self.inner.batch_delete_partitions(catalog_id, database, table, values)
            })
            .await
    }
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Retrying<T> {
    async fn publish(&self, topic: &str, message: &Message) -> Result<String> {
        self.executor
            .run("bus.publish", || self.inner.publish(topic, message))
            .await
    }
}

#[async_trait]
impl<T: WorkQueue + ?Sized> WorkQueue for Retrying<T> {
    async fn send(&self, queue: &str, message: &Message) -> Result<()> {
        self.executor
            .run("queue.send", || self.inner.send(queue, message))
            .await
    }
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Retrying<T> {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.executor
            .run("objects.put", || self.inner.put(bucket, key, body.clone()))
            .await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.executor
            .run("objects.get", || self.inner.get(bucket, key))
            .await
    }
}

#[async_trait]
impl<T: StatusStore + ?Sized> StatusStore for Retrying<T> {
    async fn put_item(&self, table: &str, item: Value) -> Result<()> {
        self.executor
            .run("status.put_item", || self.inner.put_item(table, item.clone()))
            .await
    }

    async fn batch_write(&self, table: &str, items: Vec<Value>) -> Result<Vec<Value>> {
        self.executor
            .run("status.batch_write", || self.inner.batch_write(table, items.clone()))
            .await
    }
}

/// Build a retry-wrapped collaborator behind a trait object.
pub fn with_retry<T: ?Sized>(inner: Arc<T>, config: &RetryConfig) -> Retrying<T> {
    Retrying::new(inner, config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplError;
    use crate::memory::MemoryBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_backoff_ms, 100);
        assert_eq!(config.max_backoff_ms, 10_000);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.jitter);
    }

    #[test]
    fn test_compute_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            jitter: false,
            ..Default::default()
        });
        assert_eq!(executor.compute_backoff(0), Duration::from_millis(100));
        assert_eq!(executor.compute_backoff(1), Duration::from_millis(200));
        assert_eq!(executor.compute_backoff(3), Duration::from_millis(800));
        assert_eq!(executor.compute_backoff(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_compute_backoff_jitter_bounds() {
        let executor = RetryExecutor::default();
        for _ in 0..50 {
            let delay = executor.compute_backoff(2).as_millis() as u64;
            assert!((400..=600).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_backoff() {
        let executor = RetryExecutor::default();
        for _ in 0..50 {
            assert_eq!(executor.compute_backoff(20), Duration::from_millis(10_000));
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let executor = RetryExecutor::new(fast());
        let counter = Arc::new(AtomicU32::new(0));

        let result = executor
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 3 {
                        Err(ReplError::transport("bus", "connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let executor = RetryExecutor::new(fast());
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = executor
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(ReplError::transport("bus", "throttled"))
                }
            })
            .await;

        assert!(matches!(result, Err(ReplError::Transport { .. })));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let executor = RetryExecutor::new(fast());
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = executor
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(ReplError::parse("bad body"))
                }
            })
            .await;

        assert!(matches!(result, Err(ReplError::Parse { .. })));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retrying_bus_absorbs_transient_faults() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_next(2);
        let retrying = with_retry(bus.clone(), &fast());

        let id = retrying.publish("topic", &Message::new("{}")).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retrying_bus_gives_up() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_next(10);
        let retrying = with_retry(bus.clone(), &fast());

        let err = retrying.publish("topic", &Message::new("{}")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(bus.published().await.is_empty());
    }
}
