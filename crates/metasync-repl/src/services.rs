//! The set of external services one pipeline invocation talks to.

use crate::catalog::CatalogApi;
use crate::ledger::StatusStore;
use crate::messaging::{MessageBus, WorkQueue};
use crate::object_store::ObjectStore;
use crate::retry::{RetryConfig, Retrying};
use std::sync::Arc;

/// Handles to every collaborator. Each invocation builds its own set; no
/// state is shared across invocations.
#[derive(Clone)]
pub struct Collaborators {
    /// Metadata catalog.
    pub catalog: Arc<dyn CatalogApi>,
    /// Pub/sub bus.
    pub bus: Arc<dyn MessageBus>,
    /// Work queue service.
    pub queue: Arc<dyn WorkQueue>,
    /// Object store.
    pub objects: Arc<dyn ObjectStore>,
    /// Status store.
    pub status: Arc<dyn StatusStore>,
}

impl Collaborators {
    /// Route every collaborator call through bounded retry.
    pub fn with_retry(self, config: &RetryConfig) -> Self {
        Self {
            catalog: Arc::new(Retrying::new(self.catalog, config.clone())),
            bus: Arc::new(Retrying::new(self.bus, config.clone())),
            queue: Arc::new(Retrying::new(self.queue, config.clone())),
            objects: Arc::new(Retrying::new(self.objects, config.clone())),
            status: Arc::new(Retrying::new(self.status, config.clone())),
        }
    }
}
