//! Replication planner: starts an export sweep.
//!
//! Lists the source databases, keeps those matching the configured name
//! prefixes and publishes one `database` message per kept database. Every
//! publish attempt is recorded in the planner ledger.

use crate::catalog::CatalogBridge;
use crate::config::ReplConfig;
use crate::envelope::{self, ReplicationRun};
use crate::error::Result;
use crate::ledger::{DatabaseExportRecord, LedgerTable, StatusLedger, StatusRecord};
use crate::messaging::MessageBus;
use crate::model::Database;
use crate::services::Collaborators;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of one planner sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReport {
    /// The run the sweep started.
    pub run: ReplicationRun,
    /// Databases in the source catalog.
    pub listed: usize,
    /// Databases selected by the prefix filter.
    pub selected: usize,
    /// Databases whose message was published.
    pub published: usize,
}

/// Keep databases whose name starts with any prefix; no prefixes keeps all.
pub fn select_databases(databases: Vec<Database>, prefixes: &[String]) -> Vec<Database> {
    if prefixes.is_empty() {
        return databases;
    }
    databases
        .into_iter()
        .filter(|db| prefixes.iter().any(|p| db.name.starts_with(p.as_str())))
        .collect()
}

/// Publishes the databases to replicate.
pub struct ReplicationPlanner {
    config: ReplConfig,
    catalog: CatalogBridge,
    bus: Arc<dyn MessageBus>,
    ledger: StatusLedger,
}

impl ReplicationPlanner {
    /// Create a planner.
    pub fn new(config: ReplConfig, services: &Collaborators) -> Self {
        Self {
            catalog: CatalogBridge::new(services.catalog.clone()),
            bus: services.bus.clone(),
            ledger: StatusLedger::new(services.status.clone(), &config),
            config,
        }
    }

    /// Run one sweep under a fresh run id.
    pub async fn plan(&self) -> Result<PlanReport> {
        self.plan_run(ReplicationRun::start()).await
    }

    /// Run one sweep under the given run.
    pub async fn plan_run(&self, run: ReplicationRun) -> Result<PlanReport> {
        let source = &self.config.source_catalog_id;
        let databases = self.catalog.list_databases(source).await?;
        let listed = databases.len();
        let selected = select_databases(databases, &self.config.planner.prefixes());

        info!(
            run_id = run.run_id,
            batch_id = %run.batch_id,
            listed,
            selected = selected.len(),
            "planning replication sweep"
        );

        let correlation = run.correlation(source);
        let mut published = 0;
        for database in &selected {
            let message = envelope::database_message(database, &correlation)?;
            let delivery = match self.bus.publish(&self.config.topics.planner, &message).await {
                Ok(id) => {
                    published += 1;
                    Some(id)
                }
                Err(e) => {
                    warn!(database = %database.name, error = %e, "database message not published");
                    None
                }
            };

            let record = StatusRecord::DatabaseExport(DatabaseExportRecord {
                db_id: database.name.clone(),
                export_run_id: run.run_id,
                export_batch_id: run.batch_id.clone(),
                source_glue_catalog_id: source.clone(),
                database_schema: message.body.clone(),
                is_exported: delivery.is_some(),
                sns_msg_id: delivery.unwrap_or_default(),
            });
            if let Err(e) = self.ledger.record_in(LedgerTable::Planner, &record).await {
                error!(database = %database.name, error = %e, "planner ledger row not written");
            }
        }

        info!(run_id = run.run_id, listed, published, "replication sweep planned");
        Ok(PlanReport {
            selected: selected.len(),
            run,
            listed,
            published,
        })
    }
}
