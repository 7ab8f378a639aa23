//! Replace-all partition reconciliation.
//!
//! The exported partition set is authoritative. Whatever the target holds is
//! deleted, then the exported set is added. The two phases are separate
//! catalog calls and are not atomic: an interruption between them leaves the
//! table without partitions until the unit is redelivered.

use crate::catalog::CatalogBridge;
use crate::config::BatchLimits;
use crate::error::Result;
use crate::model::{Partition, TableRef};
use crate::outcome::ReconcileReport;
use tracing::{debug, info};

/// What reconciliation will do, given the two partition counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Delete every existing target partition.
    pub delete_existing: bool,
    /// Add the exported partitions.
    pub add_exported: bool,
}

impl ReconcilePlan {
    /// Plan for `exported` partitions against `existing` target partitions.
    pub fn new(exported: usize, existing: usize) -> Self {
        Self {
            delete_existing: existing > 0,
            add_exported: exported > 0,
        }
    }

    /// Nothing to do.
    pub fn is_noop(&self) -> bool {
        !self.delete_existing && !self.add_exported
    }
}

/// Make the target table's partitions equal the exported set.
///
/// Fails only when the target's current partitions cannot be listed.
/// Per-partition and per-batch failures are reported, not raised.
pub async fn replace_partitions(
    bridge: &CatalogBridge,
    catalog_id: &str,
    table: &TableRef,
    exported: &[Partition],
    limits: &BatchLimits,
) -> Result<ReconcileReport> {
    let existing = bridge.list_partitions(catalog_id, table).await?;
    let plan = ReconcilePlan::new(exported.len(), existing.len());

    let mut report = ReconcileReport {
        export_has_partitions: !exported.is_empty(),
        existing: existing.len(),
        ..Default::default()
    };

    if plan.is_noop() {
        debug!(table = %table, "no partitions on either side");
        return Ok(report);
    }

    if plan.delete_existing {
        report.deleted = bridge
            .delete_partitions(catalog_id, table, &existing, limits.partition_delete_batch)
            .await;
    }
    if plan.add_exported {
        report.added = bridge
            .add_partitions(catalog_id, table, exported, limits.partition_create_batch)
            .await;
    }

    info!(
        table = %table,
        existing = report.existing,
        deleted = report.deleted.applied(),
        added = report.added.applied(),
        complete = report.is_complete(),
        "partitions reconciled"
    );
    Ok(report)
}
