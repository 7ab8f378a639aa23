//! Import outcomes.
//!
//! The import of one table walks a small state machine. The walk is kept as
//! a [`StateTrail`], and once it reaches `Done` the result is frozen into a
//! [`TableOutcome`] that the ledger writer and the dead-letter path read.

use crate::catalog::{BatchReport, PartitionError, TableWriteOutcome};
use crate::envelope::Correlation;
use crate::error::{ReplError, Result};
use crate::ledger::TableImportRecord;
use crate::model::TableRef;
use std::fmt;
use tracing::trace;

/// States of the per-table import state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportState {
    /// Nothing attempted yet.
    Start,
    /// The first write reported a missing parent database.
    ParentMissing,
    /// The parent database was created (or found created).
    ParentCreated,
    /// The parent could not be created, or the retried write still found
    /// no parent.
    ParentMissingFatal,
    /// The table definition is in the target catalog.
    TableWritten,
    /// The table write failed for a reason other than a missing parent.
    TableWriteFailed,
    /// Partitions were replaced without failures.
    PartitionsReconciled,
    /// Partition replacement failed in whole or in part.
    PartitionsFailed,
    /// Terminal.
    Done,
}

impl ImportState {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: ImportState) -> bool {
        use ImportState::*;
        matches!(
            (self, next),
            (Start, ParentMissing)
                | (Start, TableWritten)
                | (Start, TableWriteFailed)
                | (ParentMissing, ParentCreated)
                | (ParentMissing, ParentMissingFatal)
                | (ParentCreated, TableWritten)
                | (ParentCreated, TableWriteFailed)
                | (ParentCreated, ParentMissingFatal)
                | (TableWritten, PartitionsReconciled)
                | (TableWritten, PartitionsFailed)
                | (ParentMissingFatal, Done)
                | (TableWriteFailed, Done)
                | (PartitionsReconciled, Done)
                | (PartitionsFailed, Done)
        )
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The sequence of states one import walked through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTrail {
    states: Vec<ImportState>,
}

impl StateTrail {
    /// A trail at `Start`.
    pub fn new() -> Self {
        Self {
            states: vec![ImportState::Start],
        }
    }

    /// Current state.
    pub fn current(&self) -> ImportState {
        self.states.last().copied().unwrap_or(ImportState::Start)
    }

    /// Move to `next`. Invalid transitions are a programming error.
    pub fn advance(&mut self, table: &TableRef, next: ImportState) {
        let current = self.current();
        debug_assert!(
            current.can_advance_to(next),
            "invalid import transition {} -> {}",
            current,
            next
        );
        trace!(table = %table, from = %current, to = %next, "import state");
        self.states.push(next);
    }

    /// Whether the trail passed through `state`.
    pub fn visited(&self, state: ImportState) -> bool {
        self.states.contains(&state)
    }

    /// All states in order.
    pub fn states(&self) -> &[ImportState] {
        &self.states
    }
}

impl Default for StateTrail {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of replace-all partition reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The exported unit carried partitions.
    pub export_has_partitions: bool,
    /// Partitions the target had before reconciliation.
    pub existing: usize,
    /// Deletion of the existing partitions.
    pub deleted: BatchReport,
    /// Creation of the exported partitions.
    pub added: BatchReport,
}

impl ReconcileReport {
    /// True when every delete and add was applied.
    pub fn is_complete(&self) -> bool {
        self.deleted.is_complete() && self.added.is_complete()
    }

    /// Every rejected partition, deletes first.
    pub fn failures(&self) -> impl Iterator<Item = &PartitionError> {
        self.deleted.failures.iter().chain(self.added.failures.iter())
    }
}

/// What happened to the partitions of an imported table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSync {
    /// The table write failed, so partitions were not touched.
    NotAttempted {
        /// The exported unit carried partitions.
        export_has_partitions: bool,
    },
    /// Reconciliation ran; see the report for per-partition failures.
    Reconciled(ReconcileReport),
    /// Reconciliation could not run (the target listing failed).
    Failed {
        /// The exported unit carried partitions.
        export_has_partitions: bool,
        /// Why.
        reason: String,
    },
}

impl PartitionSync {
    /// The exported unit carried partitions.
    pub fn export_has_partitions(&self) -> bool {
        match self {
            PartitionSync::NotAttempted { export_has_partitions } => *export_has_partitions,
            PartitionSync::Reconciled(report) => report.export_has_partitions,
            PartitionSync::Failed { export_has_partitions, .. } => *export_has_partitions,
        }
    }

    /// Reconciliation ran and every batch item was applied.
    pub fn is_complete(&self) -> bool {
        matches!(self, PartitionSync::Reconciled(report) if report.is_complete())
    }
}

/// Frozen result of importing one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    /// The table.
    pub table: TableRef,
    /// Final table write outcome (after the parent retry, if any).
    pub write: TableWriteOutcome,
    /// The parent database was created during this import.
    pub parent_created: bool,
    /// Partition result.
    pub partitions: PartitionSync,
    /// Table definition as imported (JSON).
    pub table_schema: String,
    /// States walked.
    pub trail: StateTrail,
}

impl TableOutcome {
    /// The table was created.
    pub fn created(&self) -> bool {
        self.write == TableWriteOutcome::Created
    }

    /// The table was updated.
    pub fn updated(&self) -> bool {
        self.write == TableWriteOutcome::Updated
    }

    /// The table definition was written, whatever happened to partitions.
    pub fn replicated(&self) -> bool {
        self.write.is_written()
    }

    /// The exported unit carried partitions.
    pub fn export_has_partitions(&self) -> bool {
        self.partitions.export_has_partitions()
    }

    /// Partitions were fully reconciled.
    pub fn partitions_replicated(&self) -> bool {
        self.partitions.is_complete()
    }

    /// The parent database was missing at first write.
    pub fn parent_not_found(&self) -> bool {
        self.trail.visited(ImportState::ParentMissing)
    }

    /// The unit was not fully imported.
    pub fn error(&self) -> bool {
        !self.replicated() || !self.partitions_replicated()
    }

    /// The table write failed terminally and the unit belongs on the
    /// dead-letter queue.
    pub fn needs_dead_letter(&self) -> bool {
        !self.replicated()
    }

    /// Human-readable failure reason, if any.
    pub fn error_message(&self) -> Option<String> {
        match (&self.write, &self.partitions) {
            (TableWriteOutcome::Failed { reason }, _) => Some(reason.clone()),
            (TableWriteOutcome::ParentNotFound, _) => Some(format!("database {} not found", self.table.database)),
            (_, PartitionSync::Failed { reason, .. }) => Some(reason.clone()),
            (_, PartitionSync::Reconciled(report)) if !report.is_complete() => Some(format!(
                "{} partition operations failed",
                report.failures().count()
            )),
            _ => None,
        }
    }

    /// Ledger row for this attempt.
    pub fn ledger_record(
        &self,
        import_run_id: u64,
        correlation: &Correlation,
        target_catalog_id: &str,
    ) -> TableImportRecord {
        TableImportRecord {
            table_id: self.table.ledger_key(),
            import_run_id,
            export_batch_id: correlation.export_batch_id.clone(),
            table_name: self.table.table.clone(),
            database_name: self.table.database.clone(),
            table_schema: self.table_schema.clone(),
            target_glue_catalog_id: target_catalog_id.to_string(),
            source_glue_catalog_id: correlation.source_catalog_id.clone(),
            table_created: self.created(),
            table_updated: self.updated(),
            export_has_partitions: self.export_has_partitions(),
            partitions_updated: self.partitions_replicated(),
            error: self.error(),
            error_message: self.error_message(),
        }
    }
}

/// What became of one inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled, including units escalated to the dead-letter queue.
    Processed,
    /// Malformed; dropped without retry.
    Dropped,
    /// Not fully handled; the batch must be redelivered.
    Failed,
}

/// Per-invocation accounting over one inbound batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Records received.
    pub received: usize,
    /// Records fully processed (including dead-lettered units).
    pub processed: usize,
    /// Records dropped as unparseable.
    pub dropped: usize,
    /// Records that could not be processed and need redelivery.
    pub failed: usize,
}

impl BatchSummary {
    /// Start counting a batch of `received` records.
    pub fn new(received: usize) -> Self {
        Self {
            received,
            ..Default::default()
        }
    }

    /// Count one record.
    pub fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Processed => self.processed += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::Failed => self.failed += 1,
        }
    }

    /// Fold another summary into this one.
    pub fn absorb(&mut self, other: BatchSummary) {
        self.received += other.received;
        self.processed += other.processed;
        self.dropped += other.dropped;
        self.failed += other.failed;
    }

    /// `Ok` when nothing needs redelivery, otherwise [`ReplError::Incomplete`]
    /// so the scheduler redelivers the batch.
    pub fn into_result(self) -> Result<BatchSummary> {
        if self.failed > 0 {
            Err(ReplError::Incomplete {
                failed: self.failed,
                total: self.received,
            })
        } else {
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("sales", "orders")
    }

    fn outcome(write: TableWriteOutcome, partitions: PartitionSync, states: &[ImportState]) -> TableOutcome {
        let mut trail = StateTrail::new();
        for state in states {
            trail.advance(&table(), *state);
        }
        TableOutcome {
            table: table(),
            write,
            parent_created: false,
            partitions,
            table_schema: "{}".into(),
            trail,
        }
    }

    #[test]
    fn test_transitions() {
        use ImportState::*;
        assert!(Start.can_advance_to(ParentMissing));
        assert!(ParentMissing.can_advance_to(ParentCreated));
        assert!(ParentCreated.can_advance_to(TableWritten));
        assert!(TableWritten.can_advance_to(PartitionsFailed));
        assert!(PartitionsReconciled.can_advance_to(Done));
        assert!(!Start.can_advance_to(Done));
        assert!(!ParentMissing.can_advance_to(TableWritten));
        assert!(!TableWriteFailed.can_advance_to(PartitionsReconciled));
        assert!(!Done.can_advance_to(Start));
    }

    #[test]
    fn test_replicated_is_independent_of_partitions() {
        let failed_parts = PartitionSync::Failed {
            export_has_partitions: true,
            reason: "listing failed".into(),
        };
        let o = outcome(
            TableWriteOutcome::Updated,
            failed_parts,
            &[ImportState::TableWritten, ImportState::PartitionsFailed, ImportState::Done],
        );
        assert!(o.replicated());
        assert!(o.updated());
        assert!(!o.partitions_replicated());
        assert!(o.export_has_partitions());
        assert!(o.error());
        assert!(!o.needs_dead_letter());
        assert_eq!(o.error_message().as_deref(), Some("listing failed"));
    }

    #[test]
    fn test_parent_missing_flags() {
        let o = outcome(
            TableWriteOutcome::Created,
            PartitionSync::Reconciled(ReconcileReport::default()),
            &[
                ImportState::ParentMissing,
                ImportState::ParentCreated,
                ImportState::TableWritten,
                ImportState::PartitionsReconciled,
                ImportState::Done,
            ],
        );
        assert!(o.parent_not_found());
        assert!(o.created());
        assert!(o.partitions_replicated());
        assert!(!o.error());

        let record = o.ledger_record(9, &Correlation::new("b-1", "111"), "222");
        assert_eq!(record.table_id, "orders|sales");
        assert!(record.table_created);
        assert!(!record.table_updated);
        assert!(record.partitions_updated);
        assert!(!record.error);
        assert_eq!(record.source_glue_catalog_id, "111");
        assert_eq!(record.target_glue_catalog_id, "222");
    }

    #[test]
    fn test_write_failure_needs_dead_letter() {
        let o = outcome(
            TableWriteOutcome::Failed {
                reason: "access denied".into(),
            },
            PartitionSync::NotAttempted {
                export_has_partitions: true,
            },
            &[ImportState::TableWriteFailed, ImportState::Done],
        );
        assert!(!o.replicated());
        assert!(o.needs_dead_letter());
        assert!(o.export_has_partitions());
        let record = o.ledger_record(1, &Correlation::new("b", "s"), "t");
        assert!(record.error);
        assert_eq!(record.error_message.as_deref(), Some("access denied"));
    }

    #[test]
    fn test_batch_summary_result() {
        let mut summary = BatchSummary::new(3);
        summary.count(Disposition::Processed);
        summary.count(Disposition::Processed);
        summary.count(Disposition::Dropped);
        assert!(summary.into_result().is_ok());

        summary.failed = 1;
        assert!(matches!(
            summary.into_result(),
            Err(ReplError::Incomplete { failed: 1, total: 3 })
        ));
    }
}
