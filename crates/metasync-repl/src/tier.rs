//! Tier routing.
//!
//! Every exported table travels one of three ways, chosen from its partition
//! count and serialized size:
//!
//! | partitions | size      | tier     |
//! |------------|-----------|----------|
//! | `<= P`     | `< S`     | Inline   |
//! | `> P`      | `< S`     | Deferred |
//! | any        | `>= S`    | Overflow |
//!
//! The size check runs first, so an oversized unit overflows no matter how
//! few partitions it has.

use crate::config::TierThresholds;
use crate::envelope::LargeTableRequest;
use crate::error::Result;
use crate::model::{Partition, Table, TableRef, TableUnit};
use crate::sizer::{self, SizedUnit, UnitMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Delivery strategy for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Partitions embedded in the bus message.
    Inline,
    /// Partitions re-fetched downstream via the large-table queue.
    Deferred,
    /// Unit stored as an object; the message carries a pointer.
    Overflow,
}

impl Tier {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Inline => "inline",
            Tier::Deferred => "deferred",
            Tier::Overflow => "overflow",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier-specific payload built by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum TierPayload {
    /// Canonical unit encoding, published as the message body.
    Inline {
        /// Message body.
        body: Vec<u8>,
    },
    /// Request for the large-table queue; partitions are not carried.
    Deferred {
        /// Queue message body.
        request: LargeTableRequest,
    },
    /// Canonical unit encoding, written as the overflow object.
    Overflow {
        /// Object body.
        body: Vec<u8>,
    },
}

/// A table with its tier decision and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedTable {
    /// The table.
    pub table_ref: TableRef,
    /// Metrics the decision was made on.
    pub metrics: UnitMetrics,
    /// Tier payload.
    pub payload: TierPayload,
}

impl RoutedTable {
    /// The selected tier.
    pub fn tier(&self) -> Tier {
        match self.payload {
            TierPayload::Inline { .. } => Tier::Inline,
            TierPayload::Deferred { .. } => Tier::Deferred,
            TierPayload::Overflow { .. } => Tier::Overflow,
        }
    }
}

/// Chooses a tier and builds its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierRouter {
    thresholds: TierThresholds,
}

impl TierRouter {
    /// Create a router with the given thresholds.
    pub fn new(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    /// The thresholds in use.
    pub fn thresholds(&self) -> TierThresholds {
        self.thresholds
    }

    /// Total, deterministic tier decision.
    pub fn decide(&self, partition_count: usize, unit_bytes: usize) -> Tier {
        if unit_bytes >= self.thresholds.max_message_bytes {
            Tier::Overflow
        } else if partition_count > self.thresholds.max_inline_partitions {
            Tier::Deferred
        } else {
            Tier::Inline
        }
    }

    /// Route a measured unit.
    pub fn route_sized(&self, sized: SizedUnit, source_catalog_id: &str) -> RoutedTable {
        let table_ref = sized.table_ref();
        let metrics = sized.metrics;
        let tier = self.decide(metrics.partition_count, metrics.unit_bytes);
        debug!(
            table = %table_ref,
            partitions = metrics.partition_count,
            bytes = metrics.unit_bytes,
            tier = %tier,
            "tier selected"
        );

        let payload = match tier {
            Tier::Inline => TierPayload::Inline { body: sized.encoded },
            Tier::Overflow => TierPayload::Overflow { body: sized.encoded },
            Tier::Deferred => TierPayload::Deferred {
                request: LargeTableRequest {
                    table: sized.unit.table,
                    large_table: true,
                    number_of_partitions: metrics.partition_count,
                    catalog_id: source_catalog_id.to_string(),
                },
            },
        };

        RoutedTable {
            table_ref,
            metrics,
            payload,
        }
    }

    /// Measure and route a table with its partitions. A unit that cannot be
    /// encoded yields [`crate::error::ReplError::Encoding`].
    pub fn route(&self, table: Table, partitions: Vec<Partition>, source_catalog_id: &str) -> Result<RoutedTable> {
        let sized = sizer::measure(TableUnit::new(table, partitions))?;
        Ok(self.route_sized(sized, source_catalog_id))
    }
}

impl Default for TierRouter {
    fn default() -> Self {
        Self::new(TierThresholds::default())
    }
}
