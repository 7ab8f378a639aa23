//! Payload sizing.
//!
//! The canonical form of a unit is its compact JSON serialization. Size is
//! the UTF-8 byte length of that form, which is what the bus counts against
//! its message limit, so the encoded bytes are kept and reused as the
//! message or object body.

use crate::error::{ReplError, Result};
use crate::model::{TableRef, TableUnit};

/// Partition count and serialized size of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitMetrics {
    /// Number of partitions in the unit.
    pub partition_count: usize,
    /// Byte length of the canonical serialization.
    pub unit_bytes: usize,
}

/// A unit together with its canonical encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedUnit {
    /// The measured unit.
    pub unit: TableUnit,
    /// Its metrics.
    pub metrics: UnitMetrics,
    /// Canonical encoding.
    pub encoded: Vec<u8>,
}

impl SizedUnit {
    /// Reference to the unit's table.
    pub fn table_ref(&self) -> TableRef {
        self.unit.table.table_ref()
    }
}

/// Number of partitions in a unit.
pub fn partition_count(unit: &TableUnit) -> usize {
    unit.partitions.len()
}

/// Canonical encoding of a unit.
pub fn encode(unit: &TableUnit) -> Result<Vec<u8>> {
    serde_json::to_vec(unit).map_err(|e| ReplError::Encoding {
        entity: unit.table.table_ref().to_string(),
        msg: e.to_string(),
    })
}

/// Byte length of a unit's canonical encoding.
pub fn size(unit: &TableUnit) -> Result<usize> {
    encode(unit).map(|bytes| bytes.len())
}

/// Encode and measure a unit in one pass.
pub fn measure(unit: TableUnit) -> Result<SizedUnit> {
    let encoded = encode(&unit)?;
    let metrics = UnitMetrics {
        partition_count: partition_count(&unit),
        unit_bytes: encoded.len(),
    };
    Ok(SizedUnit {
        unit,
        metrics,
        encoded,
    })
}
