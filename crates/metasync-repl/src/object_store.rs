//! Object store seam and the two object body formats.
//!
//! Overflow objects hold one JSON blob (a whole [`TableUnit`]). Large-table
//! detail objects hold newline-delimited JSON, one partition per line.

use crate::error::{ReplError, Result};
use crate::model::{Partition, TableUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Put/get access to an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing one.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Read an object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Location of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPointer {
    /// Bucket name.
    pub bucket_name: String,
    /// Object key.
    pub object_key: String,
}

impl ObjectPointer {
    /// Create a pointer.
    pub fn new(bucket_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
        }
    }
}

/// Object key: `{YYYY-MM-DD}_{epoch-millis}_{catalogId}_{database}_{table}.txt`.
pub fn object_key(now: DateTime<Utc>, catalog_id: &str, database: &str, table: &str) -> String {
    format!(
        "{}_{}_{}_{}_{}.txt",
        now.format("%Y-%m-%d"),
        now.timestamp_millis(),
        catalog_id,
        database,
        table
    )
}

/// Serialize partitions one JSON document per line.
pub fn encode_partition_lines(partitions: &[Partition]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (i, partition) in partitions.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        serde_json::to_writer(&mut out, partition)?;
    }
    Ok(out)
}

/// Parse newline-delimited partitions. Lines that are not valid UTF-8 or
/// not a partition are skipped with a warning; blank lines are ignored.
/// Returns the parsed partitions and the number of skipped lines.
pub fn decode_partition_lines(body: &[u8]) -> (Vec<Partition>, usize) {
    let mut partitions = Vec::new();
    let mut skipped = 0;

    for (line_no, raw) in body.split(|b| *b == b'\n').enumerate() {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping non-UTF-8 partition line");
                skipped += 1;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Partition>(line) {
            Ok(partition) => partitions.push(partition),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping unparseable partition line");
                skipped += 1;
            }
        }
    }

    (partitions, skipped)
}

/// Parse an overflow object. Unlike partition lines, the blob is all or nothing.
pub fn decode_table_unit(pointer: &ObjectPointer, body: &[u8]) -> Result<TableUnit> {
    serde_json::from_slice(body).map_err(|e| {
        ReplError::parse(format!(
            "overflow object {}/{} is not a table unit: {}",
            pointer.bucket_name, pointer.object_key, e
        ))
    })
}
