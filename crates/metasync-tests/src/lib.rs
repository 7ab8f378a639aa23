//! metasync Test & Validation Infrastructure
//!
//! This crate provides the in-memory replication harness, end-to-end sweep
//! scenarios covering every tier, dead-lettering and replay, and
//! property-based tests for routing, sizing and chunking.

pub mod harness;
pub mod proptest_tiering;

#[cfg(test)]
mod replication_scenarios;

pub use harness::{partitions, ReplHarness, StageResult, SOURCE, TARGET};
