#![warn(missing_docs)]

//! metasync replication subsystem: size-tiered metadata catalog replication over bus, queue and object store

pub mod catalog;
pub mod config;
pub mod dlq;
pub mod dry_run;
pub mod envelope;
pub mod error;
pub mod export;
pub mod export_large;
pub mod import;
pub mod import_large;
pub mod ledger;
pub mod memory;
pub mod messaging;
pub mod model;
pub mod object_store;
pub mod outcome;
pub mod planner;
pub mod reconcile;
pub mod retry;
pub mod services;
pub mod sizer;
pub mod tier;

pub use config::ReplConfig;
pub use error::{ReplError, Result};
pub use export::ExportPipeline;
pub use import::ImportPipeline;
pub use planner::ReplicationPlanner;
pub use services::Collaborators;
pub use tier::{Tier, TierRouter};
