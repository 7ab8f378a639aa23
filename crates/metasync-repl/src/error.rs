//! Error types for the replication subsystem.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
///
/// | Variant | Recovery |
/// |---------|----------|
/// | `Parse` | message dropped, never retried |
/// | `NotFound` | parent created, write retried once |
/// | `Write` | dead-lettered for replay |
/// | `PartialBatch` | logged per item, remaining batches continue |
/// | `Transport` | bounded retry with backoff, fatal after exhaustion |
/// | `Encoding` | unit fails as an overflow-tier write |
#[derive(Debug, Error)]
pub enum ReplError {
    /// Inbound payload could not be decoded.
    #[error("parse error: {msg}")]
    Parse {
        /// What could not be decoded.
        msg: String,
    },

    /// A catalog entity (usually the parent database) does not exist.
    #[error("entity not found: {entity}")]
    NotFound {
        /// The missing entity.
        entity: String,
    },

    /// Catalog mutation failed for a reason other than a missing parent.
    #[error("catalog write failed for {entity}: {msg}")]
    Write {
        /// The entity being written.
        entity: String,
        /// Error message from the catalog.
        msg: String,
    },

    /// Some items of a batched call were not accepted.
    #[error("partial batch on {target}: {failed} of {total} items not accepted")]
    PartialBatch {
        /// Store table or catalog table the batch targeted.
        target: String,
        /// Number of items left unaccepted.
        failed: usize,
        /// Number of items submitted.
        total: usize,
    },

    /// Network or service fault talking to a collaborator.
    #[error("transport error ({service}): {msg}")]
    Transport {
        /// The collaborator that failed.
        service: String,
        /// Error message describing the fault.
        msg: String,
    },

    /// A catalog unit could not be serialized.
    #[error("encoding error for {entity}: {msg}")]
    Encoding {
        /// The entity being encoded.
        entity: String,
        /// Serializer message.
        msg: String,
    },

    /// Object store read or write failed.
    #[error("object store error for {bucket}/{key}: {msg}")]
    ObjectStore {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Error message.
        msg: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {msg}")]
    Config {
        /// What is wrong with the configuration.
        msg: String,
    },

    /// An invocation left units unprocessed; the batch must be redelivered.
    #[error("{failed} of {total} units could not be processed")]
    Incomplete {
        /// Units that failed.
        failed: usize,
        /// Units in the batch.
        total: usize,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Returns true for transient faults the retry layer should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplError::Transport { .. } | ReplError::Io(_))
    }

    /// Shorthand for a transport fault.
    pub fn transport(service: &str, msg: impl Into<String>) -> Self {
        ReplError::Transport {
            service: service.to_string(),
            msg: msg.into(),
        }
    }

    /// Shorthand for a parse failure.
    pub fn parse(msg: impl Into<String>) -> Self {
        ReplError::Parse { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        assert!(ReplError::transport("bus", "connection reset").is_retryable());
        assert!(ReplError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")).is_retryable());
    }

    #[test]
    fn test_logical_errors_are_not_retryable() {
        assert!(!ReplError::parse("bad json").is_retryable());
        assert!(!ReplError::NotFound {
            entity: "sales".into()
        }
        .is_retryable());
        assert!(!ReplError::Write {
            entity: "sales.orders".into(),
            msg: "access denied".into()
        }
        .is_retryable());
        assert!(!ReplError::Encoding {
            entity: "sales.orders".into(),
            msg: "key must be a string".into()
        }
        .is_retryable());
        assert!(!ReplError::Incomplete { failed: 1, total: 3 }.is_retryable());
    }

    #[test]
    fn test_display_partial_batch() {
        let err = ReplError::PartialBatch {
            target: "table_export_status".into(),
            failed: 3,
            total: 25,
        };
        assert_eq!(
            err.to_string(),
            "partial batch on table_export_status: 3 of 25 items not accepted"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let err: ReplError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ReplError::Serialization(_)));
    }
}
