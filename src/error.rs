//! Error types surfaced by the overlay.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the public API.
pub type DhtResult<T> = std::result::Result<T, DhtError>;

#[derive(Debug, Clone, Error)]
pub enum DhtError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid node id length: expected {expected} bytes, got {actual}")]
    InvalidIdLength { expected: usize, actual: usize },

    #[error("{operation} to {peer} failed: {reason}")]
    Rpc {
        peer: String,
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} to {peer} timed out after {timeout:?}")]
    Timeout {
        peer: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("join of service {service_id} failed: none of {entry_points} entry points answered")]
    JoinFailed {
        service_id: String,
        entry_points: usize,
    },

    #[error("remote handler failed: {0}")]
    Handler(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("node {0} is stopped")]
    Stopped(String),

    #[error("node {0} has not been started")]
    NotStarted(String),

    #[error("no connectivity to the network within {0:?}")]
    ConnectivityTimeout(Duration),

    #[error("routing failed: {0}")]
    Route(#[from] RouteError),
}

impl DhtError {
    /// Transient failures of a single remote call. Lookups absorb these and
    /// move on to the next candidate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DhtError::Rpc { .. } | DhtError::Timeout { .. } | DhtError::Unreachable(_)
        )
    }
}

/// Outcome reported back along a routing hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RouteError {
    #[error("no route toward the target")]
    NoTargets,
    #[error("message was already routed through this node")]
    Duplicate,
    #[error("router is stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DhtError::Unreachable("ab".into()).is_transient());
        assert!(DhtError::Timeout {
            peer: "ab".into(),
            operation: "ping",
            timeout: Duration::from_millis(10),
        }
        .is_transient());
        assert!(!DhtError::Cancelled.is_transient());
        assert!(!DhtError::Config("bad".into()).is_transient());
    }

    #[test]
    fn join_failed_message_names_service() {
        let err = DhtError::JoinFailed {
            service_id: "layer0".into(),
            entry_points: 2,
        };
        assert!(err.to_string().contains("layer0"));
    }
}
