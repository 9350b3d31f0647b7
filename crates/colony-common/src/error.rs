//! Error taxonomy for the cluster coordination subsystem.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors raised by cluster coordination
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Coordination store could not be reached or rejected a command
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Advisory lock was not acquired within the wait window
    #[error("Lock contention on {0}")]
    LockContention(String),

    /// Health probe against a peer address failed
    #[error("Health probe failed: {0}")]
    ProbeFailure(String),

    /// Node is not part of the live membership
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node has no address to route to
    #[error("No available address for node {0}")]
    NoAvailableAddress(String),

    /// Plugin identity already registered on this node
    #[error("Plugin already registered: {0}")]
    PluginAlreadyRegistered(String),

    /// A record or key in the store could not be decoded
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Caller-supplied identifier is malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Local network interfaces could not be enumerated
    #[error("Network error: {0}")]
    Network(String),

    /// Redirected request failed in transport
    #[error("Redirect failed: {0}")]
    Redirect(String),

    /// Some records could not be collected; the rest of the sweep went on
    #[error("Garbage collection failed for {} record(s): {}", .0.len(), join_errors(.0))]
    PartialGc(Vec<ClusterError>),
}

fn join_errors(errors: &[ClusterError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClusterError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::StoreUnavailable(_) => 503,
            Self::LockContention(_) => 503,
            Self::ProbeFailure(_) => 502,
            Self::NodeNotFound(_) => 503,
            Self::NoAvailableAddress(_) => 503,
            Self::PluginAlreadyRegistered(_) => 409,
            Self::InvalidRecord(_) => 500,
            Self::InvalidArgument(_) => 400,
            Self::Network(_) => 500,
            Self::Redirect(_) => 502,
            Self::PartialGc(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::LockContention(_) | Self::PartialGc(_)
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRecord(err.to_string())
    }
}
