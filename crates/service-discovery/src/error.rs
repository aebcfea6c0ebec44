//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Error types for service discovery

use thiserror::Error;

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Error type for discovery operations
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Service {0} has no nodes")]
    EmptyNodes(String),

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("No available target")]
    NoAvailableTarget,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Watch stream closed: {0}")]
    WatchClosed(String),

    #[error("Watch start revision {0} has been compacted")]
    Compacted(i64),

    #[error("Stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DiscoveryError {
    /// Whether the failure is a transient transport condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Store(_)
                | DiscoveryError::Timeout(_)
                | DiscoveryError::WatchClosed(_)
                | DiscoveryError::Dial { .. }
        )
    }
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        DiscoveryError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Timeout(err.to_string())
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DiscoveryError::Store("unavailable".into()).is_transient());
        assert!(DiscoveryError::Timeout("deadline".into()).is_transient());
        assert!(!DiscoveryError::EmptyNodes("orders".into()).is_transient());
        assert!(!DiscoveryError::NoAvailableTarget.is_transient());
    }
}
