//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Configuration for service discovery

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::selector::SelectionStrategy;
use crate::{
    DEFAULT_LEASE_TTL_SECS, DEFAULT_REGISTRATION_INTERVAL_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_ROOT_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Coordination store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// etcd v3 cluster
    #[default]
    Etcd,
    /// In-process store, for tests and local development
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(StoreBackend::Etcd),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(DiscoveryError::Configuration(format!(
                "unknown store backend: {}",
                other
            ))),
        }
    }
}

/// Configuration for registry, resolver and registration loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Coordination store implementation
    pub backend: StoreBackend,

    /// Coordination store endpoints
    pub endpoints: Vec<String>,

    /// Root prefix all service entries live under
    pub root_prefix: String,

    /// Registration lease TTL
    pub lease_ttl: Duration,

    /// Deadline for each coordination store round-trip
    pub request_timeout: Duration,

    /// Deadline for establishing a transport connection
    pub connect_timeout: Duration,

    /// Interval between re-registrations
    pub registration_interval: Duration,

    /// Upper bound of the random delay added to each registration tick
    pub registration_jitter: Duration,

    /// Delay before re-opening a failed watch
    pub reconnect_delay: Duration,

    /// Target selection strategy
    pub selection: SelectionStrategy,

    /// Suffix appended to logical service names (e.g. `-rpc`)
    pub service_suffix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["http://localhost:2379".to_string()],
            root_prefix: DEFAULT_ROOT_PREFIX.to_string(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(5),
            registration_interval: Duration::from_secs(DEFAULT_REGISTRATION_INTERVAL_SECS),
            registration_jitter: Duration::ZERO,
            reconnect_delay: Duration::from_secs(1),
            selection: SelectionStrategy::Random,
            service_suffix: String::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> DiscoveryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> DiscoveryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: DiscoveryConfig = toml::from_str(&content).map_err(|e| {
            DiscoveryError::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DiscoveryResult<Self> {
        let mut config = Self::default();

        if let Some(backend) = lookup("DISCOVERY_BACKEND") {
            config.backend = backend.parse()?;
        }

        if let Some(endpoints) = lookup("DISCOVERY_ENDPOINTS") {
            config.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(prefix) = lookup("DISCOVERY_ROOT_PREFIX") {
            config.root_prefix = prefix;
        }

        if let Some(ttl) = lookup("DISCOVERY_LEASE_TTL_SECS") {
            config.lease_ttl = parse_secs("DISCOVERY_LEASE_TTL_SECS", &ttl)?;
        }

        if let Some(timeout) = lookup("DISCOVERY_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("DISCOVERY_REQUEST_TIMEOUT_SECS", &timeout)?;
        }

        if let Some(interval) = lookup("DISCOVERY_REGISTRATION_INTERVAL_SECS") {
            config.registration_interval =
                parse_secs("DISCOVERY_REGISTRATION_INTERVAL_SECS", &interval)?;
        }

        if let Some(jitter) = lookup("DISCOVERY_REGISTRATION_JITTER_SECS") {
            config.registration_jitter =
                parse_secs("DISCOVERY_REGISTRATION_JITTER_SECS", &jitter)?;
        }

        if let Some(timeout) = lookup("DISCOVERY_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = parse_secs("DISCOVERY_CONNECT_TIMEOUT_SECS", &timeout)?;
        }

        if let Some(strategy) = lookup("DISCOVERY_SELECTION_STRATEGY") {
            config.selection = strategy.parse()?;
        }

        if let Some(suffix) = lookup("DISCOVERY_SERVICE_SUFFIX") {
            config.service_suffix = suffix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::Configuration(
                "at least one coordination store endpoint is required".to_string(),
            ));
        }

        if !self.root_prefix.starts_with('/') {
            return Err(DiscoveryError::Configuration(format!(
                "root prefix must start with '/': {}",
                self.root_prefix
            )));
        }

        if self.lease_ttl.as_secs() == 0 {
            return Err(DiscoveryError::Configuration(
                "lease TTL must be at least one second".to_string(),
            ));
        }

        if self.lease_ttl < self.registration_interval {
            return Err(DiscoveryError::Configuration(format!(
                "lease TTL {:?} is shorter than the registration interval {:?}",
                self.lease_ttl, self.registration_interval
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(DiscoveryError::Configuration(
                "request timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> DiscoveryResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| DiscoveryError::Configuration(format!("invalid {}={}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.registration_interval, Duration::from_secs(15));
        assert_eq!(config.selection, SelectionStrategy::Random);
    }

    #[test]
    fn test_env_overrides() {
        let config = DiscoveryConfig::from_lookup(lookup(&[
            ("DISCOVERY_ENDPOINTS", "http://etcd-0:2379, http://etcd-1:2379"),
            ("DISCOVERY_LEASE_TTL_SECS", "60"),
            ("DISCOVERY_SELECTION_STRATEGY", "round_robin"),
            ("DISCOVERY_SERVICE_SUFFIX", "-rpc"),
            ("DISCOVERY_BACKEND", "memory"),
        ]))
        .unwrap();

        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(
            config.endpoints,
            vec!["http://etcd-0:2379".to_string(), "http://etcd-1:2379".to_string()]
        );
        assert_eq!(config.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.selection, SelectionStrategy::RoundRobin);
        assert_eq!(config.service_suffix, "-rpc");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let rejects = |key: &str, value: &str| {
            DiscoveryConfig::from_lookup(lookup(&[(key, value)])).is_err()
        };
        assert!(rejects("DISCOVERY_LEASE_TTL_SECS", "soon"));
        assert!(rejects("DISCOVERY_ENDPOINTS", " , "));
        assert!(rejects("DISCOVERY_BACKEND", "zookeeper"));
    }

    #[test]
    fn test_ttl_shorter_than_interval_is_rejected() {
        let config = DiscoveryConfig {
            lease_ttl: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            endpoints = ["http://etcd:2379"]
            selection = "round_robin"
            service_suffix = "-rpc"
            lease_ttl = { secs = 45, nanos = 0 }
        "#;
        let parsed: DiscoveryConfig = toml::from_str(text).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.endpoints, vec!["http://etcd:2379".to_string()]);
        assert_eq!(parsed.selection, SelectionStrategy::RoundRobin);
        assert_eq!(parsed.lease_ttl, Duration::from_secs(45));
        assert_eq!(parsed.root_prefix, DEFAULT_ROOT_PREFIX);
    }
}
