//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Transport boundary between discovery and the RPC layer

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// A live connection to one `address:port` target
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Release transport resources. Dropping must also release them; this
    /// hook exists for transports with an explicit shutdown.
    async fn close(&self) {}
}

/// Establishes connections to targets
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Connection;

    async fn dial(&self, address: &str) -> DiscoveryResult<Self::Connection>;
}

/// Dials tonic gRPC channels
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    connect_timeout: Duration,
    request_timeout: Duration,
    keep_alive_interval: Duration,
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(60),
        }
    }
}

impl GrpcDialer {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            ..Default::default()
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.connect_timeout, config.request_timeout)
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    fn endpoint(&self, address: &str) -> DiscoveryResult<Endpoint> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        Endpoint::from_shared(uri)
            .map_err(|e| DiscoveryError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })
            .map(|endpoint| {
                endpoint
                    .timeout(self.request_timeout)
                    .connect_timeout(self.connect_timeout)
                    .keep_alive_while_idle(true)
                    .http2_keep_alive_interval(self.keep_alive_interval)
            })
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    type Connection = Channel;

    async fn dial(&self, address: &str) -> DiscoveryResult<Channel> {
        let channel = self
            .endpoint(address)?
            .connect()
            .await
            .map_err(|e| DiscoveryError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Dialed gRPC channel to {}", address);
        Ok(channel)
    }
}

// A tonic channel is released when its last clone is dropped.
impl Connection for Channel {}
