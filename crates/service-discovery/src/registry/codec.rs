//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Stored value encoding
//!
//! Values are JSON objects of the form
//! `{"name":..,"version":..,"metadata":{..},"nodes":[{"id":..,"address":..,"port":..}]}`
//! with empty optional fields omitted.

use crate::error::DiscoveryResult;
use crate::types::ServiceDescriptor;
use tracing::warn;

pub fn encode(descriptor: &ServiceDescriptor) -> DiscoveryResult<Vec<u8>> {
    Ok(serde_json::to_vec(descriptor)?)
}

/// Decode a stored value. Malformed payloads are logged and yield `None`.
pub fn decode(key: &str, value: &[u8]) -> Option<ServiceDescriptor> {
    match serde_json::from_slice::<ServiceDescriptor>(value) {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            warn!("Skipping malformed service entry at {}: {}", key, e);
            None
        }
    }
}
