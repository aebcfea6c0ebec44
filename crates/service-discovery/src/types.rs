//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Types for service discovery

use crate::error::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Store revision a piece of state was read or changed at
pub type Revision = i64;

/// Identity of one addressable service version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Logical service name, stable across instances
    pub name: String,

    /// Service version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Service metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Running instances
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl ServiceDescriptor {
    /// Create a descriptor with no nodes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            metadata: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// The same descriptor restricted to a single node.
    ///
    /// This is the value stored under each node's key.
    pub fn for_node(&self, node: &Node) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            nodes: vec![node.clone()],
        }
    }

    /// Check the descriptor can be written to the registry
    pub fn validate_for_registration(&self) -> DiscoveryResult<()> {
        if self.name.trim().is_empty() {
            return Err(DiscoveryError::InvalidDescriptor(
                "service name is empty".to_string(),
            ));
        }

        if self.nodes.is_empty() {
            return Err(DiscoveryError::EmptyNodes(self.name.clone()));
        }

        for node in &self.nodes {
            node.validate()?;
        }

        Ok(())
    }
}

/// One running instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique instance identifier
    pub id: String,

    /// Resolvable host
    pub address: String,

    /// Listening port
    pub port: u16,

    /// Node metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// Create a node with a freshly generated id
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), address, port)
    }

    pub fn with_id(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    /// `address:port` key this node is routed under
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn validate(&self) -> DiscoveryResult<()> {
        if self.id.is_empty() || self.id.contains('/') {
            return Err(DiscoveryError::InvalidDescriptor(format!(
                "invalid node id: {:?}",
                self.id
            )));
        }
        if self.address.is_empty() {
            return Err(DiscoveryError::InvalidDescriptor(format!(
                "node {} has no address",
                self.id
            )));
        }
        if self.port == 0 {
            return Err(DiscoveryError::InvalidDescriptor(format!(
                "node {} has port 0",
                self.id
            )));
        }
        Ok(())
    }
}

/// Membership change action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Created,
    Deleted,
}

impl fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipAction::Created => write!(f, "created"),
            MembershipAction::Deleted => write!(f, "deleted"),
        }
    }
}

/// A membership change observed on a watched service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    /// Change action
    pub action: MembershipAction,

    /// Descriptor decoded from the current value, or the previous value for deletes
    pub descriptor: ServiceDescriptor,

    /// Store revision of the change
    pub revision: Revision,
}

/// Add or remove one `address:port` target of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetUpdate {
    Add(String),
    Remove(String),
}

impl TargetUpdate {
    pub fn address(&self) -> &str {
        match self {
            TargetUpdate::Add(address) | TargetUpdate::Remove(address) => address,
        }
    }
}
