//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Key layout of service entries in the coordination store
//!
//! `<root>/<service path>/<node id>`, where the service path is the service
//! name with every `-` turned into a path separator, so `orders-rpc` lives
//! under `/services/orders/rpc/`.

use crate::DEFAULT_ROOT_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_PREFIX)
    }
}

impl KeyLayout {
    pub fn new(root: &str) -> Self {
        let trimmed = root.trim_matches('/');
        let root = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        };
        Self { root }
    }

    /// Prefix covering every service
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Directory of one service, without trailing separator
    pub fn service_path(&self, name: &str) -> String {
        let segments: Vec<&str> = name
            .split(|c| c == '-' || c == '/')
            .filter(|segment| !segment.is_empty())
            .collect();
        format!("{}{}", self.root, segments.join("/"))
    }

    /// Prefix matching exactly the nodes of one service
    pub fn service_prefix(&self, name: &str) -> String {
        format!("{}/", self.service_path(name))
    }

    /// Key owned by one node
    pub fn node_key(&self, name: &str, node_id: &str) -> String {
        format!("{}/{}", self.service_path(name), node_id)
    }
}
