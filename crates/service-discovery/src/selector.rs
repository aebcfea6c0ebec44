//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Target selection strategies

use crate::error::{DiscoveryError, DiscoveryResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks one target out of a service's live set for each call
pub trait Selector: Send + Sync + fmt::Debug {
    /// Index of the chosen entry in `targets`.
    fn pick(&self, targets: &[String]) -> DiscoveryResult<usize>;

    /// Strategy name
    fn name(&self) -> &'static str;

    /// The chosen target itself
    fn select<'a>(&self, targets: &'a [String]) -> DiscoveryResult<&'a str> {
        let index = self.pick(targets)?;
        targets
            .get(index)
            .map(String::as_str)
            .ok_or(DiscoveryError::NoAvailableTarget)
    }
}

/// Uniform random selection
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn pick(&self, targets: &[String]) -> DiscoveryResult<usize> {
        if targets.is_empty() {
            return Err(DiscoveryError::NoAvailableTarget);
        }
        let mut rng = rand::thread_rng();
        Ok(rng.gen_range(0..targets.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Round-robin selection shared by every caller of the same selector
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl Selector for RoundRobinSelector {
    fn pick(&self, targets: &[String]) -> DiscoveryResult<usize> {
        if targets.is_empty() {
            return Err(DiscoveryError::NoAvailableTarget);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(index % targets.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Selection strategy names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Random,
    RoundRobin,
}

impl SelectionStrategy {
    /// Build the selector for this strategy
    pub fn build(self) -> Arc<dyn Selector> {
        match self {
            SelectionStrategy::Random => Arc::new(RandomSelector),
            SelectionStrategy::RoundRobin => Arc::new(RoundRobinSelector::default()),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SelectionStrategy::Random),
            "round_robin" | "roundrobin" | "round-robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(DiscoveryError::Configuration(format!(
                "unknown selection strategy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::Random => write!(f, "random"),
            SelectionStrategy::RoundRobin => write!(f, "round_robin"),
        }
    }
}
