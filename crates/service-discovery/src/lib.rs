//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Client-side service discovery for Orasi RPC clients
//!
//! A calling process addresses a logical service name and obtains a live
//! connection to one of its healthy instances. Membership lives in a
//! lease-based coordination store (etcd in production); the pieces are:
//!
//! - [`registry`]: encodes service descriptors into the store and owns the
//!   registering instance's leases
//! - [`watcher`]: turns a raw prefix watch into typed membership events
//! - [`resolver`]: snapshot-then-watch bridge producing target updates
//! - [`cache`]: per-service live target set and connection cache
//! - [`selector`]: per-call target selection strategies
//! - [`registration`]: the serving-side periodic registration loop

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod registration;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod signal;
pub mod store;
pub mod transport;
pub mod types;
pub mod watcher;

// Re-export main types
pub use cache::{ConnectionCache, ConnectionTarget, ServiceChannel};
pub use client::DiscoveryClient;
pub use config::{DiscoveryConfig, StoreBackend};
pub use error::{DiscoveryError, DiscoveryResult};
pub use registration::{RegistrationHandle, RegistrationLoop, RegistrationState};
pub use registry::{KeyLayout, RegisterOptions, Registry, ServiceSnapshot, StoreRegistry};
pub use resolver::{Resolver, ResolverTask, TargetSink};
pub use selector::{RandomSelector, RoundRobinSelector, SelectionStrategy, Selector};
pub use signal::{StopHandle, StopSignal};
pub use store::{CoordinationClient, EtcdStore, MemoryStore};
pub use transport::{Connection, Dialer, GrpcDialer};
pub use types::{MembershipAction, MembershipEvent, Node, ServiceDescriptor, TargetUpdate};
pub use watcher::Watcher;

/// Crate version information
pub const DISCOVERY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default root prefix for service entries in the coordination store
pub const DEFAULT_ROOT_PREFIX: &str = "/services/";

/// Default registration lease TTL in seconds
pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Default interval between re-registrations in seconds
pub const DEFAULT_REGISTRATION_INTERVAL_SECS: u64 = 15;

/// Default per-call deadline for coordination store round-trips in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;
