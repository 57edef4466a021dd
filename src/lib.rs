//! Pattern-routed service mesh.
//!
//! Service nodes register a capability pattern such as `role:math,cmd:sum`
//! with a [`Broker`]. Callers address patterns instead of hosts; the broker
//! and each node's [`ActClient`] resolve them through a longest-prefix cache
//! backed by a durable [`Registry`], and repair that cache when an address
//! goes stale.

#![deny(missing_docs)]

pub mod broker;
pub mod cache;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod node;
pub mod pattern;
pub mod registry;
pub mod server;

// Re-export key types
pub use broker::Broker;
pub use cache::{CacheHandle, PrefixCache};
pub use client::{Forwarded, Forwarder};
pub use config::{BrokerConfig, NodeConfig};
pub use envelope::{RequestEnvelope, ResponseEnvelope, ServiceRecord};
pub use error::{Error, Result};
pub use node::{ActClient, Handler, NodeGuard, ServiceNode};
pub use registry::{MemoryStore, RedisStore, Registry, Resolved, Store};
pub use server::{Router, ServerGuard};
