//! # iproto-client
//!
//! Async client library for IProto servers.
//!
//! This crate provides:
//! - Multiplexed connections with sync-based response correlation
//! - Per-request timeouts, push callbacks and long-lived watchers
//! - A tagged connection pool with heartbeats and online resizing
//! - Round-robin and distributing round-robin balancing
//! - A schema cache kept in step with the server's schema version
//! - Interactive transactions over streams

pub mod balancer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub(crate) mod heartbeat;
pub mod pool;
pub mod schema;
pub mod transaction;

#[cfg(test)]
mod mock;

pub use balancer::{Balancer, DistributingRoundRobin, Policy, RoundRobin, SelectionPolicy};
pub use client::{to_value, tuples, Client, IndexRef, WatchHandle};
pub use config::{BalancerKind, ClientConfig, ConfigError, HeartbeatConfig, InstanceConnectionGroup};
pub use connection::{Connection, ConnectionConfig, ConnectionState, ServerFeatures};
pub use error::ClientError;
pub use exchange::{
    ErrorHandler, EventCallback, PushCallback, RequestOptions, ResponseHandle, Watch, WatchEvent,
};
pub use pool::{Pool, Slot};
pub use schema::{Field, Index, IndexPart, SchemaCache, SchemaFetcher, Space, SpaceRef};
pub use transaction::{Transaction, TransactionOptions};
