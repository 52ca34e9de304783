//! Entity cache and event normalization for a real-time chat gateway client.
//!
//! This crate keeps the client-side object graph (guilds, channels, members,
//! roles, users, messages, emoji) consistent while partial updates stream in
//! from the gateway.
//!
//! ## Features
//!
//! - **Store**: Concurrent per-kind record maps, with per-guild sub-stores for
//!   members, roles, emoji and voice states
//! - **Decomposition**: Nested payloads are split into records that reference
//!   each other by id
//! - **Proxies**: Relation handles with a synchronous cached read and an
//!   asynchronous fetch-on-miss
//! - **Processors**: One handler per gateway update, emitting before/after
//!   domain events
//! - **Readiness gates**: Guild joins can be held back until member chunking
//!   completes

pub mod cache;
mod config;
pub mod decompose;
mod error;
pub mod event;
pub mod gate;
mod kind;
pub mod models;
pub mod processor;
pub mod proxy;
mod record;
mod snowflake;
pub mod store;

pub use cache::{CacheStats, EntityCache, EntityCacheBuilder};
pub use config::{CacheConfig, CacheConfigBuilder, DEFAULT_EVENT_CAPACITY};
pub use decompose::Decomposer;
pub use error::{CacheError, FetchError};
pub use event::{CacheEvent, EventBus, Snapshot};
pub use gate::{GateOutcome, GateRegistry, GateState, ReadinessGate};
pub use kind::{EntityKey, EntityKind};
pub use processor::{DispatchKind, EventProcessor, MemberRequester, RawEvent, StatsSnapshot};
pub use proxy::{NullOrigin, Origin, Proxy, ProxyList, Resolver};
pub use record::Record;
pub use snowflake::{PLATFORM_EPOCH_MS, Snowflake};
pub use store::{EntityStore, Put, StoreStats};
