//! Cache configuration.

use serde::{Deserialize, Serialize};

/// Broadcast channel capacity for domain events.
/// Large enough to absorb the burst of guild joins that follows a connect.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Tunables for the entity cache and its processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hold "joined" events until every member of the guild has been chunked.
    pub fetch_members: bool,
    /// Store message records. Embedded users and members are cached either way.
    pub cache_messages: bool,
    /// Store emoji records.
    pub cache_emoji: bool,
    /// Capacity of the domain event channel.
    pub event_capacity: usize,
    /// Also emit a raw event for every update processed.
    pub dispatch_raw: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fetch_members: false,
            cache_messages: true,
            cache_emoji: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            dispatch_raw: false,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn fetch_members(mut self, enabled: bool) -> Self {
        self.config.fetch_members = enabled;
        self
    }

    pub fn cache_messages(mut self, enabled: bool) -> Self {
        self.config.cache_messages = enabled;
        self
    }

    pub fn cache_emoji(mut self, enabled: bool) -> Self {
        self.config.cache_emoji = enabled;
        self
    }

    /// Capacity of the domain event channel. Clamped to at least 1.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn dispatch_raw(mut self, enabled: bool) -> Self {
        self.config.dispatch_raw = enabled;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
