//! The entity cache: store, processors, gates and event bus wired together.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::{CacheEvent, EventBus};
use crate::gate::{GateOutcome, GateRegistry};
use crate::processor::{EventProcessor, MemberRequester, RawEvent, StatsSnapshot};
use crate::proxy::{NullOrigin, Origin, Proxy, ProxyList, Resolver};
use crate::store::StoreStats;
use crate::{CacheConfig, CacheError, EntityKind, EntityStore, Record, Snowflake};

/// Buffer between the transport and the processing loop.
const UPDATE_CHANNEL_SIZE: usize = 1000;

/// Client-side state for one gateway connection.
///
/// Created once at startup and passed to whatever needs it. Application code
/// reads through [`EntityCache::get`] and the proxy constructors; the
/// transport feeds updates through [`EntityCache::process`] or the channel
/// returned by [`EntityCache::start`].
pub struct EntityCache {
    store: Arc<EntityStore>,
    config: Arc<CacheConfig>,
    gates: Arc<GateRegistry>,
    bus: EventBus,
    resolver: Resolver,
    processor: Arc<EventProcessor>,
    shutdown_tx: watch::Sender<bool>,
}

impl EntityCache {
    /// A cache with default configuration and no origin.
    pub fn new() -> Arc<Self> {
        EntityCacheBuilder::new().build()
    }

    pub fn builder() -> EntityCacheBuilder {
        EntityCacheBuilder::new()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Subscribe to domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.bus.subscribe()
    }

    /// Cached record of a global kind, or any guild's record for scoped kinds.
    pub fn get(&self, kind: EntityKind, id: Snowflake) -> Option<Arc<Record>> {
        self.store.get(kind, id)
    }

    pub fn get_guild_scoped(
        &self,
        kind: EntityKind,
        guild_id: Snowflake,
        id: Snowflake,
    ) -> Option<Arc<Record>> {
        self.store.get_guild_scoped(kind, guild_id, id)
    }

    pub fn guild(&self, id: Snowflake) -> Proxy {
        self.resolver.one(EntityKind::Guild, id)
    }

    pub fn channel(&self, id: Snowflake) -> Proxy {
        self.resolver.one(EntityKind::Channel, id)
    }

    pub fn user(&self, id: Snowflake) -> Proxy {
        self.resolver.one(EntityKind::User, id)
    }

    pub fn message(&self, id: Snowflake) -> Proxy {
        self.resolver.one(EntityKind::Message, id)
    }

    pub fn member(&self, guild_id: Snowflake, user_id: Snowflake) -> Proxy {
        self.resolver.scoped(EntityKind::Member, guild_id, user_id)
    }

    pub fn role(&self, guild_id: Snowflake, role_id: Snowflake) -> Proxy {
        self.resolver.scoped(EntityKind::Role, guild_id, role_id)
    }

    /// Every cached guild.
    pub fn guilds(&self) -> ProxyList {
        let mut ids = self.store.guild_ids();
        ids.sort_unstable();
        self.resolver.many(EntityKind::Guild, ids)
    }

    /// Wait until the guild's initial data has been loaded.
    ///
    /// Returns [`GateOutcome::Closed`] immediately for guilds the cache has
    /// never seen, and when the guild is removed while waiting.
    pub async fn wait_until_ready(&self, guild_id: Snowflake) -> GateOutcome {
        match self.gates.get(guild_id) {
            Some(gate) => gate.wait().await,
            None => GateOutcome::Closed,
        }
    }

    /// Apply one update and emit its events, waiting for the guild's gate if
    /// needed.
    pub async fn process(&self, raw: &RawEvent) -> Result<(), CacheError> {
        self.processor.process(raw).await
    }

    /// Spawn the processing loop. Updates sent on the returned channel are
    /// applied in order until the channel is dropped or [`EntityCache::shutdown`]
    /// is called.
    pub fn start(&self) -> (mpsc::Sender<RawEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let processor = Arc::clone(&self.processor);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { processor.run(rx, shutdown_rx).await });
        debug!("processing loop spawned");
        (tx, handle)
    }

    /// Stop the processing loop and release every gate waiter.
    pub fn shutdown(&self) {
        info!("entity cache shutting down");
        self.gates.close_all();
        self.shutdown_tx.send_replace(true);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            store: self.store.stats(),
            processor: self.processor.stats(),
            gates: self.gates.len(),
            subscribers: self.bus.subscriber_count(),
        }
    }
}

/// Combined store and processor statistics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub store: StoreStats,
    pub processor: StatsSnapshot,
    pub gates: usize,
    pub subscribers: usize,
}

/// Builder for [`EntityCache`].
pub struct EntityCacheBuilder {
    config: CacheConfig,
    origin: Arc<dyn Origin>,
    requester: Option<Arc<dyn MemberRequester>>,
    store: Option<Arc<EntityStore>>,
}

impl Default for EntityCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCacheBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            origin: Arc::new(NullOrigin),
            requester: None,
            store: None,
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Where proxies fetch entities that are not cached.
    pub fn origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = origin;
        self
    }

    pub fn member_requester(mut self, requester: Arc<dyn MemberRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Use an existing store.
    pub fn store(mut self, store: Arc<EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Arc<EntityCache> {
        let config = Arc::new(self.config);
        let store = self.store.unwrap_or_else(|| Arc::new(EntityStore::new()));
        let gates = Arc::new(GateRegistry::new());
        let bus = EventBus::new(config.event_capacity);
        let resolver = Resolver::new(Arc::clone(&store), self.origin, Arc::clone(&config));

        let mut processor = EventProcessor::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&gates),
            bus.clone(),
        );
        if let Some(requester) = self.requester {
            processor = processor.with_member_requester(requester);
        }

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(EntityCache {
            store,
            config,
            gates,
            bus,
            resolver,
            processor: Arc::new(processor),
            shutdown_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_process_and_read() {
        let cache = EntityCache::new();
        let mut events = cache.subscribe();

        cache
            .process(&RawEvent::new(
                "GUILD_CREATE",
                json!({"id": "1", "name": "g", "roles": [{"id": "2", "name": "r"}]}),
            ))
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            CacheEvent::GuildJoin { .. }
        ));
        assert_eq!(cache.guild(Snowflake::new(1)).get().unwrap().get_str("name"), Some("g"));
        assert!(cache.role(Snowflake::new(1), Snowflake::new(2)).is_cached());
        assert_eq!(cache.guilds().len(), 1);
        assert_eq!(cache.wait_until_ready(Snowflake::new(1)).await, GateOutcome::Ready);
        assert_eq!(cache.wait_until_ready(Snowflake::new(9)).await, GateOutcome::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let cache = EntityCache::builder()
            .config(CacheConfig::builder().fetch_members(true).build())
            .build();

        let (tx, handle) = cache.start();
        tx.send(RawEvent::new("GUILD_CREATE", json!({"id": "1", "member_count": 5})))
            .await
            .unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                // The gate may not exist until the create has been applied.
                loop {
                    if cache.gates.get(Snowflake::new(1)).is_some() {
                        return cache.wait_until_ready(Snowflake::new(1)).await;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cache.shutdown();

        assert_eq!(waiter.await.unwrap(), GateOutcome::Closed);
        handle.await.unwrap();
        assert_eq!(cache.stats().processor.deferred, 1);
    }
}
