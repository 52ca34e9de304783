//! Resolution proxies.
//!
//! Relations between records are stored as ids. A proxy is the handle a
//! caller gets for such a relation: it reads the store synchronously, or
//! fetches from the origin when asked to.
//!
//! The synchronous accessors ([`Proxy::get`], [`ProxyList::iter`]) never
//! suspend. Only [`Proxy::fetch`], [`ProxyList::fetch_all`] and
//! [`ProxyList::stream`] touch the origin. Fetched payloads are written to the
//! store only once the origin call has returned, so dropping a pending fetch
//! leaves the store untouched.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, trace};

use crate::decompose::Decomposer;
use crate::{CacheConfig, EntityKey, EntityKind, EntityStore, FetchError, Record, Snowflake};

/// The outbound request layer: fetches one entity by key.
///
/// Implementations must be idempotent; proxies may call them redundantly.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch the raw payload for an entity, or `None` if it does not exist.
    async fn fetch(&self, kind: EntityKind, key: EntityKey) -> Result<Option<Value>, FetchError>;
}

/// An origin with nothing behind it. Every fetch misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOrigin;

#[async_trait]
impl Origin for NullOrigin {
    async fn fetch(&self, _kind: EntityKind, _key: EntityKey) -> Result<Option<Value>, FetchError> {
        Ok(None)
    }
}

/// What proxies resolve against.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<EntityStore>,
    origin: Arc<dyn Origin>,
    config: Arc<CacheConfig>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    pub fn new(store: Arc<EntityStore>, origin: Arc<dyn Origin>, config: Arc<CacheConfig>) -> Self {
        Self {
            store,
            origin,
            config,
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// A proxy for one global entity.
    pub fn one(&self, kind: EntityKind, id: Snowflake) -> Proxy {
        self.one_key(kind, EntityKey::Global(id))
    }

    /// A proxy for one guild-scoped entity.
    pub fn scoped(&self, kind: EntityKind, guild_id: Snowflake, id: Snowflake) -> Proxy {
        self.one_key(kind, EntityKey::Scoped { guild_id, id })
    }

    pub fn one_key(&self, kind: EntityKind, key: EntityKey) -> Proxy {
        Proxy {
            resolver: self.clone(),
            kind,
            key,
        }
    }

    /// A proxy over a list of global ids.
    pub fn many(&self, kind: EntityKind, ids: impl IntoIterator<Item = Snowflake>) -> ProxyList {
        ProxyList {
            resolver: self.clone(),
            kind,
            keys: ids.into_iter().map(EntityKey::Global).collect(),
        }
    }

    /// A proxy over a list of ids inside one guild.
    pub fn many_scoped(
        &self,
        kind: EntityKind,
        guild_id: Snowflake,
        ids: impl IntoIterator<Item = Snowflake>,
    ) -> ProxyList {
        ProxyList {
            resolver: self.clone(),
            kind,
            keys: ids
                .into_iter()
                .map(|id| EntityKey::Scoped { guild_id, id })
                .collect(),
        }
    }

    fn cached(&self, kind: EntityKind, key: EntityKey) -> Option<Arc<Record>> {
        self.store.get_key(kind, key)
    }

    async fn resolve(&self, kind: EntityKind, key: EntityKey) -> Result<Arc<Record>, FetchError> {
        if let Some(record) = self.cached(kind, key) {
            return Ok(record);
        }

        debug!(kind = %kind, key = %key, "cache miss, fetching from origin");
        let payload = self
            .origin
            .fetch(kind, key)
            .await?
            .ok_or(FetchError::NotFound { kind, id: key.id() })?;

        let decomposer = Decomposer::new(&self.store, &self.config);
        let placed = match key.guild_id() {
            Some(guild_id) => decomposer.place_in_guild(kind, guild_id, payload),
            None => decomposer.place(kind, payload),
        };
        let put = placed.map_err(|e| FetchError::Decompose {
            kind,
            reason: e.to_string(),
        })?;
        trace!(kind = %kind, key = %key, "fetched record stored");
        Ok(put.after)
    }
}

/// Handle for a relation to a single entity.
#[derive(Debug, Clone)]
pub struct Proxy {
    resolver: Resolver,
    kind: EntityKind,
    key: EntityKey,
}

impl Proxy {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> Snowflake {
        self.key.id()
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// The cached record, or `None`. Never suspends.
    pub fn get(&self) -> Option<Arc<Record>> {
        self.resolver.cached(self.kind, self.key)
    }

    pub fn is_cached(&self) -> bool {
        self.get().is_some()
    }

    /// The cached record, or one fetch from the origin.
    ///
    /// A failed fetch is not remembered.
    pub async fn fetch(&self) -> Result<Arc<Record>, FetchError> {
        self.resolver.resolve(self.kind, self.key).await
    }
}

/// Handle for a relation to a list of entities.
#[derive(Debug, Clone)]
pub struct ProxyList {
    resolver: Resolver,
    kind: EntityKind,
    keys: Vec<EntityKey>,
}

impl ProxyList {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn ids(&self) -> impl Iterator<Item = Snowflake> + '_ {
        self.keys.iter().map(|key| key.id())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The currently cached entries, in relation order. Ids that do not
    /// resolve are skipped. Lazy, and can be called again for a fresh pass.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Record>> + '_ {
        self.keys
            .iter()
            .filter_map(|key| self.resolver.cached(self.kind, *key))
    }

    /// A single-entry proxy for each id.
    pub fn proxies(&self) -> impl Iterator<Item = Proxy> + '_ {
        self.keys
            .iter()
            .map(|key| self.resolver.one_key(self.kind, *key))
    }

    /// Every entry, fetching misses from the origin concurrently.
    ///
    /// Ids the origin does not know are left out. Any other fetch failure
    /// fails the whole call.
    pub async fn fetch_all(&self) -> Result<HashMap<Snowflake, Arc<Record>>, FetchError> {
        let fetches = self.keys.iter().map(|key| async move {
            match self.resolver.resolve(self.kind, *key).await {
                Ok(record) => Ok(Some(record)),
                Err(FetchError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        });

        let records = try_join_all(fetches).await?;
        Ok(records
            .into_iter()
            .flatten()
            .map(|record| (record.id(), record))
            .collect())
    }

    /// Every entry in relation order, fetching misses one at a time.
    pub fn stream(&self) -> impl Stream<Item = Result<Arc<Record>, FetchError>> + '_ {
        stream::iter(self.keys.iter().copied())
            .then(move |key| self.resolver.resolve(self.kind, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves users from a fixed table and counts calls.
    #[derive(Default)]
    struct TableOrigin {
        users: HashMap<u64, Value>,
        calls: AtomicUsize,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl Origin for TableOrigin {
        async fn fetch(
            &self,
            _kind: EntityKind,
            key: EntityKey,
        ) -> Result<Option<Value>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(FetchError::Origin("rate limited".into()));
            }
            Ok(self.users.get(&key.id().get()).cloned())
        }
    }

    fn resolver_with(origin: Arc<TableOrigin>) -> Resolver {
        Resolver::new(
            Arc::new(EntityStore::new()),
            origin,
            Arc::new(CacheConfig::default()),
        )
    }

    fn origin() -> Arc<TableOrigin> {
        let mut users = HashMap::new();
        users.insert(1, json!({"id": "1", "username": "one"}));
        users.insert(2, json!({"id": "2", "username": "two"}));
        Arc::new(TableOrigin {
            users,
            ..Default::default()
        })
    }

    fn seed(resolver: &Resolver, id: u64) {
        resolver
            .store()
            .put(
                EntityKind::User,
                EntityKey::Global(Snowflake::new(id)),
                json!({"id": id.to_string(), "username": "cached"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn test_get_miss_is_none() {
        let resolver = resolver_with(origin());
        let proxy = resolver.one(EntityKind::User, Snowflake::new(1));
        assert!(proxy.get().is_none());
        assert!(!proxy.is_cached());
    }

    #[test]
    fn test_cached_fetch_does_not_suspend() {
        let origin = origin();
        let resolver = resolver_with(Arc::clone(&origin));
        seed(&resolver, 1);

        let proxy = resolver.one(EntityKind::User, Snowflake::new(1));
        let record = proxy
            .fetch()
            .now_or_never()
            .expect("cached fetch suspended")
            .unwrap();
        assert_eq!(record.get_str("username"), Some("cached"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_stores_result() {
        let origin = origin();
        let resolver = resolver_with(Arc::clone(&origin));
        let proxy = resolver.one(EntityKind::User, Snowflake::new(2));

        let record = proxy.fetch().await.unwrap();
        assert_eq!(record.get_str("username"), Some("two"));
        assert!(proxy.is_cached());

        proxy.fetch().await.unwrap();
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let origin = origin();
        let resolver = resolver_with(Arc::clone(&origin));
        let proxy = resolver.one(EntityKind::User, Snowflake::new(99));

        assert!(matches!(
            proxy.fetch().await,
            Err(FetchError::NotFound { .. })
        ));
        assert!(proxy.fetch().await.is_err());
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_then_success() {
        let origin = origin();
        *origin.fail_next.lock().unwrap() = true;
        let resolver = resolver_with(Arc::clone(&origin));
        let proxy = resolver.one(EntityKind::User, Snowflake::new(1));

        assert!(matches!(proxy.fetch().await, Err(FetchError::Origin(_))));
        assert!(proxy.fetch().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_iter_skips_misses() {
        let resolver = resolver_with(origin());
        seed(&resolver, 3);
        seed(&resolver, 1);

        let list = resolver.many(
            EntityKind::User,
            [1, 2, 3].map(Snowflake::new),
        );
        let cached: Vec<_> = list.iter().map(|r| r.id().get()).collect();
        assert_eq!(cached, vec![1, 3]);

        // Restartable, and sees later writes.
        seed(&resolver, 2);
        assert_eq!(list.iter().count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_all_fills_misses() {
        let origin = origin();
        let resolver = resolver_with(Arc::clone(&origin));
        seed(&resolver, 1);

        let list = resolver.many(EntityKind::User, [1, 2, 77].map(Snowflake::new));
        let all = list.fetch_all().await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[&Snowflake::new(1)].get_str("username"), Some("cached"));
        assert_eq!(all[&Snowflake::new(2)].get_str("username"), Some("two"));
        // Only the two misses went to the origin.
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_in_order() {
        let resolver = resolver_with(origin());
        let list = resolver.many(EntityKind::User, [2, 1].map(Snowflake::new));

        let ids: Vec<_> = list
            .stream()
            .map(|r| r.unwrap().id().get())
            .collect()
            .await;
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_writes_nothing() {
        struct Never;

        #[async_trait]
        impl Origin for Never {
            async fn fetch(
                &self,
                _kind: EntityKind,
                _key: EntityKey,
            ) -> Result<Option<Value>, FetchError> {
                std::future::pending().await
            }
        }

        let store = Arc::new(EntityStore::new());
        let resolver = Resolver::new(
            Arc::clone(&store),
            Arc::new(Never),
            Arc::new(CacheConfig::default()),
        );
        let proxy = resolver.one(EntityKind::User, Snowflake::new(1));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(10), proxy.fetch()).await;
        assert!(result.is_err());
        assert_eq!(store.count(EntityKind::User), 0);
    }
}
