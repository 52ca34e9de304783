//! Normalized domain events.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{EntityKind, Record, Snowflake};

/// A record as it was at some point, or the explicit marker that there was
/// none.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Absent,
    Present(Arc<Record>),
}

impl Snapshot {
    pub fn is_absent(&self) -> bool {
        matches!(self, Snapshot::Absent)
    }

    pub fn record(&self) -> Option<&Arc<Record>> {
        match self {
            Snapshot::Absent => None,
            Snapshot::Present(record) => Some(record),
        }
    }
}

impl From<Option<Arc<Record>>> for Snapshot {
    fn from(record: Option<Arc<Record>>) -> Self {
        record.map_or(Snapshot::Absent, Snapshot::Present)
    }
}

/// Event emitted to subscribers after an update has been applied.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// The client joined a guild, or it became available for the first time.
    GuildJoin { guild: Arc<Record> },
    /// A previously unavailable guild became available again.
    GuildAvailable { guild: Arc<Record> },
    GuildUpdate {
        before: Snapshot,
        after: Arc<Record>,
    },
    /// The client was removed from the guild. Its records are already evicted.
    GuildLeft { id: Snowflake, last_known: Snapshot },
    /// The guild is temporarily unreachable. Its records are kept.
    GuildUnavailable { id: Snowflake, last_known: Snapshot },
    /// Member chunking for the guild finished.
    GuildReady { id: Snowflake },
    BanCreate { guild_id: Snowflake, user: Arc<Record> },
    BanRemove { guild_id: Snowflake, user: Arc<Record> },
    GuildEmojisUpdate {
        guild_id: Snowflake,
        before: Vec<Arc<Record>>,
        after: Vec<Arc<Record>>,
    },
    GuildStickersUpdate {
        guild_id: Snowflake,
        before: Vec<Arc<Record>>,
        after: Vec<Arc<Record>>,
    },
    WebhooksUpdate {
        guild_id: Snowflake,
        channel_id: Snowflake,
    },
    IntegrationCreate { integration: Arc<Record> },
    IntegrationUpdate {
        before: Snapshot,
        after: Arc<Record>,
    },
    IntegrationDelete {
        guild_id: Snowflake,
        id: Snowflake,
        application_id: Option<Snowflake>,
        last_known: Snapshot,
    },
    /// A record of any other kind was created.
    Created { kind: EntityKind, record: Arc<Record> },
    /// A record of any other kind was updated.
    Updated {
        kind: EntityKind,
        before: Snapshot,
        after: Arc<Record>,
    },
    /// A record of any other kind was deleted.
    Deleted {
        kind: EntityKind,
        id: Snowflake,
        last_known: Snapshot,
    },
    /// The unprocessed update, when raw dispatch is enabled.
    Raw { name: String, data: Value },
}

impl CacheEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::GuildJoin { .. } => "guild_join",
            CacheEvent::GuildAvailable { .. } => "guild_available",
            CacheEvent::GuildUpdate { .. } => "guild_update",
            CacheEvent::GuildLeft { .. } => "guild_left",
            CacheEvent::GuildUnavailable { .. } => "guild_unavailable",
            CacheEvent::GuildReady { .. } => "guild_ready",
            CacheEvent::BanCreate { .. } => "ban_create",
            CacheEvent::BanRemove { .. } => "ban_remove",
            CacheEvent::GuildEmojisUpdate { .. } => "guild_emojis_update",
            CacheEvent::GuildStickersUpdate { .. } => "guild_stickers_update",
            CacheEvent::WebhooksUpdate { .. } => "webhooks_update",
            CacheEvent::IntegrationCreate { .. } => "integration_create",
            CacheEvent::IntegrationUpdate { .. } => "integration_update",
            CacheEvent::IntegrationDelete { .. } => "integration_delete",
            CacheEvent::Created { .. } => "created",
            CacheEvent::Updated { .. } => "updated",
            CacheEvent::Deleted { .. } => "deleted",
            CacheEvent::Raw { .. } => "raw",
        }
    }
}

/// Fan-out of [`CacheEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CacheEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "no subscribers for cache event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityKey;
    use serde_json::Map;

    #[test]
    fn test_snapshot_from_option() {
        assert!(Snapshot::from(None).is_absent());

        let record = Arc::new(Record::new(
            EntityKind::User,
            EntityKey::Global(Snowflake::new(1)),
            Map::new(),
        ));
        let snapshot = Snapshot::from(Some(Arc::clone(&record)));
        assert_eq!(snapshot.record(), Some(&record));
    }

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(CacheEvent::GuildReady {
            id: Snowflake::new(5),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                CacheEvent::GuildReady { id } => assert_eq!(id, 5u64),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(1);
        bus.emit(CacheEvent::Raw {
            name: "X".into(),
            data: Value::Null,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
