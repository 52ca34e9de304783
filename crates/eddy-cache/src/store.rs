//! In-memory entity store.
//!
//! One concurrent map per global kind, plus one sub-store per guild holding
//! that guild's members, roles, emoji and voice states. Reads never block on
//! I/O and never suspend. Writes merge into the existing record and replace
//! it with a fresh `Arc`, so previously handed-out snapshots stay unchanged.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::{CacheError, EntityKey, EntityKind, Record, Snowflake};

type KindMap = DashMap<Snowflake, Arc<Record>>;

/// Result of a [`EntityStore::put`].
#[derive(Debug, Clone)]
pub struct Put {
    /// The record as it was before this write, if there was one.
    pub before: Option<Arc<Record>>,
    /// The record as stored after this write.
    pub after: Arc<Record>,
}

impl Put {
    pub fn is_update(&self) -> bool {
        self.before.is_some()
    }
}

/// Records scoped to a single guild.
#[derive(Debug, Default)]
pub struct GuildScope {
    members: KindMap,
    roles: KindMap,
    emoji: KindMap,
    voice_states: KindMap,
}

impl GuildScope {
    fn map(&self, kind: EntityKind) -> Option<&KindMap> {
        match kind {
            EntityKind::Member => Some(&self.members),
            EntityKind::Role => Some(&self.roles),
            EntityKind::Emoji => Some(&self.emoji),
            EntityKind::VoiceState => Some(&self.voice_states),
            _ => None,
        }
    }
}

/// Per-kind record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub guilds: usize,
    pub channels: usize,
    pub threads: usize,
    pub users: usize,
    pub messages: usize,
    pub stickers: usize,
    pub integrations: usize,
    pub auto_mod_rules: usize,
    pub members: usize,
    pub roles: usize,
    pub emoji: usize,
    pub voice_states: usize,
}

/// Thread-safe store of normalized records, keyed by snowflake.
#[derive(Debug, Default)]
pub struct EntityStore {
    guilds: KindMap,
    channels: KindMap,
    threads: KindMap,
    users: KindMap,
    messages: KindMap,
    stickers: KindMap,
    integrations: KindMap,
    auto_mod_rules: KindMap,
    /// Guild-scoped sub-stores, created lazily on first insert.
    scopes: DashMap<Snowflake, Arc<GuildScope>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn global(&self, kind: EntityKind) -> Option<&KindMap> {
        match kind {
            EntityKind::Guild => Some(&self.guilds),
            EntityKind::Channel => Some(&self.channels),
            EntityKind::Thread => Some(&self.threads),
            EntityKind::User => Some(&self.users),
            EntityKind::Message => Some(&self.messages),
            EntityKind::Sticker => Some(&self.stickers),
            EntityKind::Integration => Some(&self.integrations),
            EntityKind::AutoModRule => Some(&self.auto_mod_rules),
            _ => None,
        }
    }

    fn scope(&self, guild_id: Snowflake) -> Option<Arc<GuildScope>> {
        self.scopes.get(&guild_id).map(|s| Arc::clone(s.value()))
    }

    /// Merge `fields` into the record at `key`, creating it if absent.
    ///
    /// Guild-scoped kinds require a [`EntityKey::Scoped`] key.
    pub fn put(
        &self,
        kind: EntityKind,
        key: EntityKey,
        fields: Map<String, Value>,
    ) -> Result<Put, CacheError> {
        let put = if kind.is_guild_scoped() {
            let EntityKey::Scoped { guild_id, id } = key else {
                return Err(CacheError::MissingGuild { kind });
            };
            let scope = Arc::clone(self.scopes.entry(guild_id).or_default().value());
            match scope.map(kind) {
                Some(map) => upsert(map, kind, key, id, fields),
                None => return Err(CacheError::UnstorableKind { kind }),
            }
        } else {
            let id = key.id();
            match self.global(kind) {
                Some(map) => upsert(map, kind, EntityKey::Global(id), id, fields),
                None => return Err(CacheError::UnstorableKind { kind }),
            }
        };

        trace!(kind = %kind, key = %key, update = put.is_update(), "store: record upserted");
        Ok(put)
    }

    /// Look up a record by kind and id. Never performs I/O.
    ///
    /// For guild-scoped kinds this searches every guild's sub-store; prefer
    /// [`EntityStore::get_guild_scoped`] when the guild is known.
    pub fn get(&self, kind: EntityKind, id: Snowflake) -> Option<Arc<Record>> {
        if kind.is_guild_scoped() {
            return self.scopes.iter().find_map(|scope| {
                scope
                    .value()
                    .map(kind)
                    .and_then(|map| map.get(&id).map(|r| Arc::clone(r.value())))
            });
        }
        self.global(kind)?.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Look up a record inside one guild's sub-store.
    pub fn get_guild_scoped(
        &self,
        kind: EntityKind,
        guild_id: Snowflake,
        id: Snowflake,
    ) -> Option<Arc<Record>> {
        let scope = self.scope(guild_id)?;
        scope.map(kind)?.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Look up a record by its full key.
    pub fn get_key(&self, kind: EntityKind, key: EntityKey) -> Option<Arc<Record>> {
        match key {
            EntityKey::Scoped { guild_id, id } if kind.is_guild_scoped() => {
                self.get_guild_scoped(kind, guild_id, id)
            }
            key => self.get(kind, key.id()),
        }
    }

    /// Remove a single record, returning the last stored version.
    pub fn delete(&self, kind: EntityKind, key: EntityKey) -> Option<Arc<Record>> {
        let removed = match key {
            EntityKey::Scoped { guild_id, id } if kind.is_guild_scoped() => self
                .scope(guild_id)
                .and_then(|scope| scope.map(kind).and_then(|map| map.remove(&id))),
            key => self.global(kind).and_then(|map| map.remove(&key.id())),
        };

        let removed = removed.map(|(_, record)| record);
        if removed.is_some() {
            trace!(kind = %kind, key = %key, "store: record deleted");
        }
        removed
    }

    /// Drop a guild's record together with its whole sub-store.
    ///
    /// The guild record goes first, so a reader that finds the guild also
    /// finds its members and roles. A reader may briefly see scoped records
    /// of a guild that is already gone, never the reverse.
    ///
    /// Callers holding records from the evicted sub-store keep their
    /// snapshots, but nothing is reachable through lookups afterwards.
    pub fn delete_guild(&self, guild_id: Snowflake) -> Option<Arc<Record>> {
        let guild = self.guilds.remove(&guild_id).map(|(_, record)| record);
        let scope = self.scopes.remove(&guild_id).map(|(_, scope)| scope);

        debug!(
            guild_id = %guild_id,
            members = scope.as_ref().map_or(0, |s| s.members.len()),
            roles = scope.as_ref().map_or(0, |s| s.roles.len()),
            "store: guild evicted"
        );
        guild
    }

    /// Remove every global record of `kind` whose `guild_id` is `guild_id`.
    /// Returns how many were removed.
    pub fn delete_by_guild(&self, kind: EntityKind, guild_id: Snowflake) -> usize {
        let Some(map) = self.global(kind) else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, record| record.relation_id("guild_id") != Some(guild_id));
        let removed = before.saturating_sub(map.len());
        if removed > 0 {
            trace!(kind = %kind, guild_id = %guild_id, removed, "store: guild records deleted");
        }
        removed
    }

    /// Ids of every record of `kind` within one guild, ascending.
    pub fn scoped_ids(&self, kind: EntityKind, guild_id: Snowflake) -> Vec<Snowflake> {
        let Some(scope) = self.scope(guild_id) else {
            return Vec::new();
        };
        let mut ids: Vec<Snowflake> = match scope.map(kind) {
            Some(map) => map.iter().map(|r| *r.key()).collect(),
            None => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    /// Ids of every cached guild.
    pub fn guild_ids(&self) -> Vec<Snowflake> {
        self.guilds.iter().map(|r| *r.key()).collect()
    }

    /// Number of records of `kind`, across all guilds for scoped kinds.
    pub fn count(&self, kind: EntityKind) -> usize {
        if kind.is_guild_scoped() {
            return self
                .scopes
                .iter()
                .map(|scope| scope.value().map(kind).map_or(0, |map| map.len()))
                .sum();
        }
        self.global(kind).map_or(0, |map| map.len())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            guilds: self.count(EntityKind::Guild),
            channels: self.count(EntityKind::Channel),
            threads: self.count(EntityKind::Thread),
            users: self.count(EntityKind::User),
            messages: self.count(EntityKind::Message),
            stickers: self.count(EntityKind::Sticker),
            integrations: self.count(EntityKind::Integration),
            auto_mod_rules: self.count(EntityKind::AutoModRule),
            members: self.count(EntityKind::Member),
            roles: self.count(EntityKind::Role),
            emoji: self.count(EntityKind::Emoji),
            voice_states: self.count(EntityKind::VoiceState),
        }
    }

    /// Drop every record (e.g. before a full re-sync).
    pub fn clear(&self) {
        for kind in EntityKind::ALL {
            if let Some(map) = self.global(kind) {
                map.clear();
            }
        }
        self.scopes.clear();
        debug!("store cleared");
    }
}

fn upsert(
    map: &KindMap,
    kind: EntityKind,
    key: EntityKey,
    id: Snowflake,
    fields: Map<String, Value>,
) -> Put {
    // The entry guard serializes writers for this id, so concurrent merges
    // into the same record never lose fields.
    match map.entry(id) {
        Entry::Occupied(mut entry) => {
            let before = Arc::clone(entry.get());
            let after = Arc::new(before.merge(fields));
            entry.insert(Arc::clone(&after));
            Put {
                before: Some(before),
                after,
            }
        }
        Entry::Vacant(entry) => {
            let after = Arc::new(Record::new(kind, key, fields));
            entry.insert(Arc::clone(&after));
            Put {
                before: None,
                after,
            }
        }
    }
}
