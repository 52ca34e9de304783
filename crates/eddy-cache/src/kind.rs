//! Entity kinds and how each one is keyed.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CacheError, Snowflake};

/// Every kind of record the cache stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Guild,
    Channel,
    Thread,
    Member,
    Role,
    User,
    Message,
    Emoji,
    VoiceState,
    Sticker,
    Integration,
    AutoModRule,
}

impl EntityKind {
    /// All kinds, in storage order.
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Guild,
        EntityKind::Channel,
        EntityKind::Thread,
        EntityKind::Member,
        EntityKind::Role,
        EntityKind::User,
        EntityKind::Message,
        EntityKind::Emoji,
        EntityKind::VoiceState,
        EntityKind::Sticker,
        EntityKind::Integration,
        EntityKind::AutoModRule,
    ];

    /// Whether records of this kind live in a per-guild sub-store.
    pub fn is_guild_scoped(self) -> bool {
        matches!(
            self,
            EntityKind::Member | EntityKind::Role | EntityKind::Emoji | EntityKind::VoiceState
        )
    }

    /// Snake-case name, as used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Guild => "guild",
            EntityKind::Channel => "channel",
            EntityKind::Thread => "thread",
            EntityKind::Member => "member",
            EntityKind::Role => "role",
            EntityKind::User => "user",
            EntityKind::Message => "message",
            EntityKind::Emoji => "emoji",
            EntityKind::VoiceState => "voice_state",
            EntityKind::Sticker => "sticker",
            EntityKind::Integration => "integration",
            EntityKind::AutoModRule => "auto_mod_rule",
        }
    }

    /// Extract the identifier a payload of this kind is keyed by.
    ///
    /// Members have no id of their own and are keyed by their user; voice
    /// states are keyed by `user_id`.
    pub fn identify(self, payload: &Map<String, Value>) -> Result<Snowflake, CacheError> {
        let raw = match self {
            EntityKind::Member => payload
                .get("user")
                .and_then(Value::as_object)
                .and_then(|user| user.get("id"))
                .or_else(|| payload.get("user_id"))
                .or_else(|| payload.get("id")),
            EntityKind::VoiceState => payload.get("user_id"),
            _ => payload.get("id"),
        };

        match raw {
            None | Some(Value::Null) => Err(CacheError::MissingId { kind: self }),
            Some(value) => Snowflake::try_from_value(value),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record lives: globally, or inside one guild's sub-store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Global(Snowflake),
    Scoped { guild_id: Snowflake, id: Snowflake },
}

impl EntityKey {
    /// The entity's own id.
    pub fn id(self) -> Snowflake {
        match self {
            EntityKey::Global(id) => id,
            EntityKey::Scoped { id, .. } => id,
        }
    }

    /// The owning guild, for scoped keys.
    pub fn guild_id(self) -> Option<Snowflake> {
        match self {
            EntityKey::Global(_) => None,
            EntityKey::Scoped { guild_id, .. } => Some(guild_id),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Global(id) => write!(f, "{id}"),
            EntityKey::Scoped { guild_id, id } => write!(f, "{guild_id}/{id}"),
        }
    }
}
