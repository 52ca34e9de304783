//! Typed views over normalized records.
//!
//! Each model deserializes from a [`Record`](crate::Record) via
//! [`Record::to_model`](crate::Record::to_model). Relations stay ids; the
//! accessor methods turn them into proxies against a [`Resolver`].
//!
//! Unknown fields are ignored, so a model only needs the fields it reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::{Proxy, ProxyList, Resolver};
use crate::{EntityKind, Snowflake};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub channel_ids: Vec<Snowflake>,
    #[serde(default)]
    pub thread_ids: Vec<Snowflake>,
    #[serde(default)]
    pub role_ids: Vec<Snowflake>,
    #[serde(default)]
    pub emoji_ids: Vec<Snowflake>,
    #[serde(default)]
    pub sticker_ids: Vec<Snowflake>,
}

impl Guild {
    pub fn owner(&self, resolver: &Resolver) -> Option<Proxy> {
        self.owner_id
            .map(|id| resolver.scoped(EntityKind::Member, self.id, id))
    }

    pub fn channels(&self, resolver: &Resolver) -> ProxyList {
        resolver.many(EntityKind::Channel, self.channel_ids.iter().copied())
    }

    pub fn threads(&self, resolver: &Resolver) -> ProxyList {
        resolver.many(EntityKind::Thread, self.thread_ids.iter().copied())
    }

    pub fn roles(&self, resolver: &Resolver) -> ProxyList {
        resolver.many_scoped(EntityKind::Role, self.id, self.role_ids.iter().copied())
    }

    pub fn emojis(&self, resolver: &Resolver) -> ProxyList {
        resolver.many_scoped(EntityKind::Emoji, self.id, self.emoji_ids.iter().copied())
    }

    pub fn stickers(&self, resolver: &Resolver) -> ProxyList {
        resolver.many(EntityKind::Sticker, self.sticker_ids.iter().copied())
    }

    /// Every member currently in the cache, in id order. Includes members
    /// that arrived in chunks after the guild itself.
    pub fn members(&self, resolver: &Resolver) -> ProxyList {
        let ids = resolver.store().scoped_ids(EntityKind::Member, self.id);
        resolver.many_scoped(EntityKind::Member, self.id, ids)
    }

    /// Whether every member the guild reports is cached.
    pub fn is_chunked(&self, resolver: &Resolver) -> bool {
        let cached = resolver.store().scoped_ids(EntityKind::Member, self.id).len() as u64;
        self.member_count.is_some_and(|expected| cached >= expected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    /// Channel type as sent by the gateway.
    #[serde(rename = "type", default)]
    pub channel_type: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub recipient_ids: Vec<Snowflake>,
}

impl Channel {
    pub fn guild(&self, resolver: &Resolver) -> Option<Proxy> {
        self.guild_id.map(|id| resolver.one(EntityKind::Guild, id))
    }

    pub fn parent(&self, resolver: &Resolver) -> Option<Proxy> {
        self.parent_id
            .map(|id| resolver.one(EntityKind::Channel, id))
    }

    pub fn recipients(&self, resolver: &Resolver) -> ProxyList {
        resolver.many(EntityKind::User, self.recipient_ids.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Snowflake,
    pub guild_id: Snowflake,
    #[serde(default)]
    pub nick: Option<String>,
    /// Role ids, as sent by the gateway.
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: bool,
}

impl Member {
    pub fn user(&self, resolver: &Resolver) -> Proxy {
        resolver.one(EntityKind::User, self.user_id)
    }

    pub fn guild(&self, resolver: &Resolver) -> Proxy {
        resolver.one(EntityKind::Guild, self.guild_id)
    }

    pub fn roles(&self, resolver: &Resolver) -> ProxyList {
        resolver.many_scoped(EntityKind::Role, self.guild_id, self.roles.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emoji {
    pub id: Snowflake,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub user_id: Option<Snowflake>,
    #[serde(default)]
    pub animated: bool,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
}

impl Emoji {
    /// The user that uploaded the emoji.
    pub fn creator(&self, resolver: &Resolver) -> Option<Proxy> {
        self.user_id.map(|id| resolver.one(EntityKind::User, id))
    }

    /// Chat markup for the emoji, e.g. `<:snek:123>`.
    pub fn markup(&self) -> String {
        let name = self.name.as_deref().unwrap_or("_");
        if self.animated {
            format!("<a:{name}:{}>", self.id)
        } else {
            format!("<:{name}:{}>", self.id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author_id: Option<Snowflake>,
    #[serde(default)]
    pub mention_ids: Vec<Snowflake>,
    #[serde(default)]
    pub referenced_message_id: Option<Snowflake>,
    #[serde(default)]
    pub thread_channel_id: Option<Snowflake>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
}

impl Message {
    pub fn channel(&self, resolver: &Resolver) -> Proxy {
        resolver.one(EntityKind::Channel, self.channel_id)
    }

    pub fn author(&self, resolver: &Resolver) -> Option<Proxy> {
        self.author_id.map(|id| resolver.one(EntityKind::User, id))
    }

    /// The author's guild membership, for guild messages.
    pub fn member(&self, resolver: &Resolver) -> Option<Proxy> {
        let guild_id = self.guild_id?;
        let author_id = self.author_id?;
        Some(resolver.scoped(EntityKind::Member, guild_id, author_id))
    }

    pub fn mentions(&self, resolver: &Resolver) -> ProxyList {
        resolver.many(EntityKind::User, self.mention_ids.iter().copied())
    }

    pub fn referenced(&self, resolver: &Resolver) -> Option<Proxy> {
        self.referenced_message_id
            .map(|id| resolver.one(EntityKind::Message, id))
    }

    pub fn thread(&self, resolver: &Resolver) -> Option<Proxy> {
        self.thread_channel_id
            .map(|id| resolver.one(EntityKind::Thread, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::Decomposer;
    use crate::proxy::NullOrigin;
    use crate::{CacheConfig, EntityStore};
    use serde_json::json;
    use std::sync::Arc;

    fn resolver() -> Resolver {
        Resolver::new(
            Arc::new(EntityStore::new()),
            Arc::new(NullOrigin),
            Arc::new(CacheConfig::default()),
        )
    }

    #[test]
    fn test_guild_relations() {
        let resolver = resolver();
        let config = CacheConfig::default();
        let decomposer = Decomposer::new(resolver.store(), &config);
        let guild: Guild = decomposer
            .place(
                EntityKind::Guild,
                json!({
                    "id": "1",
                    "name": "snakes",
                    "owner_id": "7",
                    "member_count": 2,
                    "channels": [{"id": "10", "name": "general", "type": 0}],
                    "roles": [{"id": "20", "name": "admin", "color": 255}],
                    "members": [{"user": {"id": "7", "username": "owner"}, "roles": ["20"]}],
                }),
            )
            .unwrap()
            .after
            .to_model()
            .unwrap();

        assert_eq!(guild.name, "snakes");
        let channels: Vec<Channel> = guild
            .channels(&resolver)
            .iter()
            .map(|r| r.to_model().unwrap())
            .collect();
        assert_eq!(channels[0].name.as_deref(), Some("general"));
        assert_eq!(channels[0].guild_id, Some(Snowflake::new(1)));

        let owner: Member = guild.owner(&resolver).unwrap().get().unwrap().to_model().unwrap();
        assert_eq!(owner.user_id, 7u64);
        let role: Role = owner.roles(&resolver).iter().next().unwrap().to_model().unwrap();
        assert_eq!(role.name, "admin");
        assert_eq!(role.color, 255);

        let user: User = owner.user(&resolver).get().unwrap().to_model().unwrap();
        assert_eq!(user.display_name(), "owner");

        assert_eq!(guild.members(&resolver).len(), 1);
        assert!(!guild.is_chunked(&resolver));
    }

    #[test]
    fn test_message_author_and_member() {
        let resolver = resolver();
        let config = CacheConfig::default();
        let decomposer = Decomposer::new(resolver.store(), &config);
        let message: Message = decomposer
            .place(
                EntityKind::Message,
                json!({
                    "id": "100",
                    "channel_id": "10",
                    "guild_id": "1",
                    "content": "hi",
                    "timestamp": "2022-01-01T00:00:00+00:00",
                    "author": {"id": "7", "username": "snek"},
                    "member": {"nick": "Snek"},
                }),
            )
            .unwrap()
            .after
            .to_model()
            .unwrap();

        assert_eq!(message.content, "hi");
        assert!(message.timestamp.is_some());
        let author: User = message.author(&resolver).unwrap().get().unwrap().to_model().unwrap();
        assert_eq!(author.username, "snek");
        let member: Member = message.member(&resolver).unwrap().get().unwrap().to_model().unwrap();
        assert_eq!(member.nick.as_deref(), Some("Snek"));
        // The channel was never seen.
        assert!(message.channel(&resolver).get().is_none());
    }

    #[test]
    fn test_emoji_markup() {
        let emoji = Emoji {
            id: Snowflake::new(123),
            name: Some("snek".into()),
            guild_id: None,
            user_id: None,
            animated: true,
            roles: Vec::new(),
        };
        assert_eq!(emoji.markup(), "<a:snek:123>");
    }
}
