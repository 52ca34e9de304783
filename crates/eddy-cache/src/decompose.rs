//! Payload decomposition.
//!
//! Gateway payloads nest entities inside each other: a guild carries its
//! channels, roles and members, a member carries its user, a message its
//! author and mentions. Decomposition walks a payload using a fixed rule table
//! per kind, stores every embedded entity as its own record, and rewrites the
//! parent so its relation fields hold ids only.
//!
//! Children are always written before the parent. A concurrent reader can at
//! worst see a child with nothing pointing at it yet.
//!
//! # Rule table
//!
//! | Parent | Field | Stored as | Rewritten to |
//! |---|---|---|---|
//! | guild | `channels` | channel | `channel_ids` |
//! | guild | `threads` | thread | `thread_ids` |
//! | guild | `members` | member | `member_ids` |
//! | guild | `roles` | role | `role_ids` |
//! | guild | `emojis` | emoji | `emoji_ids` |
//! | guild | `voice_states` | voice state | `voice_state_ids` |
//! | guild | `stickers` | sticker | `sticker_ids` |
//! | channel, thread | `recipients` | user | `recipient_ids` |
//! | member | `user` | user | `user_id` |
//! | message | `author` | user or member | `author_id` |
//! | message | `mentions` | user or member | `mention_ids` |
//! | message | `referenced_message` | message | `referenced_message_id` |
//! | message | `thread` | thread | `thread_channel_id` |
//! | emoji, sticker, integration | `user` | user | `user_id` |
//! | voice state | `member` | member | `member_id` |

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::store::Put;
use crate::{CacheConfig, CacheError, EntityKey, EntityKind, EntityStore, Record, Snowflake};

/// Whether a relation holds one entity or a list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    One,
    Many,
}

/// What an embedded object is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Always the given kind.
    Kind(EntityKind),
    /// A user, promoted to a guild member when the payload is in a guild and
    /// carries member data alongside the user.
    UserOrMember,
}

impl Target {
    fn kinds(self) -> &'static [EntityKind] {
        match self {
            Target::Kind(EntityKind::Guild) => &[EntityKind::Guild],
            Target::Kind(EntityKind::Channel) => &[EntityKind::Channel],
            Target::Kind(EntityKind::Thread) => &[EntityKind::Thread],
            Target::Kind(EntityKind::Member) => &[EntityKind::Member],
            Target::Kind(EntityKind::Role) => &[EntityKind::Role],
            Target::Kind(EntityKind::User) => &[EntityKind::User],
            Target::Kind(EntityKind::Message) => &[EntityKind::Message],
            Target::Kind(EntityKind::Emoji) => &[EntityKind::Emoji],
            Target::Kind(EntityKind::VoiceState) => &[EntityKind::VoiceState],
            Target::Kind(EntityKind::Sticker) => &[EntityKind::Sticker],
            Target::Kind(EntityKind::Integration) => &[EntityKind::Integration],
            Target::Kind(EntityKind::AutoModRule) => &[EntityKind::AutoModRule],
            Target::UserOrMember => &[EntityKind::User, EntityKind::Member],
        }
    }
}

/// One embedded relation of a kind.
#[derive(Debug, Clone, Copy)]
pub struct RelationRule {
    /// Field holding the embedded object(s) in the raw payload.
    pub field: &'static str,
    pub target: Target,
    pub shape: Shape,
    /// Field holding the extracted id(s) in the normalized payload.
    pub rename: &'static str,
}

const fn rule(
    field: &'static str,
    target: Target,
    shape: Shape,
    rename: &'static str,
) -> RelationRule {
    RelationRule {
        field,
        target,
        shape,
        rename,
    }
}

const GUILD_RULES: &[RelationRule] = &[
    rule("channels", Target::Kind(EntityKind::Channel), Shape::Many, "channel_ids"),
    rule("threads", Target::Kind(EntityKind::Thread), Shape::Many, "thread_ids"),
    rule("members", Target::Kind(EntityKind::Member), Shape::Many, "member_ids"),
    rule("roles", Target::Kind(EntityKind::Role), Shape::Many, "role_ids"),
    rule("emojis", Target::Kind(EntityKind::Emoji), Shape::Many, "emoji_ids"),
    rule("voice_states", Target::Kind(EntityKind::VoiceState), Shape::Many, "voice_state_ids"),
    rule("stickers", Target::Kind(EntityKind::Sticker), Shape::Many, "sticker_ids"),
];

const CHANNEL_RULES: &[RelationRule] = &[rule(
    "recipients",
    Target::Kind(EntityKind::User),
    Shape::Many,
    "recipient_ids",
)];

const USER_OWNED_RULES: &[RelationRule] =
    &[rule("user", Target::Kind(EntityKind::User), Shape::One, "user_id")];

const MESSAGE_RULES: &[RelationRule] = &[
    rule("author", Target::UserOrMember, Shape::One, "author_id"),
    rule("mentions", Target::UserOrMember, Shape::Many, "mention_ids"),
    rule("referenced_message", Target::Kind(EntityKind::Message), Shape::One, "referenced_message_id"),
    rule("thread", Target::Kind(EntityKind::Thread), Shape::One, "thread_channel_id"),
];

const VOICE_STATE_RULES: &[RelationRule] =
    &[rule("member", Target::Kind(EntityKind::Member), Shape::One, "member_id")];

/// The relation rules for a kind. Fixed at compile time.
pub fn rules_for(kind: EntityKind) -> &'static [RelationRule] {
    match kind {
        EntityKind::Guild => GUILD_RULES,
        EntityKind::Channel | EntityKind::Thread => CHANNEL_RULES,
        EntityKind::Member | EntityKind::Emoji | EntityKind::Sticker | EntityKind::Integration => {
            USER_OWNED_RULES
        }
        EntityKind::Message => MESSAGE_RULES,
        EntityKind::VoiceState => VOICE_STATE_RULES,
        EntityKind::Role | EntityKind::User | EntityKind::AutoModRule => &[],
    }
}

/// Kinds that belong to a guild and inherit its id when embedded in one.
fn inherits_guild(kind: EntityKind) -> bool {
    kind.is_guild_scoped()
        || matches!(
            kind,
            EntityKind::Channel | EntityKind::Thread | EntityKind::Sticker
        )
}

/// A payload after decomposition, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub kind: EntityKind,
    pub key: EntityKey,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    guild_id: Option<Snowflake>,
    parent: Option<EntityKind>,
}

/// Splits nested payloads into per-kind records in an [`EntityStore`].
pub struct Decomposer<'a> {
    store: &'a EntityStore,
    config: &'a CacheConfig,
}

impl<'a> Decomposer<'a> {
    pub fn new(store: &'a EntityStore, config: &'a CacheConfig) -> Self {
        Self { store, config }
    }

    /// Decompose `payload` as `kind` and store it, children first.
    pub fn place(&self, kind: EntityKind, payload: Value) -> Result<Put, CacheError> {
        self.place_with(kind, payload, None)
    }

    /// Like [`Decomposer::place`], for payloads that arrive without their
    /// guild id (e.g. members inside a member chunk).
    pub fn place_in_guild(
        &self,
        kind: EntityKind,
        guild_id: Snowflake,
        payload: Value,
    ) -> Result<Put, CacheError> {
        self.place_with(kind, payload, Some(guild_id))
    }

    fn place_with(
        &self,
        kind: EntityKind,
        payload: Value,
        guild_id: Option<Snowflake>,
    ) -> Result<Put, CacheError> {
        let ctx = Context {
            guild_id,
            parent: None,
        };
        let normalized = self.decompose_in(kind, payload, ctx)?;
        self.commit(normalized)
    }

    /// Decompose `payload` as `kind`, storing embedded entities, and return
    /// the parent's normalized fields without storing the parent.
    pub fn decompose(&self, kind: EntityKind, payload: Value) -> Result<Normalized, CacheError> {
        self.decompose_in(
            kind,
            payload,
            Context {
                guild_id: None,
                parent: None,
            },
        )
    }

    fn commit(&self, normalized: Normalized) -> Result<Put, CacheError> {
        let Normalized { kind, key, fields } = normalized;
        if !self.should_store(kind) {
            trace!(kind = %kind, key = %key, "kind not cached, record built but not stored");
            return Ok(Put {
                before: None,
                after: Arc::new(Record::new(kind, key, fields)),
            });
        }
        self.store.put(kind, key, fields)
    }

    fn should_store(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Message => self.config.cache_messages,
            EntityKind::Emoji => self.config.cache_emoji,
            _ => true,
        }
    }

    fn decompose_in(
        &self,
        kind: EntityKind,
        payload: Value,
        ctx: Context,
    ) -> Result<Normalized, CacheError> {
        let Value::Object(mut fields) = payload else {
            return Err(CacheError::NotAnObject { kind });
        };

        // Validate identity before touching the store, so a malformed payload
        // writes nothing.
        let id = kind.identify(&fields)?;
        let guild_id = match kind {
            EntityKind::Guild => Some(id),
            _ => fields
                .get("guild_id")
                .and_then(Snowflake::from_value)
                .or(ctx.guild_id),
        };
        let key = if kind.is_guild_scoped() {
            let guild_id = guild_id.ok_or(CacheError::MissingGuild { kind })?;
            EntityKey::Scoped { guild_id, id }
        } else {
            EntityKey::Global(id)
        };

        if let Some(guild_id) = guild_id
            && inherits_guild(kind)
            && !fields.contains_key("guild_id")
        {
            fields.insert("guild_id".to_string(), guild_id.to_value());
        }

        let child_ctx = Context {
            guild_id,
            parent: Some(kind),
        };

        // Message members arrive beside the author rather than inside it.
        let mut author_member = match kind {
            EntityKind::Message if guild_id.is_some() => {
                fields.remove("member").filter(Value::is_object)
            }
            _ => None,
        };

        for rule in rules_for(kind) {
            if let Some(parent) = ctx.parent
                && rule.target.kinds().contains(&parent)
            {
                trace!(kind = %kind, field = rule.field, "skipping relation back into parent");
                continue;
            }
            let Some(value) = fields.remove(rule.field) else {
                continue;
            };

            match (rule.shape, value) {
                (Shape::One, Value::Object(child)) => {
                    let member = if rule.field == "author" {
                        author_member.take()
                    } else {
                        None
                    };
                    match self.extract(rule.target, child, member, child_ctx) {
                        Extracted::Stored(child_id) => {
                            fields.insert(rule.rename.to_string(), child_id.to_value());
                        }
                        Extracted::Inline(child) => {
                            fields.insert(rule.field.to_string(), Value::Object(child));
                        }
                    }
                }
                (Shape::Many, Value::Array(items)) => {
                    let mut ids = Vec::with_capacity(items.len());
                    let mut inline = Vec::new();
                    for item in items {
                        match item {
                            Value::Object(child) => {
                                match self.extract(rule.target, child, None, child_ctx) {
                                    Extracted::Stored(child_id) => ids.push(child_id.to_value()),
                                    Extracted::Inline(child) => inline.push(Value::Object(child)),
                                }
                            }
                            bare => match Snowflake::from_value(&bare) {
                                Some(child_id) => ids.push(child_id.to_value()),
                                None => inline.push(bare),
                            },
                        }
                    }
                    fields.insert(rule.rename.to_string(), Value::Array(ids));
                    if !inline.is_empty() {
                        fields.insert(rule.field.to_string(), Value::Array(inline));
                    }
                }
                // Bare ids, nulls and anything unexpected pass through.
                (_, value) => {
                    fields.insert(rule.field.to_string(), value);
                }
            }
        }

        if let Some(member) = author_member {
            // No author to fold into; keep it as plain data.
            fields.insert("member".to_string(), member);
        }

        Ok(Normalized { kind, key, fields })
    }

    /// Store one embedded object and return its id, or hand it back when it
    /// has no identity of its own.
    fn extract(
        &self,
        target: Target,
        mut child: Map<String, Value>,
        member: Option<Value>,
        ctx: Context,
    ) -> Extracted {
        let kind = match target {
            Target::Kind(kind) => kind,
            Target::UserOrMember => {
                let member = member.or_else(|| child.remove("member"));
                match (ctx.guild_id, member) {
                    (Some(_), Some(Value::Object(mut member))) => {
                        member.insert("user".to_string(), Value::Object(child));
                        child = member;
                        EntityKind::Member
                    }
                    (_, leftover) => {
                        if let Some(leftover) = leftover {
                            child.insert("member".to_string(), leftover);
                        }
                        EntityKind::User
                    }
                }
            }
        };

        if kind.identify(&child).is_err() {
            debug!(kind = %kind, "embedded object has no identity, keeping it inline");
            return Extracted::Inline(child);
        }
        if kind.is_guild_scoped()
            && ctx.guild_id.is_none()
            && !child.contains_key("guild_id")
        {
            debug!(kind = %kind, "embedded guild-scoped object outside a guild, keeping it inline");
            return Extracted::Inline(child);
        }

        let normalized = match self.decompose_in(kind, Value::Object(child.clone()), ctx) {
            Ok(normalized) => normalized,
            Err(e) => {
                debug!(kind = %kind, error = %e, "embedded object rejected, keeping it inline");
                return Extracted::Inline(child);
            }
        };
        let id = normalized.key.id();
        match self.commit(normalized) {
            Ok(_) => Extracted::Stored(id),
            Err(e) => {
                debug!(kind = %kind, error = %e, "embedded object not stored, keeping it inline");
                Extracted::Inline(child)
            }
        }
    }
}

enum Extracted {
    Stored(Snowflake),
    Inline(Map<String, Value>),
}
