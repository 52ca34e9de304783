//! Event processors.
//!
//! Turns raw gateway updates into store writes and [`CacheEvent`]s. Every
//! update kind has its own handler; a handler either emits its event right
//! away or, for guild joins with member chunking enabled, defers it on the
//! guild's [`ReadinessGate`].
//!
//! Store writes always happen synchronously in [`EventProcessor::apply`], in
//! delivery order. Only the emission of a deferred event waits. The
//! processing loop keeps applying later updates (including the member chunks
//! that open the gate) while a join is pending.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::decompose::Decomposer;
use crate::event::{CacheEvent, EventBus, Snapshot};
use crate::gate::{GateOutcome, GateRegistry, ReadinessGate};
use crate::{CacheConfig, CacheError, EntityKey, EntityKind, EntityStore, Record, Snowflake};

/// Update kinds with a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildBanAdd,
    GuildBanRemove,
    GuildEmojisUpdate,
    GuildStickersUpdate,
    WebhooksUpdate,
    IntegrationCreate,
    IntegrationUpdate,
    IntegrationDelete,
    GuildMembersChunk,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ThreadCreate,
    ThreadUpdate,
    ThreadDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    AutoModRuleCreate,
    AutoModRuleUpdate,
    AutoModRuleDelete,
    VoiceStateUpdate,
}

impl DispatchKind {
    pub const ALL: [DispatchKind; 31] = [
        DispatchKind::GuildCreate,
        DispatchKind::GuildUpdate,
        DispatchKind::GuildDelete,
        DispatchKind::GuildBanAdd,
        DispatchKind::GuildBanRemove,
        DispatchKind::GuildEmojisUpdate,
        DispatchKind::GuildStickersUpdate,
        DispatchKind::WebhooksUpdate,
        DispatchKind::IntegrationCreate,
        DispatchKind::IntegrationUpdate,
        DispatchKind::IntegrationDelete,
        DispatchKind::GuildMembersChunk,
        DispatchKind::GuildMemberAdd,
        DispatchKind::GuildMemberUpdate,
        DispatchKind::GuildMemberRemove,
        DispatchKind::GuildRoleCreate,
        DispatchKind::GuildRoleUpdate,
        DispatchKind::GuildRoleDelete,
        DispatchKind::ChannelCreate,
        DispatchKind::ChannelUpdate,
        DispatchKind::ChannelDelete,
        DispatchKind::ThreadCreate,
        DispatchKind::ThreadUpdate,
        DispatchKind::ThreadDelete,
        DispatchKind::MessageCreate,
        DispatchKind::MessageUpdate,
        DispatchKind::MessageDelete,
        DispatchKind::AutoModRuleCreate,
        DispatchKind::AutoModRuleUpdate,
        DispatchKind::AutoModRuleDelete,
        DispatchKind::VoiceStateUpdate,
    ];

    /// The gateway name of this update kind.
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchKind::GuildCreate => "GUILD_CREATE",
            DispatchKind::GuildUpdate => "GUILD_UPDATE",
            DispatchKind::GuildDelete => "GUILD_DELETE",
            DispatchKind::GuildBanAdd => "GUILD_BAN_ADD",
            DispatchKind::GuildBanRemove => "GUILD_BAN_REMOVE",
            DispatchKind::GuildEmojisUpdate => "GUILD_EMOJIS_UPDATE",
            DispatchKind::GuildStickersUpdate => "GUILD_STICKERS_UPDATE",
            DispatchKind::WebhooksUpdate => "WEBHOOKS_UPDATE",
            DispatchKind::IntegrationCreate => "INTEGRATION_CREATE",
            DispatchKind::IntegrationUpdate => "INTEGRATION_UPDATE",
            DispatchKind::IntegrationDelete => "INTEGRATION_DELETE",
            DispatchKind::GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
            DispatchKind::GuildMemberAdd => "GUILD_MEMBER_ADD",
            DispatchKind::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            DispatchKind::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            DispatchKind::GuildRoleCreate => "GUILD_ROLE_CREATE",
            DispatchKind::GuildRoleUpdate => "GUILD_ROLE_UPDATE",
            DispatchKind::GuildRoleDelete => "GUILD_ROLE_DELETE",
            DispatchKind::ChannelCreate => "CHANNEL_CREATE",
            DispatchKind::ChannelUpdate => "CHANNEL_UPDATE",
            DispatchKind::ChannelDelete => "CHANNEL_DELETE",
            DispatchKind::ThreadCreate => "THREAD_CREATE",
            DispatchKind::ThreadUpdate => "THREAD_UPDATE",
            DispatchKind::ThreadDelete => "THREAD_DELETE",
            DispatchKind::MessageCreate => "MESSAGE_CREATE",
            DispatchKind::MessageUpdate => "MESSAGE_UPDATE",
            DispatchKind::MessageDelete => "MESSAGE_DELETE",
            DispatchKind::AutoModRuleCreate => "AUTO_MODERATION_RULE_CREATE",
            DispatchKind::AutoModRuleUpdate => "AUTO_MODERATION_RULE_UPDATE",
            DispatchKind::AutoModRuleDelete => "AUTO_MODERATION_RULE_DELETE",
            DispatchKind::VoiceStateUpdate => "VOICE_STATE_UPDATE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An update as delivered by the transport: a name and an untyped payload.
///
/// Serialized with the gateway's `t`/`d` field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "t")]
    pub name: String,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Asks the transport for a guild's member list.
///
/// Called when a guild joins with member chunking enabled and the cache does
/// not yet hold every member. The chunks arrive later as
/// `GUILD_MEMBERS_CHUNK` updates.
pub trait MemberRequester: Send + Sync {
    fn request_members(&self, guild_id: Snowflake);
}

/// An event held back until a guild's gate opens.
#[derive(Debug)]
pub struct Deferred {
    pub gate: Arc<ReadinessGate>,
    pub event: CacheEvent,
}

impl Deferred {
    /// Wait for the gate. Yields the event if the guild became ready, or
    /// nothing if the gate was closed first.
    pub fn wait(self) -> impl Future<Output = Option<CacheEvent>> + Send + 'static {
        let guild_id = self.gate.guild_id();
        let waiter = self.gate.waiter();
        let event = self.event;
        async move {
            match waiter.await {
                GateOutcome::Ready => Some(event),
                GateOutcome::Closed => {
                    debug!(guild_id = %guild_id, event = event.name(), "gate closed, deferred event dropped");
                    None
                }
            }
        }
    }
}

/// What applying one update produced.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Events to emit now, in order.
    pub events: Vec<CacheEvent>,
    /// An event to emit once a guild is ready.
    pub deferred: Option<Deferred>,
}

enum Step {
    Emit(CacheEvent),
    Defer(Arc<ReadinessGate>, CacheEvent),
    Silent,
}

/// Counters for processed updates.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    processed: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    ignored: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub deferred: u64,
    pub ignored: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

/// Applies raw updates to the store and emits domain events.
pub struct EventProcessor {
    store: Arc<EntityStore>,
    config: Arc<CacheConfig>,
    gates: Arc<GateRegistry>,
    bus: EventBus,
    requester: Option<Arc<dyn MemberRequester>>,
    stats: ProcessorStats,
}

impl EventProcessor {
    pub fn new(
        store: Arc<EntityStore>,
        config: Arc<CacheConfig>,
        gates: Arc<GateRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            config,
            gates,
            bus,
            requester: None,
            stats: ProcessorStats::default(),
        }
    }

    /// Use `requester` to ask for member chunks on guild join.
    pub fn with_member_requester(mut self, requester: Arc<dyn MemberRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Apply an update to the store. Returns the events it produced without
    /// emitting them.
    ///
    /// A failed update writes nothing for the entity it names. Unknown update
    /// kinds are ignored.
    pub fn apply(&self, raw: &RawEvent) -> Result<Outcome, CacheError> {
        let mut outcome = Outcome::default();
        if self.config.dispatch_raw {
            outcome.events.push(CacheEvent::Raw {
                name: raw.name.clone(),
                data: raw.data.clone(),
            });
        }

        let Some(kind) = DispatchKind::from_name(&raw.name) else {
            debug!(event = %raw.name, "no processor for update, ignoring");
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(outcome);
        };

        match self.handle(kind, &raw.data) {
            Ok(step) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                match step {
                    Step::Emit(event) => outcome.events.push(event),
                    Step::Defer(gate, event) => {
                        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                        outcome.deferred = Some(Deferred { gate, event });
                    }
                    Step::Silent => {}
                }
                Ok(outcome)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event = %kind, error = %e, "dropping update");
                Err(e)
            }
        }
    }

    /// Apply an update and emit its events, waiting for the guild's gate if
    /// the event was deferred.
    pub async fn process(&self, raw: &RawEvent) -> Result<(), CacheError> {
        let outcome = self.apply(raw)?;
        for event in outcome.events {
            self.bus.emit(event);
        }
        if let Some(deferred) = outcome.deferred
            && let Some(event) = deferred.wait().await
        {
            self.bus.emit(event);
        }
        Ok(())
    }

    /// Apply updates from `rx` in delivery order until the channel closes or
    /// shutdown is signalled.
    ///
    /// Deferred events are emitted as soon as their gate opens, ahead of the
    /// next queued update. Failed updates are logged and skipped.
    pub async fn run(&self, mut rx: mpsc::Receiver<RawEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut pending: FuturesUnordered<BoxFuture<'static, Option<CacheEvent>>> =
            FuturesUnordered::new();
        info!("event processor started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("event processor shutting down");
                        break;
                    }
                }

                Some(resolved) = pending.next(), if !pending.is_empty() => {
                    if let Some(event) = resolved {
                        self.bus.emit(event);
                    }
                }

                raw = rx.recv() => {
                    let Some(raw) = raw else {
                        debug!("update channel closed");
                        break;
                    };
                    // Errors are already logged and counted.
                    if let Ok(outcome) = self.apply(&raw) {
                        for event in outcome.events {
                            self.bus.emit(event);
                        }
                        if let Some(deferred) = outcome.deferred {
                            pending.push(deferred.wait().boxed());
                        }
                    }
                }
            }
        }

        // Flush deferred events whose gates have already opened.
        while let Some(Some(resolved)) = pending.next().now_or_never() {
            if let Some(event) = resolved {
                self.bus.emit(event);
            }
        }
        if !pending.is_empty() {
            debug!(count = pending.len(), "dropping deferred events for guilds that never became ready");
        }
    }

    fn decomposer(&self) -> Decomposer<'_> {
        Decomposer::new(&self.store, &self.config)
    }

    fn handle(&self, kind: DispatchKind, data: &Value) -> Result<Step, CacheError> {
        trace!(event = %kind, "processing update");
        match kind {
            DispatchKind::GuildCreate => self.guild_create(data),
            DispatchKind::GuildUpdate => {
                let put = self.decomposer().place(EntityKind::Guild, data.clone())?;
                Ok(Step::Emit(CacheEvent::GuildUpdate {
                    before: put.before.into(),
                    after: put.after,
                }))
            }
            DispatchKind::GuildDelete => self.guild_delete(data),
            DispatchKind::GuildBanAdd | DispatchKind::GuildBanRemove => self.ban(kind, data),
            DispatchKind::GuildEmojisUpdate => self.emojis_update(data),
            DispatchKind::GuildStickersUpdate => self.stickers_update(data),
            DispatchKind::WebhooksUpdate => {
                let fields = object(kind, data)?;
                Ok(Step::Emit(CacheEvent::WebhooksUpdate {
                    guild_id: required_id(kind, fields, "guild_id")?,
                    channel_id: required_id(kind, fields, "channel_id")?,
                }))
            }
            DispatchKind::IntegrationCreate => {
                let put = self.decomposer().place(EntityKind::Integration, data.clone())?;
                Ok(Step::Emit(CacheEvent::IntegrationCreate {
                    integration: put.after,
                }))
            }
            DispatchKind::IntegrationUpdate => {
                let put = self.decomposer().place(EntityKind::Integration, data.clone())?;
                Ok(Step::Emit(CacheEvent::IntegrationUpdate {
                    before: put.before.into(),
                    after: put.after,
                }))
            }
            DispatchKind::IntegrationDelete => {
                let fields = object(kind, data)?;
                let id = required_id(kind, fields, "id")?;
                let guild_id = required_id(kind, fields, "guild_id")?;
                let application_id = fields.get("application_id").and_then(Snowflake::from_value);
                let last_known = self
                    .store
                    .delete(EntityKind::Integration, EntityKey::Global(id));
                Ok(Step::Emit(CacheEvent::IntegrationDelete {
                    guild_id,
                    id,
                    application_id,
                    last_known: last_known.into(),
                }))
            }
            DispatchKind::GuildMembersChunk => self.members_chunk(data),
            DispatchKind::GuildMemberAdd => self.upsert(EntityKind::Member, true, data.clone()),
            DispatchKind::GuildMemberUpdate => self.upsert(EntityKind::Member, false, data.clone()),
            DispatchKind::GuildMemberRemove => {
                let fields = object(kind, data)?;
                let guild_id = required_id(kind, fields, "guild_id")?;
                let id = EntityKind::Member.identify(fields)?;
                self.unlink(guild_id, "member_ids", id);
                Ok(self.removed(EntityKind::Member, EntityKey::Scoped { guild_id, id }))
            }
            DispatchKind::GuildRoleCreate | DispatchKind::GuildRoleUpdate => {
                let fields = object(kind, data)?;
                let guild_id = required_id(kind, fields, "guild_id")?;
                let role = fields
                    .get("role")
                    .cloned()
                    .ok_or_else(|| malformed(kind, "missing role"))?;
                let put = self
                    .decomposer()
                    .place_in_guild(EntityKind::Role, guild_id, role)?;
                self.link(guild_id, "role_ids", put.after.id());
                Ok(Step::Emit(change_event(
                    EntityKind::Role,
                    kind == DispatchKind::GuildRoleCreate,
                    put.before,
                    put.after,
                )))
            }
            DispatchKind::GuildRoleDelete => {
                let fields = object(kind, data)?;
                let guild_id = required_id(kind, fields, "guild_id")?;
                let id = required_id(kind, fields, "role_id")?;
                self.unlink(guild_id, "role_ids", id);
                Ok(self.removed(EntityKind::Role, EntityKey::Scoped { guild_id, id }))
            }
            DispatchKind::ChannelCreate => self.upsert(EntityKind::Channel, true, data.clone()),
            DispatchKind::ChannelUpdate => self.upsert(EntityKind::Channel, false, data.clone()),
            DispatchKind::ThreadCreate => self.upsert(EntityKind::Thread, true, data.clone()),
            DispatchKind::ThreadUpdate => self.upsert(EntityKind::Thread, false, data.clone()),
            DispatchKind::ChannelDelete | DispatchKind::ThreadDelete => {
                let entity = if kind == DispatchKind::ChannelDelete {
                    EntityKind::Channel
                } else {
                    EntityKind::Thread
                };
                let fields = object(kind, data)?;
                let id = required_id(kind, fields, "id")?;
                if let Some(guild_id) = fields.get("guild_id").and_then(Snowflake::from_value)
                    && let Some(field) = relation_field(entity)
                {
                    self.unlink(guild_id, field, id);
                }
                Ok(self.removed(entity, EntityKey::Global(id)))
            }
            DispatchKind::MessageCreate => self.upsert(EntityKind::Message, true, data.clone()),
            DispatchKind::MessageUpdate => self.upsert(EntityKind::Message, false, data.clone()),
            DispatchKind::MessageDelete => {
                let fields = object(kind, data)?;
                let id = required_id(kind, fields, "id")?;
                Ok(self.removed(EntityKind::Message, EntityKey::Global(id)))
            }
            DispatchKind::AutoModRuleCreate => {
                self.upsert(EntityKind::AutoModRule, true, data.clone())
            }
            DispatchKind::AutoModRuleUpdate => {
                self.upsert(EntityKind::AutoModRule, false, data.clone())
            }
            DispatchKind::AutoModRuleDelete => {
                let fields = object(kind, data)?;
                let id = required_id(kind, fields, "id")?;
                Ok(self.removed(EntityKind::AutoModRule, EntityKey::Global(id)))
            }
            DispatchKind::VoiceStateUpdate => self.voice_state(data),
        }
    }

    fn guild_create(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::GuildCreate;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "id")?;

        // An outage at connect time: the guild is joined but its members
        // cannot be chunked until a later create marks it available.
        if fields.get("unavailable").and_then(Value::as_bool) == Some(true) {
            let guild = self
                .decomposer()
                .place(EntityKind::Guild, data.clone())?
                .after;
            let gate = self.gates.get_or_create(guild_id);
            if !self.config.fetch_members {
                gate.signal();
            }
            debug!(guild_id = %guild_id, "guild created as unavailable");
            return Ok(Step::Emit(CacheEvent::GuildJoin { guild }));
        }

        let was_unavailable = self
            .store
            .get(EntityKind::Guild, guild_id)
            .and_then(|guild| guild.get_bool("unavailable"))
            == Some(true);

        let mut payload = fields.clone();
        payload.insert("unavailable".to_string(), Value::Bool(false));
        let guild = self
            .decomposer()
            .place(EntityKind::Guild, Value::Object(payload))?
            .after;

        let expected_members = guild.get_u64("member_count");
        let event = if was_unavailable {
            CacheEvent::GuildAvailable { guild }
        } else {
            CacheEvent::GuildJoin { guild }
        };

        let gate = self.gates.get_or_create(guild_id);
        if !self.config.fetch_members {
            gate.signal();
            return Ok(Step::Emit(event));
        }
        if gate.is_ready() {
            return Ok(Step::Emit(event));
        }

        let cached_members = self.store.scoped_ids(EntityKind::Member, guild_id).len() as u64;
        if expected_members.is_some_and(|expected| cached_members >= expected) {
            gate.signal();
            return Ok(Step::Emit(event));
        }

        match &self.requester {
            Some(requester) => requester.request_members(guild_id),
            None => debug!(guild_id = %guild_id, "no member requester, waiting for chunks"),
        }
        debug!(
            guild_id = %guild_id,
            cached = cached_members,
            expected = ?expected_members,
            "deferring guild join until members are chunked"
        );
        Ok(Step::Defer(gate, event))
    }

    fn guild_delete(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::GuildDelete;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "id")?;

        if fields.get("unavailable").and_then(Value::as_bool) == Some(true) {
            let last_known = self.store.get(EntityKind::Guild, guild_id);
            if last_known.is_some() {
                let mut mark = Map::new();
                mark.insert("unavailable".to_string(), Value::Bool(true));
                self.store
                    .put(EntityKind::Guild, EntityKey::Global(guild_id), mark)?;
            }
            debug!(guild_id = %guild_id, "guild unavailable");
            return Ok(Step::Emit(CacheEvent::GuildUnavailable {
                id: guild_id,
                last_known: last_known.into(),
            }));
        }

        if let Some(guild) = self.store.get(EntityKind::Guild, guild_id) {
            for (entity, field) in [
                (EntityKind::Channel, "channel_ids"),
                (EntityKind::Thread, "thread_ids"),
                (EntityKind::Sticker, "sticker_ids"),
            ] {
                for id in guild.relation_ids(field) {
                    self.store.delete(entity, EntityKey::Global(id));
                }
            }
        }
        for entity in [EntityKind::Sticker, EntityKind::Integration, EntityKind::AutoModRule] {
            self.store.delete_by_guild(entity, guild_id);
        }
        let last_known = self.store.delete_guild(guild_id);
        self.gates.remove(guild_id);
        info!(guild_id = %guild_id, "left guild");

        Ok(Step::Emit(CacheEvent::GuildLeft {
            id: guild_id,
            last_known: last_known.into(),
        }))
    }

    fn ban(&self, kind: DispatchKind, data: &Value) -> Result<Step, CacheError> {
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "guild_id")?;
        let user = fields
            .get("user")
            .cloned()
            .ok_or_else(|| malformed(kind, "missing user"))?;
        let user = self.decomposer().place(EntityKind::User, user)?.after;

        Ok(Step::Emit(match kind {
            DispatchKind::GuildBanAdd => CacheEvent::BanCreate { guild_id, user },
            _ => CacheEvent::BanRemove { guild_id, user },
        }))
    }

    fn emojis_update(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::GuildEmojisUpdate;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "guild_id")?;
        let emojis = entity_list(kind, fields, "emojis", EntityKind::Emoji)?;

        let before: Vec<Arc<Record>> = self
            .store
            .scoped_ids(EntityKind::Emoji, guild_id)
            .into_iter()
            .filter_map(|id| self.store.get_guild_scoped(EntityKind::Emoji, guild_id, id))
            .collect();

        let decomposer = self.decomposer();
        let after = emojis
            .iter()
            .map(|emoji| {
                decomposer
                    .place_in_guild(EntityKind::Emoji, guild_id, emoji.clone())
                    .map(|put| put.after)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let current: HashSet<Snowflake> = after.iter().map(|emoji| emoji.id()).collect();
        for stale in before.iter().filter(|emoji| !current.contains(&emoji.id())) {
            self.store.delete(
                EntityKind::Emoji,
                EntityKey::Scoped {
                    guild_id,
                    id: stale.id(),
                },
            );
        }
        self.set_relation(guild_id, "emoji_ids", after.iter().map(|emoji| emoji.id()));

        Ok(Step::Emit(CacheEvent::GuildEmojisUpdate {
            guild_id,
            before,
            after,
        }))
    }

    fn stickers_update(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::GuildStickersUpdate;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "guild_id")?;
        let stickers = entity_list(kind, fields, "stickers", EntityKind::Sticker)?;

        let before: Vec<Arc<Record>> = self
            .store
            .get(EntityKind::Guild, guild_id)
            .map(|guild| guild.relation_ids("sticker_ids"))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.store.get(EntityKind::Sticker, id))
            .collect();

        let decomposer = self.decomposer();
        let after = stickers
            .iter()
            .map(|sticker| {
                decomposer
                    .place_in_guild(EntityKind::Sticker, guild_id, sticker.clone())
                    .map(|put| put.after)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let current: HashSet<Snowflake> = after.iter().map(|sticker| sticker.id()).collect();
        for stale in before.iter().filter(|sticker| !current.contains(&sticker.id())) {
            self.store
                .delete(EntityKind::Sticker, EntityKey::Global(stale.id()));
        }
        self.set_relation(guild_id, "sticker_ids", after.iter().map(|sticker| sticker.id()));

        Ok(Step::Emit(CacheEvent::GuildStickersUpdate {
            guild_id,
            before,
            after,
        }))
    }

    fn members_chunk(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::GuildMembersChunk;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "guild_id")?;
        let members = entity_list(kind, fields, "members", EntityKind::Member)?;

        let index = fields.get("chunk_index").and_then(Value::as_u64).unwrap_or(0);
        let count = fields.get("chunk_count").and_then(Value::as_u64).unwrap_or(1);
        if index >= count {
            return Err(malformed(
                kind,
                format!("chunk_index {index} out of range for chunk_count {count}"),
            ));
        }

        let decomposer = self.decomposer();
        for member in members {
            decomposer.place_in_guild(EntityKind::Member, guild_id, member.clone())?;
        }
        trace!(
            guild_id = %guild_id,
            chunk = index + 1,
            of = count,
            members = members.len(),
            "member chunk stored"
        );

        if index + 1 < count {
            return Ok(Step::Silent);
        }
        self.gates.signal(guild_id);
        debug!(guild_id = %guild_id, "member chunking complete");
        Ok(Step::Emit(CacheEvent::GuildReady { id: guild_id }))
    }

    fn voice_state(&self, data: &Value) -> Result<Step, CacheError> {
        let kind = DispatchKind::VoiceStateUpdate;
        let fields = object(kind, data)?;
        let guild_id = required_id(kind, fields, "guild_id")?;
        let id = EntityKind::VoiceState.identify(fields)?;

        if fields.get("channel_id").is_none_or(Value::is_null) {
            return Ok(self.removed(EntityKind::VoiceState, EntityKey::Scoped { guild_id, id }));
        }

        let put = self
            .decomposer()
            .place_in_guild(EntityKind::VoiceState, guild_id, data.clone())?;
        let created = put.before.is_none();
        Ok(Step::Emit(change_event(
            EntityKind::VoiceState,
            created,
            put.before,
            put.after,
        )))
    }

    /// Create/update handler shared by the plain entity kinds.
    fn upsert(&self, entity: EntityKind, created: bool, data: Value) -> Result<Step, CacheError> {
        let put = self.decomposer().place(entity, data)?;
        if created
            && let Some(field) = relation_field(entity)
            && let Some(guild_id) = put.after.relation_id("guild_id")
        {
            self.link(guild_id, field, put.after.id());
        }
        Ok(Step::Emit(change_event(entity, created, put.before, put.after)))
    }

    fn removed(&self, entity: EntityKind, key: EntityKey) -> Step {
        let last_known = self.store.delete(entity, key);
        Step::Emit(CacheEvent::Deleted {
            kind: entity,
            id: key.id(),
            last_known: last_known.into(),
        })
    }

    /// Replace a guild's id list, if the guild is cached.
    fn set_relation(&self, guild_id: Snowflake, field: &str, ids: impl Iterator<Item = Snowflake>) {
        if self.store.get(EntityKind::Guild, guild_id).is_none() {
            return;
        }
        let mut update = Map::new();
        update.insert(
            field.to_string(),
            Value::Array(ids.map(Snowflake::to_value).collect()),
        );
        if let Err(e) = self
            .store
            .put(EntityKind::Guild, EntityKey::Global(guild_id), update)
        {
            warn!(guild_id = %guild_id, field, error = %e, "failed to update guild relation");
        }
    }

    fn link(&self, guild_id: Snowflake, field: &str, id: Snowflake) {
        let Some(guild) = self.store.get(EntityKind::Guild, guild_id) else {
            return;
        };
        let mut ids = guild.relation_ids(field);
        if !ids.contains(&id) {
            ids.push(id);
            self.set_relation(guild_id, field, ids.into_iter());
        }
    }

    fn unlink(&self, guild_id: Snowflake, field: &str, id: Snowflake) {
        let Some(guild) = self.store.get(EntityKind::Guild, guild_id) else {
            return;
        };
        let ids = guild.relation_ids(field);
        if ids.contains(&id) {
            self.set_relation(guild_id, field, ids.into_iter().filter(|other| *other != id));
        }
    }
}

fn change_event(
    kind: EntityKind,
    created: bool,
    before: Option<Arc<Record>>,
    after: Arc<Record>,
) -> CacheEvent {
    if created {
        CacheEvent::Created { kind, record: after }
    } else {
        CacheEvent::Updated {
            kind,
            before: Snapshot::from(before),
            after,
        }
    }
}

/// The guild field listing ids of `kind`, for kinds a guild keeps a list of.
fn relation_field(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Channel => Some("channel_ids"),
        EntityKind::Thread => Some("thread_ids"),
        EntityKind::Member => Some("member_ids"),
        EntityKind::Role => Some("role_ids"),
        EntityKind::Emoji => Some("emoji_ids"),
        EntityKind::VoiceState => Some("voice_state_ids"),
        EntityKind::Sticker => Some("sticker_ids"),
        _ => None,
    }
}

fn malformed(kind: DispatchKind, reason: impl Into<String>) -> CacheError {
    CacheError::Malformed {
        event: kind.as_str().to_string(),
        reason: reason.into(),
    }
}

fn object(kind: DispatchKind, data: &Value) -> Result<&Map<String, Value>, CacheError> {
    data.as_object()
        .ok_or_else(|| malformed(kind, "payload is not an object"))
}

fn required_id(
    kind: DispatchKind,
    fields: &Map<String, Value>,
    field: &str,
) -> Result<Snowflake, CacheError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(malformed(kind, format!("missing {field}"))),
        Some(value) => Snowflake::try_from_value(value),
    }
}

/// A list of entity payloads, each checked for an identity before any of
/// them is stored.
fn entity_list<'a>(
    kind: DispatchKind,
    fields: &'a Map<String, Value>,
    field: &str,
    entity: EntityKind,
) -> Result<&'a [Value], CacheError> {
    let items = fields
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(kind, format!("missing {field}")))?;
    for item in items {
        let item = item
            .as_object()
            .ok_or(CacheError::NotAnObject { kind: entity })?;
        entity.identify(item)?;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn processor(config: CacheConfig) -> EventProcessor {
        let config = Arc::new(config);
        EventProcessor::new(
            Arc::new(EntityStore::new()),
            Arc::clone(&config),
            Arc::new(GateRegistry::new()),
            EventBus::new(config.event_capacity),
        )
    }

    fn raw(name: &str, data: Value) -> RawEvent {
        RawEvent::new(name, data)
    }

    fn single(outcome: Outcome) -> CacheEvent {
        assert!(outcome.deferred.is_none());
        let mut events = outcome.events;
        assert_eq!(events.len(), 1);
        events.remove(0)
    }

    #[test]
    fn test_dispatch_names_roundtrip() {
        for kind in DispatchKind::ALL {
            assert_eq!(DispatchKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DispatchKind::from_name("TYPING_START"), None);
    }

    #[test]
    fn test_raw_event_wire_names() {
        let raw: RawEvent =
            serde_json::from_str(r#"{"t": "GUILD_UPDATE", "d": {"id": "1"}}"#).unwrap();
        assert_eq!(raw.name, "GUILD_UPDATE");
        assert_eq!(raw.data, json!({"id": "1"}));
    }

    #[test]
    fn test_guild_update_before_after() {
        let p = processor(CacheConfig::default());
        p.apply(&raw("GUILD_CREATE", json!({"id": "42", "name": "Old"})))
            .unwrap();

        let event = single(
            p.apply(&raw("GUILD_UPDATE", json!({"id": "42", "name": "New"})))
                .unwrap(),
        );
        match event {
            CacheEvent::GuildUpdate { before, after } => {
                let before = before.record().cloned().unwrap();
                assert_eq!(before.get_str("name"), Some("Old"));
                assert_eq!(after.get_str("name"), Some("New"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_guild_update_for_unknown_guild_has_absent_before() {
        let p = processor(CacheConfig::default());
        let event = single(p.apply(&raw("GUILD_UPDATE", json!({"id": "7"}))).unwrap());
        assert!(matches!(
            event,
            CacheEvent::GuildUpdate {
                before: Snapshot::Absent,
                ..
            }
        ));
    }

    #[test]
    fn test_create_emits_join_only() {
        let p = processor(CacheConfig::default());
        let event = single(p.apply(&raw("GUILD_CREATE", json!({"id": "42"}))).unwrap());
        assert!(matches!(event, CacheEvent::GuildJoin { .. }));
        assert!(p.gates.get(Snowflake::new(42)).unwrap().is_ready());
    }

    #[test]
    fn test_unavailable_create_still_joins() {
        let p = processor(CacheConfig::default());
        let event = single(
            p.apply(&raw("GUILD_CREATE", json!({"id": "5", "unavailable": true})))
                .unwrap(),
        );
        match event {
            CacheEvent::GuildJoin { guild } => {
                assert_eq!(guild.id(), 5u64);
                assert_eq!(guild.get_bool("unavailable"), Some(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(p.gates.get(Snowflake::new(5)).unwrap().is_ready());

        // The outage ends.
        let event = single(p.apply(&raw("GUILD_CREATE", json!({"id": "5", "name": "back"}))).unwrap());
        assert!(matches!(event, CacheEvent::GuildAvailable { .. }));
    }

    #[test]
    fn test_unavailable_create_with_fetch_members_waits_for_chunks() {
        let p = processor(CacheConfig::builder().fetch_members(true).build());
        let event = single(
            p.apply(&raw("GUILD_CREATE", json!({"id": "5", "unavailable": true})))
                .unwrap(),
        );
        assert!(matches!(event, CacheEvent::GuildJoin { .. }));
        let gate = p.gates.get(Snowflake::new(5)).expect("gate created");
        assert!(!gate.is_ready());

        let outcome = p
            .apply(&raw("GUILD_CREATE", json!({"id": "5", "member_count": 1})))
            .unwrap();
        assert!(outcome.deferred.is_some());
        p.apply(&raw(
            "GUILD_MEMBERS_CHUNK",
            json!({"guild_id": "5", "chunk_index": 0, "chunk_count": 1, "members": [{"user": {"id": "9"}}]}),
        ))
        .unwrap();
        assert!(gate.is_ready());
    }

    #[test]
    fn test_chunk_index_out_of_range_is_rejected() {
        let p = processor(CacheConfig::default());
        for (index, count) in [(u64::MAX, 1), (u64::MAX, u64::MAX), (3, 3), (0, 0)] {
            let result = p.apply(&raw(
                "GUILD_MEMBERS_CHUNK",
                json!({
                    "guild_id": "1",
                    "chunk_index": index,
                    "chunk_count": count,
                    "members": [{"user": {"id": "5"}}],
                }),
            ));
            assert!(
                matches!(result, Err(CacheError::Malformed { .. })),
                "chunk {index}/{count} accepted"
            );
        }
        assert_eq!(p.store.count(EntityKind::Member), 0);
        assert_eq!(p.stats().failed, 4);
    }

    #[test]
    fn test_guild_left_evicts_guild_owned_globals() {
        let p = processor(CacheConfig::default());
        p.apply(&raw(
            "GUILD_CREATE",
            json!({"id": "1", "stickers": [{"id": "30", "name": "s"}], "channels": [{"id": "40"}]}),
        ))
        .unwrap();
        p.apply(&raw(
            "INTEGRATION_CREATE",
            json!({"id": "50", "guild_id": "1", "name": "bot"}),
        ))
        .unwrap();
        p.apply(&raw(
            "AUTO_MODERATION_RULE_CREATE",
            json!({"id": "60", "guild_id": "1", "name": "no spam"}),
        ))
        .unwrap();
        // Another guild's records stay.
        p.apply(&raw(
            "INTEGRATION_CREATE",
            json!({"id": "51", "guild_id": "2", "name": "other"}),
        ))
        .unwrap();

        let event = single(p.apply(&raw("GUILD_DELETE", json!({"id": "1"}))).unwrap());
        assert!(matches!(event, CacheEvent::GuildLeft { .. }));

        let stats = p.store.stats();
        assert_eq!(stats.stickers, 0);
        assert_eq!(stats.channels, 0);
        assert_eq!(stats.auto_mod_rules, 0);
        assert_eq!(stats.integrations, 1);
        assert!(p.store.get(EntityKind::Integration, Snowflake::new(51)).is_some());
    }

    #[test]
    fn test_unavailable_then_removed() {
        let p = processor(CacheConfig::default());
        p.apply(&raw(
            "GUILD_CREATE",
            json!({"id": "1", "name": "g", "roles": [{"id": "2"}], "channels": [{"id": "3"}]}),
        ))
        .unwrap();

        let event = single(
            p.apply(&raw("GUILD_DELETE", json!({"id": "1", "unavailable": true})))
                .unwrap(),
        );
        match event {
            CacheEvent::GuildUnavailable { id, last_known } => {
                assert_eq!(id, 1u64);
                assert!(!last_known.is_absent());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let guild = p.store.get(EntityKind::Guild, Snowflake::new(1)).unwrap();
        assert_eq!(guild.get_bool("unavailable"), Some(true));

        // Becoming available again is not a fresh join.
        let event = single(p.apply(&raw("GUILD_CREATE", json!({"id": "1"}))).unwrap());
        assert!(matches!(event, CacheEvent::GuildAvailable { .. }));

        let event = single(p.apply(&raw("GUILD_DELETE", json!({"id": "1"}))).unwrap());
        match event {
            CacheEvent::GuildLeft { last_known, .. } => {
                assert_eq!(
                    last_known.record().unwrap().get_str("name"),
                    Some("g")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(p.store.get(EntityKind::Guild, Snowflake::new(1)).is_none());
        assert!(p.store.get(EntityKind::Channel, Snowflake::new(3)).is_none());
        assert!(
            p.store
                .get_guild_scoped(EntityKind::Role, Snowflake::new(1), Snowflake::new(2))
                .is_none()
        );
    }

    #[test]
    fn test_delete_unknown_guild_uses_sentinel() {
        let p = processor(CacheConfig::default());
        let event = single(p.apply(&raw("GUILD_DELETE", json!({"id": "5"}))).unwrap());
        assert!(matches!(
            event,
            CacheEvent::GuildLeft {
                last_known: Snapshot::Absent,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_update_is_isolated() {
        let p = processor(CacheConfig::default());
        p.apply(&raw("GUILD_CREATE", json!({"id": "1", "name": "keep"})))
            .unwrap();

        assert!(p.apply(&raw("GUILD_UPDATE", json!({"name": "no id"}))).is_err());
        assert!(p.apply(&raw("GUILD_BAN_ADD", json!({"guild_id": "1"}))).is_err());
        assert!(p.apply(&raw("GUILD_UPDATE", json!("not an object"))).is_err());

        let guild = p.store.get(EntityKind::Guild, Snowflake::new(1)).unwrap();
        assert_eq!(guild.get_str("name"), Some("keep"));
        assert_eq!(p.stats().failed, 3);
        assert_eq!(p.stats().processed, 1);
    }

    #[test]
    fn test_unknown_update_is_ignored() {
        let p = processor(CacheConfig::builder().dispatch_raw(true).build());
        let outcome = p.apply(&raw("TYPING_START", json!({}))).unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [CacheEvent::Raw { name, .. }] if name == "TYPING_START"
        ));
        assert_eq!(p.stats().ignored, 1);
    }

    #[test]
    fn test_emoji_update_replaces_set() {
        let p = processor(CacheConfig::default());
        p.apply(&raw(
            "GUILD_CREATE",
            json!({"id": "1", "emojis": [{"id": "10", "name": "a"}, {"id": "11", "name": "b"}]}),
        ))
        .unwrap();

        let event = single(
            p.apply(&raw(
                "GUILD_EMOJIS_UPDATE",
                json!({"guild_id": "1", "emojis": [{"id": "11", "name": "b2"}, {"id": "12", "name": "c"}]}),
            ))
            .unwrap(),
        );
        match event {
            CacheEvent::GuildEmojisUpdate { before, after, .. } => {
                assert_eq!(before.len(), 2);
                assert_eq!(after.len(), 2);
                assert_eq!(after[0].get_str("name"), Some("b2"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let guild_id = Snowflake::new(1);
        assert_eq!(
            p.store.scoped_ids(EntityKind::Emoji, guild_id),
            vec![Snowflake::new(11), Snowflake::new(12)]
        );
        let guild = p.store.get(EntityKind::Guild, guild_id).unwrap();
        assert_eq!(
            guild.relation_ids("emoji_ids"),
            vec![Snowflake::new(11), Snowflake::new(12)]
        );
    }

    #[test]
    fn test_emoji_update_with_bad_entry_writes_nothing() {
        let p = processor(CacheConfig::default());
        let result = p.apply(&raw(
            "GUILD_EMOJIS_UPDATE",
            json!({"guild_id": "1", "emojis": [{"id": "11"}, {"name": "no id"}]}),
        ));
        assert!(result.is_err());
        assert_eq!(p.store.count(EntityKind::Emoji), 0);
    }

    #[test]
    fn test_integration_lifecycle() {
        let p = processor(CacheConfig::default());
        p.apply(&raw(
            "INTEGRATION_CREATE",
            json!({"id": "5", "guild_id": "1", "name": "bot", "user": {"id": "9"}}),
        ))
        .unwrap();
        assert!(p.store.get(EntityKind::User, Snowflake::new(9)).is_some());

        let event = single(
            p.apply(&raw(
                "INTEGRATION_DELETE",
                json!({"id": "5", "guild_id": "1", "application_id": "77"}),
            ))
            .unwrap(),
        );
        match event {
            CacheEvent::IntegrationDelete {
                application_id,
                last_known,
                ..
            } => {
                assert_eq!(application_id, Some(Snowflake::new(77)));
                assert_eq!(last_known.record().unwrap().get_str("name"), Some("bot"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(p.store.get(EntityKind::Integration, Snowflake::new(5)).is_none());
    }

    #[test]
    fn test_channel_create_links_guild() {
        let p = processor(CacheConfig::default());
        p.apply(&raw("GUILD_CREATE", json!({"id": "1", "channels": [{"id": "2"}]})))
            .unwrap();
        p.apply(&raw("CHANNEL_CREATE", json!({"id": "3", "guild_id": "1"})))
            .unwrap();

        let guild = p.store.get(EntityKind::Guild, Snowflake::new(1)).unwrap();
        assert_eq!(
            guild.relation_ids("channel_ids"),
            vec![Snowflake::new(2), Snowflake::new(3)]
        );

        p.apply(&raw("CHANNEL_DELETE", json!({"id": "2", "guild_id": "1"})))
            .unwrap();
        let guild = p.store.get(EntityKind::Guild, Snowflake::new(1)).unwrap();
        assert_eq!(guild.relation_ids("channel_ids"), vec![Snowflake::new(3)]);
    }

    #[test]
    fn test_voice_state_leave_deletes() {
        let p = processor(CacheConfig::default());
        let event = single(
            p.apply(&raw(
                "VOICE_STATE_UPDATE",
                json!({"guild_id": "1", "user_id": "2", "channel_id": "3"}),
            ))
            .unwrap(),
        );
        assert!(matches!(
            event,
            CacheEvent::Created {
                kind: EntityKind::VoiceState,
                ..
            }
        ));

        let event = single(
            p.apply(&raw(
                "VOICE_STATE_UPDATE",
                json!({"guild_id": "1", "user_id": "2", "channel_id": null}),
            ))
            .unwrap(),
        );
        match event {
            CacheEvent::Deleted { kind, last_known, .. } => {
                assert_eq!(kind, EntityKind::VoiceState);
                assert!(!last_known.is_absent());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(p.store.count(EntityKind::VoiceState), 0);
    }

    #[test]
    fn test_message_update_merges() {
        let p = processor(CacheConfig::default());
        p.apply(&raw(
            "MESSAGE_CREATE",
            json!({"id": "1", "channel_id": "2", "content": "hi", "pinned": false}),
        ))
        .unwrap();

        let event = single(
            p.apply(&raw(
                "MESSAGE_UPDATE",
                json!({"id": "1", "channel_id": "2", "content": "edited"}),
            ))
            .unwrap(),
        );
        match event {
            CacheEvent::Updated { before, after, .. } => {
                assert_eq!(before.record().unwrap().get_str("content"), Some("hi"));
                assert_eq!(after.get_str("content"), Some("edited"));
                assert_eq!(after.get_bool("pinned"), Some(false));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_fetch_members_defers_join() {
        let p = processor(CacheConfig::builder().fetch_members(true).build());
        let outcome = p
            .apply(&raw("GUILD_CREATE", json!({"id": "1", "member_count": 2})))
            .unwrap();
        let deferred = outcome.deferred.expect("join should be deferred");
        assert!(outcome.events.is_empty());
        assert!(!deferred.gate.is_ready());

        let event = single(
            p.apply(&raw(
                "GUILD_MEMBERS_CHUNK",
                json!({
                    "guild_id": "1",
                    "chunk_index": 0,
                    "chunk_count": 1,
                    "members": [{"user": {"id": "5"}}, {"user": {"id": "6"}}],
                }),
            ))
            .unwrap(),
        );
        assert!(matches!(event, CacheEvent::GuildReady { .. }));
        assert!(deferred.gate.is_ready());
        assert_eq!(p.stats().deferred, 1);
    }

    #[test]
    fn test_fetch_members_with_full_member_list_emits_now() {
        let p = processor(CacheConfig::builder().fetch_members(true).build());
        let event = single(
            p.apply(&raw(
                "GUILD_CREATE",
                json!({"id": "1", "member_count": 1, "members": [{"user": {"id": "5"}}]}),
            ))
            .unwrap(),
        );
        assert!(matches!(event, CacheEvent::GuildJoin { .. }));
    }
}
