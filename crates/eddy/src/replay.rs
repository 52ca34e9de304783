//! Replays a recorded dispatch log through the entity cache.
//!
//! The log is JSON lines, one gateway frame per line:
//!
//! ```text
//! {"t": "GUILD_CREATE", "d": {"id": "42", "name": "snakes"}}
//! {"op": 0, "t": "CHANNEL_UPDATE", "d": {"id": "100", "name": "general"}}
//! ```
//!
//! Frames without a `t` (heartbeats, hello, resumed) are skipped. Every domain
//! event the cache emits is written to the output as it happens.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eddy_cache::{CacheEvent, CacheStats, EntityCache, MemberRequester, RawEvent, Record, Snapshot, Snowflake};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read dispatch log: {0}")]
    Read(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write output: {0}")]
    Write(std::io::Error),

    #[error("processing task failed: {0}")]
    Task(#[from] JoinError),
}

/// How events and the final summary are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per event.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    pub format: OutputFormat,
    /// Fail on the first line that is not valid JSON instead of skipping it.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    /// Lines read from the log, including skipped ones.
    pub lines: usize,
    /// Dispatch frames handed to the cache.
    pub dispatched: usize,
    /// Lines that were blank, not dispatches, or not valid JSON.
    pub skipped: usize,
    /// Domain events written to the output.
    pub events: usize,
    /// Events the output fell too far behind to see.
    pub lagged: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct FeedCounts {
    lines: usize,
    dispatched: usize,
    skipped: usize,
}

/// Logs member requests. A recorded log already carries whatever chunks the
/// live session received.
pub struct LoggingRequester;

impl MemberRequester for LoggingRequester {
    fn request_members(&self, guild_id: Snowflake) {
        info!(guild_id = %guild_id, "member chunks requested");
    }
}

/// Replay the log at `path` and write events to `out`.
pub async fn replay_file<W: Write>(
    cache: &Arc<EntityCache>,
    path: &Path,
    options: ReplayOptions,
    out: &mut W,
) -> Result<ReplaySummary, ReplayError> {
    let file = File::open(path).await.map_err(|source| ReplayError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "replaying dispatch log");
    replay(cache, BufReader::new(file), options, out).await
}

/// Feed every frame from `reader` through the cache's processing loop.
pub async fn replay<R, W>(
    cache: &Arc<EntityCache>,
    reader: R,
    options: ReplayOptions,
    out: &mut W,
) -> Result<ReplaySummary, ReplayError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: Write,
{
    let mut events = cache.subscribe();
    let (tx, mut processing) = cache.start();
    let feeder = tokio::spawn(feed(reader, tx, options.strict));

    let mut written = 0;
    let mut lagged = 0;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    write_event(out, &event, options.format)?;
                    written += 1;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "output fell behind, events dropped");
                    lagged += n;
                }
                Err(RecvError::Closed) => break,
            },
            finished = &mut processing => {
                finished?;
                break;
            }
        }
    }

    // Events emitted between the last receive and the loop finishing.
    loop {
        match events.try_recv() {
            Ok(event) => {
                write_event(out, &event, options.format)?;
                written += 1;
            }
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(n)) => lagged += n,
            Err(_) => break,
        }
    }

    let counts = feeder.await??;
    let summary = ReplaySummary {
        lines: counts.lines,
        dispatched: counts.dispatched,
        skipped: counts.skipped,
        events: written,
        lagged,
        cache: cache.stats(),
    };
    info!(
        dispatched = summary.dispatched,
        events = summary.events,
        failed = summary.cache.processor.failed,
        "replay finished"
    );
    Ok(summary)
}

async fn feed<R>(
    reader: R,
    tx: mpsc::Sender<RawEvent>,
    strict: bool,
) -> Result<FeedCounts, ReplayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut counts = FeedCounts::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        counts.lines += 1;
        let raw = match parse_line(&line) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counts.skipped += 1;
                continue;
            }
            Err(source) if strict => {
                return Err(ReplayError::Parse {
                    line: counts.lines,
                    source,
                });
            }
            Err(e) => {
                warn!(line = counts.lines, error = %e, "skipping unparseable line");
                counts.skipped += 1;
                continue;
            }
        };

        if tx.send(raw).await.is_err() {
            debug!(line = counts.lines, "processing loop stopped, ending replay early");
            break;
        }
        counts.dispatched += 1;
    }

    Ok(counts)
}

/// Parse one log line. Blank lines and frames that are not dispatches yield
/// `None`.
pub fn parse_line(line: &str) -> Result<Option<RawEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let frame: Value = serde_json::from_str(line)?;
    if frame.get("t").is_none_or(Value::is_null) {
        return Ok(None);
    }
    serde_json::from_value(frame).map(Some)
}

fn write_event<W: Write>(out: &mut W, event: &CacheEvent, format: OutputFormat) -> Result<(), ReplayError> {
    let written = match format {
        OutputFormat::Text => writeln!(out, "{}", describe(event)),
        OutputFormat::Json => writeln!(out, "{}", event_json(event)),
    };
    written.map_err(ReplayError::Write)
}

/// Write the end-of-replay summary.
pub fn write_summary<W: Write>(
    out: &mut W,
    summary: &ReplaySummary,
    format: OutputFormat,
) -> Result<(), ReplayError> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::to_string(summary).map_err(|e| ReplayError::Write(e.into()))?;
            writeln!(out, "{line}").map_err(ReplayError::Write)
        }
        OutputFormat::Text => {
            let processor = &summary.cache.processor;
            let store = &summary.cache.store;
            writeln!(
                out,
                "replayed {} dispatches ({} lines, {} skipped), {} events",
                summary.dispatched, summary.lines, summary.skipped, summary.events
            )
            .and_then(|()| {
                writeln!(
                    out,
                    "processed {}, failed {}, deferred {}, ignored {}",
                    processor.processed, processor.failed, processor.deferred, processor.ignored
                )
            })
            .and_then(|()| {
                writeln!(
                    out,
                    "cached {} guilds, {} channels, {} threads, {} users, {} members, {} roles, {} messages",
                    store.guilds,
                    store.channels,
                    store.threads,
                    store.users,
                    store.members,
                    store.roles,
                    store.messages
                )
            })
            .map_err(ReplayError::Write)
        }
    }
}

fn label(record: &Record) -> String {
    match record.get_str("name").or_else(|| record.get_str("username")) {
        Some(name) => format!("{} {} ({name})", record.kind(), record.key()),
        None => format!("{} {}", record.kind(), record.key()),
    }
}

fn snapshot_label(snapshot: &Snapshot) -> String {
    snapshot.record().map_or_else(|| "-".to_string(), |record| label(record))
}

/// One-line description of an event.
pub fn describe(event: &CacheEvent) -> String {
    let name = event.name();
    match event {
        CacheEvent::GuildJoin { guild } | CacheEvent::GuildAvailable { guild } => {
            format!("{name} {}", label(guild))
        }
        CacheEvent::GuildUpdate { before, after }
        | CacheEvent::IntegrationUpdate { before, after }
        | CacheEvent::Updated { before, after, .. } => {
            format!("{name} {} (was {})", label(after), snapshot_label(before))
        }
        CacheEvent::GuildLeft { id, last_known } | CacheEvent::GuildUnavailable { id, last_known } => {
            format!("{name} guild {id} (last known {})", snapshot_label(last_known))
        }
        CacheEvent::GuildReady { id } => format!("{name} guild {id}"),
        CacheEvent::BanCreate { guild_id, user } | CacheEvent::BanRemove { guild_id, user } => {
            format!("{name} guild {guild_id} {}", label(user))
        }
        CacheEvent::GuildEmojisUpdate { guild_id, before, after }
        | CacheEvent::GuildStickersUpdate { guild_id, before, after } => {
            format!("{name} guild {guild_id} {} -> {}", before.len(), after.len())
        }
        CacheEvent::WebhooksUpdate { guild_id, channel_id } => {
            format!("{name} guild {guild_id} channel {channel_id}")
        }
        CacheEvent::IntegrationCreate { integration } => format!("{name} {}", label(integration)),
        CacheEvent::IntegrationDelete { guild_id, id, .. } => {
            format!("{name} guild {guild_id} integration {id}")
        }
        CacheEvent::Created { record, .. } => format!("{name} {}", label(record)),
        CacheEvent::Deleted { kind, id, last_known } => {
            format!("{name} {kind} {id} (last known {})", snapshot_label(last_known))
        }
        CacheEvent::Raw { name: update, .. } => format!("{name} {update}"),
    }
}

fn snapshot_json(snapshot: &Snapshot) -> Value {
    snapshot.record().map_or(Value::Null, |record| record.to_value())
}

fn records_json(records: &[Arc<Record>]) -> Value {
    Value::Array(records.iter().map(|record| record.to_value()).collect())
}

/// JSON rendering of an event, tagged with its name.
pub fn event_json(event: &CacheEvent) -> Value {
    let body = match event {
        CacheEvent::GuildJoin { guild } | CacheEvent::GuildAvailable { guild } => {
            json!({"guild": guild.to_value()})
        }
        CacheEvent::GuildUpdate { before, after } | CacheEvent::IntegrationUpdate { before, after } => {
            json!({"before": snapshot_json(before), "after": after.to_value()})
        }
        CacheEvent::GuildLeft { id, last_known } | CacheEvent::GuildUnavailable { id, last_known } => {
            json!({"id": id, "last_known": snapshot_json(last_known)})
        }
        CacheEvent::GuildReady { id } => json!({"id": id}),
        CacheEvent::BanCreate { guild_id, user } | CacheEvent::BanRemove { guild_id, user } => {
            json!({"guild_id": guild_id, "user": user.to_value()})
        }
        CacheEvent::GuildEmojisUpdate { guild_id, before, after }
        | CacheEvent::GuildStickersUpdate { guild_id, before, after } => {
            json!({"guild_id": guild_id, "before": records_json(before), "after": records_json(after)})
        }
        CacheEvent::WebhooksUpdate { guild_id, channel_id } => {
            json!({"guild_id": guild_id, "channel_id": channel_id})
        }
        CacheEvent::IntegrationCreate { integration } => json!({"integration": integration.to_value()}),
        CacheEvent::IntegrationDelete {
            guild_id,
            id,
            application_id,
            last_known,
        } => json!({
            "guild_id": guild_id,
            "id": id,
            "application_id": application_id,
            "last_known": snapshot_json(last_known),
        }),
        CacheEvent::Created { kind, record } => json!({"kind": kind.as_str(), "record": record.to_value()}),
        CacheEvent::Updated { kind, before, after } => json!({
            "kind": kind.as_str(),
            "before": snapshot_json(before),
            "after": after.to_value(),
        }),
        CacheEvent::Deleted { kind, id, last_known } => json!({
            "kind": kind.as_str(),
            "id": id,
            "last_known": snapshot_json(last_known),
        }),
        CacheEvent::Raw { name, data } => json!({"name": name, "data": data}),
    };
    json!({"event": event.name(), "data": body})
}
