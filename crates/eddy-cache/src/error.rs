//! Error types for the entity cache.

use thiserror::Error;

use crate::{EntityKind, Snowflake};

/// Errors raised while ingesting an update into the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A payload lacked the identifier its kind is keyed by.
    #[error("{kind} payload is missing its identifier")]
    MissingId { kind: EntityKind },

    /// An identifier could not be parsed as a snowflake.
    #[error("invalid snowflake: {0}")]
    InvalidId(String),

    /// A guild-scoped payload arrived without a guild id.
    #[error("{kind} payload has no guild id to scope it by")]
    MissingGuild { kind: EntityKind },

    /// The store keeps no records of this kind in the requested form.
    #[error("{kind} records cannot be stored")]
    UnstorableKind { kind: EntityKind },

    /// The payload for an entity was not a JSON object.
    #[error("{kind} payload is not a JSON object")]
    NotAnObject { kind: EntityKind },

    /// The update kind has no processor.
    #[error("unknown update kind: {0}")]
    UnknownEvent(String),

    /// The update payload was structurally wrong for its kind.
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },

    /// A record could not be converted into its typed model.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fetching from the origin failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Errors surfaced by the asynchronous proxy accessors.
///
/// A failed fetch is never remembered: the next fetch for the same id goes
/// back to the origin.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The origin has no entity with this id.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Snowflake },

    /// The origin layer failed (transport, rate limit, server error).
    #[error("origin error: {0}")]
    Origin(String),

    /// The origin returned a payload that could not be stored.
    #[error("failed to store fetched {kind}: {reason}")]
    Decompose { kind: EntityKind, reason: String },
}
