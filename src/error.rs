//! Error types for the room core
//!
//! Defines application-level errors, persistence errors, configuration
//! errors and client queue errors. Uses thiserror for ergonomic error
//! definitions.

use thiserror::Error;

use crate::types::{MovieId, RoomId};

/// Application-level errors
///
/// Covers lookups that miss, rejected input, state conflicts, errors
/// propagated from the database, and fatal transport/hash failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Room is not loaded (or not stored, for database-backed lookups)
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Movie does not exist in the room's playlist
    #[error("Movie not found: {0}")]
    MovieNotFound(MovieId),

    /// No media channel exists under the given name
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Room id is not a 36-character UUID string
    #[error("Room id must be 36 characters, got {0}")]
    MalformedRoomId(usize),

    /// New password equals the current one
    #[error("Password is unchanged")]
    PasswordUnchanged,

    /// Supplied password does not match the room's password
    #[error("Password is incorrect")]
    PasswordIncorrect,

    /// Room is already present in the cache
    #[error("Room already initialized: {0}")]
    RoomAlreadyInit(RoomId),

    #[error("Room banned")]
    RoomBanned,

    #[error("Room pending, please wait for admin to approve")]
    RoomPending,

    #[error("Room stopped")]
    RoomStopped,

    /// Hub has been shut down
    #[error("Hub closed")]
    HubClosed,

    /// User lacks the permission required for an operation
    #[error("Permission denied")]
    PermissionDenied,

    /// Persistence error (transient)
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    /// Password hashing failure (fatal)
    #[error("Password hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// Row does not exist
    #[error("record not found")]
    NotFound,

    /// Unique constraint violated
    #[error("record already exists")]
    AlreadyExists,

    /// Backend failure, message passed through
    #[error("{0}")]
    Backend(String),
}

/// Client queue errors
///
/// Occurs when enqueueing a message for a client that cannot take it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The client has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The client's outbound queue is at capacity
    #[error("Channel full")]
    ChannelFull,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable holds an unparsable value
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
