//! Basic type definitions for the room core
//!
//! Provides newtype wrappers for type safety plus the row types exchanged
//! with the persistence layer:
//! - `RoomId`: 36-character UUID string identifying a room
//! - `UserId`, `MovieId`: opaque string identifiers
//! - `ClientId`: UUID-based identifier of a single hub registration

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a hyphenated UUID string, the only accepted room id shape
pub const ROOM_ID_LEN: usize = 36;

/// Room identifier (hyphenated UUID string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Generate a fresh random room id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id has the shape of a hyphenated UUID
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == ROOM_ID_LEN
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User identifier, issued by the identity layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Movie identifier, unique within a room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovieId(pub String);

impl MovieId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for MovieId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MovieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of one hub registration (newtype pattern)
///
/// A user with several open tabs owns several client ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Active,
    /// Waiting for an administrator to approve it
    Pending,
    Stopped,
    Banned,
}

impl RoomStatus {
    /// Statuses under which a room must not stay loaded
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Pending | Self::Stopped | Self::Banned)
    }
}

/// Per-room settings stored alongside the room row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Hidden rooms are left out of public listings
    pub hidden: bool,
}

/// Bit set of room-scoped permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub u32);

impl Permission {
    pub const NONE: Self = Self(0);
    pub const GET_MOVIE_LIST: Self = Self(1 << 0);
    pub const ADD_MOVIE: Self = Self(1 << 1);
    pub const DELETE_MOVIE: Self = Self(1 << 2);
    pub const EDIT_MOVIE: Self = Self(1 << 3);
    pub const SET_CURRENT_MOVIE: Self = Self(1 << 4);
    pub const SET_CURRENT_STATUS: Self = Self(1 << 5);
    pub const SEND_CHAT: Self = Self(1 << 6);
    pub const ALL: Self = Self(u32::MAX);

    /// Permissions granted to a freshly joined member
    pub const DEFAULT_MEMBER: Self = Self(
        Self::GET_MOVIE_LIST.0
            | Self::ADD_MOVIE.0
            | Self::SET_CURRENT_STATUS.0
            | Self::SEND_CHAT.0,
    );

    /// Whether every bit of `other` is set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Role of a user inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Banned,
    Pending,
    #[default]
    Member,
    Admin,
    Creator,
}

/// Relation between a user and a room, as stored by the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUserRelation {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: RoomRole,
    pub permissions: Permission,
}

impl RoomUserRelation {
    /// Check a permission against the relation
    ///
    /// Creators and admins hold every permission; banned and pending users
    /// hold none.
    pub fn has_permission(&self, permission: Permission) -> bool {
        match self.role {
            RoomRole::Creator | RoomRole::Admin => true,
            RoomRole::Banned | RoomRole::Pending => false,
            RoomRole::Member => self.permissions.contains(permission),
        }
    }
}

/// Persisted room row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: RoomId,
    pub name: String,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    /// bcrypt hash; empty when the room has no password
    #[serde(skip)]
    pub hashed_password: Vec<u8>,
    pub status: RoomStatus,
    pub settings: RoomSettings,
}

/// Options for creating a room row
#[derive(Debug, Clone)]
pub struct CreateRoomConfig {
    pub creator_id: UserId,
    pub status: RoomStatus,
    pub settings: RoomSettings,
}

impl CreateRoomConfig {
    pub fn new(creator_id: UserId) -> Self {
        Self {
            creator_id,
            status: RoomStatus::Active,
            settings: RoomSettings::default(),
        }
    }

    pub fn with_status(mut self, status: RoomStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_settings(mut self, settings: RoomSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Mutable part of a movie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMovie {
    pub name: String,
    pub url: String,
    /// Container or source type hint for players (e.g. "m3u8", "mp4")
    #[serde(default)]
    pub kind: String,
    /// Live source, no fixed duration
    #[serde(default)]
    pub live: bool,
    /// Served through this process instead of directly by its url
    #[serde(default)]
    pub proxy: bool,
    /// Pushed to this process over RTMP
    #[serde(default)]
    pub rtmp_source: bool,
}

impl BaseMovie {
    /// Whether the movie is restreamed through a media channel
    pub fn needs_channel(&self) -> bool {
        self.rtmp_source || (self.live && self.proxy)
    }
}

/// Persisted movie row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieRow {
    pub id: MovieId,
    pub room_id: RoomId,
    pub creator_id: UserId,
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub base: BaseMovie,
}

impl MovieRow {
    /// A movie row not yet attached to a room or given a position
    pub fn new(creator_id: UserId, base: BaseMovie) -> Self {
        Self {
            id: MovieId::generate(),
            room_id: RoomId(String::new()),
            creator_id,
            position: 0,
            created_at: Utc::now(),
            base,
        }
    }
}
