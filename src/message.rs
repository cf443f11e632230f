//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization.

use serde::{Deserialize, Serialize};

use crate::current::{Snapshot, Status};
use crate::error::AppError;

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room (required before anything else)
    Join {
        room_id: String,
        user_id: String,
        #[serde(default)]
        password: String,
    },
    /// Send a chat message to the room
    Chat { content: String },
    /// Report playing flag, seek and rate
    SetStatus {
        playing: bool,
        seek: f64,
        rate: f64,
        #[serde(default)]
        time_diff: f64,
    },
    /// Report seek and rate, keeping the playing flag
    SetSeekRate {
        seek: f64,
        rate: f64,
        #[serde(default)]
        time_diff: f64,
    },
    /// Switch the room to another movie of its playlist
    ChangeMovie { movie_id: String },
    /// Ask for the current playback state
    Current,
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted
    Joined {
        room_id: String,
        client_id: String,
        version: u32,
        current: Snapshot,
    },
    /// Chat message received
    Chat { from: String, content: String },
    /// Playback status changed
    Status { sender: String, status: Status },
    /// Playback state, after a movie change or on request
    Current { current: Snapshot },
    /// Number of users in the room changed
    PeopleNum { num: i64 },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Non-existent or unloaded room
    RoomNotFound,
    /// Room is banned, pending or stopped
    RoomUnavailable,
    /// Movie not in the playlist
    MovieNotFound,
    /// Wrong room password
    PasswordIncorrect,
    /// Missing room permission
    PermissionDenied,
    /// Room password changed since joining
    VersionMismatch,
    /// Action attempted before joining
    NotJoined,
    /// Invalid message format
    InvalidMessage,
    /// Anything else
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let code = match &err {
            AppError::RoomNotFound(_) | AppError::MalformedRoomId(_) => ErrorCode::RoomNotFound,
            AppError::RoomBanned | AppError::RoomPending | AppError::RoomStopped => {
                ErrorCode::RoomUnavailable
            }
            AppError::MovieNotFound(_) | AppError::ChannelNotFound(_) => ErrorCode::MovieNotFound,
            AppError::PasswordIncorrect => ErrorCode::PasswordIncorrect,
            AppError::PermissionDenied => ErrorCode::PermissionDenied,
            AppError::Json(_) => ErrorCode::InvalidMessage,
            // Fatal errors are not typically converted (connection closes)
            _ => ErrorCode::Internal,
        };
        let message = match code {
            ErrorCode::Internal => "Internal error".to_string(),
            _ => err.to_string(),
        };
        ServerMessage::Error { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MovieId, RoomId};

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{"type": "join", "room_id": "abc", "user_id": "alice"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Join {
                room_id,
                user_id,
                password,
            } => {
                assert_eq!(room_id, "abc");
                assert_eq!(user_id, "alice");
                assert!(password.is_empty());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_set_status_time_diff_defaults() {
        let json = r#"{"type": "set_status", "playing": true, "seek": 1.5, "rate": 1.0}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SetStatus { playing: true, time_diff, .. } if time_diff == 0.0
        ));
    }

    #[test]
    fn test_server_message_serialize() {
        let msg = ServerMessage::Current {
            current: Snapshot {
                movie_id: MovieId::from("m1"),
                live: false,
                status: Status::default(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"current\""));
        assert!(json.contains("\"movie_id\":\"m1\""));
    }

    #[test]
    fn test_error_conversion() {
        let msg: ServerMessage = AppError::RoomNotFound(RoomId::from("x")).into();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"room_not_found\""));

        let msg: ServerMessage = AppError::RoomBanned.into();
        assert!(matches!(
            msg,
            ServerMessage::Error { code: ErrorCode::RoomUnavailable, .. }
        ));

        let msg: ServerMessage = AppError::HubClosed.into();
        assert!(matches!(
            msg,
            ServerMessage::Error { code: ErrorCode::Internal, ref message } if message == "Internal error"
        ));
    }
}
