//! Synchronized-watching Room Server Library
//!
//! Coordination core for rooms where people watch a video together: a
//! registry of loaded rooms with idle expiry, per-room playlists and playback
//! state, and a hub fanning messages out to every WebSocket connection in a
//! room.
//!
//! # Features
//! - Room registry backed by a TTL cache, loading rooms on demand
//! - Password-protected rooms with session versioning
//! - Per-user room roles and permissions
//! - Ordered playlists with live channels for proxied streams
//! - Playback state with latency-compensated seek
//! - Per-room broadcast hub with per-user connection limits
//!
//! # Architecture
//! Shared state behind `Arc` with fine-grained locks:
//! - `Rooms` owns the cache of loaded `Room`s and evicts idle ones
//! - Each `Room` owns its `Movies`, `Current` and a lazily created `Hub`
//! - Each connection has a `handler` task reading from the socket and a
//!   `Client` task writing to it
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use syncroom::{handle_connection, Config, MemoryDatabase, Rooms};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(Config::default());
//!     let rooms = Arc::new(Rooms::new(Arc::new(MemoryDatabase::new()), config));
//!     rooms.spawn_sweeper();
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, Arc::clone(&rooms)));
//!     }
//! }
//! ```

pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod current;
pub mod db;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod movies;
pub mod room;
pub mod rooms;
pub mod types;

// Re-export main types for convenience
pub use cache::TtlCache;
pub use channel::Channel;
pub use client::Client;
pub use config::Config;
pub use current::{Current, Snapshot, Status};
pub use db::{Database, MemoryDatabase};
pub use error::{AppError, ConfigError, DbError, SendError};
pub use handler::handle_connection;
pub use hub::{BroadcastConf, Hub};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use movies::Movies;
pub use room::Room;
pub use rooms::{RoomHeap, RoomHeapItem, Rooms};
pub use types::{ClientId, MovieId, RoomId, UserId};
