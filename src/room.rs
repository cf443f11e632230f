//! Room aggregate
//!
//! A loaded room: identity and settings from its row, the password hash and
//! the session version derived from it, the playback state, the playlist and
//! a hub that is only created once the first client registers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures_util::Sink;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::client::Client;
use crate::config::Config;
use crate::current::{Current, Snapshot, Status};
use crate::db::Database;
use crate::error::{AppError, DbError, Result};
use crate::hub::{BroadcastConf, Hub};
use crate::message::ServerMessage;
use crate::movies::Movies;
use crate::rooms::Rooms;
use crate::types::{
    BaseMovie, MovieId, MovieRow, Permission, RoomId, RoomRole, RoomRow, RoomSettings,
    RoomStatus, UserId,
};

/// Session version of a password hash; zero for no password
pub fn password_version(hashed_password: &[u8]) -> u32 {
    crc32fast::hash(hashed_password)
}

/// A live room
pub struct Room {
    id: RoomId,
    name: String,
    creator_id: UserId,
    created_at: DateTime<Utc>,
    settings: RoomSettings,
    status: Mutex<RoomStatus>,
    hashed_password: RwLock<Vec<u8>>,
    /// Serializes password writes so the stored hash and the version match
    password_write: Mutex<()>,
    version: AtomicU32,
    current: Current,
    movies: Movies,
    hub: OnceLock<Hub>,
    closed: AtomicBool,
    #[cfg(test)]
    close_runs: std::sync::atomic::AtomicUsize,
    db: Arc<dyn Database>,
    config: Arc<Config>,
}

impl Room {
    /// Build the in-memory room for a stored row
    pub fn new(row: RoomRow, db: Arc<dyn Database>, config: Arc<Config>) -> Self {
        Self {
            version: AtomicU32::new(password_version(&row.hashed_password)),
            movies: Movies::new(row.id.clone(), Arc::clone(&db)),
            id: row.id,
            name: row.name,
            creator_id: row.creator_id,
            created_at: row.created_at,
            settings: row.settings,
            status: Mutex::new(row.status),
            hashed_password: RwLock::new(row.hashed_password),
            password_write: Mutex::new(()),
            current: Current::new(),
            hub: OnceLock::new(),
            closed: AtomicBool::new(false),
            #[cfg(test)]
            close_runs: std::sync::atomic::AtomicUsize::new(0),
            db,
            config,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creator_id(&self) -> &UserId {
        &self.creator_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn status(&self) -> RoomStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- hub ----

    fn hub(&self) -> &Hub {
        self.hub.get_or_init(|| Hub::new(self.id.clone(), &self.config))
    }

    /// Register a connection of `user_id`, creating the hub on first use
    pub fn reg_client<S>(&self, user_id: UserId, name: String, sink: S) -> Result<Arc<Client>>
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: fmt::Display,
    {
        if self.is_closed() {
            return Err(AppError::HubClosed);
        }
        let hub = self.hub();
        let client = hub.reg_client(user_id, name, sink)?;

        // Raced with `close`, which may not have seen the new hub
        if self.is_closed() {
            hub.close();
            return Err(AppError::HubClosed);
        }
        Ok(client)
    }

    /// Drop every connection of a user
    pub fn unregister_client(&self, user_id: &UserId) {
        if let Some(hub) = self.hub.get() {
            hub.unreg_client(user_id);
        }
    }

    /// Drop one connection
    pub fn remove_client(&self, client: &Client) -> bool {
        self.hub.get().is_some_and(|hub| hub.remove_client(client))
    }

    /// Distinct users connected; zero while no hub exists
    pub fn client_num(&self) -> i64 {
        self.hub.get().map_or(0, Hub::client_num)
    }

    pub fn broadcast(&self, msg: &ServerMessage, conf: &BroadcastConf) -> Result<()> {
        match self.hub.get() {
            Some(hub) => hub.broadcast(msg, conf),
            None => Ok(()),
        }
    }

    pub fn send_to_user(&self, user_id: &UserId, msg: &ServerMessage) -> Result<()> {
        match self.hub.get() {
            Some(hub) => hub.send_to_user(user_id, msg),
            None => Ok(()),
        }
    }

    /// Close the hub and the playlist channels
    ///
    /// Only the first call has an effect. Called by the registry once the
    /// room has left the cache.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(test)]
        self.close_runs.fetch_add(1, Ordering::SeqCst);
        if let Some(hub) = self.hub.get() {
            hub.close();
        }
        self.movies.close();
        info!(room = %self.id, name = %self.name, "Room closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn close_runs(&self) -> usize {
        self.close_runs.load(Ordering::SeqCst)
    }

    // ---- password ----

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether a session created under `version` is still valid
    pub fn check_version(&self, version: u32) -> bool {
        self.version.load(Ordering::SeqCst) == version
    }

    pub fn need_password(&self) -> bool {
        !self.read_password().is_empty()
    }

    fn read_password(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.hashed_password
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Verify `password`; any password passes when none is set
    pub fn check_password(&self, password: &str) -> bool {
        let hashed = self.read_password().clone();
        if hashed.is_empty() {
            return true;
        }
        match std::str::from_utf8(&hashed) {
            Ok(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Replace the room password; an empty password removes it
    ///
    /// The version changes with the hash, invalidating sessions created
    /// under the old password.
    pub fn set_password(&self, password: &str) -> Result<()> {
        if self.need_password() && self.check_password(password) {
            return Err(AppError::PasswordUnchanged);
        }

        let hashed = if password.is_empty() {
            Vec::new()
        } else {
            bcrypt::hash(password, self.config.password_cost)?.into_bytes()
        };

        let _write = self.lock_password_write();
        self.db.set_room_hashed_password(&self.id, &hashed)?;

        let version = password_version(&hashed);
        let mut stored = self
            .hashed_password
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *stored = hashed;
        self.version.store(version, Ordering::SeqCst);
        drop(stored);

        info!(room = %self.id, version, "Room password changed");
        Ok(())
    }

    fn lock_password_write(&self) -> MutexGuard<'_, ()> {
        self.password_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---- permissions ----

    /// Whether the user's relation to the room grants `permission`
    ///
    /// A missing relation or a failed lookup denies.
    pub fn has_permission(&self, user_id: &UserId, permission: Permission) -> bool {
        match self.db.get_room_user_relation(&self.id, user_id) {
            Ok(relation) => relation.has_permission(permission),
            Err(e) => {
                if e != DbError::NotFound {
                    warn!(room = %self.id, user = %user_id, "Permission lookup failed: {}", e);
                }
                false
            }
        }
    }

    pub fn set_user_role(&self, user_id: &UserId, role: RoomRole) -> Result<()> {
        Ok(self.db.set_user_role(&self.id, user_id, role)?)
    }

    pub fn set_user_permission(&self, user_id: &UserId, permission: Permission) -> Result<()> {
        Ok(self.db.set_user_permission(&self.id, user_id, permission)?)
    }

    pub fn add_user_permission(&self, user_id: &UserId, permission: Permission) -> Result<()> {
        Ok(self.db.add_user_permission(&self.id, user_id, permission)?)
    }

    pub fn remove_user_permission(&self, user_id: &UserId, permission: Permission) -> Result<()> {
        Ok(self.db.remove_user_permission(&self.id, user_id, permission)?)
    }

    pub fn delete_user_permission(&self, user_id: &UserId) -> Result<()> {
        Ok(self.db.delete_user_permission(&self.id, user_id)?)
    }

    // ---- status ----

    /// Persist a new room status
    ///
    /// Banning, stopping or suspending the room evicts this instance from
    /// `rooms`.
    pub fn set_room_status(self: &Arc<Self>, rooms: &Rooms, status: RoomStatus) -> Result<()> {
        self.db.set_room_status(&self.id, status)?;
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        info!(room = %self.id, ?status, "Room status changed");

        if status.is_closing() {
            rooms.compare_and_close_room(self);
        }
        Ok(())
    }

    // ---- playlist ----

    pub fn add_movie(&self, movie: MovieRow) -> Result<MovieRow> {
        self.movies.add(movie)
    }

    pub fn update_movie(&self, movie_id: &MovieId, base: BaseMovie) -> Result<()> {
        self.movies.update(movie_id, base)
    }

    /// Delete a movie; deselects it if it is the current one
    pub fn delete_movie_by_id(&self, movie_id: &MovieId) -> Result<()> {
        self.movies.delete_movie_by_id(movie_id)?;
        if &self.current.movie_id() == movie_id {
            self.current.clear_movie();
        }
        Ok(())
    }

    pub fn clear_movies(&self) -> Result<()> {
        self.movies.clear()?;
        self.current.clear_movie();
        Ok(())
    }

    pub fn get_movie_by_id(&self, movie_id: &MovieId) -> Result<MovieRow> {
        self.movies.get_movie_by_id(movie_id)
    }

    pub fn swap_movie_positions(&self, first: &MovieId, second: &MovieId) -> Result<()> {
        self.movies.swap_movie_positions(first, second)
    }

    pub fn get_movies_with_page(&self, page: usize, page_size: usize) -> Result<Vec<MovieRow>> {
        self.movies.get_movies_with_page(page, page_size)
    }

    pub fn movies_count(&self) -> Result<usize> {
        self.movies.len()
    }

    pub fn get_channel(&self, channel_name: &str) -> Result<Arc<Channel>> {
        self.movies.get_channel(channel_name)
    }

    // ---- playback ----

    pub fn current(&self) -> Snapshot {
        self.current.snapshot()
    }

    /// Switch playback to a movie of the playlist
    pub fn change_current_movie(&self, movie_id: &MovieId) -> Result<Snapshot> {
        let movie = self.movies.get_movie_by_id(movie_id)?;
        self.current.set_movie(&movie);
        Ok(self.current.snapshot())
    }

    pub fn set_status(&self, playing: bool, seek: f64, rate: f64, time_diff: f64) -> Status {
        self.current.set_status(playing, seek, rate, time_diff)
    }

    pub fn set_seek_rate(&self, seek: f64, rate: f64, time_diff: f64) -> Status {
        self.current.set_seek_rate(seek, rate, time_diff)
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}
