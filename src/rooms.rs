//! Room registry
//!
//! Loaded rooms live in a TTL cache keyed by room id. Every lookup slides
//! the room's expiration forward; rooms idle past the TTL are swept out and
//! closed. Rooms missing from the cache are loaded from the database, at most
//! one fetch per id at a time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{Entry, TtlCache};
use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, DbError, Result};
use crate::room::Room;
use crate::types::{CreateRoomConfig, RoomId, RoomRow, RoomStatus, UserId};

/// Registry of loaded rooms
pub struct Rooms {
    cache: Arc<TtlCache<RoomId, Arc<Room>>>,
    /// Per-id locks serializing database loads
    loading: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
    db: Arc<dyn Database>,
    config: Arc<Config>,
}

impl Rooms {
    pub fn new(db: Arc<dyn Database>, config: Arc<Config>) -> Self {
        // A room stays loaded past its TTL while anyone still uses it
        let cache = TtlCache::with_evict_hook(|id: &RoomId, room: &Arc<Room>| {
            debug!(room = %id, "Room expired");
            room.close();
        })
        .with_hold_check(|room: &Arc<Room>| Arc::strong_count(room) > 1 || room.client_num() > 0);
        Self {
            cache: Arc::new(cache),
            loading: Mutex::new(HashMap::new()),
            db,
            config,
        }
    }

    /// Start the task evicting idle rooms
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.config.sweep_interval)
    }

    fn new_room(&self, row: RoomRow) -> Arc<Room> {
        Arc::new(Room::new(row, Arc::clone(&self.db), Arc::clone(&self.config)))
    }

    fn refresh(&self, entry: &Entry<Arc<Room>>) {
        entry.set_expiration(Instant::now() + self.config.room_ttl);
    }

    /// Slide the expiration of `room` if it is still the cached instance
    ///
    /// Connection handlers call this on every inbound message so an active
    /// room never reaches its TTL.
    pub fn touch(&self, room: &Arc<Room>) -> bool {
        match self.cache.peek(room.id()) {
            Some(entry) if Arc::ptr_eq(entry.value(), room) => {
                self.refresh(&entry);
                true
            }
            _ => false,
        }
    }

    /// Persist a new room and load it
    pub fn create_room(&self, name: &str, password: &str, conf: CreateRoomConfig) -> Result<Arc<Room>> {
        let hashed = if password.is_empty() {
            Vec::new()
        } else {
            bcrypt::hash(password, self.config.password_cost)?.into_bytes()
        };
        let row = self.db.create_room(name, hashed, conf)?;
        info!(room = %row.id, name = %row.name, creator = %row.creator_id, "Room created");
        self.init_room(row)
    }

    /// Load a row that must not already be cached
    pub fn init_room(&self, row: RoomRow) -> Result<Arc<Room>> {
        let id = row.id.clone();
        let room = self.new_room(row);
        let (entry, loaded) = self.cache.load_or_store(id.clone(), room, self.config.room_ttl);
        if loaded {
            return Err(AppError::RoomAlreadyInit(id));
        }
        Ok(Arc::clone(entry.value()))
    }

    /// Return the cached room for `row`, loading it if needed
    ///
    /// Rooms that are banned, pending or stopped are never loaded.
    pub fn load_or_init_room(&self, row: RoomRow) -> Result<Arc<Room>> {
        match row.status {
            RoomStatus::Banned => return Err(AppError::RoomBanned),
            RoomStatus::Pending => return Err(AppError::RoomPending),
            RoomStatus::Stopped => return Err(AppError::RoomStopped),
            RoomStatus::Active => {}
        }

        let id = row.id.clone();
        let room = self.new_room(row);
        let (entry, loaded) = self.cache.load_or_store(id, room, self.config.room_ttl);
        if loaded {
            self.refresh(&entry);
        }
        Ok(Arc::clone(entry.value()))
    }

    /// Cached room by id, without touching the database
    pub fn load_room_by_id(&self, id: &RoomId) -> Result<Arc<Room>> {
        let entry = self
            .cache
            .load(id)
            .ok_or_else(|| AppError::RoomNotFound(id.clone()))?;
        self.refresh(&entry);
        Ok(Arc::clone(entry.value()))
    }

    /// Cached room by id, falling back to the database
    ///
    /// Concurrent misses on the same id share one database fetch.
    pub fn load_or_init_room_by_id(&self, id: &RoomId) -> Result<Arc<Room>> {
        if !id.is_well_formed() {
            return Err(AppError::MalformedRoomId(id.as_str().len()));
        }
        if let Ok(room) = self.load_room_by_id(id) {
            return Ok(room);
        }

        let lock = Arc::clone(
            self.loading
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id.clone())
                .or_default(),
        );
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.load_room_by_id(id) {
                Ok(room) => Ok(room),
                Err(_) => self.fetch_room(id),
            }
        };

        let mut loading = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        if loading.get(id).is_some_and(|current| Arc::ptr_eq(current, &lock)) {
            loading.remove(id);
        }
        result
    }

    fn fetch_room(&self, id: &RoomId) -> Result<Arc<Room>> {
        let row = self.db.get_room_by_id(id).map_err(|e| match e {
            DbError::NotFound => AppError::RoomNotFound(id.clone()),
            e => AppError::Db(e),
        })?;
        debug!(room = %id, "Room loaded from database");
        self.load_or_init_room(row)
    }

    /// Delete the room from the database and close it
    pub fn delete_room(&self, id: &RoomId) -> Result<()> {
        self.db.delete_room_by_id(id)?;
        self.close_room(id);
        info!(room = %id, "Room deleted");
        Ok(())
    }

    /// Evict the room and close it
    pub fn close_room(&self, id: &RoomId) {
        if let Some(entry) = self.cache.load_and_delete(id) {
            entry.value().close();
        }
    }

    /// Evict and close `room` only if it is still the cached instance
    pub fn compare_and_close_room(&self, room: &Arc<Room>) -> bool {
        let Some(entry) = self.cache.load(room.id()) else {
            return false;
        };
        if !Arc::ptr_eq(entry.value(), room) {
            return false;
        }
        if self.cache.compare_and_delete(room.id(), &entry) {
            room.close();
            true
        } else {
            false
        }
    }

    /// Connected users of a cached room; zero when it is not loaded
    pub fn client_num(&self, id: &RoomId) -> i64 {
        self.cache
            .load(id)
            .map_or(0, |entry| entry.value().client_num())
    }

    /// Whether the room exists, cached or stored
    pub fn has_room(&self, id: &RoomId) -> bool {
        if self.cache.load(id).is_some() {
            return true;
        }
        self.db.has_room(id).unwrap_or(false)
    }

    pub fn has_room_by_name(&self, name: &str) -> bool {
        self.db.has_room_by_name(name).unwrap_or(false)
    }

    /// Change the password of a room, loading it if needed
    pub fn set_room_password(&self, id: &RoomId, password: &str) -> Result<()> {
        self.load_or_init_room_by_id(id)?.set_password(password)
    }

    /// Cached rooms that are not hidden
    pub fn get_all_rooms_in_cache_without_hidden(&self) -> Vec<Arc<Room>> {
        self.collect_rooms(|room| !room.settings().hidden)
    }

    /// Cached rooms joinable without a password
    pub fn get_all_rooms_in_cache_with_no_need_password(&self) -> Vec<Arc<Room>> {
        self.collect_rooms(|room| !room.need_password())
    }

    /// Cached, non-hidden rooms ordered by how many people are in them
    pub fn get_room_heap_in_cache_without_hidden(&self) -> RoomHeap {
        let mut heap = RoomHeap::new();
        self.cache.range(|_, entry| {
            let room = entry.value();
            if !room.settings().hidden {
                heap.push(RoomHeapItem::from_room(room));
            }
            true
        });
        heap
    }

    fn collect_rooms(&self, filter: impl Fn(&Room) -> bool) -> Vec<Arc<Room>> {
        let mut rooms = Vec::new();
        self.cache.range(|_, entry| {
            if filter(entry.value()) {
                rooms.push(Arc::clone(entry.value()));
            }
            true
        });
        rooms
    }
}

/// Listing entry for a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomHeapItem {
    pub room_id: RoomId,
    pub room_name: String,
    pub people_num: i64,
    pub need_password: bool,
    pub creator_id: UserId,
    /// Unix milliseconds
    pub created_at: i64,
}

impl RoomHeapItem {
    pub fn from_room(room: &Room) -> Self {
        Self {
            room_id: room.id().clone(),
            room_name: room.name().to_string(),
            people_num: room.client_num(),
            need_password: room.need_password(),
            creator_id: room.creator_id().clone(),
            created_at: room.created_at().timestamp_millis(),
        }
    }
}

impl Ord for RoomHeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.people_num
            .cmp(&other.people_num)
            .then_with(|| self.room_id.cmp(&other.room_id))
    }
}

impl PartialOrd for RoomHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of rooms by people count
///
/// Popping yields the emptiest room first, so trimming the heap down to `k`
/// leaves the `k` busiest rooms.
#[derive(Debug, Default)]
pub struct RoomHeap(BinaryHeap<Reverse<RoomHeapItem>>);

impl RoomHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: RoomHeapItem) {
        self.0.push(Reverse(item));
    }

    /// Remove the room with the fewest people
    pub fn pop(&mut self) -> Option<RoomHeapItem> {
        self.0.pop().map(|Reverse(item)| item)
    }

    pub fn peek(&self) -> Option<&RoomHeapItem> {
        self.0.peek().map(|Reverse(item)| item)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `k` busiest rooms, busiest first
    pub fn into_top(mut self, k: usize) -> Vec<RoomHeapItem> {
        while self.0.len() > k {
            self.0.pop();
        }
        self.0
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(item)| item)
            .collect()
    }
}
