//! Per-room playlist
//!
//! Movies are kept in a map by id plus an ordered index by position. A new
//! movie always lands after the current last position; swapping exchanges
//! two positions, so positions never collide. Rows are loaded from the
//! database on first use and every mutation is written through before it
//! becomes visible in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::channel::Channel;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::types::{BaseMovie, MovieId, MovieRow, RoomId};

#[derive(Debug)]
struct MovieEntry {
    row: MovieRow,
    /// Created on first `get_channel`
    channel: Option<Arc<Channel>>,
}

impl MovieEntry {
    fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    loaded: bool,
    closed: bool,
    by_id: HashMap<MovieId, MovieEntry>,
    by_position: BTreeMap<u64, MovieId>,
}

impl Inner {
    fn insert(&mut self, row: MovieRow) {
        self.by_position.insert(row.position, row.id.clone());
        self.by_id
            .insert(row.id.clone(), MovieEntry { row, channel: None });
    }

    fn next_position(&self) -> u64 {
        self.by_position
            .last_key_value()
            .map_or(1, |(position, _)| position + 1)
    }

    fn entry_mut(&mut self, id: &MovieId) -> Result<&mut MovieEntry> {
        self.by_id
            .get_mut(id)
            .ok_or_else(|| AppError::MovieNotFound(id.clone()))
    }

    fn close_channels(&mut self) {
        for entry in self.by_id.values_mut() {
            entry.close_channel();
        }
    }
}

/// Ordered playlist of one room
pub struct Movies {
    room_id: RoomId,
    db: Arc<dyn Database>,
    inner: Mutex<Inner>,
}

impl Movies {
    pub fn new(room_id: RoomId, db: Arc<dyn Database>) -> Self {
        Self {
            room_id,
            db,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Lock the playlist, loading it from the database the first time
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.loaded {
            let rows = self.db.get_movies_by_room_id(&self.room_id)?;
            debug!(room = %self.room_id, movies = rows.len(), "Playlist loaded");
            for row in rows {
                inner.insert(row);
            }
            inner.loaded = true;
        }
        Ok(inner)
    }

    /// Append a movie after the last one; returns the stored row
    pub fn add(&self, mut movie: MovieRow) -> Result<MovieRow> {
        let mut inner = self.lock()?;
        movie.room_id = self.room_id.clone();
        movie.position = inner.next_position();
        self.db.create_movie(&movie)?;

        debug!(room = %self.room_id, movie = %movie.id, position = movie.position, "Movie added");
        inner.insert(movie.clone());
        Ok(movie)
    }

    /// Replace the mutable fields of a movie
    ///
    /// Id, room and position stay as they are. An open channel is closed,
    /// since it was serving the old source.
    pub fn update(&self, movie_id: &MovieId, base: BaseMovie) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entry_mut(movie_id)?;
        self.db.update_movie(&self.room_id, movie_id, &base)?;

        let entry = inner.entry_mut(movie_id)?;
        entry.row.base = base;
        entry.close_channel();
        Ok(())
    }

    /// Remove one movie; other positions are left untouched
    pub fn delete_movie_by_id(&self, movie_id: &MovieId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entry_mut(movie_id)?;
        self.db.delete_movie_by_id(&self.room_id, movie_id)?;

        if let Some(mut entry) = inner.by_id.remove(movie_id) {
            inner.by_position.remove(&entry.row.position);
            entry.close_channel();
        }
        debug!(room = %self.room_id, movie = %movie_id, "Movie deleted");
        Ok(())
    }

    /// Remove every movie and close their channels
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.db.delete_movies_by_room_id(&self.room_id)?;

        inner.close_channels();
        inner.by_id.clear();
        inner.by_position.clear();
        info!(room = %self.room_id, "Playlist cleared");
        Ok(())
    }

    pub fn get_movie_by_id(&self, movie_id: &MovieId) -> Result<MovieRow> {
        self.lock()?
            .by_id
            .get(movie_id)
            .map(|entry| entry.row.clone())
            .ok_or_else(|| AppError::MovieNotFound(movie_id.clone()))
    }

    /// Exchange the positions of two movies
    pub fn swap_movie_positions(&self, first: &MovieId, second: &MovieId) -> Result<()> {
        let mut inner = self.lock()?;
        let first_pos = inner.entry_mut(first)?.row.position;
        let second_pos = inner.entry_mut(second)?.row.position;
        if first_pos == second_pos {
            return Ok(());
        }
        self.db.swap_movie_positions(&self.room_id, first, second)?;

        inner.entry_mut(first)?.row.position = second_pos;
        inner.entry_mut(second)?.row.position = first_pos;
        inner.by_position.insert(first_pos, second.clone());
        inner.by_position.insert(second_pos, first.clone());
        Ok(())
    }

    /// One page of movies ordered by position; `page` starts at 1
    ///
    /// A page past the end, page 0, or a zero page size yields nothing.
    pub fn get_movies_with_page(&self, page: usize, page_size: usize) -> Result<Vec<MovieRow>> {
        if page == 0 || page_size == 0 {
            return Ok(Vec::new());
        }
        let inner = self.lock()?;
        let skip = (page - 1).saturating_mul(page_size);
        Ok(inner
            .by_position
            .values()
            .skip(skip)
            .take(page_size)
            .filter_map(|id| inner.by_id.get(id))
            .map(|entry| entry.row.clone())
            .collect())
    }

    /// Media channel of the movie named `channel_name`, created on first use
    pub fn get_channel(&self, channel_name: &str) -> Result<Arc<Channel>> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(AppError::ChannelNotFound(channel_name.to_string()));
        }

        let movie_id = MovieId::from(channel_name);
        let entry = inner.entry_mut(&movie_id)?;
        if !entry.row.base.needs_channel() {
            return Err(AppError::ChannelNotFound(channel_name.to_string()));
        }

        let channel = entry.channel.get_or_insert_with(|| {
            debug!(movie = %movie_id, "Channel created");
            Arc::new(Channel::new(channel_name))
        });
        Ok(Arc::clone(channel))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Close every channel; no channel is handed out afterwards
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.close_channels();
    }
}

impl std::fmt::Debug for Movies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Movies")
            .field("room_id", &self.room_id)
            .finish()
    }
}
