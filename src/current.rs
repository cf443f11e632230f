//! Playback state of a room
//!
//! `Current` holds what the room is watching and where playback stands.
//! Clients report a seek position together with the round-trip offset they
//! measured; readers get the seek advanced by the time that has passed since
//! the last update.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::types::{MovieId, MovieRow};

/// Playing flag, seek and rate as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Status {
    pub playing: bool,
    /// Seconds into the media
    pub seek: f64,
    pub rate: f64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            playing: false,
            seek: 0.0,
            rate: 1.0,
        }
    }
}

/// Consistent view of the playback state at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Empty when no movie is selected
    pub movie_id: MovieId,
    pub live: bool,
    pub status: Status,
}

#[derive(Debug)]
struct State {
    movie_id: MovieId,
    live: bool,
    status: Status,
    last_update: Instant,
}

impl State {
    fn seek_at(&self, now: Instant) -> f64 {
        if self.status.playing {
            let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
            self.status.seek + elapsed * self.status.rate
        } else {
            self.status.seek
        }
    }
}

/// Authoritative playback state of one room
///
/// Every field is updated under one lock, so a reader never mixes the seek
/// of one update with the timestamp of another.
#[derive(Debug)]
pub struct Current {
    state: Mutex<State>,
}

impl Current {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                movie_id: MovieId::default(),
                live: false,
                status: Status::default(),
                last_update: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch to `movie` and restart playback from the beginning
    ///
    /// A newly selected movie is always playing at normal rate, live or
    /// not. Movie metadata carries no initial playback state, only the live
    /// flag is taken from it.
    pub fn set_movie(&self, movie: &MovieRow) {
        self.set_movie_at(movie, Instant::now());
    }

    fn set_movie_at(&self, movie: &MovieRow, now: Instant) {
        let mut state = self.lock();
        state.movie_id = movie.id.clone();
        state.live = movie.base.live;
        state.status = Status {
            playing: true,
            seek: 0.0,
            rate: 1.0,
        };
        state.last_update = now;
    }

    /// Deselect the current movie and stop playback
    pub fn clear_movie(&self) {
        let mut state = self.lock();
        state.movie_id = MovieId::default();
        state.live = false;
        state.status = Status::default();
        state.last_update = Instant::now();
    }

    /// Record a client-reported playback status
    ///
    /// `time_diff` is the caller's round-trip offset in seconds; it is added
    /// to the seek while playing. A non-positive or non-finite rate keeps the
    /// previous rate.
    pub fn set_status(&self, playing: bool, seek: f64, rate: f64, time_diff: f64) -> Status {
        self.set_status_at(playing, seek, rate, time_diff, Instant::now())
    }

    fn set_status_at(
        &self,
        playing: bool,
        seek: f64,
        rate: f64,
        time_diff: f64,
        now: Instant,
    ) -> Status {
        let mut state = self.lock();
        let rate = sanitize_rate(rate, state.status.rate);
        state.status = Status {
            playing,
            seek: if playing { seek + time_diff } else { seek },
            rate,
        };
        state.last_update = now;
        state.status
    }

    /// Like `set_status`, keeping the playing flag as it is
    pub fn set_seek_rate(&self, seek: f64, rate: f64, time_diff: f64) -> Status {
        self.set_seek_rate_at(seek, rate, time_diff, Instant::now())
    }

    fn set_seek_rate_at(&self, seek: f64, rate: f64, time_diff: f64, now: Instant) -> Status {
        let mut state = self.lock();
        let playing = state.status.playing;
        let rate = sanitize_rate(rate, state.status.rate);
        state.status = Status {
            playing,
            seek: if playing { seek + time_diff } else { seek },
            rate,
        };
        state.last_update = now;
        state.status
    }

    /// Current state with the seek advanced to now
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> Snapshot {
        let state = self.lock();
        Snapshot {
            movie_id: state.movie_id.clone(),
            live: state.live,
            status: Status {
                seek: state.seek_at(now),
                ..state.status
            },
        }
    }

    pub fn movie_id(&self) -> MovieId {
        self.lock().movie_id.clone()
    }
}

impl Default for Current {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize_rate(rate: f64, previous: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        previous
    }
}
