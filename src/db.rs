//! Persistence collaborator
//!
//! The room core keeps nothing durable itself. Everything it must persist
//! goes through the `Database` trait; calls are blocking and fallible, and
//! the core passes their errors through unchanged.
//!
//! `MemoryDatabase` is a process-local implementation used by the binary and
//! by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::DbError;
use crate::types::{
    BaseMovie, CreateRoomConfig, MovieId, MovieRow, Permission, RoomId, RoomRole, RoomRow,
    RoomStatus, RoomUserRelation, UserId,
};

/// Storage operations the room core relies on
pub trait Database: Send + Sync {
    /// Insert a new room row; `hashed_password` is empty for open rooms
    fn create_room(
        &self,
        name: &str,
        hashed_password: Vec<u8>,
        conf: CreateRoomConfig,
    ) -> Result<RoomRow, DbError>;
    fn get_room_by_id(&self, id: &RoomId) -> Result<RoomRow, DbError>;
    fn delete_room_by_id(&self, id: &RoomId) -> Result<(), DbError>;
    fn has_room(&self, id: &RoomId) -> Result<bool, DbError>;
    fn has_room_by_name(&self, name: &str) -> Result<bool, DbError>;
    fn set_room_hashed_password(&self, id: &RoomId, hashed_password: &[u8]) -> Result<(), DbError>;
    fn set_room_status(&self, id: &RoomId, status: RoomStatus) -> Result<(), DbError>;

    fn get_room_user_relation(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<RoomUserRelation, DbError>;
    fn set_user_role(&self, room_id: &RoomId, user_id: &UserId, role: RoomRole)
        -> Result<(), DbError>;
    fn set_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError>;
    fn add_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError>;
    fn remove_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError>;
    fn delete_user_permission(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), DbError>;

    /// All movies of a room, in any order
    fn get_movies_by_room_id(&self, room_id: &RoomId) -> Result<Vec<MovieRow>, DbError>;
    fn create_movie(&self, movie: &MovieRow) -> Result<(), DbError>;
    fn update_movie(
        &self,
        room_id: &RoomId,
        movie_id: &MovieId,
        base: &BaseMovie,
    ) -> Result<(), DbError>;
    fn delete_movie_by_id(&self, room_id: &RoomId, movie_id: &MovieId) -> Result<(), DbError>;
    fn delete_movies_by_room_id(&self, room_id: &RoomId) -> Result<(), DbError>;
    fn swap_movie_positions(
        &self,
        room_id: &RoomId,
        first: &MovieId,
        second: &MovieId,
    ) -> Result<(), DbError>;
}

#[derive(Debug, Default)]
struct Tables {
    rooms: HashMap<RoomId, RoomRow>,
    relations: HashMap<(RoomId, UserId), RoomUserRelation>,
    movies: HashMap<RoomId, Vec<MovieRow>>,
}

/// In-process `Database`
///
/// Counts room fetches so callers can observe how often the storage was hit.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    room_fetches: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_room_by_id` calls served so far
    pub fn room_fetches(&self) -> usize {
        self.room_fetches.load(Ordering::SeqCst)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn relation_mut<'a>(
    tables: &'a mut Tables,
    room_id: &RoomId,
    user_id: &UserId,
) -> Result<&'a mut RoomUserRelation, DbError> {
    tables
        .relations
        .get_mut(&(room_id.clone(), user_id.clone()))
        .ok_or(DbError::NotFound)
}

fn movie_mut<'a>(
    tables: &'a mut Tables,
    room_id: &RoomId,
    movie_id: &MovieId,
) -> Result<&'a mut MovieRow, DbError> {
    tables
        .movies
        .get_mut(room_id)
        .and_then(|movies| movies.iter_mut().find(|m| &m.id == movie_id))
        .ok_or(DbError::NotFound)
}

impl Database for MemoryDatabase {
    fn create_room(
        &self,
        name: &str,
        hashed_password: Vec<u8>,
        conf: CreateRoomConfig,
    ) -> Result<RoomRow, DbError> {
        let mut tables = self.tables();
        if tables.rooms.values().any(|room| room.name == name) {
            return Err(DbError::AlreadyExists);
        }

        let row = RoomRow {
            id: RoomId::generate(),
            name: name.to_string(),
            creator_id: conf.creator_id.clone(),
            created_at: Utc::now(),
            hashed_password,
            status: conf.status,
            settings: conf.settings,
        };
        tables.relations.insert(
            (row.id.clone(), conf.creator_id.clone()),
            RoomUserRelation {
                room_id: row.id.clone(),
                user_id: conf.creator_id,
                role: RoomRole::Creator,
                permissions: Permission::ALL,
            },
        );
        tables.rooms.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    fn get_room_by_id(&self, id: &RoomId) -> Result<RoomRow, DbError> {
        self.room_fetches.fetch_add(1, Ordering::SeqCst);
        self.tables()
            .rooms
            .get(id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    fn delete_room_by_id(&self, id: &RoomId) -> Result<(), DbError> {
        let mut tables = self.tables();
        tables.rooms.remove(id).ok_or(DbError::NotFound)?;
        tables.relations.retain(|(room_id, _), _| room_id != id);
        tables.movies.remove(id);
        Ok(())
    }

    fn has_room(&self, id: &RoomId) -> Result<bool, DbError> {
        Ok(self.tables().rooms.contains_key(id))
    }

    fn has_room_by_name(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.tables().rooms.values().any(|room| room.name == name))
    }

    fn set_room_hashed_password(&self, id: &RoomId, hashed_password: &[u8]) -> Result<(), DbError> {
        let mut tables = self.tables();
        let room = tables.rooms.get_mut(id).ok_or(DbError::NotFound)?;
        room.hashed_password = hashed_password.to_vec();
        Ok(())
    }

    fn set_room_status(&self, id: &RoomId, status: RoomStatus) -> Result<(), DbError> {
        let mut tables = self.tables();
        let room = tables.rooms.get_mut(id).ok_or(DbError::NotFound)?;
        room.status = status;
        Ok(())
    }

    fn get_room_user_relation(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<RoomUserRelation, DbError> {
        self.tables()
            .relations
            .get(&(room_id.clone(), user_id.clone()))
            .cloned()
            .ok_or(DbError::NotFound)
    }

    fn set_user_role(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        role: RoomRole,
    ) -> Result<(), DbError> {
        let mut tables = self.tables();
        if !tables.rooms.contains_key(room_id) {
            return Err(DbError::NotFound);
        }
        tables
            .relations
            .entry((room_id.clone(), user_id.clone()))
            .and_modify(|rel| rel.role = role)
            .or_insert_with(|| RoomUserRelation {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                role,
                permissions: Permission::DEFAULT_MEMBER,
            });
        Ok(())
    }

    fn set_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError> {
        relation_mut(&mut self.tables(), room_id, user_id)?.permissions = permission;
        Ok(())
    }

    fn add_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError> {
        let mut tables = self.tables();
        let rel = relation_mut(&mut tables, room_id, user_id)?;
        rel.permissions = rel.permissions.union(permission);
        Ok(())
    }

    fn remove_user_permission(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<(), DbError> {
        let mut tables = self.tables();
        let rel = relation_mut(&mut tables, room_id, user_id)?;
        rel.permissions = rel.permissions.without(permission);
        Ok(())
    }

    fn delete_user_permission(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), DbError> {
        relation_mut(&mut self.tables(), room_id, user_id)?.permissions = Permission::NONE;
        Ok(())
    }

    fn get_movies_by_room_id(&self, room_id: &RoomId) -> Result<Vec<MovieRow>, DbError> {
        Ok(self
            .tables()
            .movies
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    fn create_movie(&self, movie: &MovieRow) -> Result<(), DbError> {
        let mut tables = self.tables();
        let movies = tables.movies.entry(movie.room_id.clone()).or_default();
        if movies.iter().any(|m| m.id == movie.id) {
            return Err(DbError::AlreadyExists);
        }
        movies.push(movie.clone());
        Ok(())
    }

    fn update_movie(
        &self,
        room_id: &RoomId,
        movie_id: &MovieId,
        base: &BaseMovie,
    ) -> Result<(), DbError> {
        movie_mut(&mut self.tables(), room_id, movie_id)?.base = base.clone();
        Ok(())
    }

    fn delete_movie_by_id(&self, room_id: &RoomId, movie_id: &MovieId) -> Result<(), DbError> {
        let mut tables = self.tables();
        let movies = tables.movies.get_mut(room_id).ok_or(DbError::NotFound)?;
        let before = movies.len();
        movies.retain(|m| &m.id != movie_id);
        if movies.len() == before {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn delete_movies_by_room_id(&self, room_id: &RoomId) -> Result<(), DbError> {
        self.tables().movies.remove(room_id);
        Ok(())
    }

    fn swap_movie_positions(
        &self,
        room_id: &RoomId,
        first: &MovieId,
        second: &MovieId,
    ) -> Result<(), DbError> {
        let mut tables = self.tables();
        let first_pos = movie_mut(&mut tables, room_id, first)?.position;
        let second_pos = movie_mut(&mut tables, room_id, second)?.position;
        movie_mut(&mut tables, room_id, first)?.position = second_pos;
        movie_mut(&mut tables, room_id, second)?.position = first_pos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_room_adds_creator_relation() {
        let db = MemoryDatabase::new();
        let creator = UserId::from("alice");
        let row = db
            .create_room("r1", Vec::new(), CreateRoomConfig::new(creator.clone()))
            .unwrap();

        let rel = db.get_room_user_relation(&row.id, &creator).unwrap();
        assert_eq!(rel.role, RoomRole::Creator);
        assert!(db.has_room(&row.id).unwrap());
        assert!(db.has_room_by_name("r1").unwrap());

        let dup = db.create_room("r1", Vec::new(), CreateRoomConfig::new(creator));
        assert_eq!(dup.unwrap_err(), DbError::AlreadyExists);
    }

    #[test]
    fn test_room_fetch_counter() {
        let db = MemoryDatabase::new();
        let row = db
            .create_room("r1", Vec::new(), CreateRoomConfig::new(UserId::from("a")))
            .unwrap();
        assert_eq!(db.room_fetches(), 0);
        db.get_room_by_id(&row.id).unwrap();
        assert_eq!(db.get_room_by_id(&RoomId::generate()).unwrap_err(), DbError::NotFound);
        assert_eq!(db.room_fetches(), 2);
    }

    #[test]
    fn test_permission_updates() {
        let db = MemoryDatabase::new();
        let row = db
            .create_room("r1", Vec::new(), CreateRoomConfig::new(UserId::from("a")))
            .unwrap();
        let bob = UserId::from("bob");

        assert_eq!(
            db.add_user_permission(&row.id, &bob, Permission::ADD_MOVIE),
            Err(DbError::NotFound)
        );

        db.set_user_role(&row.id, &bob, RoomRole::Member).unwrap();
        db.set_user_permission(&row.id, &bob, Permission::SEND_CHAT).unwrap();
        db.add_user_permission(&row.id, &bob, Permission::ADD_MOVIE).unwrap();
        let rel = db.get_room_user_relation(&row.id, &bob).unwrap();
        assert!(rel.permissions.contains(Permission::SEND_CHAT));
        assert!(rel.permissions.contains(Permission::ADD_MOVIE));

        db.remove_user_permission(&row.id, &bob, Permission::SEND_CHAT).unwrap();
        assert!(!db
            .get_room_user_relation(&row.id, &bob)
            .unwrap()
            .permissions
            .contains(Permission::SEND_CHAT));

        db.delete_user_permission(&row.id, &bob).unwrap();
        assert_eq!(
            db.get_room_user_relation(&row.id, &bob).unwrap().permissions,
            Permission::NONE
        );
    }

    #[test]
    fn test_movie_rows() {
        let db = MemoryDatabase::new();
        let room_id = RoomId::generate();
        let mut a = MovieRow::new(UserId::from("u"), BaseMovie::default());
        a.room_id = room_id.clone();
        a.position = 1;
        let mut b = MovieRow::new(UserId::from("u"), BaseMovie::default());
        b.room_id = room_id.clone();
        b.position = 2;
        db.create_movie(&a).unwrap();
        db.create_movie(&b).unwrap();

        db.swap_movie_positions(&room_id, &a.id, &b.id).unwrap();
        let rows = db.get_movies_by_room_id(&room_id).unwrap();
        let pos = |id: &MovieId| rows.iter().find(|m| &m.id == id).unwrap().position;
        assert_eq!(pos(&a.id), 2);
        assert_eq!(pos(&b.id), 1);

        db.delete_movie_by_id(&room_id, &a.id).unwrap();
        assert_eq!(db.delete_movie_by_id(&room_id, &a.id), Err(DbError::NotFound));
        db.delete_movies_by_room_id(&room_id).unwrap();
        assert!(db.get_movies_by_room_id(&room_id).unwrap().is_empty());
    }
}
