//! Room directory: the keyed store of live rooms.
//!
//! The directory stores [`RoomHandle`]s, not rooms; the rooms themselves
//! live in their actors. Any backing store can sit behind
//! [`RoomDirectory`]. The in-memory map is what the server uses.

use std::collections::HashMap;
use std::future::Future;

use keyrace_protocol::RoomId;
use rand::Rng;
use tokio::sync::RwLock;

use crate::RoomHandle;

/// Characters room codes are drawn from.
const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a room code.
pub const ROOM_ID_LEN: usize = 6;

/// Keyed room storage. Every operation is atomic.
pub trait RoomDirectory: Send + Sync + 'static {
    /// Stores a room, replacing any room with the same id.
    fn save(&self, room: RoomHandle) -> impl Future<Output = ()> + Send;

    /// Stores a room only if its id is free. Returns `false` on collision.
    fn insert_new(&self, room: RoomHandle) -> impl Future<Output = bool> + Send;

    fn find_by_id(&self, id: &RoomId) -> impl Future<Output = Option<RoomHandle>> + Send;

    /// Removes a room and returns it.
    fn delete(&self, id: &RoomId) -> impl Future<Output = Option<RoomHandle>> + Send;

    fn list_all(&self) -> impl Future<Output = Vec<RoomHandle>> + Send;
}

/// A [`RoomDirectory`] backed by a `HashMap` behind an async `RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryRoomDirectory {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
}

impl InMemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

impl RoomDirectory for InMemoryRoomDirectory {
    async fn save(&self, room: RoomHandle) {
        self.rooms.write().await.insert(room.room_id().clone(), room);
    }

    async fn insert_new(&self, room: RoomHandle) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room.room_id()) {
            return false;
        }
        rooms.insert(room.room_id().clone(), room);
        true
    }

    async fn find_by_id(&self, id: &RoomId) -> Option<RoomHandle> {
        self.rooms.read().await.get(id).cloned()
    }

    async fn delete(&self, id: &RoomId) -> Option<RoomHandle> {
        let removed = self.rooms.write().await.remove(id);
        if removed.is_some() {
            tracing::info!(room_id = %id, "room deleted");
        }
        removed
    }

    async fn list_all(&self) -> Vec<RoomHandle> {
        self.rooms.read().await.values().cloned().collect()
    }
}

/// Generates a random room code, e.g. `"K7Q2ZD"`.
pub fn generate_room_id() -> RoomId {
    let mut rng = rand::rng();
    let code = (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.random_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect();
    RoomId(code)
}
