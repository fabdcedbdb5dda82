//! Process-wide registry of rooms.
//!
//! Each room sits behind its own async mutex, which is the single
//! serialization point for every read and mutation of that room. The
//! registry map itself is only locked to look a room up or create it,
//! so different rooms never contend with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, RwLock};

use crate::protocol::FileId;
use crate::room::{Room, SEED_FILE_ID};

/// Shared handle to one room.
pub struct RoomHandle {
    key: String,
    state: Mutex<Room>,
    /// Held for the whole duration of a commit/push.
    commit_lock: Arc<Mutex<()>>,
}

impl RoomHandle {
    fn new(key: String) -> Self {
        Self {
            state: Mutex::new(Room::new(key.clone())),
            key,
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enter the room's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, Room> {
        self.state.lock().await
    }

    /// Wait for exclusive use of the room's repository.
    pub async fn lock_commits(&self) -> OwnedMutexGuard<()> {
        self.commit_lock.clone().lock_owned().await
    }

    /// Whether a commit currently holds the repository.
    pub fn commit_in_flight(&self) -> bool {
        self.commit_lock.try_lock().is_err()
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Registry mapping normalized room keys to rooms.
pub struct RoomStore {
    rooms: RwLock<HashMap<String, Arc<RoomHandle>>>,
    next_file_id: AtomicU64,
    next_chat_id: AtomicU64,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_file_id: AtomicU64::new(SEED_FILE_ID + 1),
            next_chat_id: AtomicU64::new(1),
        }
    }

    /// Canonical form of a caller-supplied room id: trimmed, upper-case.
    pub fn normalize_key(raw: &str) -> Option<String> {
        let key = raw.trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_uppercase())
        }
    }

    /// Get or lazily create a room. The flag is `true` if it was created.
    pub async fn get_or_create(&self, key: &str) -> (Arc<RoomHandle>, bool) {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return (room.clone(), false);
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(key) {
            return (room.clone(), false);
        }

        let room = Arc::new(RoomHandle::new(key.to_string()));
        rooms.insert(key.to_string(), room.clone());
        log::info!("Room {key} created");
        (room, true)
    }

    /// Look up an existing room.
    pub async fn get(&self, key: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.read().await.get(key).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_keys(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Allocate a file id, unique across the process.
    pub fn next_file_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a chat message id, unique across the process.
    pub fn next_chat_id(&self) -> u64 {
        self.next_chat_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop rooms that have been empty for longer than `ttl`.
    ///
    /// Rooms that are busy (locked, or with a commit in flight) are left
    /// for the next sweep. Returns the evicted keys.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut evicted = Vec::new();

        rooms.retain(|key, handle| {
            if handle.commit_in_flight() {
                return true;
            }
            let Ok(mut room) = handle.state.try_lock() else {
                return true;
            };
            match room.idle_for() {
                Some(idle) if idle >= ttl => {
                    room.mark_evicted();
                    evicted.push(key.clone());
                    false
                }
                _ => true,
            }
        });

        for key in &evicted {
            log::info!("Room {key} evicted after {}s without users", ttl.as_secs());
        }
        evicted
    }
}
