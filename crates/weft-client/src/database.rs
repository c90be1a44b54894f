//! Storage abstraction for the client core.
//!
//! Trait-based abstraction for persisting the session, rooms, events, files
//! and device keys. The trait is synchronous (no async) to maintain a clean
//! synchronous API design; implementations typically share internal state
//! via Arc, so clones access the same underlying storage.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{
    device_keys::{CrossSigningKey, DeviceKeys, DeviceKeysList},
    error::{BasicEvent, StoreError},
    update::{EventUpdate, EventUpdateKind, RoomUpdate},
};

/// Default size cap for cached attachments (10 MiB).
const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// A persisted client session row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredClient {
    /// Local row ID; ignored on insert.
    pub client_id: i64,
    /// Client name the session is stored under.
    pub name: String,
    /// Homeserver base URL.
    pub homeserver: String,
    /// Access token.
    pub access_token: String,
    /// Fully qualified user ID.
    pub user_id: String,
    /// Device ID.
    pub device_id: String,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Sync position token.
    pub prev_batch: Option<String>,
    /// Pickled encryption account blob.
    pub pickled_olm_account: Option<String>,
}

/// A persisted event row: wire JSON plus client-side bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Wire JSON of the event.
    pub payload: Value,
    /// Numeric sending status.
    pub status: i64,
    /// Sort order assigned on ingestion.
    pub sort_order: f64,
}

/// A persisted room with its current state, as returned by
/// [`Database::get_room_list`].
#[derive(Debug, Clone)]
pub struct StoredRoom {
    /// Room ID.
    pub room_id: String,
    /// Stored membership (wire form).
    pub membership: String,
    /// Pagination token.
    pub prev_batch: Option<String>,
    /// Unread highlights.
    pub highlight_count: u64,
    /// Unread notifications.
    pub notification_count: u64,
    /// Membership summary JSON, when one was stored.
    pub summary: Option<Value>,
    /// Monotone timeline cursor (newest end).
    pub new_sort_order: f64,
    /// Monotone timeline cursor (oldest end).
    pub old_sort_order: f64,
    /// Current state event rows.
    pub states: Vec<StoredEvent>,
    /// Per-room account data, keyed by type.
    pub account_data: Vec<BasicEvent>,
}

/// Storage abstraction for sessions, rooms, events, files and device keys.
///
/// Write operations issued during one sync pass are grouped by the engine
/// and flushed through [`Database::transaction`]; implementations make that
/// flush atomic.
pub trait Database: Send + Sync {
    /// Load the session row stored under `name`.
    fn get_client(&self, name: &str) -> Result<Option<StoredClient>, StoreError>;

    /// Insert a session row, returning the assigned client ID.
    fn insert_client(&self, client: &StoredClient) -> Result<i64, StoreError>;

    /// Update an existing session row.
    fn update_client(&self, client: &StoredClient) -> Result<(), StoreError>;

    /// Persist the sync position token.
    fn store_prev_batch(&self, client_id: i64, prev_batch: &str) -> Result<(), StoreError>;

    /// Persist one global account-data event.
    fn store_account_data(
        &self,
        client_id: i64,
        event_type: &str,
        content: &Value,
    ) -> Result<(), StoreError>;

    /// Persist a room-level delta.
    fn store_room_update(&self, client_id: i64, update: &RoomUpdate) -> Result<(), StoreError>;

    /// Persist a room's sort-order cursors.
    fn update_room_sort_order(
        &self,
        client_id: i64,
        room_id: &str,
        old_sort_order: f64,
        new_sort_order: f64,
    ) -> Result<(), StoreError>;

    /// Persist one event update. Ephemeral updates must not reach the store.
    fn store_event_update(&self, client_id: i64, update: &EventUpdate) -> Result<(), StoreError>;

    /// Cache a downloaded file under its content URI.
    fn store_file(&self, mxc: &str, bytes: &[u8], ts_ms: u64) -> Result<(), StoreError>;

    /// Read a cached file.
    fn get_file(&self, mxc: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drop cached files stored before `before_ts_ms`.
    fn delete_old_files(&self, before_ts_ms: u64) -> Result<(), StoreError>;

    /// Largest attachment the store accepts, in bytes.
    fn max_file_size(&self) -> usize;

    /// Persist one device key.
    fn store_user_device_key(
        &self,
        client_id: i64,
        user_id: &str,
        device_id: &str,
        key: &DeviceKeys,
    ) -> Result<(), StoreError>;

    /// Remove one device key row.
    fn remove_user_device_key(
        &self,
        client_id: i64,
        user_id: &str,
        device_id: &str,
    ) -> Result<(), StoreError>;

    /// Persist a user's `outdated` tracking flag.
    fn store_user_device_keys_info(
        &self,
        client_id: i64,
        user_id: &str,
        outdated: bool,
    ) -> Result<(), StoreError>;

    /// Persist one cross-signing key.
    fn store_user_cross_signing_key(
        &self,
        client_id: i64,
        user_id: &str,
        public_key: &str,
        key: &CrossSigningKey,
    ) -> Result<(), StoreError>;

    /// Load all tracked device-key lists.
    fn get_user_device_keys(
        &self,
        client_id: i64,
    ) -> Result<HashMap<String, DeviceKeysList>, StoreError>;

    /// Load persisted rooms with their current state. With `only_left`,
    /// return only rooms the user has left.
    fn get_room_list(&self, client_id: i64, only_left: bool)
    -> Result<Vec<StoredRoom>, StoreError>;

    /// Load all global account data.
    fn get_account_data(&self, client_id: i64) -> Result<HashMap<String, BasicEvent>, StoreError>;

    /// Load the stored member event of `user_id` in `room_id`.
    fn get_user(
        &self,
        client_id: i64,
        user_id: &str,
        room_id: &str,
    ) -> Result<Option<StoredEvent>, StoreError>;

    /// Remove one event row.
    fn remove_event(&self, client_id: i64, room_id: &str, event_id: &str)
    -> Result<(), StoreError>;

    /// Drop everything stored for this session, including the session row.
    fn clear(&self, client_id: i64) -> Result<(), StoreError>;

    /// Drop the message cache (events, room state, sync position) but keep
    /// the session and device keys.
    fn clear_cache(&self, client_id: i64) -> Result<(), StoreError>;

    /// Run `operations` atomically.
    fn transaction(
        &self,
        operations: &mut dyn FnMut(&dyn Database) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Release the underlying storage.
    fn close(&self);
}

/// In-memory database for testing, simulation and ephemeral sessions.
///
/// Uses `HashMap`s wrapped in `Arc<Mutex<_>>` so clones share the same
/// underlying storage. Operations apply immediately; [`Database::transaction`]
/// is a grouping no-op since the single mutex already serialises writers.
/// Uses `lock().expect()` which panics if the mutex is poisoned - acceptable
/// for test and in-memory use.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryDatabaseInner>>,
}

#[derive(Default)]
struct MemoryDatabaseInner {
    next_client_id: i64,
    clients: HashMap<String, StoredClient>,
    account_data: HashMap<i64, HashMap<String, Value>>,
    rooms: HashMap<i64, HashMap<String, StoredRoomRecord>>,
    events: HashMap<(i64, String), BTreeMap<String, StoredEvent>>,
    files: BTreeMap<String, (Vec<u8>, u64)>,
    device_keys: HashMap<i64, HashMap<String, DeviceKeysList>>,
}

#[derive(Debug, Clone, Default)]
struct StoredRoomRecord {
    membership: String,
    prev_batch: Option<String>,
    highlight_count: u64,
    notification_count: u64,
    summary: Option<Value>,
    new_sort_order: f64,
    old_sort_order: f64,
    states: HashMap<(String, String), StoredEvent>,
    account_data: HashMap<String, Value>,
}

impl MemoryDatabase {
    /// Create an empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back one stored event row. Test and debugging helper.
    #[allow(clippy::expect_used)]
    pub fn get_event(&self, client_id: i64, room_id: &str, event_id: &str) -> Option<StoredEvent> {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner.events.get(&(client_id, room_id.to_string()))?.get(event_id).cloned()
    }

    /// Number of cached files. Test and debugging helper.
    #[allow(clippy::expect_used)]
    pub fn file_count(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").files.len()
    }
}

#[allow(clippy::expect_used)]
impl Database for MemoryDatabase {
    fn get_client(&self, name: &str) -> Result<Option<StoredClient>, StoreError> {
        Ok(self.inner.lock().expect("mutex poisoned").clients.get(name).cloned())
    }

    fn insert_client(&self, client: &StoredClient) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.next_client_id += 1;
        let client_id = inner.next_client_id;
        let mut row = client.clone();
        row.client_id = client_id;
        inner.clients.insert(row.name.clone(), row);
        Ok(client_id)
    }

    fn update_client(&self, client: &StoredClient) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if !inner.clients.contains_key(&client.name) {
            return Err(StoreError::UnknownClient(client.name.clone()));
        }
        inner.clients.insert(client.name.clone(), client.clone());
        Ok(())
    }

    fn store_prev_batch(&self, client_id: i64, prev_batch: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        for client in inner.clients.values_mut() {
            if client.client_id == client_id {
                client.prev_batch = Some(prev_batch.to_string());
                return Ok(());
            }
        }
        Err(StoreError::UnknownClient(client_id.to_string()))
    }

    fn store_account_data(
        &self,
        client_id: i64,
        event_type: &str,
        content: &Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .account_data
            .entry(client_id)
            .or_default()
            .insert(event_type.to_string(), content.clone());
        Ok(())
    }

    fn store_room_update(&self, client_id: i64, update: &RoomUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let room = inner
            .rooms
            .entry(client_id)
            .or_default()
            .entry(update.room_id.clone())
            .or_default();
        room.membership = update.membership.as_str().to_string();
        room.highlight_count = update.highlight_count;
        room.notification_count = update.notification_count;
        if let Some(prev_batch) = &update.prev_batch {
            room.prev_batch = Some(prev_batch.clone());
        }
        if let Some(summary) = &update.summary {
            room.summary = serde_json::to_value(summary).ok();
        }
        Ok(())
    }

    fn update_room_sort_order(
        &self,
        client_id: i64,
        room_id: &str,
        old_sort_order: f64,
        new_sort_order: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let room = inner
            .rooms
            .entry(client_id)
            .or_default()
            .entry(room_id.to_string())
            .or_default();
        room.old_sort_order = old_sort_order;
        room.new_sort_order = new_sort_order;
        Ok(())
    }

    fn store_event_update(&self, client_id: i64, update: &EventUpdate) -> Result<(), StoreError> {
        if !update.kind.persistable() {
            return Err(StoreError::Backend("ephemeral update reached the store".to_string()));
        }
        let mut inner = self.inner.lock().expect("mutex poisoned");

        if update.kind == EventUpdateKind::AccountData {
            let room = inner
                .rooms
                .entry(client_id)
                .or_default()
                .entry(update.room_id.clone())
                .or_default();
            room.account_data.insert(
                update.event_type.clone(),
                update.content.get("content").cloned().unwrap_or(Value::Null),
            );
            return Ok(());
        }

        let status = match update.kind {
            EventUpdateKind::State | EventUpdateKind::InviteState => 3,
            _ => 2,
        };
        let row = StoredEvent {
            payload: update.content.clone(),
            status,
            sort_order: update.sort_order,
        };

        if let Some(state_key) = update.content.get("state_key").and_then(Value::as_str) {
            let room = inner
                .rooms
                .entry(client_id)
                .or_default()
                .entry(update.room_id.clone())
                .or_default();
            room.states
                .insert((update.event_type.clone(), state_key.to_string()), row.clone());
        }

        if let Some(event_id) = update.content.get("event_id").and_then(Value::as_str) {
            inner
                .events
                .entry((client_id, update.room_id.clone()))
                .or_default()
                .insert(event_id.to_string(), row);
        }
        Ok(())
    }

    fn store_file(&self, mxc: &str, bytes: &[u8], ts_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.files.insert(mxc.to_string(), (bytes.to_vec(), ts_ms));
        Ok(())
    }

    fn get_file(&self, mxc: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.files.get(mxc).map(|(bytes, _)| bytes.clone()))
    }

    fn delete_old_files(&self, before_ts_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.files.retain(|_, (_, ts)| *ts >= before_ts_ms);
        Ok(())
    }

    fn max_file_size(&self) -> usize {
        DEFAULT_MAX_FILE_SIZE
    }

    fn store_user_device_key(
        &self,
        client_id: i64,
        user_id: &str,
        device_id: &str,
        key: &DeviceKeys,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .device_keys
            .entry(client_id)
            .or_default()
            .entry(user_id.to_string())
            .or_insert_with(|| DeviceKeysList::new(user_id))
            .device_keys
            .insert(device_id.to_string(), key.clone());
        Ok(())
    }

    fn remove_user_device_key(
        &self,
        client_id: i64,
        user_id: &str,
        device_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(list) =
            inner.device_keys.entry(client_id).or_default().get_mut(user_id)
        {
            list.device_keys.remove(device_id);
        }
        Ok(())
    }

    fn store_user_device_keys_info(
        &self,
        client_id: i64,
        user_id: &str,
        outdated: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .device_keys
            .entry(client_id)
            .or_default()
            .entry(user_id.to_string())
            .or_insert_with(|| DeviceKeysList::new(user_id))
            .outdated = outdated;
        Ok(())
    }

    fn store_user_cross_signing_key(
        &self,
        client_id: i64,
        user_id: &str,
        public_key: &str,
        key: &CrossSigningKey,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .device_keys
            .entry(client_id)
            .or_default()
            .entry(user_id.to_string())
            .or_insert_with(|| DeviceKeysList::new(user_id))
            .cross_signing_keys
            .insert(public_key.to_string(), key.clone());
        Ok(())
    }

    fn get_user_device_keys(
        &self,
        client_id: i64,
    ) -> Result<HashMap<String, DeviceKeysList>, StoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.device_keys.get(&client_id).cloned().unwrap_or_default())
    }

    fn get_room_list(
        &self,
        client_id: i64,
        only_left: bool,
    ) -> Result<Vec<StoredRoom>, StoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        let Some(rooms) = inner.rooms.get(&client_id) else {
            return Ok(Vec::new());
        };
        Ok(rooms
            .iter()
            .filter(|(_, room)| (room.membership == "leave") == only_left)
            .map(|(room_id, room)| StoredRoom {
                room_id: room_id.clone(),
                membership: room.membership.clone(),
                prev_batch: room.prev_batch.clone(),
                highlight_count: room.highlight_count,
                notification_count: room.notification_count,
                summary: room.summary.clone(),
                new_sort_order: room.new_sort_order,
                old_sort_order: room.old_sort_order,
                states: room.states.values().cloned().collect(),
                account_data: room
                    .account_data
                    .iter()
                    .map(|(event_type, content)| BasicEvent::new(event_type, content.clone()))
                    .collect(),
            })
            .collect())
    }

    fn get_account_data(&self, client_id: i64) -> Result<HashMap<String, BasicEvent>, StoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner
            .account_data
            .get(&client_id)
            .map(|data| {
                data.iter()
                    .map(|(event_type, content)| {
                        (event_type.clone(), BasicEvent::new(event_type, content.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_user(
        &self,
        client_id: i64,
        user_id: &str,
        room_id: &str,
    ) -> Result<Option<StoredEvent>, StoreError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner
            .rooms
            .get(&client_id)
            .and_then(|rooms| rooms.get(room_id))
            .and_then(|room| {
                room.states.get(&("m.room.member".to_string(), user_id.to_string()))
            })
            .cloned())
    }

    fn remove_event(
        &self,
        client_id: i64,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(events) = inner.events.get_mut(&(client_id, room_id.to_string())) {
            events.remove(event_id);
        }
        Ok(())
    }

    fn clear(&self, client_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.clients.retain(|_, client| client.client_id != client_id);
        inner.account_data.remove(&client_id);
        inner.rooms.remove(&client_id);
        inner.events.retain(|(id, _), _| *id != client_id);
        inner.device_keys.remove(&client_id);
        Ok(())
    }

    fn clear_cache(&self, client_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.events.retain(|(id, _), _| *id != client_id);
        inner.rooms.remove(&client_id);
        for client in inner.clients.values_mut() {
            if client.client_id == client_id {
                client.prev_batch = None;
            }
        }
        Ok(())
    }

    fn transaction(
        &self,
        operations: &mut dyn FnMut(&dyn Database) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        operations(self)
    }

    fn close(&self) {}
}
