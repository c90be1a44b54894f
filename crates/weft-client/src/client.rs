//! The client: session lifecycle, room list and façade operations.
//!
//! The `Client` exclusively owns the rooms, account data, presences, the
//! device-key tracker, the broadcast streams and the encryption subsystem.
//! The database is borrowed for the session's duration through an `Arc`.
//! Rooms and events reference each other by ID (arena style), never by
//! pointer.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;
use weft_types::{is_valid_matrix_id, Event, EventStatus, Membership};

use crate::{
    api::{MatrixApi, Profile, ARCHIVE_SYNC_FILTER},
    database::{Database, StoredClient},
    device_keys::{DeviceKeyTracker, DeviceKeys, DeviceKeysList},
    encryption::Encryption,
    env::Environment,
    error::{BasicEvent, ClientError, DecryptionError},
    room::Room,
    streams::{emit, Streams},
    sync::StoreOp,
};

/// Spec versions this client can talk to.
const SUPPORTED_VERSIONS: [&str; 2] = ["r0.5.0", "r0.6.0"];

/// Login state transitions broadcast on the login-state stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// A session is active.
    Logged,
    /// The session ended (logout, cleared, or token invalidated).
    LoggedOut,
}

/// Static configuration of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name the session is stored under in the database.
    pub client_name: String,
    /// Whether the sync loop reschedules itself after each pass.
    pub background_sync: bool,
    /// Sort rooms with unread notifications before read ones.
    pub pin_unread_rooms: bool,
    /// Backoff between sync iterations after a failure.
    pub sync_error_timeout: Duration,
    /// Capacity of each broadcast stream.
    pub stream_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "weft".to_string(),
            background_sync: true,
            pin_unread_rooms: false,
            sync_error_timeout: Duration::from_secs(30),
            stream_capacity: 256,
        }
    }
}

/// A left room materialized by [`Client::archive`], detached from the live
/// model.
#[derive(Debug, Clone)]
pub struct ArchivedRoom {
    /// The room with its last known state applied.
    pub room: Room,
    /// The last timeline events before leaving.
    pub timeline: Vec<Event>,
}

/// The push rule set stored under the `m.push_rules` account data.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PushRuleSet {
    /// Override rules.
    #[serde(default, rename = "override")]
    pub override_rules: Vec<PushRule>,
    /// Content rules.
    #[serde(default)]
    pub content: Vec<PushRule>,
    /// Per-room rules.
    #[serde(default)]
    pub room: Vec<PushRule>,
    /// Per-sender rules.
    #[serde(default)]
    pub sender: Vec<PushRule>,
    /// Underride rules.
    #[serde(default)]
    pub underride: Vec<PushRule>,
}

/// One push rule.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PushRule {
    /// Rule ID.
    pub rule_id: String,
    /// Whether this is a server-default rule.
    #[serde(default)]
    pub default: bool,
    /// Whether the rule is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Actions taken when the rule matches.
    #[serde(default)]
    pub actions: Vec<Value>,
    /// Match conditions.
    #[serde(default)]
    pub conditions: Vec<Value>,
    /// Glob pattern (content rules).
    #[serde(default)]
    pub pattern: Option<String>,
}

/// A client session against one homeserver.
pub struct Client {
    config: ClientConfig,
    api: Arc<dyn MatrixApi>,
    db: Option<Arc<dyn Database>>,
    encryption: Option<Box<dyn Encryption>>,
    env: Arc<dyn Environment>,
    streams: Streams,

    client_id: Option<i64>,
    homeserver: Option<Url>,
    access_token: Option<String>,
    user_id: Option<String>,
    device_id: Option<String>,
    device_name: Option<String>,
    prev_batch: Option<String>,

    rooms: Vec<Room>,
    account_data: HashMap<String, BasicEvent>,
    presences: HashMap<String, Value>,
    pub(crate) device_keys: DeviceKeyTracker,
    profile_cache: HashMap<String, Profile>,

    pending_store_ops: Vec<StoreOp>,
    txn_counter: u64,
    first_sync_done: bool,
    sync_in_flight: bool,
    sorting: bool,
    disposed: bool,
}

impl Client {
    /// Create a client over the given capabilities.
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn MatrixApi>,
        db: Option<Arc<dyn Database>>,
        encryption: Option<Box<dyn Encryption>>,
        env: Arc<dyn Environment>,
    ) -> Self {
        let streams = Streams::new(config.stream_capacity);
        Self {
            config,
            api,
            db,
            encryption,
            env,
            streams,
            client_id: None,
            homeserver: None,
            access_token: None,
            user_id: None,
            device_id: None,
            device_name: None,
            prev_batch: None,
            rooms: Vec::new(),
            account_data: HashMap::new(),
            presences: HashMap::new(),
            device_keys: DeviceKeyTracker::default(),
            profile_cache: HashMap::new(),
            pending_store_ops: Vec::new(),
            txn_counter: 0,
            first_sync_done: false,
            sync_in_flight: false,
            sorting: false,
            disposed: false,
        }
    }

    // --- accessors -------------------------------------------------------

    /// The broadcast streams.
    pub fn streams(&self) -> &Streams {
        &self.streams
    }

    /// Rooms, in the current sort order.
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    /// Look up a room by ID.
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|room| room.room_id == room_id)
    }

    /// Global account data, keyed by type.
    pub fn account_data(&self) -> &HashMap<String, BasicEvent> {
        &self.account_data
    }

    /// Last seen presence per user.
    pub fn presences(&self) -> &HashMap<String, Value> {
        &self.presences
    }

    /// Tracked device-key lists, keyed by user ID.
    pub fn user_device_keys(&self) -> &HashMap<String, DeviceKeysList> {
        self.device_keys.keys()
    }

    /// Whether a session is active.
    pub fn is_logged(&self) -> bool {
        self.access_token.is_some() && self.homeserver.is_some() && self.user_id.is_some()
    }

    /// The logged-in user.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// This session's device ID.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// The homeserver this session talks to.
    pub fn homeserver(&self) -> Option<&Url> {
        self.homeserver.as_ref()
    }

    /// The current sync position.
    pub fn prev_batch(&self) -> Option<&str> {
        self.prev_batch.as_deref()
    }

    /// Whether the first sync of this session completed.
    pub fn first_sync_done(&self) -> bool {
        self.first_sync_done
    }

    /// Whether `dispose` was called.
    pub fn disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn api(&self) -> Arc<dyn MatrixApi> {
        Arc::clone(&self.api)
    }

    pub(crate) fn db(&self) -> Option<Arc<dyn Database>> {
        self.db.clone()
    }

    pub(crate) fn env(&self) -> Arc<dyn Environment> {
        Arc::clone(&self.env)
    }

    pub(crate) fn encryption(&self) -> Option<&dyn Encryption> {
        self.encryption.as_deref()
    }

    pub(crate) fn encryption_mut(&mut self) -> Option<&mut (dyn Encryption + 'static)> {
        self.encryption.as_deref_mut()
    }

    pub(crate) fn client_id(&self) -> Option<i64> {
        self.client_id
    }

    pub(crate) fn sync_in_flight(&self) -> bool {
        self.sync_in_flight
    }

    pub(crate) fn set_sync_in_flight(&mut self, in_flight: bool) {
        self.sync_in_flight = in_flight;
    }

    pub(crate) fn set_prev_batch(&mut self, prev_batch: Option<String>) {
        self.prev_batch = prev_batch;
    }

    pub(crate) fn set_first_sync_done(&mut self) {
        self.first_sync_done = true;
    }

    pub(crate) fn set_presence(&mut self, user_id: &str, presence: Value) {
        self.presences.insert(user_id.to_string(), presence);
    }

    pub(crate) fn set_account_data(&mut self, event: BasicEvent) {
        self.account_data.insert(event.event_type.clone(), event);
    }

    pub(crate) fn pending_store_ops_mut(&mut self) -> &mut Vec<StoreOp> {
        &mut self.pending_store_ops
    }

    pub(crate) fn room_index(&self, room_id: &str) -> Option<usize> {
        self.rooms.iter().position(|room| room.room_id == room_id)
    }

    pub(crate) fn room_slot(&mut self, index: usize) -> &mut Room {
        &mut self.rooms[index]
    }

    pub(crate) fn insert_room_front(&mut self, room: Room) {
        self.rooms.insert(0, room);
    }

    pub(crate) fn push_room(&mut self, room: Room) {
        self.rooms.push(room);
    }

    pub(crate) fn remove_room(&mut self, index: usize) -> Room {
        self.rooms.remove(index)
    }

    /// Whether `room_id` is one of the user's direct chats (`m.direct`).
    pub fn is_direct_room(&self, room_id: &str) -> bool {
        self.account_data
            .get("m.direct")
            .and_then(|event| event.content.as_object())
            .is_some_and(|by_user| {
                by_user.values().any(|rooms| {
                    rooms
                        .as_array()
                        .is_some_and(|ids| ids.iter().any(|id| id.as_str() == Some(room_id)))
                })
            })
    }

    // --- session lifecycle ----------------------------------------------

    /// Hydrate the session from the store, initialise encryption and
    /// persist the session row.
    ///
    /// After a fresh `login`/`register` the in-memory credentials win and
    /// the row is rewritten; otherwise the stored session is adopted.
    /// Callers drive syncing afterwards with [`Client::run_sync_loop`] or
    /// [`Client::one_shot_sync`].
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let mut pickled_account = None;

        if let Some(db) = self.db() {
            if let Some(stored) = db.get_client(&self.config.client_name)? {
                self.client_id = Some(stored.client_id);
                pickled_account = stored.pickled_olm_account.clone();
                if self.access_token.is_none() {
                    let homeserver = Url::parse(&stored.homeserver).map_err(|e| {
                        ClientError::Validation(format!("stored homeserver url: {e}"))
                    })?;
                    self.homeserver = Some(homeserver);
                    self.access_token = Some(stored.access_token);
                    self.user_id = Some(stored.user_id);
                    self.device_id = Some(stored.device_id);
                    self.device_name = stored.device_name;
                    self.prev_batch = stored.prev_batch;
                }
            }
        }

        if !self.is_logged() {
            return Err(ClientError::State("no session to connect".to_string()));
        }

        if let Some(encryption) = self.encryption.as_mut() {
            encryption.init(pickled_account).await?;
        }
        self.persist_session_row()?;

        if let (Some(db), Some(client_id)) = (self.db(), self.client_id) {
            self.rooms = db
                .get_room_list(client_id, false)?
                .iter()
                .map(Room::from_stored)
                .collect();
            self.account_data = db.get_account_data(client_id)?;
            self.device_keys.load(db.get_user_device_keys(client_id)?);
        }

        debug!(user_id = ?self.user_id, rooms = self.rooms.len(), "session connected");
        emit(&self.streams.login_state, LoginState::Logged);
        Ok(())
    }

    fn persist_session_row(&mut self) -> Result<(), ClientError> {
        let Some(db) = self.db() else {
            return Ok(());
        };
        let row = StoredClient {
            client_id: self.client_id.unwrap_or_default(),
            name: self.config.client_name.clone(),
            homeserver: self.homeserver.as_ref().map(Url::to_string).unwrap_or_default(),
            access_token: self.access_token.clone().unwrap_or_default(),
            user_id: self.user_id.clone().unwrap_or_default(),
            device_id: self.device_id.clone().unwrap_or_default(),
            device_name: self.device_name.clone(),
            prev_batch: self.prev_batch.clone(),
            pickled_olm_account: self
                .encryption
                .as_ref()
                .and_then(|encryption| encryption.pickled_olm_account()),
        };
        match self.client_id {
            Some(_) => db.update_client(&row)?,
            None => self.client_id = Some(db.insert_client(&row)?),
        }
        Ok(())
    }

    /// Password login, then [`Client::connect`].
    pub async fn login(
        &mut self,
        user: &str,
        password: &str,
        initial_device_name: Option<&str>,
    ) -> Result<(), ClientError> {
        if self.homeserver.is_none() {
            return Err(ClientError::State("no homeserver set".to_string()));
        }
        let api = self.api();
        let response = api.login(user, password, initial_device_name).await?;
        let (Some(access_token), Some(device_id), Some(user_id)) =
            (response.access_token, response.device_id, response.user_id)
        else {
            return Err(ClientError::State(
                "login response is missing access_token, device_id or user_id".to_string(),
            ));
        };
        self.access_token = Some(access_token);
        self.device_id = Some(device_id);
        self.user_id = Some(user_id);
        self.device_name = initial_device_name.map(str::to_string);
        self.connect().await
    }

    /// Account registration, then [`Client::connect`].
    pub async fn register(
        &mut self,
        user: Option<&str>,
        password: &str,
        initial_device_name: Option<&str>,
    ) -> Result<(), ClientError> {
        if self.homeserver.is_none() {
            return Err(ClientError::State("no homeserver set".to_string()));
        }
        let api = self.api();
        let response = api.register(user, password, initial_device_name).await?;
        let (Some(access_token), Some(device_id), Some(user_id)) =
            (response.access_token, response.device_id, response.user_id)
        else {
            return Err(ClientError::State(
                "register response is missing access_token, device_id or user_id".to_string(),
            ));
        };
        self.access_token = Some(access_token);
        self.device_id = Some(device_id);
        self.user_id = Some(user_id);
        self.device_name = initial_device_name.map(str::to_string);
        self.connect().await
    }

    /// Invalidate this session's token. The local session is cleared even
    /// when the API call fails.
    pub async fn logout(&mut self) -> Result<(), ClientError> {
        let api = self.api();
        let result = api.logout().await;
        self.clear().await?;
        result.map_err(ClientError::from)
    }

    /// Invalidate all of the user's tokens. The local session is cleared
    /// even when the API call fails.
    pub async fn logout_all(&mut self) -> Result<(), ClientError> {
        let api = self.api();
        let result = api.logout_all().await;
        self.clear().await?;
        result.map_err(ClientError::from)
    }

    /// Drop the session in memory and in the database, dispose encryption,
    /// and emit `LoggedOut`.
    pub async fn clear(&mut self) -> Result<(), ClientError> {
        if !self.is_logged() && self.client_id.is_none() {
            return Ok(());
        }
        if let (Some(db), Some(client_id)) = (self.db(), self.client_id) {
            db.clear(client_id)?;
        }
        self.client_id = None;
        self.homeserver = None;
        self.access_token = None;
        self.user_id = None;
        self.device_id = None;
        self.device_name = None;
        self.prev_batch = None;
        self.rooms.clear();
        self.account_data.clear();
        self.presences.clear();
        self.profile_cache.clear();
        self.device_keys.clear();
        self.pending_store_ops.clear();
        self.first_sync_done = false;
        if let Some(encryption) = self.encryption.as_mut() {
            encryption.dispose();
        }
        emit(&self.streams.login_state, LoginState::LoggedOut);
        Ok(())
    }

    /// Stop the client. The sync loop bails at its next resume point; no
    /// further stream values are emitted afterwards.
    pub fn dispose(&mut self) {
        self.disposed = true;
        if let Some(encryption) = self.encryption.as_mut() {
            encryption.dispose();
        }
    }

    /// Normalize and probe a homeserver URL.
    ///
    /// Succeeds iff the server advertises one of the supported spec
    /// versions and offers `m.login.password`. On success the homeserver is
    /// set for the session; on failure it is reset.
    pub async fn check_server(&mut self, url: &str) -> Result<(), ClientError> {
        let normalized = url.trim().trim_end_matches('/');
        let parsed = Url::parse(normalized)
            .map_err(|e| ClientError::Validation(format!("homeserver url: {e}")))?;
        self.homeserver = Some(parsed);

        let api = self.api();
        let check = async {
            let versions = api.request_supported_versions().await?;
            if !versions
                .versions
                .iter()
                .any(|version| SUPPORTED_VERSIONS.contains(&version.as_str()))
            {
                return Err(ClientError::Validation(format!(
                    "homeserver supports none of {SUPPORTED_VERSIONS:?}"
                )));
            }
            let login_types = api.request_login_types().await?;
            if !login_types.flows.iter().any(|flow| flow.flow_type == "m.login.password") {
                return Err(ClientError::Validation(
                    "homeserver does not offer m.login.password".to_string(),
                ));
            }
            Ok(())
        }
        .await;

        if check.is_err() {
            self.homeserver = None;
        }
        check
    }

    // --- profiles --------------------------------------------------------

    /// The own user's profile. Derived locally when every room agrees on
    /// the user's member event; fetched otherwise.
    pub async fn own_profile(&mut self) -> Result<Profile, ClientError> {
        let user_id =
            self.user_id.clone().ok_or_else(|| ClientError::State("not logged in".to_string()))?;
        let profiles: Vec<Profile> = self
            .rooms
            .iter()
            .filter_map(|room| room.get_state("m.room.member", &user_id))
            .map(profile_from_member_event)
            .collect();
        if let Some(first) = profiles.first() {
            if profiles.iter().all(|profile| profile == first) {
                return Ok(first.clone());
            }
        }
        let api = self.api();
        Ok(api.request_profile(&user_id).await?)
    }

    /// A user's profile: optionally room-derived, then the session cache,
    /// then the API.
    pub async fn profile_from_user_id(
        &mut self,
        user_id: &str,
        get_from_rooms: bool,
        cache: bool,
    ) -> Result<Profile, ClientError> {
        if get_from_rooms {
            if let Some(event) =
                self.rooms.iter().find_map(|room| room.get_state("m.room.member", user_id))
            {
                return Ok(profile_from_member_event(event));
            }
        }
        if cache {
            if let Some(profile) = self.profile_cache.get(user_id) {
                return Ok(profile.clone());
            }
        }
        let api = self.api();
        let profile = api.request_profile(user_id).await?;
        self.profile_cache.insert(user_id.to_string(), profile.clone());
        Ok(profile)
    }

    // --- archive ---------------------------------------------------------

    /// Fetch the user's left rooms with their last state and timeline, as
    /// detached [`ArchivedRoom`]s. Live state is not modified.
    pub async fn archive(&mut self) -> Result<Vec<ArchivedRoom>, ClientError> {
        let api = self.api();
        let response = api.sync(Some(ARCHIVE_SYNC_FILTER), None, Some(0)).await?;
        let mut archive = Vec::new();
        let Some(rooms) = response.rooms else {
            return Ok(archive);
        };

        let now_ms = self.env.now_ms();
        for (room_id, update) in rooms.leave {
            let mut room = Room::new(room_id.clone(), Membership::Leave);
            if let Some(state) = &update.state {
                for payload in &state.events {
                    let mut event =
                        Event::from_json(payload, &room_id, now_ms, EventStatus::RoomState);
                    event.sort_order = room.next_new_sort_order();
                    room.set_state(event);
                }
            }
            let mut timeline = Vec::new();
            if let Some(section) = &update.timeline {
                room.prev_batch = section.prev_batch.clone();
                for payload in &section.events {
                    let mut event =
                        Event::from_json(payload, &room_id, now_ms, EventStatus::Timeline);
                    event.sort_order = room.next_new_sort_order();
                    if event.state_key.is_some() {
                        room.set_state(event.clone());
                    }
                    timeline.push(event);
                }
            }
            archive.push(ArchivedRoom { room, timeline });
        }
        Ok(archive)
    }

    // --- ignore list -----------------------------------------------------

    /// Users on the `m.ignored_user_list`.
    pub fn ignored_users(&self) -> Vec<String> {
        self.account_data
            .get("m.ignored_user_list")
            .and_then(|event| event.content.get("ignored_users"))
            .and_then(Value::as_object)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a user to the ignore list and clear the local message cache.
    pub async fn ignore_user(&mut self, user_id: &str) -> Result<(), ClientError> {
        if !is_valid_matrix_id(user_id) || !user_id.starts_with('@') {
            return Err(ClientError::Validation(format!("invalid user id: {user_id}")));
        }
        let mut ignored = self.ignored_users();
        if !ignored.iter().any(|ignored_id| ignored_id == user_id) {
            ignored.push(user_id.to_string());
        }
        self.write_ignored_users(&ignored).await
    }

    /// Remove a user from the ignore list and clear the local message
    /// cache.
    pub async fn unignore_user(&mut self, user_id: &str) -> Result<(), ClientError> {
        if !is_valid_matrix_id(user_id) || !user_id.starts_with('@') {
            return Err(ClientError::Validation(format!("invalid user id: {user_id}")));
        }
        let ignored = self.ignored_users();
        if !ignored.iter().any(|ignored_id| ignored_id == user_id) {
            return Err(ClientError::State(format!("{user_id} is not ignored")));
        }
        let remaining: Vec<String> =
            ignored.into_iter().filter(|ignored_id| ignored_id != user_id).collect();
        self.write_ignored_users(&remaining).await
    }

    async fn write_ignored_users(&mut self, ignored: &[String]) -> Result<(), ClientError> {
        let user_id =
            self.user_id.clone().ok_or_else(|| ClientError::State("not logged in".to_string()))?;
        let mut users = Map::new();
        for ignored_id in ignored {
            users.insert(ignored_id.clone(), json!({}));
        }
        let content = json!({"ignored_users": users});
        let api = self.api();
        api.set_account_data(&user_id, "m.ignored_user_list", &content).await?;
        if let (Some(db), Some(client_id)) = (self.db(), self.client_id) {
            db.clear_cache(client_id)?;
        }
        Ok(())
    }

    // --- room sorting ----------------------------------------------------

    /// Sort the room list: favourites first, then (with `pin_unread_rooms`)
    /// higher notification counts, then later creation times.
    ///
    /// No-op before the first sync, while already sorting, or with fewer
    /// than two rooms.
    pub fn sort_rooms(&mut self) {
        if !self.first_sync_done || self.sorting || self.rooms.len() < 2 {
            return;
        }
        self.sorting = true;
        let pin_unread = self.config.pin_unread_rooms;
        self.rooms.sort_by(|a, b| {
            b.favourite()
                .cmp(&a.favourite())
                .then_with(|| {
                    if pin_unread {
                        b.notification_count.cmp(&a.notification_count)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .then_with(|| b.time_created().cmp(&a.time_created()))
        });
        self.sorting = false;
    }

    // --- to-device sending ----------------------------------------------

    /// Monotone per-session transaction ID.
    pub fn generate_txn_id(&mut self) -> String {
        self.txn_counter += 1;
        format!("{}-{}-{}", self.config.client_name, self.txn_counter, self.env.now_ms())
    }

    /// Send an unencrypted to-device message to all devices of the given
    /// users.
    pub async fn send_to_devices_of_user_ids(
        &mut self,
        user_ids: &[String],
        event_type: &str,
        message: &Value,
        message_id: Option<String>,
    ) -> Result<(), ClientError> {
        let mut messages = Map::new();
        for user_id in user_ids {
            messages.insert(user_id.clone(), json!({"*": message}));
        }
        let txn_id = match message_id {
            Some(id) => id,
            None => self.generate_txn_id(),
        };
        let api = self.api();
        api.send_to_device(event_type, &txn_id, &Value::Object(messages)).await?;
        Ok(())
    }

    /// Encrypt a message per device and send it as `m.room.encrypted`.
    ///
    /// Blocked devices, this client's own device and (with `only_verified`)
    /// unverified devices are filtered out first.
    pub async fn send_to_device_encrypted(
        &mut self,
        devices: &[DeviceKeys],
        event_type: &str,
        message: &Value,
        message_id: Option<String>,
        only_verified: bool,
    ) -> Result<(), ClientError> {
        let own_user = self.user_id.clone();
        let own_device = self.device_id.clone();
        let recipients: Vec<DeviceKeys> = devices
            .iter()
            .filter(|device| !device.blocked)
            .filter(|device| {
                !(Some(device.user_id.as_str()) == own_user.as_deref()
                    && Some(device.device_id.as_str()) == own_device.as_deref())
            })
            .filter(|device| !only_verified || device.verified)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }

        let Some(encryption) = self.encryption.as_deref_mut().filter(|e| e.enabled()) else {
            return Err(DecryptionError::NotEnabled.into());
        };
        let payload = encryption.encrypt_to_device_message(&recipients, event_type, message).await?;
        let txn_id = match message_id {
            Some(id) => id,
            None => self.generate_txn_id(),
        };
        let api = self.api();
        api.send_to_device("m.room.encrypted", &txn_id, &payload).await?;
        Ok(())
    }

    // --- account ---------------------------------------------------------

    /// Change the account password.
    ///
    /// When the server answers with an interactive-auth challenge whose
    /// only flow is `m.login.password`, the request is retried once with
    /// the server's session token.
    pub async fn change_password(
        &mut self,
        new_password: &str,
        old_password: Option<&str>,
    ) -> Result<(), ClientError> {
        let user_id =
            self.user_id.clone().ok_or_else(|| ClientError::State("not logged in".to_string()))?;
        let auth = old_password.map(|old| {
            json!({"type": "m.login.password", "user": user_id, "password": old})
        });

        let api = self.api();
        match api.change_password(new_password, auth.as_ref()).await {
            Ok(()) => Ok(()),
            Err(crate::api::ApiError::Matrix(matrix))
                if matrix.requires_password_auth_only() && matrix.session.is_some() =>
            {
                let retry_auth = json!({
                    "type": "m.login.password",
                    "user": self.user_id,
                    "password": old_password,
                    "session": matrix.session,
                });
                api.change_password(new_password, Some(&retry_auth))
                    .await
                    .map_err(ClientError::from)
            },
            Err(error) => Err(error.into()),
        }
    }

    /// Upload an avatar image and set it as the user's avatar.
    pub async fn set_avatar(&mut self, bytes: Vec<u8>, filename: &str) -> Result<(), ClientError> {
        let user_id =
            self.user_id.clone().ok_or_else(|| ClientError::State("not logged in".to_string()))?;
        let api = self.api();
        let mxc = api.upload(bytes, filename).await?;
        api.set_avatar_url(&user_id, &mxc).await?;
        Ok(())
    }

    /// Redact an event.
    pub async fn redact_event(
        &mut self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<String, ClientError> {
        if !self.is_logged() {
            return Err(ClientError::State("not logged in".to_string()));
        }
        let txn_id = self.generate_txn_id();
        let api = self.api();
        Ok(api.redact_event(room_id, event_id, reason, &txn_id).await?)
    }

    // --- push rules ------------------------------------------------------

    /// The global push rule set from the `m.push_rules` account data.
    pub fn push_rules(&self) -> Option<PushRuleSet> {
        let global = self.account_data.get("m.push_rules")?.content.get("global")?;
        match serde_json::from_value(global.clone()) {
            Ok(rules) => Some(rules),
            Err(error) => {
                warn!(%error, "malformed m.push_rules account data");
                None
            },
        }
    }

    /// Enable or disable a push rule.
    pub async fn enable_push_rule(
        &mut self,
        scope: &str,
        kind: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<(), ClientError> {
        if !self.is_logged() {
            return Err(ClientError::State("not logged in".to_string()));
        }
        let api = self.api();
        api.enable_push_rule(scope, kind, rule_id, enabled).await?;
        Ok(())
    }
}

fn profile_from_member_event(event: &Event) -> Profile {
    Profile {
        displayname: event
            .content
            .get("displayname")
            .and_then(Value::as_str)
            .map(str::to_string),
        avatar_url: event.content.get("avatar_url").and_then(Value::as_str).map(str::to_string),
    }
}
