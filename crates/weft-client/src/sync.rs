//! The incremental sync engine.
//!
//! Consumes sync responses and drives the in-memory room/event/state model,
//! the persistent store, the broadcast streams and the device-key tracker.
//! All store mutations of one pass are queued as [`StoreOp`]s and flushed
//! inside a single database transaction at the end of the pass; the
//! device-key refresh batches its writes in a separate transaction.

use std::{collections::HashSet, mem, sync::Arc};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use weft_types::{Event, EventStatus, Membership};

use crate::{
    api::{
        DeviceListsUpdate, InvitedRoomUpdate, JoinedRoomUpdate, LeftRoomUpdate, SyncResponse,
        DEFAULT_SYNC_FILTER,
    },
    client::Client,
    database::Database,
    encryption::ToDeviceEvent,
    error::{BasicEvent, ClientError, StoreError},
    room::Room,
    streams::{emit, OlmDecryptionFailure},
    update::{EventUpdate, EventUpdateKind, RoomUpdate},
};

/// Long-poll timeout once a sync position exists.
const SYNC_POLL_TIMEOUT_MS: u64 = 30_000;

/// Cached files older than this are pruned during each pass.
const FILE_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Timeout for device-key queries.
const DEVICE_KEY_QUERY_TIMEOUT_MS: u64 = 10_000;

/// Call-signalling event types with dedicated streams.
const CALL_EVENT_TYPES: [&str; 4] =
    ["m.call.invite", "m.call.hangup", "m.call.answer", "m.call.candidates"];

/// A store mutation queued during a sync pass.
#[derive(Debug, Clone)]
pub(crate) enum StoreOp {
    PrevBatch(String),
    AccountData { event_type: String, content: Value },
    RoomUpdate(RoomUpdate),
    RoomSortOrder { room_id: String, old_sort_order: f64, new_sort_order: f64 },
    EventUpdate(EventUpdate),
    UserDeviceKeysInfo { user_id: String, outdated: bool },
    DeleteOldFiles { before_ts_ms: u64 },
}

impl StoreOp {
    fn apply(&self, db: &dyn Database, client_id: i64) -> Result<(), StoreError> {
        match self {
            Self::PrevBatch(token) => db.store_prev_batch(client_id, token),
            Self::AccountData { event_type, content } => {
                db.store_account_data(client_id, event_type, content)
            },
            Self::RoomUpdate(update) => db.store_room_update(client_id, update),
            Self::RoomSortOrder { room_id, old_sort_order, new_sort_order } => {
                db.update_room_sort_order(client_id, room_id, *old_sort_order, *new_sort_order)
            },
            Self::EventUpdate(update) => db.store_event_update(client_id, update),
            Self::UserDeviceKeysInfo { user_id, outdated } => {
                db.store_user_device_keys_info(client_id, user_id, *outdated)
            },
            Self::DeleteOldFiles { before_ts_ms } => db.delete_old_files(*before_ts_ms),
        }
    }
}

impl Client {
    /// Run the background sync loop until logout, disposal or a caller with
    /// `background_sync` off.
    ///
    /// A follow-up pass is only scheduled when the previous iteration fully
    /// completed; the error backoff is applied between iterations only
    /// after a failure.
    pub async fn run_sync_loop(&mut self) {
        loop {
            if self.disposed() || !self.is_logged() {
                break;
            }
            let failed = self.one_shot_sync().await.is_err();
            if self.disposed() || !self.is_logged() || !self.config().background_sync {
                break;
            }
            if failed {
                let backoff = self.config().sync_error_timeout;
                self.env().sleep(backoff).await;
            }
        }
    }

    /// Perform one sync pass.
    ///
    /// Returns immediately when the client is disposed, logged out, or a
    /// sync is already in flight. Errors are routed to the error streams
    /// (protocol errors to `errors`, everything else to `sync_errors`) and
    /// also returned; an `M_UNKNOWN_TOKEN` response clears the session.
    pub async fn one_shot_sync(&mut self) -> Result<(), ClientError> {
        if self.disposed() || !self.is_logged() || self.sync_in_flight() {
            return Ok(());
        }
        self.set_sync_in_flight(true);
        let result = self.sync_pass().await;
        self.set_sync_in_flight(false);

        match result {
            Ok(()) => Ok(()),
            Err(ClientError::Matrix(matrix)) => {
                if matrix.errcode == "M_UNKNOWN_TOKEN" {
                    if let Err(clear_error) = self.clear().await {
                        warn!(%clear_error, "failed to clear session after M_UNKNOWN_TOKEN");
                    }
                }
                emit(&self.streams().error, matrix.clone());
                Err(ClientError::Matrix(matrix))
            },
            Err(error) => {
                emit(&self.streams().sync_error, error.clone());
                Err(error)
            },
        }
    }

    async fn sync_pass(&mut self) -> Result<(), ClientError> {
        let since = self.prev_batch().map(str::to_string);
        let first_sync = since.is_none();
        let timeout_ms = since.as_ref().map(|_| SYNC_POLL_TIMEOUT_MS);

        let api = self.api();
        let response = api.sync(Some(DEFAULT_SYNC_FILTER), since.as_deref(), timeout_ms).await?;
        if self.disposed() {
            return Ok(());
        }

        self.handle_sync_response(&response).await?;

        if since.as_deref() != Some(response.next_batch.as_str()) {
            self.queue_store(StoreOp::PrevBatch(response.next_batch.clone()));
        }
        self.set_prev_batch(Some(response.next_batch.clone()));

        if first_sync {
            self.set_first_sync_done();
            self.sort_rooms();
            emit(&self.streams().first_sync, true);
        }

        let before_ts_ms = self.env().now_ms().saturating_sub(FILE_RETENTION_MS);
        self.queue_store(StoreOp::DeleteOldFiles { before_ts_ms });
        self.flush_store_ops()?;
        if self.disposed() {
            return Ok(());
        }

        self.update_user_device_keys().await?;
        if self.disposed() {
            return Ok(());
        }
        if let Some(encryption) = self.encryption_mut() {
            if encryption.enabled() {
                encryption.on_sync().await;
            }
        }
        Ok(())
    }

    /// Apply one sync response to the model, store queue and streams.
    ///
    /// Deterministic entry point: tests drive the engine through this
    /// method with handcrafted payloads instead of a second sync loop.
    pub async fn handle_sync_response(
        &mut self,
        response: &SyncResponse,
    ) -> Result<(), ClientError> {
        if let Some(to_device) = &response.to_device {
            self.handle_to_device_events(&to_device.events).await;
        }

        if let Some(rooms) = &response.rooms {
            for (room_id, update) in &rooms.join {
                self.handle_joined_room(room_id, update).await?;
            }
            for (room_id, update) in &rooms.invite {
                self.handle_invited_room(room_id, update).await?;
            }
            for (room_id, update) in &rooms.leave {
                self.handle_left_room(room_id, update).await?;
            }
        }
        self.sort_rooms();

        if let Some(presence) = &response.presence {
            for payload in &presence.events {
                self.handle_presence(payload);
            }
        }
        if let Some(account_data) = &response.account_data {
            for payload in &account_data.events {
                self.handle_global_account_data(payload);
            }
        }
        if let Some(device_lists) = &response.device_lists {
            self.handle_device_lists(device_lists);
        }
        if let Some(counts) = &response.device_one_time_keys_count {
            if let Some(encryption) = self.encryption_mut() {
                if encryption.enabled() {
                    encryption.handle_device_one_time_keys_count(counts).await;
                }
            }
        }

        emit(&self.streams().sync, Arc::new(response.clone()));
        Ok(())
    }

    async fn handle_joined_room(
        &mut self,
        room_id: &str,
        update: &JoinedRoomUpdate,
    ) -> Result<(), ClientError> {
        let room_update = RoomUpdate {
            room_id: room_id.to_string(),
            membership: Membership::Join,
            prev_batch: update.timeline.as_ref().and_then(|t| t.prev_batch.clone()),
            highlight_count: update.unread_notifications.map_or(0, |c| c.highlight_count),
            notification_count: update.unread_notifications.map_or(0, |c| c.notification_count),
            limited_timeline: update.timeline.as_ref().is_some_and(|t| t.limited),
            summary: update.summary.clone(),
        };
        self.apply_room_update(&room_update);

        let Some(index) = self.room_index(room_id) else {
            return Ok(());
        };
        let mut room = mem::replace(self.room_slot(index), Room::new("", Membership::Leave));
        let mut handled = 0usize;

        if let Some(state) = &update.state {
            handled += self
                .handle_room_events(&mut room, &state.events, EventUpdateKind::State)
                .await?;
        }
        if let Some(timeline) = &update.timeline {
            handled += self
                .handle_room_events(&mut room, &timeline.events, EventUpdateKind::Timeline)
                .await?;
        }
        if let Some(ephemeral) = &update.ephemeral {
            handled += self
                .handle_room_events(&mut room, &ephemeral.events, EventUpdateKind::Ephemeral)
                .await?;
        }
        if let Some(account_data) = &update.account_data {
            handled += self
                .handle_room_events(&mut room, &account_data.events, EventUpdateKind::AccountData)
                .await?;
        }

        if handled > 0 {
            self.queue_store(StoreOp::RoomSortOrder {
                room_id: room.room_id.clone(),
                old_sort_order: room.old_sort_order(),
                new_sort_order: room.new_sort_order(),
            });
        }
        *self.room_slot(index) = room;
        Ok(())
    }

    async fn handle_invited_room(
        &mut self,
        room_id: &str,
        update: &InvitedRoomUpdate,
    ) -> Result<(), ClientError> {
        let room_update = RoomUpdate {
            room_id: room_id.to_string(),
            membership: Membership::Invite,
            prev_batch: None,
            highlight_count: 0,
            notification_count: 0,
            limited_timeline: false,
            summary: None,
        };
        self.apply_room_update(&room_update);

        let Some(index) = self.room_index(room_id) else {
            return Ok(());
        };
        let mut room = mem::replace(self.room_slot(index), Room::new("", Membership::Leave));
        let mut handled = 0usize;
        if let Some(invite_state) = &update.invite_state {
            handled += self
                .handle_room_events(&mut room, &invite_state.events, EventUpdateKind::InviteState)
                .await?;
        }
        if handled > 0 {
            self.queue_store(StoreOp::RoomSortOrder {
                room_id: room.room_id.clone(),
                old_sort_order: room.old_sort_order(),
                new_sort_order: room.new_sort_order(),
            });
        }
        *self.room_slot(index) = room;
        Ok(())
    }

    async fn handle_left_room(
        &mut self,
        room_id: &str,
        update: &LeftRoomUpdate,
    ) -> Result<(), ClientError> {
        let room_update = RoomUpdate {
            room_id: room_id.to_string(),
            membership: Membership::Leave,
            prev_batch: update.timeline.as_ref().and_then(|t| t.prev_batch.clone()),
            highlight_count: 0,
            notification_count: 0,
            limited_timeline: update.timeline.as_ref().is_some_and(|t| t.limited),
            summary: None,
        };
        self.queue_store(StoreOp::RoomUpdate(room_update.clone()));

        // A left room disappears from the live list; events are still
        // applied against a detached room so they persist with coherent
        // ordering.
        let mut room = match self.room_index(room_id) {
            Some(index) => self.remove_room(index),
            None => Room::new(room_id, Membership::Leave),
        };
        room.membership = Membership::Leave;
        emit(&self.streams().room_update, room_update.clone());
        if room_update.limited_timeline {
            room.reset_sort_order();
        }

        let mut handled = 0usize;
        if let Some(timeline) = &update.timeline {
            handled += self
                .handle_room_events(&mut room, &timeline.events, EventUpdateKind::Timeline)
                .await?;
        }
        if let Some(account_data) = &update.account_data {
            handled += self
                .handle_room_events(&mut room, &account_data.events, EventUpdateKind::AccountData)
                .await?;
        }
        if let Some(state) = &update.state {
            handled += self
                .handle_room_events(&mut room, &state.events, EventUpdateKind::State)
                .await?;
        }
        if handled > 0 {
            self.queue_store(StoreOp::RoomSortOrder {
                room_id: room.room_id.clone(),
                old_sort_order: room.old_sort_order(),
                new_sort_order: room.new_sort_order(),
            });
        }
        Ok(())
    }

    /// Insert, update or remove the in-memory room for a room-level delta,
    /// persist the delta, and broadcast it.
    fn apply_room_update(&mut self, update: &RoomUpdate) {
        self.queue_store(StoreOp::RoomUpdate(update.clone()));

        match self.room_index(&update.room_id) {
            None => {
                if update.membership != Membership::Leave {
                    let mut room = Room::new(update.room_id.clone(), update.membership);
                    room.prev_batch = update.prev_batch.clone();
                    room.highlight_count = update.highlight_count;
                    room.notification_count = update.notification_count;
                    room.summary = update.summary.clone();
                    if update.membership == Membership::Invite {
                        self.insert_room_front(room);
                    } else {
                        self.push_room(room);
                    }
                }
            },
            Some(index) if update.membership == Membership::Leave => {
                self.remove_room(index);
            },
            Some(index) => {
                let room = self.room_slot(index);
                room.membership = update.membership;
                room.highlight_count = update.highlight_count;
                room.notification_count = update.notification_count;
                if let Some(prev_batch) = &update.prev_batch {
                    room.prev_batch = Some(prev_batch.clone());
                }
                if let Some(summary) = &update.summary {
                    room.summary = Some(summary.clone());
                }
            },
        }

        emit(&self.streams().room_update, update.clone());

        if update.limited_timeline {
            if let Some(index) = self.room_index(&update.room_id) {
                self.room_slot(index).reset_sort_order();
            }
        }
    }

    /// Dispatch one section's events into a room. Returns how many events
    /// were persisted.
    async fn handle_room_events(
        &mut self,
        room: &mut Room,
        events: &[Value],
        kind: EventUpdateKind,
    ) -> Result<usize, ClientError> {
        let mut handled = 0usize;
        for payload in events {
            if self.handle_event(room, payload, kind).await? {
                handled += 1;
            }
            if kind == EventUpdateKind::Ephemeral
                && payload.get("type").and_then(Value::as_str) == Some("m.receipt")
            {
                let synthesized = self.synthesize_receipts(room, payload);
                if self.handle_event(room, &synthesized, EventUpdateKind::AccountData).await? {
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    /// Handle a single event of a room delta.
    ///
    /// Returns `true` when the event was persisted. Events with a
    /// non-string `type` or non-object `content` are skipped.
    async fn handle_event(
        &mut self,
        room: &mut Room,
        payload: &Value,
        kind: EventUpdateKind,
    ) -> Result<bool, ClientError> {
        let Some(event_type) = payload.get("type").and_then(Value::as_str) else {
            warn!(room_id = %room.room_id, "skipping event without a string type");
            return Ok(false);
        };
        if !payload.get("content").is_some_and(Value::is_object) {
            warn!(room_id = %room.room_id, %event_type, "skipping event without object content");
            return Ok(false);
        }

        // A room's encryption is write-once: never replace an existing
        // algorithm with a different one (anti-downgrade).
        if event_type == "m.room.encryption" {
            if let Some(stored) = room.encryption_algorithm() {
                let announced = payload
                    .get("content")
                    .and_then(|c| c.get("algorithm"))
                    .and_then(Value::as_str);
                if announced != Some(stored) {
                    warn!(
                        room_id = %room.room_id,
                        ?announced,
                        %stored,
                        "ignoring encryption algorithm downgrade"
                    );
                    return Ok(false);
                }
            }
        }

        let sort_order = match kind {
            EventUpdateKind::Ephemeral => 0.0,
            EventUpdateKind::History => room.next_old_sort_order(),
            _ => room.next_new_sort_order(),
        };

        let mut update = EventUpdate {
            room_id: room.room_id.clone(),
            kind,
            event_type: event_type.to_string(),
            content: payload.clone(),
            sort_order,
        };

        if update.event_type == "m.room.encrypted" {
            if let Some(encryption) = self.encryption_mut() {
                if encryption.enabled() {
                    update = encryption.decrypt_event_update(&update).await;
                }
            }
        }

        // Lazy-loaded members: a message from a sender without member state
        // hydrates that member from the store before dispatch.
        if update.event_type == "m.room.message" && !self.is_direct_room(&room.room_id) {
            if let Some(sender) = update.content.get("sender").and_then(Value::as_str) {
                if room.get_state("m.room.member", sender).is_none() {
                    self.hydrate_member(room, sender);
                }
            }
        }

        if update.kind.persistable() {
            self.queue_store(StoreOp::EventUpdate(update.clone()));
        }

        match update.kind {
            EventUpdateKind::Timeline
            | EventUpdateKind::State
            | EventUpdateKind::History
            | EventUpdateKind::InviteState => {
                let status = match update.kind {
                    EventUpdateKind::State | EventUpdateKind::InviteState => {
                        EventStatus::RoomState
                    },
                    _ => EventStatus::Timeline,
                };
                let now_ms = self.env().now_ms();
                let mut event = Event::from_json(&update.content, &room.room_id, now_ms, status);
                event.sort_order = update.sort_order;
                if event.event_type == "m.room.redaction" {
                    room.apply_redaction(&event);
                } else if event.state_key.is_some() {
                    room.set_state(event);
                }
            },
            EventUpdateKind::AccountData => {
                room.room_account_data.insert(
                    update.event_type.clone(),
                    BasicEvent::new(
                        &update.event_type,
                        update.content.get("content").cloned().unwrap_or(Value::Null),
                    ),
                );
            },
            EventUpdateKind::Ephemeral => {
                room.ephemerals.insert(
                    update.event_type.clone(),
                    BasicEvent::new(
                        &update.event_type,
                        update.content.get("content").cloned().unwrap_or(Value::Null),
                    ),
                );
            },
        }

        if let Some(encryption) = self.encryption_mut() {
            if encryption.enabled() {
                encryption.handle_event_update(&update).await;
            }
        }
        emit(&self.streams().event, update.clone());

        if update.kind == EventUpdateKind::Timeline
            && self.first_sync_done()
            && CALL_EVENT_TYPES.contains(&update.event_type.as_str())
        {
            let now_ms = self.env().now_ms();
            let mut event =
                Event::from_json(&update.content, &room.room_id, now_ms, EventStatus::Timeline);
            event.sort_order = update.sort_order;
            let stream = match update.event_type.as_str() {
                "m.call.invite" => &self.streams().call_invite,
                "m.call.hangup" => &self.streams().call_hangup,
                "m.call.answer" => &self.streams().call_answer,
                _ => &self.streams().call_candidates,
            };
            emit(stream, event);
        }

        Ok(update.kind.persistable())
    }

    /// Merge a receipt delta into the synthesized flat `m.receipt` room
    /// account-data map (`user -> {event_id, ts}`).
    fn synthesize_receipts(&self, room: &Room, payload: &Value) -> Value {
        let mut receipts = room
            .room_account_data
            .get("m.receipt")
            .map(|entry| entry.content.clone())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));

        if let Some(by_event) = payload.get("content").and_then(Value::as_object) {
            for (event_id, kinds) in by_event {
                let Some(read) = kinds.get("m.read").and_then(Value::as_object) else {
                    continue;
                };
                for (user_id, data) in read {
                    if let Some(map) = receipts.as_object_mut() {
                        // A user has at most one read receipt; drop any
                        // previous position before upserting.
                        map.remove(user_id);
                        map.insert(
                            user_id.clone(),
                            json!({
                                "event_id": event_id,
                                "ts": data.get("ts").cloned().unwrap_or(Value::Null),
                            }),
                        );
                    }
                }
            }
        }

        json!({"type": "m.receipt", "content": receipts})
    }

    async fn handle_to_device_events(&mut self, events: &[Value]) {
        for payload in events {
            let Some(event_type) = payload.get("type").and_then(Value::as_str) else {
                warn!("skipping to-device event without a string type");
                continue;
            };
            let sender = payload.get("sender").and_then(Value::as_str).unwrap_or_default();
            let mut event = ToDeviceEvent {
                sender: sender.to_string(),
                event_type: event_type.to_string(),
                content: payload
                    .get("content")
                    .filter(|v| v.is_object())
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
            };

            if event.event_type == "m.room.encrypted" {
                let decrypted = match self.encryption_mut() {
                    Some(encryption) if encryption.enabled() => {
                        Some(encryption.decrypt_to_device_event(&event).await)
                    },
                    _ => None,
                };
                match decrypted {
                    Some(Ok(plaintext)) => event = plaintext,
                    Some(Err(error)) => {
                        // Keep delivering the ciphertext event downstream.
                        debug!(%error, "to-device decryption failed");
                        emit(&self.streams().olm_error, OlmDecryptionFailure {
                            error,
                            event: event.clone(),
                        });
                    },
                    None => {},
                }
            }

            if let Some(encryption) = self.encryption_mut() {
                encryption.handle_to_device_event(&event).await;
            }

            match event.event_type.as_str() {
                "m.room_key_request" => {
                    emit(&self.streams().room_key_request, event.clone());
                },
                t if t.starts_with("m.key.verification.") => {
                    emit(&self.streams().key_verification_request, event.clone());
                },
                _ => {},
            }
            emit(&self.streams().to_device, event);
        }
    }

    fn handle_presence(&mut self, payload: &Value) {
        if let Some(sender) = payload.get("sender").and_then(Value::as_str) {
            self.set_presence(sender, payload.clone());
        }
        emit(&self.streams().presence, payload.clone());
    }

    fn handle_global_account_data(&mut self, payload: &Value) {
        let Some(event_type) = payload.get("type").and_then(Value::as_str) else {
            warn!("skipping account-data event without a string type");
            return;
        };
        let content = payload.get("content").cloned().unwrap_or(Value::Null);
        let event = BasicEvent::new(event_type, content.clone());
        self.set_account_data(event.clone());
        self.queue_store(StoreOp::AccountData { event_type: event_type.to_string(), content });
        emit(&self.streams().account_data, event);
    }

    fn handle_device_lists(&mut self, device_lists: &DeviceListsUpdate) {
        for user_id in &device_lists.changed {
            if self.device_keys.mark_user_outdated(user_id) {
                self.queue_store(StoreOp::UserDeviceKeysInfo {
                    user_id: user_id.clone(),
                    outdated: true,
                });
            }
        }
        for user_id in &device_lists.left {
            self.device_keys.forget_user(user_id);
        }
    }

    /// Refresh outdated device-key lists for all tracked users.
    ///
    /// Tracked users are the participants (joined or invited) of every
    /// encrypted room, plus the local user. Users whose homeserver failed a
    /// key query within the backoff window are skipped this round.
    pub(crate) async fn update_user_device_keys(&mut self) -> Result<(), ClientError> {
        let Some(own_user) = self.user_id().map(str::to_string) else {
            return Ok(());
        };

        let mut tracked: HashSet<String> = HashSet::from([own_user.clone()]);
        for room in self.rooms() {
            if !room.encrypted() {
                continue;
            }
            tracked.extend(
                room.members_with_membership(&[Membership::Join, Membership::Invite])
                    .filter_map(|event| event.state_key.clone()),
            );
        }
        self.device_keys.retain_tracked(&tracked);

        let now_ms = self.env().now_ms();
        let outdated = self.device_keys.outdated_users(now_ms);
        if outdated.is_empty() {
            return Ok(());
        }

        let api = self.api();
        let response = match api.request_device_keys(&outdated, DEVICE_KEY_QUERY_TIMEOUT_MS).await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "device-key query failed");
                return Ok(());
            },
        };

        let own_device = self.device_id().map(str::to_string);
        let own_fingerprint =
            self.encryption().and_then(|encryption| encryption.fingerprint_key());
        let delta = self.device_keys.apply_query_response(
            &response,
            &own_user,
            own_device.as_deref(),
            own_fingerprint.as_deref(),
            now_ms,
        );

        if let (Some(db), Some(client_id)) = (self.db(), self.client_id()) {
            let tracker = &self.device_keys;
            db.transaction(&mut |db| {
                for (user_id, device_id) in &delta.upserted_devices {
                    if let Some(key) =
                        tracker.user(user_id).and_then(|list| list.device_keys.get(device_id))
                    {
                        db.store_user_device_key(client_id, user_id, device_id, key)?;
                    }
                }
                for (user_id, device_id) in &delta.removed_devices {
                    db.remove_user_device_key(client_id, user_id, device_id)?;
                }
                for (user_id, public_key) in &delta.upserted_cross_signing {
                    if let Some(key) = tracker
                        .user(user_id)
                        .and_then(|list| list.cross_signing_keys.get(public_key))
                    {
                        db.store_user_cross_signing_key(client_id, user_id, public_key, key)?;
                    }
                }
                for user_id in &delta.refreshed_users {
                    db.store_user_device_keys_info(client_id, user_id, false)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn hydrate_member(&mut self, room: &mut Room, user_id: &str) {
        let Some(client_id) = self.client_id() else {
            return;
        };
        let Some(db) = self.db() else {
            return;
        };
        match db.get_user(client_id, user_id, &room.room_id) {
            Ok(Some(row)) => {
                let event =
                    Event::from_store(&row.payload, &room.room_id, row.status, row.sort_order);
                room.set_state(event);
            },
            Ok(None) => {},
            Err(error) => {
                warn!(%error, %user_id, room_id = %room.room_id, "member hydration failed");
            },
        }
    }

    pub(crate) fn queue_store(&mut self, op: StoreOp) {
        if self.db().is_some() {
            self.pending_store_ops_mut().push(op);
        }
    }

    /// Flush queued store operations in one transaction.
    pub(crate) fn flush_store_ops(&mut self) -> Result<(), ClientError> {
        let ops = mem::take(self.pending_store_ops_mut());
        let (Some(db), Some(client_id)) = (self.db(), self.client_id()) else {
            return Ok(());
        };
        if ops.is_empty() {
            return Ok(());
        }
        db.transaction(&mut |db| {
            for op in &ops {
                op.apply(db, client_id)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}
