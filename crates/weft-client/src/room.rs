//! Per-room state: membership, counters, the `(type, state_key)` state
//! table and the sort-order cursors.
//!
//! State writes are monotone in sort order; a write older than the stored
//! entry is dropped. Room-level deltas are broadcast by the client on its
//! `room_update` stream rather than per-room channels (rooms are arena
//! entries keyed by ID, not independently owned objects).

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;
use weft_types::{Event, Membership};

use crate::{api::RoomSummary, database::StoredRoom, error::BasicEvent};

/// A room the client participates in (or has archived).
#[derive(Debug, Clone)]
pub struct Room {
    /// Room ID.
    pub room_id: String,
    /// Own membership in this room.
    pub membership: Membership,
    /// Pagination token marking the position before the oldest known
    /// timeline event.
    pub prev_batch: Option<String>,
    /// Unread highlights.
    pub highlight_count: u64,
    /// Unread notifications.
    pub notification_count: u64,
    /// Membership summary (heroes, member counts).
    pub summary: Option<RoomSummary>,
    /// Per-room account data, keyed by type.
    pub room_account_data: HashMap<String, BasicEvent>,
    /// Ephemeral events, keyed by type.
    pub ephemerals: HashMap<String, BasicEvent>,
    states: HashMap<String, HashMap<String, Event>>,
    new_sort_order: f64,
    old_sort_order: f64,
}

impl Room {
    /// Create an empty room.
    pub fn new(room_id: impl Into<String>, membership: Membership) -> Self {
        Self {
            room_id: room_id.into(),
            membership,
            prev_batch: None,
            highlight_count: 0,
            notification_count: 0,
            summary: None,
            room_account_data: HashMap::new(),
            ephemerals: HashMap::new(),
            states: HashMap::new(),
            new_sort_order: 0.0,
            old_sort_order: 0.0,
        }
    }

    /// Rebuild a room from its stored row.
    pub fn from_stored(stored: &StoredRoom) -> Self {
        let mut room = Self::new(stored.room_id.clone(), Membership::parse(&stored.membership));
        room.prev_batch = stored.prev_batch.clone();
        room.highlight_count = stored.highlight_count;
        room.notification_count = stored.notification_count;
        room.summary = stored
            .summary
            .as_ref()
            .and_then(|summary| serde_json::from_value(summary.clone()).ok());
        room.new_sort_order = stored.new_sort_order;
        room.old_sort_order = stored.old_sort_order;
        for row in &stored.states {
            let event =
                Event::from_store(&row.payload, &stored.room_id, row.status, row.sort_order);
            room.set_state(event);
        }
        for data in &stored.account_data {
            room.room_account_data.insert(data.event_type.clone(), data.clone());
        }
        room
    }

    /// Write a state event into the state table.
    ///
    /// Returns `false` (and leaves the table untouched) when the write is
    /// stale, i.e. an entry with the same `(type, state_key)` and a greater
    /// sort order exists.
    pub fn set_state(&mut self, event: Event) -> bool {
        let Some(state_key) = event.state_key.clone() else {
            return false;
        };
        let by_key = self.states.entry(event.event_type.clone()).or_default();
        if let Some(existing) = by_key.get(&state_key) {
            if event.sort_order < existing.sort_order {
                warn!(
                    room_id = %self.room_id,
                    event_type = %event.event_type,
                    %state_key,
                    "dropping stale state update"
                );
                return false;
            }
        }
        by_key.insert(state_key, event);
        true
    }

    /// Read a state event. `state_key` is `""` for singleton state types.
    pub fn get_state(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.states.get(event_type)?.get(state_key)
    }

    /// All state events of one type.
    pub fn states_of_type(&self, event_type: &str) -> impl Iterator<Item = &Event> {
        self.states.get(event_type).into_iter().flat_map(HashMap::values)
    }

    /// Apply a redaction to any stored state event it targets.
    pub fn apply_redaction(&mut self, redaction: &Event) {
        let Some(redacts) = redaction.content.get("redacts").and_then(Value::as_str) else {
            return;
        };
        let redacts = redacts.to_string();
        let redaction = redaction.clone();
        for by_key in self.states.values_mut() {
            for event in by_key.values_mut() {
                if event.event_id == redacts {
                    event.set_redaction_event(&redaction);
                }
            }
        }
    }

    /// Next sort order at the new (live) end of the timeline.
    pub fn next_new_sort_order(&mut self) -> f64 {
        let order = self.new_sort_order;
        self.new_sort_order += 1.0;
        order
    }

    /// Next sort order at the old (backfill) end of the timeline.
    pub fn next_old_sort_order(&mut self) -> f64 {
        self.old_sort_order -= 1.0;
        self.old_sort_order
    }

    /// Reset both cursors after a limited-timeline gap; subsequently
    /// ingested events receive fresh monotone ordering.
    pub fn reset_sort_order(&mut self) {
        self.new_sort_order = 0.0;
        self.old_sort_order = 0.0;
    }

    /// Current cursor at the new end.
    pub fn new_sort_order(&self) -> f64 {
        self.new_sort_order
    }

    /// Current cursor at the old end.
    pub fn old_sort_order(&self) -> f64 {
        self.old_sort_order
    }

    /// Membership of a user, from the state table.
    pub fn membership_of(&self, user_id: &str) -> Membership {
        self.get_state("m.room.member", user_id)
            .map_or(Membership::Leave, Event::membership)
    }

    /// Member events with the given memberships.
    pub fn members_with_membership<'a>(
        &'a self,
        memberships: &'a [Membership],
    ) -> impl Iterator<Item = &'a Event> + 'a {
        self.states_of_type("m.room.member")
            .filter(move |event| memberships.contains(&event.membership()))
    }

    /// Whether end-to-end encryption is enabled in this room.
    pub fn encrypted(&self) -> bool {
        self.encryption_algorithm().is_some()
    }

    /// The room's encryption algorithm, when enabled.
    pub fn encryption_algorithm(&self) -> Option<&str> {
        self.get_state("m.room.encryption", "")?
            .content
            .get("algorithm")
            .and_then(Value::as_str)
    }

    /// Whether the user tagged this room as favourite.
    pub fn favourite(&self) -> bool {
        self.room_account_data
            .get("m.tag")
            .and_then(|tag| tag.content.get("tags"))
            .and_then(|tags| tags.get("m.favourite"))
            .is_some()
    }

    /// Creation time of the room (the `m.room.create` timestamp).
    pub fn time_created(&self) -> u64 {
        self.get_state("m.room.create", "").map_or(0, |event| event.origin_server_ts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use weft_types::EventStatus;

    use super::*;

    fn state_event(event_type: &str, state_key: &str, content: Value, sort_order: f64) -> Event {
        let mut event = Event::from_json(
            &json!({
                "event_id": format!("${event_type}-{sort_order}"),
                "type": event_type,
                "sender": "@a:x",
                "state_key": state_key,
                "content": content,
            }),
            "!room:x",
            0,
            EventStatus::RoomState,
        );
        event.sort_order = sort_order;
        event
    }

    #[test]
    fn state_table_is_monotone_in_sort_order() {
        let mut room = Room::new("!room:x", Membership::Join);
        assert!(room.set_state(state_event("m.room.name", "", json!({"name": "first"}), 1.0)));
        assert!(room.set_state(state_event("m.room.name", "", json!({"name": "second"}), 2.0)));
        // Stale write is dropped.
        assert!(!room.set_state(state_event("m.room.name", "", json!({"name": "old"}), 1.5)));

        let state = room.get_state("m.room.name", "").unwrap();
        assert_eq!(state.content["name"], "second");
        assert_eq!(state.sort_order, 2.0);
    }

    #[test]
    fn equal_sort_order_overwrites() {
        let mut room = Room::new("!room:x", Membership::Join);
        room.set_state(state_event("m.room.topic", "", json!({"topic": "a"}), 1.0));
        assert!(room.set_state(state_event("m.room.topic", "", json!({"topic": "b"}), 1.0)));
        assert_eq!(room.get_state("m.room.topic", "").unwrap().content["topic"], "b");
    }

    #[test]
    fn events_without_state_key_are_rejected() {
        let mut room = Room::new("!room:x", Membership::Join);
        let event = Event::from_json(
            &json!({"event_id": "$1", "type": "m.room.message", "content": {}}),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert!(!room.set_state(event));
    }

    #[test]
    fn redaction_fans_out_to_matching_state() {
        let mut room = Room::new("!room:x", Membership::Join);
        let mut target = state_event("m.room.name", "", json!({"name": "secret"}), 1.0);
        target.event_id = "$target".into();
        room.set_state(target);

        let redaction = Event::from_json(
            &json!({
                "event_id": "$r",
                "type": "m.room.redaction",
                "sender": "@mod:x",
                "content": {"redacts": "$target"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        room.apply_redaction(&redaction);

        let state = room.get_state("m.room.name", "").unwrap();
        assert!(state.redacted());
        assert_eq!(state.content, json!({}));
    }

    #[test]
    fn sort_order_cursors() {
        let mut room = Room::new("!room:x", Membership::Join);
        assert_eq!(room.next_new_sort_order(), 0.0);
        assert_eq!(room.next_new_sort_order(), 1.0);
        assert_eq!(room.next_old_sort_order(), -1.0);
        assert_eq!(room.next_old_sort_order(), -2.0);
        assert_eq!(room.new_sort_order(), 2.0);
        assert_eq!(room.old_sort_order(), -2.0);

        room.reset_sort_order();
        assert_eq!(room.next_new_sort_order(), 0.0);
    }

    #[test]
    fn derived_accessors() {
        let mut room = Room::new("!room:x", Membership::Join);
        assert!(!room.encrypted());

        room.set_state(state_event(
            "m.room.encryption",
            "",
            json!({"algorithm": "m.megolm.v1.aes-sha2"}),
            1.0,
        ));
        assert_eq!(room.encryption_algorithm(), Some("m.megolm.v1.aes-sha2"));

        let mut create = state_event("m.room.create", "", json!({"creator": "@a:x"}), 0.0);
        create.origin_server_ts = 12_345;
        room.set_state(create);
        assert_eq!(room.time_created(), 12_345);

        assert!(!room.favourite());
        room.room_account_data.insert(
            "m.tag".into(),
            BasicEvent::new("m.tag", json!({"tags": {"m.favourite": {"order": 0.5}}})),
        );
        assert!(room.favourite());
    }

    #[test]
    fn membership_queries() {
        let mut room = Room::new("!room:x", Membership::Join);
        room.set_state(state_event("m.room.member", "@a:x", json!({"membership": "join"}), 1.0));
        room.set_state(state_event("m.room.member", "@b:x", json!({"membership": "invite"}), 1.0));
        room.set_state(state_event("m.room.member", "@c:x", json!({"membership": "leave"}), 1.0));

        assert_eq!(room.membership_of("@a:x"), Membership::Join);
        assert_eq!(room.membership_of("@unknown:x"), Membership::Leave);

        let participants: Vec<&str> = room
            .members_with_membership(&[Membership::Join, Membership::Invite])
            .filter_map(|event| event.state_key.as_deref())
            .collect();
        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&"@a:x"));
        assert!(participants.contains(&"@b:x"));
    }
}
