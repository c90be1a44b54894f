//! The dynamic event envelope.
//!
//! Matrix events are open-schema: `content`, `unsigned` and `prev_content`
//! are arbitrary JSON objects and are kept as [`serde_json::Value`], with
//! typed accessors at the edges (message type, relation, membership).
//! Construction never fails on malformed input; missing or mistyped fields
//! degrade to empty objects.

use serde_json::{json, Map, Value};

/// Sending status of an event, ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventStatus {
    /// Sending failed permanently.
    Error,
    /// Queued or in flight.
    Sending,
    /// Accepted by the homeserver, not yet seen in a sync.
    Sent,
    /// Received through the sync timeline.
    Timeline,
    /// Part of the room's current state.
    RoomState,
}

impl EventStatus {
    /// Numeric wire form used by the store.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Error => -1,
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Timeline => 2,
            Self::RoomState => 3,
        }
    }

    /// Parse the numeric wire form. Unknown values map to `Timeline`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            -1 => Self::Error,
            0 => Self::Sending,
            1 => Self::Sent,
            3 => Self::RoomState,
            _ => Self::Timeline,
        }
    }
}

/// Room membership state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Membership {
    /// Joined member.
    Join,
    /// Invited, not yet joined.
    Invite,
    /// Left, kicked, or never joined.
    Leave,
    /// Banned from the room.
    Ban,
}

impl Membership {
    /// Wire form of the membership.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Ban => "ban",
        }
    }

    /// Parse the wire form. Unknown values map to `Leave`.
    pub fn parse(value: &str) -> Self {
        match value {
            "join" => Self::Join,
            "invite" => Self::Invite,
            "ban" => Self::Ban,
            _ => Self::Leave,
        }
    }
}

/// A single Matrix event, timeline or state.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Opaque event ID, unique per room.
    pub event_id: String,
    /// Room the event belongs to.
    pub room_id: String,
    /// Dotted event type, e.g. `m.room.message`.
    pub event_type: String,
    /// Sender's user ID.
    pub sender_id: String,
    /// Millisecond-epoch origin timestamp. Never zero after construction
    /// from a live sync; events without one are stamped on receipt.
    pub origin_server_ts: u64,
    /// Free-form event content.
    pub content: Value,
    /// Free-form unsigned data (`prev_content`, `redacted_because`,
    /// `transaction_id`, status hints).
    pub unsigned: Value,
    /// Previous content of a state event, hoisted from
    /// `unsigned.prev_content` when absent at the top level.
    pub prev_content: Option<Value>,
    /// State key; present exactly on state events.
    pub state_key: Option<String>,
    /// Sending status.
    pub status: EventStatus,
    /// Dense total order assigned as the event entered the client.
    pub sort_order: f64,
}

impl Event {
    /// Construct an event from its wire JSON.
    ///
    /// Never fails: missing or mistyped fields default to empty objects and
    /// empty strings. When the payload carries no `origin_server_ts` the
    /// event is stamped with `fallback_ts` (the receipt time). A top-level
    /// or unsigned `status` hint overrides `default_status`.
    pub fn from_json(
        payload: &Value,
        room_id: &str,
        fallback_ts: u64,
        default_status: EventStatus,
    ) -> Self {
        let unsigned = payload
            .get("unsigned")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let prev_content = payload
            .get("prev_content")
            .filter(|v| v.is_object())
            .cloned()
            .or_else(|| unsigned.get("prev_content").filter(|v| v.is_object()).cloned());

        let status = payload
            .get("status")
            .and_then(Value::as_i64)
            .or_else(|| unsigned.get("status").and_then(Value::as_i64))
            .map_or(default_status, EventStatus::from_i64);

        Self {
            event_id: string_field(payload, "event_id"),
            room_id: room_id.to_string(),
            event_type: string_field(payload, "type"),
            sender_id: string_field(payload, "sender"),
            origin_server_ts: payload
                .get("origin_server_ts")
                .and_then(Value::as_u64)
                .unwrap_or(fallback_ts),
            content: payload
                .get("content")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
            unsigned,
            prev_content,
            state_key: payload.get("state_key").and_then(Value::as_str).map(str::to_string),
            status,
            sort_order: 0.0,
        }
    }

    /// Reconstruct an event from a stored row: the wire JSON plus the
    /// persisted status and sort order.
    pub fn from_store(payload: &Value, room_id: &str, status: i64, sort_order: f64) -> Self {
        let mut event = Self::from_json(payload, room_id, 0, EventStatus::from_i64(status));
        event.status = EventStatus::from_i64(status);
        event.sort_order = sort_order;
        event
    }

    /// Canonical wire JSON of this event. Round-trips through
    /// [`Event::from_store`] without loss.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("event_id".into(), Value::String(self.event_id.clone()));
        map.insert("type".into(), Value::String(self.event_type.clone()));
        map.insert("sender".into(), Value::String(self.sender_id.clone()));
        map.insert("origin_server_ts".into(), json!(self.origin_server_ts));
        map.insert("content".into(), self.content.clone());
        map.insert("unsigned".into(), self.unsigned.clone());
        if let Some(prev) = &self.prev_content {
            map.insert("prev_content".into(), prev.clone());
        }
        if let Some(state_key) = &self.state_key {
            map.insert("state_key".into(), Value::String(state_key.clone()));
        }

        Value::Object(map)
    }

    /// Whether this event has been redacted.
    pub fn redacted(&self) -> bool {
        self.unsigned.get("redacted_because").is_some()
    }

    /// Apply a redaction: store the redactor's JSON in
    /// `unsigned.redacted_because`, clear `prev_content`, and trim `content`
    /// to the type-specific whitelist.
    pub fn set_redaction_event(&mut self, redaction: &Event) {
        if !self.unsigned.is_object() {
            self.unsigned = Value::Object(Map::new());
        }
        if let Some(unsigned) = self.unsigned.as_object_mut() {
            unsigned.insert("redacted_because".into(), redaction.to_json());
        }
        self.prev_content = None;

        let keep = redacted_content_keys(&self.event_type);
        let mut kept = Map::new();
        if let Some(content) = self.content.as_object() {
            for key in keep {
                if let Some(value) = content.get(*key) {
                    kept.insert((*key).to_string(), value.clone());
                }
            }
        }
        self.content = Value::Object(kept);
    }

    /// Relation type of this event: `content."m.relates_to".rel_type`, or
    /// `m.in_reply_to` for reply-shaped relations, or `None`.
    pub fn relationship_type(&self) -> Option<&str> {
        let relates_to = self.content.get("m.relates_to")?;
        if let Some(rel_type) = relates_to.get("rel_type").and_then(Value::as_str) {
            return Some(rel_type);
        }
        relates_to.get("m.in_reply_to").filter(|v| v.is_object()).map(|_| "m.in_reply_to")
    }

    /// Target event ID of this event's relation, if any.
    pub fn relationship_event_id(&self) -> Option<&str> {
        let relates_to = self.content.get("m.relates_to")?;
        relates_to
            .get("event_id")
            .and_then(Value::as_str)
            .or_else(|| relates_to.get("m.in_reply_to")?.get("event_id").and_then(Value::as_str))
    }

    /// Message classification: `m.sticker` for stickers, else the string
    /// `content.msgtype`, else `m.text`.
    pub fn message_type(&self) -> &str {
        if self.event_type == "m.sticker" {
            return "m.sticker";
        }
        self.content.get("msgtype").and_then(Value::as_str).unwrap_or("m.text")
    }

    /// Display body: `"Redacted"` when redacted, else `content.body`, else
    /// `content.formatted_body`, else the event type.
    pub fn body(&self) -> &str {
        if self.redacted() {
            return "Redacted";
        }
        self.content
            .get("body")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.content
                    .get("formatted_body")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or(&self.event_type)
    }

    /// Whether this message is rich (carries `org.matrix.custom.html`
    /// formatted content).
    pub fn is_rich_message(&self) -> bool {
        self.content.get("format").and_then(Value::as_str) == Some("org.matrix.custom.html")
            && self.content.get("formatted_body").and_then(Value::as_str).is_some()
    }

    /// The text emote detection runs over: the formatted HTML for rich
    /// messages, the plain body otherwise.
    fn emote_text(&self) -> &str {
        if self.is_rich_message() {
            self.content.get("formatted_body").and_then(Value::as_str).unwrap_or_default()
        } else {
            self.body()
        }
    }

    /// Whether the message consists only of emotes (and, for rich
    /// messages, custom-emote `<img>` tags).
    pub fn only_emotes(&self) -> bool {
        crate::text::is_only_emotes(self.emote_text(), self.is_rich_message())
    }

    /// Number of emotes in the message.
    pub fn number_emotes(&self) -> usize {
        crate::text::count_emotes(self.emote_text(), self.is_rich_message())
    }

    /// Membership carried in `content.membership` (member events).
    pub fn membership(&self) -> Membership {
        self.content
            .get("membership")
            .and_then(Value::as_str)
            .map_or(Membership::Leave, Membership::parse)
    }

    /// Membership carried in `prev_content.membership`, defaulting to
    /// `leave` when there is no previous state.
    pub fn prev_membership(&self) -> Membership {
        self.prev_content
            .as_ref()
            .and_then(|prev| prev.get("membership"))
            .and_then(Value::as_str)
            .map_or(Membership::Leave, Membership::parse)
    }

    /// Content URI of this event's attachment, or of its thumbnail.
    ///
    /// Plaintext attachments carry `url` (`info.thumbnail_url`); encrypted
    /// ones carry `file.url` (`info.thumbnail_file.url`).
    pub fn attachment_mxc(&self, thumbnail: bool) -> Option<&str> {
        let source: &Value = if thumbnail { self.content.get("info")? } else { &self.content };
        let (plain, encrypted) =
            if thumbnail { ("thumbnail_url", "thumbnail_file") } else { ("url", "file") };
        source
            .get(plain)
            .and_then(Value::as_str)
            .or_else(|| source.get(encrypted)?.get("url").and_then(Value::as_str))
    }

    /// Whether the attachment (or its thumbnail) is encrypted, i.e. the
    /// content carries a `file` envelope instead of a bare `url`.
    pub fn attachment_encrypted(&self, thumbnail: bool) -> bool {
        let source = if thumbnail { self.content.get("info") } else { Some(&self.content) };
        let envelope = if thumbnail { "thumbnail_file" } else { "file" };
        source.and_then(|s| s.get(envelope)).is_some_and(Value::is_object)
    }

    /// The encrypted-file envelope of the attachment, when present.
    pub fn attachment_envelope(&self, thumbnail: bool) -> Option<&Value> {
        let source: &Value = if thumbnail { self.content.get("info")? } else { &self.content };
        let envelope = if thumbnail { "thumbnail_file" } else { "file" };
        source.get(envelope).filter(|v| v.is_object())
    }
}

/// Content keys that survive redaction, per event type.
fn redacted_content_keys(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "m.room.member" => &["membership"],
        "m.room.create" => &["creator"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.aliases" => &["aliases"],
        "m.room.history_visibility" => &["history_visibility"],
        _ => &[],
    }
}

fn string_field(payload: &Value, key: &str) -> String {
    payload.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}
