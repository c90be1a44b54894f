//! Updates the sync engine produces for stores and stream consumers.

use serde_json::Value;
use weft_types::Membership;

use crate::api::RoomSummary;

/// Where in a room delta an event surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventUpdateKind {
    /// Timeline section of a joined or left room.
    Timeline,
    /// State section.
    State,
    /// Backfilled timeline events, sorted at the old end.
    History,
    /// Per-room account data.
    AccountData,
    /// Ephemeral events; never persisted.
    Ephemeral,
    /// Stripped state of an invited room.
    InviteState,
}

impl EventUpdateKind {
    /// Whether events of this kind are persisted to the store.
    pub fn persistable(self) -> bool {
        !matches!(self, Self::Ephemeral)
    }

    /// Stable wire name, used by the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeline => "timeline",
            Self::State => "state",
            Self::History => "history",
            Self::AccountData => "account_data",
            Self::Ephemeral => "ephemeral",
            Self::InviteState => "invite_state",
        }
    }
}

/// One event flowing out of the sync engine.
#[derive(Debug, Clone)]
pub struct EventUpdate {
    /// Room the event belongs to.
    pub room_id: String,
    /// Section of the room delta it came from.
    pub kind: EventUpdateKind,
    /// The event's type.
    pub event_type: String,
    /// Full event payload.
    pub content: Value,
    /// Sort order assigned on ingestion (0.0 for ephemerals).
    pub sort_order: f64,
}

/// One room-level delta flowing out of the sync engine.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    /// Room ID.
    pub room_id: String,
    /// Membership transition reported by this delta.
    pub membership: Membership,
    /// Pagination token of the delta's timeline, if any.
    pub prev_batch: Option<String>,
    /// Unread highlights.
    pub highlight_count: u64,
    /// Unread notifications.
    pub notification_count: u64,
    /// Whether the timeline was limited (gap before these events).
    pub limited_timeline: bool,
    /// Membership summary, when the server sent one.
    pub summary: Option<RoomSummary>,
}
