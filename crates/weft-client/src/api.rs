//! The `MatrixApi` capability and its wire shapes.
//!
//! The client core never talks HTTP itself; it consumes a typed capability
//! covering the Client-Server endpoints it needs. Response bodies that the
//! engine walks structurally (the sync tree, key queries) are typed with
//! serde; event payloads inside them stay open-schema [`Value`]s.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default filter applied to every incremental sync.
pub const DEFAULT_SYNC_FILTER: &str = r#"{"room":{"state":{"lazy_load_members":true}}}"#;

/// Filter for the messages (pagination) endpoint.
pub const MESSAGES_FILTER: &str = r#"{"lazy_load_members":true}"#;

/// Filter for the one-shot archive sync.
pub const ARCHIVE_SYNC_FILTER: &str = r#"{"room":{"include_leave":true,"timeline":{"limit":10}}}"#;

/// Typed error response from the homeserver.
#[derive(Debug, Clone, Error, Deserialize)]
#[error("{errcode}: {error}")]
pub struct MatrixError {
    /// Machine-readable error code, e.g. `M_UNKNOWN_TOKEN`.
    pub errcode: String,
    /// Human-readable message.
    pub error: String,
    /// Backoff hint on `M_LIMIT_EXCEEDED`.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
    /// Interactive-auth session token, when the request needs another stage.
    #[serde(default)]
    pub session: Option<String>,
    /// Authentication flows offered for the remaining stages.
    #[serde(default, rename = "flows")]
    pub authentication_flows: Option<Vec<AuthenticationFlow>>,
}

impl MatrixError {
    /// Whether the server asks for user-interactive authentication and the
    /// only offered flow is exactly a single `m.login.password` stage.
    pub fn requires_password_auth_only(&self) -> bool {
        self.authentication_flows.as_ref().is_some_and(|flows| {
            flows.len() == 1 && flows[0].stages == ["m.login.password"]
        })
    }
}

/// One user-interactive authentication flow.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthenticationFlow {
    /// Ordered auth stages, e.g. `["m.login.password"]`.
    #[serde(default)]
    pub stages: Vec<String>,
}

/// Errors of the API capability.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network or HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Typed homeserver error.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Response of the sync endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncResponse {
    /// Pagination token for the next sync.
    pub next_batch: String,
    /// Room deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<RoomsUpdate>,
    /// Presence events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<EventContainer>,
    /// Global account-data events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventContainer>,
    /// To-device messages addressed to this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_device: Option<EventContainer>,
    /// Device-list change hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_lists: Option<DeviceListsUpdate>,
    /// Remaining one-time keys per algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_one_time_keys_count: Option<BTreeMap<String, u64>>,
}

/// A `{"events": [...]}` wrapper, used across the sync response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventContainer {
    /// Raw event payloads.
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Room deltas grouped by membership transition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoomsUpdate {
    /// Rooms the user has joined.
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomUpdate>,
    /// Rooms the user has been invited to.
    #[serde(default)]
    pub invite: HashMap<String, InvitedRoomUpdate>,
    /// Rooms the user has left.
    #[serde(default)]
    pub leave: HashMap<String, LeftRoomUpdate>,
}

/// Delta for one joined room.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JoinedRoomUpdate {
    /// State events between the previous sync and the timeline start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EventContainer>,
    /// Timeline events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineUpdate>,
    /// Ephemeral events (typing, receipts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EventContainer>,
    /// Per-room account data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventContainer>,
    /// Unread counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotificationCounts>,
    /// Membership summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RoomSummary>,
}

/// Delta for one left room.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LeftRoomUpdate {
    /// State events up to the point of leaving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EventContainer>,
    /// Timeline events up to the point of leaving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineUpdate>,
    /// Per-room account data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventContainer>,
}

/// Delta for one invited room.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvitedRoomUpdate {
    /// Stripped state visible to invitees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_state: Option<EventContainer>,
}

/// Timeline section of a room delta.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimelineUpdate {
    /// Raw timeline event payloads.
    #[serde(default)]
    pub events: Vec<Value>,
    /// Whether the timeline was limited (a gap exists before `events`).
    #[serde(default)]
    pub limited: bool,
    /// Pagination token for fetching the events before the gap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Device-list change hints from a sync.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceListsUpdate {
    /// Users whose device lists changed and must be re-queried.
    #[serde(default)]
    pub changed: Vec<String>,
    /// Users who left all shared encrypted rooms.
    #[serde(default)]
    pub left: Vec<String>,
}

/// Unread counters of a joined room.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct UnreadNotificationCounts {
    /// Notifications that also matched a highlight rule.
    #[serde(default)]
    pub highlight_count: u64,
    /// All unread notifications.
    #[serde(default)]
    pub notification_count: u64,
}

/// Membership summary of a room.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RoomSummary {
    /// Users that can be used to generate a room name.
    #[serde(default, rename = "m.heroes", skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<String>>,
    /// Number of joined members.
    #[serde(default, rename = "m.joined_member_count", skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u64>,
    /// Number of invited members.
    #[serde(default, rename = "m.invited_member_count", skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u64>,
}

/// Response of a login or register call.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoginResponse {
    /// Access token for the new session.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Device ID assigned by the server.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Fully qualified user ID.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Supported spec versions advertised by a homeserver.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupportedVersions {
    /// Version strings, e.g. `r0.6.0`.
    #[serde(default)]
    pub versions: Vec<String>,
}

/// Login flows advertised by a homeserver.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoginTypes {
    /// Flows, each carrying a `type` such as `m.login.password`.
    #[serde(default)]
    pub flows: Vec<LoginFlow>,
}

/// One advertised login flow.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoginFlow {
    /// Login type, e.g. `m.login.password`.
    #[serde(default, rename = "type")]
    pub flow_type: String,
}

/// A user's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// Display name.
    #[serde(default)]
    pub displayname: Option<String>,
    /// Avatar content URI.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Response of a device-keys query.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceKeysQueryResponse {
    /// Device keys per user per device.
    #[serde(default)]
    pub device_keys: HashMap<String, HashMap<String, Value>>,
    /// Homeservers that could not be reached, keyed by domain.
    #[serde(default)]
    pub failures: HashMap<String, Value>,
    /// Master cross-signing keys per user.
    #[serde(default)]
    pub master_keys: HashMap<String, Value>,
    /// Self-signing cross-signing keys per user.
    #[serde(default)]
    pub self_signing_keys: HashMap<String, Value>,
    /// User-signing cross-signing keys per user.
    #[serde(default)]
    pub user_signing_keys: HashMap<String, Value>,
}

/// The Client-Server API surface the core consumes.
///
/// Implementations own the HTTP transport, JSON codec and endpoint routing.
/// Every operation fails with a typed [`MatrixError`] or a transport error.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    /// Incremental sync. `timeout_ms` is the long-poll timeout; `None` asks
    /// for an immediate response.
    async fn sync(
        &self,
        filter: Option<&str>,
        since: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<SyncResponse, ApiError>;

    /// Password login.
    async fn login(
        &self,
        user: &str,
        password: &str,
        initial_device_name: Option<&str>,
    ) -> Result<LoginResponse, ApiError>;

    /// Account registration.
    async fn register(
        &self,
        user: Option<&str>,
        password: &str,
        initial_device_name: Option<&str>,
    ) -> Result<LoginResponse, ApiError>;

    /// Invalidate this session's access token.
    async fn logout(&self) -> Result<(), ApiError>;

    /// Invalidate all of the user's access tokens.
    async fn logout_all(&self) -> Result<(), ApiError>;

    /// Send a to-device message batch: `messages` maps user ID to device ID
    /// (or `*`) to message content.
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &Value,
    ) -> Result<(), ApiError>;

    /// Query device keys for the given users.
    async fn request_device_keys(
        &self,
        user_ids: &[String],
        timeout_ms: u64,
    ) -> Result<DeviceKeysQueryResponse, ApiError>;

    /// Fetch a user's profile.
    async fn request_profile(&self, user_id: &str) -> Result<Profile, ApiError>;

    /// Fetch the spec versions the server supports.
    async fn request_supported_versions(&self) -> Result<SupportedVersions, ApiError>;

    /// Fetch the advertised login flows.
    async fn request_login_types(&self) -> Result<LoginTypes, ApiError>;

    /// Upload media, returning its `mxc://` content URI.
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ApiError>;

    /// Download media by content URI.
    async fn download(&self, mxc: &str) -> Result<Vec<u8>, ApiError>;

    /// Set a user's avatar.
    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), ApiError>;

    /// Enable or disable a push rule.
    async fn enable_push_rule(
        &self,
        scope: &str,
        kind: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<(), ApiError>;

    /// Write a global account-data event.
    async fn set_account_data(
        &self,
        user_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<(), ApiError>;

    /// Change the account password. `auth` carries the interactive-auth
    /// stanza when required.
    async fn change_password(
        &self,
        new_password: &str,
        auth: Option<&Value>,
    ) -> Result<(), ApiError>;

    /// Redact an event, returning the redaction's event ID.
    async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
        txn_id: &str,
    ) -> Result<String, ApiError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sync_response_parses_a_minimal_body() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s72595_4483_1934",
        }))
        .unwrap();
        assert_eq!(response.next_batch, "s72595_4483_1934");
        assert!(response.rooms.is_none());
    }

    #[test]
    fn sync_response_parses_room_sections() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!a:x": {
                        "timeline": {
                            "events": [{"type": "m.room.message"}],
                            "limited": true,
                            "prev_batch": "t42",
                        },
                        "unread_notifications": {"highlight_count": 2, "notification_count": 5},
                        "summary": {"m.heroes": ["@b:x"], "m.joined_member_count": 2},
                    },
                },
                "invite": {"!b:x": {"invite_state": {"events": []}}},
            },
            "device_lists": {"changed": ["@c:x"], "left": []},
            "device_one_time_keys_count": {"signed_curve25519": 50},
        }))
        .unwrap();

        let rooms = response.rooms.unwrap();
        let joined = &rooms.join["!a:x"];
        let timeline = joined.timeline.as_ref().unwrap();
        assert!(timeline.limited);
        assert_eq!(timeline.prev_batch.as_deref(), Some("t42"));
        assert_eq!(joined.unread_notifications.unwrap().notification_count, 5);
        assert_eq!(joined.summary.as_ref().unwrap().heroes.as_deref(), Some(&["@b:x".to_string()][..]));
        assert!(rooms.invite.contains_key("!b:x"));
        assert_eq!(response.device_one_time_keys_count.unwrap()["signed_curve25519"], 50);
    }

    #[test]
    fn interactive_auth_flow_detection() {
        let err: MatrixError = serde_json::from_value(json!({
            "errcode": "M_FORBIDDEN",
            "error": "auth required",
            "session": "xyz",
            "flows": [{"stages": ["m.login.password"]}],
        }))
        .unwrap();
        assert!(err.requires_password_auth_only());

        let multi: MatrixError = serde_json::from_value(json!({
            "errcode": "M_FORBIDDEN",
            "error": "auth required",
            "flows": [{"stages": ["m.login.password", "m.login.sso"]}],
        }))
        .unwrap();
        assert!(!multi.requires_password_auth_only());
    }
}
