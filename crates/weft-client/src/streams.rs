//! Broadcast streams produced by the client.
//!
//! Each stream is a multi-producer, multi-consumer `tokio::sync::broadcast`
//! channel. Late subscribers only see values published after they
//! subscribed; there is no replay buffer. Emission never blocks; a stream
//! without subscribers silently drops the value.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use weft_types::Event;

use crate::{
    api::{MatrixError, SyncResponse},
    client::LoginState,
    encryption::ToDeviceEvent,
    error::{BasicEvent, ClientError, DecryptionError},
    update::{EventUpdate, RoomUpdate},
};

/// A to-device event that failed Olm decryption, with the original
/// ciphertext preserved.
#[derive(Debug, Clone)]
pub struct OlmDecryptionFailure {
    /// The decryption error.
    pub error: DecryptionError,
    /// The undecrypted event as received.
    pub event: ToDeviceEvent,
}

/// The client's broadcast streams.
///
/// State updates within a sync pass are applied strictly before the
/// corresponding values are emitted here.
#[derive(Debug)]
pub struct Streams {
    pub(crate) event: broadcast::Sender<EventUpdate>,
    pub(crate) room_update: broadcast::Sender<RoomUpdate>,
    pub(crate) to_device: broadcast::Sender<ToDeviceEvent>,
    pub(crate) login_state: broadcast::Sender<LoginState>,
    pub(crate) error: broadcast::Sender<MatrixError>,
    pub(crate) sync_error: broadcast::Sender<ClientError>,
    pub(crate) olm_error: broadcast::Sender<OlmDecryptionFailure>,
    pub(crate) first_sync: broadcast::Sender<bool>,
    pub(crate) sync: broadcast::Sender<Arc<SyncResponse>>,
    pub(crate) presence: broadcast::Sender<Value>,
    pub(crate) account_data: broadcast::Sender<BasicEvent>,
    pub(crate) call_invite: broadcast::Sender<Event>,
    pub(crate) call_hangup: broadcast::Sender<Event>,
    pub(crate) call_answer: broadcast::Sender<Event>,
    pub(crate) call_candidates: broadcast::Sender<Event>,
    pub(crate) room_key_request: broadcast::Sender<ToDeviceEvent>,
    pub(crate) key_verification_request: broadcast::Sender<ToDeviceEvent>,
}

macro_rules! subscribe {
    ($(#[$doc:meta] $fn_name:ident => $field:ident: $ty:ty),+ $(,)?) => {
        $(
            #[$doc]
            pub fn $fn_name(&self) -> broadcast::Receiver<$ty> {
                self.$field.subscribe()
            }
        )+
    };
}

impl Streams {
    /// Create the stream set with the given per-channel capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            event: broadcast::channel(capacity).0,
            room_update: broadcast::channel(capacity).0,
            to_device: broadcast::channel(capacity).0,
            login_state: broadcast::channel(capacity).0,
            error: broadcast::channel(capacity).0,
            sync_error: broadcast::channel(capacity).0,
            olm_error: broadcast::channel(capacity).0,
            first_sync: broadcast::channel(capacity).0,
            sync: broadcast::channel(capacity).0,
            presence: broadcast::channel(capacity).0,
            account_data: broadcast::channel(capacity).0,
            call_invite: broadcast::channel(capacity).0,
            call_hangup: broadcast::channel(capacity).0,
            call_answer: broadcast::channel(capacity).0,
            call_candidates: broadcast::channel(capacity).0,
            room_key_request: broadcast::channel(capacity).0,
            key_verification_request: broadcast::channel(capacity).0,
        }
    }

    subscribe! {
        /// Every event update leaving the sync engine.
        subscribe_events => event: EventUpdate,
        /// Room-level deltas (membership, counters, summary).
        subscribe_room_updates => room_update: RoomUpdate,
        /// To-device events, decrypted where possible.
        subscribe_to_device_events => to_device: ToDeviceEvent,
        /// Login / logout transitions.
        subscribe_login_state => login_state: LoginState,
        /// Typed homeserver errors raised by the sync loop.
        subscribe_errors => error: MatrixError,
        /// Non-protocol sync failures.
        subscribe_sync_errors => sync_error: ClientError,
        /// To-device events whose Olm decryption failed.
        subscribe_olm_errors => olm_error: OlmDecryptionFailure,
        /// Emitted once per session when the first sync completes.
        subscribe_first_sync => first_sync: bool,
        /// The raw sync response after a pass has been applied.
        subscribe_sync => sync: Arc<SyncResponse>,
        /// Presence events.
        subscribe_presence => presence: Value,
        /// Global account-data events.
        subscribe_account_data => account_data: BasicEvent,
        /// `m.call.invite` timeline events.
        subscribe_call_invites => call_invite: Event,
        /// `m.call.hangup` timeline events.
        subscribe_call_hangups => call_hangup: Event,
        /// `m.call.answer` timeline events.
        subscribe_call_answers => call_answer: Event,
        /// `m.call.candidates` timeline events.
        subscribe_call_candidates => call_candidates: Event,
        /// `m.room_key_request` to-device events.
        subscribe_room_key_requests => room_key_request: ToDeviceEvent,
        /// `m.key.verification.request` to-device events.
        subscribe_key_verification_requests => key_verification_request: ToDeviceEvent,
    }
}

/// Emit on a broadcast channel, ignoring the absence of subscribers.
pub(crate) fn emit<T>(sender: &broadcast::Sender<T>, value: T) {
    let _ = sender.send(value);
}
