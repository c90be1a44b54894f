//! Client core for the weft Matrix SDK.
//!
//! The [`Client`] connects to a homeserver through an injected [`MatrixApi`]
//! capability, drives the incremental sync loop, and maintains a live
//! in-memory model of rooms, timeline events, membership, device keys and
//! account data, reconciled with an injected [`Database`].
//!
//! # Architecture
//!
//! All state mutation happens on one logical task; the suspension points are
//! exactly the awaits on the network, the store and the [`Encryption`]
//! subsystem. Consumers observe the model through broadcast streams
//! ([`Streams`]) and must treat emitted values as read-only snapshots.
//!
//! # Components
//!
//! - [`Client`]: session lifecycle, room list, profile cache, façade calls
//! - sync engine (`Client::one_shot_sync` / [`Client::handle_sync_response`]):
//!   reconciles sync deltas into rooms, stores and streams
//! - [`Room`] / [`Timeline`]: per-room state table and event window
//! - [`DeviceKeyTracker`]: device and cross-signing key bookkeeping
//! - [`MemoryDatabase`]: reference in-memory store implementation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod api;
mod attachment;
mod client;
mod database;
mod device_keys;
mod encryption;
pub mod env;
mod error;
mod room;
mod streams;
pub mod testing;
mod timeline;
mod update;

pub(crate) mod sync;

pub use api::{
    ApiError, AuthenticationFlow, DeviceKeysQueryResponse, DeviceListsUpdate, EventContainer,
    InvitedRoomUpdate, JoinedRoomUpdate, LeftRoomUpdate, LoginFlow, LoginResponse, LoginTypes,
    MatrixApi, MatrixError, Profile, RoomSummary, RoomsUpdate, SupportedVersions, SyncResponse,
    TimelineUpdate, UnreadNotificationCounts, ARCHIVE_SYNC_FILTER, DEFAULT_SYNC_FILTER,
    MESSAGES_FILTER,
};
pub use attachment::AttachmentError;
pub use client::{ArchivedRoom, Client, ClientConfig, LoginState, PushRule, PushRuleSet};
pub use database::{Database, MemoryDatabase, StoredClient, StoredEvent, StoredRoom};
pub use device_keys::{CrossSigningKey, DeviceKeyTracker, DeviceKeys, DeviceKeysList};
pub use encryption::{EncryptedFile, Encryption, JsonWebKey, ToDeviceEvent};
pub use error::{BasicEvent, ClientError, DecryptionError, StoreError};
pub use room::Room;
pub use streams::{OlmDecryptionFailure, Streams};
pub use timeline::Timeline;
pub use update::{EventUpdate, EventUpdateKind, RoomUpdate};
