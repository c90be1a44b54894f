//! Device and cross-signing key tracking.
//!
//! For every user sharing an encrypted room the client tracks a
//! [`DeviceKeysList`]. Lists go `outdated` on device-list change hints and
//! are refreshed through key queries after each sync pass. The merge is
//! conservative: a device whose ed25519 fingerprint changed keeps its old
//! key (public keys never silently rotate), and verification state carries
//! across refreshes.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::api::DeviceKeysQueryResponse;

/// Backoff window after a failed key query against a homeserver domain.
pub(crate) const KEY_QUERY_FAILURE_BACKOFF_MS: u64 = 5 * 60 * 1000;

/// One device's identity keys and local trust state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceKeys {
    /// Owning user.
    #[serde(default)]
    pub user_id: String,
    /// Device ID.
    #[serde(default)]
    pub device_id: String,
    /// Supported encryption algorithms.
    #[serde(default)]
    pub algorithms: Vec<String>,
    /// Identity keys, keyed `algorithm:device_id`.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Signatures over this key object.
    #[serde(default)]
    pub signatures: Value,
    /// Unsigned extras (display name).
    #[serde(default)]
    pub unsigned: Value,
    /// Locally verified by this user.
    #[serde(default)]
    pub verified: bool,
    /// Locally blocked; never encrypt to this device.
    #[serde(default)]
    pub blocked: bool,
    /// Users whose signatures over this key validated.
    #[serde(default)]
    pub valid_signatures: Vec<String>,
}

impl DeviceKeys {
    /// Parse a key-query payload. Returns `None` when the payload is not an
    /// object.
    pub fn from_json(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// The device's ed25519 fingerprint key.
    pub fn ed25519_key(&self) -> Option<&str> {
        self.keys.get(&format!("ed25519:{}", self.device_id)).map(String::as_str)
    }

    /// The device's curve25519 identity key.
    pub fn curve25519_key(&self) -> Option<&str> {
        self.keys.get(&format!("curve25519:{}", self.device_id)).map(String::as_str)
    }

    /// Whether the payload carries the minimum a usable device key needs.
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.device_id.is_empty() && self.ed25519_key().is_some()
    }
}

/// One cross-signing key (master, self-signing or user-signing).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CrossSigningKey {
    /// Owning user.
    #[serde(default)]
    pub user_id: String,
    /// Usages of this key.
    #[serde(default)]
    pub usage: Vec<String>,
    /// Key material, keyed `ed25519:base64`.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Signatures over this key object.
    #[serde(default)]
    pub signatures: Value,
    /// Locally verified.
    #[serde(default)]
    pub verified: bool,
    /// Locally blocked.
    #[serde(default)]
    pub blocked: bool,
    /// Users whose signatures over this key validated.
    #[serde(default)]
    pub valid_signatures: Vec<String>,
}

impl CrossSigningKey {
    /// Parse a key-query payload.
    pub fn from_json(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// The key's public key (the first key value).
    pub fn public_key(&self) -> Option<&str> {
        self.keys.values().next().map(String::as_str)
    }

    /// Whether the payload is usable.
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.usage.is_empty() && self.public_key().is_some()
    }
}

/// All tracked keys of one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceKeysList {
    /// Owning user.
    pub user_id: String,
    /// Device keys by device ID.
    pub device_keys: HashMap<String, DeviceKeys>,
    /// Cross-signing keys by public key.
    pub cross_signing_keys: HashMap<String, CrossSigningKey>,
    /// Whether the list must be refreshed.
    pub outdated: bool,
}

impl DeviceKeysList {
    /// Create an empty, outdated list for a user.
    pub fn new(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), outdated: true, ..Self::default() }
    }
}

/// Rows touched by a key-query merge, for the store flush.
#[derive(Debug, Default)]
pub(crate) struct KeyStoreDelta {
    /// `(user_id, device_id)` pairs whose device key must be upserted.
    pub upserted_devices: Vec<(String, String)>,
    /// `(user_id, device_id)` pairs whose row must be removed.
    pub removed_devices: Vec<(String, String)>,
    /// `(user_id, public_key)` pairs whose cross-signing key must be
    /// upserted.
    pub upserted_cross_signing: Vec<(String, String)>,
    /// Users whose `outdated` flag cleared.
    pub refreshed_users: Vec<String>,
}

/// Per-user device-key bookkeeping plus the per-domain query backoff.
#[derive(Debug, Default)]
pub struct DeviceKeyTracker {
    keys: HashMap<String, DeviceKeysList>,
    key_query_failures: HashMap<String, u64>,
}

impl DeviceKeyTracker {
    /// All tracked lists, keyed by user ID.
    pub fn keys(&self) -> &HashMap<String, DeviceKeysList> {
        &self.keys
    }

    /// The tracked list of one user.
    pub fn user(&self, user_id: &str) -> Option<&DeviceKeysList> {
        self.keys.get(user_id)
    }

    /// Replace the in-memory state with lists loaded from the store.
    pub(crate) fn load(&mut self, stored: HashMap<String, DeviceKeysList>) {
        self.keys = stored;
    }

    /// Drop everything (logout).
    pub(crate) fn clear(&mut self) {
        self.keys.clear();
        self.key_query_failures.clear();
    }

    /// Mark an already tracked user as needing a refresh.
    pub(crate) fn mark_user_outdated(&mut self, user_id: &str) -> bool {
        match self.keys.get_mut(user_id) {
            Some(entry) => {
                entry.outdated = true;
                true
            },
            None => false,
        }
    }

    /// Stop tracking a user.
    pub(crate) fn forget_user(&mut self, user_id: &str) {
        self.keys.remove(user_id);
    }

    /// Reconcile the tracked set: drop untracked users, create outdated
    /// entries for newly tracked ones.
    pub(crate) fn retain_tracked(&mut self, tracked: &HashSet<String>) {
        self.keys.retain(|user_id, _| tracked.contains(user_id));
        for user_id in tracked {
            self.keys.entry(user_id.clone()).or_insert_with(|| DeviceKeysList::new(user_id));
        }
    }

    /// Record a failed key query against a homeserver domain.
    pub(crate) fn record_failure(&mut self, domain: &str, now_ms: u64) {
        self.key_query_failures.insert(domain.to_string(), now_ms);
    }

    /// Outdated users due for a refresh, skipping users whose homeserver
    /// failed a key query less than five minutes ago.
    pub(crate) fn outdated_users(&self, now_ms: u64) -> Vec<String> {
        let mut users: Vec<String> = self
            .keys
            .values()
            .filter(|list| list.outdated)
            .filter(|list| {
                let Some((_, domain)) = list.user_id.split_once(':') else {
                    return true;
                };
                match self.key_query_failures.get(domain) {
                    Some(failed_at) => {
                        now_ms.saturating_sub(*failed_at) >= KEY_QUERY_FAILURE_BACKOFF_MS
                    },
                    None => true,
                }
            })
            .map(|list| list.user_id.clone())
            .collect();
        users.sort_unstable();
        users
    }

    /// Merge a key-query response into the tracked lists.
    ///
    /// Devices keep their verification state across refreshes; a device
    /// whose ed25519 key changed keeps its previous key entirely. The local
    /// device self-verifies when its fingerprint matches `own_fingerprint`.
    pub(crate) fn apply_query_response(
        &mut self,
        response: &DeviceKeysQueryResponse,
        own_user: &str,
        own_device: Option<&str>,
        own_fingerprint: Option<&str>,
        now_ms: u64,
    ) -> KeyStoreDelta {
        let mut delta = KeyStoreDelta::default();

        for (user_id, devices) in &response.device_keys {
            let Some(entry) = self.keys.get_mut(user_id) else {
                continue;
            };
            let old_keys = std::mem::take(&mut entry.device_keys);

            for (device_id, payload) in devices {
                let Some(mut key) = DeviceKeys::from_json(payload) else {
                    warn!(%user_id, %device_id, "unparseable device key, skipping");
                    continue;
                };
                if !key.is_valid() || key.user_id != *user_id || key.device_id != *device_id {
                    warn!(%user_id, %device_id, "invalid device key, skipping");
                    continue;
                }

                if let Some(old) = old_keys.get(device_id) {
                    if old.ed25519_key() == key.ed25519_key() {
                        key.verified = old.verified;
                        key.blocked = old.blocked;
                        key.valid_signatures = old.valid_signatures.clone();
                    } else {
                        warn!(
                            %user_id,
                            %device_id,
                            "ed25519 key changed, keeping the previous key"
                        );
                        entry.device_keys.insert(device_id.clone(), old.clone());
                        delta.upserted_devices.push((user_id.clone(), device_id.clone()));
                        continue;
                    }
                }

                if user_id == own_user
                    && Some(device_id.as_str()) == own_device
                    && key.ed25519_key() == own_fingerprint
                {
                    key.verified = true;
                }

                entry.device_keys.insert(device_id.clone(), key);
                delta.upserted_devices.push((user_id.clone(), device_id.clone()));
            }

            for device_id in old_keys.keys() {
                if !entry.device_keys.contains_key(device_id) {
                    delta.removed_devices.push((user_id.clone(), device_id.clone()));
                }
            }

            entry.outdated = false;
            delta.refreshed_users.push(user_id.clone());
        }

        for usage_map in
            [&response.master_keys, &response.self_signing_keys, &response.user_signing_keys]
        {
            for (user_id, payload) in usage_map {
                let Some(entry) = self.keys.get_mut(user_id) else {
                    continue;
                };
                let Some(mut key) = CrossSigningKey::from_json(payload) else {
                    warn!(%user_id, "unparseable cross-signing key, skipping");
                    continue;
                };
                if !key.is_valid() || key.user_id != *user_id {
                    warn!(%user_id, "invalid cross-signing key, skipping");
                    continue;
                }
                let Some(public_key) = key.public_key().map(str::to_string) else {
                    continue;
                };

                if let Some(old) = entry.cross_signing_keys.get(&public_key) {
                    key.verified = old.verified;
                    key.blocked = old.blocked;
                    key.valid_signatures = old.valid_signatures.clone();
                }
                // A response for one usage supersedes the stored keys of
                // that usage; keys of other usages stay untouched.
                entry
                    .cross_signing_keys
                    .retain(|_, existing| !existing.usage.iter().any(|u| key.usage.contains(u)));
                entry.cross_signing_keys.insert(public_key.clone(), key);
                delta.upserted_cross_signing.push((user_id.clone(), public_key));
            }
        }

        for domain in response.failures.keys() {
            self.record_failure(domain, now_ms);
        }

        delta
    }
}
