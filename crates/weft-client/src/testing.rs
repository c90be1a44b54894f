//! Test doubles for the injected capabilities.
//!
//! `MockApi` serves scripted responses and records every call; together
//! with [`crate::MemoryDatabase`] and
//! [`crate::env::test_utils::MockEnv`] it makes the whole client
//! deterministic. `NullEncryption` is the disabled encryption subsystem.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    api::{
        ApiError, DeviceKeysQueryResponse, LoginFlow, LoginResponse, LoginTypes, MatrixApi,
        Profile, SupportedVersions, SyncResponse,
    },
    device_keys::DeviceKeys,
    encryption::{EncryptedFile, Encryption, ToDeviceEvent},
    error::{ClientError, DecryptionError},
    update::EventUpdate,
};

/// One recorded API call.
#[derive(Debug, Clone)]
pub enum ApiCall {
    /// `sync` with the `since` token it was given.
    Sync {
        /// Sync position of the call.
        since: Option<String>,
    },
    /// `login`.
    Login,
    /// `register`.
    Register,
    /// `logout`.
    Logout,
    /// `logout_all`.
    LogoutAll,
    /// `send_to_device`.
    SendToDevice {
        /// Event type sent.
        event_type: String,
        /// Transaction ID used.
        txn_id: String,
        /// Addressing map sent.
        messages: Value,
    },
    /// `request_device_keys`.
    RequestDeviceKeys {
        /// Users queried.
        user_ids: Vec<String>,
    },
    /// `request_profile`.
    RequestProfile {
        /// User queried.
        user_id: String,
    },
    /// `request_supported_versions`.
    SupportedVersions,
    /// `request_login_types`.
    LoginTypes,
    /// `upload`.
    Upload {
        /// Uploaded file name.
        filename: String,
    },
    /// `download`.
    Download {
        /// Requested content URI.
        mxc: String,
    },
    /// `set_avatar_url`.
    SetAvatarUrl {
        /// Target user.
        user_id: String,
        /// New avatar URI.
        mxc: String,
    },
    /// `enable_push_rule`.
    EnablePushRule {
        /// Rule scope.
        scope: String,
        /// Rule kind.
        kind: String,
        /// Rule ID.
        rule_id: String,
        /// New enablement.
        enabled: bool,
    },
    /// `set_account_data`.
    SetAccountData {
        /// Target user.
        user_id: String,
        /// Event type written.
        event_type: String,
        /// Content written.
        content: Value,
    },
    /// `change_password`.
    ChangePassword {
        /// Whether an auth stanza was supplied.
        has_auth: bool,
        /// Session token inside the auth stanza, if any.
        session: Option<String>,
    },
    /// `redact_event`.
    RedactEvent {
        /// Room of the redacted event.
        room_id: String,
        /// Redacted event.
        event_id: String,
    },
}

#[derive(Default)]
struct MockApiInner {
    sync_responses: VecDeque<Result<SyncResponse, ApiError>>,
    login_responses: VecDeque<Result<LoginResponse, ApiError>>,
    device_key_responses: VecDeque<Result<DeviceKeysQueryResponse, ApiError>>,
    change_password_results: VecDeque<Result<(), ApiError>>,
    profiles: HashMap<String, Profile>,
    downloads: HashMap<String, Vec<u8>>,
    calls: Vec<ApiCall>,
}

/// Scripted `MatrixApi` double.
///
/// Responses are queues: each call pops the next scripted response. An
/// empty queue yields a benign default (empty key-query response, complete
/// login) except for `sync`, which fails so runaway loops surface in tests.
#[derive(Default)]
pub struct MockApi {
    inner: Mutex<MockApiInner>,
}

#[allow(clippy::expect_used)]
impl MockApi {
    /// Create a mock with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sync response.
    pub fn push_sync_response(&self, response: Result<SyncResponse, ApiError>) {
        self.inner.lock().expect("mutex poisoned").sync_responses.push_back(response);
    }

    /// Queue a login/register response.
    pub fn push_login_response(&self, response: Result<LoginResponse, ApiError>) {
        self.inner.lock().expect("mutex poisoned").login_responses.push_back(response);
    }

    /// Queue a device-key query response.
    pub fn push_device_key_response(&self, response: Result<DeviceKeysQueryResponse, ApiError>) {
        self.inner.lock().expect("mutex poisoned").device_key_responses.push_back(response);
    }

    /// Queue a change-password result.
    pub fn push_change_password_result(&self, result: Result<(), ApiError>) {
        self.inner.lock().expect("mutex poisoned").change_password_results.push_back(result);
    }

    /// Serve a profile for a user.
    pub fn set_profile(&self, user_id: &str, profile: Profile) {
        self.inner.lock().expect("mutex poisoned").profiles.insert(user_id.to_string(), profile);
    }

    /// Serve bytes for a content URI.
    pub fn set_download(&self, mxc: &str, bytes: Vec<u8>) {
        self.inner.lock().expect("mutex poisoned").downloads.insert(mxc.to_string(), bytes);
    }

    /// All recorded calls so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.inner.lock().expect("mutex poisoned").calls.clone()
    }

    fn record(&self, call: ApiCall) {
        self.inner.lock().expect("mutex poisoned").calls.push(call);
    }
}

fn default_login_response() -> LoginResponse {
    LoginResponse {
        access_token: Some("mock-token".to_string()),
        device_id: Some("MOCKDEV".to_string()),
        user_id: Some("@alice:example.org".to_string()),
    }
}

#[allow(clippy::expect_used)]
#[async_trait]
impl MatrixApi for MockApi {
    async fn sync(
        &self,
        _filter: Option<&str>,
        since: Option<&str>,
        _timeout_ms: Option<u64>,
    ) -> Result<SyncResponse, ApiError> {
        self.record(ApiCall::Sync { since: since.map(str::to_string) });
        self.inner
            .lock()
            .expect("mutex poisoned")
            .sync_responses
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Transport("no scripted sync response".to_string())))
    }

    async fn login(
        &self,
        _user: &str,
        _password: &str,
        _initial_device_name: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        self.record(ApiCall::Login);
        self.inner
            .lock()
            .expect("mutex poisoned")
            .login_responses
            .pop_front()
            .unwrap_or_else(|| Ok(default_login_response()))
    }

    async fn register(
        &self,
        _user: Option<&str>,
        _password: &str,
        _initial_device_name: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        self.record(ApiCall::Register);
        self.inner
            .lock()
            .expect("mutex poisoned")
            .login_responses
            .pop_front()
            .unwrap_or_else(|| Ok(default_login_response()))
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record(ApiCall::Logout);
        Ok(())
    }

    async fn logout_all(&self) -> Result<(), ApiError> {
        self.record(ApiCall::LogoutAll);
        Ok(())
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &Value,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::SendToDevice {
            event_type: event_type.to_string(),
            txn_id: txn_id.to_string(),
            messages: messages.clone(),
        });
        Ok(())
    }

    async fn request_device_keys(
        &self,
        user_ids: &[String],
        _timeout_ms: u64,
    ) -> Result<DeviceKeysQueryResponse, ApiError> {
        self.record(ApiCall::RequestDeviceKeys { user_ids: user_ids.to_vec() });
        self.inner
            .lock()
            .expect("mutex poisoned")
            .device_key_responses
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceKeysQueryResponse::default()))
    }

    async fn request_profile(&self, user_id: &str) -> Result<Profile, ApiError> {
        self.record(ApiCall::RequestProfile { user_id: user_id.to_string() });
        self.inner
            .lock()
            .expect("mutex poisoned")
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| {
                ApiError::Matrix(crate::api::MatrixError {
                    errcode: "M_NOT_FOUND".to_string(),
                    error: format!("no profile for {user_id}"),
                    retry_after_ms: None,
                    session: None,
                    authentication_flows: None,
                })
            })
    }

    async fn request_supported_versions(&self) -> Result<SupportedVersions, ApiError> {
        self.record(ApiCall::SupportedVersions);
        Ok(SupportedVersions { versions: vec!["r0.5.0".to_string(), "r0.6.0".to_string()] })
    }

    async fn request_login_types(&self) -> Result<LoginTypes, ApiError> {
        self.record(ApiCall::LoginTypes);
        Ok(LoginTypes {
            flows: vec![LoginFlow { flow_type: "m.login.password".to_string() }],
        })
    }

    async fn upload(&self, _bytes: Vec<u8>, filename: &str) -> Result<String, ApiError> {
        self.record(ApiCall::Upload { filename: filename.to_string() });
        Ok("mxc://example.org/uploaded".to_string())
    }

    async fn download(&self, mxc: &str) -> Result<Vec<u8>, ApiError> {
        self.record(ApiCall::Download { mxc: mxc.to_string() });
        self.inner
            .lock()
            .expect("mutex poisoned")
            .downloads
            .get(mxc)
            .cloned()
            .ok_or_else(|| ApiError::Transport(format!("no scripted download for {mxc}")))
    }

    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), ApiError> {
        self.record(ApiCall::SetAvatarUrl {
            user_id: user_id.to_string(),
            mxc: mxc.to_string(),
        });
        Ok(())
    }

    async fn enable_push_rule(
        &self,
        scope: &str,
        kind: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::EnablePushRule {
            scope: scope.to_string(),
            kind: kind.to_string(),
            rule_id: rule_id.to_string(),
            enabled,
        });
        Ok(())
    }

    async fn set_account_data(
        &self,
        user_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::SetAccountData {
            user_id: user_id.to_string(),
            event_type: event_type.to_string(),
            content: content.clone(),
        });
        Ok(())
    }

    async fn change_password(
        &self,
        _new_password: &str,
        auth: Option<&Value>,
    ) -> Result<(), ApiError> {
        self.record(ApiCall::ChangePassword {
            has_auth: auth.is_some(),
            session: auth
                .and_then(|a| a.get("session"))
                .and_then(Value::as_str)
                .map(str::to_string),
        });
        self.inner
            .lock()
            .expect("mutex poisoned")
            .change_password_results
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        _reason: Option<&str>,
        _txn_id: &str,
    ) -> Result<String, ApiError> {
        self.record(ApiCall::RedactEvent {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok("$redaction:example.org".to_string())
    }
}

/// The disabled encryption subsystem: every operation is a no-op and
/// decryption fails with `NotEnabled`.
#[derive(Debug, Default)]
pub struct NullEncryption;

#[async_trait]
impl Encryption for NullEncryption {
    async fn init(&mut self, _pickled_account: Option<String>) -> Result<(), ClientError> {
        Ok(())
    }

    fn dispose(&mut self) {}

    fn enabled(&self) -> bool {
        false
    }

    fn pickled_olm_account(&self) -> Option<String> {
        None
    }

    fn identity_key(&self) -> Option<String> {
        None
    }

    fn fingerprint_key(&self) -> Option<String> {
        None
    }

    async fn on_sync(&mut self) {}

    async fn decrypt_to_device_event(
        &mut self,
        _event: &ToDeviceEvent,
    ) -> Result<ToDeviceEvent, DecryptionError> {
        Err(DecryptionError::NotEnabled)
    }

    async fn encrypt_to_device_message(
        &mut self,
        _devices: &[DeviceKeys],
        _event_type: &str,
        _message: &Value,
    ) -> Result<Value, ClientError> {
        Err(DecryptionError::NotEnabled.into())
    }

    async fn handle_to_device_event(&mut self, _event: &ToDeviceEvent) {}

    async fn decrypt_event_update(&mut self, update: &EventUpdate) -> EventUpdate {
        update.clone()
    }

    async fn handle_event_update(&mut self, _update: &EventUpdate) {}

    async fn handle_device_one_time_keys_count(&mut self, _counts: &BTreeMap<String, u64>) {}

    async fn decrypt_file(
        &self,
        _envelope: &EncryptedFile,
        _ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptionError> {
        Err(DecryptionError::NotEnabled)
    }
}
