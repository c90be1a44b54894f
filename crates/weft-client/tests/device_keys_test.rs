//! Device-key tracking through full sync passes: refresh, rotation
//! protection, per-domain backoff and store agreement.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use serde_json::json;
use weft_client::{
    env::test_utils::MockEnv,
    testing::{ApiCall, MockApi},
    Client, ClientConfig, Database, DeviceKeysQueryResponse, MemoryDatabase, SyncResponse,
};

fn sync_response(value: serde_json::Value) -> SyncResponse {
    serde_json::from_value(value).unwrap()
}

fn device_payload(user: &str, device: &str, ed25519: &str) -> serde_json::Value {
    json!({
        "user_id": user,
        "device_id": device,
        "algorithms": ["m.megolm.v1.aes-sha2"],
        "keys": {
            format!("curve25519:{device}"): "curve",
            format!("ed25519:{device}"): ed25519,
        },
    })
}

/// A sync delta that makes `user` a joined member of an encrypted room.
fn encrypted_room_with(user: &str, next_batch: &str) -> SyncResponse {
    sync_response(json!({
        "next_batch": next_batch,
        "rooms": {"join": {"!enc:x": {"state": {"events": [
            {
                "event_id": "$enc",
                "type": "m.room.encryption",
                "sender": "@alice:example.org",
                "state_key": "",
                "content": {"algorithm": "m.megolm.v1.aes-sha2"},
            },
            {
                "event_id": format!("$m-{user}"),
                "type": "m.room.member",
                "sender": user,
                "state_key": user,
                "content": {"membership": "join"},
            },
        ]}}}},
    }))
}

async fn logged_in_client() -> (Client, Arc<MockApi>, MemoryDatabase, Arc<MockEnv>) {
    let api = Arc::new(MockApi::new());
    let db = MemoryDatabase::new();
    let env = MockEnv::starting_at(1_700_000_000_000);
    let mut client = Client::new(
        ClientConfig { background_sync: false, ..ClientConfig::default() },
        api.clone(),
        Some(Arc::new(db.clone()) as Arc<dyn Database>),
        None,
        env.clone(),
    );
    client.check_server("https://example.org").await.unwrap();
    client.login("alice", "secret", None).await.unwrap();
    (client, api, db, env)
}

fn key_query_calls(api: &MockApi) -> Vec<Vec<String>> {
    api.calls()
        .into_iter()
        .filter_map(|call| match call {
            ApiCall::RequestDeviceKeys { user_ids } => Some(user_ids),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn tracked_users_are_refreshed_and_match_the_store() {
    let (mut client, api, db, _env) = logged_in_client().await;

    api.push_sync_response(Ok(encrypted_room_with("@u:server.tld", "s1")));
    let mut response = DeviceKeysQueryResponse::default();
    response
        .device_keys
        .entry("@u:server.tld".into())
        .or_default()
        .insert("DEV".into(), device_payload("@u:server.tld", "DEV", "K1"));
    response
        .device_keys
        .entry("@alice:example.org".into())
        .or_default()
        .insert("MOCKDEV".into(), device_payload("@alice:example.org", "MOCKDEV", "KA"));
    api.push_device_key_response(Ok(response));

    client.one_shot_sync().await.unwrap();

    // Both the room member and the local user were queried.
    let queries = key_query_calls(&api);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0], vec!["@alice:example.org".to_string(), "@u:server.tld".to_string()]);

    let tracked = client.user_device_keys();
    let list = &tracked["@u:server.tld"];
    assert!(!list.outdated);
    assert_eq!(list.device_keys["DEV"].ed25519_key(), Some("K1"));

    // In-memory state equals the database rows.
    let client_id = db.get_client("weft").unwrap().unwrap().client_id;
    let stored = db.get_user_device_keys(client_id).unwrap();
    assert_eq!(&stored, tracked);
}

#[tokio::test]
async fn device_list_hints_trigger_a_refresh_but_keys_never_rotate() {
    let (mut client, api, _db, _env) = logged_in_client().await;

    api.push_sync_response(Ok(encrypted_room_with("@u:server.tld", "s1")));
    let mut initial = DeviceKeysQueryResponse::default();
    initial
        .device_keys
        .entry("@u:server.tld".into())
        .or_default()
        .insert("DEV".into(), device_payload("@u:server.tld", "DEV", "K1"));
    initial
        .device_keys
        .entry("@alice:example.org".into())
        .or_default()
        .insert("MOCKDEV".into(), device_payload("@alice:example.org", "MOCKDEV", "KA"));
    api.push_device_key_response(Ok(initial));
    client.one_shot_sync().await.unwrap();

    // The server hints that @u's devices changed and answers the re-query
    // with a different ed25519 key for the same device ID.
    api.push_sync_response(Ok(sync_response(json!({
        "next_batch": "s2",
        "device_lists": {"changed": ["@u:server.tld"], "left": []},
    }))));
    let mut rotated = DeviceKeysQueryResponse::default();
    rotated
        .device_keys
        .entry("@u:server.tld".into())
        .or_default()
        .insert("DEV".into(), device_payload("@u:server.tld", "DEV", "K2"));
    api.push_device_key_response(Ok(rotated));
    client.one_shot_sync().await.unwrap();

    assert_eq!(key_query_calls(&api).len(), 2, "the hint re-queried @u");
    let key = &client.user_device_keys()["@u:server.tld"].device_keys["DEV"];
    assert_eq!(key.ed25519_key(), Some("K1"), "public key never silently rotates");
}

#[tokio::test]
async fn users_who_left_are_dropped_from_tracking() {
    let (mut client, api, _db, _env) = logged_in_client().await;

    api.push_sync_response(Ok(encrypted_room_with("@u:server.tld", "s1")));
    let mut initial = DeviceKeysQueryResponse::default();
    initial
        .device_keys
        .entry("@u:server.tld".into())
        .or_default()
        .insert("DEV".into(), device_payload("@u:server.tld", "DEV", "K1"));
    initial
        .device_keys
        .entry("@alice:example.org".into())
        .or_default()
        .insert("MOCKDEV".into(), device_payload("@alice:example.org", "MOCKDEV", "KA"));
    api.push_device_key_response(Ok(initial));
    client.one_shot_sync().await.unwrap();
    assert!(client.user_device_keys().contains_key("@u:server.tld"));

    // The member leaves the encrypted room; the tracker drops the entry.
    api.push_sync_response(Ok(sync_response(json!({
        "next_batch": "s2",
        "rooms": {"join": {"!enc:x": {"timeline": {"events": [{
            "event_id": "$left",
            "type": "m.room.member",
            "sender": "@u:server.tld",
            "state_key": "@u:server.tld",
            "content": {"membership": "leave"},
        }]}}}},
    }))));
    client.one_shot_sync().await.unwrap();

    assert!(!client.user_device_keys().contains_key("@u:server.tld"));
}

#[tokio::test]
async fn key_query_failures_back_off_per_domain() {
    let (mut client, api, _db, env) = logged_in_client().await;

    // First pass: @v's homeserver fails the query; the local user's own
    // keys resolve so only @v stays outdated.
    api.push_sync_response(Ok(encrypted_room_with("@v:server.tld", "s1")));
    let mut failing = DeviceKeysQueryResponse::default();
    failing
        .device_keys
        .entry("@alice:example.org".into())
        .or_default()
        .insert("MOCKDEV".into(), device_payload("@alice:example.org", "MOCKDEV", "KA"));
    failing.failures.insert("server.tld".into(), json!({"status": 502}));
    api.push_device_key_response(Ok(failing));
    client.one_shot_sync().await.unwrap();
    assert_eq!(key_query_calls(&api).len(), 1);
    assert!(client.user_device_keys()["@v:server.tld"].outdated);

    // Two minutes later the domain is still backing off: no query.
    env.advance(Duration::from_secs(2 * 60));
    api.push_sync_response(Ok(sync_response(json!({"next_batch": "s2"}))));
    client.one_shot_sync().await.unwrap();
    assert_eq!(key_query_calls(&api).len(), 1, "backoff suppressed the query");

    // Six minutes after the failure the user is due again.
    env.advance(Duration::from_secs(4 * 60));
    api.push_sync_response(Ok(sync_response(json!({"next_batch": "s3"}))));
    let mut recovered = DeviceKeysQueryResponse::default();
    recovered
        .device_keys
        .entry("@v:server.tld".into())
        .or_default()
        .insert("DEV".into(), device_payload("@v:server.tld", "DEV", "KV"));
    api.push_device_key_response(Ok(recovered));
    client.one_shot_sync().await.unwrap();

    let queries = key_query_calls(&api);
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1], vec!["@v:server.tld".to_string()]);
    assert!(!client.user_device_keys()["@v:server.tld"].outdated);
}
