//! Sync engine scenarios: state reconciliation, redaction fan-out,
//! encryption anti-downgrade, receipts and failure semantics.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;
use weft_client::{
    env::test_utils::MockEnv,
    testing::{ApiCall, MockApi},
    ApiError, Client, ClientConfig, Database, LoginState, MatrixError, MemoryDatabase,
    SyncResponse,
};

fn sync_response(value: serde_json::Value) -> SyncResponse {
    serde_json::from_value(value).unwrap()
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
    client.login("alice", "secret", Some("weft tests")).await.unwrap();
    (client, api, db, env)
}

fn client_id(db: &MemoryDatabase) -> i64 {
    db.get_client("weft").unwrap().unwrap().client_id
}

#[tokio::test]
async fn redaction_of_a_power_levels_event() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    let response = sync_response(json!({
        "next_batch": "s1",
        "rooms": {"join": {"!room:x": {"timeline": {"events": [
            {
                "event_id": "$pl",
                "type": "m.room.power_levels",
                "sender": "@mod:x",
                "state_key": "",
                "origin_server_ts": 1,
                "content": {"ban": 50, "kick": 50, "users": {"@a": 100}, "custom": "keep-me"},
            },
            {
                "event_id": "$r",
                "type": "m.room.redaction",
                "sender": "@mod:x",
                "origin_server_ts": 2,
                "content": {"redacts": "$pl"},
            },
        ]}}}},
    }));
    client.handle_sync_response(&response).await.unwrap();

    let room = client.room("!room:x").unwrap();
    let state = room.get_state("m.room.power_levels", "").unwrap();
    assert_eq!(state.content, json!({"ban": 50, "kick": 50, "users": {"@a": 100}}));
    assert!(state.content.get("custom").is_none());
    assert_eq!(state.unsigned["redacted_because"]["type"], "m.room.redaction");
    assert!(state.prev_content.is_none());
}

#[tokio::test]
async fn encryption_algorithm_cannot_be_downgraded() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!room:x": {"state": {"events": [{
                "event_id": "$enc1",
                "type": "m.room.encryption",
                "sender": "@a:x",
                "state_key": "",
                "content": {"algorithm": "m.megolm.v1.aes-sha2"},
            }]}}}},
        })))
        .await
        .unwrap();

    let mut events = client.streams().subscribe_events();
    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s2",
            "rooms": {"join": {"!room:x": {"timeline": {"events": [{
                "event_id": "$enc2",
                "type": "m.room.encryption",
                "sender": "@mallory:x",
                "state_key": "",
                "content": {"algorithm": "m.plaintext"},
            }]}}}},
        })))
        .await
        .unwrap();

    let room = client.room("!room:x").unwrap();
    assert_eq!(room.encryption_algorithm(), Some("m.megolm.v1.aes-sha2"));
    // The downgrade attempt was dropped before any broadcast.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn receipts_collapse_to_one_position_per_user() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!room:x": {"ephemeral": {"events": [{
                "type": "m.receipt",
                "content": {"$e1": {"m.read": {"@bob:x": {"ts": 100}}}},
            }]}}}},
        })))
        .await
        .unwrap();

    let receipts = &client.room("!room:x").unwrap().room_account_data["m.receipt"];
    assert_eq!(receipts.content, json!({"@bob:x": {"event_id": "$e1", "ts": 100}}));

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s2",
            "rooms": {"join": {"!room:x": {"ephemeral": {"events": [{
                "type": "m.receipt",
                "content": {"$e2": {"m.read": {"@bob:x": {"ts": 200}, "@carol:x": {"ts": 150}}}},
            }]}}}},
        })))
        .await
        .unwrap();

    let receipts = &client.room("!room:x").unwrap().room_account_data["m.receipt"];
    assert_eq!(
        receipts.content,
        json!({
            "@bob:x": {"event_id": "$e2", "ts": 200},
            "@carol:x": {"event_id": "$e2", "ts": 150},
        })
    );
}

#[tokio::test]
async fn invites_land_at_the_front_of_the_room_list() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!joined:x": {"timeline": {"events": []}}}},
        })))
        .await
        .unwrap();
    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s2",
            "rooms": {"invite": {"!invited:x": {"invite_state": {"events": [{
                "type": "m.room.member",
                "sender": "@a:x",
                "state_key": "@alice:example.org",
                "content": {"membership": "invite"},
            }]}}}},
        })))
        .await
        .unwrap();

    let ids: Vec<&str> = client.rooms().iter().map(|room| room.room_id.as_str()).collect();
    assert_eq!(ids, ["!invited:x", "!joined:x"]);
}

#[tokio::test]
async fn leaving_a_room_removes_it_from_the_live_list() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!room:x": {"timeline": {"events": []}}}},
        })))
        .await
        .unwrap();
    assert!(client.room("!room:x").is_some());

    let mut room_updates = client.streams().subscribe_room_updates();
    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s2",
            "rooms": {"leave": {"!room:x": {"timeline": {"events": [{
                "event_id": "$bye",
                "type": "m.room.message",
                "sender": "@alice:example.org",
                "origin_server_ts": 5,
                "content": {"msgtype": "m.text", "body": "bye"},
            }]}}}},
        })))
        .await
        .unwrap();

    assert!(client.room("!room:x").is_none());
    let update = room_updates.try_recv().unwrap();
    assert_eq!(update.room_id, "!room:x");
}

#[tokio::test]
async fn events_round_trip_through_the_store() {
    let (mut client, api, db, _env) = logged_in_client().await;

    api.push_sync_response(Ok(sync_response(json!({
        "next_batch": "s1",
        "rooms": {"join": {"!room:x": {"timeline": {"events": [{
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@bob:x",
            "origin_server_ts": 42,
            "content": {"msgtype": "m.text", "body": "persist me"},
            "unsigned": {"age": 7},
        }]}}}},
    }))));
    client.one_shot_sync().await.unwrap();

    let row = db.get_event(client_id(&db), "!room:x", "$msg").unwrap();
    assert_eq!(row.payload["content"]["body"], "persist me");
    assert_eq!(row.payload["unsigned"]["age"], 7);
    assert_eq!(row.payload["origin_server_ts"], 42);

    assert_eq!(client.prev_batch(), Some("s1"));
    assert_eq!(db.get_client("weft").unwrap().unwrap().prev_batch.as_deref(), Some("s1"));

    // A second pass advances the stored token with the response's.
    api.push_sync_response(Ok(sync_response(json!({"next_batch": "s2"}))));
    client.one_shot_sync().await.unwrap();
    assert_eq!(db.get_client("weft").unwrap().unwrap().prev_batch.as_deref(), Some("s2"));
}

#[tokio::test]
async fn first_sync_is_emitted_once_and_sorts_rooms() {
    let (mut client, api, _db, _env) = logged_in_client().await;
    let mut first_sync = client.streams().subscribe_first_sync();

    api.push_sync_response(Ok(sync_response(json!({"next_batch": "s1"}))));
    client.one_shot_sync().await.unwrap();
    assert!(client.first_sync_done());
    assert!(first_sync.try_recv().unwrap());

    api.push_sync_response(Ok(sync_response(json!({"next_batch": "s2"}))));
    client.one_shot_sync().await.unwrap();
    assert!(first_sync.try_recv().is_err(), "first sync fires exactly once");
}

#[tokio::test]
async fn unknown_token_clears_the_session() {
    let (mut client, api, _db, _env) = logged_in_client().await;
    let mut login_states = client.streams().subscribe_login_state();
    let mut errors = client.streams().subscribe_errors();

    api.push_sync_response(Err(ApiError::Matrix(MatrixError {
        errcode: "M_UNKNOWN_TOKEN".to_string(),
        error: "token expired".to_string(),
        retry_after_ms: None,
        session: None,
        authentication_flows: None,
    })));

    assert!(client.one_shot_sync().await.is_err());

    assert!(!client.is_logged());
    assert_eq!(login_states.try_recv().unwrap(), LoginState::LoggedOut);
    assert!(login_states.try_recv().is_err(), "LoggedOut is emitted exactly once");
    assert_eq!(errors.try_recv().unwrap().errcode, "M_UNKNOWN_TOKEN");

    // A subsequent one-shot sync returns immediately without touching the
    // network.
    let sync_calls_before =
        api.calls().iter().filter(|call| matches!(call, ApiCall::Sync { .. })).count();
    client.one_shot_sync().await.unwrap();
    let sync_calls_after =
        api.calls().iter().filter(|call| matches!(call, ApiCall::Sync { .. })).count();
    assert_eq!(sync_calls_before, sync_calls_after);
}

#[tokio::test]
async fn transport_failures_reach_the_sync_error_stream() {
    let (mut client, api, _db, _env) = logged_in_client().await;
    let mut sync_errors = client.streams().subscribe_sync_errors();

    api.push_sync_response(Err(ApiError::Transport("connection reset".to_string())));
    assert!(client.one_shot_sync().await.is_err());

    let error = sync_errors.try_recv().unwrap();
    assert!(error.to_string().contains("connection reset"));
    assert!(client.is_logged(), "transport failures do not end the session");
}

#[tokio::test]
async fn to_device_events_are_routed_and_broadcast() {
    let (mut client, _api, _db, _env) = logged_in_client().await;
    let mut to_device = client.streams().subscribe_to_device_events();
    let mut key_requests = client.streams().subscribe_room_key_requests();

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "to_device": {"events": [
                {"type": "m.room_key_request", "sender": "@bob:x", "content": {"action": "request"}},
                {"type": "m.dummy", "sender": "@bob:x", "content": {}},
            ]},
        })))
        .await
        .unwrap();

    assert_eq!(key_requests.try_recv().unwrap().event_type, "m.room_key_request");
    assert_eq!(to_device.try_recv().unwrap().event_type, "m.room_key_request");
    assert_eq!(to_device.try_recv().unwrap().event_type, "m.dummy");
}

#[tokio::test]
async fn state_projection_is_monotone_across_a_limited_gap() {
    let (mut client, _api, _db, _env) = logged_in_client().await;

    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s1",
            "rooms": {"join": {"!room:x": {"timeline": {"events": [
                {
                    "event_id": "$name1",
                    "type": "m.room.name",
                    "sender": "@a:x",
                    "state_key": "",
                    "content": {"name": "first"},
                },
                {
                    "event_id": "$name2",
                    "type": "m.room.name",
                    "sender": "@a:x",
                    "state_key": "",
                    "content": {"name": "second"},
                },
            ]}}}},
        })))
        .await
        .unwrap();
    let room = client.room("!room:x").unwrap();
    assert_eq!(room.get_state("m.room.name", "").unwrap().sort_order, 1.0);

    // A limited timeline resets the cursors; an event ingested at order 0
    // cannot displace state recorded at order 1.
    client
        .handle_sync_response(&sync_response(json!({
            "next_batch": "s2",
            "rooms": {"join": {"!room:x": {"timeline": {"limited": true, "prev_batch": "t9",
                "events": [{
                    "event_id": "$name3",
                    "type": "m.room.name",
                    "sender": "@a:x",
                    "state_key": "",
                    "content": {"name": "after-gap"},
                }],
            }}}},
        })))
        .await
        .unwrap();

    let room = client.room("!room:x").unwrap();
    assert_eq!(room.get_state("m.room.name", "").unwrap().content["name"], "second");
    assert_eq!(room.prev_batch.as_deref(), Some("t9"));
}
