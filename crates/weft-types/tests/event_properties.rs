//! Property tests for the event envelope and identifier grammar.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use weft_types::{is_valid_matrix_id, Event, EventStatus, UserId};

/// Strategy for flat JSON objects with printable string keys and scalar
/// values, enough to exercise the open-schema content handling.
fn content_map() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map("[a-z_.]{1,12}", scalar(), 0..8).prop_map(|map| {
        map.into_iter().collect()
    })
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<u32>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
    ]
}

proptest! {
    /// INVARIANT: persisting an event and reconstructing it from the stored
    /// row yields an equal event (canonical JSON round-trip).
    #[test]
    fn store_round_trip(content in content_map(), unsigned in content_map(), ts in 1u64..1u64 << 50) {
        let payload = json!({
            "event_id": "$e:x",
            "type": "m.room.message",
            "sender": "@a:x",
            "origin_server_ts": ts,
            "content": Value::Object(content),
            "unsigned": Value::Object(unsigned),
        });
        let mut event = Event::from_json(&payload, "!room:x", 0, EventStatus::Timeline);
        event.sort_order = 17.25;

        let restored = Event::from_store(
            &event.to_json(),
            "!room:x",
            event.status.as_i64(),
            event.sort_order,
        );
        prop_assert_eq!(restored, event);
    }

    /// INVARIANT: after redaction only whitelisted keys survive in
    /// `content`, `prev_content` is cleared, and the redactor's JSON is
    /// recorded.
    #[test]
    fn redaction_whitelist(content in content_map()) {
        let payload = json!({
            "event_id": "$pl:x",
            "type": "m.room.power_levels",
            "sender": "@a:x",
            "state_key": "",
            "content": Value::Object(content),
            "prev_content": {"ban": 1},
        });
        let mut event = Event::from_json(&payload, "!room:x", 0, EventStatus::RoomState);
        let redaction = Event::from_json(
            &json!({
                "event_id": "$r:x",
                "type": "m.room.redaction",
                "sender": "@mod:x",
                "content": {"redacts": "$pl:x"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );

        event.set_redaction_event(&redaction);

        let allowed = [
            "ban", "events", "events_default", "kick", "redact", "state_default", "users",
            "users_default",
        ];
        let kept = event.content.as_object().expect("content stays an object");
        for key in kept.keys() {
            prop_assert!(allowed.contains(&key.as_str()), "leaked key {key}");
        }
        prop_assert!(event.prev_content.is_none());
        prop_assert_eq!(&event.unsigned["redacted_because"], &redaction.to_json());
    }

    /// INVARIANT: any `@localpart:domain` with non-empty parts parses and
    /// splits losslessly.
    #[test]
    fn user_id_split(localpart in "[a-z0-9._=/-]{1,24}", domain in "[a-z0-9.-]{1,24}") {
        let full = format!("@{localpart}:{domain}");
        let id = UserId::parse(&full).expect("grammar accepts non-empty parts");
        prop_assert_eq!(id.localpart(), localpart.as_str());
        // The domain is everything after the first colon.
        prop_assert_eq!(format!("@{}:{}", id.localpart(), id.domain()), full.clone());
        prop_assert!(is_valid_matrix_id(&full));
    }
}
