//! Localized event summaries.
//!
//! Rendering a timeline or room-list preview needs one human sentence per
//! event. The wording is pluggable through [`Localizations`]; the dispatch
//! over event types and membership transitions lives here and is shared by
//! every language.

use crate::{text, Event, Membership};

/// Message types whose summary is the body itself, prefixed with the sender
/// name in room-list previews.
const TEXT_LIKE_MSGTYPES: [&str; 4] = ["m.text", "m.notice", "m.emote", "m.none"];

/// Pluggable string provider for event summaries.
pub trait Localizations: Send + Sync {
    /// Name used for the local user in previews.
    fn you(&self) -> String;
    /// `target` accepted an invitation.
    fn accepted_invitation(&self, target: &str) -> String;
    /// `target` rejected their invitation.
    fn rejected_invitation(&self, target: &str) -> String;
    /// `sender` withdrew `target`'s invitation.
    fn invitation_withdrawn(&self, sender: &str, target: &str) -> String;
    /// `target` joined.
    fn joined(&self, target: &str) -> String;
    /// `sender` kicked and banned `target`.
    fn kicked_and_banned(&self, sender: &str, target: &str) -> String;
    /// `sender` kicked `target`.
    fn kicked(&self, sender: &str, target: &str) -> String;
    /// `target` left.
    fn left(&self, target: &str) -> String;
    /// `sender` banned `target`.
    fn banned(&self, sender: &str, target: &str) -> String;
    /// `sender` unbanned `target`.
    fn unbanned(&self, sender: &str, target: &str) -> String;
    /// `sender` invited `target`.
    fn invited(&self, sender: &str, target: &str) -> String;
    /// `target` changed their avatar.
    fn changed_avatar(&self, target: &str) -> String;
    /// `target` changed their display name.
    fn changed_displayname(&self, target: &str) -> String;
    /// `sender` created the room.
    fn room_created(&self, sender: &str) -> String;
    /// `sender` enabled end-to-end encryption.
    fn activated_encryption(&self, sender: &str) -> String;
    /// `sender` redacted a message.
    fn redacted_message(&self, sender: &str) -> String;
    /// `sender` sent a picture.
    fn sent_a_picture(&self, sender: &str) -> String;
    /// `sender` sent a file.
    fn sent_a_file(&self, sender: &str) -> String;
    /// `sender` sent an audio message.
    fn sent_an_audio(&self, sender: &str) -> String;
    /// `sender` sent a video.
    fn sent_a_video(&self, sender: &str) -> String;
    /// `sender` shared their location.
    fn shared_location(&self, sender: &str) -> String;
    /// `sender` sent a sticker.
    fn sent_a_sticker(&self, sender: &str) -> String;
    /// An event of a type this client cannot summarize.
    fn unknown_event(&self, event_type: &str) -> String;
}

/// Context for rendering one event's summary.
#[derive(Debug, Clone, Copy)]
pub struct SummaryContext<'a> {
    /// Display name of the event's sender.
    pub sender_name: &'a str,
    /// Display name of the member a state event addresses (its state key).
    pub target_name: &'a str,
    /// Whether the sender is the local user.
    pub sender_is_self: bool,
    /// Whether the summary is rendered for a room-list preview. Previews
    /// prefix the sender name for text-like messages.
    pub room_preview: bool,
}

/// Render a localized one-line summary for `event`.
pub fn localized_body(event: &Event, l10n: &dyn Localizations, ctx: &SummaryContext<'_>) -> String {
    match event.event_type.as_str() {
        "m.room.member" => member_summary(event, l10n, ctx),
        "m.room.create" => l10n.room_created(ctx.sender_name),
        "m.room.encryption" => l10n.activated_encryption(ctx.sender_name),
        "m.room.redaction" => l10n.redacted_message(ctx.sender_name),
        "m.room.message" | "m.sticker" => message_summary(event, l10n, ctx),
        other => l10n.unknown_event(other),
    }
}

fn member_summary(event: &Event, l10n: &dyn Localizations, ctx: &SummaryContext<'_>) -> String {
    let sender = ctx.sender_name;
    let target = ctx.target_name;
    let old = event.prev_membership();
    let new = event.membership();
    // A member changing their own state has sender == state key.
    let own_change = event.state_key.as_deref() == Some(event.sender_id.as_str());

    match (old, new) {
        (Membership::Invite, Membership::Join) => l10n.accepted_invitation(target),
        (Membership::Invite, Membership::Leave) if own_change => l10n.rejected_invitation(target),
        (Membership::Invite, Membership::Leave) => l10n.invitation_withdrawn(sender, target),
        (Membership::Leave, Membership::Join) => l10n.joined(target),
        (Membership::Join, Membership::Ban) => l10n.kicked_and_banned(sender, target),
        (Membership::Join, Membership::Leave) if own_change => l10n.left(target),
        (Membership::Join, Membership::Leave) => l10n.kicked(sender, target),
        (Membership::Invite | Membership::Leave, Membership::Ban) => l10n.banned(sender, target),
        (Membership::Ban, Membership::Leave) => l10n.unbanned(sender, target),
        (_, Membership::Invite) => l10n.invited(sender, target),
        (Membership::Join, Membership::Join) => {
            let changed = |key: &str| {
                event.content.get(key)
                    != event.prev_content.as_ref().and_then(|prev| prev.get(key))
            };
            if changed("displayname") {
                l10n.changed_displayname(target)
            } else if changed("avatar_url") {
                l10n.changed_avatar(target)
            } else {
                l10n.unknown_event(&event.event_type)
            }
        },
        _ => l10n.unknown_event(&event.event_type),
    }
}

fn message_summary(event: &Event, l10n: &dyn Localizations, ctx: &SummaryContext<'_>) -> String {
    let sender = ctx.sender_name;
    let msgtype = event.message_type();
    match msgtype {
        "m.image" => l10n.sent_a_picture(sender),
        "m.file" => l10n.sent_a_file(sender),
        "m.audio" => l10n.sent_an_audio(sender),
        "m.video" => l10n.sent_a_video(sender),
        "m.location" => l10n.shared_location(sender),
        "m.sticker" => l10n.sent_a_sticker(sender),
        _ => {
            let body = text::strip_reply_fallback(event.body()).into_owned();
            if ctx.room_preview && TEXT_LIKE_MSGTYPES.contains(&msgtype) {
                let name = if ctx.sender_is_self { l10n.you() } else { sender.to_string() };
                format!("{name}: {body}")
            } else {
                body
            }
        },
    }
}

/// Built-in English wording.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnglishLocalizations;

impl Localizations for EnglishLocalizations {
    fn you(&self) -> String {
        "You".to_string()
    }

    fn accepted_invitation(&self, target: &str) -> String {
        format!("{target} accepted the invitation")
    }

    fn rejected_invitation(&self, target: &str) -> String {
        format!("{target} rejected the invitation")
    }

    fn invitation_withdrawn(&self, sender: &str, target: &str) -> String {
        format!("{sender} withdrew the invitation for {target}")
    }

    fn joined(&self, target: &str) -> String {
        format!("{target} joined the room")
    }

    fn kicked_and_banned(&self, sender: &str, target: &str) -> String {
        format!("{sender} kicked and banned {target}")
    }

    fn kicked(&self, sender: &str, target: &str) -> String {
        format!("{sender} kicked {target}")
    }

    fn left(&self, target: &str) -> String {
        format!("{target} left the room")
    }

    fn banned(&self, sender: &str, target: &str) -> String {
        format!("{sender} banned {target}")
    }

    fn unbanned(&self, sender: &str, target: &str) -> String {
        format!("{sender} unbanned {target}")
    }

    fn invited(&self, sender: &str, target: &str) -> String {
        format!("{sender} invited {target}")
    }

    fn changed_avatar(&self, target: &str) -> String {
        format!("{target} changed their avatar")
    }

    fn changed_displayname(&self, target: &str) -> String {
        format!("{target} changed their display name")
    }

    fn room_created(&self, sender: &str) -> String {
        format!("{sender} created the room")
    }

    fn activated_encryption(&self, sender: &str) -> String {
        format!("{sender} activated end-to-end encryption")
    }

    fn redacted_message(&self, sender: &str) -> String {
        format!("{sender} redacted a message")
    }

    fn sent_a_picture(&self, sender: &str) -> String {
        format!("{sender} sent a picture")
    }

    fn sent_a_file(&self, sender: &str) -> String {
        format!("{sender} sent a file")
    }

    fn sent_an_audio(&self, sender: &str) -> String {
        format!("{sender} sent an audio message")
    }

    fn sent_a_video(&self, sender: &str) -> String {
        format!("{sender} sent a video")
    }

    fn shared_location(&self, sender: &str) -> String {
        format!("{sender} shared their location")
    }

    fn sent_a_sticker(&self, sender: &str) -> String {
        format!("{sender} sent a sticker")
    }

    fn unknown_event(&self, event_type: &str) -> String {
        format!("Unknown event {event_type}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::EventStatus;

    fn member_event(
        sender: &str,
        state_key: &str,
        old: Option<&str>,
        new: &str,
    ) -> Event {
        let mut payload = json!({
            "event_id": "$m",
            "type": "m.room.member",
            "sender": sender,
            "state_key": state_key,
            "content": {"membership": new},
        });
        if let Some(old) = old {
            payload["prev_content"] = json!({"membership": old});
        }
        Event::from_json(&payload, "!room:x", 0, EventStatus::Timeline)
    }

    fn ctx<'a>(sender: &'a str, target: &'a str) -> SummaryContext<'a> {
        SummaryContext { sender_name: sender, target_name: target, sender_is_self: false, room_preview: false }
    }

    #[test]
    fn membership_transitions() {
        let l10n = EnglishLocalizations;
        let cases = [
            (member_event("@b:x", "@b:x", Some("invite"), "join"), "Bob accepted the invitation"),
            (member_event("@b:x", "@b:x", Some("invite"), "leave"), "Bob rejected the invitation"),
            (
                member_event("@a:x", "@b:x", Some("invite"), "leave"),
                "Alice withdrew the invitation for Bob",
            ),
            (member_event("@b:x", "@b:x", Some("leave"), "join"), "Bob joined the room"),
            (member_event("@b:x", "@b:x", None, "join"), "Bob joined the room"),
            (member_event("@a:x", "@b:x", Some("join"), "ban"), "Alice kicked and banned Bob"),
            (member_event("@a:x", "@b:x", Some("join"), "leave"), "Alice kicked Bob"),
            (member_event("@b:x", "@b:x", Some("join"), "leave"), "Bob left the room"),
            (member_event("@a:x", "@b:x", Some("invite"), "ban"), "Alice banned Bob"),
            (member_event("@a:x", "@b:x", Some("leave"), "ban"), "Alice banned Bob"),
            (member_event("@a:x", "@b:x", Some("ban"), "leave"), "Alice unbanned Bob"),
            (member_event("@a:x", "@b:x", None, "invite"), "Alice invited Bob"),
        ];
        for (event, expected) in cases {
            assert_eq!(localized_body(&event, &l10n, &ctx("Alice", "Bob")), expected);
        }
    }

    #[test]
    fn profile_changes() {
        let l10n = EnglishLocalizations;
        let displayname = Event::from_json(
            &json!({
                "type": "m.room.member",
                "sender": "@b:x",
                "state_key": "@b:x",
                "content": {"membership": "join", "displayname": "Bobby"},
                "prev_content": {"membership": "join", "displayname": "Bob"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert_eq!(
            localized_body(&displayname, &l10n, &ctx("Alice", "Bob")),
            "Bob changed their display name"
        );

        let avatar = Event::from_json(
            &json!({
                "type": "m.room.member",
                "sender": "@b:x",
                "state_key": "@b:x",
                "content": {"membership": "join", "avatar_url": "mxc://x/new"},
                "prev_content": {"membership": "join", "avatar_url": "mxc://x/old"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert_eq!(
            localized_body(&avatar, &l10n, &ctx("Alice", "Bob")),
            "Bob changed their avatar"
        );
    }

    #[test]
    fn preview_prefixes_text_like_messages_only() {
        let l10n = EnglishLocalizations;
        let text = Event::from_json(
            &json!({
                "type": "m.room.message",
                "sender": "@a:x",
                "content": {"msgtype": "m.text", "body": "hello"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        let preview = SummaryContext {
            sender_name: "Alice",
            target_name: "",
            sender_is_self: false,
            room_preview: true,
        };
        assert_eq!(localized_body(&text, &l10n, &preview), "Alice: hello");

        let own = SummaryContext { sender_is_self: true, ..preview };
        assert_eq!(localized_body(&text, &l10n, &own), "You: hello");

        let image = Event::from_json(
            &json!({
                "type": "m.room.message",
                "sender": "@a:x",
                "content": {"msgtype": "m.image", "body": "cat.png"},
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert_eq!(localized_body(&image, &l10n, &preview), "Alice sent a picture");
    }

    #[test]
    fn reply_fallback_is_stripped_from_summaries() {
        let l10n = EnglishLocalizations;
        let event = Event::from_json(
            &json!({
                "type": "m.room.message",
                "sender": "@a:x",
                "content": {
                    "msgtype": "m.text",
                    "body": "> <@b:x> earlier\n\nlater",
                },
            }),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert_eq!(localized_body(&event, &l10n, &ctx("Alice", "")), "later");
    }

    #[test]
    fn unknown_events_fall_through() {
        let l10n = EnglishLocalizations;
        let event = Event::from_json(
            &json!({"type": "org.custom.widget", "sender": "@a:x", "content": {}}),
            "!room:x",
            0,
            EventStatus::Timeline,
        );
        assert_eq!(localized_body(&event, &l10n, &ctx("Alice", "")), "Unknown event org.custom.widget");
    }
}
