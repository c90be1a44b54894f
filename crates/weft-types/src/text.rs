//! Body text helpers: reply-fallback stripping and emote detection.

use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;

/// Leading quoted reply fallback, removed once from the start of a body.
static REPLY_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^>( \*)? <[^>]+>[^\n\r]+\r?\n(> [^\n]*\r?\n)*\r?\n")
        .expect("invariant: reply fallback pattern is valid")
});

/// A single emote: an emoji code point with an optional variation selector.
/// Covers `U+00A9`, `U+00AE`, `U+2000`–`U+3300` and the supplementary
/// planes (the surrogate-pair ranges of the source regex).
const EMOTE: &str = r"[\u{A9}\u{AE}\u{2000}-\u{3300}\u{10000}-\u{10FFFF}][\u{FE00}-\u{FE0F}]?";

static EMOTE_MATCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(EMOTE).expect("invariant: emote pattern is valid"));

static ONLY_EMOTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(?:\s|{EMOTE})*$")).expect("invariant: only-emotes pattern is valid")
});

/// Custom emotes in rich bodies are `<img>` tags carrying a
/// `data-mx-emote` or `data-mx-emoticon` attribute.
const CUSTOM_EMOTE: &str = r"<img[^>]*data-mx-(?:emote|emoticon)[^>]*>";

static ONLY_EMOTES_RICH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(?:\s|{EMOTE}|{CUSTOM_EMOTE})*$"))
        .expect("invariant: rich only-emotes pattern is valid")
});

static EMOTE_MATCH_RICH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{EMOTE}|{CUSTOM_EMOTE}"))
        .expect("invariant: rich emote-match pattern is valid")
});

/// Strip the leading reply fallback from a message body, once.
pub fn strip_reply_fallback(body: &str) -> Cow<'_, str> {
    REPLY_FALLBACK.replace(body, "")
}

/// Whether `text` consists only of emotes and whitespace. With `rich` set,
/// custom-emote `<img>` tags also count as emotes.
pub fn is_only_emotes(text: &str, rich: bool) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    if rich { ONLY_EMOTES_RICH.is_match(text) } else { ONLY_EMOTES.is_match(text) }
}

/// Number of emotes in `text`, counted with the same character class as
/// [`is_only_emotes`].
pub fn count_emotes(text: &str, rich: bool) -> usize {
    if rich {
        EMOTE_MATCH_RICH.find_iter(text).count()
    } else {
        EMOTE_MATCH.find_iter(text).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_line_reply_fallback() {
        let body = "> <@alice:example.org> original message\n\nmy reply";
        assert_eq!(strip_reply_fallback(body), "my reply");
    }

    #[test]
    fn strips_multi_line_reply_fallback() {
        let body = "> <@alice:example.org> first line\n> second line\n> third\n\nreply text";
        assert_eq!(strip_reply_fallback(body), "reply text");
    }

    #[test]
    fn strips_emote_reply_fallback() {
        let body = "> * <@alice:example.org> waves\n\nhi";
        assert_eq!(strip_reply_fallback(body), "hi");
    }

    #[test]
    fn leaves_plain_bodies_alone() {
        assert_eq!(strip_reply_fallback("no quote here"), "no quote here");
        // Quotes that are not reply fallbacks (no <sender>) stay.
        assert_eq!(strip_reply_fallback("> just a quote\n\ntext"), "> just a quote\n\ntext");
    }

    #[test]
    fn strips_only_the_leading_fallback() {
        let body = "> <@a:x> quoted\n\nreply\n> <@b:y> not a fallback";
        assert_eq!(strip_reply_fallback(body), "reply\n> <@b:y> not a fallback");
    }

    #[test]
    fn detects_only_emotes() {
        assert!(is_only_emotes("\u{1F600}", false));
        assert!(is_only_emotes("\u{1F600} \u{1F44D}\u{FE0F}", false));
        assert!(is_only_emotes("\u{2764}\u{FE0F}", false));
        assert!(!is_only_emotes("hi \u{1F600}", false));
        assert!(!is_only_emotes("", false));
        assert!(!is_only_emotes("   ", false));
    }

    #[test]
    fn rich_mode_accepts_custom_emotes() {
        let custom = r#"<img src="mxc://x/e" data-mx-emoticon alt=":w:">"#;
        assert!(is_only_emotes(custom, true));
        assert!(!is_only_emotes(custom, false));
        assert!(is_only_emotes(&format!("{custom} \u{1F600}"), true));
    }

    #[test]
    fn counts_emotes() {
        assert_eq!(count_emotes("\u{1F600}\u{1F44D}", false), 2);
        assert_eq!(count_emotes("a \u{1F600} b", false), 1);
        assert_eq!(count_emotes("none", false), 0);
        let mixed = "\u{1F600}<img data-mx-emote src=\"mxc://x/e\">";
        assert_eq!(count_emotes(mixed, true), 2);
    }
}
