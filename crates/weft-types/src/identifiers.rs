//! Matrix identifier and content-URI helpers.
//!
//! Identifiers follow the `sigil` + `localpart:domain` grammar of the Matrix
//! Client-Server specification. Content URIs (`mxc://host/id`) are resolved
//! into HTTP download or thumbnail URLs against the current homeserver.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Maximum length of a Matrix identifier in bytes.
const MAX_ID_LENGTH: usize = 255;

/// Sigils that start a Matrix identifier.
const ID_SIGILS: [char; 5] = ['@', '!', '$', '#', '+'];

/// Errors from identifier and content-URI parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    /// The identifier does not start with the expected sigil.
    #[error("missing sigil '{expected}' in identifier: {input}")]
    MissingSigil {
        /// Sigil that was expected.
        expected: char,
        /// Offending input.
        input: String,
    },

    /// The identifier has no `:` separating localpart and domain, or one of
    /// the two parts is empty.
    #[error("malformed identifier: {0}")]
    Malformed(String),

    /// The identifier exceeds the protocol's 255-byte limit.
    #[error("identifier too long: {0} bytes")]
    TooLong(usize),

    /// A content URI did not match `mxc://host/id`.
    #[error("invalid content uri: {0}")]
    InvalidContentUri(String),

    /// The homeserver base URL could not be extended into a download URL.
    #[error("invalid homeserver url: {0}")]
    InvalidHomeserver(String),
}

/// A parsed Matrix user ID of the form `@localpart:domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId {
    full: String,
    colon: usize,
}

impl UserId {
    /// Parse and validate a user ID.
    pub fn parse(input: &str) -> Result<Self, IdParseError> {
        if input.len() > MAX_ID_LENGTH {
            return Err(IdParseError::TooLong(input.len()));
        }
        if !input.starts_with('@') {
            return Err(IdParseError::MissingSigil { expected: '@', input: input.to_string() });
        }
        let colon = input
            .find(':')
            .ok_or_else(|| IdParseError::Malformed(input.to_string()))?;
        if colon == 1 || colon + 1 == input.len() {
            return Err(IdParseError::Malformed(input.to_string()));
        }

        Ok(Self { full: input.to_string(), colon })
    }

    /// The localpart, without the `@` sigil.
    pub fn localpart(&self) -> &str {
        &self.full[1..self.colon]
    }

    /// The server domain.
    pub fn domain(&self) -> &str {
        &self.full[self.colon + 1..]
    }

    /// The full `@localpart:domain` form.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Whether a string is a syntactically valid Matrix identifier of any sigil
/// (`@` user, `!` room, `$` event, `#` alias, `+` group).
pub fn is_valid_matrix_id(input: &str) -> bool {
    if input.len() > MAX_ID_LENGTH {
        return false;
    }
    let mut chars = input.chars();
    let Some(sigil) = chars.next() else {
        return false;
    };
    if !ID_SIGILS.contains(&sigil) {
        return false;
    }
    let rest = chars.as_str();
    match rest.find(':') {
        Some(colon) => colon > 0 && colon + 1 < rest.len(),
        None => false,
    }
}

/// A Matrix content URI of the form `mxc://host/mediaId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MxcUri {
    host: String,
    media_id: String,
}

impl MxcUri {
    /// Parse a `mxc://host/id` URI.
    pub fn parse(input: &str) -> Result<Self, IdParseError> {
        let rest = input
            .strip_prefix("mxc://")
            .ok_or_else(|| IdParseError::InvalidContentUri(input.to_string()))?;
        let (host, media_id) = rest
            .split_once('/')
            .ok_or_else(|| IdParseError::InvalidContentUri(input.to_string()))?;
        if host.is_empty() || media_id.is_empty() || media_id.contains('/') {
            return Err(IdParseError::InvalidContentUri(input.to_string()));
        }

        Ok(Self { host: host.to_string(), media_id: media_id.to_string() })
    }

    /// The homeserver that owns the media.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The opaque media identifier.
    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    /// HTTP download URL for this content against the given homeserver.
    pub fn download_url(&self, homeserver: &Url) -> Result<Url, IdParseError> {
        homeserver
            .join(&format!("/_matrix/media/r0/download/{}/{}", self.host, self.media_id))
            .map_err(|e| IdParseError::InvalidHomeserver(e.to_string()))
    }

    /// HTTP thumbnail URL for this content against the given homeserver.
    ///
    /// `method` is `crop` or `scale` per the media API.
    pub fn thumbnail_url(
        &self,
        homeserver: &Url,
        width: u32,
        height: u32,
        method: &str,
    ) -> Result<Url, IdParseError> {
        let mut url = homeserver
            .join(&format!("/_matrix/media/r0/thumbnail/{}/{}", self.host, self.media_id))
            .map_err(|e| IdParseError::InvalidHomeserver(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("method", method);

        Ok(url)
    }
}

impl fmt::Display for MxcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.host, self.media_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_user_id() {
        let id = UserId::parse("@alice:example.org").unwrap();
        assert_eq!(id.localpart(), "alice");
        assert_eq!(id.domain(), "example.org");
        assert_eq!(id.as_str(), "@alice:example.org");
    }

    #[test]
    fn user_id_requires_sigil() {
        assert!(matches!(
            UserId::parse("alice:example.org"),
            Err(IdParseError::MissingSigil { expected: '@', .. })
        ));
    }

    #[test]
    fn user_id_requires_both_parts() {
        assert!(UserId::parse("@:example.org").is_err());
        assert!(UserId::parse("@alice:").is_err());
        assert!(UserId::parse("@alice").is_err());
    }

    #[test]
    fn user_id_domain_may_carry_port() {
        let id = UserId::parse("@bob:server.tld:8448").unwrap();
        assert_eq!(id.localpart(), "bob");
        assert_eq!(id.domain(), "server.tld:8448");
    }

    #[test]
    fn matrix_id_validity() {
        assert!(is_valid_matrix_id("@alice:example.org"));
        assert!(is_valid_matrix_id("!room:example.org"));
        assert!(is_valid_matrix_id("$event:example.org"));
        assert!(is_valid_matrix_id("#alias:example.org"));
        assert!(!is_valid_matrix_id("alice:example.org"));
        assert!(!is_valid_matrix_id("@alice"));
        assert!(!is_valid_matrix_id("@:example.org"));
        assert!(!is_valid_matrix_id(""));
    }

    #[test]
    fn parse_mxc_uri() {
        let uri = MxcUri::parse("mxc://example.org/FHyPlCeYUSFFxlgbQYZmoEoe").unwrap();
        assert_eq!(uri.host(), "example.org");
        assert_eq!(uri.media_id(), "FHyPlCeYUSFFxlgbQYZmoEoe");
    }

    #[test]
    fn reject_bad_mxc_uris() {
        assert!(MxcUri::parse("https://example.org/x").is_err());
        assert!(MxcUri::parse("mxc://example.org").is_err());
        assert!(MxcUri::parse("mxc:///media").is_err());
        assert!(MxcUri::parse("mxc://host/a/b").is_err());
    }

    #[test]
    fn download_url_resolution() {
        let homeserver = Url::parse("https://matrix.example.org").unwrap();
        let uri = MxcUri::parse("mxc://example.org/abc123").unwrap();
        assert_eq!(
            uri.download_url(&homeserver).unwrap().as_str(),
            "https://matrix.example.org/_matrix/media/r0/download/example.org/abc123"
        );
    }

    #[test]
    fn thumbnail_url_resolution() {
        let homeserver = Url::parse("https://matrix.example.org").unwrap();
        let uri = MxcUri::parse("mxc://example.org/abc123").unwrap();
        let url = uri.thumbnail_url(&homeserver, 64, 64, "crop").unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/media/r0/thumbnail/example.org/abc123?width=64&height=64&method=crop"
        );
    }
}
