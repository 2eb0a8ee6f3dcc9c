//! Protocol utilities for the WebSocket handshake
//!
//! Handles room extraction from the request path and origin validation.

use gridsync_protocol::parse_room_key;
use url::Url;

/// Room named by a request URI
///
/// The room is the last path segment (`/sheet-42`, `/rooms/sheet-42`);
/// the query string is ignored. Returns `None` unless it is a valid room key.
pub fn parse_room_from_uri(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let room = path.trim_end_matches('/').rsplit('/').next()?;
    parse_room_key(room).map(|_| room.to_string())
}

/// Validate an origin header against the allow-list using strict URL parsing
///
/// An empty allow-list accepts every origin. Otherwise scheme, host and port
/// must match an entry exactly, which rejects look-alikes such as
/// `https://sheets.example.com.evil.io`.
pub fn validate_origin(origin: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Ok(origin_url) = Url::parse(origin) else {
        return false;
    };

    allowed.iter().any(|allowed| {
        let Ok(allowed_url) = Url::parse(allowed) else {
            return false;
        };
        origin_url.scheme() == allowed_url.scheme()
            && origin_url.host_str() == allowed_url.host_str()
            && origin_url.port_or_known_default() == allowed_url.port_or_known_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(origins: &[&str]) -> Vec<String> {
        origins.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_room() {
        assert_eq!(parse_room_from_uri("/sheet-42"), Some("sheet-42".to_string()));
        assert_eq!(parse_room_from_uri("/rooms/sheet-a_b/"), Some("sheet-a_b".to_string()));
        assert_eq!(parse_room_from_uri("/sheet-42?token=x"), Some("sheet-42".to_string()));
        assert_eq!(parse_room_from_uri("/"), None);
        assert_eq!(parse_room_from_uri("/doc-42"), None);
        assert_eq!(parse_room_from_uri("/sheet-%2e%2e"), None);
    }

    #[test]
    fn empty_allow_list_accepts_all() {
        assert!(validate_origin("http://anything.example", &[]));
        assert!(validate_origin("not-a-url", &[]));
    }

    #[test]
    fn test_validate_origin_valid() {
        let allowed = allow(&["https://sheets.example.com", "http://localhost:8080"]);
        assert!(validate_origin("https://sheets.example.com", &allowed));
        assert!(validate_origin("https://sheets.example.com:443", &allowed));
        assert!(validate_origin("http://localhost:8080", &allowed));
    }

    #[test]
    fn test_validate_origin_bypass_attempts() {
        let allowed = allow(&["https://sheets.example.com", "http://localhost:8080"]);
        assert!(!validate_origin("https://sheets.example.com.evil.io", &allowed));
        assert!(!validate_origin("http://sheets.example.com", &allowed));
        assert!(!validate_origin("http://localhost:9999", &allowed));
        assert!(!validate_origin("http://localhostevil.com:8080", &allowed));
        assert!(!validate_origin("not-a-url", &allowed));
        assert!(!validate_origin("", &allowed));
    }
}
