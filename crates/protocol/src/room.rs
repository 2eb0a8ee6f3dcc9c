//! Room naming
//!
//! Every replica of a sheet joins the relay room `sheet-<sheet_id>`.

/// Prefix shared by every sheet room
pub const ROOM_PREFIX: &str = "sheet-";

/// Longest accepted sheet identifier
pub const MAX_SHEET_ID_LEN: usize = 128;

/// Room key for a sheet
pub fn room_key(sheet_id: &str) -> String {
    format!("{ROOM_PREFIX}{sheet_id}")
}

/// Whether a sheet identifier can be used in a room key and a URL path
pub fn is_valid_sheet_id(sheet_id: &str) -> bool {
    !sheet_id.is_empty()
        && sheet_id.len() <= MAX_SHEET_ID_LEN
        && sheet_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract the sheet id from a room key, validating it
pub fn parse_room_key(room: &str) -> Option<&str> {
    room.strip_prefix(ROOM_PREFIX)
        .filter(|sheet_id| is_valid_sheet_id(sheet_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_round_trips() {
        assert_eq!(room_key("42"), "sheet-42");
        assert_eq!(parse_room_key("sheet-42"), Some("42"));
    }

    #[test]
    fn rejects_foreign_or_unsafe_rooms() {
        assert_eq!(parse_room_key("doc-42"), None);
        assert_eq!(parse_room_key("sheet-"), None);
        assert_eq!(parse_room_key("sheet-../etc"), None);
        assert_eq!(parse_room_key(&format!("sheet-{}", "a".repeat(129))), None);
    }
}
