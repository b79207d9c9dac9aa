//! Line codec — Shift_JIS text, CRLF-terminated
//!
//! The legacy network speaks single-byte-era Japanese text. Reads drain every
//! immediately-available byte per burst; the drained text is then split on
//! line endings so two quick writes from a peer never merge into one parse.

use encoding_rs::SHIFT_JIS;

pub const LINE_ENDING: &[u8] = b"\r\n";

/// Maximum bytes accepted in one read burst.
pub const MAX_BURST_SIZE: usize = 64 * 1024;

/// Encode one logical message as `text + CRLF` in the legacy encoding.
pub fn encode_line(text: &str) -> Vec<u8> {
    let (encoded, _, _) = SHIFT_JIS.encode(text);
    let mut bytes = encoded.into_owned();
    bytes.extend_from_slice(LINE_ENDING);
    bytes
}

/// Decode a byte burst from the legacy encoding. Malformed sequences become
/// replacement characters rather than errors.
pub fn decode(bytes: &[u8]) -> String {
    let (text, _, _) = SHIFT_JIS.decode(bytes);
    text.into_owned()
}

/// Encode a payload without the line terminator (signature input).
pub fn encode_text(text: &str) -> Vec<u8> {
    SHIFT_JIS.encode(text).0.into_owned()
}

/// Split drained text into individual messages, dropping blank lines.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_crlf() {
        let bytes = encode_line("615 1 E1");
        assert!(bytes.ends_with(b"\r\n"));
        assert_eq!(&bytes[..8], b"615 1 E1");
    }

    #[test]
    fn test_shift_jis_roundtrip() {
        let text = "551 1 sig:2026/01/01 00-00-00:震度5強";
        let bytes = encode_line(text);
        let decoded = decode(&bytes);
        assert_eq!(decoded.trim_end(), text);
    }

    #[test]
    fn test_non_utf8_wire_bytes() {
        // "震" in Shift_JIS is 0x90 0x6B, not valid UTF-8 on its own
        let bytes = encode_text("震");
        assert_eq!(bytes, vec![0x90, 0x6B]);
        assert_eq!(decode(&bytes), "震");
    }

    #[test]
    fn test_split_coalesced_burst() {
        let burst = "611 1\r\n615 2 E1:body\r\n";
        let lines = split_lines(burst);
        assert_eq!(lines, vec!["611 1", "615 2 E1:body"]);
    }

    #[test]
    fn test_split_drops_blank_lines() {
        assert!(split_lines("\r\n\r\n").is_empty());
        assert_eq!(split_lines("239 1\r\n").len(), 1);
    }
}
