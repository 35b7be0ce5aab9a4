//! Lossy UTF-8 decoding for arbitrarily split byte chunks.
//!
//! Invalid bytes become U+FFFD and never fail the stream. A multi-byte
//! character cut off at the end of a chunk is carried over to the next
//! chunk instead of being replaced.

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, holding back a trailing incomplete sequence
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let keep = incomplete_suffix_len(&bytes);
        self.carry = bytes.split_off(bytes.len() - keep);

        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Flush whatever is still held back
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }
}

/// Length of a trailing UTF-8 sequence that is started but not finished
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"plain text"), "plain text");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_split_multibyte_char_is_carried() {
        let snowman = "☃".as_bytes();
        let mut decoder = Utf8Decoder::new();

        assert_eq!(decoder.decode(&snowman[..1]), "");
        assert_eq!(decoder.decode(&snowman[1..2]), "");
        assert_eq!(decoder.decode(&snowman[2..]), "☃");
    }

    #[test]
    fn test_every_split_point_reconstructs_input() {
        let text = "progress ▕██▏ 42% ✔ naïve 🚀\x1b[1;32mdone\x1b[0m";
        let bytes = text.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut out = decoder.decode(&bytes[..split]);
            out.push_str(&decoder.decode(&bytes[split..]));
            assert!(decoder.finish().is_none());
            assert_eq!(out, text, "split at {}", split);
        }
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"ok \xff\xfe end");
        assert_eq!(out, "ok \u{FFFD}\u{FFFD} end");
    }

    #[test]
    fn test_finish_flushes_truncated_sequence() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"abc\xe2\x98"), "abc");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
        assert!(decoder.finish().is_none());
    }
}
