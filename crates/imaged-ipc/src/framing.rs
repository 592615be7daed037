//! Length-prefix framing and base64 line encoding
//!
//! ```text
//! frame   = [4 bytes: payload length, big-endian][payload]
//! line    = base64(bytes) "\n"
//! ```
//!
//! Lines that are not well-formed base64 are transport noise (stray prints,
//! partial writes) and are skipped by readers rather than treated as fatal.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use thiserror::Error;

pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("empty line")]
    Empty,

    #[error("line length {0} is not a multiple of 4")]
    BadLength(usize),

    #[error("invalid base64 character {0:?} at offset {1}")]
    BadCharacter(char, usize),

    #[error("base64 decode failed: {0}")]
    Decode(String),

    #[error("frame shorter than its length prefix")]
    MissingPrefix,

    #[error("frame declares {declared} bytes but carries {available}")]
    Truncated { declared: usize, available: usize },

    #[error("payload of {0} bytes exceeds the u32 length prefix")]
    TooLarge(usize),
}

/// Prepend the 4-byte big-endian payload length.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::TooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a frame back into its payload. Bytes past the declared length are ignored.
pub fn unframe(framed: &[u8]) -> Result<&[u8], FramingError> {
    if framed.len() < LENGTH_PREFIX_SIZE {
        return Err(FramingError::MissingPrefix);
    }
    let (prefix, rest) = framed.split_at(LENGTH_PREFIX_SIZE);
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    if declared > rest.len() {
        return Err(FramingError::Truncated {
            declared,
            available: rest.len(),
        });
    }
    Ok(&rest[..declared])
}

/// Base64 for transmission as one line (no trailing newline).
pub fn encode_line(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Validate and decode one received line. Surrounding whitespace (including
/// a trailing `\r`) is ignored.
pub fn decode_line(line: &str) -> Result<Vec<u8>, FramingError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(FramingError::Empty);
    }
    if line.len() % 4 != 0 {
        return Err(FramingError::BadLength(line.len()));
    }
    if let Some((i, c)) = line
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')))
    {
        return Err(FramingError::BadCharacter(c, i));
    }
    B64.decode(line)
        .map_err(|e| FramingError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_prefix_is_big_endian() {
        let framed = frame(&[0xAA; 258]).unwrap();
        assert_eq!(&framed[..4], &[0, 0, 1, 2]);
        assert_eq!(framed.len(), 262);
    }

    #[test]
    fn test_unframe_roundtrip() {
        let framed = frame(b"sealed command").unwrap();
        assert_eq!(unframe(&framed).unwrap(), b"sealed command");
    }

    #[test]
    fn test_unframe_ignores_trailing_bytes() {
        let mut framed = frame(b"abc").unwrap();
        framed.extend_from_slice(b"junk");
        assert_eq!(unframe(&framed).unwrap(), b"abc");
    }

    #[test]
    fn test_unframe_truncated() {
        let mut framed = frame(b"abcdef").unwrap();
        framed.truncate(7);
        assert_eq!(
            unframe(&framed),
            Err(FramingError::Truncated {
                declared: 6,
                available: 3
            })
        );
        assert_eq!(unframe(&[0, 0]), Err(FramingError::MissingPrefix));
    }

    #[test]
    fn test_decode_line_roundtrip_with_crlf() {
        let line = format!("{}\r\n", encode_line(b"hello"));
        assert_eq!(decode_line(&line).unwrap(), b"hello");
    }

    #[test]
    fn test_decode_line_bad_length() {
        assert_eq!(decode_line("abcde"), Err(FramingError::BadLength(5)));
    }

    #[test]
    fn test_decode_line_rejects_log_noise() {
        // Stray output from the worker must never be mistaken for a frame
        let result = decode_line("INFO - Secure backend initialized");
        assert!(matches!(result, Err(FramingError::BadCharacter(' ', _))));
    }

    #[test]
    fn test_decode_line_empty() {
        assert_eq!(decode_line(""), Err(FramingError::Empty));
        assert_eq!(decode_line("   \n"), Err(FramingError::Empty));
    }

    #[test]
    fn test_decode_line_misplaced_padding() {
        assert!(matches!(decode_line("ab=c"), Err(FramingError::Decode(_))));
    }

    proptest! {
        #[test]
        fn prop_truncated_frame_is_rejected(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            cut in any::<prop::sample::Index>(),
        ) {
            let framed = frame(&payload).unwrap();
            let keep = cut.index(framed.len());
            prop_assert!(unframe(&framed[..keep]).is_err());
        }
    }
}
