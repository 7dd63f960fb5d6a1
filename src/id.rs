//! Deterministic message identifiers.
//!
//! `id = BASE64(SHA1(f64_bytes(due_time_ms) || utf8(text)))`, padding
//! stripped, fixed 27 characters. Deterministic in `(time, text)` so retries
//! and duplicate submissions are side-effect-free (Invariant 2 / §8).

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha1::{Digest, Sha1};

/// Length of a message id: a SHA-1 digest (20 bytes) base64-encoded without
/// padding is always 27 characters.
pub const ID_LEN: usize = 27;

/// Encode an instant (in ms, as an `f64` to match the pub/sub wire format
/// *before* rounding) to its 8-byte host-endian representation.
pub fn f64_bytes(due_time_ms: f64) -> [u8; 8] {
    due_time_ms.to_ne_bytes()
}

/// Compute the message id for a `(due_time_ms, text)` pair.
///
/// `due_time_ms` is taken as an `f64` here (not yet rounded to an integer)
/// per the wire format note in the data model: the id is derived from the
/// due-time *before* it is rounded to milliseconds, so a caller passing an
/// already-integral `i64` due-time should convert with `as f64` to match.
pub fn message_id(due_time_ms: f64, text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(f64_bytes(due_time_ms));
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    STANDARD_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_fixed_length() {
        let id = message_id(1_700_000_000_123.0, "hello");
        assert_eq!(id.len(), ID_LEN);
        assert!(!id.contains('='));
    }

    #[test]
    fn id_is_deterministic() {
        let a = message_id(42.0, "same payload");
        let b = message_id(42.0, "same payload");
        assert_eq!(a, b);
    }

    #[test]
    fn id_changes_with_time_or_text() {
        let base = message_id(42.0, "payload");
        assert_ne!(base, message_id(43.0, "payload"));
        assert_ne!(base, message_id(42.0, "payload2"));
    }
}
