//! Capability token generation.
//!
//! Session IDs and hub connection handles share the same shape: 16 bytes of
//! CSPRNG output, base64url-encoded without padding (22 characters from
//! `[A-Za-z0-9_-]`). Neither value is ever derived from wall-clock state.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

/// Number of random bytes backing a generated token (128 bits).
const TOKEN_BYTES: usize = 16;

/// Token length once base64url-encoded without padding.
pub const TOKEN_LEN: usize = 22;

/// Generates a fresh capability token: 16 bytes from the process CSPRNG,
/// base64url-encoded without padding.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Validates that `candidate` has the shape of a generated token: exactly
/// [`TOKEN_LEN`] characters drawn from the URL-safe base64 alphabet.
///
/// `GET /sessions/{id}` must reject any other length or alphabet with a 404,
/// not a 400 — malformed IDs are indistinguishable from unknown ones.
pub fn has_token_shape(candidate: &str) -> bool {
    candidate.len() == TOKEN_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_have_the_expected_shape() {
        for _ in 0..1_000 {
            let token = generate_token();
            assert!(has_token_shape(&token), "bad shape: {token}");
        }
    }

    #[test]
    fn generated_tokens_do_not_collide_across_many_draws() {
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            assert!(seen.insert(generate_token()), "collision detected");
        }
    }

    #[test]
    fn rejects_wrong_length_and_alphabet() {
        assert!(!has_token_shape("too-short"));
        assert!(!has_token_shape(&"a".repeat(23)));
        assert!(!has_token_shape(&"!".repeat(22)));
    }
}
