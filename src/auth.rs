//! Per-session shared-secret tokens.
//!
//! Every bridge route carries the session token as a `?token=` query
//! parameter (the embedding UI opens SSE with `EventSource`, which cannot set
//! headers). Tokens are random, minted once per session, and compared in
//! constant time.

use uuid::Uuid;

/// Mint a fresh session token.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Check a request's token against the session's stored token.
///
/// An absent token never matches.
pub fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    provided.is_some_and(|p| constant_time_eq(expected.as_bytes(), p.as_bytes()))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_token_matches_requires_presence() {
        let token = generate_token();
        assert!(token_matches(&token, Some(&token)));
        assert!(!token_matches(&token, None));
        assert!(!token_matches(&token, Some("")));
    }

    #[test]
    fn test_tokens_are_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
