//! Operator secret hashing
//!
//! Secrets are stored as `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`.
//! The iteration count travels with the hash so it can be raised later
//! without invalidating stored credentials.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Length of generated operator secrets
pub const GENERATED_SECRET_LENGTH: usize = 16;

/// Hash a secret with a fresh random salt
pub fn hash_secret(secret: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);

    let derived = pbkdf2_sha256(secret.as_bytes(), &salt, iterations.max(1));
    format!(
        "{}${}${}${}",
        SCHEME,
        iterations.max(1),
        hex::encode(salt),
        hex::encode(derived)
    )
}

/// Check a secret against a stored hash.
///
/// Malformed stored hashes never verify.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    if scheme != SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    if iterations == 0 || expected.len() != HASH_LENGTH {
        return false;
    }

    let derived = pbkdf2_sha256(secret.as_bytes(), &salt, iterations);
    constant_time_eq(&derived, &expected)
}

/// Generate a random alphanumeric secret
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

/// PBKDF2 (RFC 8018) with HMAC-SHA256, single output block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; HASH_LENGTH] {
    let prf = HmacSha256::new_from_slice(password).expect("HMAC accepts keys of any length");

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = [0u8; HASH_LENGTH];
    u.copy_from_slice(&mac.finalize().into_bytes());
    let mut out = u;

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u);
        u.copy_from_slice(&mac.finalize().into_bytes());
        for (o, x) in out.iter_mut().zip(u.iter()) {
            *o ^= x;
        }
    }

    out
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret("hunter2", 1_000);
        assert!(hash.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify_secret("hunter2", &hash));
        assert!(!verify_secret("hunter3", &hash));
        assert!(!verify_secret("", &hash));
    }

    #[test]
    fn test_hash_is_salted() {
        let a = hash_secret("same", 10);
        let b = hash_secret("same", 10);
        assert_ne!(a, b);
        assert!(verify_secret("same", &a));
        assert!(verify_secret("same", &b));
    }

    #[test]
    fn test_hash_never_contains_plaintext() {
        let hash = hash_secret("plaintext-secret", 10);
        assert!(!hash.contains("plaintext-secret"));
    }

    #[test]
    fn test_pbkdf2_rfc7914_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 P="passwd" S="salt" c=1
        let derived = pbkdf2_sha256(b"passwd", b"salt", 1);
        assert_eq!(
            hex::encode(derived),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn test_malformed_hashes_never_verify() {
        assert!(!verify_secret("x", ""));
        assert!(!verify_secret("x", "plain"));
        assert!(!verify_secret("x", "bcrypt$10$aa$bb"));
        assert!(!verify_secret("x", "pbkdf2-sha256$0$aa$bb"));
        assert!(!verify_secret("x", "pbkdf2-sha256$10$zz$bb"));
        assert!(!verify_secret("x", "pbkdf2-sha256$10$aa$bb$extra"));
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), GENERATED_SECRET_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
