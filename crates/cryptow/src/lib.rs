// Wrapper around the hashing and randomness primitives so the rest of
// the engine never names a backend crate directly. Piece verification
// is the hottest SHA-1 path in the engine, so backends must stream.

use base64::Engine;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

pub trait ISha256 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 32];
}

pub struct Sha1 {
    inner: sha1::Sha1,
}

impl ISha1 for Sha1 {
    fn new() -> Self {
        Self {
            inner: Default::default(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        sha1::Sha1::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        let mut output = [0u8; 20];
        sha1::Sha1::finalize_into(self.inner, (&mut output[..]).into());
        output
    }
}

pub struct Sha256 {
    inner: sha2::Sha256,
}

impl ISha256 for Sha256 {
    fn new() -> Self {
        Self {
            inner: Default::default(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha2::Digest;
        sha2::Sha256::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; 32] {
        use sha2::Digest;
        let mut output = [0u8; 32];
        sha2::Sha256::finalize_into(self.inner, (&mut output[..]).into());
        output
    }
}

/// One-shot digest over a concatenation of byte slices.
pub fn sha1_many(parts: &[&[u8]]) -> [u8; 20] {
    let mut h = Sha1::new();
    for part in parts {
        h.update(part);
    }
    h.finish()
}

pub fn sha256_many(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finish()
}

/// Deterministic xorshift generator, used only when the OS entropy
/// source is unavailable. Seeded from the clock and pid so two
/// processes don't produce identical streams.
pub mod fallback {
    use std::sync::atomic::{AtomicU64, Ordering};

    static STATE: AtomicU64 = AtomicU64::new(0);

    fn seed() -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        now ^ ((std::process::id() as u64) << 32) | 1
    }

    pub fn fill(buf: &mut [u8]) {
        let mut state = STATE.load(Ordering::Relaxed);
        if state == 0 {
            state = seed();
        }
        for b in buf.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = (state >> 32) as u8;
        }
        STATE.store(state, Ordering::Relaxed);
    }
}

/// Fill `buf` with random bytes from the OS CSPRNG, falling back to the
/// deterministic generator only if the OS source fails.
pub fn random_fill(buf: &mut [u8]) {
    use rand::TryRngCore;
    if rand::rngs::OsRng.try_fill_bytes(buf).is_err() {
        fallback::fill(buf);
    }
}

pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    random_fill(&mut buf);
    u32::from_ne_bytes(buf)
}

pub fn random_u64() -> u64 {
    let mut buf = [0u8; 8];
    random_fill(&mut buf);
    u64::from_ne_bytes(buf)
}

const SSHA1_PREFIX: char = '{';
const SSHA1_SALT_LEN: usize = 8;
const SSHA1_SALT_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ./";

/// Hash a password for storage: `{` + hex(sha1(plaintext ‖ salt)) + salt.
pub fn ssha1(plaintext: &str) -> String {
    let mut salt_bytes = [0u8; SSHA1_SALT_LEN];
    random_fill(&mut salt_bytes);
    let salt: String = salt_bytes
        .iter()
        .map(|b| SSHA1_SALT_CHARSET[*b as usize % SSHA1_SALT_CHARSET.len()] as char)
        .collect();
    let digest = sha1_many(&[plaintext.as_bytes(), salt.as_bytes()]);
    format!("{SSHA1_PREFIX}{}{salt}", hex::encode(digest))
}

pub fn is_ssha1(text: &str) -> bool {
    text.starts_with(SSHA1_PREFIX) && text.len() >= 1 + 40 + SSHA1_SALT_LEN
}

/// Recompute and compare in constant time.
pub fn ssha1_matches(hashed: &str, plaintext: &str) -> bool {
    let Some(rest) = hashed.strip_prefix(SSHA1_PREFIX) else {
        return false;
    };
    if rest.len() < 40 {
        return false;
    }
    let (stored_hex, salt) = rest.split_at(40);
    let Ok(stored) = hex::decode(stored_hex) else {
        return false;
    };
    let computed = sha1_many(&[plaintext.as_bytes(), salt.as_bytes()]);
    constant_time_eq(&stored, &computed)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode base64, tolerating CR/LF line breaks in the input.
pub fn base64_decode(text: &str) -> Option<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    base64::engine::general_purpose::STANDARD.decode(cleaned).ok()
}

pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    hex::decode(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            to_hex(&sha1_many(&[b"abc"])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        // split input must hash the same as contiguous
        assert_eq!(sha1_many(&[b"ab", b"c"]), sha1_many(&[b"abc"]));
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            to_hex(&sha256_many(&[b"abc"])),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = Sha1::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finish(), sha1_many(&[b"hello world"]));
    }

    #[test]
    fn test_random_fill_not_all_zero() {
        let mut buf = [0u8; 64];
        random_fill(&mut buf);
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_fallback_path_usable() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fallback::fill(&mut a);
        fallback::fill(&mut b);
        // deterministic generator still advances between calls
        assert_ne!(a, b);
    }

    #[test]
    fn test_ssha1_round_trip() {
        let hashed = ssha1("s3kr1t");
        assert!(is_ssha1(&hashed));
        assert_eq!(hashed.len(), 1 + 40 + 8);
        assert!(ssha1_matches(&hashed, "s3kr1t"));
        assert!(!ssha1_matches(&hashed, "s3kr1t "));
        assert!(!ssha1_matches("not-a-hash", "s3kr1t"));
    }

    #[test]
    fn test_ssha1_salts_differ() {
        assert_ne!(ssha1("x"), ssha1("x"));
    }

    #[test]
    fn test_base64_round_trip() {
        for s in [&b""[..], b"f", b"fo", b"foo", b"foobar", &[0u8, 255, 128]] {
            assert_eq!(base64_decode(&base64_encode(s)).unwrap(), s);
        }
    }

    #[test]
    fn test_base64_ignores_line_breaks() {
        assert_eq!(
            base64_decode("Zm9v\r\nYmFy").unwrap(),
            b"foobar".to_vec()
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let d = sha1_many(&[b"x"]);
        assert_eq!(from_hex(&to_hex(&d)).unwrap(), d.to_vec());
    }
}
