//! Storage key normalization.
//!
//! Backends may cap key length. Keys within the cap are stored as-is; longer
//! keys are replaced by a prefixed SHA-256 digest of fixed width.

use sha2::{Digest, Sha256};

const HASH_PREFIX: &str = "sha256:";
const HASH_HEX_CHARS: usize = 34;

/// Width of a hashed key: `"sha256:"` plus 34 hex characters.
pub const HASHED_KEY_LEN: usize = HASH_PREFIX.len() + HASH_HEX_CHARS;

/// Returns `key` unchanged when it fits in `max_len` characters, otherwise its
/// hashed form.
pub fn normalize_key(key: &str, max_len: usize) -> String {
    if key.chars().count() <= max_len {
        return key.to_string();
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{HASH_PREFIX}{}", &digest[..HASH_HEX_CHARS])
}

/// Name of the lock record guarding `name`.
pub fn lock_key(name: &str, max_len: usize) -> String {
    normalize_key(&format!("{name}_lock"), max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_pass_through() {
        let key = "a".repeat(64);
        assert_eq!(normalize_key(&key, 64), key);
        assert_eq!(normalize_key("feed/run-1", 64), "feed/run-1");
    }

    #[test]
    fn long_keys_hash_to_fixed_width_with_prefix() {
        let long = "x".repeat(65);
        let hashed = normalize_key(&long, 64);
        assert_eq!(hashed.len(), HASHED_KEY_LEN);
        assert_eq!(HASHED_KEY_LEN, 41);
        assert!(hashed.starts_with("sha256:"));
        assert_eq!(hashed, normalize_key(&long, 64));

        let other = normalize_key(&"y".repeat(65), 64);
        assert_ne!(hashed, other);
    }

    #[test]
    fn lock_key_appends_suffix_before_hashing() {
        assert_eq!(lock_key("feed/run-1", 64), "feed/run-1_lock");
        let name = "n".repeat(60);
        assert_eq!(lock_key(&name, 64).len(), HASHED_KEY_LEN);
    }
}
