//! API key generation and hashing.
//!
//! Keys are shown to the operator exactly once at creation. The ledger only
//! stores the SHA-256 digest.

use rand::RngCore;
use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "rrl_";
const KEY_BYTES: usize = 24;

/// Generate a new random API key.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", KEY_PREFIX, hex::encode(bytes))
}

/// Hex-encoded SHA-256 of the key.
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)
}

/// Cheap shape check before touching the ledger.
pub fn is_well_formed(key: &str) -> bool {
    key.strip_prefix(KEY_PREFIX)
        .map(|rest| rest.len() == KEY_BYTES * 2 && rest.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_well_formed() {
        let key = generate_api_key();
        assert!(key.starts_with("rrl_"));
        assert!(is_well_formed(&key));
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_api_key("rrl_abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("rrl_abc"));
        assert_ne!(hash, hash_api_key("rrl_abd"));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("rrl_short"));
        assert!(!is_well_formed(&format!("sk_{}", "0".repeat(48))));
        assert!(!is_well_formed(&format!("rrl_{}", "z".repeat(48))));
    }
}
