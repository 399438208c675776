//! Password based key derivation.
//!
//! `derive_key` runs PBKDF2-HMAC-SHA256 over the password and the
//! per-database salt. The iteration count is part of the on-disk format:
//! changing it makes every existing database unreadable.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KDF_ITERATIONS: u32 = 100_000;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

const HALF: usize = DERIVED_KEY_LEN / 2;

pub type Salt = [u8; SALT_LEN];

/// 32 bytes of key material. The first half signs tokens, the second half
/// encrypts them. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; DERIVED_KEY_LEN]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; DERIVED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.0[..HALF]
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.0[HALF..]
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

pub fn derive_key(password: &str, salt: &Salt) -> DerivedKey {
    let mut out = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, &mut out);
    let key = DerivedKey(out);
    out.zeroize();
    key
}

pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        assert_eq!(derive_key("pw1", &salt), derive_key("pw1", &salt));
    }

    #[test]
    fn salt_changes_the_key() {
        let a = derive_key("pw1", &[1u8; SALT_LEN]);
        let b = derive_key("pw1", &[2u8; SALT_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn key_halves_cover_the_whole_key() {
        let key = derive_key("pw1", &[3u8; SALT_LEN]);
        let mut joined = key.signing_key().to_vec();
        joined.extend_from_slice(key.encryption_key());
        assert_eq!(&joined[..], &key.as_bytes()[..]);
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = DerivedKey::from_bytes([0xAB; DERIVED_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "DerivedKey(<redacted>)");
    }
}
