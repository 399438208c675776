//! Authenticated token envelope written to `.db` files.
//!
//! Layout before base64url encoding:
//!
//! ```text
//! version (1) | timestamp u64 BE (8) | iv (16) | AES-128-CBC ciphertext | HMAC-SHA256 (32)
//! ```
//!
//! The MAC covers every byte that precedes it and is keyed with the first
//! half of the derived key; the cipher uses the second half. This is the
//! Fernet layout, so tokens interoperate with other Fernet implementations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::Aes128;
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::kdf::DerivedKey;

pub const TOKEN_VERSION: u8 = 0x80;

const TIMESTAMP_LEN: usize = 8;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 1 + TIMESTAMP_LEN + IV_LEN;
const MIN_TOKEN_LEN: usize = HEADER_LEN + BLOCK_LEN + MAC_LEN;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not valid base64url")]
    Encoding,
    #[error("token is truncated")]
    Truncated,
    #[error("unsupported token version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("token authentication failed")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token timestamp is in the future")]
    FromTheFuture,
    #[error("token ciphertext is malformed")]
    Ciphertext,
    #[error("token payload is not UTF-8")]
    Utf8,
    #[error("invalid key length")]
    KeyLength,
}

/// Expiry rules applied after authentication. `None` disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenPolicy {
    pub ttl: Option<Duration>,
    pub max_clock_skew: Option<Duration>,
}

impl TokenPolicy {
    /// Tokens never expire. Credentials have to stay readable indefinitely.
    pub const fn never_expires() -> Self {
        Self {
            ttl: None,
            max_clock_skew: None,
        }
    }

    fn check(&self, issued_at: u64, now: u64) -> Result<(), TokenError> {
        if let Some(skew) = self.max_clock_skew {
            if issued_at > now.saturating_add(skew.as_secs()) {
                return Err(TokenError::FromTheFuture);
            }
        }
        if let Some(ttl) = self.ttl {
            if issued_at.saturating_add(ttl.as_secs()) < now {
                return Err(TokenError::Expired);
            }
        }
        Ok(())
    }
}

pub fn encrypt(key: &DerivedKey, plaintext: &str) -> Result<String, TokenError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with(key, plaintext.as_bytes(), unix_now(), iv)
}

/// Deterministic variant of [`encrypt`]; the caller supplies time and IV.
pub fn encrypt_with(
    key: &DerivedKey,
    plaintext: &[u8],
    timestamp: u64,
    iv: [u8; IV_LEN],
) -> Result<String, TokenError> {
    let ciphertext = Aes128CbcEnc::new_from_slices(key.encryption_key(), &iv)
        .map_err(|_| TokenError::KeyLength)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
    token.push(TOKEN_VERSION);
    token.extend_from_slice(&timestamp.to_be_bytes());
    token.extend_from_slice(&iv);
    token.extend_from_slice(&ciphertext);

    let mut mac = signer(key)?;
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());
    Ok(general_purpose::URL_SAFE.encode(token))
}

pub fn decrypt(key: &DerivedKey, token: &str, policy: &TokenPolicy) -> Result<String, TokenError> {
    decrypt_at(key, token, policy, unix_now())
}

pub fn decrypt_at(
    key: &DerivedKey,
    token: &str,
    policy: &TokenPolicy,
    now: u64,
) -> Result<String, TokenError> {
    let raw = general_purpose::URL_SAFE
        .decode(token.trim())
        .map_err(|_| TokenError::Encoding)?;
    if raw.len() < MIN_TOKEN_LEN {
        return Err(TokenError::Truncated);
    }
    if raw[0] != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(raw[0]));
    }

    let (signed, tag) = raw.split_at(raw.len() - MAC_LEN);
    let mut mac = signer(key)?;
    mac.update(signed);
    mac.verify_slice(tag)
        .map_err(|_| TokenError::InvalidSignature)?;

    let mut timestamp = [0u8; TIMESTAMP_LEN];
    timestamp.copy_from_slice(&signed[1..1 + TIMESTAMP_LEN]);
    policy.check(u64::from_be_bytes(timestamp), now)?;

    let iv = &signed[1 + TIMESTAMP_LEN..HEADER_LEN];
    let ciphertext = &signed[HEADER_LEN..];
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(TokenError::Ciphertext);
    }
    let plaintext = Aes128CbcDec::new_from_slices(key.encryption_key(), iv)
        .map_err(|_| TokenError::KeyLength)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| TokenError::Ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| TokenError::Utf8)
}

/// Reads the issue time without authenticating the token.
pub fn issued_at(token: &str) -> Result<u64, TokenError> {
    let raw = general_purpose::URL_SAFE
        .decode(token.trim())
        .map_err(|_| TokenError::Encoding)?;
    if raw.len() < HEADER_LEN {
        return Err(TokenError::Truncated);
    }
    let mut timestamp = [0u8; TIMESTAMP_LEN];
    timestamp.copy_from_slice(&raw[1..1 + TIMESTAMP_LEN]);
    Ok(u64::from_be_bytes(timestamp))
}

fn signer(key: &DerivedKey) -> Result<HmacSha256, TokenError> {
    <HmacSha256 as Mac>::new_from_slice(key.signing_key()).map_err(|_| TokenError::KeyLength)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
