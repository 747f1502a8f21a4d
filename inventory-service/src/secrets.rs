//! Envelope encryption for stored account secrets.
//!
//! Each secret gets its own random data key. The secret is encrypted with the
//! data key (AES-256-GCM) and the data key is wrapped with the service master
//! key. Stored form: `v1.<base64(nonce || wrapped key)>.<base64(nonce || ciphertext)>`.
//!
//! Secrets are only opened when access details are handed to the notifier.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const VERSION_TAG: &str = "v1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("master key must be 32 bytes, got {0} bytes")]
    InvalidKeyLength(usize),

    #[error("master key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    #[error("malformed sealed secret")]
    Malformed,

    #[error("sealing failed")]
    Seal,

    #[error("secret could not be opened (wrong key or tampered data)")]
    Open,
}

/// An envelope-encrypted secret as stored in the inventory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret({} bytes)", self.0.len())
    }
}

#[derive(Clone)]
pub struct SecretBox {
    master: Arc<Aes256Gcm>,
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBox")
    }
}

impl SecretBox {
    pub fn new(master_key: &[u8]) -> Result<Self, SecretError> {
        if master_key.len() != KEY_LEN {
            return Err(SecretError::InvalidKeyLength(master_key.len()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key));
        Ok(Self { master: Arc::new(cipher) })
    }

    /// Build from the base64 form used in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let key = STANDARD.decode(encoded.trim())?;
        Self::new(&key)
    }

    /// Random master key, base64 encoded. Used for local setups and tests.
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, SecretError> {
        let data_key = Aes256Gcm::generate_key(&mut OsRng);
        let data_cipher = Aes256Gcm::new(&data_key);

        let body_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let body = data_cipher
            .encrypt(&body_nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Seal)?;

        let key_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let wrapped_key = self
            .master
            .encrypt(&key_nonce, data_key.as_slice())
            .map_err(|_| SecretError::Seal)?;

        Ok(SealedSecret(format!(
            "{}.{}.{}",
            VERSION_TAG,
            STANDARD.encode(join(&key_nonce, &wrapped_key)),
            STANDARD.encode(join(&body_nonce, &body)),
        )))
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<String, SecretError> {
        let mut parts = sealed.as_str().split('.');
        let (Some(VERSION_TAG), Some(key_part), Some(body_part), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SecretError::Malformed);
        };

        let key_blob = STANDARD.decode(key_part).map_err(|_| SecretError::Malformed)?;
        let body_blob = STANDARD.decode(body_part).map_err(|_| SecretError::Malformed)?;
        let (key_nonce, wrapped_key) = split(&key_blob)?;
        let (body_nonce, body) = split(&body_blob)?;

        let data_key = self
            .master
            .decrypt(key_nonce, wrapped_key)
            .map_err(|_| SecretError::Open)?;
        if data_key.len() != KEY_LEN {
            return Err(SecretError::Malformed);
        }
        let data_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
        let plaintext = data_cipher
            .decrypt(body_nonce, body)
            .map_err(|_| SecretError::Open)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::Malformed)
    }
}

fn join(nonce: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nonce.len() + payload.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(payload);
    out
}

fn split(blob: &[u8]) -> Result<(&Nonce<<Aes256Gcm as AeadCore>::NonceSize>, &[u8]), SecretError> {
    if blob.len() <= NONCE_LEN {
        return Err(SecretError::Malformed);
    }
    let (nonce, payload) = blob.split_at(NONCE_LEN);
    Ok((Nonce::from_slice(nonce), payload))
}
