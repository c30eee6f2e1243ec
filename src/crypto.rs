//! Symmetric crypto collaborator: the trait the engine drives, plus the
//! AES-256-GCM default implementation.
//!
//! The engine never touches crypto primitives directly. Everything it needs is
//! behind [`CryptoProvider`]; embedders with FIPS or hardware requirements
//! implement the trait themselves.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// IV length the default provider uses (AES-GCM nonce).
pub const IV_LEN: usize = 12;

/// Key material length the default provider expects.
pub const KEY_LEN: usize = 32;

/// Field-level encryption algorithm. The discriminant doubles as the on-wire
/// blob subtype byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Algorithm {
    /// Same plaintext + key + IV produces the same ciphertext. Queryable.
    Deterministic = 1,
    /// Fresh IV per encryption. Stronger, not queryable.
    Randomized = 2,
}

impl Algorithm {
    /// Wire tag (also the ciphertext blob subtype).
    pub fn as_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Algorithm::Deterministic),
            2 => Some(Algorithm::Randomized),
            _ => None,
        }
    }
}

/// Decrypted document-key bytes, zeroed on drop.
pub type KeyMaterial = Zeroizing<Vec<u8>>;

/// The symmetric primitive contract the engine consumes.
///
/// `encrypt` must produce self-contained output: `decrypt` receives only the
/// key material and the ciphertext bytes, so any IV the scheme needs has to
/// travel inside the ciphertext.
pub trait CryptoProvider: Send + Sync {
    fn random_iv(&self) -> Result<Vec<u8>>;

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Default provider: AES-256-GCM with the 12-byte nonce prepended to the AEAD
/// output.
pub struct AesGcmCrypto;

impl AesGcmCrypto {
    fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
        if key.len() != KEY_LEN {
            return Err(Error::collaborator(format!(
                "key material must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::collaborator("failed to initialize cipher"))
    }
}

impl CryptoProvider for AesGcmCrypto {
    fn random_iv(&self) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        getrandom(&mut iv).map_err(|_| Error::collaborator("random source unavailable"))?;
        Ok(iv.to_vec())
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != IV_LEN {
            return Err(Error::collaborator(format!(
                "iv must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let cipher = Self::cipher(key)?;
        let nonce = Nonce::from_slice(iv);
        let payload = Payload { msg: plaintext, aad: &[] };
        let sealed = cipher
            .encrypt(nonce, payload)
            .map_err(|_| Error::collaborator("encryption failed"))?;

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() <= IV_LEN {
            return Err(Error::collaborator("ciphertext too short"));
        }
        let cipher = Self::cipher(key)?;
        let (iv, sealed) = ciphertext.split_at(IV_LEN);
        let nonce = Nonce::from_slice(iv);
        let payload = Payload { msg: sealed, aad: &[] };
        cipher
            .decrypt(nonce, payload)
            .map_err(|_| Error::collaborator("decryption failed"))
    }
}
