//! Symmetric encryption of per-agent service tokens.
//!
//! AES-256-GCM with a PBKDF2-SHA256 key derived from a process-wide secret.
//! Wire format: `base64(salt || nonce || ciphertext)` with a fresh random
//! salt and nonce per encryption. Neither plaintext nor ciphertext is ever
//! logged.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use thiserror::Error;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum TokenCipherError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("encrypted token is not valid base64")]
    Encoding,

    #[error("encrypted token is truncated")]
    Truncated,

    #[error("decrypted token is not valid UTF-8")]
    NotUtf8,
}

/// Injected capability holding the process-wide secret. The only surface is
/// `encrypt`/`decrypt`; key rotation is out of scope.
pub struct TokenCipher {
    secret: String,
}

impl TokenCipher {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, TokenCipherError> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher(&salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| TokenCipherError::Encrypt)?;

        let mut raw = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(raw))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, TokenCipherError> {
        let raw = BASE64
            .decode(encrypted.trim())
            .map_err(|_| TokenCipherError::Encoding)?;
        if raw.len() <= SALT_SIZE + NONCE_SIZE {
            return Err(TokenCipherError::Truncated);
        }

        let (salt, rest) = raw.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let cipher = self.cipher(salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TokenCipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| TokenCipherError::NotUtf8)
    }

    fn cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, TokenCipherError> {
        let key: [u8; KEY_SIZE] =
            pbkdf2_hmac_array::<Sha256, KEY_SIZE>(self.secret.as_bytes(), salt, PBKDF2_ITERATIONS);
        Aes256Gcm::new_from_slice(&key).map_err(|_| TokenCipherError::Encrypt)
    }
}
