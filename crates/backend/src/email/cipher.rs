//! AES-256-GCM encryption for OAuth tokens stored in `email_accounts`.
//!
//! Serialized form is `base64(nonce).base64(tag).base64(ciphertext)`. The
//! delimiter is outside the base64 alphabet, so splitting is unambiguous.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use crate::config::AppConfig;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const DELIMITER: char = '.';

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("EMAIL_TOKEN_ENCRYPTION_KEY is not set")]
    MissingKey,

    #[error("EMAIL_TOKEN_ENCRYPTION_KEY must be base64 of exactly 32 bytes: {0}")]
    InvalidKey(String),

    #[error("Cannot encrypt empty plaintext")]
    EmptyPlaintext,

    #[error("Malformed token ciphertext: {0}")]
    Format(String),

    #[error("Token authentication failed (tampered data or wrong key)")]
    Authentication,

    #[error("Token encryption failed")]
    Encryption,
}

/// Symmetric cipher for provider tokens, built once from process config.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn from_config(config: &AppConfig) -> Result<Self, CipherError> {
        Self::from_base64_key(&config.email_token_encryption_key)
    }

    pub fn from_base64_key(key_b64: &str) -> Result<Self, CipherError> {
        let key_b64 = key_b64.trim();
        if key_b64.is_empty() {
            return Err(CipherError::MissingKey);
        }

        let key = BASE64
            .decode(key_b64)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "decoded key is {} bytes",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt with a fresh random nonce, so equal inputs never share output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Err(CipherError::EmptyPlaintext);
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        // aes-gcm appends the tag to the ciphertext
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}{d}{}{d}{}",
            BASE64.encode(nonce),
            BASE64.encode(tag),
            BASE64.encode(sealed),
            d = DELIMITER
        ))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, CipherError> {
        let segments: Vec<&str> = token.split(DELIMITER).collect();
        if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(CipherError::Format(
                "expected three non-empty segments nonce.tag.ciphertext".to_string(),
            ));
        }

        let nonce = decode_segment("nonce", segments[0])?;
        if nonce.len() != NONCE_SIZE {
            return Err(CipherError::Format(format!(
                "nonce is {} bytes, expected {}",
                nonce.len(),
                NONCE_SIZE
            )));
        }

        let tag = decode_segment("tag", segments[1])?;
        if tag.len() != TAG_SIZE {
            return Err(CipherError::Format(format!(
                "tag is {} bytes, expected {}",
                tag.len(),
                TAG_SIZE
            )));
        }

        let mut sealed = decode_segment("ciphertext", segments[2])?;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| CipherError::Authentication)?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Format("plaintext is not valid UTF-8".to_string()))
    }
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>, CipherError> {
    BASE64
        .decode(segment)
        .map_err(|e| CipherError::Format(format!("{} is not valid base64: {}", name, e)))
}
