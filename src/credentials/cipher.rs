//! AES-256-GCM encryption for credential tokens.
//!
//! Each token is sealed with a fresh random nonce. The nonce and ciphertext
//! travel together as a single `base64(nonce):base64(ciphertext)` blob so a
//! stored token is self-contained and can be moved between columns or stores.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Cipher failures.
///
/// Key problems are configuration errors and should abort startup; the other
/// variants indicate a corrupted or foreign blob and fail the single call.
#[derive(Debug)]
pub enum CipherError {
    /// Master key is not a hex-encoded 32-byte value
    InvalidKey(String),
    /// Blob is not in the `nonce:ciphertext` shape this module produces
    MalformedBlob(String),
    /// AEAD seal failed
    EncryptFailed,
    /// AEAD open failed (wrong key, corrupted or tampered data)
    DecryptFailed,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::InvalidKey(msg) => write!(f, "Invalid encryption key: {}", msg),
            CipherError::MalformedBlob(msg) => write!(f, "Malformed ciphertext blob: {}", msg),
            CipherError::EncryptFailed => write!(f, "Encryption failed"),
            CipherError::DecryptFailed => {
                write!(f, "Decryption failed (wrong key or corrupted data)")
            }
        }
    }
}

impl std::error::Error for CipherError {}

/// Stateless AES-256-GCM cipher for short secrets.
///
/// The master key is validated once at construction so every later
/// encrypt/decrypt either succeeds or fails loudly, never producing garbage
/// plaintext from a misconfigured key.
#[derive(Clone)]
pub struct Cipher {
    key: Vec<u8>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Builds a cipher from a hex-encoded 32-byte master key.
    ///
    /// The key is trimmed before validation: keys pasted out of secret
    /// managers routinely pick up a trailing newline, and a 65-character key
    /// failing length validation at the first decrypt is much harder to
    /// diagnose than failing here.
    pub fn new(hex_key: &str) -> Result<Self, CipherError> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| CipherError::InvalidKey(format!("not valid hex: {}", e)))?;

        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "must be {} bytes ({} hex chars), got {} bytes",
                KEY_SIZE,
                KEY_SIZE * 2,
                key.len()
            )));
        }

        Ok(Self { key })
    }

    /// Encrypts a plaintext secret into a transportable blob.
    ///
    /// A fresh random nonce is generated per call, so encrypting the same
    /// plaintext twice yields different blobs.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::EncryptFailed)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::EncryptFailed)?;

        Ok(format!(
            "{}:{}",
            BASE64.encode(nonce),
            BASE64.encode(&ciphertext)
        ))
    }

    /// Decrypts a blob produced by [`Cipher::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<String, CipherError> {
        let (nonce_part, ciphertext_part) = blob
            .split_once(':')
            .ok_or_else(|| CipherError::MalformedBlob("missing ':' separator".to_string()))?;

        let nonce_bytes = BASE64
            .decode(nonce_part)
            .map_err(|e| CipherError::MalformedBlob(format!("bad nonce encoding: {}", e)))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CipherError::MalformedBlob(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let ciphertext = BASE64
            .decode(ciphertext_part)
            .map_err(|e| CipherError::MalformedBlob(format!("bad ciphertext encoding: {}", e)))?;

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::DecryptFailed)?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CipherError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::DecryptFailed)
    }
}
