//! Token sealing with AES-256-GCM.
//!
//! A sealed token is `base64(nonce || ciphertext)` so it fits in one column.
//! Every seal draws a fresh random 96-bit nonce.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build a cipher from a base64-encoded 32-byte master key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64.trim())
            .context("Encryption key is not valid base64")?;
        if key.len() != KEY_SIZE {
            bail!("Encryption key must be {} bytes, got {}", KEY_SIZE, key.len());
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("Invalid encryption key: {}", e))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Fails on a wrong key or any tampering.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let bytes = BASE64.decode(sealed).context("Sealed token is not valid base64")?;
        if bytes.len() <= NONCE_SIZE {
            bail!("Sealed token too short ({} bytes)", bytes.len());
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Decryption failed (wrong key or corrupted token)"))?;
        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(byte: u8) -> TokenCipher {
        TokenCipher::from_base64(&BASE64.encode([byte; 32])).unwrap()
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(TokenCipher::from_base64(&BASE64.encode([0u8; 16])).is_err());
        assert!(TokenCipher::from_base64("%%%").is_err());
    }

    #[test]
    fn test_seal_then_open() {
        let c = cipher(7);
        let sealed = c.seal("ya29.access-token").unwrap();
        assert!(!sealed.contains("ya29"));
        assert_eq!(c.open(&sealed).unwrap(), "ya29.access-token");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let c = cipher(7);
        assert_ne!(c.seal("same").unwrap(), c.seal("same").unwrap());
    }

    #[test]
    fn test_wrong_key_or_tampering_fails() {
        let sealed = cipher(1).seal("secret").unwrap();
        assert!(cipher(2).open(&sealed).is_err());

        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(cipher(1).open(&BASE64.encode(bytes)).is_err());
    }
}
