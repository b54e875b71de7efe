use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{CoreError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
pub const SEALED_PREFIX: &str = "enc:";

pub fn load_or_create_key(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        let data = fs::read(path)?;
        if data.len() != KEY_LEN {
            return Err(CoreError::Crypto("invalid key length".to_string()));
        }
        return Ok(data);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    fs::write(path, &key)?;
    Ok(key)
}

pub fn encrypt_to_base64(key_bytes: &[u8], plaintext: &[u8]) -> Result<String> {
    if key_bytes.len() != KEY_LEN {
        return Err(CoreError::Crypto("invalid key length".to_string()));
    }
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CoreError::Crypto("encryption failed".to_string()))?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(output))
}

pub fn decrypt_from_base64(key_bytes: &[u8], payload: &str) -> Result<Vec<u8>> {
    if key_bytes.len() != KEY_LEN {
        return Err(CoreError::Crypto("invalid key length".to_string()));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| CoreError::Crypto("invalid base64 payload".to_string()))?;

    if decoded.len() <= NONCE_LEN {
        return Err(CoreError::Crypto("payload too small".to_string()));
    }

    let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CoreError::Crypto("decryption failed".to_string()))
}

/// Seals sensitive settings values before they hit disk.
pub trait SecretSealer: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String>;
    fn open(&self, sealed: &str) -> Result<String>;

    fn is_sealed(&self, value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }
}

pub struct AesSealer {
    key: Vec<u8>,
}

impl AesSealer {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    pub fn from_key_file(path: &Path) -> Result<Self> {
        Ok(Self::new(load_or_create_key(path)?))
    }
}

impl SecretSealer for AesSealer {
    fn seal(&self, plaintext: &str) -> Result<String> {
        let encoded = encrypt_to_base64(&self.key, plaintext.as_bytes())?;
        Ok(format!("{SEALED_PREFIX}{encoded}"))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let Some(payload) = sealed.strip_prefix(SEALED_PREFIX) else {
            return Ok(sealed.to_string());
        };
        let bytes = decrypt_from_base64(&self.key, payload)?;
        String::from_utf8(bytes).map_err(|_| CoreError::Crypto("sealed value is not utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_values_round_trip_and_are_marked() {
        let sealer = AesSealer::new(vec![7u8; KEY_LEN]);
        let sealed = sealer.seal("client-secret").expect("seal");
        assert!(sealer.is_sealed(&sealed));
        assert!(!sealed.contains("client-secret"));
        assert_eq!(sealer.open(&sealed).expect("open"), "client-secret");
        assert_eq!(sealer.open("plain").expect("open plain"), "plain");
    }
}
