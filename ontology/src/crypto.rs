//! Secret storage for datasource credentials: AES-256-GCM over a JSON value,
//! stored as base64(nonce ‖ ciphertext+tag). The master key comes from
//! `ONT_ENCRYPTION_KEY` as 64 hex characters.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand_core::{OsRng, RngCore};

const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey(String),
    Encrypt(String),
    Decrypt(String),
    Decode(String),
    Json(serde_json::Error),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidKey(e) => write!(f, "Invalid encryption key: {e}"),
            CryptoError::Encrypt(e) => write!(f, "Encryption error: {e}"),
            CryptoError::Decrypt(e) => write!(f, "Decryption error: {e}"),
            CryptoError::Decode(e) => write!(f, "Base64 decode error: {e}"),
            CryptoError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

pub fn encrypt_json(data: &serde_json::Value, key: &[u8; 32]) -> Result<String, CryptoError> {
    let plaintext = serde_json::to_vec(data).map_err(CryptoError::Json)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new(key.into());
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(&combined))
}

pub fn decrypt_json(encoded: &str, key: &[u8; 32]) -> Result<serde_json::Value, CryptoError> {
    let data = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Decode(e.to_string()))?;

    if data.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt(format!(
            "ciphertext too short (< {NONCE_LEN} bytes)"
        )));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

    serde_json::from_slice(&plaintext).map_err(CryptoError::Json)
}

/// Parse a 64-char hex string into a 32-byte key.
pub fn parse_hex_key(hex: &str) -> Result<[u8; 32], CryptoError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(CryptoError::InvalidKey(format!(
            "expected 64 hex chars (32 bytes), got {}",
            hex.len()
        )));
    }
    let mut key = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk)
            .map_err(|_| CryptoError::InvalidKey("invalid UTF-8 in hex string".to_string()))?;
        key[i] = u8::from_str_radix(byte_str, 16)
            .map_err(|_| CryptoError::InvalidKey(format!("invalid hex character at byte {i}")))?;
    }
    Ok(key)
}

pub fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_survives_encryption() {
        let key = [42u8; 32];
        let secret = serde_json::json!({"password": "hunter2"});
        let encrypted = encrypt_json(&secret, &key).unwrap();
        assert!(!encrypted.contains("hunter2"));
        assert_eq!(decrypt_json(&encrypted, &key).unwrap(), secret);
    }

    #[test]
    fn wrong_key_fails() {
        let secret = serde_json::json!({"password": "hunter2"});
        let encrypted = encrypt_json(&secret, &[1u8; 32]).unwrap();
        assert!(matches!(
            decrypt_json(&encrypted, &[2u8; 32]),
            Err(CryptoError::Decrypt(_))
        ));
    }

    #[test]
    fn garbage_input_is_rejected() {
        let key = [42u8; 32];
        assert!(matches!(
            decrypt_json("not-valid-base64!!!", &key),
            Err(CryptoError::Decode(_))
        ));
        assert!(matches!(
            decrypt_json(&STANDARD.encode([0u8; 4]), &key),
            Err(CryptoError::Decrypt(_))
        ));
    }

    #[test]
    fn nonce_is_fresh_per_encryption() {
        let key = [42u8; 32];
        let data = serde_json::json!({"password": "x"});
        assert_ne!(
            encrypt_json(&data, &key).unwrap(),
            encrypt_json(&data, &key).unwrap()
        );
    }

    #[test]
    fn hex_key_parsing() {
        let hex = "00".repeat(31) + "ff";
        let key = parse_hex_key(&hex).unwrap();
        assert_eq!(key[31], 0xff);
        assert_eq!(key[0], 0);
        assert!(parse_hex_key("abcd").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }
}
