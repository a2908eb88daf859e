use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid hex key: {0}")]
    InvalidHexKey(#[from] hex::FromHexError),
}

/// Symmetric encryption for webhook signing secrets at rest. Uses AES-256-GCM.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Creates a new EncryptionService with a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?,
        })
    }

    /// Creates the service from a 64-character hex key, as found in configuration.
    pub fn from_hex(hex_key: &str) -> Result<Self, EncryptionError> {
        let key = hex::decode(hex_key.trim())?;
        Self::new(&key)
    }

    /// Encrypts a plaintext byte slice.
    /// Prepends the 12-byte nonce to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng); // must be unique per encryption
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypts data produced by [`EncryptionService::encrypt`].
    pub fn decrypt(&self, encrypted_data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if encrypted_data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptionFailed(
                "Invalid encrypted data: too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
    }

    pub fn decrypt_to_string(&self, encrypted_data: &[u8]) -> Result<String, EncryptionError> {
        let plaintext = self.decrypt(encrypted_data)?;
        String::from_utf8(plaintext).map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_decrypt_success() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        let secret = "whsec-signing-secret";

        let encrypted = service.encrypt(secret.as_bytes()).unwrap();
        assert_ne!(&encrypted[NONCE_LEN..], secret.as_bytes());
        assert_eq!(service.decrypt_to_string(&encrypted).unwrap(), secret);
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        let a = service.encrypt(b"same").unwrap();
        let b = service.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        let other = EncryptionService::from_hex(
            "f1e1d1c1b1a191817161514131211101f0e0d0c0b0a090807060504030201000",
        )
        .unwrap();

        let encrypted = service.encrypt(b"another secret").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(EncryptionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            EncryptionService::from_hex("1234"),
            Err(EncryptionError::InvalidKeyLength)
        ));
        assert!(matches!(
            EncryptionService::from_hex("not-a-hex-string"),
            Err(EncryptionError::InvalidHexKey(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        assert!(service.decrypt(&[0u8; 5]).is_err());
    }
}
