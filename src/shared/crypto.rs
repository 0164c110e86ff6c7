use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;

fn derive_key(master_key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master_key.as_bytes());
    hasher.finalize().into()
}

/// Encrypt a credential blob for at-rest storage. Output format is
/// `<nonce_b64>.<ciphertext_b64>`.
pub fn encrypt_string(master_key: &str, plaintext: &str) -> Result<String> {
    if master_key.is_empty() {
        return Err(anyhow!("CREDENTIALS_ENCRYPTION_KEY is not set"));
    }
    let key = derive_key(master_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {e}"))?;
    Ok(format!(
        "{}.{}",
        BASE64.encode(nonce),
        BASE64.encode(ciphertext)
    ))
}

pub fn decrypt_string(master_key: &str, encrypted: &str) -> Result<String> {
    if master_key.is_empty() {
        return Err(anyhow!("CREDENTIALS_ENCRYPTION_KEY is not set"));
    }
    let (nonce_b64, ciphertext_b64) = encrypted
        .split_once('.')
        .ok_or_else(|| anyhow!("Malformed encrypted credential"))?;
    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|e| anyhow!("Invalid nonce encoding: {e}"))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!("Invalid nonce size"));
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| anyhow!("Invalid ciphertext encoding: {e}"))?;

    let key = derive_key(master_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| anyhow!("Decryption failed: {e}"))?;
    String::from_utf8(plaintext).map_err(|e| anyhow!("Decrypted payload not UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_same_key() {
        let encrypted = encrypt_string("master", "{\"api_key\":\"dg_123\"}").unwrap();
        assert!(encrypted.contains('.'));
        let decrypted = decrypt_string("master", &encrypted).unwrap();
        assert_eq!(decrypted, "{\"api_key\":\"dg_123\"}");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let encrypted = encrypt_string("master", "secret").unwrap();
        assert!(decrypt_string("other", &encrypted).is_err());
    }

    #[test]
    fn empty_master_key_is_rejected() {
        assert!(encrypt_string("", "secret").is_err());
        assert!(decrypt_string("", "x.y").is_err());
    }
}
