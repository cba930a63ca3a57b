//! Field obfuscation for the remote backup.
//!
//! The key is derived from the user id alone (id as secret, id as salt), so
//! anyone who knows the id can recover the plaintext. This hides entry text
//! from casual inspection of the remote document; it is not secrecy.
//!
//! Wire form of a protected field: `hex(nonce):hex(ciphertext)`.

use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::rand_core::OsRng, Argon2, Params};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroizing;

// Argon2id, OWASP minimum profile.
// m=memory (KiB), t=iterations, p=parallelism
const ARGON2_M_COST: u32 = 19456; // 19 MiB
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

const NONCE_LEN: usize = 12;
const SALT_DOMAIN: &str = "dreamlog/field-key/";

pub type FieldKey = Zeroizing<[u8; 32]>;

/// Derive the field key for a user id.
pub fn derive_user_key(user_id: &str) -> Result<FieldKey> {
    if user_id.is_empty() {
        return Err(anyhow!("Cannot derive a key from an empty user id"));
    }

    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
        .map_err(|e| anyhow!("Invalid Argon2 params: {}", e))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    // The domain prefix keeps the salt above Argon2's 8-byte minimum for short ids.
    let salt = format!("{SALT_DOMAIN}{user_id}");
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(user_id.as_bytes(), salt.as_bytes(), &mut key)
        .map_err(|e| anyhow!("Failed to derive field key: {}", e))?;

    Ok(Zeroizing::new(key))
}

/// Derive off the async executor; Argon2 is deliberately slow.
pub async fn derive_user_key_async(user_id: String) -> Result<FieldKey> {
    tokio::task::spawn_blocking(move || derive_user_key(&user_id))
        .await
        .context("Crypto task panicked")?
}

/// Encrypt one field. Empty text is returned unchanged.
pub fn encrypt(text: &str, key: &[u8; 32]) -> Result<String> {
    if text.is_empty() {
        return Ok(String::new());
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng); // 96-bits; unique per field

    let ciphertext = cipher
        .encrypt(&nonce, text.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ciphertext)))
}

/// Strict decryption: any malformed or unauthenticated input is an error.
pub fn try_decrypt(payload: &str, key: &[u8; 32]) -> Result<String> {
    let (nonce_hex, ciphertext_hex) = payload
        .split_once(':')
        .ok_or_else(|| anyhow!("Payload is not nonce:ciphertext"))?;
    if nonce_hex.is_empty() || ciphertext_hex.is_empty() {
        return Err(anyhow!("Payload has an empty component"));
    }

    let nonce_bytes = hex::decode(nonce_hex).context("Nonce is not hex")?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(anyhow!("Nonce has wrong length: {}", nonce_bytes.len()));
    }
    let ciphertext = hex::decode(ciphertext_hex).context("Ciphertext is not hex")?;

    let cipher = ChaCha20Poly1305::new(key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|e| anyhow!("Decryption failed (invalid key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted content is not valid UTF-8")
}

/// Lenient decryption for backup reads. Legacy plaintext, data written by
/// another scheme, or corrupted values come back exactly as stored.
pub fn decrypt_or_raw(payload: &str, key: &[u8; 32]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    match try_decrypt(payload, key) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::debug!(error = %e, "field not decryptable, keeping stored value");
            payload.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_reproduces_title() {
        let key = derive_user_key("user-123").unwrap();
        let cipher = encrypt("I was flying over the sea", &key).unwrap();
        assert_ne!(cipher, "I was flying over the sea");
        assert!(cipher.contains(':'));
        assert_eq!(decrypt_or_raw(&cipher, &key), "I was flying over the sea");
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let key = derive_user_key("user-123").unwrap();
        assert_eq!(decrypt_or_raw("Just a title", &key), "Just a title");
        assert_eq!(decrypt_or_raw("time: 3am", &key), "time: 3am");
        assert_eq!(decrypt_or_raw("", &key), "");
    }

    #[test]
    fn wrong_user_gets_stored_value_back() {
        let alice = derive_user_key("alice-uid").unwrap();
        let bob = derive_user_key("bob-uid").unwrap();
        let cipher = encrypt("secret", &alice).unwrap();
        assert!(try_decrypt(&cipher, &bob).is_err());
        assert_eq!(decrypt_or_raw(&cipher, &bob), cipher);
    }

    #[test]
    fn same_user_derives_same_key_and_fresh_nonces() {
        let a = derive_user_key("u").unwrap();
        let b = derive_user_key("u").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(encrypt("x", &a).unwrap(), encrypt("x", &a).unwrap());
    }

    #[test]
    fn empty_user_id_is_rejected() {
        assert!(derive_user_key("").is_err());
    }
}
