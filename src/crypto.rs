//! Cryptographic primitives for data at rest.
//!
//! Encrypted blobs use the container layout
//! `salt(64) || iv(16) || tag(16) || ciphertext`, AES-256-GCM. The data key
//! is derived per container from the user's long-lived key and the embedded
//! salt via PBKDF2-HMAC-SHA-512, so the user key never touches the cipher
//! directly and individual blobs stay self-describing.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::{AppError, Result};

/// Per-container key-derivation salt width.
pub const SALT_LEN: usize = 64;
/// GCM nonce width. 16 bytes, matching the on-disk contract.
pub const IV_LEN: usize = 16;
/// GCM authentication tag width.
pub const TAG_LEN: usize = 16;
/// Total container header: salt + iv + tag.
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;

const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256-GCM parameterized with the 16-byte nonce the container uses.
type ContentCipher = AesGcm<Aes256, U16>;

/// Generate a user's long-lived 32-byte encryption key, hex-encoded.
pub fn generate_user_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    hex::encode(key)
}

/// Generate the per-user key-derivation salt recorded at registration.
pub fn generate_key_salt() -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Generate a 32-byte share token, hex-encoded (64 chars).
pub fn generate_share_token() -> String {
    let mut token = [0u8; 32];
    OsRng.fill_bytes(&mut token);
    hex::encode(token)
}

/// Derive the 32-byte data key from the user key and a container salt.
///
/// Parameters are fixed at the system level and must reproduce verbatim at
/// decrypt time.
fn derive_data_key(user_key: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha512>(user_key, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn decode_user_key(user_key_hex: &str) -> Result<Vec<u8>> {
    hex::decode(user_key_hex).map_err(|e| {
        tracing::error!("User key is not valid hex: {}", e);
        AppError::CryptoFailure
    })
}

/// Encrypt plaintext into a self-describing container.
///
/// Salt and IV are freshly random per call.
pub fn encrypt(plaintext: &[u8], user_key_hex: &str) -> Result<Vec<u8>> {
    let user_key = decode_user_key(user_key_hex)?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let data_key = derive_data_key(&user_key, &salt);
    let cipher = ContentCipher::new_from_slice(&data_key).map_err(|e| {
        tracing::error!("Failed to initialize cipher: {}", e);
        AppError::CryptoFailure
    })?;

    let nonce = aes_gcm::Nonce::<U16>::from_slice(&iv);
    // AEAD output = ciphertext || 16-byte tag
    let sealed = cipher.encrypt(nonce, plaintext).map_err(|e| {
        tracing::error!("Encryption failed: {}", e);
        AppError::CryptoFailure
    })?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut container = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    container.extend_from_slice(&salt);
    container.extend_from_slice(&iv);
    container.extend_from_slice(tag);
    container.extend_from_slice(ciphertext);
    Ok(container)
}

/// Decrypt a container produced by [`encrypt`].
///
/// Truncation, tag mismatch, or a wrong key all surface as
/// `IntegrityFailure`; the caller must not distinguish them to the client.
pub fn decrypt(container: &[u8], user_key_hex: &str) -> Result<Vec<u8>> {
    if container.len() < HEADER_LEN {
        return Err(AppError::IntegrityFailure);
    }

    let user_key = decode_user_key(user_key_hex)?;
    let salt = &container[..SALT_LEN];
    let iv = &container[SALT_LEN..SALT_LEN + IV_LEN];
    let tag = &container[SALT_LEN + IV_LEN..HEADER_LEN];
    let ciphertext = &container[HEADER_LEN..];

    let data_key = derive_data_key(&user_key, salt);
    let cipher = ContentCipher::new_from_slice(&data_key).map_err(|e| {
        tracing::error!("Failed to initialize cipher: {}", e);
        AppError::CryptoFailure
    })?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let nonce = aes_gcm::Nonce::<U16>::from_slice(iv);
    cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| AppError::IntegrityFailure)
}

/// SHA-256 of an in-memory buffer, hex-encoded.
pub fn hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file at rest, hex-encoded.
pub async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a password (user or share) with Argon2id.
pub fn password_hash(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let digest = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?
        .to_string();

    Ok(digest)
}

/// Verify a password against a stored Argon2 digest.
pub fn password_verify(password: &str, digest: &str) -> Result<bool> {
    let parsed = PasswordHash::new(digest)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        "42".repeat(32)
    }

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let key = test_key();
        let plaintext = b"the quick brown fox";
        let container = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&container, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn container_layout_is_header_plus_plaintext() {
        let key = test_key();
        for len in [0usize, 1, 1024, 4096] {
            let plaintext = vec![0x41u8; len];
            let container = encrypt(&plaintext, &key).unwrap();
            assert_eq!(container.len(), HEADER_LEN + len);
        }
    }

    #[test]
    fn container_fields_sit_at_fixed_offsets() {
        let key = test_key();
        let plaintext = b"offset check";
        let container = encrypt(plaintext, &key).unwrap();

        // Rebuild the decryption by hand from the documented offsets.
        let user_key = hex::decode(&key).unwrap();
        let data_key = derive_data_key(&user_key, &container[..SALT_LEN]);
        let cipher = ContentCipher::new_from_slice(&data_key).unwrap();
        let nonce = aes_gcm::Nonce::<U16>::from_slice(&container[SALT_LEN..SALT_LEN + IV_LEN]);

        let mut sealed = container[HEADER_LEN..].to_vec();
        sealed.extend_from_slice(&container[SALT_LEN + IV_LEN..HEADER_LEN]);
        let decrypted = cipher.decrypt(nonce, sealed.as_ref()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn salt_and_iv_are_fresh_per_call() {
        let key = test_key();
        let a = encrypt(b"same input", &key).unwrap();
        let b = encrypt(b"same input", &key).unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
        assert_ne!(a[SALT_LEN..SALT_LEN + IV_LEN], b[SALT_LEN..SALT_LEN + IV_LEN]);
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let container = encrypt(b"secret", &test_key()).unwrap();
        let other_key = "13".repeat(32);
        let err = decrypt(&container, &other_key).unwrap_err();
        assert!(matches!(err, AppError::IntegrityFailure));
    }

    #[test]
    fn any_single_byte_flip_fails_integrity() {
        let key = test_key();
        let container = encrypt(b"tamper target", &key).unwrap();

        // One position inside each region: salt, iv, tag, ciphertext.
        for pos in [0, SALT_LEN, SALT_LEN + IV_LEN, HEADER_LEN] {
            let mut tampered = container.clone();
            tampered[pos] ^= 0x01;
            let err = decrypt(&tampered, &key).unwrap_err();
            assert!(matches!(err, AppError::IntegrityFailure), "pos {}", pos);
        }
    }

    #[test]
    fn truncated_container_fails_integrity() {
        let key = test_key();
        let container = encrypt(b"short", &key).unwrap();
        let err = decrypt(&container[..HEADER_LEN - 1], &key).unwrap_err();
        assert!(matches!(err, AppError::IntegrityFailure));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generated_material_has_expected_widths() {
        assert_eq!(generate_user_key().len(), 64);
        assert_eq!(generate_key_salt().len(), 32);
        assert_eq!(generate_share_token().len(), 64);
        assert_ne!(generate_share_token(), generate_share_token());
    }

    #[test]
    fn password_hash_verify_roundtrip() {
        let digest = password_hash("Aa1!aaaa").unwrap();
        assert!(password_verify("Aa1!aaaa", &digest).unwrap());
        assert!(!password_verify("Aa1!aaab", &digest).unwrap());
    }

    #[tokio::test]
    async fn file_checksum_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data = vec![0x41u8; 1024];
        tokio::fs::write(&path, &data).await.unwrap();
        assert_eq!(file_checksum(&path).await.unwrap(), hash(&data));
    }
}
