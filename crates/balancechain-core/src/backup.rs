//! Password-scoped encrypted backup framing.
//!
//! Wire format, base64-encoded:
//!
//! ```text
//! [version = 1][16-byte salt][12-byte nonce][AES-256-GCM ciphertext]
//! ```
//!
//! The AES key is derived with PBKDF2-SHA256 at 100,000 iterations. Import
//! fails on a version mismatch or when GCM authentication fails (wrong
//! password or tampered ciphertext).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::consts::{BACKUP_KDF_ITERATIONS, BACKUP_VERSION};
use crate::crypto::GCM_NONCE_LEN;
use crate::error::{CoreError, Result};

/// Salt length for key derivation.
pub const SALT_LEN: usize = 16;

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        password.as_bytes(),
        salt,
        BACKUP_KDF_ITERATIONS,
        &mut key,
    )
    .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
    Ok(key)
}

/// Encrypt a payload under a password, producing the base64 envelope.
pub fn encrypt_backup(plaintext: &[u8], password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CoreError::EncryptionError(e.to_string()))?;

    let mut framed = Vec::with_capacity(1 + SALT_LEN + GCM_NONCE_LEN + ciphertext.len());
    framed.push(BACKUP_VERSION);
    framed.extend_from_slice(&salt);
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(framed))
}

/// Decrypt a base64 envelope produced by [`encrypt_backup`].
pub fn decrypt_backup(envelope: &str, password: &str) -> Result<Vec<u8>> {
    let framed = BASE64
        .decode(envelope)
        .map_err(|e| CoreError::DecodingError(e.to_string()))?;

    if framed.len() < 1 + SALT_LEN + GCM_NONCE_LEN {
        return Err(CoreError::DecodingError("backup envelope too short".into()));
    }
    if framed[0] != BACKUP_VERSION {
        return Err(CoreError::BackupVersionMismatch(framed[0]));
    }

    let salt = &framed[1..1 + SALT_LEN];
    let nonce = &framed[1 + SALT_LEN..1 + SALT_LEN + GCM_NONCE_LEN];
    let ciphertext = &framed[1 + SALT_LEN + GCM_NONCE_LEN..];

    let key = derive_key(password, salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CoreError::BackupAuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let plaintext = br#"{"hid":"HID-1A2B3C4D","version":1}"#;
        let envelope = encrypt_backup(plaintext, "correct horse").unwrap();
        let decrypted = decrypt_backup(&envelope, "correct horse").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_password_fails() {
        let envelope = encrypt_backup(b"secret", "right").unwrap();
        let result = decrypt_backup(&envelope, "wrong");
        assert!(matches!(result, Err(CoreError::BackupAuthFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let envelope = encrypt_backup(b"secret", "pw").unwrap();
        let mut framed = BASE64.decode(&envelope).unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        let tampered = BASE64.encode(framed);

        let result = decrypt_backup(&tampered, "pw");
        assert!(matches!(result, Err(CoreError::BackupAuthFailed)));
    }

    #[test]
    fn test_version_mismatch_fails() {
        let envelope = encrypt_backup(b"secret", "pw").unwrap();
        let mut framed = BASE64.decode(&envelope).unwrap();
        framed[0] = 9;
        let reversioned = BASE64.encode(framed);

        let result = decrypt_backup(&reversioned, "pw");
        assert!(matches!(result, Err(CoreError::BackupVersionMismatch(9))));
    }

    #[test]
    fn test_envelopes_use_fresh_salt_and_nonce() {
        let e1 = encrypt_backup(b"same", "pw").unwrap();
        let e2 = encrypt_backup(b"same", "pw").unwrap();
        assert_ne!(e1, e2);
    }

    #[test]
    fn test_frame_layout() {
        let envelope = encrypt_backup(b"x", "pw").unwrap();
        let framed = BASE64.decode(&envelope).unwrap();
        assert_eq!(framed[0], BACKUP_VERSION);
        // version + salt + nonce + 1 byte plaintext + 16 byte GCM tag
        assert_eq!(framed.len(), 1 + SALT_LEN + GCM_NONCE_LEN + 1 + 16);
    }
}
