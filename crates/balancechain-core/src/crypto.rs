//! Cryptographic primitives: P-256 ECDSA signing, SHA-256 hashing, and
//! ECDH + AES-GCM session encryption for the peer boundary.
//!
//! Signatures are raw `r || s` (64 bytes), transported as standard base64.
//! Public keys travel as base64 of the SEC1 uncompressed point, which is
//! also the canonical form the HID is derived from. Every keypair carries
//! an algorithm tag so a post-quantum scheme can replace ECDSA later
//! without changing the segment shape.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CoreError, Result};

/// Algorithm tag carried in the author record.
pub const SIG_ALG: &str = "ES256";

/// AES-GCM nonce length in bytes.
pub const GCM_NONCE_LEN: usize = 12;

/// A 32-byte SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    /// Compute the SHA-256 hash of data.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, the form used in `prev_hash` and `chain_head`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHA256({}...)", &self.to_hex()[..8])
    }
}

impl AsRef<[u8]> for Sha256Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash UTF-8 text and return lowercase hex in one step.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256Hash::hash(data).to_hex()
}

/// A 64-byte ECDSA P-256 signature (raw `r || s`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Standard base64, the transport form used in segments.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse from base64.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| CoreError::DecodingError(e.to_string()))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidSignature)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}...)", &hex::encode(self.0)[..8])
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A P-256 public key, held in its SEC1 uncompressed form (65 bytes).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    sec1: Vec<u8>,
}

impl PublicKey {
    fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            sec1: key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Base64 of the SEC1 uncompressed point.
    ///
    /// This string is the canonical portable form: it is what segments
    /// carry and what the HID is derived from.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.sec1)
    }

    /// Parse from the portable base64 form.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| CoreError::DecodingError(e.to_string()))?;
        // Validate eagerly so a held PublicKey always parses.
        VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| CoreError::InvalidPublicKey)?;
        Ok(Self { sec1: bytes })
    }

    /// The raw SEC1 point bytes.
    pub fn as_sec1_bytes(&self) -> &[u8] {
        &self.sec1
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_sec1_bytes(&self.sec1)
            .map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = EcdsaSignature::from_slice(&signature.0)
            .map_err(|_| CoreError::InvalidSignature)?;
        key.verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P256Pub({}...)", &self.to_base64()[..12])
    }
}

/// A keypair for signing segments.
#[derive(Clone)]
pub struct EcdsaKeypair {
    signing_key: SigningKey,
}

impl EcdsaKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Create from a 32-byte scalar seed.
    ///
    /// Fails if the seed is zero or not below the curve order.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(seed).map_err(|_| CoreError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a message (deterministic RFC 6979 nonces).
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: EcdsaSignature = self.signing_key.sign(message);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(sig.to_bytes().as_slice());
        Signature(bytes)
    }

    /// Raw scalar bytes (secret key material), for backup export.
    pub fn secret_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.signing_key.to_bytes().as_slice());
        bytes
    }

    /// ECDH key agreement with a peer, yielding a symmetric session key.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<SessionKey> {
        let peer_pk = p256::PublicKey::from_sec1_bytes(peer.as_sec1_bytes())
            .map_err(|_| CoreError::InvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(
            self.signing_key.as_nonzero_scalar(),
            peer_pk.as_affine(),
        );
        // The AES key is the SHA-256 of the raw shared secret.
        Ok(SessionKey(
            Sha256Hash::hash(shared.raw_secret_bytes().as_slice()).0,
        ))
    }
}

impl fmt::Debug for EcdsaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcdsaKeypair({:?})", self.public_key())
    }
}

/// A 256-bit AES-GCM session key derived from ECDH.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Encrypt with a fresh random nonce; output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;

        let mut nonce = [0u8; GCM_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;

        let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` envelope.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < GCM_NONCE_LEN {
            return Err(CoreError::DecodingError("envelope too short".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;

        let (nonce, ciphertext) = envelope.split_at(GCM_NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::BackupAuthFailed)
    }
}

/// Generate a fresh segment nonce: 16 random bytes as 32 lowercase hex chars.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; crate::consts::NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
