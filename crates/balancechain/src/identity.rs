//! Identity management: the long-lived signing keypair, its encrypted
//! backup, and liveness-proof verification hooks.
//!
//! The private key never leaves this module. Signing is requested through
//! the narrow [`Identity::sign`] interface; export only ever emits the
//! password-encrypted envelope.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::info;

use balancechain_core::crypto::SIG_ALG;
use balancechain_core::{
    decrypt_backup, encrypt_backup, Author, EcdsaKeypair, Hid, Signature,
};
use balancechain_store::{IdentityRecord, Store};

use crate::clock::Clock;
use crate::error::{ChainError, Result};

/// The owning identity of a chain.
pub struct Identity {
    keypair: EcdsaKeypair,
    hid: Hid,
    credential_id: Option<String>,
    created_at: i64,
}

/// The payload inside an encrypted backup envelope.
#[derive(Debug, Serialize, Deserialize)]
struct BackupPayload {
    version: u32,
    hid: Hid,
    pubkey: String,
    private_key: String,
    #[serde(rename = "createdAt")]
    created_at: i64,
    #[serde(rename = "exportedAt")]
    exported_at: i64,
}

impl Identity {
    /// Load the persisted identity, or create and persist a fresh one.
    pub async fn load_or_create(store: &dyn Store, clock: &dyn Clock) -> Result<Self> {
        if let Some(record) = store.get_identity().await? {
            return Self::from_record(&record);
        }

        let keypair = EcdsaKeypair::generate();
        let identity = Self::from_keypair(keypair, clock.now_ms());
        store.put_identity(&identity.to_record()).await?;
        info!(hid = %identity.hid, "created new identity");
        Ok(identity)
    }

    fn from_keypair(keypair: EcdsaKeypair, created_at: i64) -> Self {
        let hid = Hid::derive(&keypair.public_key());
        Self {
            keypair,
            hid,
            credential_id: None,
            created_at,
        }
    }

    fn from_record(record: &IdentityRecord) -> Result<Self> {
        let secret = BASE64
            .decode(&record.private_key)
            .map_err(|e| ChainError::Identity(format!("bad stored key: {e}")))?;
        let seed: [u8; 32] = secret
            .try_into()
            .map_err(|_| ChainError::Identity("bad stored key length".into()))?;
        let keypair = EcdsaKeypair::from_seed(&seed)
            .map_err(|e| ChainError::Identity(e.to_string()))?;
        let mut identity = Self::from_keypair(keypair, record.created_at);
        identity.credential_id = record.credential_id.clone();
        Ok(identity)
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            version: 1,
            hid: self.hid.clone(),
            pubkey: self.keypair.public_key().to_base64(),
            alg: SIG_ALG.to_string(),
            private_key: BASE64.encode(self.keypair.secret_bytes()),
            credential_id: self.credential_id.clone(),
            created_at: self.created_at,
        }
    }

    /// The identity's stable public id.
    pub fn hid(&self) -> &Hid {
        &self.hid
    }

    /// The registered platform-authenticator credential, if any.
    pub fn credential_id(&self) -> Option<&str> {
        self.credential_id.as_deref()
    }

    /// Record a platform-authenticator credential and persist it.
    pub async fn register_credential(
        &mut self,
        store: &dyn Store,
        credential_id: &str,
    ) -> Result<()> {
        self.credential_id = Some(credential_id.to_string());
        store.put_identity(&self.to_record()).await?;
        info!(hid = %self.hid, "registered biometric credential");
        Ok(())
    }

    /// The author record segments carry.
    pub fn author(&self) -> Author {
        Author::from_keypair(&self.keypair)
    }

    /// Sign a signable view. The only way key material is exercised.
    pub fn sign(&self, signable: &[u8]) -> Signature {
        self.keypair.sign(signable)
    }

    /// Export as a password-encrypted envelope (base64).
    pub fn export_encrypted(&self, password: &str, now_ms: i64) -> Result<String> {
        let payload = BackupPayload {
            version: 1,
            hid: self.hid.clone(),
            pubkey: self.keypair.public_key().to_base64(),
            private_key: BASE64.encode(self.keypair.secret_bytes()),
            created_at: self.created_at,
            exported_at: now_ms,
        };
        let json = serde_json::to_vec(&payload)
            .map_err(|e| ChainError::Identity(e.to_string()))?;
        Ok(encrypt_backup(&json, password)?)
    }

    /// Import from an encrypted envelope and persist as the primary
    /// identity. Fails on version mismatch or authentication error.
    pub async fn import_encrypted(
        store: &dyn Store,
        envelope: &str,
        password: &str,
    ) -> Result<Self> {
        let json = decrypt_backup(envelope, password)?;
        let payload: BackupPayload = serde_json::from_slice(&json)
            .map_err(|e| ChainError::Identity(format!("bad backup payload: {e}")))?;
        if payload.version != 1 {
            return Err(ChainError::Identity(format!(
                "unsupported backup payload version {}",
                payload.version
            )));
        }

        let secret = BASE64
            .decode(&payload.private_key)
            .map_err(|e| ChainError::Identity(format!("bad backup key: {e}")))?;
        let seed: [u8; 32] = secret
            .try_into()
            .map_err(|_| ChainError::Identity("bad backup key length".into()))?;
        let keypair = EcdsaKeypair::from_seed(&seed)
            .map_err(|e| ChainError::Identity(e.to_string()))?;

        let identity = Self::from_keypair(keypair, payload.created_at);
        if identity.hid != payload.hid {
            return Err(ChainError::Identity("backup HID mismatch".into()));
        }

        store.put_identity(&identity.to_record()).await?;
        info!(hid = %identity.hid, "restored identity from backup");
        Ok(identity)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Liveness proofs
// ─────────────────────────────────────────────────────────────────────────

/// A bounded-freshness attestation that the author is a live human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessProof {
    /// `"webauthn"` or `"timestamp"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Proof creation time (ms).
    pub timestamp: i64,
    /// Platform-authenticator assertion, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<WebauthnAssertion>,
    /// Proof-scoped nonce; not globally unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// The assertion fields a platform authenticator returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebauthnAssertion {
    #[serde(rename = "credentialId")]
    pub credential_id: String,
    #[serde(rename = "authenticatorData")]
    pub authenticator_data: String,
    pub signature: String,
}

/// Pluggable verification of liveness assertions.
///
/// The validator calls this when a proof carries an assertion and rejects
/// the segment when verification returns false.
pub trait LivenessVerifier: Send + Sync {
    fn verify(&self, proof: &LivenessProof) -> bool;
}

/// The default verifier: checks assertion shape only.
///
/// Real biometric signature verification plugs in behind the trait; this
/// mirrors the platform boundary where the authenticator itself has
/// already checked the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralVerifier;

impl LivenessVerifier for StructuralVerifier {
    fn verify(&self, proof: &LivenessProof) -> bool {
        match &proof.assertion {
            Some(a) => {
                !a.credential_id.is_empty()
                    && !a.authenticator_data.is_empty()
                    && !a.signature.is_empty()
            }
            // A bare timestamp proof has nothing further to verify.
            None => proof.kind == "timestamp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use balancechain_store::MemoryStore;

    #[tokio::test]
    async fn test_load_or_create_persists_once() {
        let store = MemoryStore::new();
        let clock = SystemClock;

        let id1 = Identity::load_or_create(&store, &clock).await.unwrap();
        let id2 = Identity::load_or_create(&store, &clock).await.unwrap();
        assert_eq!(id1.hid(), id2.hid());
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let store = MemoryStore::new();
        let clock = SystemClock;
        let identity = Identity::load_or_create(&store, &clock).await.unwrap();

        let envelope = identity.export_encrypted("hunter2", clock.now_ms()).unwrap();

        let fresh_store = MemoryStore::new();
        let restored = Identity::import_encrypted(&fresh_store, &envelope, "hunter2")
            .await
            .unwrap();
        assert_eq!(restored.hid(), identity.hid());

        // The restored key signs identically
        let message = b"sign me";
        assert_eq!(
            identity.sign(message).to_base64(),
            restored.sign(message).to_base64()
        );
    }

    #[tokio::test]
    async fn test_credential_registration_persists() {
        let store = MemoryStore::new();
        let clock = SystemClock;
        let mut identity = Identity::load_or_create(&store, &clock).await.unwrap();
        assert!(identity.credential_id().is_none());

        identity
            .register_credential(&store, "cred-abc")
            .await
            .unwrap();

        let reloaded = Identity::load_or_create(&store, &clock).await.unwrap();
        assert_eq!(reloaded.credential_id(), Some("cred-abc"));
    }

    #[tokio::test]
    async fn test_import_wrong_password_fails() {
        let store = MemoryStore::new();
        let clock = SystemClock;
        let identity = Identity::load_or_create(&store, &clock).await.unwrap();
        let envelope = identity.export_encrypted("right", clock.now_ms()).unwrap();

        let result = Identity::import_encrypted(&store, &envelope, "wrong").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_structural_verifier() {
        let verifier = StructuralVerifier;

        let timestamp_proof = LivenessProof {
            kind: "timestamp".into(),
            timestamp: 1000,
            assertion: None,
            nonce: None,
        };
        assert!(verifier.verify(&timestamp_proof));

        let complete = LivenessProof {
            kind: "webauthn".into(),
            timestamp: 1000,
            assertion: Some(WebauthnAssertion {
                credential_id: "cred".into(),
                authenticator_data: "data".into(),
                signature: "sig".into(),
            }),
            nonce: Some("ab".into()),
        };
        assert!(verifier.verify(&complete));

        let incomplete = LivenessProof {
            kind: "webauthn".into(),
            timestamp: 1000,
            assertion: Some(WebauthnAssertion {
                credential_id: String::new(),
                authenticator_data: "data".into(),
                signature: "sig".into(),
            }),
            nonce: None,
        };
        assert!(!verifier.verify(&incomplete));

        // webauthn-tagged proof without an assertion has no backing
        let bare_webauthn = LivenessProof {
            kind: "webauthn".into(),
            timestamp: 1000,
            assertion: None,
            nonce: None,
        };
        assert!(!verifier.verify(&bare_webauthn));
    }
}
