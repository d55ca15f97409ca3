use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::Embedding;
use crate::secret::SecretKey;

const BLOB_VERSION: u32 = 1;
const BLOB_ALGORITHM: &str = "AES-256-GCM";
const BLOB_NONCE_LEN: usize = 12;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Plaintext carried inside an encrypted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPayload {
    pub vector: Embedding,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Opaque ciphertext produced by [`VectorCipher::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob(Vec<u8>);

impl EncryptedBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Serialize, Deserialize)]
struct BlobEnvelope {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM over the JSON form of an [`EmbeddingPayload`].
#[derive(Clone)]
pub struct VectorCipher {
    cipher: Aes256Gcm,
}

impl VectorCipher {
    pub fn new(key: &SecretKey) -> AppResult<Self> {
        if key.is_empty() {
            return Err(AppError::MissingKey);
        }
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(digest.as_slice())
            .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, vector: &Embedding, metadata: &Metadata) -> AppResult<EncryptedBlob> {
        let plaintext = serde_json::to_vec(&PayloadRef { vector, metadata })?;
        let mut nonce = [0u8; BLOB_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|err| AppError::Encryption(format!("failed to encrypt embedding: {err}")))?;
        let envelope = BlobEnvelope {
            version: BLOB_VERSION,
            algorithm: BLOB_ALGORITHM.to_string(),
            nonce: general_purpose::STANDARD.encode(nonce),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
        };
        Ok(EncryptedBlob(serde_json::to_vec(&envelope)?))
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> AppResult<EmbeddingPayload> {
        let envelope: BlobEnvelope = serde_json::from_slice(blob.as_bytes())
            .map_err(|err| AppError::Decryption(format!("malformed blob envelope: {err}")))?;

        if envelope.algorithm != BLOB_ALGORITHM {
            return Err(AppError::Decryption(format!(
                "unsupported blob algorithm '{}'",
                envelope.algorithm
            )));
        }
        if envelope.version != BLOB_VERSION {
            return Err(AppError::Decryption(format!(
                "unsupported blob version {}",
                envelope.version
            )));
        }

        let nonce_bytes = general_purpose::STANDARD
            .decode(envelope.nonce.trim())
            .map_err(|err| AppError::Decryption(format!("invalid nonce encoding: {err}")))?;
        if nonce_bytes.len() != BLOB_NONCE_LEN {
            return Err(AppError::Decryption(format!(
                "expected nonce of {} bytes but found {}",
                BLOB_NONCE_LEN,
                nonce_bytes.len()
            )));
        }

        let ciphertext = general_purpose::STANDARD
            .decode(envelope.ciphertext.trim())
            .map_err(|err| AppError::Decryption(format!("invalid ciphertext encoding: {err}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| AppError::Decryption("authentication failed".into()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|err| AppError::Decryption(format!("invalid decrypted payload: {err}")))
    }
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    vector: &'a Embedding,
    metadata: &'a Metadata,
}
