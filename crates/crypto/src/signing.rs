//! Document signing.
//!
//! The signer hashes the canonical document range with SHA-256 and signs
//! the digest with RSASSA-PSS. The private key is consumed: whatever the
//! outcome, [`DigitalSigner::sign`] releases it before returning.

use rsa::Pss;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokensign_core::error::{Classify, ErrorClass};
use tokensign_core::types::{current_timestamp_ms, TimestampMs};
use tracing::{info, warn};

use crate::document::DocumentSource;
use crate::entropy::{seeded_rng, OsRandom, RandomSource};
use crate::keys::{Fingerprint, KeyCreationError, PrivateKeyMaterial};

pub const RECORD_VERSION: u8 = 1;
pub const HASH_ALGORITHM: &str = "SHA-256";
pub const SIGNATURE_ALGORITHM: &str = "RSASSA-PSS-SHA256";
pub const DOCUMENT_HASH_LEN: usize = 32;

/// Signature over one document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub(crate) version: u8,
    pub(crate) hash_algorithm: String,
    pub(crate) signature_algorithm: String,
    #[serde(with = "hex::serde")]
    pub(crate) document_hash: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub(crate) signature: Vec<u8>,
    pub(crate) signer_fingerprint: Fingerprint,
    pub(crate) timestamp_ms: TimestampMs,
}

impl SignatureRecord {
    pub fn new(
        document_hash: [u8; DOCUMENT_HASH_LEN],
        signature: Vec<u8>,
        signer_fingerprint: Fingerprint,
        timestamp_ms: TimestampMs,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
            document_hash: document_hash.to_vec(),
            signature,
            signer_fingerprint,
            timestamp_ms,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn hash_algorithm(&self) -> &str {
        &self.hash_algorithm
    }

    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    pub fn document_hash(&self) -> &[u8] {
        &self.document_hash
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn signer_fingerprint(&self) -> Fingerprint {
        self.signer_fingerprint
    }

    pub fn timestamp_ms(&self) -> TimestampMs {
        self.timestamp_ms
    }
}

/// Errors that can occur while signing.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Private key is unavailable")]
    KeyUnavailable,

    #[error("Document is empty")]
    EmptyDocument,

    #[error("Cannot read document: {0}")]
    Document(#[from] std::io::Error),

    #[error("Private key rejected: {0}")]
    Key(#[from] KeyCreationError),

    #[error("Random source failure: {0}")]
    Rng(String),

    #[error("Signature operation failed: {0}")]
    Crypto(String),
}

impl Classify for SigningError {
    fn class(&self) -> ErrorClass {
        match self {
            SigningError::KeyUnavailable | SigningError::EmptyDocument => ErrorClass::InputInvalid,
            SigningError::Document(_) => ErrorClass::MediumFailure,
            SigningError::Key(e) => e.class(),
            SigningError::Rng(_) | SigningError::Crypto(_) => ErrorClass::CryptoFailure,
        }
    }
}

/// Metrics for observability.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SigningMetrics {
    pub documents_signed_total: u64,
    pub documents_rejected_total: u64,
    pub signing_errors_total: u64,
}

/// SHA-256 of `bytes`.
pub fn document_digest(bytes: &[u8]) -> [u8; DOCUMENT_HASH_LEN] {
    Sha256::digest(bytes).into()
}

/// Produces [`SignatureRecord`]s from canonical document bytes.
#[derive(Debug, Default)]
pub struct DigitalSigner {
    metrics: SigningMetrics,
}

impl DigitalSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign `canonical` and release `key`.
    pub fn sign(
        &mut self,
        canonical: &[u8],
        key: &mut PrivateKeyMaterial,
    ) -> Result<SignatureRecord, SigningError> {
        self.sign_with_source(canonical, key, &mut OsRandom)
    }

    pub fn sign_with_source(
        &mut self,
        canonical: &[u8],
        key: &mut PrivateKeyMaterial,
        source: &mut dyn RandomSource,
    ) -> Result<SignatureRecord, SigningError> {
        let result = self.sign_inner(canonical, key, source);
        key.release();

        match &result {
            Ok(record) => {
                self.metrics.documents_signed_total += 1;
                info!(
                    fingerprint = %record.signer_fingerprint,
                    bytes = canonical.len(),
                    "Document signed"
                );
            }
            Err(SigningError::KeyUnavailable | SigningError::EmptyDocument) => {
                self.metrics.documents_rejected_total += 1;
            }
            Err(e) => {
                self.metrics.signing_errors_total += 1;
                warn!(error = %e, "Signing failed");
            }
        }
        result
    }

    /// Read `document`, hash its canonical range and sign it.
    pub fn sign_document(
        &mut self,
        document: &dyn DocumentSource,
        key: &mut PrivateKeyMaterial,
    ) -> Result<SignatureRecord, SigningError> {
        let bytes = match document.read_document_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                key.release();
                self.metrics.signing_errors_total += 1;
                return Err(e.into());
            }
        };
        let range = document.canonical_range(&bytes);
        self.sign(&bytes[range], key)
    }

    pub fn metrics(&self) -> &SigningMetrics {
        &self.metrics
    }

    fn sign_inner(
        &self,
        canonical: &[u8],
        key: &PrivateKeyMaterial,
        source: &mut dyn RandomSource,
    ) -> Result<SignatureRecord, SigningError> {
        if !key.is_available() {
            return Err(SigningError::KeyUnavailable);
        }
        if canonical.is_empty() {
            return Err(SigningError::EmptyDocument);
        }

        let rsa_key = key.to_rsa()?;
        let fingerprint = key.public_key()?.fingerprint();
        let digest = document_digest(canonical);

        let mut rng = seeded_rng(source).map_err(|e| SigningError::Rng(e.0))?;
        let signature = rsa_key
            .sign_with_rng(&mut rng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| SigningError::Crypto(e.to_string()))?;

        Ok(SignatureRecord::new(
            digest,
            signature,
            fingerprint,
            current_timestamp_ms(),
        ))
    }
}
