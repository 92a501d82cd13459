//! Signature verification.
//!
//! Verification is read-only: it never touches a token and never needs a
//! private key.

use rsa::Pss;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokensign_core::error::{Classify, ErrorClass};
use tokensign_core::logging::AUDIT_TARGET;
use tracing::{info, warn};

use crate::container::{self, ContainerError};
use crate::document::DocumentSource;
use crate::keys::PublicKeyMaterial;
use crate::signing::{
    document_digest, SignatureRecord, DOCUMENT_HASH_LEN, HASH_ALGORITHM, RECORD_VERSION,
    SIGNATURE_ALGORITHM,
};

/// Verdict reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationReason {
    Ok,
    /// The record's hash is unusable: unsupported algorithm or version, or a
    /// hash that neither matches the document nor is covered by the signature.
    HashMismatch,
    BadSignature,
    KeyUnknown,
    /// A genuine signature over content that has since changed, or a
    /// container that can no longer be parsed.
    DocumentTampered,
}

impl VerificationReason {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            VerificationReason::Ok => None,
            VerificationReason::BadSignature | VerificationReason::KeyUnknown => {
                Some(ErrorClass::AuthFailure)
            }
            VerificationReason::HashMismatch | VerificationReason::DocumentTampered => {
                Some(ErrorClass::IntegrityFailure)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: VerificationReason,
}

impl VerificationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: VerificationReason::Ok,
        }
    }

    fn fail(reason: VerificationReason) -> Self {
        Self {
            valid: false,
            reason,
        }
    }
}

/// Errors that prevent a verdict from being reached at all.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Document carries no signature")]
    NotSigned,

    #[error("Cannot read document: {0}")]
    Document(#[from] std::io::Error),
}

impl Classify for VerifyError {
    fn class(&self) -> ErrorClass {
        match self {
            VerifyError::NotSigned => ErrorClass::InputInvalid,
            VerifyError::Document(_) => ErrorClass::MediumFailure,
        }
    }
}

/// Checks signature records against a trusted public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfSignatureChecker;

impl PdfSignatureChecker {
    pub fn new() -> Self {
        Self
    }

    /// Verify `record` over the canonical document bytes.
    pub fn verify(
        &self,
        canonical: &[u8],
        record: &SignatureRecord,
        trusted: &PublicKeyMaterial,
    ) -> VerificationResult {
        let result = self.evaluate(canonical, record, trusted);
        if result.valid {
            info!(
                target: AUDIT_TARGET,
                fingerprint = %trusted.fingerprint(),
                "Signature verified"
            );
        } else {
            warn!(
                target: AUDIT_TARGET,
                reason = ?result.reason,
                trusted = %trusted.fingerprint(),
                claimed = %record.signer_fingerprint(),
                "Signature rejected"
            );
        }
        result
    }

    /// Verify a document with an embedded signature container.
    pub fn verify_embedded(
        &self,
        signed: &[u8],
        trusted: &PublicKeyMaterial,
    ) -> Result<VerificationResult, VerifyError> {
        match container::extract(signed) {
            Ok(extracted) => Ok(self.verify(extracted.content, &extracted.record, trusted)),
            Err(ContainerError::NotSigned) => Err(VerifyError::NotSigned),
            Err(e) => {
                warn!(target: AUDIT_TARGET, error = %e, "Signature container unreadable");
                Ok(VerificationResult::fail(VerificationReason::DocumentTampered))
            }
        }
    }

    pub fn verify_source(
        &self,
        document: &dyn DocumentSource,
        trusted: &PublicKeyMaterial,
    ) -> Result<VerificationResult, VerifyError> {
        let bytes = document.read_document_bytes()?;
        self.verify_embedded(&bytes, trusted)
    }

    fn evaluate(
        &self,
        canonical: &[u8],
        record: &SignatureRecord,
        trusted: &PublicKeyMaterial,
    ) -> VerificationResult {
        let fresh = document_digest(canonical);

        if record.signer_fingerprint() != trusted.fingerprint() {
            return VerificationResult::fail(VerificationReason::KeyUnknown);
        }

        if record.version() != RECORD_VERSION
            || record.hash_algorithm() != HASH_ALGORITHM
            || record.document_hash().len() != DOCUMENT_HASH_LEN
        {
            return VerificationResult::fail(VerificationReason::HashMismatch);
        }
        if record.signature_algorithm() != SIGNATURE_ALGORITHM {
            return VerificationResult::fail(VerificationReason::BadSignature);
        }

        let Ok(public) = trusted.to_rsa() else {
            return VerificationResult::fail(VerificationReason::KeyUnknown);
        };
        let signature_covers =
            |digest: &[u8]| public.verify(Pss::new::<Sha256>(), digest, record.signature()).is_ok();

        if record.document_hash() == fresh {
            if signature_covers(&fresh[..]) {
                VerificationResult::ok()
            } else {
                VerificationResult::fail(VerificationReason::BadSignature)
            }
        } else if signature_covers(record.document_hash()) {
            VerificationResult::fail(VerificationReason::DocumentTampered)
        } else {
            VerificationResult::fail(VerificationReason::HashMismatch)
        }
    }
}
