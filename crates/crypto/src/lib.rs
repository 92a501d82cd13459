//! Cryptographic core of tokensign.
//!
//! Covers everything that does not touch a USB token:
//!
//! - **Key protection**: Argon2id + ChaCha20-Poly1305 sealing of private keys
//!   ([`key_security`]), with a self-describing on-token encoding ([`payload`])
//! - **Key material**: RSA key pairs, fingerprints and creation ([`keys`])
//! - **Signing**: RSASSA-PSS over the SHA-256 of a document's canonical range
//!   ([`signing`]), embedded with a versioned trailer ([`container`])
//! - **Verification**: read-only checks against a trusted public key ([`verifier`])
//!
//! # Security Principles
//!
//! - Plaintext private keys exist only inside zeroizing buffers
//! - A private key is released by the signer after exactly one signature
//! - Payload integrity is checked before any key derivation runs
//! - Secrets are never logged

pub mod container;
pub mod document;
pub mod entropy;
pub mod key_security;
pub mod keys;
pub mod payload;
pub mod signing;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use container::{ContainerError, Extracted};
pub use document::{DocumentSource, FileDocument, MemoryDocument};
pub use entropy::{EntropyError, OsRandom, RandomSource};
pub use key_security::{KeySecurity, KeySecurityError, Passphrase};
pub use keys::{
    CreatedKey, Fingerprint, KeyCreationError, KeyPair, PrivateKeyMaterial, PublicKeyMaterial,
    RsaKeyCreator,
};
pub use payload::{EncryptedKeyPayload, KdfParams, PayloadError};
pub use signing::{DigitalSigner, SignatureRecord, SigningError, SigningMetrics};
pub use verifier::{PdfSignatureChecker, VerificationReason, VerificationResult, VerifyError};
