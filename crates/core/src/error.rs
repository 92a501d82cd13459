//! Error taxonomy shared by every tokensign crate.
//!
//! Each crate defines its own `thiserror` enum and classifies its variants
//! into one of the five [`ErrorClass`] buckets. The class decides what the
//! operator is told; the variant itself (with its internal detail) is only
//! written to the audit log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Bad key size, empty document, malformed arguments.
    InputInvalid,
    /// RNG unavailable, KDF failure, primitive misuse.
    CryptoFailure,
    /// Wrong passphrase, bad signature, unknown key, lockout.
    AuthFailure,
    /// Token absent or removed, write error.
    MediumFailure,
    /// Corrupt payload, tampered document.
    IntegrityFailure,
}

impl ErrorClass {
    /// Message safe to show an operator.
    ///
    /// Distinguishes "wrong secret" from "corrupt data" and nothing finer,
    /// so a UI cannot be used as an oracle for which check failed first.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorClass::InputInvalid => "The request was invalid",
            ErrorClass::CryptoFailure => "A cryptographic operation could not be completed",
            ErrorClass::AuthFailure => "Authentication failed: wrong passphrase or untrusted key",
            ErrorClass::MediumFailure => "The USB token is unavailable or could not be written",
            ErrorClass::IntegrityFailure => "The data is corrupt or has been tampered with",
        }
    }

    /// Stable short code used in logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::InputInvalid => "INPUT_INVALID",
            ErrorClass::CryptoFailure => "CRYPTO_FAILURE",
            ErrorClass::AuthFailure => "AUTH_FAILURE",
            ErrorClass::MediumFailure => "MEDIUM_FAILURE",
            ErrorClass::IntegrityFailure => "INTEGRITY_FAILURE",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by every error type in the workspace.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn user_message(&self) -> &'static str {
        self.class().user_message()
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CoreError {
    fn class(&self) -> ErrorClass {
        match self {
            CoreError::Config(_) => ErrorClass::InputInvalid,
            CoreError::Io(_) => ErrorClass::MediumFailure,
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
