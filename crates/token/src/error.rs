//! Error types for token operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokensign_core::error::{Classify, ErrorClass};
use tokensign_crypto::{
    ContainerError, KeyCreationError, KeySecurityError, SigningError, VerifyError,
};

/// Errors that can occur while working with a key token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No token, or the handle no longer refers to the inserted token
    #[error("Token is not present")]
    TokenAbsent,

    /// Presence was lost between writing and committing the payload
    #[error("Token removed during write")]
    TokenRemovedMidWrite,

    #[error("Failed to write payload: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to read payload: {0}")]
    Read(#[source] io::Error),

    #[error("No key payload at {}", .0.display())]
    NotFound(PathBuf),

    /// Payload damaged, truncated, or failing its integrity check
    #[error("Corrupt key payload: {0}")]
    Corrupt(String),

    #[error("Wrong passphrase")]
    WrongPassphrase,

    /// Attempt budget for this insertion exhausted; re-insert the token
    #[error("Locked out after {attempts} failed attempts")]
    LockedOut { attempts: u32 },

    #[error("Passphrase entry cancelled")]
    Cancelled,

    #[error("Cannot enumerate volumes: {0}")]
    Enumeration(String),

    #[error("Key protection failure: {0}")]
    Crypto(KeySecurityError),

    #[error(transparent)]
    KeyCreation(#[from] KeyCreationError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("Cannot access {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Token watcher stopped")]
    WatcherClosed,
}

impl From<KeySecurityError> for TokenError {
    fn from(err: KeySecurityError) -> Self {
        match err {
            KeySecurityError::WrongPassphrase => TokenError::WrongPassphrase,
            KeySecurityError::CorruptPayload(reason) => TokenError::Corrupt(reason),
            other => TokenError::Crypto(other),
        }
    }
}

impl Classify for TokenError {
    fn class(&self) -> ErrorClass {
        match self {
            TokenError::TokenAbsent
            | TokenError::TokenRemovedMidWrite
            | TokenError::Write(_)
            | TokenError::Read(_)
            | TokenError::NotFound(_)
            | TokenError::Enumeration(_)
            | TokenError::File { .. }
            | TokenError::WatcherClosed => ErrorClass::MediumFailure,
            TokenError::Corrupt(_) => ErrorClass::IntegrityFailure,
            TokenError::WrongPassphrase | TokenError::LockedOut { .. } => ErrorClass::AuthFailure,
            TokenError::Cancelled => ErrorClass::InputInvalid,
            TokenError::Crypto(e) => e.class(),
            TokenError::KeyCreation(e) => e.class(),
            TokenError::Signing(e) => e.class(),
            TokenError::Container(e) => e.class(),
            TokenError::Verify(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;
