//! Reading and writing the encrypted key payload on a token.

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tokensign_core::config::{MediumConfig, TokenConfig};
use tokensign_core::logging::AUDIT_TARGET;
use tokensign_crypto::EncryptedKeyPayload;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::error::{Result, TokenError};
use crate::presence::{PresenceCheck, TokenHandle};

/// Bounded retry for transient medium errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    fn run<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if is_transient(&e) && attempt < self.retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Transient token I/O error, retrying");
                    thread::sleep(self.delay);
                }
                other => return other,
            }
        }
    }
}

impl From<&MediumConfig> for RetryPolicy {
    fn from(config: &MediumConfig) -> Self {
        Self {
            retries: config.io_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Deploys and loads the key payload on a token.
///
/// Every operation checks presence before touching the medium and again
/// after, so I/O through a handle invalidated by a removal never succeeds
/// silently.
pub struct UsbKeyHandler<P> {
    presence: P,
    payload_file: String,
    retry: RetryPolicy,
}

impl<P: PresenceCheck> UsbKeyHandler<P> {
    pub fn new(presence: P, payload_file: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            presence,
            payload_file: payload_file.into(),
            retry,
        }
    }

    pub fn from_config(presence: P, token: &TokenConfig, medium: &MediumConfig) -> Self {
        Self::new(presence, token.payload_file.clone(), RetryPolicy::from(medium))
    }

    pub fn presence(&self) -> &P {
        &self.presence
    }

    pub fn payload_path(&self, token: &TokenHandle) -> PathBuf {
        token.payload_path(&self.payload_file)
    }

    pub fn has_payload(&self, token: &TokenHandle) -> bool {
        self.presence.is_present(token) && self.payload_path(token).is_file()
    }

    /// Write `payload` to the token.
    ///
    /// The payload lands in a temporary file, is fsynced, and is renamed into
    /// place only if the token is still present. The committed bytes are read
    /// back and compared.
    pub fn deploy(&self, payload: &EncryptedKeyPayload, token: &TokenHandle) -> Result<PathBuf> {
        if !self.presence.is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        let path = self.payload_path(token);
        let bytes = payload.encode();

        let mut writer = self
            .retry
            .run(|| AtomicFile::create(&path))
            .map_err(|e| self.write_failure(token, e))?;

        let staged = writer.write_all(&bytes).and_then(|_| writer.sync());
        if let Err(e) = staged {
            writer.abort();
            return Err(self.write_failure(token, e));
        }

        if !self.presence.is_present(token) {
            writer.abort();
            warn!(device = %token.device_id, "Token removed before payload commit");
            return Err(TokenError::TokenRemovedMidWrite);
        }

        writer
            .commit()
            .map_err(|e| self.write_failure(token, e))?;

        if !self.presence.is_present(token) {
            warn!(device = %token.device_id, "Token removed right after payload commit");
            return Err(TokenError::TokenRemovedMidWrite);
        }

        let written = self
            .retry
            .run(|| std::fs::read(&path))
            .map_err(|e| self.write_failure(token, e))?;
        if written != bytes {
            let _ = std::fs::remove_file(&path);
            return Err(TokenError::Write(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload read-back does not match",
            )));
        }

        info!(
            device = %token.device_id,
            path = %path.display(),
            bytes = bytes.len(),
            "Key payload deployed"
        );
        Ok(path)
    }

    /// Read and structurally validate the payload on the token.
    pub fn load(&self, token: &TokenHandle) -> Result<EncryptedKeyPayload> {
        if !self.presence.is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        let path = self.payload_path(token);
        let read = self.retry.run(|| std::fs::read(&path));

        if !self.presence.is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TokenError::NotFound(path))
            }
            Err(e) => return Err(TokenError::Read(e)),
        };

        let payload = EncryptedKeyPayload::decode(&bytes)
            .and_then(|p| p.verify_integrity().map(|_| p))
            .map_err(|e| {
                warn!(
                    target: AUDIT_TARGET,
                    device = %token.device_id,
                    reason = %e,
                    "Rejected key payload"
                );
                TokenError::Corrupt(e.to_string())
            })?;

        debug!(device = %token.device_id, "Key payload loaded");
        Ok(payload)
    }

    fn write_failure(&self, token: &TokenHandle, err: io::Error) -> TokenError {
        if self.presence.is_present(token) {
            TokenError::Write(err)
        } else {
            TokenError::TokenRemovedMidWrite
        }
    }
}
