//! Recovering the private key from a token.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokensign_core::config::DecryptorConfig;
use tokensign_core::logging::AUDIT_TARGET;
use tokensign_crypto::{KeyPair, KeySecurity, KeySecurityError, Passphrase, PrivateKeyMaterial};
use tracing::{info, warn};

use crate::error::{Result, TokenError};
use crate::handler::UsbKeyHandler;
use crate::presence::{PresenceCheck, TokenHandle};
use crate::prompt::{PassphraseProvider, PromptPurpose};

/// Counts consecutive wrong passphrases per token insertion.
///
/// The count is keyed by `(device_id, insertion)`, so pulling and
/// re-inserting the token starts a fresh budget and nothing else does.
#[derive(Debug)]
pub struct AttemptLimiter {
    max_attempts: u32,
    failures: Mutex<HashMap<(String, u64), u32>>,
}

impl AttemptLimiter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn key(token: &TokenHandle) -> (String, u64) {
        (token.device_id.clone(), token.insertion)
    }

    pub fn failures(&self, token: &TokenHandle) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(token))
            .copied()
            .unwrap_or(0)
    }

    pub fn remaining(&self, token: &TokenHandle) -> u32 {
        self.max_attempts.saturating_sub(self.failures(token))
    }

    pub fn is_locked(&self, token: &TokenHandle) -> bool {
        self.remaining(token) == 0
    }

    fn record_failure(&self, token: &TokenHandle) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        // Older insertions of this device can never be used again.
        failures.retain(|(device, insertion), _| {
            device != &token.device_id || *insertion >= token.insertion
        });
        let count = failures.entry(Self::key(token)).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&self, token: &TokenHandle) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(token));
    }
}

/// Loads the payload through a [`UsbKeyHandler`] and opens it.
pub struct KeyDecryptor<P> {
    handler: UsbKeyHandler<P>,
    key_security: KeySecurity,
    limiter: AttemptLimiter,
}

impl<P: PresenceCheck> KeyDecryptor<P> {
    pub fn new(handler: UsbKeyHandler<P>, key_security: KeySecurity, max_attempts: u32) -> Self {
        Self {
            handler,
            key_security,
            limiter: AttemptLimiter::new(max_attempts),
        }
    }

    pub fn from_config(
        handler: UsbKeyHandler<P>,
        key_security: KeySecurity,
        config: &DecryptorConfig,
    ) -> Self {
        Self::new(handler, key_security, config.max_attempts)
    }

    pub fn handler(&self) -> &UsbKeyHandler<P> {
        &self.handler
    }

    pub fn remaining_attempts(&self, token: &TokenHandle) -> u32 {
        self.limiter.remaining(token)
    }

    /// Recover the key pair from `token`.
    ///
    /// A locked-out insertion fails with `LockedOut` before the payload is
    /// even read. Only a wrong passphrase counts against the budget; a
    /// success resets it.
    pub fn recover(&self, token: &TokenHandle, passphrase: &Passphrase) -> Result<KeyPair> {
        if !self.handler.presence().is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        if self.limiter.is_locked(token) {
            let attempts = self.limiter.failures(token);
            warn!(
                target: AUDIT_TARGET,
                device = %token.device_id,
                attempts,
                "Passphrase attempt refused: token locked out"
            );
            return Err(TokenError::LockedOut { attempts });
        }

        let payload = self.handler.load(token)?;

        let plaintext = match self.key_security.decrypt(&payload, passphrase) {
            Ok(plaintext) => plaintext,
            Err(KeySecurityError::WrongPassphrase) => {
                let failures = self.limiter.record_failure(token);
                warn!(
                    target: AUDIT_TARGET,
                    device = %token.device_id,
                    failures,
                    remaining = self.limiter.max_attempts().saturating_sub(failures),
                    "Wrong passphrase"
                );
                return Err(TokenError::WrongPassphrase);
            }
            Err(e) => {
                warn!(
                    target: AUDIT_TARGET,
                    device = %token.device_id,
                    reason = %e,
                    "Key payload could not be opened"
                );
                return Err(e.into());
            }
        };

        // The plaintext is dropped (and zeroized) if the token went away.
        if !self.handler.presence().is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        self.limiter.reset(token);
        let private = PrivateKeyMaterial::from_pkcs8_der(plaintext);
        let public = private.public_key()?;
        info!(
            target: AUDIT_TARGET,
            device = %token.device_id,
            fingerprint = %public.fingerprint(),
            "Private key recovered"
        );
        Ok(KeyPair { public, private })
    }

    /// Prompt until the key opens, the operator cancels, or the insertion
    /// is locked out.
    pub fn recover_with_prompt(
        &self,
        token: &TokenHandle,
        provider: &mut dyn PassphraseProvider,
    ) -> Result<KeyPair> {
        loop {
            let remaining_attempts = self.limiter.remaining(token);
            if remaining_attempts == 0 {
                return Err(TokenError::LockedOut {
                    attempts: self.limiter.failures(token),
                });
            }
            let passphrase = provider
                .prompt_passphrase(PromptPurpose::Unlock { remaining_attempts })
                .ok_or(TokenError::Cancelled)?;
            match self.recover(token, &passphrase) {
                Err(TokenError::WrongPassphrase) => continue,
                other => return other,
            }
        }
    }
}
