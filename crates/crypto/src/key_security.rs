//! Passphrase protection for private key material.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id v1.3, parameters recorded in the payload
//! - **Encryption**: ChaCha20-Poly1305 with the payload header as associated data
//! - **Integrity**: keyless BLAKE3 tag over the encoded payload
//!
//! Decryption checks the integrity tag first. A payload that passes the
//! integrity check but fails AEAD authentication was therefore sealed under
//! a different passphrase, which is how [`KeySecurityError::WrongPassphrase`]
//! and [`KeySecurityError::CorruptPayload`] stay distinguishable.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use thiserror::Error;
use tokensign_core::error::{Classify, ErrorClass};
use zeroize::{Zeroize, Zeroizing};

use crate::entropy::{random_array, OsRandom, RandomSource};
use crate::payload::{EncryptedKeyPayload, KdfParams, PayloadError, NONCE_LEN, SALT_LEN};

const DERIVED_KEY_LEN: usize = 32;

/// Errors from sealing or opening a key payload.
#[derive(Debug, Error)]
pub enum KeySecurityError {
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,

    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Corrupt key payload: {0}")]
    CorruptPayload(String),

    #[error("Key derivation failed: {0}")]
    Kdf(String),

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

impl Classify for KeySecurityError {
    fn class(&self) -> ErrorClass {
        match self {
            KeySecurityError::EmptyPassphrase => ErrorClass::InputInvalid,
            KeySecurityError::WrongPassphrase => ErrorClass::AuthFailure,
            KeySecurityError::CorruptPayload(_) => ErrorClass::IntegrityFailure,
            KeySecurityError::Kdf(_)
            | KeySecurityError::EntropyUnavailable(_)
            | KeySecurityError::Encryption(_) => ErrorClass::CryptoFailure,
        }
    }
}

impl From<PayloadError> for KeySecurityError {
    fn from(err: PayloadError) -> Self {
        KeySecurityError::CorruptPayload(err.to_string())
    }
}

/// Operator secret. Cleared from memory on drop.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Passphrase {
    fn from(mut value: String) -> Self {
        let passphrase = Self::new(value.as_bytes().to_vec());
        value.zeroize();
        passphrase
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Seals and opens private key bytes under a passphrase.
#[derive(Debug, Clone)]
pub struct KeySecurity {
    params: KdfParams,
}

impl KeySecurity {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Encrypt `private_key` with a fresh salt and nonce from the OS.
    pub fn encrypt(
        &self,
        private_key: &[u8],
        passphrase: &Passphrase,
    ) -> Result<EncryptedKeyPayload, KeySecurityError> {
        self.encrypt_with_source(private_key, passphrase, &mut OsRandom)
    }

    /// Encrypt `private_key`, drawing salt and nonce from `source`.
    pub fn encrypt_with_source(
        &self,
        private_key: &[u8],
        passphrase: &Passphrase,
        source: &mut dyn RandomSource,
    ) -> Result<EncryptedKeyPayload, KeySecurityError> {
        if passphrase.is_empty() {
            return Err(KeySecurityError::EmptyPassphrase);
        }
        self.params
            .validate()
            .map_err(|e| KeySecurityError::Kdf(e.to_string()))?;

        let salt: [u8; SALT_LEN] =
            random_array(source).map_err(|e| KeySecurityError::EntropyUnavailable(e.0))?;
        let nonce: [u8; NONCE_LEN] =
            random_array(source).map_err(|e| KeySecurityError::EntropyUnavailable(e.0))?;

        let key = derive_key(passphrase, &salt, &self.params)?;

        // The header does not depend on the ciphertext, so build it from a
        // placeholder payload and reuse it as associated data.
        let header = EncryptedKeyPayload::seal(self.params, salt.to_vec(), nonce, Vec::new())
            .header_bytes();

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let cipher_text = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: private_key,
                    aad: &header,
                },
            )
            .map_err(|e| KeySecurityError::Encryption(e.to_string()))?;

        Ok(EncryptedKeyPayload::seal(
            self.params,
            salt.to_vec(),
            nonce,
            cipher_text,
        ))
    }

    /// Decrypt a payload.
    ///
    /// Uses the KDF parameters recorded in the payload, not `self.params`, so
    /// keys sealed under older settings still open.
    pub fn decrypt(
        &self,
        payload: &EncryptedKeyPayload,
        passphrase: &Passphrase,
    ) -> Result<Zeroizing<Vec<u8>>, KeySecurityError> {
        payload.verify_integrity()?;

        if passphrase.is_empty() {
            return Err(KeySecurityError::WrongPassphrase);
        }

        let key = derive_key(passphrase, payload.salt(), payload.kdf_params())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let header = payload.header_bytes();

        cipher
            .decrypt(
                Nonce::from_slice(payload.nonce()),
                Payload {
                    msg: payload.cipher_text(),
                    aad: &header,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| KeySecurityError::WrongPassphrase)
    }

    /// Decode raw token bytes and decrypt them.
    pub fn decrypt_bytes(
        &self,
        bytes: &[u8],
        passphrase: &Passphrase,
    ) -> Result<Zeroizing<Vec<u8>>, KeySecurityError> {
        let payload = EncryptedKeyPayload::decode(bytes)?;
        self.decrypt(&payload, passphrase)
    }
}

impl Default for KeySecurity {
    fn default() -> Self {
        Self::new(KdfParams::default())
    }
}

fn derive_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, KeySecurityError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| KeySecurityError::Kdf(format!("invalid Argon2 parameters: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| KeySecurityError::Kdf(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::testing::BrokenRandom;
    use proptest::prelude::*;

    fn fast() -> KeySecurity {
        KeySecurity::new(KdfParams::new(1024, 1, 1))
    }

    #[test]
    fn test_round_trip() {
        let security = fast();
        let secret = b"-----private key bytes-----".to_vec();
        let payload = security
            .encrypt(&secret, &Passphrase::from("correct horse"))
            .unwrap();

        let opened = security
            .decrypt(&payload, &Passphrase::from("correct horse"))
            .unwrap();
        assert_eq!(opened.as_slice(), secret.as_slice());
    }

    #[test]
    fn test_wrong_passphrase() {
        let security = fast();
        let payload = security.encrypt(b"secret", &Passphrase::from("a")).unwrap();
        let err = security.decrypt(&payload, &Passphrase::from("b")).unwrap_err();
        assert!(matches!(err, KeySecurityError::WrongPassphrase));
        assert_eq!(err.class(), ErrorClass::AuthFailure);
    }

    #[test]
    fn test_empty_passphrase_rejected_on_encrypt() {
        let err = fast().encrypt(b"secret", &Passphrase::from("")).unwrap_err();
        assert!(matches!(err, KeySecurityError::EmptyPassphrase));
    }

    #[test]
    fn test_same_input_encrypts_differently() {
        let security = fast();
        let pass = Passphrase::from("pin");
        let a = security.encrypt(b"secret", &pass).unwrap();
        let b = security.encrypt(b"secret", &pass).unwrap();
        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.cipher_text(), b.cipher_text());
    }

    #[test]
    fn test_broken_entropy_is_reported() {
        let err = fast()
            .encrypt_with_source(b"secret", &Passphrase::from("pin"), &mut BrokenRandom)
            .unwrap_err();
        assert!(matches!(err, KeySecurityError::EntropyUnavailable(_)));
        assert_eq!(err.class(), ErrorClass::CryptoFailure);
    }

    #[test]
    fn test_decrypt_uses_recorded_params() {
        let payload = KeySecurity::new(KdfParams::new(2048, 2, 1))
            .encrypt(b"secret", &Passphrase::from("pin"))
            .unwrap();
        let opened = fast().decrypt(&payload, &Passphrase::from("pin")).unwrap();
        assert_eq!(opened.as_slice(), b"secret");
    }

    #[test]
    fn test_truncated_bytes_are_corrupt() {
        let security = fast();
        let bytes = security
            .encrypt(b"secret", &Passphrase::from("pin"))
            .unwrap()
            .encode();
        let err = security
            .decrypt_bytes(&bytes[..bytes.len() - 5], &Passphrase::from("pin"))
            .unwrap_err();
        assert!(matches!(err, KeySecurityError::CorruptPayload(_)));
        assert_eq!(err.class(), ErrorClass::IntegrityFailure);
    }

    #[test]
    fn test_passphrase_debug_is_redacted() {
        let rendered = format!("{:?}", Passphrase::from("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        // Any single flipped bit is caught as corruption, never mistaken
        // for a passphrase problem.
        #[test]
        fn prop_bit_flip_is_corrupt(index in any::<prop::sample::Index>(), bit in 0u8..8) {
            let security = fast();
            let mut bytes = security
                .encrypt(b"0123456789abcdef", &Passphrase::from("pin"))
                .unwrap()
                .encode();
            let at = index.index(bytes.len());
            bytes[at] ^= 1 << bit;

            let err = security
                .decrypt_bytes(&bytes, &Passphrase::from("pin"))
                .unwrap_err();
            prop_assert!(matches!(err, KeySecurityError::CorruptPayload(_)), "got {:?}", err);
        }
    }
}
