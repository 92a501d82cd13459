//! RSA key material and key creation.
//!
//! Private halves are held as PKCS#8 DER inside a zeroizing buffer and are
//! only ever turned into an `RsaPrivateKey` for the duration of one
//! signature. Public halves are SPKI DER and identified by a [`Fingerprint`].

use std::fmt;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokensign_core::config::{KeyConfig, ABSOLUTE_MINIMUM_KEY_BITS};
pub use tokensign_core::config::MAXIMUM_KEY_BITS;
use tokensign_core::error::{Classify, ErrorClass};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::entropy::{seeded_rng, OsRandom, RandomSource};
use crate::key_security::{KeySecurity, KeySecurityError, Passphrase};
use crate::payload::EncryptedKeyPayload;

pub const FINGERPRINT_LEN: usize = 16;

/// Errors raised while creating or decoding key material.
#[derive(Debug, Error)]
pub enum KeyCreationError {
    #[error("Key size {requested} is below the minimum of {minimum} bits")]
    WeakKeySize { requested: usize, minimum: usize },

    #[error("Key size {requested} is not supported (maximum {maximum}, multiple of 8)")]
    UnsupportedKeySize { requested: usize, maximum: usize },

    #[error("Random source failure: {0}")]
    RngFailure(String),

    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Key encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Security(#[from] KeySecurityError),
}

impl Classify for KeyCreationError {
    fn class(&self) -> ErrorClass {
        match self {
            KeyCreationError::WeakKeySize { .. } | KeyCreationError::UnsupportedKeySize { .. } => {
                ErrorClass::InputInvalid
            }
            KeyCreationError::RngFailure(_) | KeyCreationError::Generation(_) => {
                ErrorClass::CryptoFailure
            }
            KeyCreationError::Encoding(_) => ErrorClass::InputInvalid,
            KeyCreationError::Security(e) => e.class(),
        }
    }
}

/// Short public key identifier: the first 16 bytes of BLAKE3(SPKI DER).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of_spki(spki_der: &[u8]) -> Self {
        let hash = blake3::hash(spki_der);
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..FINGERPRINT_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, KeyCreationError> {
        let raw = hex::decode(text).map_err(|e| KeyCreationError::Encoding(e.to_string()))?;
        let bytes: [u8; FINGERPRINT_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            KeyCreationError::Encoding(format!("fingerprint has {} bytes", v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Public half of a key pair, SPKI DER encoded. Freely distributable.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    spki_der: Vec<u8>,
    fingerprint: Fingerprint,
}

impl PublicKeyMaterial {
    /// Parse and validate SPKI DER bytes.
    pub fn from_der(spki_der: &[u8]) -> Result<Self, KeyCreationError> {
        RsaPublicKey::from_public_key_der(spki_der)
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))?;
        Ok(Self {
            spki_der: spki_der.to_vec(),
            fingerprint: Fingerprint::of_spki(spki_der),
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self, KeyCreationError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))?;
        Self::from_rsa(&key)
    }

    pub(crate) fn from_rsa(key: &RsaPublicKey) -> Result<Self, KeyCreationError> {
        let der = key
            .to_public_key_der()
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))?;
        Ok(Self {
            fingerprint: Fingerprint::of_spki(der.as_bytes()),
            spki_der: der.as_bytes().to_vec(),
        })
    }

    pub fn to_pem(&self) -> Result<String, KeyCreationError> {
        self.to_rsa()?
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))
    }

    pub fn as_der(&self) -> &[u8] {
        &self.spki_der
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn bits(&self) -> Result<usize, KeyCreationError> {
        Ok(self.to_rsa()?.size() * 8)
    }

    pub(crate) fn to_rsa(&self) -> Result<RsaPublicKey, KeyCreationError> {
        RsaPublicKey::from_public_key_der(&self.spki_der)
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyMaterial")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Private half of a key pair, PKCS#8 DER in a zeroizing buffer.
///
/// Owned by exactly one signing session. [`PrivateKeyMaterial::release`]
/// wipes it; a released key reports itself unavailable and cannot sign.
pub struct PrivateKeyMaterial {
    pkcs8_der: Zeroizing<Vec<u8>>,
}

impl PrivateKeyMaterial {
    pub fn from_pkcs8_der(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { pkcs8_der: bytes }
    }

    pub fn is_available(&self) -> bool {
        !self.pkcs8_der.is_empty() && self.pkcs8_der.iter().any(|b| *b != 0)
    }

    /// Zeroize and drop the key bytes.
    pub fn release(&mut self) {
        self.pkcs8_der.zeroize();
        self.pkcs8_der.clear();
    }

    pub(crate) fn as_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    pub(crate) fn to_rsa(&self) -> Result<RsaPrivateKey, KeyCreationError> {
        RsaPrivateKey::from_pkcs8_der(&self.pkcs8_der)
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))
    }

    /// Derive the matching public half.
    pub fn public_key(&self) -> Result<PublicKeyMaterial, KeyCreationError> {
        PublicKeyMaterial::from_rsa(&self.to_rsa()?.to_public_key())
    }
}

impl fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyMaterial")
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

/// A freshly generated or recovered key pair.
#[derive(Debug)]
pub struct KeyPair {
    pub public: PublicKeyMaterial,
    pub private: PrivateKeyMaterial,
}

impl KeyPair {
    pub fn into_parts(self) -> (PublicKeyMaterial, PrivateKeyMaterial) {
        (self.public, self.private)
    }
}

/// Output of [`RsaKeyCreator::create`]: the sealed private half plus the
/// public half. The plaintext private key no longer exists at this point.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub payload: EncryptedKeyPayload,
    pub public_key: PublicKeyMaterial,
}

/// Generates RSA key pairs and seals the private half immediately.
#[derive(Debug, Clone)]
pub struct RsaKeyCreator {
    minimum_bits: usize,
    key_security: KeySecurity,
}

impl RsaKeyCreator {
    /// The floor is clamped to 2048 bits whatever the caller asks for.
    pub fn new(minimum_bits: usize, key_security: KeySecurity) -> Self {
        Self {
            minimum_bits: minimum_bits.max(ABSOLUTE_MINIMUM_KEY_BITS),
            key_security,
        }
    }

    pub fn from_config(keys: &KeyConfig, key_security: KeySecurity) -> Self {
        Self::new(keys.minimum_bits, key_security)
    }

    pub fn minimum_bits(&self) -> usize {
        self.minimum_bits
    }

    pub fn create(
        &self,
        bits: usize,
        passphrase: &Passphrase,
    ) -> Result<CreatedKey, KeyCreationError> {
        self.create_with_source(bits, passphrase, &mut OsRandom)
    }

    pub fn create_with_source(
        &self,
        bits: usize,
        passphrase: &Passphrase,
        source: &mut dyn RandomSource,
    ) -> Result<CreatedKey, KeyCreationError> {
        if passphrase.is_empty() {
            return Err(KeySecurityError::EmptyPassphrase.into());
        }

        let KeyPair {
            public,
            mut private,
        } = self.generate_key_pair_with_source(bits, source)?;

        let sealed = self
            .key_security
            .encrypt_with_source(private.as_der(), passphrase, source);
        private.release();
        let payload = sealed?;

        info!(
            fingerprint = %public.fingerprint(),
            bits,
            "Created RSA key pair and sealed private key"
        );

        Ok(CreatedKey {
            payload,
            public_key: public,
        })
    }

    /// Generate an unsealed key pair. Callers own the private half.
    pub fn generate_key_pair(&self, bits: usize) -> Result<KeyPair, KeyCreationError> {
        self.generate_key_pair_with_source(bits, &mut OsRandom)
    }

    pub fn generate_key_pair_with_source(
        &self,
        bits: usize,
        source: &mut dyn RandomSource,
    ) -> Result<KeyPair, KeyCreationError> {
        self.check_size(bits)?;

        let mut rng = seeded_rng(source).map_err(|e| KeyCreationError::RngFailure(e.0))?;

        debug!(bits, "Generating RSA key pair");
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| KeyCreationError::Generation(e.to_string()))?;

        let public = PublicKeyMaterial::from_rsa(&private.to_public_key())?;
        let der = private
            .to_pkcs8_der()
            .map_err(|e| KeyCreationError::Encoding(e.to_string()))?;

        Ok(KeyPair {
            public,
            private: PrivateKeyMaterial::from_pkcs8_der(Zeroizing::new(der.as_bytes().to_vec())),
        })
    }

    fn check_size(&self, bits: usize) -> Result<(), KeyCreationError> {
        if bits < self.minimum_bits {
            return Err(KeyCreationError::WeakKeySize {
                requested: bits,
                minimum: self.minimum_bits,
            });
        }
        if bits > MAXIMUM_KEY_BITS || bits % 8 != 0 {
            return Err(KeyCreationError::UnsupportedKeySize {
                requested: bits,
                maximum: MAXIMUM_KEY_BITS,
            });
        }
        Ok(())
    }
}

impl Default for RsaKeyCreator {
    fn default() -> Self {
        Self::new(ABSOLUTE_MINIMUM_KEY_BITS, KeySecurity::default())
    }
}
