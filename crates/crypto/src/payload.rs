//! On-token encoding of an encrypted private key.
//!
//! # Layout (version 1)
//!
//! All integers are little-endian; every variable-length field carries its
//! own length prefix so a reader never has to guess sizes.
//!
//! ```text
//! magic        4   "TSKP"
//! version      1   0x01
//! kdf          1   0x01 = Argon2id v1.3
//! memory_kib   4   u32
//! iterations   4   u32
//! parallelism  4   u32
//! salt_len     2   u16, then salt
//! nonce_len    2   u16, then nonce (ChaCha20-Poly1305, 12 bytes)
//! cipher_len   4   u32, then ciphertext (includes the 16 byte AEAD tag)
//! tag_len      2   u16, then integrity tag (BLAKE3 of every preceding byte)
//! ```
//!
//! The header (magic through nonce) is bound into the AEAD as associated
//! data. The trailing integrity tag is keyless: it lets a reader tell a
//! damaged or altered payload apart from a wrong passphrase before any key
//! derivation runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokensign_core::config::{KdfConfig, MAX_KDF_MEMORY_KIB, MAX_KDF_PARALLELISM};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"TSKP";
pub const PAYLOAD_VERSION: u8 = 1;
pub const KDF_ARGON2ID: u8 = 1;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const INTEGRITY_TAG_LEN: usize = 32;
pub const AEAD_TAG_LEN: usize = 16;

const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;
/// A PKCS#8 RSA-16384 key stays well below this.
const MAX_CIPHERTEXT_LEN: usize = 64 * 1024;

/// Structural payload errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported key derivation function {0}")]
    UnsupportedKdf(u8),

    #[error("field {field} has invalid length {len}")]
    InvalidLength { field: &'static str, len: usize },

    #[error("key derivation parameters out of range")]
    InvalidKdfParams,

    #[error("{0} trailing bytes after integrity tag")]
    TrailingBytes(usize),

    #[error("integrity tag mismatch")]
    IntegrityMismatch,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub const fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let sane = self.iterations > 0
            && self.parallelism > 0
            && self.parallelism <= MAX_KDF_PARALLELISM
            && self.memory_kib >= 8 * self.parallelism
            && self.memory_kib <= MAX_KDF_MEMORY_KIB;
        if sane {
            Ok(())
        } else {
            Err(PayloadError::InvalidKdfParams)
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&KdfConfig::default())
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(config: &KdfConfig) -> Self {
        Self::new(config.memory_kib, config.iterations, config.parallelism)
    }
}

/// Encrypted private key as stored on a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedKeyPayload {
    pub(crate) kdf_params: KdfParams,
    pub(crate) salt: Vec<u8>,
    pub(crate) nonce: [u8; NONCE_LEN],
    pub(crate) cipher_text: Vec<u8>,
    pub(crate) integrity_tag: [u8; INTEGRITY_TAG_LEN],
}

impl EncryptedKeyPayload {
    /// Assemble a payload and compute its integrity tag.
    pub(crate) fn seal(
        kdf_params: KdfParams,
        salt: Vec<u8>,
        nonce: [u8; NONCE_LEN],
        cipher_text: Vec<u8>,
    ) -> Self {
        let mut payload = Self {
            kdf_params,
            salt,
            nonce,
            cipher_text,
            integrity_tag: [0u8; INTEGRITY_TAG_LEN],
        };
        payload.integrity_tag = payload.compute_integrity_tag();
        payload
    }

    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf_params
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn cipher_text(&self) -> &[u8] {
        &self.cipher_text
    }

    pub fn integrity_tag(&self) -> &[u8; INTEGRITY_TAG_LEN] {
        &self.integrity_tag
    }

    /// Header bytes bound into the AEAD as associated data.
    pub(crate) fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22 + self.salt.len() + NONCE_LEN);
        out.extend_from_slice(PAYLOAD_MAGIC);
        out.push(PAYLOAD_VERSION);
        out.push(KDF_ARGON2ID);
        out.extend_from_slice(&self.kdf_params.memory_kib.to_le_bytes());
        out.extend_from_slice(&self.kdf_params.iterations.to_le_bytes());
        out.extend_from_slice(&self.kdf_params.parallelism.to_le_bytes());
        out.extend_from_slice(&(self.salt.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&(NONCE_LEN as u16).to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&(self.cipher_text.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.cipher_text);
        out
    }

    fn compute_integrity_tag(&self) -> [u8; INTEGRITY_TAG_LEN] {
        *blake3::hash(&self.body_bytes()).as_bytes()
    }

    /// Check the keyless integrity tag.
    ///
    /// Comparison goes through `blake3::Hash`, which compares in constant time.
    pub fn verify_integrity(&self) -> Result<(), PayloadError> {
        let expected = blake3::Hash::from(self.integrity_tag);
        if blake3::hash(&self.body_bytes()) == expected {
            Ok(())
        } else {
            Err(PayloadError::IntegrityMismatch)
        }
    }

    /// Serialize to the on-token representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        out.extend_from_slice(&(INTEGRITY_TAG_LEN as u16).to_le_bytes());
        out.extend_from_slice(&self.integrity_tag);
        out
    }

    /// Parse the on-token representation.
    ///
    /// Only structure is validated here; the integrity tag is checked by
    /// [`EncryptedKeyPayload::verify_integrity`] before decryption.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = Reader::new(bytes);

        if reader.take(4, "magic")? != PAYLOAD_MAGIC {
            return Err(PayloadError::BadMagic);
        }

        let version = reader.u8("version")?;
        if version != PAYLOAD_VERSION {
            return Err(PayloadError::UnsupportedVersion(version));
        }

        let kdf = reader.u8("kdf")?;
        if kdf != KDF_ARGON2ID {
            return Err(PayloadError::UnsupportedKdf(kdf));
        }

        let kdf_params = KdfParams::new(
            reader.u32("memory_kib")?,
            reader.u32("iterations")?,
            reader.u32("parallelism")?,
        );
        kdf_params.validate()?;

        let salt_len = reader.u16("salt_len")? as usize;
        if !(MIN_SALT_LEN..=MAX_SALT_LEN).contains(&salt_len) {
            return Err(PayloadError::InvalidLength {
                field: "salt",
                len: salt_len,
            });
        }
        let salt = reader.take(salt_len, "salt")?.to_vec();

        let nonce_len = reader.u16("nonce_len")? as usize;
        if nonce_len != NONCE_LEN {
            return Err(PayloadError::InvalidLength {
                field: "nonce",
                len: nonce_len,
            });
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(reader.take(NONCE_LEN, "nonce")?);

        let cipher_len = reader.u32("cipher_len")? as usize;
        if !(AEAD_TAG_LEN + 1..=MAX_CIPHERTEXT_LEN).contains(&cipher_len) {
            return Err(PayloadError::InvalidLength {
                field: "cipher_text",
                len: cipher_len,
            });
        }
        let cipher_text = reader.take(cipher_len, "cipher_text")?.to_vec();

        let tag_len = reader.u16("tag_len")? as usize;
        if tag_len != INTEGRITY_TAG_LEN {
            return Err(PayloadError::InvalidLength {
                field: "integrity_tag",
                len: tag_len,
            });
        }
        let mut integrity_tag = [0u8; INTEGRITY_TAG_LEN];
        integrity_tag.copy_from_slice(reader.take(INTEGRITY_TAG_LEN, "integrity_tag")?);

        if reader.remaining() != 0 {
            return Err(PayloadError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            kdf_params,
            salt,
            nonce,
            cipher_text,
            integrity_tag,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], PayloadError> {
        if self.remaining() < len {
            return Err(PayloadError::Truncated { field });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, PayloadError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, PayloadError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2, field)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, PayloadError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_le_bytes(buf))
    }
}
