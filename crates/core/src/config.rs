//! Configuration management for tokensign.
//!
//! Configuration lives in a TOML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration; `validate` rejects
//! values that would weaken key custody.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "TOKENSIGN_CONFIG";

/// RSA modulus sizes below this are never accepted, whatever the file says.
pub const ABSOLUTE_MINIMUM_KEY_BITS: usize = 2048;

/// Largest modulus the RSA backend will decode.
pub const MAXIMUM_KEY_BITS: usize = 4096;

/// Largest Argon2 memory cost accepted (4 GiB).
pub const MAX_KDF_MEMORY_KIB: u32 = 4 * 1024 * 1024;

/// Largest Argon2 lane count accepted.
pub const MAX_KDF_PARALLELISM: u32 = 64;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub kdf: KdfConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub decryptor: DecryptorConfig,
    #[serde(default)]
    pub medium: MediumConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyConfig {
    #[serde(default = "default_key_bits")]
    pub default_bits: usize,
    #[serde(default = "default_minimum_bits")]
    pub minimum_bits: usize,
}

/// Argon2id cost parameters used when new payloads are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfConfig {
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

/// How a mounted volume is recognised as a key token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MarkerCriteria {
    /// The volume carries the encrypted payload file.
    Payload,
    /// Any removable volume (used when provisioning blank drives).
    Any,
    /// The volume root contains a file with this name.
    File(String),
    /// The volume label (last mount path component) equals this value.
    Label(String),
}

/// A directory under which removable volumes get mounted.
///
/// `depth` is how many path levels below `path` the volume roots sit:
/// `/media/<user>/<label>` is depth 2, `/Volumes/<label>` depth 1, and a
/// Windows drive root such as `E:\` is depth 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRoot {
    pub path: PathBuf,
    #[serde(default = "default_depth")]
    pub depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenConfig {
    #[serde(default = "default_payload_file")]
    pub payload_file: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Ignore volumes already mounted when the watcher starts.
    #[serde(default)]
    pub ignore_preexisting: bool,
    #[serde(default = "default_marker")]
    pub marker: MarkerCriteria,
    #[serde(default = "default_mount_roots")]
    pub mount_roots: Vec<MountRoot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Retry policy for transient token I/O. Never applied to passphrase or
/// decryption failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediumConfig {
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_key_bits() -> usize {
    4096
}

fn default_minimum_bits() -> usize {
    ABSOLUTE_MINIMUM_KEY_BITS
}

fn default_memory_kib() -> u32 {
    65536
}

fn default_iterations() -> u32 {
    3
}

fn default_parallelism() -> u32 {
    4
}

fn default_payload_file() -> String {
    "private_encrypted.tsk".to_string()
}

fn default_marker() -> MarkerCriteria {
    MarkerCriteria::Payload
}

fn default_depth() -> u8 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    5
}

fn default_io_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    50
}

#[cfg(target_os = "linux")]
fn default_mount_roots() -> Vec<MountRoot> {
    vec![
        MountRoot { path: PathBuf::from("/media"), depth: 2 },
        MountRoot { path: PathBuf::from("/run/media"), depth: 2 },
        MountRoot { path: PathBuf::from("/mnt"), depth: 1 },
    ]
}

#[cfg(target_os = "macos")]
fn default_mount_roots() -> Vec<MountRoot> {
    vec![MountRoot { path: PathBuf::from("/Volumes"), depth: 1 }]
}

#[cfg(windows)]
fn default_mount_roots() -> Vec<MountRoot> {
    // C: is the system drive, removable media shows up from D: onwards
    (b'D'..=b'Z')
        .map(|letter| MountRoot {
            path: PathBuf::from(format!("{}:\\", letter as char)),
            depth: 0,
        })
        .collect()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn default_mount_roots() -> Vec<MountRoot> {
    vec![MountRoot { path: PathBuf::from("/media"), depth: 1 }]
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            default_bits: default_key_bits(),
            minimum_bits: default_minimum_bits(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            payload_file: default_payload_file(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            ignore_preexisting: false,
            marker: default_marker(),
            mount_roots: default_mount_roots(),
        }
    }
}

impl Default for DecryptorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            io_retries: default_io_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys: KeyConfig::default(),
            kdf: KdfConfig::default(),
            token: TokenConfig::default(),
            decryptor: DecryptorConfig::default(),
            medium: MediumConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the configuration used by the tools.
    ///
    /// An explicit path must exist. Otherwise `TOKENSIGN_CONFIG` is consulted,
    /// and without it the built-in defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                tracing::debug!(path = ?path, "Loading configuration from environment");
                Self::from_file(PathBuf::from(path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.minimum_bits < ABSOLUTE_MINIMUM_KEY_BITS {
            return Err(ConfigError::ValidationError(format!(
                "keys.minimum_bits must be at least {}",
                ABSOLUTE_MINIMUM_KEY_BITS
            )));
        }

        if self.keys.default_bits < self.keys.minimum_bits {
            return Err(ConfigError::ValidationError(
                "keys.default_bits is below keys.minimum_bits".to_string(),
            ));
        }

        if self.keys.default_bits > MAXIMUM_KEY_BITS {
            return Err(ConfigError::ValidationError(format!(
                "keys.default_bits must not exceed {}",
                MAXIMUM_KEY_BITS
            )));
        }

        if self.kdf.iterations == 0 {
            return Err(ConfigError::ValidationError(
                "kdf.iterations must be non-zero".to_string(),
            ));
        }

        if !(1..=MAX_KDF_PARALLELISM).contains(&self.kdf.parallelism) {
            return Err(ConfigError::ValidationError(format!(
                "kdf.parallelism must be between 1 and {}",
                MAX_KDF_PARALLELISM
            )));
        }

        let min_memory_kib = 8 * self.kdf.parallelism;
        if self.kdf.memory_kib < min_memory_kib || self.kdf.memory_kib > MAX_KDF_MEMORY_KIB {
            return Err(ConfigError::ValidationError(format!(
                "kdf.memory_kib must be between {} and {}",
                min_memory_kib, MAX_KDF_MEMORY_KIB
            )));
        }

        let payload = Path::new(&self.token.payload_file);
        if self.token.payload_file.is_empty() || payload.components().count() != 1 {
            return Err(ConfigError::ValidationError(
                "token.payload_file must be a bare file name".to_string(),
            ));
        }

        if self.token.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "token.poll_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.decryptor.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "decryptor.max_attempts must be non-zero".to_string(),
            ));
        }

        if self.medium.io_retries > 10 {
            return Err(ConfigError::ValidationError(
                "medium.io_retries must not exceed 10".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keys.default_bits, 4096);
        assert_eq!(config.decryptor.max_attempts, 5);
        assert_eq!(config.token.debounce_ms, 500);
        assert_eq!(config.token.marker, MarkerCriteria::Payload);
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_document() {
        let config = Config::from_toml_str(
            r#"
            [keys]
            default_bits = 3072

            [token]
            marker = { kind = "label", value = "SIGNKEY" }
            mount_roots = [{ path = "/srv/tokens" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.keys.default_bits, 3072);
        assert_eq!(config.keys.minimum_bits, 2048);
        assert_eq!(config.token.marker, MarkerCriteria::Label("SIGNKEY".to_string()));
        assert_eq!(config.token.mount_roots.len(), 1);
        assert_eq!(config.token.mount_roots[0].depth, 1);
        assert_eq!(config.token.payload_file, "private_encrypted.tsk");
    }

    #[test]
    fn test_rejects_weak_key_floor() {
        let result = Config::from_toml_str("[keys]\nminimum_bits = 1024\ndefault_bits = 1024\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_payload_path_with_directories() {
        let mut config = Config::default();
        config.token.payload_file = "../escape.tsk".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = Config::default();
        config.decryptor.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_huge_parallelism() {
        for parallelism in [65, 536_870_912, 1_000_000_000, u32::MAX] {
            let result =
                Config::from_toml_str(&format!("[kdf]\nparallelism = {}\n", parallelism));
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "parallelism {} accepted",
                parallelism
            );
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokensign.toml");
        std::fs::write(&path, "[decryptor]\nmax_attempts = 3\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.decryptor.max_attempts, 3);

        let missing = Config::from_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
