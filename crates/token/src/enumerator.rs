//! Removable volume discovery.
//!
//! Enumeration only produces candidates. Whether a volume is a key token is
//! decided by [`TokenCriteria`], and whether its payload is genuine is
//! decided much later by the integrity check.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokensign_core::config::{MarkerCriteria, MountRoot, TokenConfig};
use tracing::{debug, trace};

use crate::error::{Result, TokenError};

/// A mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedVolume {
    pub device_id: String,
    pub mount_path: PathBuf,
    pub label: String,
}

impl MountedVolume {
    pub fn new(mount_path: impl Into<PathBuf>) -> Self {
        let mount_path = mount_path.into();
        let label = mount_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| mount_path.display().to_string());
        Self {
            device_id: mount_path.display().to_string(),
            mount_path,
            label,
        }
    }
}

/// Lists the volumes currently mounted.
pub trait TokenEnumerator: Send + Sync {
    fn snapshot(&self) -> Result<Vec<MountedVolume>>;
}

/// Walks configured mount roots to a fixed depth.
#[derive(Debug, Clone)]
pub struct MountRootEnumerator {
    roots: Vec<MountRoot>,
}

impl MountRootEnumerator {
    pub fn new(roots: Vec<MountRoot>) -> Self {
        Self { roots }
    }

    pub fn from_config(config: &TokenConfig) -> Self {
        Self::new(config.mount_roots.clone())
    }

    fn collect(dir: &Path, depth: u8, out: &mut Vec<MountedVolume>) -> Result<()> {
        if depth == 0 {
            if dir.is_dir() {
                out.push(MountedVolume::new(dir));
            }
            return Ok(());
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(root = %dir.display(), "Mount root missing");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                debug!(root = %dir.display(), "Mount root not readable");
                return Ok(());
            }
            Err(e) => {
                return Err(TokenError::Enumeration(format!("{}: {}", dir.display(), e)));
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect(&path, depth - 1, out)?;
            }
        }
        Ok(())
    }
}

impl TokenEnumerator for MountRootEnumerator {
    fn snapshot(&self) -> Result<Vec<MountedVolume>> {
        let mut volumes = Vec::new();
        for root in &self.roots {
            Self::collect(&root.path, root.depth, &mut volumes)?;
        }
        volumes.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        volumes.dedup_by(|a, b| a.mount_path == b.mount_path);
        Ok(volumes)
    }
}

/// Decides whether a volume is a key token.
#[derive(Debug, Clone)]
pub struct TokenCriteria {
    pub marker: MarkerCriteria,
    pub payload_file: String,
}

impl TokenCriteria {
    pub fn from_config(config: &TokenConfig) -> Self {
        Self {
            marker: config.marker.clone(),
            payload_file: config.payload_file.clone(),
        }
    }

    /// Criteria used when provisioning: any volume qualifies.
    pub fn any(payload_file: impl Into<String>) -> Self {
        Self {
            marker: MarkerCriteria::Any,
            payload_file: payload_file.into(),
        }
    }

    pub fn matches(&self, volume: &MountedVolume) -> bool {
        match &self.marker {
            MarkerCriteria::Payload => volume.mount_path.join(&self.payload_file).is_file(),
            MarkerCriteria::Any => true,
            MarkerCriteria::File(name) => volume.mount_path.join(name).exists(),
            MarkerCriteria::Label(label) => &volume.label == label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdir(path: &Path) {
        fs::create_dir_all(path).unwrap();
    }

    #[test]
    fn test_walks_to_configured_depth() {
        let root = tempfile::tempdir().unwrap();
        mkdir(&root.path().join("alice/KEYSTICK"));
        mkdir(&root.path().join("bob/BACKUP"));
        fs::write(root.path().join("alice/not-a-dir"), b"").unwrap();

        let enumerator = MountRootEnumerator::new(vec![MountRoot {
            path: root.path().to_path_buf(),
            depth: 2,
        }]);
        let labels: Vec<_> = enumerator
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|v| v.label)
            .collect();
        assert_eq!(labels, vec!["KEYSTICK".to_string(), "BACKUP".to_string()]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let enumerator = MountRootEnumerator::new(vec![MountRoot {
            path: PathBuf::from("/definitely/not/mounted"),
            depth: 1,
        }]);
        assert!(enumerator.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_depth_zero_is_the_root_itself() {
        let root = tempfile::tempdir().unwrap();
        let enumerator = MountRootEnumerator::new(vec![MountRoot {
            path: root.path().to_path_buf(),
            depth: 0,
        }]);
        let volumes = enumerator.snapshot().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].mount_path, root.path());
    }

    #[test]
    fn test_criteria() {
        let root = tempfile::tempdir().unwrap();
        let stick = root.path().join("KEYSTICK");
        mkdir(&stick);
        let volume = MountedVolume::new(&stick);

        let payload = TokenCriteria {
            marker: MarkerCriteria::Payload,
            payload_file: "key.tsk".into(),
        };
        assert!(!payload.matches(&volume));
        fs::write(stick.join("key.tsk"), b"x").unwrap();
        assert!(payload.matches(&volume));

        let label = TokenCriteria {
            marker: MarkerCriteria::Label("KEYSTICK".into()),
            payload_file: "key.tsk".into(),
        };
        assert!(label.matches(&volume));

        let marker = TokenCriteria {
            marker: MarkerCriteria::File(".tokensign".into()),
            payload_file: "key.tsk".into(),
        };
        assert!(!marker.matches(&volume));
        assert!(TokenCriteria::any("key.tsk").matches(&volume));
    }
}
