//! Token handles and the shared presence registry.
//!
//! The watcher normally owns the writes; an embedding application with its
//! own OS hotplug notifications may drive [`TokenPresence`] directly.
//! Everyone else reads the current handle and re-checks it after every
//! suspension point instead of caching it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

/// A token as seen by one insertion.
///
/// `insertion` is unique per insertion event: a token that is pulled and
/// re-inserted gets a new handle, which invalidates the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenHandle {
    pub device_id: String,
    pub mount_path: PathBuf,
    pub present: bool,
    pub insertion: u64,
}

impl TokenHandle {
    pub fn new(device_id: impl Into<String>, mount_path: impl Into<PathBuf>, insertion: u64) -> Self {
        Self {
            device_id: device_id.into(),
            mount_path: mount_path.into(),
            present: true,
            insertion,
        }
    }

    /// Same physical insertion as `other`.
    pub fn same_insertion(&self, other: &TokenHandle) -> bool {
        self.device_id == other.device_id && self.insertion == other.insertion
    }

    pub fn payload_path(&self, file_name: &str) -> PathBuf {
        self.mount_path.join(file_name)
    }
}

/// Answers "is this handle still good?".
pub trait PresenceCheck: Send + Sync {
    fn is_present(&self, handle: &TokenHandle) -> bool;
}

/// Checks only that the mount point is still a directory.
///
/// Used when the operator points at a mount path directly and no watcher
/// is running.
#[derive(Debug, Default, Clone, Copy)]
pub struct MountPresence;

impl PresenceCheck for MountPresence {
    fn is_present(&self, handle: &TokenHandle) -> bool {
        handle.present && handle.mount_path.is_dir()
    }
}

/// The watcher's current token, shared with every consumer.
#[derive(Debug, Clone, Default)]
pub struct TokenPresence {
    current: Arc<RwLock<Option<TokenHandle>>>,
}

impl TokenPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<TokenHandle> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mark_inserted(&self, handle: TokenHandle) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Clear the current handle if it belongs to `device_id`.
    pub fn mark_removed(&self, device_id: &str) -> Option<TokenHandle> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|h| h.device_id == device_id) {
            guard.take().map(|mut handle| {
                handle.present = false;
                handle
            })
        } else {
            None
        }
    }
}

impl PresenceCheck for TokenPresence {
    fn is_present(&self, handle: &TokenHandle) -> bool {
        let current = self.current();
        current.is_some_and(|c| c.same_insertion(handle)) && mount_alive(&handle.mount_path)
    }
}

fn mount_alive(path: &Path) -> bool {
    path.is_dir()
}
