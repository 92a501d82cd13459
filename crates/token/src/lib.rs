//! USB token custody for tokensign.
//!
//! This crate is the part that touches removable media:
//!
//! - **Detection**: polling mounted volumes for key tokens ([`watcher`],
//!   [`enumerator`]) and publishing the current insertion ([`presence`])
//! - **Storage**: atomic deploy and validated load of the sealed key
//!   ([`handler`], [`atomic`])
//! - **Recovery**: passphrase-gated unsealing with a per-insertion attempt
//!   budget ([`decryptor`], [`prompt`])
//! - **Workflows**: provisioning new tokens and signing documents with the
//!   key on a token ([`workflow`])
//!
//! Every operation that touches the medium re-checks presence before and
//! after I/O. Handles from an earlier insertion are never honoured.

pub mod atomic;
pub mod decryptor;
pub mod enumerator;
pub mod error;
pub mod handler;
pub mod presence;
pub mod prompt;
pub mod watcher;
pub mod workflow;

pub use decryptor::{AttemptLimiter, KeyDecryptor};
pub use enumerator::{MountRootEnumerator, MountedVolume, TokenCriteria, TokenEnumerator};
pub use error::{Result, TokenError};
pub use handler::{RetryPolicy, UsbKeyHandler};
pub use presence::{MountPresence, PresenceCheck, TokenHandle, TokenPresence};
pub use prompt::{FixedPassphrase, PassphraseProvider, PromptPurpose, QueuedPassphrases};
pub use watcher::{TokenEvent, TokenWatcher, WatchState, WatcherHandle, WatcherOptions};
pub use workflow::{
    ProvisionReport, Provisioner, PublicKeyDestination, SecurePdfSigner, SignedDocument,
};
