//! Fixtures shared by the integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use tempfile::TempDir;
use tokensign_crypto::{CreatedKey, KdfParams, KeySecurity, Passphrase, RsaKeyCreator};
use tokensign_token::{
    KeyDecryptor, MountPresence, PresenceCheck, RetryPolicy, SecurePdfSigner, TokenHandle,
    UsbKeyHandler,
};

pub const PASSPHRASE: &str = "correct horse battery staple";
pub const PAYLOAD_FILE: &str = "private_encrypted.tsk";
pub const MAX_ATTEMPTS: u32 = 5;

/// Minimal Argon2id cost so tests stay fast.
pub fn fast_security() -> KeySecurity {
    KeySecurity::new(KdfParams::new(1024, 1, 1))
}

fn create_key() -> CreatedKey {
    RsaKeyCreator::new(2048, fast_security())
        .create(2048, &Passphrase::from(PASSPHRASE))
        .expect("key creation")
}

/// Sealed key shared by every test in the binary.
pub fn shared_key() -> &'static CreatedKey {
    static KEY: OnceLock<CreatedKey> = OnceLock::new();
    KEY.get_or_init(create_key)
}

/// A second, unrelated key.
pub fn stranger_key() -> &'static CreatedKey {
    static KEY: OnceLock<CreatedKey> = OnceLock::new();
    KEY.get_or_init(create_key)
}

pub fn handler<P: PresenceCheck>(presence: P) -> UsbKeyHandler<P> {
    UsbKeyHandler::new(presence, PAYLOAD_FILE, RetryPolicy::none())
}

/// A temporary directory standing in for a mounted token.
pub struct TestToken {
    pub mount: TempDir,
    pub handle: TokenHandle,
}

impl TestToken {
    pub fn blank() -> Self {
        let mount = tempfile::tempdir().expect("tempdir");
        let handle = TokenHandle::new("usb-test", mount.path(), 1);
        Self { mount, handle }
    }

    /// Token carrying `key`'s sealed payload.
    pub fn with_key(key: &CreatedKey) -> Self {
        let token = Self::blank();
        handler(MountPresence)
            .deploy(&key.payload, &token.handle)
            .expect("deploy");
        token
    }

    pub fn payload_path(&self) -> std::path::PathBuf {
        self.mount.path().join(PAYLOAD_FILE)
    }

    /// The same token after being pulled and plugged back in.
    pub fn reinserted(&self) -> TokenHandle {
        TokenHandle::new(
            self.handle.device_id.clone(),
            self.mount.path(),
            self.handle.insertion + 1,
        )
    }
}

pub fn pdf_signer() -> SecurePdfSigner<MountPresence> {
    SecurePdfSigner::new(KeyDecryptor::new(
        handler(MountPresence),
        fast_security(),
        MAX_ATTEMPTS,
    ))
}

pub fn sample_pdf(body: &str) -> Vec<u8> {
    format!(
        "%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n% {}\ntrailer\n<< /Root 1 0 R >>\n%%EOF\n",
        body
    )
    .into_bytes()
}

/// Present for the first `n` checks, then gone for good.
pub struct VanishesAfter {
    remaining: AtomicUsize,
}

impl VanishesAfter {
    pub fn new(n: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(n),
        }
    }
}

impl PresenceCheck for VanishesAfter {
    fn is_present(&self, _handle: &TokenHandle) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
