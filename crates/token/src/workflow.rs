//! End-to-end provisioning and signing.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokensign_core::config::Config;
use tokensign_crypto::container;
use tokensign_crypto::{
    ContainerError, DigitalSigner, DocumentSource, FileDocument, Fingerprint, KeySecurity,
    KdfParams, Passphrase, RsaKeyCreator, SignatureRecord, SigningError,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::atomic::write_atomic;
use crate::decryptor::KeyDecryptor;
use crate::error::{Result, TokenError};
use crate::handler::UsbKeyHandler;
use crate::presence::{PresenceCheck, TokenHandle};
use crate::prompt::{PassphraseProvider, PromptPurpose};
use crate::watcher::TokenEvent;

/// Where the public key PEM goes.
#[derive(Debug, Clone)]
pub enum PublicKeyDestination {
    File(PathBuf),
    /// `<dir>/<fingerprint>.pem`, one file per provisioned token.
    Directory(PathBuf),
}

impl PublicKeyDestination {
    pub fn resolve(&self, fingerprint: &Fingerprint) -> PathBuf {
        match self {
            PublicKeyDestination::File(path) => path.clone(),
            PublicKeyDestination::Directory(dir) => dir.join(format!("{}.pem", fingerprint)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub device_id: String,
    pub fingerprint: Fingerprint,
    pub key_bits: usize,
    pub public_key_path: PathBuf,
    pub payload_path: PathBuf,
}

/// Creates a key and puts its sealed private half on a token.
pub struct Provisioner<P> {
    creator: RsaKeyCreator,
    handler: UsbKeyHandler<P>,
    key_bits: usize,
}

impl<P: PresenceCheck> Provisioner<P> {
    pub fn new(creator: RsaKeyCreator, handler: UsbKeyHandler<P>, key_bits: usize) -> Self {
        Self {
            creator,
            handler,
            key_bits,
        }
    }

    pub fn from_config(config: &Config, presence: P) -> Self {
        let security = KeySecurity::new(KdfParams::from(&config.kdf));
        Self::new(
            RsaKeyCreator::from_config(&config.keys, security),
            UsbKeyHandler::from_config(presence, &config.token, &config.medium),
            config.keys.default_bits,
        )
    }

    /// Generate, export the public key, then deploy.
    ///
    /// The public key is written first. If it cannot be saved nothing is
    /// deployed, since a token whose public key is lost cannot be verified
    /// against.
    pub fn provision(
        &self,
        token: &TokenHandle,
        passphrase: &Passphrase,
        public_key: &PublicKeyDestination,
    ) -> Result<ProvisionReport> {
        if !self.handler.presence().is_present(token) {
            return Err(TokenError::TokenAbsent);
        }

        let created = self.creator.create(self.key_bits, passphrase)?;
        let fingerprint = created.public_key.fingerprint();

        let public_key_path = public_key.resolve(&fingerprint);
        let pem = created.public_key.to_pem()?;
        write_atomic(&public_key_path, pem.as_bytes()).map_err(|source| TokenError::File {
            path: public_key_path.clone(),
            source,
        })?;
        info!(path = %public_key_path.display(), %fingerprint, "Public key saved");

        let payload_path = self.handler.deploy(&created.payload, token)?;

        Ok(ProvisionReport {
            device_id: token.device_id.clone(),
            fingerprint,
            key_bits: self.key_bits,
            public_key_path,
            payload_path,
        })
    }

    pub fn provision_with_prompt(
        &self,
        token: &TokenHandle,
        provider: &mut dyn PassphraseProvider,
        public_key: &PublicKeyDestination,
    ) -> Result<ProvisionReport> {
        let passphrase = provider
            .prompt_passphrase(PromptPurpose::NewKey)
            .ok_or(TokenError::Cancelled)?;
        self.provision(token, &passphrase, public_key)
    }

    /// Provision every token inserted while `events` is open.
    ///
    /// Stops after `limit` successful provisions, when the operator cancels,
    /// or when the watcher shuts down. A failed provision is reported and
    /// the loop moves on to the next insertion.
    pub async fn provision_on_insert(
        &self,
        events: &mut broadcast::Receiver<TokenEvent>,
        provider: &mut dyn PassphraseProvider,
        public_key: &PublicKeyDestination,
        limit: Option<usize>,
    ) -> Result<Vec<ProvisionReport>> {
        let mut reports = Vec::new();
        while limit.map_or(true, |max| reports.len() < max) {
            let token = match events.recv().await {
                Ok(TokenEvent::Inserted(token)) => token,
                Ok(TokenEvent::Removed(_)) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed token events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match self.provision_with_prompt(&token, provider, public_key) {
                Ok(report) => reports.push(report),
                Err(TokenError::Cancelled) => break,
                Err(e) => warn!(device = %token.device_id, error = %e, "Provisioning failed"),
            }
        }
        Ok(reports)
    }
}

/// Result of signing a document.
#[derive(Debug, Clone)]
pub struct SignedDocument {
    pub bytes: Vec<u8>,
    pub record: SignatureRecord,
}

/// Token-backed document signer.
///
/// Each call recovers the key, signs once, and releases the key before
/// returning. No key outlives the call.
pub struct SecurePdfSigner<P> {
    decryptor: KeyDecryptor<P>,
    signer: DigitalSigner,
}

impl<P: PresenceCheck> SecurePdfSigner<P> {
    pub fn new(decryptor: KeyDecryptor<P>) -> Self {
        Self {
            decryptor,
            signer: DigitalSigner::new(),
        }
    }

    pub fn from_config(config: &Config, presence: P) -> Self {
        let handler = UsbKeyHandler::from_config(presence, &config.token, &config.medium);
        let security = KeySecurity::new(KdfParams::from(&config.kdf));
        Self::new(KeyDecryptor::from_config(handler, security, &config.decryptor))
    }

    pub fn decryptor(&self) -> &KeyDecryptor<P> {
        &self.decryptor
    }

    pub fn signer(&self) -> &DigitalSigner {
        &self.signer
    }

    /// Sign `document` with the key on `token`.
    ///
    /// Unsignable input is rejected before the operator is asked for a
    /// passphrase, so it never costs an attempt.
    pub fn sign_document(
        &mut self,
        token: &TokenHandle,
        provider: &mut dyn PassphraseProvider,
        document: &dyn DocumentSource,
    ) -> Result<SignedDocument> {
        let bytes = document
            .read_document_bytes()
            .map_err(SigningError::from)?;
        if container::is_signed(&bytes) {
            return Err(ContainerError::AlreadySigned.into());
        }
        let content = &bytes[document.canonical_range(&bytes)];
        if content.is_empty() {
            return Err(SigningError::EmptyDocument.into());
        }

        let (public, mut private) = self
            .decryptor
            .recover_with_prompt(token, provider)?
            .into_parts();
        let record = self.signer.sign(content, &mut private)?;

        let signed = container::embed(content, &record)?;
        info!(
            device = %token.device_id,
            fingerprint = %public.fingerprint(),
            bytes = content.len(),
            "Document signed with token key"
        );
        Ok(SignedDocument {
            bytes: signed,
            record,
        })
    }

    /// Sign `input` and write the signed copy to `output` atomically.
    pub fn sign_file(
        &mut self,
        token: &TokenHandle,
        provider: &mut dyn PassphraseProvider,
        input: &Path,
        output: &Path,
    ) -> Result<SignedDocument> {
        let signed = self.sign_document(token, provider, &FileDocument::new(input))?;
        write_atomic(output, &signed.bytes).map_err(|source| TokenError::File {
            path: output.to_path_buf(),
            source,
        })?;
        info!(output = %output.display(), "Signed document written");
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RetryPolicy;
    use crate::presence::MountPresence;
    use crate::prompt::{FixedPassphrase, QueuedPassphrases};
    use tokensign_crypto::{MemoryDocument, PdfSignatureChecker, PublicKeyMaterial};

    fn security() -> KeySecurity {
        KeySecurity::new(KdfParams::new(1024, 1, 1))
    }

    fn provisioner() -> Provisioner<MountPresence> {
        Provisioner::new(
            RsaKeyCreator::new(2048, security()),
            UsbKeyHandler::new(MountPresence, "key.tsk", RetryPolicy::none()),
            2048,
        )
    }

    fn signer() -> SecurePdfSigner<MountPresence> {
        SecurePdfSigner::new(KeyDecryptor::new(
            UsbKeyHandler::new(MountPresence, "key.tsk", RetryPolicy::none()),
            security(),
            5,
        ))
    }

    #[test]
    fn test_provision_sign_verify() {
        let stick = tempfile::tempdir().unwrap();
        let desk = tempfile::tempdir().unwrap();
        let token = TokenHandle::new("usb0", stick.path(), 1);
        let pem_path = desk.path().join("signer.pem");

        let report = provisioner()
            .provision(
                &token,
                &Passphrase::from("pin"),
                &PublicKeyDestination::File(pem_path.clone()),
            )
            .unwrap();
        assert!(report.payload_path.starts_with(stick.path()));

        let input = desk.path().join("contract.pdf");
        let output = desk.path().join("contract.signed.pdf");
        std::fs::write(&input, b"%PDF-1.7\ncontract\n%%EOF\n").unwrap();

        let signed = signer()
            .sign_file(
                &token,
                &mut FixedPassphrase(Passphrase::from("pin")),
                &input,
                &output,
            )
            .unwrap();
        assert_eq!(signed.record.signer_fingerprint(), report.fingerprint);

        let public =
            PublicKeyMaterial::from_pem(&std::fs::read_to_string(&pem_path).unwrap()).unwrap();
        let result = PdfSignatureChecker::new()
            .verify_source(&FileDocument::new(&output), &public)
            .unwrap();
        assert!(result.valid);
    }

    #[test]
    fn test_public_key_failure_aborts_deploy() {
        let stick = tempfile::tempdir().unwrap();
        let token = TokenHandle::new("usb0", stick.path(), 1);
        let err = provisioner()
            .provision(
                &token,
                &Passphrase::from("pin"),
                &PublicKeyDestination::File(PathBuf::from("/nonexistent/dir/signer.pem")),
            )
            .unwrap_err();
        assert!(matches!(err, TokenError::File { .. }));
        assert!(!stick.path().join("key.tsk").exists());
    }

    #[test]
    fn test_cancelled_prompt_writes_nothing() {
        let stick = tempfile::tempdir().unwrap();
        let desk = tempfile::tempdir().unwrap();
        let token = TokenHandle::new("usb0", stick.path(), 1);
        let mut provider = QueuedPassphrases::new(Vec::<&str>::new());

        let err = provisioner()
            .provision_with_prompt(
                &token,
                &mut provider,
                &PublicKeyDestination::Directory(desk.path().to_path_buf()),
            )
            .unwrap_err();
        assert!(matches!(err, TokenError::Cancelled));
        assert_eq!(std::fs::read_dir(stick.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(desk.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unsignable_documents_cost_no_attempts() {
        let stick = tempfile::tempdir().unwrap();
        let token = TokenHandle::new("usb0", stick.path(), 1);
        let mut provider = QueuedPassphrases::new(["never asked"]);
        let mut signer = signer();

        let err = signer
            .sign_document(&token, &mut provider, &MemoryDocument(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, TokenError::Signing(SigningError::EmptyDocument)));
        assert!(provider.asked().is_empty());
    }

    #[test]
    fn test_directory_destination_uses_fingerprint() {
        let fp = Fingerprint::from_bytes([0xAA; 16]);
        let dest = PublicKeyDestination::Directory(PathBuf::from("/keys"));
        assert_eq!(
            dest.resolve(&fp),
            PathBuf::from(format!("/keys/{}.pem", "aa".repeat(16)))
        );
    }
}
