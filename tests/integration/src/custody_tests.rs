//! Provision, sign and verify end to end

use tokensign_crypto::{
    FileDocument, MemoryDocument, Passphrase, PdfSignatureChecker, PublicKeyMaterial,
    RsaKeyCreator, VerificationReason,
};
use tokensign_token::{
    FixedPassphrase, MountPresence, PromptPurpose, Provisioner, PublicKeyDestination,
    QueuedPassphrases, TokenError,
};

use crate::test_utils::*;

#[test]
fn test_provision_sign_verify_roundtrip() {
    tokensign_core::logging::try_init_for_tests();
    let token = TestToken::blank();
    let desk = tempfile::tempdir().unwrap();

    // Step 1: provision a blank token
    let provisioner = Provisioner::new(
        RsaKeyCreator::new(2048, fast_security()),
        handler(MountPresence),
        2048,
    );
    let report = provisioner
        .provision(
            &token.handle,
            &Passphrase::from(PASSPHRASE),
            &PublicKeyDestination::Directory(desk.path().to_path_buf()),
        )
        .unwrap();
    assert_eq!(report.payload_path, token.payload_path());

    // Step 2: sign a document with the key on the token
    let input = desk.path().join("invoice.pdf");
    let output = desk.path().join("invoice-signed.pdf");
    std::fs::write(&input, sample_pdf("invoice 42")).unwrap();

    let mut signer = pdf_signer();
    let signed = signer
        .sign_file(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &input,
            &output,
        )
        .unwrap();
    assert_eq!(signed.record.signer_fingerprint(), report.fingerprint);
    assert_eq!(signer.signer().metrics().documents_signed_total, 1);

    // Step 3: verify with only the exported public key
    let pem = std::fs::read_to_string(&report.public_key_path).unwrap();
    let trusted = PublicKeyMaterial::from_pem(&pem).unwrap();
    let result = PdfSignatureChecker::new()
        .verify_source(&FileDocument::new(&output), &trusted)
        .unwrap();
    assert!(result.valid);
    assert_eq!(result.reason, VerificationReason::Ok);

    // The unsigned input is untouched.
    assert_eq!(std::fs::read(&input).unwrap(), sample_pdf("invoice 42"));
}

#[test]
fn test_every_signature_needs_a_fresh_unlock() {
    let key = shared_key();
    let token = TestToken::with_key(key);
    let mut signer = pdf_signer();
    let mut provider = QueuedPassphrases::new([PASSPHRASE, PASSPHRASE]);

    for body in ["first", "second"] {
        signer
            .sign_document(&token.handle, &mut provider, &MemoryDocument(sample_pdf(body)))
            .unwrap();
    }
    assert_eq!(
        provider.asked(),
        &[
            PromptPurpose::Unlock { remaining_attempts: MAX_ATTEMPTS },
            PromptPurpose::Unlock { remaining_attempts: MAX_ATTEMPTS },
        ]
    );
}

#[test]
fn test_wrong_passphrase_then_right_one() {
    let key = shared_key();
    let token = TestToken::with_key(key);
    let mut provider = QueuedPassphrases::new(["guess", PASSPHRASE]);

    let signed = pdf_signer()
        .sign_document(&token.handle, &mut provider, &MemoryDocument(sample_pdf("memo")))
        .unwrap();

    assert_eq!(provider.asked().len(), 2);
    let result = PdfSignatureChecker::new()
        .verify_embedded(&signed.bytes, &key.public_key)
        .unwrap();
    assert!(result.valid);
}

#[test]
fn test_verification_against_other_key_is_key_unknown() {
    let token = TestToken::with_key(shared_key());
    let signed = pdf_signer()
        .sign_document(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &MemoryDocument(sample_pdf("contract")),
        )
        .unwrap();

    let result = PdfSignatureChecker::new()
        .verify_embedded(&signed.bytes, &stranger_key().public_key)
        .unwrap();
    assert!(!result.valid);
    assert_eq!(result.reason, VerificationReason::KeyUnknown);
}

#[test]
fn test_signed_document_is_not_signed_again() {
    let token = TestToken::with_key(shared_key());
    let signed = pdf_signer()
        .sign_document(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &MemoryDocument(sample_pdf("once")),
        )
        .unwrap();

    let mut provider = QueuedPassphrases::new([PASSPHRASE]);
    let err = pdf_signer()
        .sign_document(&token.handle, &mut provider, &MemoryDocument(signed.bytes))
        .unwrap_err();
    assert!(matches!(err, TokenError::Container(_)));
    assert!(provider.asked().is_empty());
}

#[test]
fn test_unprovisioned_token_has_nothing_to_sign_with() {
    let token = TestToken::blank();
    let err = pdf_signer()
        .sign_document(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &MemoryDocument(sample_pdf("orphan")),
        )
        .unwrap_err();
    assert!(matches!(err, TokenError::NotFound(_)));
}

#[test]
fn test_signature_record_serializes_as_json() {
    let token = TestToken::with_key(shared_key());
    let signed = pdf_signer()
        .sign_document(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &MemoryDocument(sample_pdf("audit")),
        )
        .unwrap();

    let json = serde_json::to_value(&signed.record).unwrap();
    assert_eq!(json["hash_algorithm"], "SHA-256");
    assert_eq!(
        json["signer_fingerprint"],
        shared_key().public_key.fingerprint().to_hex()
    );
}
