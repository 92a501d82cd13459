//! Tampering, token removal and brute-force resistance

use std::sync::OnceLock;

use proptest::prelude::*;
use tokensign_crypto::{MemoryDocument, Passphrase, PdfSignatureChecker, VerificationReason};
use tokensign_token::{FixedPassphrase, KeyDecryptor, MountPresence, QueuedPassphrases, TokenError};

use crate::test_utils::*;

/// A signed sample document and the length of its signed content.
fn signed_sample() -> &'static (Vec<u8>, usize) {
    static SIGNED: OnceLock<(Vec<u8>, usize)> = OnceLock::new();
    SIGNED.get_or_init(|| {
        let token = TestToken::with_key(shared_key());
        let content = sample_pdf("purchase order 7");
        let signed = pdf_signer()
            .sign_document(
                &token.handle,
                &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
                &MemoryDocument(content.clone()),
            )
            .unwrap();
        (signed.bytes, content.len())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_content_edit_is_tampering(index in any::<prop::sample::Index>(), flip in 1u8..=255) {
        let (signed, content_len) = signed_sample();
        let mut bytes = signed.clone();
        bytes[index.index(*content_len)] ^= flip;

        let result = PdfSignatureChecker::new()
            .verify_embedded(&bytes, &shared_key().public_key)
            .unwrap();
        prop_assert!(!result.valid);
        prop_assert_eq!(result.reason, VerificationReason::DocumentTampered);
    }
}

#[test]
fn test_untouched_sample_verifies() {
    let (signed, _) = signed_sample();
    let result = PdfSignatureChecker::new()
        .verify_embedded(signed, &shared_key().public_key)
        .unwrap();
    assert!(result.valid);
}

#[test]
fn test_appended_bytes_are_tampering() {
    let (signed, _) = signed_sample();
    let mut bytes = signed.clone();
    bytes.extend_from_slice(b"%% incremental update\n");

    let result = PdfSignatureChecker::new()
        .verify_embedded(&bytes, &shared_key().public_key)
        .unwrap();
    assert!(!result.valid);
    assert_eq!(result.reason, VerificationReason::DocumentTampered);
}

#[test]
fn test_extended_signed_document_is_not_signed_again() {
    let (signed, _) = signed_sample();
    let mut bytes = signed.clone();
    bytes.extend_from_slice(b"%% incremental update\n");
    let token = TestToken::with_key(shared_key());

    let mut provider = QueuedPassphrases::new([PASSPHRASE]);
    let err = pdf_signer()
        .sign_document(&token.handle, &mut provider, &MemoryDocument(bytes))
        .unwrap_err();
    assert!(matches!(err, TokenError::Container(_)));
    assert!(provider.asked().is_empty());
}

#[test]
fn test_removal_mid_deploy_leaves_no_usable_payload() {
    let token = TestToken::blank();
    let err = handler(VanishesAfter::new(1))
        .deploy(&shared_key().payload, &token.handle)
        .unwrap_err();
    assert!(matches!(err, TokenError::TokenRemovedMidWrite));

    // Nothing on the medium, not even a temporary file.
    assert_eq!(std::fs::read_dir(token.mount.path()).unwrap().count(), 0);
    assert!(matches!(
        handler(MountPresence).load(&token.handle),
        Err(TokenError::NotFound(_))
    ));
}

#[test]
fn test_sixth_attempt_locked_until_reinserted() {
    let token = TestToken::with_key(shared_key());
    let decryptor = KeyDecryptor::new(handler(MountPresence), fast_security(), MAX_ATTEMPTS);

    for _ in 0..MAX_ATTEMPTS {
        assert!(matches!(
            decryptor.recover(&token.handle, &Passphrase::from("brute force")),
            Err(TokenError::WrongPassphrase)
        ));
    }
    assert!(matches!(
        decryptor.recover(&token.handle, &Passphrase::from(PASSPHRASE)),
        Err(TokenError::LockedOut { attempts: 5 })
    ));

    let reinserted = token.reinserted();
    let pair = decryptor
        .recover(&reinserted, &Passphrase::from(PASSPHRASE))
        .unwrap();
    assert_eq!(pair.public, shared_key().public_key);
}

#[test]
fn test_flipped_payload_bit_is_corrupt_not_wrong_passphrase() {
    let token = TestToken::with_key(shared_key());
    let path = token.payload_path();
    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x80;
    std::fs::write(&path, bytes).unwrap();

    let decryptor = KeyDecryptor::new(handler(MountPresence), fast_security(), MAX_ATTEMPTS);
    assert!(matches!(
        decryptor.recover(&token.handle, &Passphrase::from(PASSPHRASE)),
        Err(TokenError::Corrupt(_))
    ));
    assert_eq!(decryptor.remaining_attempts(&token.handle), MAX_ATTEMPTS);
}

#[test]
fn test_swapped_payload_signs_as_someone_else() {
    // An attacker replaces the payload with their own key sealed under a
    // passphrase they know. Signing works, verification does not.
    let token = TestToken::with_key(stranger_key());
    let signed = pdf_signer()
        .sign_document(
            &token.handle,
            &mut FixedPassphrase(Passphrase::from(PASSPHRASE)),
            &MemoryDocument(sample_pdf("forged")),
        )
        .unwrap();

    let result = PdfSignatureChecker::new()
        .verify_embedded(&signed.bytes, &shared_key().public_key)
        .unwrap();
    assert_eq!(result.reason, VerificationReason::KeyUnknown);
}
