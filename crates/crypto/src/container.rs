//! Versioned signature container appended to a signed document.
//!
//! # Layout (version 1)
//!
//! ```text
//! <original document bytes>
//! \n%TOKENSIGN-SIG-V1\n
//! <SignatureRecord as single-line JSON>
//! \n%TOKENSIGN-END <content length, 10 decimal digits>\n
//! ```
//!
//! The trailer has a fixed length, so a verifier finds the record by
//! reading the last 27 bytes and a stray marker inside the document body
//! cannot confuse it. PDF readers ignore data after the final `%%EOF`, so a
//! signed PDF still opens normally.
//!
//! Only when the input does not end with a trailer is it scanned backwards
//! for a complete container followed by extra bytes. Such a document was
//! signed and then extended, and is reported as [`ContainerError::TrailingData`].

use std::ops::Range;

use thiserror::Error;
use tokensign_core::error::{Classify, ErrorClass};

use crate::signing::SignatureRecord;

pub const BEGIN_MARKER: &[u8] = b"\n%TOKENSIGN-SIG-V1\n";
const END_PREFIX: &[u8] = b"\n%TOKENSIGN-END ";
const LENGTH_DIGITS: usize = 10;
pub const TRAILER_LEN: usize = END_PREFIX.len() + LENGTH_DIGITS + 1;

/// Container errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("Document carries no signature container")]
    NotSigned,

    #[error("Malformed signature container: {0}")]
    Malformed(String),

    #[error("Document is already signed")]
    AlreadySigned,

    #[error("Document too large for container ({0} bytes)")]
    TooLarge(usize),

    #[error("{0} bytes follow the signature container")]
    TrailingData(usize),
}

impl Classify for ContainerError {
    fn class(&self) -> ErrorClass {
        match self {
            ContainerError::NotSigned
            | ContainerError::AlreadySigned
            | ContainerError::TooLarge(_) => ErrorClass::InputInvalid,
            ContainerError::Malformed(_) | ContainerError::TrailingData(_) => {
                ErrorClass::IntegrityFailure
            }
        }
    }
}

/// A parsed container.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted<'a> {
    pub content: &'a [u8],
    pub record: SignatureRecord,
}

/// Append `record` to `content`.
pub fn embed(content: &[u8], record: &SignatureRecord) -> Result<Vec<u8>, ContainerError> {
    if is_signed(content) {
        return Err(ContainerError::AlreadySigned);
    }
    if content.len() >= 10usize.pow(LENGTH_DIGITS as u32) {
        return Err(ContainerError::TooLarge(content.len()));
    }

    let json =
        serde_json::to_vec(record).map_err(|e| ContainerError::Malformed(e.to_string()))?;

    let mut out =
        Vec::with_capacity(content.len() + BEGIN_MARKER.len() + json.len() + TRAILER_LEN);
    out.extend_from_slice(content);
    out.extend_from_slice(BEGIN_MARKER);
    out.extend_from_slice(&json);
    out.extend_from_slice(END_PREFIX);
    out.extend_from_slice(format!("{:0width$}", content.len(), width = LENGTH_DIGITS).as_bytes());
    out.push(b'\n');
    Ok(out)
}

/// Locate and parse the container at the end of `signed`.
pub fn extract(signed: &[u8]) -> Result<Extracted<'_>, ContainerError> {
    if !has_trailer(signed) {
        return Err(match displaced_container_end(signed) {
            Some(end) => ContainerError::TrailingData(signed.len() - end),
            None => ContainerError::NotSigned,
        });
    }
    parse_container(signed)
}

/// Parse a container whose trailer ends `signed`.
fn parse_container(signed: &[u8]) -> Result<Extracted<'_>, ContainerError> {
    let content_len = trailer_content_len(signed)?.ok_or(ContainerError::NotSigned)?;

    let trailer_start = signed.len() - TRAILER_LEN;
    let record_start = content_len
        .checked_add(BEGIN_MARKER.len())
        .filter(|start| *start <= trailer_start)
        .ok_or_else(|| ContainerError::Malformed("content length out of range".to_string()))?;

    if &signed[content_len..record_start] != BEGIN_MARKER {
        return Err(ContainerError::Malformed("begin marker not found".to_string()));
    }

    let record: SignatureRecord = serde_json::from_slice(&signed[record_start..trailer_start])
        .map_err(|e| ContainerError::Malformed(e.to_string()))?;

    Ok(Extracted {
        content: &signed[..content_len],
        record,
    })
}

/// The range of `bytes` covered by a signature.
///
/// For a document with a well-formed trailer this is the original content;
/// otherwise it is the whole input.
pub fn content_range(bytes: &[u8]) -> Range<usize> {
    match trailer_content_len(bytes) {
        Ok(Some(len)) if len + BEGIN_MARKER.len() + TRAILER_LEN <= bytes.len() => 0..len,
        _ => 0..bytes.len(),
    }
}

/// True when `bytes` end with a container trailer or carry a complete
/// container followed by extra bytes.
pub fn is_signed(bytes: &[u8]) -> bool {
    has_trailer(bytes) || displaced_container_end(bytes).is_some()
}

fn has_trailer(bytes: &[u8]) -> bool {
    bytes.len() >= TRAILER_LEN && bytes[bytes.len() - TRAILER_LEN..].starts_with(END_PREFIX)
}

/// End offset of the last complete container that is not at the end of
/// `bytes`.
fn displaced_container_end(bytes: &[u8]) -> Option<usize> {
    let mut search = bytes.len();
    while let Some(at) = bytes[..search]
        .windows(END_PREFIX.len())
        .rposition(|window| window == END_PREFIX)
    {
        let end = at + TRAILER_LEN;
        if end < bytes.len() && parse_container(&bytes[..end]).is_ok() {
            return Some(end);
        }
        search = at;
    }
    None
}

/// `Ok(None)` when there is no trailer at all.
fn trailer_content_len(bytes: &[u8]) -> Result<Option<usize>, ContainerError> {
    if !has_trailer(bytes) {
        return Ok(None);
    }
    let trailer = &bytes[bytes.len() - TRAILER_LEN..];
    let digits = &trailer[END_PREFIX.len()..END_PREFIX.len() + LENGTH_DIGITS];
    if trailer[TRAILER_LEN - 1] != b'\n' || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ContainerError::Malformed("bad trailer".to_string()));
    }
    let text = std::str::from_utf8(digits).map_err(|e| ContainerError::Malformed(e.to_string()))?;
    let len = text
        .parse::<usize>()
        .map_err(|e| ContainerError::Malformed(e.to_string()))?;
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Fingerprint;

    fn record() -> SignatureRecord {
        SignatureRecord::new(
            [1u8; 32],
            vec![2u8; 256],
            Fingerprint::from_bytes([3u8; 16]),
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_embed_then_extract() {
        let content = b"%PDF-1.4\nhello\n%%EOF\n";
        let signed = embed(content, &record()).unwrap();

        let extracted = extract(&signed).unwrap();
        assert_eq!(extracted.content, content);
        assert_eq!(extracted.record, record());
        assert_eq!(content_range(&signed), 0..content.len());
    }

    #[test]
    fn test_unsigned_document() {
        assert_eq!(extract(b"just a document"), Err(ContainerError::NotSigned));
        assert_eq!(content_range(b"abc"), 0..3);
    }

    #[test]
    fn test_empty_content_is_allowed_by_container() {
        let signed = embed(b"", &record()).unwrap();
        assert_eq!(extract(&signed).unwrap().content, b"");
    }

    #[test]
    fn test_double_sign_rejected() {
        let signed = embed(b"doc", &record()).unwrap();
        assert!(is_signed(&signed));
        assert_eq!(embed(&signed, &record()), Err(ContainerError::AlreadySigned));
    }

    #[test]
    fn test_length_pointing_past_record_is_malformed() {
        let mut signed = embed(b"doc", &record()).unwrap();
        let digits_at = signed.len() - 1 - LENGTH_DIGITS;
        signed[digits_at..digits_at + LENGTH_DIGITS].copy_from_slice(b"9999999999");
        assert!(matches!(extract(&signed), Err(ContainerError::Malformed(_))));
        assert_eq!(content_range(&signed), 0..signed.len());
    }

    #[test]
    fn test_damaged_record_json_is_malformed() {
        let mut signed = embed(b"doc", &record()).unwrap();
        let at = 3 + BEGIN_MARKER.len();
        signed[at] = b'}';
        let err = extract(&signed).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed(_)));
        assert_eq!(err.class(), ErrorClass::IntegrityFailure);
    }

    #[test]
    fn test_bytes_after_container_are_trailing_data() {
        let mut signed = embed(b"%PDF-1.7 body %%EOF\n", &record()).unwrap();
        signed.extend_from_slice(b"%% incremental update\n");

        let err = extract(&signed).unwrap_err();
        assert_eq!(err, ContainerError::TrailingData(22));
        assert_eq!(err.class(), ErrorClass::IntegrityFailure);
        assert!(is_signed(&signed));
        assert_eq!(embed(&signed, &record()), Err(ContainerError::AlreadySigned));
    }

    #[test]
    fn test_stray_end_prefix_is_not_a_container() {
        let mut content = b"body".to_vec();
        content.extend_from_slice(END_PREFIX);
        content.extend_from_slice(b"0000000000\nmore body");
        assert!(!is_signed(&content));
        assert_eq!(extract(&content), Err(ContainerError::NotSigned));
    }

    #[test]
    fn test_marker_inside_body_does_not_confuse_parser() {
        let mut content = b"prefix".to_vec();
        content.extend_from_slice(BEGIN_MARKER);
        content.extend_from_slice(b"not json at all");
        let signed = embed(&content, &record()).unwrap();
        assert_eq!(extract(&signed).unwrap().content, content.as_slice());
    }
}
