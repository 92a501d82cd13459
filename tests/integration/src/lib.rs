//! Integration tests across the tokensign crates
//!
//! This test suite validates:
//! - Provisioning a token, signing with it, and verifying the result
//! - Tamper detection on signed documents and on-token payloads
//! - Token removal in the middle of a deploy
//! - Passphrase lockout and recovery on re-insertion

pub mod test_utils;

#[cfg(test)]
mod custody_tests;

#[cfg(test)]
mod tamper_tests;
