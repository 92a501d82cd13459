//! Secure random source abstraction.
//!
//! Every salt, nonce and key generation seed is drawn through
//! [`RandomSource`], so an unavailable entropy source surfaces as a typed
//! error instead of a panic deep inside a primitive.

use rand::rngs::StdRng;
use rand::SeedableRng;
use zeroize::Zeroizing;

/// Entropy source failure.
#[derive(Debug, thiserror::Error)]
#[error("Entropy source unavailable: {0}")]
pub struct EntropyError(pub String);

/// A cryptographically secure random byte source.
pub trait RandomSource {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), EntropyError>;
}

/// Operating system entropy via `getrandom`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), EntropyError> {
        getrandom::getrandom(dest).map_err(|e| EntropyError(e.to_string()))
    }
}

/// Draw `N` random bytes from `source`.
pub fn random_array<const N: usize>(
    source: &mut dyn RandomSource,
) -> Result<[u8; N], EntropyError> {
    let mut bytes = [0u8; N];
    source.fill(&mut bytes)?;
    Ok(bytes)
}

/// Build a CSPRNG seeded from `source` for primitives that need an `RngCore`.
///
/// The seed buffer is zeroized once the generator has been keyed.
pub fn seeded_rng(source: &mut dyn RandomSource) -> Result<StdRng, EntropyError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    source.fill(&mut seed[..])?;
    Ok(StdRng::from_seed(*seed))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Random source that always fails.
    pub struct BrokenRandom;

    impl RandomSource for BrokenRandom {
        fn fill(&mut self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError("device not ready".to_string()))
        }
    }
}
