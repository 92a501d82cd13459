//! Shared fixtures for unit tests.

use std::sync::OnceLock;

use zeroize::Zeroizing;

use crate::keys::{PrivateKeyMaterial, PublicKeyMaterial, RsaKeyCreator};

static SHARED: OnceLock<(PublicKeyMaterial, Vec<u8>)> = OnceLock::new();

/// One RSA-2048 key pair per test binary.
pub(crate) fn shared_key_pair() -> (PublicKeyMaterial, &'static [u8]) {
    let (public, der) = SHARED.get_or_init(|| {
        let pair = RsaKeyCreator::default()
            .generate_key_pair(2048)
            .expect("test key generation");
        let der = pair.private.as_der().to_vec();
        (pair.public, der)
    });
    (public.clone(), der.as_slice())
}

/// A fresh private key handle for the shared pair.
pub(crate) fn shared_private_key() -> PrivateKeyMaterial {
    let (_, der) = shared_key_pair();
    PrivateKeyMaterial::from_pkcs8_der(Zeroizing::new(der.to_vec()))
}
