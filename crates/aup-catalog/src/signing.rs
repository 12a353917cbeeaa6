use aup_crypto::{Signature, SigningKey, VerifyingKey};
use aup_types::Oid;

use crate::object::{Object, Release};

impl Release {
    /// Identity of this release with the signature zeroed. This is the
    /// message the producer signs.
    pub fn signing_digest(&self) -> Oid {
        let mut unsigned = self.clone();
        unsigned.signature = [0u8; 64];
        Object::Release(unsigned).identify()
    }

    /// Set `signer` to the key's public half and sign the release.
    pub fn sign(&mut self, key: &SigningKey) {
        self.signer = key.verifying_key().to_bytes();
        self.signature = key.sign(self.signing_digest().as_bytes()).to_bytes();
    }

    /// Check the embedded signature against the embedded signer key.
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signer) else {
            return false;
        };
        key.verify(
            self.signing_digest().as_bytes(),
            &Signature::from_bytes(&self.signature),
        )
        .is_ok()
    }
}

impl Object {
    /// Releases must carry a valid signature; other objects always pass.
    pub fn verify_signature(&self) -> bool {
        match self {
            Object::Release(release) => release.verify_signature(),
            _ => true,
        }
    }
}
