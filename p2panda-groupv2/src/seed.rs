// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seeds and keys protecting a group blob.
//!
//! Every group blob is encrypted with a key derived from two seeds:
//!
//! - The **main seed** is stable for the lifetime of the group and is only ever sent over
//!   pairwise authenticated channels. It also protects the administrators chain attached to
//!   kicks.
//! - The **version seed** is rotated with every uploaded version and may be broadcast.
//!
//! Administrators additionally share the admin private key which authenticates blob lock,
//! update and delete requests towards the blob server.
use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::xchacha20::XAeadKey;
use crate::crypto::{Rng, RngError, Secret};
use crate::identifier::GroupIdentifier;

pub const SEED_SIZE: usize = 32;

const BLOB_KEY_INFO: &[u8] = b"p2panda-groupv2 blob key";

const CHAIN_KEY_INFO: &[u8] = b"p2panda-groupv2 administrators chain key";

/// 32 secret bytes from which AEAD keys are derived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed(Secret<SEED_SIZE>);

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::random(rng)?))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        self.0.as_bytes()
    }
}

/// Derives the key encrypting a blob version from the main and version seed.
pub fn blob_key(main_seed: &Seed, version_seed: &Seed) -> Result<XAeadKey, HkdfError> {
    let mut ikm = [0u8; SEED_SIZE * 2];
    ikm[..SEED_SIZE].copy_from_slice(main_seed.as_bytes());
    ikm[SEED_SIZE..].copy_from_slice(version_seed.as_bytes());
    let key = hkdf(b"", &ikm, Some(BLOB_KEY_INFO));
    zeroize::Zeroize::zeroize(&mut ikm);
    key
}

/// Derives the key encrypting the administrators chain attached to kick messages.
pub fn chain_key(main_seed: &Seed) -> Result<XAeadKey, HkdfError> {
    hkdf(b"", main_seed.as_bytes(), Some(CHAIN_KEY_INFO))
}

/// Private key shared among group administrators to authenticate towards the blob server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminPrivateKey(SigningKey);

impl AdminPrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(SigningKey::generate(rng)?))
    }

    pub fn public_key(&self) -> AdminPublicKey {
        AdminPublicKey(self.0.verifying_key())
    }

    pub(crate) fn sign(&self, bytes: &[u8]) -> Signature {
        self.0.sign(bytes)
    }
}

/// Public counterpart of [`AdminPrivateKey`], known to the blob server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdminPublicKey(VerifyingKey);

impl AdminPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(VerifyingKey::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, signature).is_ok()
    }
}

/// Keys required to read (and for administrators, to write) one version of a group blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobKeys {
    pub blob_main_seed: Option<Seed>,
    pub blob_version_seed: Seed,
    pub group_admin_private_key: Option<AdminPrivateKey>,
}

impl BlobKeys {
    pub fn new(
        blob_main_seed: Option<Seed>,
        blob_version_seed: Seed,
        group_admin_private_key: Option<AdminPrivateKey>,
    ) -> Self {
        Self {
            blob_main_seed,
            blob_version_seed,
            group_admin_private_key,
        }
    }

    /// Returns a copy safe to send over an unauthenticated broadcast channel.
    pub fn without_main_seed(&self) -> Self {
        Self {
            blob_main_seed: None,
            blob_version_seed: self.blob_version_seed.clone(),
            group_admin_private_key: self.group_admin_private_key.clone(),
        }
    }

    /// Returns a copy for a member who is not an administrator.
    pub fn without_admin_key(&self) -> Self {
        Self {
            blob_main_seed: self.blob_main_seed.clone(),
            blob_version_seed: self.blob_version_seed.clone(),
            group_admin_private_key: None,
        }
    }
}

/// Keys of one group at a given version, as sent in a batch after a channel was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierVersionAndKeys {
    pub group_identifier: GroupIdentifier,
    pub group_version: u64,
    pub blob_keys: BlobKeys,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{AdminPrivateKey, BlobKeys, Seed, blob_key, chain_key};

    #[test]
    fn both_seeds_bind_the_blob_key() {
        let rng = Rng::from_seed([1; 32]);
        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed_1 = Seed::generate(&rng).unwrap();
        let version_seed_2 = Seed::generate(&rng).unwrap();

        let key_1 = blob_key(&main_seed, &version_seed_1).unwrap();
        let key_2 = blob_key(&main_seed, &version_seed_2).unwrap();
        assert_ne!(key_1, key_2);
        assert_eq!(key_1, blob_key(&main_seed, &version_seed_1).unwrap());

        // Chain key never equals a blob key of the same main seed.
        assert_ne!(chain_key(&main_seed).unwrap(), key_1);
    }

    #[test]
    fn strip_main_seed() {
        let rng = Rng::from_seed([1; 32]);
        let keys = BlobKeys::new(
            Some(Seed::generate(&rng).unwrap()),
            Seed::generate(&rng).unwrap(),
            Some(AdminPrivateKey::generate(&rng).unwrap()),
        );

        let broadcast = keys.without_main_seed();
        assert!(broadcast.blob_main_seed.is_none());
        assert_eq!(broadcast.blob_version_seed, keys.blob_version_seed);
        assert_eq!(broadcast.group_admin_private_key, keys.group_admin_private_key);

        let member = keys.without_admin_key();
        assert!(member.group_admin_private_key.is_none());
        assert_eq!(member.blob_main_seed, keys.blob_main_seed);
    }

    #[test]
    fn admin_key_signatures() {
        let rng = Rng::from_seed([2; 32]);
        let admin_key = AdminPrivateKey::generate(&rng).unwrap();
        let signature = admin_key.sign(b"lock nonce");
        assert!(admin_key.public_key().verify(b"lock nonce", &signature));
        assert!(!admin_key.public_key().verify(b"other nonce", &signature));
    }
}
