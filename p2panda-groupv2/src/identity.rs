// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identities of users and their devices.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::ed25519::{Signature, VerifyingKey};
use crate::crypto::{Rng, RngError};

pub const UID_SIZE: usize = 32;

/// Public identity of a user.
///
/// An identity is the Ed25519 public key of the user's long-term signing key. The matching
/// private key is held outside of this crate and only used through
/// [`SolveChallenge`](crate::traits::SolveChallenge).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(VerifyingKey);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(VerifyingKey::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Returns true if the signature over the bytes was created by this identity.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, signature).is_ok()
    }
}

impl From<VerifyingKey> for Identity {
    fn from(value: VerifyingKey) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.to_hex()).finish()
    }
}

/// 32 random bytes used as identifier for devices, dialogs, server queries and photo labels.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(#[serde(with = "serde_bytes")] [u8; UID_SIZE]);

impl Uid {
    pub fn from_bytes(bytes: [u8; UID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn as_bytes(&self) -> &[u8; UID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Uid").field(&self.to_hex()).finish()
    }
}

/// One device of an identity.
pub type DeviceId = Uid;

/// Identifier of a user dialog, stable across the prompts shown for one invitation.
pub type DialogId = Uid;

/// Identifier matching a blob download request with its server response.
pub type QueryId = Uid;
