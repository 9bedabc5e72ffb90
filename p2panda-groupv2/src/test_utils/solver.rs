// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cbor::EncodeError;
use crate::challenge::Challenge;
use crate::crypto::ed25519::{Signature, SigningKey};
use crate::crypto::{Rng, RngError};
use crate::identity::Identity;
use crate::traits::SolveChallenge;

/// Holds identity private keys in memory and signs challenges with them.
#[derive(Clone, Debug, Default)]
pub struct MemorySolver {
    keys: BTreeMap<Identity, SigningKey>,
}

impl MemorySolver {
    pub fn generate_identity(&mut self, rng: &Rng) -> Result<Identity, RngError> {
        let signing_key = SigningKey::generate(rng)?;
        let identity = Identity::from(signing_key.verifying_key());
        self.keys.insert(identity, signing_key);
        Ok(identity)
    }
}

impl SolveChallenge for MemorySolver {
    type Error = SolverError;

    fn solve_challenge(
        &self,
        challenge: &Challenge,
        identity: &Identity,
    ) -> Result<Signature, Self::Error> {
        let signing_key = self
            .keys
            .get(identity)
            .ok_or(SolverError::UnknownIdentity(*identity))?;
        Ok(signing_key.sign(&challenge.to_bytes()?))
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no private key for identity {0}")]
    UnknownIdentity(Identity),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
