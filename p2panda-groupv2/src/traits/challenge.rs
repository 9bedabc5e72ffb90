// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::challenge::Challenge;
use crate::crypto::ed25519::Signature;
use crate::identity::Identity;

/// Signs challenges with the private key of an owned identity.
///
/// The identity private key never enters the protocol engine, verification is done with
/// [`Challenge::verify`].
pub trait SolveChallenge {
    type Error: Error + Send + Sync + 'static;

    fn solve_challenge(
        &self,
        challenge: &Challenge,
        identity: &Identity,
    ) -> Result<Signature, Self::Error>;
}
