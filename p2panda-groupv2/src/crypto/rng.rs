// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use thiserror::Error;

/// ChaCha20 random number generator shared by all steps of a device.
///
/// Source of seeds, admin key pairs, AEAD nonces, invitation and lock nonces.
#[derive(Debug)]
pub struct Rng(Mutex<ChaCha20Rng>);

impl Default for Rng {
    fn default() -> Self {
        Self(Mutex::new(ChaCha20Rng::from_os_rng()))
    }
}

impl Rng {
    #[cfg(any(test, feature = "test_utils"))]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(Mutex::new(ChaCha20Rng::from_seed(seed)))
    }

    /// Fixed-size key material, for example seeds, signing keys or AEAD nonces.
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut out = [0u8; N];
        self.fill(&mut out)?;
        Ok(out)
    }

    /// Nonces whose length is configurable.
    pub fn random_vec(&self, len: usize) -> Result<Vec<u8>, RngError> {
        let mut out = vec![0u8; len];
        self.fill(&mut out)?;
        Ok(out)
    }

    fn fill(&self, out: &mut [u8]) -> Result<(), RngError> {
        self.0
            .lock()
            .map_err(|_| RngError::LockPoisoned)?
            .try_fill_bytes(out)
            .map_err(|_| RngError::NotEnoughRandomness)
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,
}

#[cfg(test)]
mod tests {
    use super::Rng;

    #[test]
    fn seeded_nonces_repeat() {
        let nonce_1 = Rng::from_seed([7; 32]).random_vec(16).unwrap();
        let nonce_2 = Rng::from_seed([7; 32]).random_vec(16).unwrap();
        assert_eq!(nonce_1, nonce_2);
        assert_ne!(nonce_1, Rng::from_seed([8; 32]).random_vec(16).unwrap());
    }

    #[test]
    fn seeds_differ_between_draws() {
        let rng = Rng::from_seed([1; 32]);
        let seed_1: [u8; 32] = rng.random_array().unwrap();
        let seed_2: [u8; 32] = rng.random_array().unwrap();
        assert_ne!(seed_1, seed_2);
    }
}
