// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic algorithms and secure random number generator used to protect group blobs.
//!
//! Following algorithms are used:
//! * ChaCha random number generator with 20 rounds
//! * XChaCha20-Poly1305 AEAD
//! * HKDF with SHA256
//! * SHA2-256 hashing function
//! * EdDSA related to Curve25519 with SHA-512
pub mod ed25519;
pub mod hkdf;
mod rng;
mod secret;
pub mod sha2;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
