// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only chain of signed administrator snapshots.
//!
//! The first block is signed by the group creator and carries a random "previous hash", its
//! SHA-256 digest becomes the group uid. Every later block points to the digest of its
//! predecessor and must be signed by one of the administrators listed in it. Members only
//! accept a chain when the one they already trust is a prefix of it, which prevents rolling a
//! group back to an older administrator set.
use std::collections::BTreeSet;
use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::challenge::Challenge;
use crate::crypto::ed25519::Signature;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::xchacha20::{XAeadError, open, seal};
use crate::crypto::{Rng, RngError};
use crate::identifier::GroupUid;
use crate::identity::Identity;
use crate::seed::{Seed, chain_key};
use crate::traits::SolveChallenge;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInnerData {
    #[serde(with = "serde_bytes")]
    pub previous_block_hash: Vec<u8>,

    /// Administrators of the group, the author of the block comes first.
    pub administrators: Vec<Identity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub inner_data: BlockInnerData,
    pub signature: Signature,
}

impl Block {
    fn sign<X: SolveChallenge>(
        inner_data: BlockInnerData,
        owned_identity: &Identity,
        solver: &X,
    ) -> Result<Self, ChainError> {
        let challenge = Challenge::AdministratorsChainBlock {
            encoded_inner_data: encode_cbor(&inner_data)?,
        };
        let signature = solver
            .solve_challenge(&challenge, owned_identity)
            .map_err(|err| ChainError::Challenge(Box::new(err)))?;
        Ok(Self {
            inner_data,
            signature,
        })
    }

    fn digest(&self) -> Result<[u8; SHA256_DIGEST_SIZE], ChainError> {
        Ok(sha2_256(&[&encode_cbor(self)?]))
    }

    fn administrators(&self) -> BTreeSet<Identity> {
        self.inner_data.administrators.iter().copied().collect()
    }

    fn signed_by_one_of(&self, administrators: &[Identity]) -> Result<bool, ChainError> {
        let challenge = Challenge::AdministratorsChainBlock {
            encoded_inner_data: encode_cbor(&self.inner_data)?,
        };
        Ok(administrators
            .iter()
            .any(|administrator| challenge.verify(&self.signature, administrator)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdministratorsChain {
    group_uid: GroupUid,
    blocks: Vec<Block>,

    /// Set only after all digests and signatures were verified, never persisted.
    #[serde(skip)]
    integrity_checked: bool,
}

impl PartialEq for AdministratorsChain {
    fn eq(&self, other: &Self) -> bool {
        self.group_uid == other.group_uid && self.blocks == other.blocks
    }
}

impl Eq for AdministratorsChain {}

impl AdministratorsChain {
    /// Creates the chain of a new group, the owned identity becomes the first administrator.
    pub fn start_new_chain<X: SolveChallenge>(
        owned_identity: &Identity,
        other_administrators: &[Identity],
        rng: &Rng,
        solver: &X,
    ) -> Result<Self, ChainError> {
        let inner_data = BlockInnerData {
            previous_block_hash: rng.random_vec(SHA256_DIGEST_SIZE)?,
            administrators: administrators_list(owned_identity, other_administrators),
        };
        let first_block = Block::sign(inner_data, owned_identity, solver)?;
        let group_uid = GroupUid::from_bytes(first_block.digest()?);
        let chain = Self {
            group_uid,
            blocks: vec![first_block],
            integrity_checked: false,
        };
        chain.with_checked_integrity(&group_uid)
    }

    /// Appends a block listing the new administrator set. The owned identity must be one of the
    /// current administrators.
    pub fn add_block<X: SolveChallenge>(
        &self,
        owned_identity: &Identity,
        other_administrators: &[Identity],
        solver: &X,
    ) -> Result<Self, ChainError> {
        let last_block = self.blocks.last().ok_or(ChainError::EmptyChain)?;
        if !last_block.administrators().contains(owned_identity) {
            return Err(ChainError::NotAnAdministrator(*owned_identity));
        }
        let inner_data = BlockInnerData {
            previous_block_hash: last_block.digest()?.to_vec(),
            administrators: administrators_list(owned_identity, other_administrators),
        };
        let block = Block::sign(inner_data, owned_identity, solver)?;
        let mut blocks = self.blocks.clone();
        blocks.push(block);
        Ok(Self {
            group_uid: self.group_uid,
            blocks,
            integrity_checked: self.integrity_checked,
        })
    }

    pub fn group_uid(&self) -> &GroupUid {
        &self.group_uid
    }

    pub fn integrity_checked(&self) -> bool {
        self.integrity_checked
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn all_current_administrators(&self) -> BTreeSet<Identity> {
        self.blocks
            .last()
            .map(Block::administrators)
            .unwrap_or_default()
    }

    /// Returns true if the last block removed someone from the administrator set of the block
    /// before.
    pub fn an_administrator_was_demoted_in_the_last_update(&self) -> bool {
        match self.blocks.as_slice() {
            [.., previous, last] => !previous
                .administrators()
                .is_subset(&last.administrators()),
            _ => false,
        }
    }

    /// Verifies the group uid, the digests linking all blocks and every block signature.
    pub fn with_checked_integrity(&self, expected_group_uid: &GroupUid) -> Result<Self, ChainError> {
        if self.integrity_checked {
            return Ok(self.clone());
        }

        let first_block = self.blocks.first().ok_or(ChainError::EmptyChain)?;
        let computed_group_uid = GroupUid::from_bytes(first_block.digest()?);
        if computed_group_uid != self.group_uid {
            return Err(ChainError::GroupUidMismatch);
        }
        if &self.group_uid != expected_group_uid {
            return Err(ChainError::UnexpectedGroupUid);
        }

        for pair in self.blocks.windows(2) {
            if pair[0].digest()?.as_slice() != pair[1].inner_data.previous_block_hash.as_slice() {
                return Err(ChainError::BrokenHashChain);
            }
        }

        // The first block is signed by one of its own administrators.
        let mut administrators_of_previous_block = first_block.inner_data.administrators.as_slice();
        for block in &self.blocks {
            if !block.signed_by_one_of(administrators_of_previous_block)? {
                return Err(ChainError::InvalidBlockSignature);
            }
            administrators_of_previous_block = block.inner_data.administrators.as_slice();
        }

        Ok(Self {
            group_uid: self.group_uid,
            blocks: self.blocks.clone(),
            integrity_checked: true,
        })
    }

    /// Marks a chain as checked which was obtained from an already verified source, for
    /// example the local store.
    pub fn with_forced_checked_integrity(&self) -> Self {
        Self {
            group_uid: self.group_uid,
            blocks: self.blocks.clone(),
            integrity_checked: true,
        }
    }

    /// Returns true if all blocks of this chain appear in the same order at the beginning of
    /// the other chain.
    ///
    /// Blocks are compared by their inner data only, signatures are not part of the comparison.
    /// Both chains are expected to have passed the integrity check before.
    pub fn is_prefix_of(&self, other: &AdministratorsChain) -> bool {
        self.group_uid == other.group_uid
            && self.blocks.len() <= other.blocks.len()
            && self
                .blocks
                .iter()
                .zip(other.blocks.iter())
                .all(|(ours, theirs)| ours.inner_data == theirs.inner_data)
    }

    pub fn encrypt(&self, blob_main_seed: &Seed, rng: &Rng) -> Result<Vec<u8>, ChainError> {
        let key = chain_key(blob_main_seed)?;
        let plaintext = encode_cbor(self)?;
        Ok(seal(&key, &plaintext, rng)?)
    }

    pub fn decrypt_and_check_integrity(
        encrypted_chain: &[u8],
        blob_main_seed: &Seed,
        expected_group_uid: &GroupUid,
    ) -> Result<Self, ChainError> {
        let key = chain_key(blob_main_seed)?;
        let plaintext = open(&key, encrypted_chain)?;
        let chain: Self = decode_cbor(&plaintext[..])?;
        chain.with_checked_integrity(expected_group_uid)
    }
}

fn administrators_list(owned_identity: &Identity, other_administrators: &[Identity]) -> Vec<Identity> {
    let mut administrators = vec![*owned_identity];
    administrators.extend(
        other_administrators
            .iter()
            .filter(|administrator| *administrator != owned_identity),
    );
    administrators
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("administrators chain does not contain any block")]
    EmptyChain,

    #[error("{0} is not an administrator of the last block")]
    NotAnAdministrator(Identity),

    #[error("group uid does not match the digest of the first block")]
    GroupUidMismatch,

    #[error("administrators chain belongs to another group")]
    UnexpectedGroupUid,

    #[error("block does not point to the digest of its predecessor")]
    BrokenHashChain,

    #[error("block is not signed by an administrator of the previous block")]
    InvalidBlockSignature,

    #[error("could not sign block: {0}")]
    Challenge(Box<dyn StdError + Send + Sync + 'static>),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
