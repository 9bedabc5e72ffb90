// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed payloads for every signature produced or checked by the protocol.
//!
//! Each challenge is encoded with a domain separation prefix followed by its CBOR
//! representation, a signature over one kind of challenge can never be replayed as another.
use serde::{Deserialize, Serialize};

use crate::cbor::{EncodeError, encode_cbor};
use crate::crypto::ed25519::Signature;
use crate::identifier::GroupIdentifier;
use crate::identity::Identity;
use crate::seed::{AdminPrivateKey, AdminPublicKey};

const CHALLENGE_PREFIX: &[u8] = b"p2panda-groupv2 challenge v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Challenge {
    /// Signed by the uploader of a group blob version.
    GroupBlob {
        #[serde(with = "serde_bytes")]
        encoded_blob: Vec<u8>,
    },

    /// Signed by an administrator of the previous block when extending the chain.
    AdministratorsChainBlock {
        #[serde(with = "serde_bytes")]
        encoded_inner_data: Vec<u8>,
    },

    /// Leave log entry, proves a member left (or rejected) the group.
    GroupLeaveNonce {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },

    /// Ping proving knowledge of the group to one other member.
    GroupJoinNonce {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
        recipient: Identity,
    },

    /// Lock request towards the blob server, signed with the admin key.
    GroupLockNonce {
        #[serde(with = "serde_bytes")]
        lock_nonce: Vec<u8>,
    },

    /// Update request towards the blob server, signed with the admin key.
    GroupUpdate {
        #[serde(with = "serde_bytes")]
        lock_nonce: Vec<u8>,
        #[serde(with = "serde_bytes")]
        encrypted_blob: Vec<u8>,
        admin_public_key: AdminPublicKey,
    },

    /// Delete request towards the blob server, signed with the admin key.
    GroupDelete,

    /// Kick of one member, signed by an administrator.
    GroupKick {
        #[serde(with = "serde_bytes")]
        encrypted_administrators_chain: Vec<u8>,
        #[serde(with = "serde_bytes")]
        group_invitation_nonce: Vec<u8>,
    },
}

impl Challenge {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = CHALLENGE_PREFIX.to_vec();
        bytes.extend(encode_cbor(self)?);
        Ok(bytes)
    }

    pub fn sign_with_admin_key(&self, admin_key: &AdminPrivateKey) -> Result<Signature, EncodeError> {
        Ok(admin_key.sign(&self.to_bytes()?))
    }

    /// Returns true if the signature over this challenge was produced by the identity.
    ///
    /// Challenges which fail to encode never verify.
    pub fn verify(&self, signature: &Signature, identity: &Identity) -> bool {
        match self.to_bytes() {
            Ok(bytes) => identity.verify(&bytes, signature),
            Err(_) => false,
        }
    }

    pub fn verify_admin(&self, signature: &Signature, admin_key: &AdminPublicKey) -> bool {
        match self.to_bytes() {
            Ok(bytes) => admin_key.verify(&bytes, signature),
            Err(_) => false,
        }
    }
}
