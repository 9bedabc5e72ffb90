// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group identifiers and the protocol instance correlation id derived from them.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cbor::{EncodeError, encode_cbor};

pub const GROUP_UID_SIZE: usize = 32;

const PROTOCOL_INSTANCE_CONTEXT: &str = "p2panda-groupv2 2025-03 protocol instance id";

/// Unique identifier of a group, the SHA-256 digest of the first block of its administrators
/// chain.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupUid(#[serde(with = "serde_bytes")] [u8; GROUP_UID_SIZE]);

impl GroupUid {
    pub fn from_bytes(bytes: [u8; GROUP_UID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_UID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for GroupUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupUid").field(&self.to_hex()).finish()
    }
}

/// Where the authoritative copy of a group lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Group blob is hosted on the untrusted blob server and managed by this protocol.
    Server,

    /// Group is managed by an identity provider, the protocol only reacts to kicks and
    /// disbands for it.
    Keycloak,
}

/// Identifies a group on a given blob server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupIdentifier {
    pub group_uid: GroupUid,
    pub server_url: String,
    pub category: Category,
}

impl GroupIdentifier {
    pub fn new(group_uid: GroupUid, server_url: impl Into<String>, category: Category) -> Self {
        Self {
            group_uid,
            server_url: server_url.into(),
            category,
        }
    }

    /// Derives the correlation id binding all protocol messages concerning this group.
    pub fn protocol_instance_id(&self) -> Result<ProtocolInstanceId, EncodeError> {
        ProtocolInstanceId::for_group(self)
    }
}

impl fmt::Display for GroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.group_uid.to_hex()[..8], self.server_url)
    }
}

/// Deterministic correlation id of the protocol instance handling one group.
///
/// Messages carrying an id are never trusted on the id alone: every step re-derives it from the
/// group identifier found inside the message and drops the message on mismatch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolInstanceId(#[serde(with = "serde_bytes")] [u8; 32]);

impl ProtocolInstanceId {
    pub fn for_group(group_id: &GroupIdentifier) -> Result<Self, EncodeError> {
        let encoded = encode_cbor(group_id)?;
        let mut hasher = blake3::Hasher::new_derive_key(PROTOCOL_INSTANCE_CONTEXT);
        hasher.update(&encoded);
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ProtocolInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProtocolInstanceId")
            .field(&hex::encode(&self.0[..8]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Category, GroupIdentifier, GroupUid, ProtocolInstanceId};

    #[test]
    fn deterministic_correlation_id() {
        let group_id = GroupIdentifier::new(GroupUid::from_bytes([3; 32]), "https://blobs", Category::Server);

        let id_1 = ProtocolInstanceId::for_group(&group_id).unwrap();
        let id_2 = group_id.protocol_instance_id().unwrap();
        assert_eq!(id_1, id_2);
    }

    #[test]
    fn every_field_is_bound() {
        let group_id = GroupIdentifier::new(GroupUid::from_bytes([3; 32]), "https://blobs", Category::Server);
        let other_uid = GroupIdentifier::new(GroupUid::from_bytes([4; 32]), "https://blobs", Category::Server);
        let other_server = GroupIdentifier::new(GroupUid::from_bytes([3; 32]), "https://other", Category::Server);
        let other_category = GroupIdentifier::new(GroupUid::from_bytes([3; 32]), "https://blobs", Category::Keycloak);

        let id = group_id.protocol_instance_id().unwrap();
        assert_ne!(id, other_uid.protocol_instance_id().unwrap());
        assert_ne!(id, other_server.protocol_instance_id().unwrap());
        assert_ne!(id, other_category.protocol_instance_id().unwrap());
    }
}
