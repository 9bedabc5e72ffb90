// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface for the transactional store holding the groups of one owned identity.
use std::collections::BTreeSet;
use std::error::Error;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blob::{ServerBlob, ServerPhotoInfo};
use crate::chain::AdministratorsChain;
use crate::crypto::ed25519::Signature;
use crate::identifier::GroupIdentifier;
use crate::identity::{DeviceId, Identity, Uid};
use crate::seed::{BlobKeys, IdentifierVersionAndKeys};

/// Proof that a group was frozen, required to unfreeze it again.
///
/// A group stays read-only to the rest of the application while it is being re-synchronised or
/// updated. Only the holder of the lease returned by [`GroupStore::freeze_group`] can lift it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeLease {
    group_id: GroupIdentifier,
    token: Uid,
}

impl FreezeLease {
    pub fn new(group_id: GroupIdentifier, token: Uid) -> Self {
        Self { group_id, token }
    }

    pub fn group_id(&self) -> &GroupIdentifier {
        &self.group_id
    }

    pub fn token(&self) -> &Uid {
        &self.token
    }
}

/// Member (or pending member) of a group as known locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMember {
    pub identity: Identity,
    #[serde(with = "serde_bytes")]
    pub group_invitation_nonce: Vec<u8>,
    pub is_pending: bool,
    pub raw_permissions: BTreeSet<String>,
}

impl StoredMember {
    pub fn is_admin(&self) -> bool {
        crate::permission::is_group_admin(&self.raw_permissions)
    }
}

/// Photo of a group already stored locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedPhoto {
    pub path: PathBuf,
    pub server_photo_info: ServerPhotoInfo,
}

/// Who authored a group update which is written to the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateAuthor {
    /// We uploaded the new version ourselves.
    OwnedIdentity,

    /// Another member uploaded the version we downloaded.
    OtherMember,
}

/// Persistence of groups, members, keys and photos for one owned identity.
///
/// All calls made during one protocol step are expected to run inside a single transaction.
pub trait GroupStore {
    type Error: Error + Send + Sync + 'static;

    /// Creates a group we administrate. The group is returned frozen until the blob upload
    /// finished.
    fn create_group_administrated_by_owned_identity(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
        photo: Option<&Path>,
    ) -> Result<FreezeLease, Self::Error>;

    fn create_group_joined_by_owned_identity(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
    ) -> Result<(), Self::Error>;

    /// Replaces the local state of a group with a newer blob version. Returns the identities
    /// which should be pinged, for example members who appeared in this version.
    fn update_group(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
        author: UpdateAuthor,
    ) -> Result<Vec<Identity>, Self::Error>;

    fn delete_group(&mut self, group_id: &GroupIdentifier) -> Result<(), Self::Error>;

    fn group_exists(&self, group_id: &GroupIdentifier) -> Result<bool, Self::Error>;

    fn group_version(&self, group_id: &GroupIdentifier) -> Result<Option<u64>, Self::Error>;

    fn blob_keys(&self, group_id: &GroupIdentifier) -> Result<Option<BlobKeys>, Self::Error>;

    fn administrators_chain(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<AdministratorsChain>, Self::Error>;

    fn own_group_invitation_nonce(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<Vec<u8>>, Self::Error>;

    /// All members and pending members except the owned identity.
    fn other_members(&self, group_id: &GroupIdentifier) -> Result<Vec<StoredMember>, Self::Error>;

    /// Administrators who confirmed their membership, including the owned identity.
    fn non_pending_administrators(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<BTreeSet<Identity>, Self::Error>;

    fn move_pending_member_to_members(
        &mut self,
        group_id: &GroupIdentifier,
        identity: &Identity,
    ) -> Result<(), Self::Error>;

    /// Freezes a group. Freezing an already frozen group returns the existing lease.
    fn freeze_group(&mut self, group_id: &GroupIdentifier) -> Result<FreezeLease, Self::Error>;

    /// Lifts the freeze, a lease which does not match the current one is ignored.
    fn unfreeze_group(&mut self, lease: &FreezeLease) -> Result<(), Self::Error>;

    fn ping_signature_already_received(
        &self,
        group_id: &GroupIdentifier,
        signature: &Signature,
    ) -> Result<bool, Self::Error>;

    fn record_ping_signature(
        &mut self,
        group_id: &GroupIdentifier,
        signature: &Signature,
    ) -> Result<(), Self::Error>;

    fn trusted_photo(&self, group_id: &GroupIdentifier) -> Result<Option<TrustedPhoto>, Self::Error>;

    /// Photo of the latest version which still has to be fetched from the server.
    fn photo_needs_download(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<ServerPhotoInfo>, Self::Error>;

    fn set_uploaded_photo(
        &mut self,
        group_id: &GroupIdentifier,
        server_photo_info: &ServerPhotoInfo,
        photo: &Path,
    ) -> Result<(), Self::Error>;

    /// Copies a photo owned by the application to a location owned by the protocol.
    fn copy_photo_to_scratch(&mut self, photo: &Path) -> Result<PathBuf, Self::Error>;

    /// Serialized core details of the owned identity.
    fn owned_core_details(&self) -> Result<Vec<u8>, Self::Error>;

    /// Serialized core details of a contact, `None` if the identity is not a contact.
    fn contact_core_details(&self, identity: &Identity) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Devices of the owned identity other than the current one.
    fn other_owned_device_uids(&self) -> Result<BTreeSet<DeviceId>, Self::Error>;

    /// Keys of every group in which the contact is a member or pending member.
    fn groups_shared_with(
        &self,
        contact: &Identity,
    ) -> Result<Vec<IdentifierVersionAndKeys>, Self::Error>;
}
