// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::blob::{ServerBlob, ServerPhotoInfo};
use crate::chain::AdministratorsChain;
use crate::crypto::ed25519::Signature;
use crate::identifier::GroupIdentifier;
use crate::identity::{DeviceId, Identity, Uid};
use crate::seed::{BlobKeys, IdentifierVersionAndKeys};
use crate::traits::{FreezeLease, GroupStore, StoredMember, TrustedPhoto, UpdateAuthor};

/// Local copy of one group.
#[derive(Clone, Debug)]
pub struct StoredGroup {
    pub server_blob: ServerBlob,
    pub blob_keys: BlobKeys,

    /// Members who did not prove yet that they know their current invitation nonce.
    pub pending: BTreeSet<Identity>,

    pub frozen: Option<FreezeLease>,
    pub ping_signatures: Vec<Signature>,
    pub photo: Option<TrustedPhoto>,
    pub photo_to_download: Option<ServerPhotoInfo>,
}

impl StoredGroup {
    fn new(server_blob: &ServerBlob, blob_keys: &BlobKeys, owned_identity: &Identity) -> Self {
        Self {
            server_blob: server_blob.clone(),
            blob_keys: blob_keys.clone(),
            pending: server_blob
                .other_group_members(owned_identity)
                .into_iter()
                .map(|member| member.identity)
                .collect(),
            frozen: None,
            ping_signatures: Vec::new(),
            photo: None,
            photo_to_download: None,
        }
    }
}

/// Groups, contacts and owned devices of one device, kept in memory.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    pub owned_identity: Identity,
    pub owned_core_details: Vec<u8>,

    /// Contacts and their serialized core details.
    pub contacts: BTreeMap<Identity, Vec<u8>>,

    pub other_owned_devices: BTreeSet<DeviceId>,
    pub groups: BTreeMap<GroupIdentifier, StoredGroup>,
    pub scratch_photos: Vec<PathBuf>,
    next_token: u64,
}

impl MemoryStore {
    pub fn new(owned_identity: Identity, owned_core_details: Vec<u8>) -> Self {
        Self {
            owned_identity,
            owned_core_details,
            contacts: BTreeMap::new(),
            other_owned_devices: BTreeSet::new(),
            groups: BTreeMap::new(),
            scratch_photos: Vec::new(),
            next_token: 0,
        }
    }

    pub fn is_frozen(&self, group_id: &GroupIdentifier) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|group| group.frozen.is_some())
    }

    pub fn is_pending(&self, group_id: &GroupIdentifier, identity: &Identity) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|group| group.pending.contains(identity))
    }

    fn group(&self, group_id: &GroupIdentifier) -> Result<&StoredGroup, StoreError> {
        self.groups
            .get(group_id)
            .ok_or_else(|| StoreError::UnknownGroup(group_id.clone()))
    }

    fn group_mut(&mut self, group_id: &GroupIdentifier) -> Result<&mut StoredGroup, StoreError> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| StoreError::UnknownGroup(group_id.clone()))
    }

    fn next_lease(&mut self, group_id: &GroupIdentifier) -> FreezeLease {
        self.next_token += 1;
        let mut token = [0; 32];
        token[..8].copy_from_slice(&self.next_token.to_be_bytes());
        FreezeLease::new(group_id.clone(), Uid::from_bytes(token))
    }
}

impl GroupStore for MemoryStore {
    type Error = StoreError;

    fn create_group_administrated_by_owned_identity(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
        photo: Option<&Path>,
    ) -> Result<FreezeLease, Self::Error> {
        if self.groups.contains_key(group_id) {
            return Err(StoreError::GroupExists(group_id.clone()));
        }
        let lease = self.next_lease(group_id);
        let mut group = StoredGroup::new(server_blob, blob_keys, &self.owned_identity);
        group.frozen = Some(lease.clone());
        if let (Some(path), Some(server_photo_info)) = (photo, &server_blob.server_photo_info) {
            group.photo = Some(TrustedPhoto {
                path: path.to_path_buf(),
                server_photo_info: server_photo_info.clone(),
            });
        }
        self.groups.insert(group_id.clone(), group);
        Ok(lease)
    }

    fn create_group_joined_by_owned_identity(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
    ) -> Result<(), Self::Error> {
        if self.groups.contains_key(group_id) {
            return Err(StoreError::GroupExists(group_id.clone()));
        }
        let mut group = StoredGroup::new(server_blob, blob_keys, &self.owned_identity);
        group.photo_to_download = server_blob.server_photo_info.clone();
        self.groups.insert(group_id.clone(), group);
        Ok(())
    }

    fn update_group(
        &mut self,
        group_id: &GroupIdentifier,
        server_blob: &ServerBlob,
        blob_keys: &BlobKeys,
        author: UpdateAuthor,
    ) -> Result<Vec<Identity>, Self::Error> {
        let owned_identity = self.owned_identity;
        let group = self.group_mut(group_id)?;

        // New members and members with a fresh nonce have to confirm again.
        let mut newly_pending = Vec::new();
        let mut pending = BTreeSet::new();
        for member in server_blob.other_group_members(&owned_identity) {
            let confirmed = group
                .server_blob
                .group_members
                .get(&member.identity)
                .is_some_and(|previous| {
                    previous.group_invitation_nonce == member.group_invitation_nonce
                        && !group.pending.contains(&member.identity)
                });
            if confirmed {
                continue;
            }
            if !group
                .server_blob
                .group_members
                .get(&member.identity)
                .is_some_and(|previous| {
                    previous.group_invitation_nonce == member.group_invitation_nonce
                })
            {
                newly_pending.push(member.identity);
            }
            pending.insert(member.identity);
        }

        let is_admin = server_blob
            .group_members
            .get(&owned_identity)
            .is_some_and(|member| member.has_group_admin_permission());
        let blob_main_seed = blob_keys
            .blob_main_seed
            .clone()
            .or_else(|| group.blob_keys.blob_main_seed.clone());
        let group_admin_private_key = if is_admin {
            blob_keys
                .group_admin_private_key
                .clone()
                .or_else(|| group.blob_keys.group_admin_private_key.clone())
        } else {
            None
        };
        group.blob_keys = BlobKeys::new(
            blob_main_seed,
            blob_keys.blob_version_seed.clone(),
            group_admin_private_key,
        );

        let current_photo = group.photo.as_ref().map(|photo| &photo.server_photo_info);
        if server_blob.server_photo_info.as_ref() != current_photo {
            if author == UpdateAuthor::OtherMember {
                group.photo_to_download = server_blob.server_photo_info.clone();
            }
            if server_blob.server_photo_info.is_none() {
                group.photo = None;
            }
        }

        group.server_blob = server_blob.clone();
        group.pending = pending;
        Ok(newly_pending)
    }

    fn delete_group(&mut self, group_id: &GroupIdentifier) -> Result<(), Self::Error> {
        self.groups.remove(group_id);
        Ok(())
    }

    fn group_exists(&self, group_id: &GroupIdentifier) -> Result<bool, Self::Error> {
        Ok(self.groups.contains_key(group_id))
    }

    fn group_version(&self, group_id: &GroupIdentifier) -> Result<Option<u64>, Self::Error> {
        Ok(self
            .groups
            .get(group_id)
            .map(|group| group.server_blob.group_version))
    }

    fn blob_keys(&self, group_id: &GroupIdentifier) -> Result<Option<BlobKeys>, Self::Error> {
        Ok(self.groups.get(group_id).map(|group| group.blob_keys.clone()))
    }

    fn administrators_chain(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<AdministratorsChain>, Self::Error> {
        Ok(self
            .groups
            .get(group_id)
            .map(|group| group.server_blob.administrators_chain.clone()))
    }

    fn own_group_invitation_nonce(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.groups.get(group_id).and_then(|group| {
            group
                .server_blob
                .own_permissions_and_nonce(&self.owned_identity)
                .map(|(_, nonce)| nonce)
        }))
    }

    fn other_members(&self, group_id: &GroupIdentifier) -> Result<Vec<StoredMember>, Self::Error> {
        let group = self.group(group_id)?;
        Ok(group
            .server_blob
            .other_group_members(&self.owned_identity)
            .into_iter()
            .map(|member| StoredMember {
                identity: member.identity,
                is_pending: group.pending.contains(&member.identity),
                group_invitation_nonce: member.group_invitation_nonce,
                raw_permissions: member.raw_permissions,
            })
            .collect())
    }

    fn non_pending_administrators(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<BTreeSet<Identity>, Self::Error> {
        let group = self.group(group_id)?;
        Ok(group
            .server_blob
            .group_members
            .values()
            .filter(|member| {
                member.has_group_admin_permission() && !group.pending.contains(&member.identity)
            })
            .map(|member| member.identity)
            .collect())
    }

    fn move_pending_member_to_members(
        &mut self,
        group_id: &GroupIdentifier,
        identity: &Identity,
    ) -> Result<(), Self::Error> {
        self.group_mut(group_id)?.pending.remove(identity);
        Ok(())
    }

    fn freeze_group(&mut self, group_id: &GroupIdentifier) -> Result<FreezeLease, Self::Error> {
        if let Some(lease) = &self.group(group_id)?.frozen {
            return Ok(lease.clone());
        }
        let lease = self.next_lease(group_id);
        self.group_mut(group_id)?.frozen = Some(lease.clone());
        Ok(lease)
    }

    fn unfreeze_group(&mut self, lease: &FreezeLease) -> Result<(), Self::Error> {
        if let Some(group) = self.groups.get_mut(lease.group_id()) {
            if group.frozen.as_ref() == Some(lease) {
                group.frozen = None;
            }
        }
        Ok(())
    }

    fn ping_signature_already_received(
        &self,
        group_id: &GroupIdentifier,
        signature: &Signature,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .groups
            .get(group_id)
            .is_some_and(|group| group.ping_signatures.contains(signature)))
    }

    fn record_ping_signature(
        &mut self,
        group_id: &GroupIdentifier,
        signature: &Signature,
    ) -> Result<(), Self::Error> {
        self.group_mut(group_id)?
            .ping_signatures
            .push(signature.clone());
        Ok(())
    }

    fn trusted_photo(&self, group_id: &GroupIdentifier) -> Result<Option<TrustedPhoto>, Self::Error> {
        Ok(self.groups.get(group_id).and_then(|group| group.photo.clone()))
    }

    fn photo_needs_download(
        &self,
        group_id: &GroupIdentifier,
    ) -> Result<Option<ServerPhotoInfo>, Self::Error> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|group| group.photo_to_download.clone()))
    }

    fn set_uploaded_photo(
        &mut self,
        group_id: &GroupIdentifier,
        server_photo_info: &ServerPhotoInfo,
        photo: &Path,
    ) -> Result<(), Self::Error> {
        let group = self.group_mut(group_id)?;
        group.photo = Some(TrustedPhoto {
            path: photo.to_path_buf(),
            server_photo_info: server_photo_info.clone(),
        });
        group.photo_to_download = None;
        Ok(())
    }

    fn copy_photo_to_scratch(&mut self, photo: &Path) -> Result<PathBuf, Self::Error> {
        let file_name = photo
            .file_name()
            .ok_or_else(|| StoreError::InvalidPhotoPath(photo.to_path_buf()))?;
        let scratch = PathBuf::from("scratch")
            .join(self.scratch_photos.len().to_string())
            .join(file_name);
        self.scratch_photos.push(scratch.clone());
        Ok(scratch)
    }

    fn owned_core_details(&self) -> Result<Vec<u8>, Self::Error> {
        Ok(self.owned_core_details.clone())
    }

    fn contact_core_details(&self, identity: &Identity) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.contacts.get(identity).cloned())
    }

    fn other_owned_device_uids(&self) -> Result<BTreeSet<DeviceId>, Self::Error> {
        Ok(self.other_owned_devices.clone())
    }

    fn groups_shared_with(
        &self,
        contact: &Identity,
    ) -> Result<Vec<IdentifierVersionAndKeys>, Self::Error> {
        Ok(self
            .groups
            .iter()
            .filter_map(|(group_id, group)| {
                let member = group.server_blob.group_members.get(contact)?;
                let blob_keys = if member.has_group_admin_permission() {
                    group.blob_keys.clone()
                } else {
                    group.blob_keys.without_admin_key()
                };
                Some(IdentifierVersionAndKeys {
                    group_identifier: group_id.clone(),
                    group_version: group.server_blob.group_version,
                    blob_keys,
                })
            })
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown group {0}")]
    UnknownGroup(GroupIdentifier),

    #[error("group {0} already exists")]
    GroupExists(GroupIdentifier),

    #[error("photo path {0:?} has no file name")]
    InvalidPhotoPath(PathBuf),
}
