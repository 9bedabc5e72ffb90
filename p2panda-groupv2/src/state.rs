// SPDX-License-Identifier: MIT OR Apache-2.0

//! States of a group protocol instance.
//!
//! A state is produced by exactly one step and consumed by the next one, it is never mutated in
//! place. States are serializable so the instance can be persisted between two messages.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::blob::{ServerBlob, ServerPhotoInfo};
use crate::changeset::Changeset;
use crate::collected::InvitationCollectedData;
use crate::identifier::GroupIdentifier;
use crate::identity::{DialogId, Identity, QueryId};
use crate::seed::{AdminPrivateKey, BlobKeys, Seed};
use crate::traits::FreezeLease;

/// Own invitation nonce and other members of a group we already knew before a re-download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnNonceAndMembers {
    #[serde(with = "serde_bytes")]
    pub own_group_invitation_nonce: Vec<u8>,
    pub other_members: BTreeSet<Identity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadingCreatedGroupData {
    pub group_id: GroupIdentifier,
    pub group_version: u64,
    pub waiting_for_blob_upload: bool,
    pub waiting_for_photo_upload: bool,
    pub lease: FreezeLease,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadingGroupBlob {
    pub group_id: GroupIdentifier,
    pub dialog_id: DialogId,
    pub collected_data: InvitationCollectedData,
    pub expected_query_id: QueryId,
    pub last_known_own_nonce_and_members: Option<OwnNonceAndMembers>,
    pub lease: Option<FreezeLease>,
}

/// Blob could not be decrypted with the collected keys, waiting for more.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedMoreSeeds {
    pub group_id: GroupIdentifier,
    pub dialog_id: DialogId,
    pub collected_data: InvitationCollectedData,
    pub last_known_own_nonce_and_members: Option<OwnNonceAndMembers>,
    pub lease: Option<FreezeLease>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationReceived {
    pub group_id: GroupIdentifier,
    pub dialog_id: DialogId,
    pub inviter: Identity,
    pub server_blob: ServerBlob,
    pub blob_keys: BlobKeys,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectingInvitationOrLeavingGroup {
    pub group_id: GroupIdentifier,
    pub members_to_notify: BTreeSet<Identity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForLock {
    pub group_id: GroupIdentifier,
    pub changeset: Changeset,
    #[serde(with = "serde_bytes")]
    pub lock_nonce: Vec<u8>,
    pub failed_upload_counter: u32,
    pub lease: FreezeLease,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadingUpdatedGroupBlob {
    pub group_id: GroupIdentifier,
    pub changeset: Changeset,
    pub previous_blob: ServerBlob,
    pub uploaded_blob: ServerBlob,
    pub updated_admin_key: Option<AdminPrivateKey>,
    pub updated_version_seed: Seed,
    pub failed_upload_counter: u32,
    pub lease: FreezeLease,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadingUpdatedGroupPhoto {
    pub group_id: GroupIdentifier,
    pub changeset: Changeset,
    pub previous_blob: ServerBlob,
    pub uploaded_blob: ServerBlob,
    pub updated_admin_key: Option<AdminPrivateKey>,
    pub updated_version_seed: Seed,
    pub server_photo_info_of_new_photo: Option<ServerPhotoInfo>,
    pub lease: FreezeLease,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbandingGroup {
    pub group_id: GroupIdentifier,
    pub blob_main_seed: Seed,
    pub lease: FreezeLease,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    #[default]
    Initial,
    UploadingCreatedGroupData(UploadingCreatedGroupData),
    DownloadingGroupBlob(DownloadingGroupBlob),
    NeedMoreSeeds(NeedMoreSeeds),
    InvitationReceived(InvitationReceived),
    RejectingInvitationOrLeavingGroup(RejectingInvitationOrLeavingGroup),
    WaitingForLock(WaitingForLock),
    UploadingUpdatedGroupBlob(UploadingUpdatedGroupBlob),
    UploadingUpdatedGroupPhoto(UploadingUpdatedGroupPhoto),
    DisbandingGroup(DisbandingGroup),
    Final,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateTag {
    Initial,
    UploadingCreatedGroupData,
    DownloadingGroupBlob,
    NeedMoreSeeds,
    InvitationReceived,
    RejectingInvitationOrLeavingGroup,
    WaitingForLock,
    UploadingUpdatedGroupBlob,
    UploadingUpdatedGroupPhoto,
    DisbandingGroup,
    Final,
}

impl ProtocolState {
    pub fn tag(&self) -> StateTag {
        match self {
            ProtocolState::Initial => StateTag::Initial,
            ProtocolState::UploadingCreatedGroupData(_) => StateTag::UploadingCreatedGroupData,
            ProtocolState::DownloadingGroupBlob(_) => StateTag::DownloadingGroupBlob,
            ProtocolState::NeedMoreSeeds(_) => StateTag::NeedMoreSeeds,
            ProtocolState::InvitationReceived(_) => StateTag::InvitationReceived,
            ProtocolState::RejectingInvitationOrLeavingGroup(_) => {
                StateTag::RejectingInvitationOrLeavingGroup
            }
            ProtocolState::WaitingForLock(_) => StateTag::WaitingForLock,
            ProtocolState::UploadingUpdatedGroupBlob(_) => StateTag::UploadingUpdatedGroupBlob,
            ProtocolState::UploadingUpdatedGroupPhoto(_) => StateTag::UploadingUpdatedGroupPhoto,
            ProtocolState::DisbandingGroup(_) => StateTag::DisbandingGroup,
            ProtocolState::Final => StateTag::Final,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ProtocolState::Final)
    }

    /// Group this state is about, `None` for `Initial` and `Final`.
    pub fn group_id(&self) -> Option<&GroupIdentifier> {
        match self {
            ProtocolState::Initial | ProtocolState::Final => None,
            ProtocolState::UploadingCreatedGroupData(state) => Some(&state.group_id),
            ProtocolState::DownloadingGroupBlob(state) => Some(&state.group_id),
            ProtocolState::NeedMoreSeeds(state) => Some(&state.group_id),
            ProtocolState::InvitationReceived(state) => Some(&state.group_id),
            ProtocolState::RejectingInvitationOrLeavingGroup(state) => Some(&state.group_id),
            ProtocolState::WaitingForLock(state) => Some(&state.group_id),
            ProtocolState::UploadingUpdatedGroupBlob(state) => Some(&state.group_id),
            ProtocolState::UploadingUpdatedGroupPhoto(state) => Some(&state.group_id),
            ProtocolState::DisbandingGroup(state) => Some(&state.group_id),
        }
    }
}
