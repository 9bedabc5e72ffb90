// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages driving the group protocol.
use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::changeset::Changeset;
use crate::channel::{ReceptionChannel, RequiredChannel};
use crate::crypto::ed25519::Signature;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::{DeviceId, DialogId, Identity, QueryId};
use crate::seed::{AdminPublicKey, BlobKeys, IdentifierVersionAndKeys};

/// Identity and raw permissions of a member to invite into a new group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityAndPermissions {
    pub identity: Identity,
    pub raw_permissions: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadResult {
    Success,
    TemporaryFailure,
    PermanentFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadResult {
    BlobDownloaded {
        #[serde(with = "serde_bytes")]
        encrypted_blob: Vec<u8>,
        log_entries: Vec<Signature>,
        admin_public_key: AdminPublicKey,
    },
    BlobWasDeletedFromServer,
    BlobCouldNotBeDownloaded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResult {
    LockObtained {
        #[serde(with = "serde_bytes")]
        encrypted_blob: Vec<u8>,
        log_entries: Vec<Signature>,
        admin_public_key: AdminPublicKey,
        #[serde(with = "serde_bytes")]
        lock_nonce: Vec<u8>,
    },
    PermanentFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    InitiateGroupCreation {
        server_url: String,
        own_raw_permissions: BTreeSet<String>,
        other_members: BTreeSet<IdentityAndPermissions>,
        #[serde(with = "serde_bytes")]
        serialized_group_core_details: Vec<u8>,
        photo: Option<PathBuf>,
    },
    UploadGroupPhoto,
    UploadGroupBlob {
        result: UploadResult,
    },
    FinalizeGroupCreation,
    InvitationOrMembersUpdate {
        group_id: GroupIdentifier,
        group_version: u64,
        blob_keys: BlobKeys,
        notified_device_uids: BTreeSet<DeviceId>,
    },
    InvitationOrMembersUpdateBroadcast {
        group_id: GroupIdentifier,
        group_version: u64,
        blob_keys: BlobKeys,
    },
    InvitationOrMembersUpdatePropagated {
        group_id: GroupIdentifier,
        group_version: u64,
        blob_keys: BlobKeys,
        inviter: Option<Identity>,
    },
    DownloadGroupBlob {
        query_id: QueryId,
        result: DownloadResult,
    },
    FinalizeGroupUpdate,
    DeleteGroupBlobFromServer {
        success: bool,
    },
    DialogAcceptGroupV2Invitation {
        dialog_id: DialogId,
        invitation_accepted: bool,
    },
    Ping {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        group_invitation_nonce: Vec<u8>,
        signature: Signature,
        is_response: bool,
    },
    PropagatedPing {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        group_invitation_nonce: Vec<u8>,
        signature: Signature,
        is_response: bool,
    },
    Kick {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        encrypted_administrators_chain: Vec<u8>,
        signature: Signature,
    },
    PropagateInvitationDialogResponse {
        invitation_accepted: bool,
        #[serde(with = "serde_bytes")]
        own_group_invitation_nonce: Vec<u8>,
    },
    PutGroupLogOnServer,
    InvitationRejectedBroadcast {
        group_id: GroupIdentifier,
    },
    PropagateInvitationRejected {
        group_id: GroupIdentifier,
    },
    InitiateGroupUpdate {
        group_id: GroupIdentifier,
        changeset: Changeset,
    },
    RequestServerLock {
        result: LockResult,
    },
    InitiateGroupLeave {
        group_id: GroupIdentifier,
    },
    PropagatedGroupLeave {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        group_invitation_nonce: Vec<u8>,
    },
    InitiateGroupDisband {
        group_id: GroupIdentifier,
    },
    PropagateGroupDisband {
        group_id: GroupIdentifier,
    },
    PropagatedKick {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        encrypted_administrators_chain: Vec<u8>,
        signature: Signature,
    },
    InitiateGroupReDownload {
        group_id: GroupIdentifier,
    },
    InitiateBatchKeysResend {
        contact: Identity,
        device: DeviceId,
    },
    BlobKeysBatchAfterChannelCreation {
        groups: Vec<IdentifierVersionAndKeys>,
    },
    BlobKeysAfterChannelCreation {
        group_id: GroupIdentifier,
        group_version: u64,
        blob_keys: BlobKeys,
        inviter: Identity,
    },
    InitiateTargetedPing {
        group_id: GroupIdentifier,
        pending_member: Identity,
    },
}

/// Kind of a protocol message, used to select the step handling it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageTag {
    InitiateGroupCreation,
    UploadGroupPhoto,
    UploadGroupBlob,
    FinalizeGroupCreation,
    InvitationOrMembersUpdate,
    InvitationOrMembersUpdateBroadcast,
    InvitationOrMembersUpdatePropagated,
    DownloadGroupBlob,
    FinalizeGroupUpdate,
    DeleteGroupBlobFromServer,
    DialogAcceptGroupV2Invitation,
    Ping,
    PropagatedPing,
    Kick,
    PropagateInvitationDialogResponse,
    PutGroupLogOnServer,
    InvitationRejectedBroadcast,
    PropagateInvitationRejected,
    InitiateGroupUpdate,
    RequestServerLock,
    InitiateGroupLeave,
    PropagatedGroupLeave,
    InitiateGroupDisband,
    PropagateGroupDisband,
    PropagatedKick,
    InitiateGroupReDownload,
    InitiateBatchKeysResend,
    BlobKeysBatchAfterChannelCreation,
    BlobKeysAfterChannelCreation,
    InitiateTargetedPing,
}

impl MessageTag {
    /// Numeric message id.
    pub fn id(&self) -> u8 {
        match self {
            MessageTag::InitiateGroupCreation => 0,
            MessageTag::UploadGroupPhoto => 1,
            MessageTag::UploadGroupBlob => 2,
            MessageTag::FinalizeGroupCreation => 3,
            MessageTag::InvitationOrMembersUpdate => 4,
            MessageTag::InvitationOrMembersUpdateBroadcast => 5,
            MessageTag::InvitationOrMembersUpdatePropagated => 6,
            MessageTag::DownloadGroupBlob => 7,
            MessageTag::FinalizeGroupUpdate => 8,
            MessageTag::DeleteGroupBlobFromServer => 9,
            MessageTag::DialogAcceptGroupV2Invitation => 10,
            MessageTag::Ping => 11,
            MessageTag::PropagatedPing => 12,
            MessageTag::Kick => 13,
            MessageTag::PropagateInvitationDialogResponse => 14,
            MessageTag::PutGroupLogOnServer => 15,
            MessageTag::InvitationRejectedBroadcast => 16,
            MessageTag::PropagateInvitationRejected => 17,
            MessageTag::InitiateGroupUpdate => 18,
            MessageTag::RequestServerLock => 19,
            MessageTag::InitiateGroupLeave => 20,
            MessageTag::PropagatedGroupLeave => 21,
            MessageTag::InitiateGroupDisband => 22,
            MessageTag::PropagateGroupDisband => 23,
            MessageTag::PropagatedKick => 24,
            MessageTag::InitiateGroupReDownload => 25,
            MessageTag::InitiateBatchKeysResend => 26,
            MessageTag::BlobKeysBatchAfterChannelCreation => 27,
            MessageTag::BlobKeysAfterChannelCreation => 28,
            MessageTag::InitiateTargetedPing => 30,
        }
    }

    pub fn required_channel(&self) -> RequiredChannel {
        match self {
            MessageTag::InitiateGroupCreation
            | MessageTag::FinalizeGroupCreation
            | MessageTag::FinalizeGroupUpdate
            | MessageTag::InitiateGroupUpdate
            | MessageTag::InitiateGroupLeave
            | MessageTag::InitiateGroupDisband
            | MessageTag::InitiateGroupReDownload
            | MessageTag::InitiateBatchKeysResend
            | MessageTag::BlobKeysAfterChannelCreation
            | MessageTag::InitiateTargetedPing => RequiredChannel::Local,
            MessageTag::UploadGroupPhoto
            | MessageTag::UploadGroupBlob
            | MessageTag::DownloadGroupBlob
            | MessageTag::DeleteGroupBlobFromServer
            | MessageTag::PutGroupLogOnServer
            | MessageTag::RequestServerLock => RequiredChannel::ServerQuery,
            MessageTag::DialogAcceptGroupV2Invitation => RequiredChannel::UserInterface,
            MessageTag::InvitationOrMembersUpdate
            | MessageTag::BlobKeysBatchAfterChannelCreation => RequiredChannel::AnyObliviousChannel,
            MessageTag::InvitationOrMembersUpdateBroadcast
            | MessageTag::Ping
            | MessageTag::Kick
            | MessageTag::InvitationRejectedBroadcast => RequiredChannel::AsymmetricBroadcast,
            MessageTag::InvitationOrMembersUpdatePropagated
            | MessageTag::PropagatedPing
            | MessageTag::PropagateInvitationDialogResponse
            | MessageTag::PropagateInvitationRejected
            | MessageTag::PropagatedGroupLeave
            | MessageTag::PropagateGroupDisband
            | MessageTag::PropagatedKick => RequiredChannel::AnyObliviousChannelWithOwnedDevice,
        }
    }
}

impl ProtocolMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            ProtocolMessage::InitiateGroupCreation { .. } => MessageTag::InitiateGroupCreation,
            ProtocolMessage::UploadGroupPhoto => MessageTag::UploadGroupPhoto,
            ProtocolMessage::UploadGroupBlob { .. } => MessageTag::UploadGroupBlob,
            ProtocolMessage::FinalizeGroupCreation => MessageTag::FinalizeGroupCreation,
            ProtocolMessage::InvitationOrMembersUpdate { .. } => {
                MessageTag::InvitationOrMembersUpdate
            }
            ProtocolMessage::InvitationOrMembersUpdateBroadcast { .. } => {
                MessageTag::InvitationOrMembersUpdateBroadcast
            }
            ProtocolMessage::InvitationOrMembersUpdatePropagated { .. } => {
                MessageTag::InvitationOrMembersUpdatePropagated
            }
            ProtocolMessage::DownloadGroupBlob { .. } => MessageTag::DownloadGroupBlob,
            ProtocolMessage::FinalizeGroupUpdate => MessageTag::FinalizeGroupUpdate,
            ProtocolMessage::DeleteGroupBlobFromServer { .. } => {
                MessageTag::DeleteGroupBlobFromServer
            }
            ProtocolMessage::DialogAcceptGroupV2Invitation { .. } => {
                MessageTag::DialogAcceptGroupV2Invitation
            }
            ProtocolMessage::Ping { .. } => MessageTag::Ping,
            ProtocolMessage::PropagatedPing { .. } => MessageTag::PropagatedPing,
            ProtocolMessage::Kick { .. } => MessageTag::Kick,
            ProtocolMessage::PropagateInvitationDialogResponse { .. } => {
                MessageTag::PropagateInvitationDialogResponse
            }
            ProtocolMessage::PutGroupLogOnServer => MessageTag::PutGroupLogOnServer,
            ProtocolMessage::InvitationRejectedBroadcast { .. } => {
                MessageTag::InvitationRejectedBroadcast
            }
            ProtocolMessage::PropagateInvitationRejected { .. } => {
                MessageTag::PropagateInvitationRejected
            }
            ProtocolMessage::InitiateGroupUpdate { .. } => MessageTag::InitiateGroupUpdate,
            ProtocolMessage::RequestServerLock { .. } => MessageTag::RequestServerLock,
            ProtocolMessage::InitiateGroupLeave { .. } => MessageTag::InitiateGroupLeave,
            ProtocolMessage::PropagatedGroupLeave { .. } => MessageTag::PropagatedGroupLeave,
            ProtocolMessage::InitiateGroupDisband { .. } => MessageTag::InitiateGroupDisband,
            ProtocolMessage::PropagateGroupDisband { .. } => MessageTag::PropagateGroupDisband,
            ProtocolMessage::PropagatedKick { .. } => MessageTag::PropagatedKick,
            ProtocolMessage::InitiateGroupReDownload { .. } => MessageTag::InitiateGroupReDownload,
            ProtocolMessage::InitiateBatchKeysResend { .. } => MessageTag::InitiateBatchKeysResend,
            ProtocolMessage::BlobKeysBatchAfterChannelCreation { .. } => {
                MessageTag::BlobKeysBatchAfterChannelCreation
            }
            ProtocolMessage::BlobKeysAfterChannelCreation { .. } => {
                MessageTag::BlobKeysAfterChannelCreation
            }
            ProtocolMessage::InitiateTargetedPing { .. } => MessageTag::InitiateTargetedPing,
        }
    }
}

/// Message delivered to a protocol instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub protocol_instance_id: ProtocolInstanceId,
    pub channel: ReceptionChannel,
    pub message: ProtocolMessage,
}

impl Inbound {
    pub fn new(
        protocol_instance_id: ProtocolInstanceId,
        channel: ReceptionChannel,
        message: ProtocolMessage,
    ) -> Self {
        Self {
            protocol_instance_id,
            channel,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::cbor::{decode_cbor, encode_cbor};
    use crate::channel::RequiredChannel;
    use crate::identifier::{Category, GroupIdentifier, GroupUid};
    use crate::seed::{BlobKeys, Seed};

    use super::{MessageTag, ProtocolMessage};

    #[test]
    fn message_ids_are_unique() {
        let tags = [
            MessageTag::InitiateGroupCreation,
            MessageTag::UploadGroupPhoto,
            MessageTag::UploadGroupBlob,
            MessageTag::FinalizeGroupCreation,
            MessageTag::InvitationOrMembersUpdate,
            MessageTag::InvitationOrMembersUpdateBroadcast,
            MessageTag::InvitationOrMembersUpdatePropagated,
            MessageTag::DownloadGroupBlob,
            MessageTag::FinalizeGroupUpdate,
            MessageTag::DeleteGroupBlobFromServer,
            MessageTag::DialogAcceptGroupV2Invitation,
            MessageTag::Ping,
            MessageTag::PropagatedPing,
            MessageTag::Kick,
            MessageTag::PropagateInvitationDialogResponse,
            MessageTag::PutGroupLogOnServer,
            MessageTag::InvitationRejectedBroadcast,
            MessageTag::PropagateInvitationRejected,
            MessageTag::InitiateGroupUpdate,
            MessageTag::RequestServerLock,
            MessageTag::InitiateGroupLeave,
            MessageTag::PropagatedGroupLeave,
            MessageTag::InitiateGroupDisband,
            MessageTag::PropagateGroupDisband,
            MessageTag::PropagatedKick,
            MessageTag::InitiateGroupReDownload,
            MessageTag::InitiateBatchKeysResend,
            MessageTag::BlobKeysBatchAfterChannelCreation,
            MessageTag::BlobKeysAfterChannelCreation,
            MessageTag::InitiateTargetedPing,
        ];
        let ids: BTreeSet<u8> = tags.iter().map(MessageTag::id).collect();
        assert_eq!(ids.len(), tags.len());
        assert!(!ids.contains(&29));
    }

    #[test]
    fn broadcast_update_decodes() {
        let message = ProtocolMessage::InvitationOrMembersUpdateBroadcast {
            group_id: GroupIdentifier::new(GroupUid::from_bytes([9; 32]), "server", Category::Server),
            group_version: 3,
            blob_keys: BlobKeys::new(None, Seed::from_bytes([1; 32]), None),
        };
        let bytes = encode_cbor(&message).unwrap();
        let decoded: ProtocolMessage = decode_cbor(&bytes[..]).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.tag().required_channel(), RequiredChannel::AsymmetricBroadcast);
    }
}
