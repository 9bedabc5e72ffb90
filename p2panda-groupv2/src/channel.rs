// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channels messages are received on and sent through.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::blob::GroupMember;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::{DeviceId, DialogId, Identity};
use crate::message::ProtocolMessage;
use crate::query::ServerQuery;

/// Channel an inbound message was delivered on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionChannel {
    /// Posted by this device to itself.
    Local,

    /// Pairwise authenticated channel with a contact device.
    ObliviousChannel {
        remote_identity: Identity,
        remote_device: DeviceId,
    },

    /// Unauthenticated broadcast, the sender is unknown.
    AsymmetricBroadcast,

    /// Pairwise authenticated channel with another device of the owned identity.
    ObliviousChannelWithOwnedDevice { remote_device: DeviceId },

    /// Response of the blob server.
    ServerQuery,

    /// Answer of the user to a dialog.
    UserInterface,
}

/// Channel a message kind must arrive on to be processed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequiredChannel {
    Local,
    ServerQuery,
    UserInterface,
    AnyObliviousChannel,
    AsymmetricBroadcast,
    AnyObliviousChannelWithOwnedDevice,
}

impl ReceptionChannel {
    pub fn satisfies(&self, required: RequiredChannel) -> bool {
        matches!(
            (self, required),
            (ReceptionChannel::Local, RequiredChannel::Local)
                | (ReceptionChannel::ServerQuery, RequiredChannel::ServerQuery)
                | (ReceptionChannel::UserInterface, RequiredChannel::UserInterface)
                | (
                    ReceptionChannel::ObliviousChannel { .. },
                    RequiredChannel::AnyObliviousChannel
                )
                | (
                    ReceptionChannel::AsymmetricBroadcast,
                    RequiredChannel::AsymmetricBroadcast
                )
                | (
                    ReceptionChannel::ObliviousChannelWithOwnedDevice { .. },
                    RequiredChannel::AnyObliviousChannelWithOwnedDevice
                )
        )
    }
}

/// Channel an outbound protocol message is posted on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendChannel {
    /// Re-injected into this device.
    Local,

    /// Pairwise authenticated channels to the given devices of an identity. The devices may
    /// belong to the owned identity.
    ObliviousChannel {
        to: Identity,
        device_uids: BTreeSet<DeviceId>,
    },

    /// Unauthenticated broadcast to all devices of an identity.
    AsymmetricBroadcast { to: Identity },

    /// Every other device of the owned identity.
    AllOwnedDevices,
}

/// Prompt shown to the user, identified by a dialog id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialog {
    /// Asks the user to accept or reject a group invitation.
    AcceptInvite {
        group_id: GroupIdentifier,
        inviter: Identity,
        group_version: u64,
        #[serde(with = "serde_bytes")]
        serialized_group_core_details: Vec<u8>,
        own_raw_permissions: BTreeSet<String>,
        other_members: Vec<GroupMember>,
    },

    /// Invitation is being re-synchronised and cannot be answered for now.
    FreezeInvite {
        group_id: GroupIdentifier,
        inviter: Identity,
    },

    /// Withdraws the dialog.
    Delete,
}

/// Everything a protocol step hands to the outside world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outbound {
    Protocol {
        protocol_instance_id: ProtocolInstanceId,
        channel: SendChannel,
        message: ProtocolMessage,
    },
    ServerQuery {
        protocol_instance_id: ProtocolInstanceId,
        query: ServerQuery,
    },
    Dialog {
        protocol_instance_id: ProtocolInstanceId,
        dialog_id: DialogId,
        dialog: Dialog,
    },
}
