// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resends the keys of every shared group once a new pairwise channel with a contact exists.
use std::collections::BTreeSet;

use crate::channel::{ReceptionChannel, SendChannel};
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, store_error};
use crate::identifier::ProtocolInstanceId;
use crate::message::{Inbound, ProtocolMessage};
use crate::state::ProtocolState;
use crate::steps::unexpected_message;
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn prepare_batch_keys<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolMessage::InitiateBatchKeysResend { contact, device } = inbound.message else {
        return unexpected_message(state);
    };

    let groups = collaborators
        .store
        .groups_shared_with(&contact)
        .map_err(store_error)?;
    if !groups.is_empty() {
        collaborators.send(
            inbound.protocol_instance_id,
            SendChannel::ObliviousChannel {
                to: contact,
                device_uids: BTreeSet::from([device]),
            },
            ProtocolMessage::BlobKeysBatchAfterChannelCreation { groups },
        )?;
    }

    Ok(Outcome::finished())
}

/// Splits a received batch into one local message per group, each handled by the instance of
/// that group.
pub(crate) fn process_batch_keys<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolMessage::BlobKeysBatchAfterChannelCreation { groups } = inbound.message else {
        return unexpected_message(state);
    };
    let ReceptionChannel::ObliviousChannel {
        remote_identity, ..
    } = inbound.channel
    else {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::UnknownSender,
        ));
    };

    for group in groups {
        collaborators.send(
            ProtocolInstanceId::for_group(&group.group_identifier)?,
            SendChannel::Local,
            ProtocolMessage::BlobKeysAfterChannelCreation {
                group_id: group.group_identifier,
                group_version: group.group_version,
                blob_keys: group.blob_keys,
                inviter: remote_identity,
            },
        )?;
    }

    Ok(Outcome::finished())
}
