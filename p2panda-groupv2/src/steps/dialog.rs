// SPDX-License-Identifier: MIT OR Apache-2.0

//! Answers of the user to an invitation, given on this device or on another owned device.
use std::collections::BTreeSet;

use tracing::debug;

use crate::challenge::Challenge;
use crate::channel::{Dialog, SendChannel};
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, store_error};
use crate::event::Event;
use crate::identifier::GroupIdentifier;
use crate::identity::{DialogId, Identity};
use crate::message::{Inbound, ProtocolMessage};
use crate::query::ServerQuery;
use crate::state::{ProtocolState, RejectingInvitationOrLeavingGroup};
use crate::steps::{send_ping, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn process_invitation_dialog_response<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let owned_identity = collaborators.owned_identity;
    let protocol_instance_id = inbound.protocol_instance_id;

    let ids: Option<(GroupIdentifier, DialogId)> = match &state {
        ProtocolState::InvitationReceived(invitation) => {
            Some((invitation.group_id.clone(), invitation.dialog_id))
        }
        ProtocolState::DownloadingGroupBlob(downloading) => {
            Some((downloading.group_id.clone(), downloading.dialog_id))
        }
        ProtocolState::NeedMoreSeeds(need_more_seeds) => {
            Some((need_more_seeds.group_id.clone(), need_more_seeds.dialog_id))
        }
        _ => None,
    };
    let Some((group_id, dialog_id)) = ids else {
        return unexpected_message(state);
    };

    let (invitation_accepted, propagated_nonce) = match inbound.message {
        ProtocolMessage::DialogAcceptGroupV2Invitation {
            dialog_id: answered_dialog_id,
            invitation_accepted,
        } => {
            if answered_dialog_id != dialog_id {
                collaborators.dialog(protocol_instance_id, answered_dialog_id, Dialog::Delete)?;
                return Ok(Outcome::discarded(state, Discard::DialogMismatch));
            }
            (invitation_accepted, None)
        }
        ProtocolMessage::PropagateInvitationDialogResponse {
            invitation_accepted,
            own_group_invitation_nonce,
        } => (invitation_accepted, Some(own_group_invitation_nonce)),
        _ => return unexpected_message(state),
    };

    // Our nonce and the members to notify come from the blob, or from the version we knew
    // before the invitation was re-downloaded.
    let own_nonce_and_members: Option<(Vec<u8>, BTreeSet<Identity>)> = match &state {
        ProtocolState::InvitationReceived(invitation) => invitation
            .server_blob
            .own_permissions_and_nonce(&owned_identity)
            .map(|(_, nonce)| {
                let members = invitation
                    .server_blob
                    .other_group_members(&owned_identity)
                    .into_iter()
                    .map(|member| member.identity)
                    .collect();
                (nonce, members)
            }),
        ProtocolState::DownloadingGroupBlob(downloading) => downloading
            .last_known_own_nonce_and_members
            .clone()
            .map(|known| (known.own_group_invitation_nonce, known.other_members)),
        ProtocolState::NeedMoreSeeds(need_more_seeds) => need_more_seeds
            .last_known_own_nonce_and_members
            .clone()
            .map(|known| (known.own_group_invitation_nonce, known.other_members)),
        _ => None,
    };
    let Some((own_group_invitation_nonce, members_to_notify)) = own_nonce_and_members else {
        collaborators.dialog(protocol_instance_id, dialog_id, Dialog::Delete)?;
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::ForeignInvitationNonce,
        ));
    };

    match &propagated_nonce {
        Some(nonce) if nonce != &own_group_invitation_nonce => {
            return Ok(Outcome::discarded(state, Discard::ForeignInvitationNonce));
        }
        Some(_) => (),
        None => {
            let other_devices = collaborators
                .store
                .other_owned_device_uids()
                .map_err(store_error)?;
            if !other_devices.is_empty() {
                collaborators.send(
                    protocol_instance_id,
                    SendChannel::ObliviousChannel {
                        to: owned_identity,
                        device_uids: other_devices,
                    },
                    ProtocolMessage::PropagateInvitationDialogResponse {
                        invitation_accepted,
                        own_group_invitation_nonce: own_group_invitation_nonce.clone(),
                    },
                )?;
            }
        }
    }

    if !invitation_accepted {
        let signature = collaborators.solve(&Challenge::GroupLeaveNonce {
            group_id: group_id.clone(),
            nonce: own_group_invitation_nonce,
        })?;
        collaborators.query(
            protocol_instance_id,
            ServerQuery::PutGroupLog {
                group_id: group_id.clone(),
                signature,
            },
        )?;
        collaborators.dialog(protocol_instance_id, dialog_id, Dialog::Delete)?;

        debug!("rejected invitation to group {group_id}");
        return Ok(Outcome::new(
            ProtocolState::RejectingInvitationOrLeavingGroup(RejectingInvitationOrLeavingGroup {
                group_id,
                members_to_notify,
            }),
        ));
    }

    // Only an invitation with a decrypted blob can be accepted.
    let ProtocolState::InvitationReceived(invitation) = state else {
        return Ok(Outcome::discarded(state, Discard::BlobNotAvailable));
    };

    let server_blob = invitation
        .server_blob
        .with_forced_checked_administrators_chain_integrity();
    collaborators
        .store
        .create_group_joined_by_owned_identity(&group_id, &server_blob, &invitation.blob_keys)
        .map_err(store_error)?;

    let mut outcome = Outcome::finished();
    if let Some(server_photo_info) = collaborators
        .store
        .photo_needs_download(&group_id)
        .map_err(store_error)?
    {
        outcome = outcome.with_event(Event::PhotoDownloadRequested {
            group_id: group_id.clone(),
            server_photo_info,
        });
    }

    // Members who already joined answer with a ping of their own.
    for member in server_blob.other_group_members(&owned_identity) {
        send_ping(
            collaborators,
            &group_id,
            &own_group_invitation_nonce,
            &member.identity,
            false,
        )?;
    }

    collaborators.dialog(protocol_instance_id, dialog_id, Dialog::Delete)?;

    debug!("joined group {group_id}");
    Ok(outcome.with_event(Event::GroupMembersChanged { group_id }))
}

pub(crate) fn notify_members_of_rejection<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::RejectingInvitationOrLeavingGroup(rejecting) = state else {
        return unexpected_message(state);
    };

    for member in rejecting.members_to_notify {
        collaborators.send(
            inbound.protocol_instance_id,
            SendChannel::AsymmetricBroadcast { to: member },
            ProtocolMessage::InvitationRejectedBroadcast {
                group_id: rejecting.group_id.clone(),
            },
        )?;
    }

    Ok(Outcome::finished())
}
