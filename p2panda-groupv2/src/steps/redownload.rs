// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fetches the latest blob of a group again, on request or when a member rejected an invitation.
use crate::channel::Dialog;
use crate::collected::InvitationCollectedData;
use crate::dispatch::{Abort, Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::identifier::Category;
use crate::identity::Uid;
use crate::message::{Inbound, ProtocolMessage};
use crate::query::ServerQuery;
use crate::state::{DownloadingGroupBlob, OwnNonceAndMembers, ProtocolState};
use crate::steps::{fallback_state, propagate_to_owned_devices, send_ping, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn initiate_blob_re_download<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let (group_id, propagate, ping_other_members) = match inbound.message {
        ProtocolMessage::InitiateGroupReDownload { group_id } => (group_id, true, true),
        ProtocolMessage::InvitationRejectedBroadcast { group_id } => (group_id, true, false),
        ProtocolMessage::PropagateInvitationRejected { group_id } => (group_id, false, false),
        _ => return unexpected_message(state),
    };
    let protocol_instance_id = inbound.protocol_instance_id;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::CorrelationMismatch,
        ));
    }

    if propagate {
        propagate_to_owned_devices(
            collaborators,
            protocol_instance_id,
            ProtocolMessage::PropagateInvitationRejected {
                group_id: group_id.clone(),
            },
        )?;
    }

    // Keycloak groups have no blob on the server.
    if group_id.category != Category::Server {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::KeycloakGroup,
        ));
    }

    let owned_identity = collaborators.owned_identity;
    let (dialog_id, collected_data, last_known_own_nonce_and_members, lease) = match state {
        ProtocolState::Initial => {
            let Some(blob_keys) = collaborators
                .store
                .blob_keys(&group_id)
                .map_err(store_error)?
            else {
                return Ok(Outcome::aborted(Abort::GroupNotFound));
            };
            let lease = collaborators
                .store
                .freeze_group(&group_id)
                .map_err(store_error)?;

            if ping_other_members {
                if let Some(own_group_invitation_nonce) = collaborators
                    .store
                    .own_group_invitation_nonce(&group_id)
                    .map_err(store_error)?
                {
                    let others = collaborators
                        .store
                        .other_members(&group_id)
                        .map_err(store_error)?;
                    for member in others {
                        send_ping(
                            collaborators,
                            &group_id,
                            &own_group_invitation_nonce,
                            &member.identity,
                            false,
                        )?;
                    }
                }
            }

            (
                Uid::random(collaborators.rng)?,
                InvitationCollectedData::new()
                    .inserting_blob_keys_candidates(&blob_keys, Some(&owned_identity)),
                None,
                Some(lease),
            )
        }
        ProtocolState::InvitationReceived(invitation) => {
            let own_nonce = invitation
                .server_blob
                .own_permissions_and_nonce(&owned_identity)
                .map(|(_, nonce)| nonce);
            if own_nonce.is_some() {
                collaborators.dialog(
                    protocol_instance_id,
                    invitation.dialog_id,
                    Dialog::FreezeInvite {
                        group_id: group_id.clone(),
                        inviter: invitation.inviter,
                    },
                )?;
            }
            let last_known = own_nonce.map(|own_group_invitation_nonce| OwnNonceAndMembers {
                own_group_invitation_nonce,
                other_members: invitation
                    .server_blob
                    .other_group_members(&owned_identity)
                    .into_iter()
                    .map(|member| member.identity)
                    .collect(),
            });
            (
                invitation.dialog_id,
                InvitationCollectedData::new().inserting_blob_keys_candidates(
                    &invitation.blob_keys,
                    Some(&invitation.inviter),
                ),
                last_known,
                None,
            )
        }
        state => return unexpected_message(state),
    };

    let query_id = Uid::random(collaborators.rng)?;
    collaborators.query(
        protocol_instance_id,
        ServerQuery::GetGroupBlob {
            group_id: group_id.clone(),
            query_id,
        },
    )?;

    Ok(Outcome::new(ProtocolState::DownloadingGroupBlob(
        DownloadingGroupBlob {
            group_id,
            dialog_id,
            collected_data,
            expected_query_id: query_id,
            last_known_own_nonce_and_members,
            lease,
        },
    )))
}
