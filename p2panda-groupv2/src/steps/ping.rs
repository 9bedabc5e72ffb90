// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pings confirm membership between two members of a group.
//!
//! A ping is a signature over the group identifier, the sender's invitation nonce and the
//! recipient. Knowing the nonce proves the sender received the blob, so the recipient moves
//! the sender from the pending members to the members.
use tracing::debug;

use crate::challenge::Challenge;
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::message::{Inbound, ProtocolMessage};
use crate::state::ProtocolState;
use crate::steps::{propagate_to_owned_devices, send_ping, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn process_ping<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let (group_id, group_invitation_nonce, signature, is_response, propagated) =
        match inbound.message {
            ProtocolMessage::Ping {
                group_id,
                group_invitation_nonce,
                signature,
                is_response,
            } => (group_id, group_invitation_nonce, signature, is_response, false),
            ProtocolMessage::PropagatedPing {
                group_id,
                group_invitation_nonce,
                signature,
                is_response,
            } => (group_id, group_invitation_nonce, signature, is_response, true),
            _ => return unexpected_message(state),
        };

    if !correlates(&inbound.protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::CorrelationMismatch,
        ));
    }

    if collaborators
        .store
        .ping_signature_already_received(&group_id, &signature)
        .map_err(store_error)?
    {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::ReplayedSignature,
        ));
    }

    if !propagated {
        propagate_to_owned_devices(
            collaborators,
            inbound.protocol_instance_id,
            ProtocolMessage::PropagatedPing {
                group_id: group_id.clone(),
                group_invitation_nonce: group_invitation_nonce.clone(),
                signature: signature.clone(),
                is_response,
            },
        )?;
    }

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::GroupNotFound,
        ));
    }

    // Nonces are random, in practice at most one member holds a given one.
    let candidates: Vec<_> = collaborators
        .store
        .other_members(&group_id)
        .map_err(store_error)?
        .into_iter()
        .filter(|member| member.group_invitation_nonce == group_invitation_nonce)
        .collect();
    if candidates.is_empty() {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::UnknownInvitationNonce,
        ));
    }

    let challenge = Challenge::GroupJoinNonce {
        group_id: group_id.clone(),
        nonce: group_invitation_nonce,
        recipient: collaborators.owned_identity,
    };
    let Some(signer) = candidates
        .into_iter()
        .find(|member| challenge.verify(&signature, &member.identity))
    else {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::InvalidSignature,
        ));
    };

    collaborators
        .store
        .record_ping_signature(&group_id, &signature)
        .map_err(store_error)?;
    if signer.is_pending {
        collaborators
            .store
            .move_pending_member_to_members(&group_id, &signer.identity)
            .map_err(store_error)?;
        debug!("{} confirmed membership of group {group_id}", signer.identity);
    }

    if !is_response {
        if let Some(own_group_invitation_nonce) = collaborators
            .store
            .own_group_invitation_nonce(&group_id)
            .map_err(store_error)?
        {
            send_ping(
                collaborators,
                &group_id,
                &own_group_invitation_nonce,
                &signer.identity,
                true,
            )?;
        }
    }

    Ok(Outcome::finished())
}

pub(crate) fn send_targeted_ping<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolMessage::InitiateTargetedPing {
        group_id,
        pending_member,
    } = inbound.message
    else {
        return unexpected_message(state);
    };

    if !correlates(&inbound.protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::CorrelationMismatch,
        ));
    }

    let Some(own_group_invitation_nonce) = collaborators
        .store
        .own_group_invitation_nonce(&group_id)
        .map_err(store_error)?
    else {
        return Ok(Outcome::discarded(
            ProtocolState::Final,
            Discard::GroupNotFound,
        ));
    };

    send_ping(
        collaborators,
        &group_id,
        &own_group_invitation_nonce,
        &pending_member,
        false,
    )?;

    Ok(Outcome::finished())
}
