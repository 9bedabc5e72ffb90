// SPDX-License-Identifier: MIT OR Apache-2.0

//! Voluntary departure of the owned identity from a group.
//!
//! The device the user left on signs a leave log entry with our invitation nonce and uploads it,
//! other members drop us from the blob the next time they consolidate it with the log.
use std::collections::BTreeSet;

use tracing::debug;

use crate::challenge::Challenge;
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::identifier::Category;
use crate::identity::Identity;
use crate::message::{Inbound, ProtocolMessage};
use crate::query::ServerQuery;
use crate::state::{ProtocolState, RejectingInvitationOrLeavingGroup};
use crate::steps::{fallback_state, propagate_to_owned_devices, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn leave_group<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let (group_id, propagated_nonce) = match inbound.message {
        ProtocolMessage::InitiateGroupLeave { group_id } => (group_id, None),
        ProtocolMessage::PropagatedGroupLeave {
            group_id,
            group_invitation_nonce,
        } => (group_id, Some(group_invitation_nonce)),
        _ => return unexpected_message(state),
    };
    let protocol_instance_id = inbound.protocol_instance_id;
    let owned_identity = collaborators.owned_identity;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::CorrelationMismatch,
        ));
    }

    // Membership of keycloak groups is managed by the identity provider.
    if group_id.category == Category::Keycloak {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::KeycloakGroup,
        ));
    }

    let Some(own_group_invitation_nonce) = collaborators
        .store
        .own_group_invitation_nonce(&group_id)
        .map_err(store_error)?
    else {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::GroupNotFound,
        ));
    };

    if let Some(nonce) = &propagated_nonce {
        if nonce != &own_group_invitation_nonce {
            return Ok(Outcome::discarded(
                fallback_state(state),
                Discard::ForeignInvitationNonce,
            ));
        }
    }

    // A group must keep at least one administrator who confirmed membership.
    let administrators = collaborators
        .store
        .non_pending_administrators(&group_id)
        .map_err(store_error)?;
    if administrators.contains(&owned_identity) && administrators.len() == 1 {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::SoleAdministrator,
        ));
    }

    if propagated_nonce.is_some() {
        collaborators
            .store
            .delete_group(&group_id)
            .map_err(store_error)?;
        debug!("left group {group_id} from another device");
        return Ok(Outcome::finished());
    }

    propagate_to_owned_devices(
        collaborators,
        protocol_instance_id,
        ProtocolMessage::PropagatedGroupLeave {
            group_id: group_id.clone(),
            group_invitation_nonce: own_group_invitation_nonce.clone(),
        },
    )?;

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

    // Members have to be collected before the group is gone.
    let members_to_notify: BTreeSet<Identity> = collaborators
        .store
        .other_members(&group_id)
        .map_err(store_error)?
        .into_iter()
        .map(|member| member.identity)
        .collect();
    collaborators
        .store
        .delete_group(&group_id)
        .map_err(store_error)?;

    debug!("left group {group_id}");
    Ok(Outcome::new(
        ProtocolState::RejectingInvitationOrLeavingGroup(RejectingInvitationOrLeavingGroup {
            group_id,
            members_to_notify,
        }),
    ))
}
