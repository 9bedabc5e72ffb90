// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deletion of a whole group by one of its administrators.
use tracing::debug;

use crate::challenge::Challenge;
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::message::{Inbound, ProtocolMessage};
use crate::query::ServerQuery;
use crate::state::{DisbandingGroup, ProtocolState};
use crate::steps::{fallback_state, kick_members, propagate_to_owned_devices, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn disband_group<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let (group_id, propagated) = match inbound.message {
        ProtocolMessage::InitiateGroupDisband { group_id } => (group_id, false),
        ProtocolMessage::PropagateGroupDisband { group_id } => (group_id, true),
        _ => return unexpected_message(state),
    };
    let protocol_instance_id = inbound.protocol_instance_id;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::CorrelationMismatch,
        ));
    }

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::GroupNotFound,
        ));
    }

    let is_administrator = collaborators
        .store
        .administrators_chain(&group_id)
        .map_err(store_error)?
        .is_some_and(|chain| {
            chain
                .all_current_administrators()
                .contains(&collaborators.owned_identity)
        });
    if !is_administrator {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::NotAnAdministrator,
        ));
    }

    // The main seed is needed to kick the other members once the blob is gone.
    let blob_keys = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?;
    let Some((Some(admin_key), Some(blob_main_seed))) = blob_keys
        .map(|blob_keys| (blob_keys.group_admin_private_key, blob_keys.blob_main_seed))
    else {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::MissingKeys,
        ));
    };

    if propagated {
        collaborators
            .store
            .delete_group(&group_id)
            .map_err(store_error)?;
        debug!("group {group_id} was disbanded on another device");
        return Ok(Outcome::finished());
    }

    let signature = Challenge::GroupDelete.sign_with_admin_key(&admin_key)?;
    collaborators.query(
        protocol_instance_id,
        ServerQuery::DeleteGroupBlob {
            group_id: group_id.clone(),
            signature,
        },
    )?;
    let lease = collaborators
        .store
        .freeze_group(&group_id)
        .map_err(store_error)?;

    Ok(Outcome::new(ProtocolState::DisbandingGroup(
        DisbandingGroup {
            group_id,
            blob_main_seed,
            lease,
        },
    )))
}

pub(crate) fn finalize_group_disband<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::DisbandingGroup(disbanding) = state else {
        return unexpected_message(state);
    };
    let ProtocolMessage::DeleteGroupBlobFromServer { success } = inbound.message else {
        return unexpected_message(ProtocolState::DisbandingGroup(disbanding));
    };
    let group_id = disbanding.group_id;

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return Ok(Outcome::finished());
    }

    if !success {
        debug!("server refused to delete group {group_id}");
        collaborators
            .store
            .unfreeze_group(&disbanding.lease)
            .map_err(store_error)?;
        return Ok(Outcome::finished());
    }

    propagate_to_owned_devices(
        collaborators,
        inbound.protocol_instance_id,
        ProtocolMessage::PropagateGroupDisband {
            group_id: group_id.clone(),
        },
    )?;

    let members = collaborators
        .store
        .other_members(&group_id)
        .map_err(store_error)?;
    if !members.is_empty() {
        let Some(administrators_chain) = collaborators
            .store
            .administrators_chain(&group_id)
            .map_err(store_error)?
        else {
            return Ok(Outcome::discarded(
                ProtocolState::Final,
                Discard::GroupNotFound,
            ));
        };
        kick_members(
            collaborators,
            &group_id,
            &administrators_chain,
            &disbanding.blob_main_seed,
            members
                .into_iter()
                .map(|member| (member.identity, member.group_invitation_nonce)),
        )?;
    }

    collaborators
        .store
        .delete_group(&group_id)
        .map_err(store_error)?;
    debug!("disbanded group {group_id}");

    Ok(Outcome::finished())
}
