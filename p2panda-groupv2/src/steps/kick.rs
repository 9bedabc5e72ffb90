// SPDX-License-Identifier: MIT OR Apache-2.0

//! Removal of the owned identity from a group by one of its administrators.
use tracing::debug;

use crate::chain::AdministratorsChain;
use crate::challenge::Challenge;
use crate::channel::Dialog;
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::identifier::GroupIdentifier;
use crate::message::{Inbound, ProtocolMessage};
use crate::seed::Seed;
use crate::state::ProtocolState;
use crate::steps::{fallback_state, propagate_to_owned_devices, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn get_kicked<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let (group_id, encrypted_administrators_chain, signature, propagated) = match inbound.message
    {
        ProtocolMessage::Kick {
            group_id,
            encrypted_administrators_chain,
            signature,
        } => (group_id, encrypted_administrators_chain, signature, false),
        ProtocolMessage::PropagatedKick {
            group_id,
            encrypted_administrators_chain,
            signature,
        } => (group_id, encrypted_administrators_chain, signature, true),
        _ => return unexpected_message(state),
    };
    let protocol_instance_id = inbound.protocol_instance_id;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::CorrelationMismatch,
        ));
    }

    if !propagated {
        propagate_to_owned_devices(
            collaborators,
            protocol_instance_id,
            ProtocolMessage::PropagatedKick {
                group_id: group_id.clone(),
                encrypted_administrators_chain: encrypted_administrators_chain.clone(),
                signature: signature.clone(),
            },
        )?;
    }

    let (own_group_invitation_nonce, blob_main_seed, trusted_chain) =
        match known_group(collaborators, &state, &group_id)? {
            Ok(known) => known,
            Err(reason) => return Ok(Outcome::discarded(fallback_state(state), reason)),
        };

    let received_chain = match AdministratorsChain::decrypt_and_check_integrity(
        &encrypted_administrators_chain,
        &blob_main_seed,
        &group_id.group_uid,
    ) {
        Ok(chain) => chain,
        Err(err) => {
            debug!("invalid administrators chain in kick from group {group_id}: {err}");
            return Ok(Outcome::discarded(
                fallback_state(state),
                Discard::InvalidAdministratorsChain,
            ));
        }
    };
    if !trusted_chain.is_prefix_of(&received_chain) {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::ForeignAdministratorsChain,
        ));
    }

    let challenge = Challenge::GroupKick {
        encrypted_administrators_chain,
        group_invitation_nonce: own_group_invitation_nonce,
    };
    if !received_chain
        .all_current_administrators()
        .iter()
        .any(|administrator| challenge.verify(&signature, administrator))
    {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::InvalidSignature,
        ));
    }

    let dialog_id = match &state {
        ProtocolState::InvitationReceived(invitation) => Some(invitation.dialog_id),
        ProtocolState::DownloadingGroupBlob(downloading) => Some(downloading.dialog_id),
        ProtocolState::NeedMoreSeeds(need_more_seeds) => Some(need_more_seeds.dialog_id),
        _ => None,
    };
    if let Some(dialog_id) = dialog_id {
        collaborators.dialog(protocol_instance_id, dialog_id, Dialog::Delete)?;
    }

    collaborators
        .store
        .delete_group(&group_id)
        .map_err(store_error)?;
    debug!("kicked from group {group_id}");

    // A download in progress may belong to a new invitation sent after the kick, it keeps
    // running so that invitation can still be shown.
    match state {
        state @ (ProtocolState::DownloadingGroupBlob(_) | ProtocolState::NeedMoreSeeds(_)) => {
            Ok(Outcome::new(state))
        }
        _ => Ok(Outcome::finished()),
    }
}

/// Invitation nonce, main seed and administrators chain we hold for the group.
///
/// A pending invitation carries them itself, otherwise they come from the store.
fn known_group<S, C, X>(
    collaborators: &Collaborators<'_, S, C, X>,
    state: &ProtocolState,
    group_id: &GroupIdentifier,
) -> Result<Result<(Vec<u8>, Seed, AdministratorsChain), Discard>, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    if let ProtocolState::InvitationReceived(invitation) = state {
        let Some((_, nonce)) = invitation
            .server_blob
            .own_permissions_and_nonce(&collaborators.owned_identity)
        else {
            return Ok(Err(Discard::ForeignInvitationNonce));
        };
        let Some(seed) = invitation.blob_keys.blob_main_seed.clone() else {
            return Ok(Err(Discard::MissingKeys));
        };
        return Ok(Ok((
            nonce,
            seed,
            invitation.server_blob.administrators_chain.clone(),
        )));
    }

    let store = &collaborators.store;
    if !store.group_exists(group_id).map_err(store_error)? {
        return Ok(Err(Discard::GroupNotFound));
    }
    let nonce = store
        .own_group_invitation_nonce(group_id)
        .map_err(store_error)?;
    let seed = store
        .blob_keys(group_id)
        .map_err(store_error)?
        .and_then(|blob_keys| blob_keys.blob_main_seed);
    let chain = store
        .administrators_chain(group_id)
        .map_err(store_error)?;
    match (nonce, seed, chain) {
        (Some(nonce), Some(seed), Some(chain)) => Ok(Ok((nonce, seed, chain))),
        _ => Ok(Err(Discard::MissingKeys)),
    }
}
