// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol steps, one function per transition of the state machine.
//!
//! Every step has the same signature so it can be stored in the dispatch table. A step receives
//! the current state by value, posts outbound messages through the collaborators and returns
//! the next state.
pub(crate) mod batch_keys;
pub(crate) mod creation;
pub(crate) mod dialog;
pub(crate) mod disband;
pub(crate) mod download;
pub(crate) mod invitation;
pub(crate) mod kick;
pub(crate) mod leave;
pub(crate) mod ping;
pub(crate) mod redownload;
pub(crate) mod update;

use crate::chain::AdministratorsChain;
use crate::challenge::Challenge;
use crate::channel::SendChannel;
use crate::dispatch::{Abort, Collaborators, Discard, Outcome, ProtocolError, store_error};
use crate::event::Event;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::Identity;
use crate::message::ProtocolMessage;
use crate::seed::Seed;
use crate::state::ProtocolState;
use crate::traits::{ChannelPost, FreezeLease, GroupStore, SolveChallenge};

/// State a step falls back to when it ignores a message.
///
/// Instances started by the message itself end right away, every other instance keeps waiting
/// in its current state.
pub(crate) fn fallback_state(state: ProtocolState) -> ProtocolState {
    match state {
        ProtocolState::Initial => ProtocolState::Final,
        state => state,
    }
}

/// Drops a message which does not match the step it was dispatched to.
pub(crate) fn unexpected_message(state: ProtocolState) -> Result<Outcome, ProtocolError> {
    Ok(Outcome::discarded(state, Discard::NoStep))
}

/// Forwards a message to the other devices of the owned identity, if there are any.
pub(crate) fn propagate_to_owned_devices<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    protocol_instance_id: ProtocolInstanceId,
    message: ProtocolMessage,
) -> Result<(), ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let other_devices = collaborators
        .store
        .other_owned_device_uids()
        .map_err(store_error)?;
    if other_devices.is_empty() {
        return Ok(());
    }
    collaborators.send(protocol_instance_id, SendChannel::AllOwnedDevices, message)
}

/// Proves knowledge of our invitation nonce to one other member of the group.
pub(crate) fn send_ping<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: &GroupIdentifier,
    own_group_invitation_nonce: &[u8],
    recipient: &Identity,
    is_response: bool,
) -> Result<(), ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let signature = collaborators.solve(&Challenge::GroupJoinNonce {
        group_id: group_id.clone(),
        nonce: own_group_invitation_nonce.to_vec(),
        recipient: *recipient,
    })?;
    collaborators.send(
        ProtocolInstanceId::for_group(group_id)?,
        SendChannel::AsymmetricBroadcast { to: *recipient },
        ProtocolMessage::Ping {
            group_id: group_id.clone(),
            group_invitation_nonce: own_group_invitation_nonce.to_vec(),
            signature,
            is_response,
        },
    )
}

/// Tells members they are not part of the group anymore.
///
/// Each kick carries the administrators chain encrypted with the main seed, the recipient only
/// accepts it when the chain extends the one it trusts and the kick is signed by one of its
/// administrators.
pub(crate) fn kick_members<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: &GroupIdentifier,
    administrators_chain: &AdministratorsChain,
    blob_main_seed: &Seed,
    members: impl IntoIterator<Item = (Identity, Vec<u8>)>,
) -> Result<(), ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let protocol_instance_id = ProtocolInstanceId::for_group(group_id)?;
    let encrypted_administrators_chain =
        administrators_chain.encrypt(blob_main_seed, collaborators.rng)?;

    for (identity, group_invitation_nonce) in members {
        let signature = collaborators.solve(&Challenge::GroupKick {
            encrypted_administrators_chain: encrypted_administrators_chain.clone(),
            group_invitation_nonce,
        })?;
        collaborators.send(
            protocol_instance_id,
            SendChannel::AsymmetricBroadcast { to: identity },
            ProtocolMessage::Kick {
                group_id: group_id.clone(),
                encrypted_administrators_chain: encrypted_administrators_chain.clone(),
                signature,
            },
        )?;
    }

    Ok(())
}

/// Ends a group creation or update which can not be completed.
pub(crate) fn fail_group_update<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: GroupIdentifier,
    lease: Option<&FreezeLease>,
    reason: Abort,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    if let Some(lease) = lease {
        collaborators
            .store
            .unfreeze_group(lease)
            .map_err(store_error)?;
    }
    Ok(Outcome::aborted(reason).with_event(Event::GroupUpdateFailed { group_id }))
}
