// SPDX-License-Identifier: MIT OR Apache-2.0

//! Selects and runs the step handling an inbound message in the current protocol state.
//!
//! Every protocol instance is driven by calling [`dispatch`] once per inbound message. The step
//! is picked from a table keyed by the state and message kinds; a pair without an entry drops
//! the message and keeps the state. Steps never mutate the given state, they consume it and
//! return the next one inside an [`Outcome`].
#![allow(clippy::type_complexity)]
use std::collections::BTreeSet;
use std::error::Error as StdError;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::blob::BlobError;
use crate::cbor::{DecodeError, EncodeError};
use crate::chain::ChainError;
use crate::challenge::Challenge;
use crate::channel::{Dialog, Outbound, ReceptionChannel, SendChannel};
use crate::config::Config;
use crate::crypto::ed25519::Signature;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::xchacha20::XAeadError;
use crate::crypto::{Rng, RngError};
use crate::event::Event;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::{DeviceId, DialogId, Identity};
use crate::message::{Inbound, MessageTag, ProtocolMessage};
use crate::query::ServerQuery;
use crate::state::{ProtocolState, StateTag};
use crate::steps;
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

/// Everything a step may read from or write to outside of its own state.
///
/// All store calls made while handling one message are expected to run inside one transaction
/// which the caller commits once `dispatch` returned.
pub struct Collaborators<'a, S, C, X> {
    pub owned_identity: Identity,
    pub store: &'a mut S,
    pub channel: &'a mut C,
    pub solver: &'a X,
    pub rng: &'a Rng,
    pub config: &'a Config,
}

impl<'a, S, C, X> Collaborators<'a, S, C, X>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    pub fn new(
        owned_identity: Identity,
        store: &'a mut S,
        channel: &'a mut C,
        solver: &'a X,
        rng: &'a Rng,
        config: &'a Config,
    ) -> Self {
        Self {
            owned_identity,
            store,
            channel,
            solver,
            rng,
            config,
        }
    }

    pub(crate) fn post(&mut self, outbound: Outbound) -> Result<(), ProtocolError> {
        self.channel
            .post(outbound)
            .map_err(|err| ProtocolError::Channel(Box::new(err)))
    }

    pub(crate) fn send(
        &mut self,
        protocol_instance_id: ProtocolInstanceId,
        channel: SendChannel,
        message: ProtocolMessage,
    ) -> Result<(), ProtocolError> {
        self.post(Outbound::Protocol {
            protocol_instance_id,
            channel,
            message,
        })
    }

    pub(crate) fn query(
        &mut self,
        protocol_instance_id: ProtocolInstanceId,
        query: ServerQuery,
    ) -> Result<(), ProtocolError> {
        self.post(Outbound::ServerQuery {
            protocol_instance_id,
            query,
        })
    }

    pub(crate) fn dialog(
        &mut self,
        protocol_instance_id: ProtocolInstanceId,
        dialog_id: DialogId,
        dialog: Dialog,
    ) -> Result<(), ProtocolError> {
        self.post(Outbound::Dialog {
            protocol_instance_id,
            dialog_id,
            dialog,
        })
    }

    pub(crate) fn confirmed_channel_device_uids(
        &self,
        identity: &Identity,
    ) -> Result<BTreeSet<DeviceId>, ProtocolError> {
        self.channel
            .confirmed_channel_device_uids(identity)
            .map_err(|err| ProtocolError::Channel(Box::new(err)))
    }

    /// Signs a challenge with the owned identity.
    pub(crate) fn solve(&self, challenge: &Challenge) -> Result<Signature, ProtocolError> {
        self.solver
            .solve_challenge(challenge, &self.owned_identity)
            .map_err(|err| ProtocolError::Challenge(Box::new(err)))
    }
}

/// Result of handling one inbound message.
#[derive(Debug, PartialEq)]
pub struct Outcome {
    /// Next state of the protocol instance. The instance can be removed once it is final.
    pub state: ProtocolState,

    /// Notifications for the application, to be handled after the transaction committed.
    pub events: Vec<Event>,

    /// Set when the message was dropped without effect on the group.
    pub discard: Option<Discard>,

    /// Set when the instance ended early because a local invariant did not hold.
    pub abort: Option<Abort>,
}

impl Outcome {
    pub fn new(state: ProtocolState) -> Self {
        Self {
            state,
            events: Vec::new(),
            discard: None,
            abort: None,
        }
    }

    pub fn finished() -> Self {
        Self::new(ProtocolState::Final)
    }

    pub fn discarded(state: ProtocolState, reason: Discard) -> Self {
        Self {
            discard: Some(reason),
            ..Self::new(state)
        }
    }

    pub fn aborted(reason: Abort) -> Self {
        Self {
            abort: Some(reason),
            ..Self::finished()
        }
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events.extend(events);
        self
    }
}

/// Reasons for dropping an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Discard {
    /// No step handles this message in the current state.
    NoStep,

    /// Correlation id of the message does not belong to the group it names.
    CorrelationMismatch,

    /// Message claims to come over a pairwise channel but the sender is unknown.
    UnknownSender,

    /// We already hold a newer version of the group.
    OutdatedVersion { received: u64, known: u64 },

    /// We already hold this version of the group.
    VersionNotNewer { received: u64 },

    /// Server answer to a query we are not waiting for anymore.
    UnexpectedQueryId,

    /// Server lock obtained for a nonce we did not send.
    UnexpectedLockNonce,

    /// Dialog answer for another dialog than the one shown by this instance.
    DialogMismatch,

    /// Message from another owned device refers to an invitation nonce we do not hold.
    ForeignInvitationNonce,

    /// Ping signature was already received once.
    ReplayedSignature,

    /// No member or pending member holds the invitation nonce of a ping.
    UnknownInvitationNonce,

    InvalidSignature,

    /// Received administrators chain could not be decrypted or is broken.
    InvalidAdministratorsChain,

    /// Received administrators chain does not extend the one we know.
    ForeignAdministratorsChain,

    GroupNotFound,

    /// Keys needed to act on the group are missing locally.
    MissingKeys,

    /// Owned identity is not an administrator of the group.
    NotAnAdministrator,

    /// Owned identity is the only administrator who confirmed membership.
    SoleAdministrator,

    /// Keycloak groups are managed outside of this protocol.
    KeycloakGroup,

    /// Invitation can only be accepted once its blob was downloaded and decrypted.
    BlobNotAvailable,
}

/// Reasons for ending a protocol instance early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Abort {
    /// Creator of a group must be one of its administrators.
    CreatorNotAdministrator,

    NotAContact(Identity),

    GroupNotFound,

    MissingAdminKey,

    MissingMainSeed,

    /// A pairwise channel is required to send the main seed to this identity.
    MissingConfirmedChannel(Identity),

    /// Server refused the blob upload.
    UploadFailed,

    /// Blob upload failed temporarily too many times in a row.
    RetryLimitReached,

    /// Blob returned by the server cannot be decrypted with our keys.
    UndecryptableBlob,

    /// Changeset cannot be applied to the current blob.
    InvalidChangeset,

    /// Owned identity is not part of the downloaded blob.
    NotAGroupMember,

    BrokenAdministratorsChain,

    /// Group could not be deleted from the server.
    DeletionFailed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message {message:?} can not be received on channel {channel:?}")]
    UnexpectedChannel {
        message: MessageTag,
        channel: ReceptionChannel,
    },

    #[error("store error: {0}")]
    Store(Box<dyn StdError + Send + Sync + 'static>),

    #[error("could not post outbound message: {0}")]
    Channel(Box<dyn StdError + Send + Sync + 'static>),

    #[error("could not solve challenge: {0}")]
    Challenge(Box<dyn StdError + Send + Sync + 'static>),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}

pub(crate) fn store_error<E>(err: E) -> ProtocolError
where
    E: StdError + Send + Sync + 'static,
{
    ProtocolError::Store(Box::new(err))
}

/// Returns true if the correlation id of the message is the one derived from the group.
pub(crate) fn correlates(
    protocol_instance_id: &ProtocolInstanceId,
    group_id: &GroupIdentifier,
) -> Result<bool, ProtocolError> {
    Ok(&ProtocolInstanceId::for_group(group_id)? == protocol_instance_id)
}

type Step<S, C, X> = fn(
    ProtocolState,
    Inbound,
    &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>;

fn select_step<S, C, X>(state: StateTag, message: MessageTag) -> Option<Step<S, C, X>>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    use MessageTag as M;
    use StateTag as T;

    let step: Step<S, C, X> = match (state, message) {
        (T::Initial, M::InitiateGroupCreation) => steps::creation::initiate_group_creation,
        (T::UploadingCreatedGroupData, M::UploadGroupPhoto | M::UploadGroupBlob) => {
            steps::creation::check_if_group_creation_can_be_finalized
        }
        (T::UploadingCreatedGroupData, M::FinalizeGroupCreation) => {
            steps::creation::finalize_group_creation
        }
        (
            T::Initial | T::NeedMoreSeeds | T::InvitationReceived,
            M::InvitationOrMembersUpdate
            | M::InvitationOrMembersUpdateBroadcast
            | M::InvitationOrMembersUpdatePropagated
            | M::BlobKeysAfterChannelCreation,
        ) => steps::invitation::process_invitation_or_members_update,
        (T::DownloadingGroupBlob, M::DownloadGroupBlob) => {
            steps::download::process_downloaded_group_data
        }
        (T::Initial, M::DeleteGroupBlobFromServer) => {
            steps::download::do_nothing_after_delete_blob_from_server
        }
        (T::Initial, M::Ping | M::PropagatedPing) => steps::ping::process_ping,
        (T::Initial, M::InitiateTargetedPing) => steps::ping::send_targeted_ping,
        (
            T::InvitationReceived | T::DownloadingGroupBlob | T::NeedMoreSeeds,
            M::DialogAcceptGroupV2Invitation | M::PropagateInvitationDialogResponse,
        ) => steps::dialog::process_invitation_dialog_response,
        (T::RejectingInvitationOrLeavingGroup, M::PutGroupLogOnServer) => {
            steps::dialog::notify_members_of_rejection
        }
        (
            T::Initial,
            M::InitiateGroupReDownload
            | M::InvitationRejectedBroadcast
            | M::PropagateInvitationRejected,
        )
        | (
            T::InvitationReceived,
            M::InvitationRejectedBroadcast | M::PropagateInvitationRejected,
        ) => steps::redownload::initiate_blob_re_download,
        (T::Initial, M::InitiateGroupUpdate) => steps::update::initiate_group_update,
        (T::WaitingForLock, M::RequestServerLock) => steps::update::prepare_blob_for_group_update,
        (T::UploadingUpdatedGroupBlob, M::UploadGroupBlob) => {
            steps::update::process_group_update_blob_upload_response
        }
        (T::UploadingUpdatedGroupPhoto, M::UploadGroupPhoto) => {
            steps::update::process_group_update_photo_upload_response
        }
        (T::UploadingUpdatedGroupPhoto, M::FinalizeGroupUpdate) => {
            steps::update::finalize_group_update
        }
        (
            T::Initial
            | T::InvitationReceived
            | T::DownloadingGroupBlob
            | T::NeedMoreSeeds
            | T::WaitingForLock,
            M::Kick | M::PropagatedKick,
        ) => steps::kick::get_kicked,
        (
            T::Initial | T::DownloadingGroupBlob | T::NeedMoreSeeds | T::WaitingForLock,
            M::InitiateGroupLeave | M::PropagatedGroupLeave,
        ) => steps::leave::leave_group,
        (T::Initial, M::InitiateGroupDisband)
        | (
            T::Initial | T::DownloadingGroupBlob | T::NeedMoreSeeds | T::InvitationReceived,
            M::PropagateGroupDisband,
        ) => steps::disband::disband_group,
        (T::DisbandingGroup, M::DeleteGroupBlobFromServer) => {
            steps::disband::finalize_group_disband
        }
        (T::Initial, M::InitiateBatchKeysResend) => steps::batch_keys::prepare_batch_keys,
        (T::Initial, M::BlobKeysBatchAfterChannelCreation) => {
            steps::batch_keys::process_batch_keys
        }
        _ => return None,
    };

    Some(step)
}

/// Handles one inbound message and returns the next state of the protocol instance.
///
/// A message received on a channel it may not arrive on is an error, the caller keeps the
/// current state in that case.
pub fn dispatch<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let state_tag = state.tag();
    let message_tag = inbound.message.tag();

    if !inbound.channel.satisfies(message_tag.required_channel()) {
        return Err(ProtocolError::UnexpectedChannel {
            message: message_tag,
            channel: inbound.channel,
        });
    }

    let Some(step) = select_step::<S, C, X>(state_tag, message_tag) else {
        debug!("no step for message {message_tag:?} in state {state_tag:?}, discarding it");
        return Ok(Outcome::discarded(state, Discard::NoStep));
    };

    trace!("running step for message {message_tag:?} in state {state_tag:?}");
    let outcome = step(state, inbound, collaborators)?;

    if let Some(reason) = &outcome.discard {
        debug!("discarded message {message_tag:?} in state {state_tag:?}: {reason:?}");
    }
    if let Some(reason) = &outcome.abort {
        warn!("aborted protocol on message {message_tag:?} in state {state_tag:?}: {reason:?}");
    }

    Ok(outcome)
}
