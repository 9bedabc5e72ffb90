// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group updates authored by an administrator of the owned identity.
//!
//! Concurrent editors are serialised by a lock on the blob server. The lock is requested with
//! a fresh nonce, the server answers with the latest blob on which the changeset is applied,
//! and the new version is only accepted if it is uploaded under the same lock. A temporary
//! upload failure means someone else took the lock in the meantime, the whole cycle is then
//! repeated a bounded number of times.
use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::blob::ServerBlob;
use crate::challenge::Challenge;
use crate::changeset::Changeset;
use crate::channel::SendChannel;
use crate::dispatch::{Abort, Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::event::Event;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::Identity;
use crate::message::{Inbound, LockResult, ProtocolMessage, UploadResult};
use crate::query::ServerQuery;
use crate::seed::{AdminPrivateKey, BlobKeys, Seed};
use crate::state::{
    ProtocolState, UploadingUpdatedGroupBlob, UploadingUpdatedGroupPhoto, WaitingForLock,
};
use crate::steps::{fail_group_update, kick_members, unexpected_message};
use crate::traits::{ChannelPost, FreezeLease, GroupStore, SolveChallenge, UpdateAuthor};

pub(crate) fn initiate_group_update<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolMessage::InitiateGroupUpdate {
        group_id,
        changeset,
    } = inbound.message
    else {
        return unexpected_message(state);
    };
    let protocol_instance_id = inbound.protocol_instance_id;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(
            Outcome::discarded(ProtocolState::Final, Discard::CorrelationMismatch)
                .with_event(Event::GroupUpdateFailed { group_id }),
        );
    }

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return fail_group_update(collaborators, group_id, None, Abort::GroupNotFound);
    }
    let Some(admin_key) = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?
        .and_then(|blob_keys| blob_keys.group_admin_private_key)
    else {
        return fail_group_update(collaborators, group_id, None, Abort::MissingAdminKey);
    };

    let lock_nonce = request_lock(collaborators, protocol_instance_id, &group_id, &admin_key)?;
    let lease = collaborators
        .store
        .freeze_group(&group_id)
        .map_err(store_error)?;

    let changeset = with_scratch_photo(collaborators, &group_id, changeset)?;

    Ok(Outcome::new(ProtocolState::WaitingForLock(WaitingForLock {
        group_id,
        changeset,
        lock_nonce,
        failed_upload_counter: 0,
        lease,
    })))
}

/// Photos are uploaded from a copy owned by the protocol, the application may remove the
/// original at any time.
///
/// A photo uploaded by another administrator is uploaded again under our own key.
fn with_scratch_photo<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: &GroupIdentifier,
    changeset: Changeset,
) -> Result<Changeset, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    if changeset.contains_delete_photo_change() {
        return Ok(changeset);
    }

    if let Some(photo) = changeset.photo() {
        let scratch = collaborators
            .store
            .copy_photo_to_scratch(photo)
            .map_err(store_error)?;
        return Ok(changeset.with_photo(scratch));
    }

    let trusted_photo = collaborators
        .store
        .trusted_photo(group_id)
        .map_err(store_error)?;
    match trusted_photo {
        Some(trusted) if trusted.server_photo_info.uploader != collaborators.owned_identity => {
            let scratch = collaborators
                .store
                .copy_photo_to_scratch(&trusted.path)
                .map_err(store_error)?;
            Ok(changeset.with_photo(scratch))
        }
        _ => Ok(changeset),
    }
}

fn request_lock<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    protocol_instance_id: ProtocolInstanceId,
    group_id: &GroupIdentifier,
    admin_key: &AdminPrivateKey,
) -> Result<Vec<u8>, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let lock_nonce = collaborators
        .rng
        .random_vec(collaborators.config.lock_nonce_len)?;
    let signature = Challenge::GroupLockNonce {
        lock_nonce: lock_nonce.clone(),
    }
    .sign_with_admin_key(admin_key)?;
    collaborators.query(
        protocol_instance_id,
        ServerQuery::RequestGroupBlobLock {
            group_id: group_id.clone(),
            lock_nonce: lock_nonce.clone(),
            signature,
        },
    )?;
    Ok(lock_nonce)
}

pub(crate) fn prepare_blob_for_group_update<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::WaitingForLock(waiting) = state else {
        return unexpected_message(state);
    };
    let ProtocolMessage::RequestServerLock { result } = inbound.message else {
        return unexpected_message(ProtocolState::WaitingForLock(waiting));
    };
    let group_id = waiting.group_id.clone();
    let owned_identity = collaborators.owned_identity;

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&waiting.lease),
            Abort::GroupNotFound,
        );
    }

    let (encrypted_blob, log_entries, admin_public_key, lock_nonce) = match result {
        LockResult::LockObtained {
            encrypted_blob,
            log_entries,
            admin_public_key,
            lock_nonce,
        } => (encrypted_blob, log_entries, admin_public_key, lock_nonce),
        LockResult::PermanentFailure => {
            return fail_group_update(
                collaborators,
                group_id,
                Some(&waiting.lease),
                Abort::UploadFailed,
            );
        }
    };
    if lock_nonce != waiting.lock_nonce {
        return Ok(Outcome::discarded(
            ProtocolState::WaitingForLock(waiting),
            Discard::UnexpectedLockNonce,
        ));
    }

    let blob_keys = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?;
    let Some(BlobKeys {
        blob_main_seed: Some(blob_main_seed),
        blob_version_seed,
        group_admin_private_key,
    }) = blob_keys
    else {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&waiting.lease),
            Abort::MissingMainSeed,
        );
    };
    let Some(admin_key) = group_admin_private_key else {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&waiting.lease),
            Abort::MissingAdminKey,
        );
    };

    let previous_blob =
        match ServerBlob::decrypt(&encrypted_blob, &blob_main_seed, &blob_version_seed, &group_id) {
            Ok(blob) => blob.consolidate_with_log_entries(&group_id, &log_entries),
            Err(err) => {
                warn!("could not decrypt locked blob of group {group_id}: {err}");
                return fail_group_update(
                    collaborators,
                    group_id,
                    Some(&waiting.lease),
                    Abort::UndecryptableBlob,
                );
            }
        };

    let uploaded_blob = match previous_blob.consolidate_with_changeset(
        &waiting.changeset,
        &owned_identity,
        &*collaborators.store,
        collaborators.rng,
        collaborators.solver,
        collaborators.config,
    ) {
        Ok(blob) => blob,
        Err(err) => {
            warn!("could not apply changeset to group {group_id}: {err}");
            return fail_group_update(
                collaborators,
                group_id,
                Some(&waiting.lease),
                Abort::InvalidChangeset,
            );
        }
    };

    // New members and members with a fresh nonce receive the main seed, which requires a
    // pairwise channel.
    let needs_main_seed: BTreeSet<Identity> = uploaded_blob
        .group_members
        .values()
        .filter(|member| member.identity != owned_identity)
        .filter(|member| match previous_blob.group_members.get(&member.identity) {
            Some(previous) => previous.group_invitation_nonce != member.group_invitation_nonce,
            None => true,
        })
        .map(|member| member.identity)
        .collect();
    for identity in needs_main_seed {
        if collaborators
            .confirmed_channel_device_uids(&identity)?
            .is_empty()
        {
            return fail_group_update(
                collaborators,
                group_id,
                Some(&waiting.lease),
                Abort::MissingConfirmedChannel(identity),
            );
        }
    }

    // Demoted administrators must not be able to write to the server anymore.
    let updated_admin_key = if uploaded_blob.administrators_chain.len()
        != previous_blob.administrators_chain.len()
        && uploaded_blob
            .administrators_chain
            .an_administrator_was_demoted_in_the_last_update()
    {
        Some(AdminPrivateKey::generate(collaborators.rng)?)
    } else {
        None
    };
    let updated_version_seed = Seed::generate(collaborators.rng)?;

    let encrypted_blob = uploaded_blob.sign_then_encrypt(
        &owned_identity,
        &blob_main_seed,
        &updated_version_seed,
        collaborators.solver,
        collaborators.rng,
        collaborators.config,
    )?;
    let admin_public_key = updated_admin_key
        .as_ref()
        .map(AdminPrivateKey::public_key)
        .unwrap_or(admin_public_key);
    let signature = Challenge::GroupUpdate {
        lock_nonce: lock_nonce.clone(),
        encrypted_blob: encrypted_blob.clone(),
        admin_public_key,
    }
    .sign_with_admin_key(&admin_key)?;

    collaborators.query(
        inbound.protocol_instance_id,
        ServerQuery::UpdateGroupBlob {
            group_id: group_id.clone(),
            lock_nonce,
            encrypted_blob,
            admin_public_key,
            signature,
        },
    )?;

    debug!(
        "uploading version {} of group {group_id}",
        uploaded_blob.group_version
    );

    Ok(Outcome::new(ProtocolState::UploadingUpdatedGroupBlob(
        UploadingUpdatedGroupBlob {
            group_id,
            changeset: waiting.changeset,
            previous_blob,
            uploaded_blob,
            updated_admin_key,
            updated_version_seed,
            failed_upload_counter: waiting.failed_upload_counter,
            lease: waiting.lease,
        },
    )))
}

pub(crate) fn process_group_update_blob_upload_response<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::UploadingUpdatedGroupBlob(uploading) = state else {
        return unexpected_message(state);
    };
    let ProtocolMessage::UploadGroupBlob { result } = inbound.message else {
        return unexpected_message(ProtocolState::UploadingUpdatedGroupBlob(uploading));
    };
    let protocol_instance_id = inbound.protocol_instance_id;
    let group_id = uploading.group_id.clone();

    match result {
        UploadResult::PermanentFailure => fail_group_update(
            collaborators,
            group_id,
            Some(&uploading.lease),
            Abort::UploadFailed,
        ),
        UploadResult::TemporaryFailure => {
            retry_group_update(collaborators, protocol_instance_id, uploading)
        }
        UploadResult::Success => {
            let server_photo_info_of_new_photo = match (
                uploading.changeset.photo(),
                &uploading.uploaded_blob.server_photo_info,
            ) {
                (Some(photo), Some(server_photo_info)) => {
                    collaborators.query(
                        protocol_instance_id,
                        ServerQuery::PutUserData {
                            server_photo_info: server_photo_info.clone(),
                            photo: photo.to_path_buf(),
                        },
                    )?;
                    Some(server_photo_info.clone())
                }
                _ => {
                    collaborators.send(
                        protocol_instance_id,
                        SendChannel::Local,
                        ProtocolMessage::FinalizeGroupUpdate,
                    )?;
                    None
                }
            };

            Ok(Outcome::new(ProtocolState::UploadingUpdatedGroupPhoto(
                UploadingUpdatedGroupPhoto {
                    group_id,
                    changeset: uploading.changeset,
                    previous_blob: uploading.previous_blob,
                    uploaded_blob: uploading.uploaded_blob,
                    updated_admin_key: uploading.updated_admin_key,
                    updated_version_seed: uploading.updated_version_seed,
                    server_photo_info_of_new_photo,
                    lease: uploading.lease,
                },
            )))
        }
    }
}

fn retry_group_update<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    protocol_instance_id: ProtocolInstanceId,
    uploading: UploadingUpdatedGroupBlob,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let group_id = uploading.group_id;
    let lease: FreezeLease = uploading.lease;

    if uploading.failed_upload_counter >= collaborators.config.max_failed_upload_count {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&lease),
            Abort::RetryLimitReached,
        );
    }

    if !collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?
    {
        return fail_group_update(collaborators, group_id, None, Abort::GroupNotFound);
    }

    let Some(admin_key) = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?
        .and_then(|blob_keys| blob_keys.group_admin_private_key)
    else {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&lease),
            Abort::MissingAdminKey,
        );
    };

    debug!(
        "blob upload of group {group_id} failed temporarily {} times, requesting a new lock",
        uploading.failed_upload_counter + 1
    );
    let lock_nonce = request_lock(collaborators, protocol_instance_id, &group_id, &admin_key)?;

    Ok(Outcome::new(ProtocolState::WaitingForLock(WaitingForLock {
        group_id,
        changeset: uploading.changeset,
        lock_nonce,
        failed_upload_counter: uploading.failed_upload_counter + 1,
        lease,
    })))
}

pub(crate) fn process_group_update_photo_upload_response<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    collaborators.send(
        inbound.protocol_instance_id,
        SendChannel::Local,
        ProtocolMessage::FinalizeGroupUpdate,
    )?;
    Ok(Outcome::new(state))
}

pub(crate) fn finalize_group_update<S, C, X>(
    state: ProtocolState,
    _inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::UploadingUpdatedGroupPhoto(uploading) = state else {
        return unexpected_message(state);
    };
    let group_id = uploading.group_id.clone();
    let owned_identity = collaborators.owned_identity;

    let uploaded_blob = match uploading
        .uploaded_blob
        .with_checked_administrators_chain_integrity(&group_id)
    {
        Ok(blob) => blob,
        Err(err) => {
            warn!("administrators chain of uploaded group {group_id} is broken: {err}");
            return fail_group_update(
                collaborators,
                group_id,
                Some(&uploading.lease),
                Abort::BrokenAdministratorsChain,
            );
        }
    };

    let Some(BlobKeys {
        blob_main_seed: Some(blob_main_seed),
        group_admin_private_key,
        ..
    }) = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?
    else {
        return fail_group_update(
            collaborators,
            group_id,
            Some(&uploading.lease),
            Abort::MissingMainSeed,
        );
    };

    let blob_keys = BlobKeys::new(
        Some(blob_main_seed.clone()),
        uploading.updated_version_seed.clone(),
        uploading
            .updated_admin_key
            .clone()
            .or(group_admin_private_key),
    );
    collaborators
        .store
        .update_group(
            &group_id,
            &uploaded_blob,
            &blob_keys,
            UpdateAuthor::OwnedIdentity,
        )
        .map_err(store_error)?;
    collaborators
        .store
        .unfreeze_group(&uploading.lease)
        .map_err(store_error)?;

    // The main seed only travels over pairwise channels, the admin key only to administrators.
    let protocol_instance_id = ProtocolInstanceId::for_group(&group_id)?;
    for member in uploaded_blob.other_group_members(&owned_identity) {
        let member_keys = if member.has_group_admin_permission() {
            blob_keys.clone()
        } else {
            blob_keys.without_admin_key()
        };
        let device_uids = collaborators.confirmed_channel_device_uids(&member.identity)?;
        if device_uids.is_empty() {
            collaborators.send(
                protocol_instance_id,
                SendChannel::AsymmetricBroadcast {
                    to: member.identity,
                },
                ProtocolMessage::InvitationOrMembersUpdateBroadcast {
                    group_id: group_id.clone(),
                    group_version: uploaded_blob.group_version,
                    blob_keys: member_keys.without_main_seed(),
                },
            )?;
        } else {
            collaborators.send(
                protocol_instance_id,
                SendChannel::ObliviousChannel {
                    to: member.identity,
                    device_uids: device_uids.clone(),
                },
                ProtocolMessage::InvitationOrMembersUpdate {
                    group_id: group_id.clone(),
                    group_version: uploaded_blob.group_version,
                    blob_keys: member_keys,
                    notified_device_uids: device_uids,
                },
            )?;
        }
    }

    let removed_members: Vec<(Identity, Vec<u8>)> = uploading
        .previous_blob
        .group_members
        .values()
        .filter(|member| {
            member.identity != owned_identity
                && !uploaded_blob.group_members.contains_key(&member.identity)
        })
        .map(|member| (member.identity, member.group_invitation_nonce.clone()))
        .collect();
    if !removed_members.is_empty() {
        kick_members(
            collaborators,
            &group_id,
            &uploaded_blob.administrators_chain,
            &blob_main_seed,
            removed_members,
        )?;
    }

    let mut outcome = Outcome::finished();
    if let (Some(photo), Some(server_photo_info)) = (
        uploading.changeset.photo(),
        &uploading.server_photo_info_of_new_photo,
    ) {
        collaborators
            .store
            .set_uploaded_photo(&group_id, server_photo_info, photo)
            .map_err(store_error)?;
        outcome = outcome.with_event(Event::ScratchPhotoReleased {
            path: photo.to_path_buf(),
        });
    }

    debug!(
        "group {group_id} updated to version {}",
        uploaded_blob.group_version
    );
    Ok(outcome.with_event(Event::GroupMembersChanged { group_id }))
}
