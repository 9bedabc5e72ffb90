// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion of a blob download started for an invitation, an update or a re-download.
use tracing::debug;

use crate::blob::ServerBlob;
use crate::channel::Dialog;
use crate::dispatch::{Abort, Collaborators, Discard, Outcome, ProtocolError, store_error};
use crate::event::Event;
use crate::identifier::GroupIdentifier;
use crate::message::{DownloadResult, Inbound, ProtocolMessage};
use crate::permission::is_group_admin;
use crate::state::{DownloadingGroupBlob, InvitationReceived, NeedMoreSeeds, ProtocolState};
use crate::steps::{send_ping, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge, UpdateAuthor};

pub(crate) fn process_downloaded_group_data<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::DownloadingGroupBlob(downloading) = state else {
        return unexpected_message(state);
    };
    let ProtocolMessage::DownloadGroupBlob { query_id, result } = inbound.message else {
        return unexpected_message(ProtocolState::DownloadingGroupBlob(downloading));
    };
    if query_id != downloading.expected_query_id {
        return Ok(Outcome::discarded(
            ProtocolState::DownloadingGroupBlob(downloading),
            Discard::UnexpectedQueryId,
        ));
    }

    let protocol_instance_id = inbound.protocol_instance_id;
    let owned_identity = collaborators.owned_identity;
    let group_id = downloading.group_id.clone();

    let (encrypted_blob, log_entries, admin_public_key) = match result {
        DownloadResult::BlobDownloaded {
            encrypted_blob,
            log_entries,
            admin_public_key,
        } => (encrypted_blob, log_entries, admin_public_key),
        DownloadResult::BlobWasDeletedFromServer => {
            debug!("group {group_id} was deleted from the server");
            collaborators
                .store
                .delete_group(&group_id)
                .map_err(store_error)?;
            collaborators.dialog(protocol_instance_id, downloading.dialog_id, Dialog::Delete)?;
            return Ok(Outcome::finished());
        }
        DownloadResult::BlobCouldNotBeDownloaded => {
            collaborators.dialog(protocol_instance_id, downloading.dialog_id, Dialog::Delete)?;
            if let Some(lease) = &downloading.lease {
                collaborators
                    .store
                    .unfreeze_group(lease)
                    .map_err(store_error)?;
            }
            return Ok(Outcome::finished());
        }
    };

    let Some(decrypted) =
        downloading
            .collected_data
            .try_to_decrypt(&encrypted_blob, &admin_public_key, &group_id)
    else {
        debug!("no collected seeds decrypt the blob of group {group_id}");
        return Ok(Outcome::new(need_more_seeds(downloading)));
    };

    // Leavers are removed from the blob based on the log entries signed with their nonce.
    let server_blob = decrypted
        .blob
        .consolidate_with_log_entries(&group_id, &log_entries);

    let Some((own_raw_permissions, own_group_invitation_nonce)) =
        server_blob.own_permissions_and_nonce(&owned_identity)
    else {
        if let Some(lease) = &downloading.lease {
            collaborators
                .store
                .unfreeze_group(lease)
                .map_err(store_error)?;
        }
        return Ok(Outcome::aborted(Abort::NotAGroupMember));
    };

    let is_administrator = is_group_admin(&own_raw_permissions);
    if is_administrator && decrypted.blob_keys.group_admin_private_key.is_none() {
        debug!("waiting for the admin key of group {group_id}");
        return Ok(Outcome::new(need_more_seeds(downloading)));
    }

    let group_exists = collaborators
        .store
        .group_exists(&group_id)
        .map_err(store_error)?;
    if group_exists {
        // Never go back to an older version or to an administrators chain which does not
        // extend the one we trust.
        if let Some(reason) = rollback(collaborators, &group_id, &server_blob)? {
            if let Some(lease) = &downloading.lease {
                collaborators
                    .store
                    .unfreeze_group(lease)
                    .map_err(store_error)?;
            }
            return Ok(Outcome::discarded(ProtocolState::Final, reason));
        }

        let identities_to_ping = collaborators
            .store
            .update_group(
                &group_id,
                &server_blob,
                &decrypted.blob_keys,
                UpdateAuthor::OtherMember,
            )
            .map_err(store_error)?;
        for identity in &identities_to_ping {
            send_ping(
                collaborators,
                &group_id,
                &own_group_invitation_nonce,
                identity,
                false,
            )?;
        }

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

        if let Some(lease) = &downloading.lease {
            collaborators
                .store
                .unfreeze_group(lease)
                .map_err(store_error)?;
        }

        debug!(
            "updated group {group_id} to version {}",
            server_blob.group_version
        );
        return Ok(outcome.with_event(Event::GroupMembersChanged { group_id }));
    }

    collaborators.dialog(
        protocol_instance_id,
        downloading.dialog_id,
        Dialog::AcceptInvite {
            group_id: group_id.clone(),
            inviter: decrypted.inviter,
            group_version: server_blob.group_version,
            serialized_group_core_details: server_blob.serialized_group_core_details.clone(),
            own_raw_permissions,
            other_members: server_blob.other_group_members(&owned_identity),
        },
    )?;

    Ok(Outcome::new(ProtocolState::InvitationReceived(
        InvitationReceived {
            group_id,
            dialog_id: downloading.dialog_id,
            inviter: decrypted.inviter,
            server_blob,
            blob_keys: decrypted.blob_keys,
        },
    )))
}

pub(crate) fn do_nothing_after_delete_blob_from_server<S, C, X>(
    _state: ProtocolState,
    _inbound: Inbound,
    _collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    Ok(Outcome::finished())
}

fn rollback<S, C, X>(
    collaborators: &Collaborators<'_, S, C, X>,
    group_id: &GroupIdentifier,
    server_blob: &ServerBlob,
) -> Result<Option<Discard>, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    if let Some(known) = collaborators
        .store
        .group_version(group_id)
        .map_err(store_error)?
    {
        if server_blob.group_version < known {
            return Ok(Some(Discard::OutdatedVersion {
                received: server_blob.group_version,
                known,
            }));
        }
    }

    if let Some(trusted_chain) = collaborators
        .store
        .administrators_chain(group_id)
        .map_err(store_error)?
    {
        if !trusted_chain.is_prefix_of(&server_blob.administrators_chain) {
            return Ok(Some(Discard::ForeignAdministratorsChain));
        }
    }

    Ok(None)
}

fn need_more_seeds(downloading: DownloadingGroupBlob) -> ProtocolState {
    ProtocolState::NeedMoreSeeds(NeedMoreSeeds {
        group_id: downloading.group_id,
        dialog_id: downloading.dialog_id,
        collected_data: downloading.collected_data,
        last_known_own_nonce_and_members: downloading.last_known_own_nonce_and_members,
        lease: downloading.lease,
    })
}
