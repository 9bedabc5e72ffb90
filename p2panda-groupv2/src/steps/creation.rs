// SPDX-License-Identifier: MIT OR Apache-2.0

//! Creation of a group administrated by the owned identity.
//!
//! The creator uploads the first blob version (and the photo, if any) and only then sends the
//! keys to every invited member. Members without a confirmed pairwise channel can not receive
//! the main seed, the group is deleted again in that case.
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::blob::{GroupMember, ServerBlob, ServerPhotoInfo};
use crate::chain::AdministratorsChain;
use crate::challenge::Challenge;
use crate::channel::SendChannel;
use crate::dispatch::{Abort, Collaborators, Outcome, ProtocolError, store_error};
use crate::event::Event;
use crate::identifier::{Category, GroupIdentifier, ProtocolInstanceId};
use crate::identity::{DeviceId, Identity};
use crate::message::{Inbound, ProtocolMessage, UploadResult};
use crate::permission::is_group_admin;
use crate::query::ServerQuery;
use crate::seed::{AdminPrivateKey, BlobKeys, Seed};
use crate::state::{ProtocolState, UploadingCreatedGroupData};
use crate::steps::{fail_group_update, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

pub(crate) fn initiate_group_creation<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolMessage::InitiateGroupCreation {
        server_url,
        own_raw_permissions,
        other_members,
        serialized_group_core_details,
        photo,
    } = inbound.message
    else {
        return unexpected_message(state);
    };

    let owned_identity = collaborators.owned_identity;
    if !is_group_admin(&own_raw_permissions) {
        return Ok(Outcome::aborted(Abort::CreatorNotAdministrator));
    }

    let mut group_members = BTreeMap::new();
    group_members.insert(
        owned_identity,
        GroupMember {
            identity: owned_identity,
            raw_permissions: own_raw_permissions,
            serialized_identity_core_details: collaborators
                .store
                .owned_core_details()
                .map_err(store_error)?,
            group_invitation_nonce: collaborators
                .rng
                .random_vec(collaborators.config.group_invitation_nonce_len)?,
        },
    );
    for member in other_members {
        if member.identity == owned_identity {
            continue;
        }
        let Some(details) = collaborators
            .store
            .contact_core_details(&member.identity)
            .map_err(store_error)?
        else {
            return Ok(Outcome::aborted(Abort::NotAContact(member.identity)));
        };
        group_members.insert(
            member.identity,
            GroupMember {
                identity: member.identity,
                raw_permissions: member.raw_permissions,
                serialized_identity_core_details: details,
                group_invitation_nonce: collaborators
                    .rng
                    .random_vec(collaborators.config.group_invitation_nonce_len)?,
            },
        );
    }

    let other_administrators: Vec<Identity> = group_members
        .values()
        .filter(|member| member.identity != owned_identity && member.has_group_admin_permission())
        .map(|member| member.identity)
        .collect();
    let administrators_chain = AdministratorsChain::start_new_chain(
        &owned_identity,
        &other_administrators,
        collaborators.rng,
        collaborators.solver,
    )?;
    let group_id = GroupIdentifier::new(
        *administrators_chain.group_uid(),
        server_url,
        Category::Server,
    );

    let server_photo_info = match &photo {
        Some(_) => Some(ServerPhotoInfo::generate(&owned_identity, collaborators.rng)?),
        None => None,
    };
    let server_blob = ServerBlob {
        administrators_chain,
        group_members,
        group_version: 0,
        serialized_group_core_details,
        server_photo_info,
    };

    let blob_main_seed = Seed::generate(collaborators.rng)?;
    let blob_version_seed = Seed::generate(collaborators.rng)?;
    let admin_key = AdminPrivateKey::generate(collaborators.rng)?;
    let admin_public_key = admin_key.public_key();
    let blob_keys = BlobKeys::new(
        Some(blob_main_seed.clone()),
        blob_version_seed.clone(),
        Some(admin_key),
    );

    let lease = collaborators
        .store
        .create_group_administrated_by_owned_identity(
            &group_id,
            &server_blob,
            &blob_keys,
            photo.as_deref(),
        )
        .map_err(store_error)?;

    let encrypted_blob = server_blob.sign_then_encrypt(
        &owned_identity,
        &blob_main_seed,
        &blob_version_seed,
        collaborators.solver,
        collaborators.rng,
        collaborators.config,
    )?;

    // Server responses are routed back to this instance.
    let protocol_instance_id = inbound.protocol_instance_id;

    let waiting_for_photo_upload = match (&server_blob.server_photo_info, photo) {
        (Some(server_photo_info), Some(photo)) => {
            let photo = collaborators
                .store
                .trusted_photo(&group_id)
                .map_err(store_error)?
                .map(|trusted| trusted.path)
                .unwrap_or(photo);
            collaborators.query(
                protocol_instance_id,
                ServerQuery::PutUserData {
                    server_photo_info: server_photo_info.clone(),
                    photo,
                },
            )?;
            true
        }
        _ => false,
    };

    collaborators.query(
        protocol_instance_id,
        ServerQuery::CreateGroupBlob {
            group_id: group_id.clone(),
            admin_public_key,
            encrypted_blob,
        },
    )?;

    debug!("created group {group_id}, uploading first version");

    Ok(Outcome::new(ProtocolState::UploadingCreatedGroupData(
        UploadingCreatedGroupData {
            group_id,
            group_version: server_blob.group_version,
            waiting_for_blob_upload: true,
            waiting_for_photo_upload,
            lease,
        },
    )))
}

pub(crate) fn check_if_group_creation_can_be_finalized<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::UploadingCreatedGroupData(mut uploading) = state else {
        return unexpected_message(state);
    };

    match inbound.message {
        ProtocolMessage::UploadGroupBlob { result } => match result {
            UploadResult::Success => uploading.waiting_for_blob_upload = false,
            UploadResult::TemporaryFailure | UploadResult::PermanentFailure => {
                collaborators
                    .store
                    .delete_group(&uploading.group_id)
                    .map_err(store_error)?;
                return fail_group_update(
                    collaborators,
                    uploading.group_id,
                    None,
                    Abort::UploadFailed,
                );
            }
        },
        ProtocolMessage::UploadGroupPhoto => uploading.waiting_for_photo_upload = false,
        _ => return unexpected_message(ProtocolState::UploadingCreatedGroupData(uploading)),
    }

    if !uploading.waiting_for_blob_upload && !uploading.waiting_for_photo_upload {
        collaborators.send(
            inbound.protocol_instance_id,
            SendChannel::Local,
            ProtocolMessage::FinalizeGroupCreation,
        )?;
    }

    Ok(Outcome::new(ProtocolState::UploadingCreatedGroupData(
        uploading,
    )))
}

pub(crate) fn finalize_group_creation<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let ProtocolState::UploadingCreatedGroupData(uploading) = state else {
        return unexpected_message(state);
    };
    let group_id = uploading.group_id;

    let blob_keys = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?;
    let (blob_keys, admin_key) = match blob_keys {
        Some(blob_keys) if blob_keys.blob_main_seed.is_some() => {
            match blob_keys.group_admin_private_key.clone() {
                Some(admin_key) => (blob_keys, admin_key),
                None => return abandon_creation(collaborators, group_id, Abort::MissingAdminKey),
            }
        }
        _ => return abandon_creation(collaborators, group_id, Abort::MissingMainSeed),
    };

    // Every invited member needs a pairwise channel to receive the main seed.
    let pending_members = collaborators
        .store
        .other_members(&group_id)
        .map_err(store_error)?
        .into_iter()
        .filter(|member| member.is_pending);
    let mut recipients: Vec<(Identity, bool, BTreeSet<DeviceId>)> = Vec::new();
    for member in pending_members {
        let device_uids = collaborators.confirmed_channel_device_uids(&member.identity)?;
        if device_uids.is_empty() {
            let signature = Challenge::GroupDelete.sign_with_admin_key(&admin_key)?;
            collaborators.query(
                inbound.protocol_instance_id,
                ServerQuery::DeleteGroupBlob {
                    group_id: group_id.clone(),
                    signature,
                },
            )?;
            return abandon_creation(
                collaborators,
                group_id,
                Abort::MissingConfirmedChannel(member.identity),
            );
        }
        recipients.push((member.identity, member.is_admin(), device_uids));
    }

    let protocol_instance_id = ProtocolInstanceId::for_group(&group_id)?;
    for (identity, is_admin, device_uids) in recipients {
        let blob_keys = if is_admin {
            blob_keys.clone()
        } else {
            blob_keys.without_admin_key()
        };
        collaborators.send(
            protocol_instance_id,
            SendChannel::ObliviousChannel {
                to: identity,
                device_uids: device_uids.clone(),
            },
            ProtocolMessage::InvitationOrMembersUpdate {
                group_id: group_id.clone(),
                group_version: uploading.group_version,
                blob_keys,
                notified_device_uids: device_uids,
            },
        )?;
    }

    collaborators
        .store
        .unfreeze_group(&uploading.lease)
        .map_err(store_error)?;

    Ok(Outcome::finished().with_event(Event::GroupMembersChanged { group_id }))
}

fn abandon_creation<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: GroupIdentifier,
    reason: Abort,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    collaborators
        .store
        .delete_group(&group_id)
        .map_err(store_error)?;
    fail_group_update(collaborators, group_id, None, reason)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use assert_matches::assert_matches;

    use crate::channel::{Outbound, ReceptionChannel};
    use crate::dispatch::{Abort, Outcome, dispatch};
    use crate::event::Event;
    use crate::identity::Identity;
    use crate::message::{IdentityAndPermissions, Inbound, ProtocolMessage};
    use crate::query::ServerQuery;
    use crate::state::ProtocolState;
    use crate::test_utils::{Device, creation_message, instance_id};

    #[test]
    fn creator_must_be_administrator() {
        let mut alice = Device::new(1);
        let bob = Device::new(2);
        alice.add_contact(&bob);

        let mut message = creation_message("https://blobs", &[(&bob, false)]);
        if let ProtocolMessage::InitiateGroupCreation {
            own_raw_permissions,
            ..
        } = &mut message
        {
            own_raw_permissions.clear();
        }

        let outcome = alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(instance_id(1), ReceptionChannel::Local, message),
            )
            .unwrap();
        assert_eq!(outcome, Outcome::aborted(Abort::CreatorNotAdministrator));
        assert!(alice.channel.outbound.is_empty());
    }

    #[test]
    fn members_must_be_contacts() {
        let mut alice = Device::new(1);
        let stranger = Identity::from_bytes([7; 32]);

        let message = ProtocolMessage::InitiateGroupCreation {
            server_url: "https://blobs".into(),
            own_raw_permissions: BTreeSet::from(["ga".to_string()]),
            other_members: BTreeSet::from([IdentityAndPermissions {
                identity: stranger,
                raw_permissions: BTreeSet::new(),
            }]),
            serialized_group_core_details: b"group".to_vec(),
            photo: None,
        };
        let outcome = alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(instance_id(1), ReceptionChannel::Local, message),
            )
            .unwrap();
        assert_eq!(outcome.abort, Some(Abort::NotAContact(stranger)));
        assert!(alice.store.groups.is_empty());
    }

    #[test]
    fn failed_upload_deletes_group() {
        let mut alice = Device::new(1);
        let bob = Device::new(2);
        alice.add_contact(&bob);

        let instance_id = instance_id(1);
        let outcome = alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(
                    instance_id,
                    ReceptionChannel::Local,
                    creation_message("https://blobs", &[(&bob, false)]),
                ),
            )
            .unwrap();
        let group_id = outcome.state.group_id().cloned().unwrap();
        assert!(alice.store.groups.contains_key(&group_id));
        assert_matches!(
            alice.channel.outbound.last(),
            Some(Outbound::ServerQuery {
                query: ServerQuery::CreateGroupBlob { .. },
                ..
            })
        );

        let outcome = dispatch(
            outcome.state,
            Inbound::new(
                instance_id,
                ReceptionChannel::ServerQuery,
                ProtocolMessage::UploadGroupBlob {
                    result: crate::message::UploadResult::PermanentFailure,
                },
            ),
            &mut alice.collaborators(),
        )
        .unwrap();
        assert_eq!(outcome.state, ProtocolState::Final);
        assert_eq!(outcome.abort, Some(Abort::UploadFailed));
        assert_eq!(outcome.events, vec![Event::GroupUpdateFailed { group_id: group_id.clone() }]);
        assert!(!alice.store.groups.contains_key(&group_id));
    }
}
