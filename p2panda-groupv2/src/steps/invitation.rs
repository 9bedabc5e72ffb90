// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handling of blob keys received for a group, either as an invitation or as a membership update.
//!
//! Keys can arrive over a pairwise channel (with the main seed), over a broadcast (never with
//! the main seed), from another owned device or from a batch sent after a channel was created.
//! Whatever their origin, they are merged into the collected candidates and the latest blob is
//! downloaded.
use std::collections::BTreeSet;

use tracing::debug;

use crate::channel::{Dialog, ReceptionChannel, SendChannel};
use crate::collected::InvitationCollectedData;
use crate::dispatch::{Collaborators, Discard, Outcome, ProtocolError, correlates, store_error};
use crate::identifier::GroupIdentifier;
use crate::identity::{DeviceId, Identity, Uid};
use crate::message::{Inbound, ProtocolMessage};
use crate::query::ServerQuery;
use crate::seed::BlobKeys;
use crate::state::{DownloadingGroupBlob, OwnNonceAndMembers, ProtocolState};
use crate::steps::{fallback_state, send_ping, unexpected_message};
use crate::traits::{ChannelPost, GroupStore, SolveChallenge};

/// Keys received for a group and who vouches for them.
struct ReceivedKeys {
    group_id: GroupIdentifier,
    group_version: u64,
    blob_keys: BlobKeys,
    inviter: Option<Identity>,

    /// Owned devices already reached by the sender, `None` when the keys must not be forwarded.
    notified_owned_devices: Option<BTreeSet<DeviceId>>,
}

impl ReceivedKeys {
    fn from_inbound(message: ProtocolMessage, channel: &ReceptionChannel) -> Option<Self> {
        let received = match message {
            ProtocolMessage::InvitationOrMembersUpdate {
                group_id,
                group_version,
                blob_keys,
                notified_device_uids,
            } => {
                let ReceptionChannel::ObliviousChannel {
                    remote_identity, ..
                } = channel
                else {
                    return None;
                };
                Self {
                    group_id,
                    group_version,
                    blob_keys,
                    inviter: Some(*remote_identity),
                    notified_owned_devices: Some(notified_device_uids),
                }
            }
            // The sender of a broadcast is unknown, a main seed in it can not be trusted.
            ProtocolMessage::InvitationOrMembersUpdateBroadcast {
                group_id,
                group_version,
                blob_keys,
            } => Self {
                group_id,
                group_version,
                blob_keys: blob_keys.without_main_seed(),
                inviter: None,
                notified_owned_devices: Some(BTreeSet::new()),
            },
            ProtocolMessage::InvitationOrMembersUpdatePropagated {
                group_id,
                group_version,
                blob_keys,
                inviter,
            } => Self {
                group_id,
                group_version,
                blob_keys,
                inviter,
                notified_owned_devices: None,
            },
            ProtocolMessage::BlobKeysAfterChannelCreation {
                group_id,
                group_version,
                blob_keys,
                inviter,
            } => Self {
                group_id,
                group_version,
                blob_keys,
                inviter: Some(inviter),
                notified_owned_devices: None,
            },
            _ => return None,
        };
        Some(received)
    }
}

pub(crate) fn process_invitation_or_members_update<S, C, X>(
    state: ProtocolState,
    inbound: Inbound,
    collaborators: &mut Collaborators<'_, S, C, X>,
) -> Result<Outcome, ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let protocol_instance_id = inbound.protocol_instance_id;
    let Some(received) = ReceivedKeys::from_inbound(inbound.message, &inbound.channel) else {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::UnknownSender,
        ));
    };
    let ReceivedKeys {
        group_id,
        group_version,
        blob_keys,
        inviter,
        notified_owned_devices,
    } = received;

    if !correlates(&protocol_instance_id, &group_id)? {
        return Ok(Outcome::discarded(
            fallback_state(state),
            Discard::CorrelationMismatch,
        ));
    }

    let owned_identity = collaborators.owned_identity;

    if let Some(notified_owned_devices) = notified_owned_devices {
        let devices: BTreeSet<DeviceId> = collaborators
            .store
            .other_owned_device_uids()
            .map_err(store_error)?
            .difference(&notified_owned_devices)
            .copied()
            .collect();
        if !devices.is_empty() {
            collaborators.send(
                protocol_instance_id,
                SendChannel::ObliviousChannel {
                    to: owned_identity,
                    device_uids: devices,
                },
                ProtocolMessage::InvitationOrMembersUpdatePropagated {
                    group_id: group_id.clone(),
                    group_version,
                    blob_keys: blob_keys.clone(),
                    inviter,
                },
            )?;
        }
    }

    if let ProtocolState::InvitationReceived(invitation) = &state {
        if invitation.server_blob.group_version >= group_version {
            return Ok(Outcome::discarded(
                state,
                Discard::VersionNotNewer {
                    received: group_version,
                },
            ));
        }
    }

    // Keys for a group we already joined are a membership update.
    let mut lease = None;
    let local_version = collaborators
        .store
        .group_version(&group_id)
        .map_err(store_error)?;
    if let Some(local_version) = local_version {
        if group_version < local_version {
            return Ok(Outcome::discarded(
                fallback_state(state),
                Discard::OutdatedVersion {
                    received: group_version,
                    known: local_version,
                },
            ));
        }

        // The sender does not know we joined yet.
        if let Some(inviter) = &inviter {
            ping_if_pending(collaborators, &group_id, inviter)?;
        }

        if group_version == local_version {
            return Ok(Outcome::discarded(
                fallback_state(state),
                Discard::VersionNotNewer {
                    received: group_version,
                },
            ));
        }

        lease = Some(
            collaborators
                .store
                .freeze_group(&group_id)
                .map_err(store_error)?,
        );
    }

    let (dialog_id, collected_data, last_known_own_nonce_and_members) = match state {
        ProtocolState::Initial => (
            Uid::random(collaborators.rng)?,
            InvitationCollectedData::new(),
            None,
        ),
        ProtocolState::NeedMoreSeeds(need_more_seeds) => {
            lease = lease.or(need_more_seeds.lease);
            (
                need_more_seeds.dialog_id,
                need_more_seeds.collected_data,
                need_more_seeds.last_known_own_nonce_and_members,
            )
        }
        ProtocolState::InvitationReceived(invitation) => {
            let Some((_, own_group_invitation_nonce)) = invitation
                .server_blob
                .own_permissions_and_nonce(&owned_identity)
            else {
                return Ok(Outcome::discarded(
                    ProtocolState::InvitationReceived(invitation),
                    Discard::ForeignInvitationNonce,
                ));
            };

            // The user can not answer while the newer version is fetched.
            collaborators.dialog(
                protocol_instance_id,
                invitation.dialog_id,
                Dialog::FreezeInvite {
                    group_id: group_id.clone(),
                    inviter: invitation.inviter,
                },
            )?;

            let other_members = invitation
                .server_blob
                .other_group_members(&owned_identity)
                .into_iter()
                .map(|member| member.identity)
                .collect();
            (
                invitation.dialog_id,
                InvitationCollectedData::new().inserting_blob_keys_candidates(
                    &invitation.blob_keys,
                    Some(&invitation.inviter),
                ),
                Some(OwnNonceAndMembers {
                    own_group_invitation_nonce,
                    other_members,
                }),
            )
        }
        state => return unexpected_message(state),
    };

    let mut collected_data = collected_data;
    if let Some(local_keys) = collaborators
        .store
        .blob_keys(&group_id)
        .map_err(store_error)?
    {
        collected_data =
            collected_data.inserting_blob_keys_candidates(&local_keys, Some(&owned_identity));
    }
    let collected_data = collected_data.inserting_blob_keys_candidates(&blob_keys, inviter.as_ref());

    let query_id = Uid::random(collaborators.rng)?;
    collaborators.query(
        protocol_instance_id,
        ServerQuery::GetGroupBlob {
            group_id: group_id.clone(),
            query_id,
        },
    )?;

    debug!("downloading version {group_version} of group {group_id}");

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

fn ping_if_pending<S, C, X>(
    collaborators: &mut Collaborators<'_, S, C, X>,
    group_id: &GroupIdentifier,
    identity: &Identity,
) -> Result<(), ProtocolError>
where
    S: GroupStore,
    C: ChannelPost,
    X: SolveChallenge,
{
    let is_pending = collaborators
        .store
        .other_members(group_id)
        .map_err(store_error)?
        .iter()
        .any(|member| &member.identity == identity && member.is_pending);
    if !is_pending {
        return Ok(());
    }
    let Some(own_group_invitation_nonce) = collaborators
        .store
        .own_group_invitation_nonce(group_id)
        .map_err(store_error)?
    else {
        return Ok(());
    };
    send_ping(
        collaborators,
        group_id,
        &own_group_invitation_nonce,
        identity,
        false,
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::channel::{Outbound, ReceptionChannel, SendChannel};
    use crate::dispatch::Discard;
    use crate::identifier::{Category, GroupIdentifier, GroupUid};
    use crate::message::{Inbound, ProtocolMessage};
    use crate::query::ServerQuery;
    use crate::seed::{BlobKeys, Seed};
    use crate::state::ProtocolState;
    use crate::test_utils::{Device, instance_id};

    fn broadcast(group_id: &GroupIdentifier, main_seed: Option<Seed>) -> ProtocolMessage {
        ProtocolMessage::InvitationOrMembersUpdateBroadcast {
            group_id: group_id.clone(),
            group_version: 1,
            blob_keys: BlobKeys::new(main_seed, Seed::from_bytes([2; 32]), None),
        }
    }

    #[test]
    fn reject_wrong_correlation_id() {
        let mut alice = Device::new(1);
        let group_id = GroupIdentifier::new(GroupUid::from_bytes([1; 32]), "https://blobs", Category::Server);

        let outcome = alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(
                    instance_id(9),
                    ReceptionChannel::AsymmetricBroadcast,
                    broadcast(&group_id, None),
                ),
            )
            .unwrap();
        assert_eq!(outcome.state, ProtocolState::Final);
        assert_eq!(outcome.discard, Some(Discard::CorrelationMismatch));
        assert!(alice.channel.outbound.is_empty());
    }

    #[test]
    fn broadcast_main_seed_is_never_collected() {
        let mut alice = Device::new(1);
        let group_id = GroupIdentifier::new(GroupUid::from_bytes([1; 32]), "https://blobs", Category::Server);

        let outcome = alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(
                    group_id.protocol_instance_id().unwrap(),
                    ReceptionChannel::AsymmetricBroadcast,
                    broadcast(&group_id, Some(Seed::from_bytes([3; 32]))),
                ),
            )
            .unwrap();

        let ProtocolState::DownloadingGroupBlob(downloading) = outcome.state else {
            panic!("expected download to start");
        };
        assert_eq!(downloading.collected_data.main_seed_candidates().count(), 0);
        assert_eq!(downloading.collected_data.version_seed_candidates().len(), 1);
        assert_matches!(
            alice.channel.outbound.last(),
            Some(Outbound::ServerQuery {
                query: ServerQuery::GetGroupBlob { query_id, .. },
                ..
            }) if query_id == &downloading.expected_query_id
        );
    }

    #[test]
    fn forward_to_devices_which_were_not_notified() {
        let mut alice = Device::new(1);
        let alice_laptop = alice.sibling(2);
        let alice_tablet = alice.sibling(3);
        let bob = Device::new(4);
        alice.add_contact(&bob);
        let group_id = GroupIdentifier::new(GroupUid::from_bytes([1; 32]), "https://blobs", Category::Server);

        alice
            .receive(
                ProtocolState::Initial,
                Inbound::new(
                    group_id.protocol_instance_id().unwrap(),
                    ReceptionChannel::ObliviousChannel {
                        remote_identity: bob.identity,
                        remote_device: bob.device_id,
                    },
                    ProtocolMessage::InvitationOrMembersUpdate {
                        group_id: group_id.clone(),
                        group_version: 0,
                        blob_keys: BlobKeys::new(
                            Some(Seed::from_bytes([3; 32])),
                            Seed::from_bytes([4; 32]),
                            None,
                        ),
                        notified_device_uids: [alice_laptop.device_id].into(),
                    },
                ),
            )
            .unwrap();

        assert_matches!(
            &alice.channel.outbound[0],
            Outbound::Protocol {
                channel: SendChannel::ObliviousChannel { to, device_uids },
                message: ProtocolMessage::InvitationOrMembersUpdatePropagated { inviter, .. },
                ..
            } if to == &alice.identity
                && device_uids == &[alice_tablet.device_id].into()
                && inviter == &Some(bob.identity)
        );
    }
}
