// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenarios running several devices and the blob server against each other.
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::chain::AdministratorsChain;
use crate::challenge::Challenge;
use crate::changeset::{Change, Changeset};
use crate::channel::ReceptionChannel;
use crate::config::Config;
use crate::crypto::Rng;
use crate::dispatch::{Abort, Discard};
use crate::event::Event;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::Identity;
use crate::message::{Inbound, ProtocolMessage, UploadResult};
use crate::permission::Permission;
use crate::seed::{BlobKeys, Seed};
use crate::test_utils::{
    Device, MemorySolver, Network, creation_message, instance_id, setup_logging,
};
use crate::traits::SolveChallenge;

const ALICE: usize = 0;
const BOB: usize = 1;
const CAROL: usize = 2;
const DAVE: usize = 3;

const SERVER_URL: &str = "https://blobs.example.org";

/// Makes every identity a contact of every other one, with confirmed channels to all devices.
fn introduce(devices: &mut [Device]) {
    let cards: Vec<_> = devices
        .iter()
        .map(|device| {
            (
                device.identity,
                device.device_id,
                device.store.owned_core_details.clone(),
            )
        })
        .collect();
    for device in devices.iter_mut() {
        for (identity, device_id, details) in &cards {
            if identity == &device.identity {
                continue;
            }
            device.store.contacts.insert(*identity, details.clone());
            device.channel.confirm(*identity, *device_id);
        }
    }
}

/// Alice creates a group with Bob (member) and Carol (administrator), both accept.
///
/// Dave is a contact of everyone but not invited.
fn group_of_three() -> (Network, GroupIdentifier, ProtocolInstanceId) {
    setup_logging();
    let mut devices = vec![
        Device::new(1),
        Device::new(2),
        Device::new(3),
        Device::new(4),
    ];
    introduce(&mut devices);
    let message = creation_message(
        SERVER_URL,
        &[(&devices[BOB], false), (&devices[CAROL], true)],
    );

    let mut network = Network::new(devices);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();

    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .expect("group was created");
    assert!(network.answer_dialog(BOB, true));
    assert!(network.answer_dialog(CAROL, true));
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    let protocol_instance_id = group_id.protocol_instance_id().unwrap();
    (network, group_id, protocol_instance_id)
}

fn update(
    network: &mut Network,
    device: usize,
    protocol_instance_id: ProtocolInstanceId,
    group_id: &GroupIdentifier,
    changes: Vec<Change>,
) {
    network.inject(
        device,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::Local,
            ProtocolMessage::InitiateGroupUpdate {
                group_id: group_id.clone(),
                changeset: Changeset::new(changes).unwrap(),
            },
        ),
    );
}

fn rename(name: &str) -> Vec<Change> {
    vec![Change::GroupDetails {
        serialized_group_core_details: name.as_bytes().to_vec(),
    }]
}

fn version(network: &Network, device: usize, group_id: &GroupIdentifier) -> Option<u64> {
    network
        .group(device, group_id)
        .map(|group| group.server_blob.group_version)
}

fn members(network: &Network, device: usize, group_id: &GroupIdentifier) -> BTreeSet<Identity> {
    network
        .group(device, group_id)
        .map(|group| group.server_blob.group_members.keys().copied().collect())
        .unwrap_or_default()
}

#[test]
fn create_invite_and_confirm_members() {
    let (network, group_id, _) = group_of_three();
    let identities: Vec<Identity> = network.devices.iter().map(|device| device.identity).collect();

    for device in [ALICE, BOB, CAROL] {
        let group = network.group(device, &group_id).unwrap();
        assert_eq!(group.server_blob.group_version, 0);
        assert_eq!(
            members(&network, device, &group_id),
            BTreeSet::from([identities[ALICE], identities[BOB], identities[CAROL]])
        );

        // Every member proved knowledge of the group to every other member.
        assert!(group.pending.is_empty(), "device {device}: {:?}", group.pending);
        assert!(group.frozen.is_none());
        assert!(group.blob_keys.blob_main_seed.is_some());
        assert!(network.events.contains(&(
            device,
            Event::GroupMembersChanged {
                group_id: group_id.clone()
            }
        )));
    }
    assert!(network.group(DAVE, &group_id).is_none());
    assert!(network.dialogs.is_empty());

    // Only administrators hold the admin key.
    let admin_key_of = |device: usize| {
        network
            .group(device, &group_id)
            .unwrap()
            .blob_keys
            .group_admin_private_key
            .clone()
    };
    assert!(admin_key_of(ALICE).is_some());
    assert!(admin_key_of(BOB).is_none());
    assert_eq!(admin_key_of(CAROL), admin_key_of(ALICE));

    assert_eq!(
        network.server.blobs[&group_id].admin_public_key,
        admin_key_of(ALICE).unwrap().public_key()
    );
}

#[test]
fn group_photo_is_uploaded_with_first_version() {
    setup_logging();
    let mut devices = vec![Device::new(1), Device::new(2)];
    introduce(&mut devices);
    let mut message = creation_message(SERVER_URL, &[(&devices[BOB], false)]);
    if let ProtocolMessage::InitiateGroupCreation { photo, .. } = &mut message {
        *photo = Some(PathBuf::from("photos/group.jpg"));
    }

    let mut network = Network::new(devices);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();
    assert!(network.answer_dialog(BOB, true));

    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .unwrap();
    let photo = network.devices[ALICE]
        .store
        .groups[&group_id]
        .photo
        .clone()
        .unwrap();
    assert_eq!(network.server.photos.len(), 1);
    assert_eq!(network.server.photos[0].0, photo.server_photo_info);

    // Bob learns which photo to download.
    assert!(network.events.contains(&(
        BOB,
        Event::PhotoDownloadRequested {
            group_id: group_id.clone(),
            server_photo_info: photo.server_photo_info,
        }
    )));
}

#[test]
fn replayed_and_foreign_pings_are_discarded() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let alice = network.devices[ALICE].identity;
    let bob = network.devices[BOB].identity;
    let bob_nonce = network.group(BOB, &group_id).unwrap().server_blob.group_members[&bob]
        .group_invitation_nonce
        .clone();

    // Bob's ping to Alice was already received once.
    let signature = network.devices[BOB]
        .solver
        .solve_challenge(
            &Challenge::GroupJoinNonce {
                group_id: group_id.clone(),
                nonce: bob_nonce.clone(),
                recipient: alice,
            },
            &bob,
        )
        .unwrap();
    network.inject(
        ALICE,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::AsymmetricBroadcast,
            ProtocolMessage::Ping {
                group_id: group_id.clone(),
                group_invitation_nonce: bob_nonce,
                signature,
                is_response: false,
            },
        ),
    );

    // Dave is not a member of the group.
    let dave = network.devices[DAVE].identity;
    let dave_signature = network.devices[DAVE]
        .solver
        .solve_challenge(
            &Challenge::GroupJoinNonce {
                group_id: group_id.clone(),
                nonce: vec![7; 16],
                recipient: alice,
            },
            &dave,
        )
        .unwrap();
    network.inject(
        ALICE,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::AsymmetricBroadcast,
            ProtocolMessage::Ping {
                group_id: group_id.clone(),
                group_invitation_nonce: vec![7; 16],
                signature: dave_signature,
                is_response: false,
            },
        ),
    );
    let discards_before = network.discards_of(ALICE).len();
    network.run();

    let discards = network.discards_of(ALICE);
    assert_eq!(
        &discards[discards_before..],
        &[&Discard::ReplayedSignature, &Discard::UnknownInvitationNonce]
    );
}

#[test]
fn update_adds_member_and_increments_version() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let dave = network.devices[DAVE].identity;

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        vec![Change::MemberAdded {
            identity: dave,
            permissions: BTreeSet::from([Permission::SendMessage]),
        }],
    );
    network.run();
    assert!(network.answer_dialog(DAVE, true));
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    for device in [ALICE, BOB, CAROL, DAVE] {
        assert_eq!(version(&network, device, &group_id), Some(1), "device {device}");
        assert!(members(&network, device, &group_id).contains(&dave));
        let group = network.group(device, &group_id).unwrap();
        assert!(group.pending.is_empty(), "device {device}: {:?}", group.pending);
        assert!(group.frozen.is_none());
    }

    // A second update moves every member to the next version again.
    update(
        &mut network,
        CAROL,
        protocol_instance_id,
        &group_id,
        rename("renamed by carol"),
    );
    network.run();
    for device in [ALICE, BOB, CAROL, DAVE] {
        let group = network.group(device, &group_id).unwrap();
        assert_eq!(group.server_blob.group_version, 2);
        assert_eq!(group.server_blob.serialized_group_core_details, b"renamed by carol");
    }
}

#[test]
fn keys_without_pairwise_channel_travel_without_main_seed() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let bob = network.devices[BOB].identity;
    network.devices[ALICE].channel.confirmed_channels.remove(&bob);

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        rename("renamed"),
    );
    network.run();

    let keys_broadcast = network.broadcasts.iter().find_map(|(sender, message)| match message {
        ProtocolMessage::InvitationOrMembersUpdateBroadcast { blob_keys, .. } if *sender == ALICE => {
            Some(blob_keys)
        }
        _ => None,
    });
    assert!(keys_broadcast.unwrap().blob_main_seed.is_none());

    // Bob still holds the main seed of the group and reads the new version with it.
    assert_eq!(version(&network, BOB, &group_id), Some(1));
    assert_eq!(
        network.group(BOB, &group_id).unwrap().blob_keys.blob_main_seed,
        network.group(ALICE, &group_id).unwrap().blob_keys.blob_main_seed
    );
}

#[test]
fn adding_member_requires_pairwise_channel() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let dave = network.devices[DAVE].identity;
    network.devices[ALICE].channel.confirmed_channels.remove(&dave);

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        vec![Change::MemberAdded {
            identity: dave,
            permissions: BTreeSet::from([Permission::SendMessage]),
        }],
    );
    network.run();

    assert_eq!(network.aborts_of(ALICE), vec![&Abort::MissingConfirmedChannel(dave)]);
    assert!(network.events.contains(&(
        ALICE,
        Event::GroupUpdateFailed {
            group_id: group_id.clone()
        }
    )));
    assert_eq!(version(&network, ALICE, &group_id), Some(0));
    assert!(network.group(ALICE, &group_id).unwrap().frozen.is_none());
}

#[test]
fn upload_retries_are_capped() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    network.server.forced_upload_result = Some(UploadResult::TemporaryFailure);
    network.server.lock_requests = 0;

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        rename("renamed"),
    );
    network.run();

    // One lock for the first attempt and one for every retry.
    assert_eq!(network.server.lock_requests, 11);
    assert_eq!(network.aborts_of(ALICE), vec![&Abort::RetryLimitReached]);
    assert!(network.events.contains(&(
        ALICE,
        Event::GroupUpdateFailed {
            group_id: group_id.clone()
        }
    )));
    let group = network.group(ALICE, &group_id).unwrap();
    assert_eq!(group.server_blob.group_version, 0);
    assert!(group.frozen.is_none());
}

#[test]
fn concurrent_administrators_converge() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    network.server.lock_requests = 0;

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        rename("renamed by alice"),
    );
    update(
        &mut network,
        CAROL,
        protocol_instance_id,
        &group_id,
        rename("renamed by carol"),
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    // Carol's lock replaced Alice's. Alice's retry then locks the version uploaded by Carol,
    // which she can not read before Carol's keys arrive.
    assert_eq!(network.server.lock_requests, 3);
    assert_eq!(network.aborts_of(ALICE), vec![&Abort::UndecryptableBlob]);
    assert!(network.aborts_of(CAROL).is_empty());

    for device in [ALICE, BOB, CAROL] {
        let group = network.group(device, &group_id).unwrap();
        assert_eq!(group.server_blob.group_version, 1, "device {device}");
        assert_eq!(group.server_blob.serialized_group_core_details, b"renamed by carol");
        assert!(group.frozen.is_none());
    }
}

#[test]
fn server_can_not_roll_back_group() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let outdated_blob = network.server.blobs[&group_id].clone();
    let outdated_version_seed = network
        .group(BOB, &group_id)
        .unwrap()
        .blob_keys
        .blob_version_seed
        .clone();

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        rename("renamed"),
    );
    network.run();
    assert_eq!(version(&network, BOB, &group_id), Some(1));

    // The server serves the first version again while a broadcast announces a newer one.
    network.server.blobs.insert(group_id.clone(), outdated_blob);
    network.inject(
        BOB,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::AsymmetricBroadcast,
            ProtocolMessage::InvitationOrMembersUpdateBroadcast {
                group_id: group_id.clone(),
                group_version: 2,
                blob_keys: BlobKeys::new(None, outdated_version_seed, None),
            },
        ),
    );
    network.run();

    assert_eq!(
        network.discards_of(BOB).last(),
        Some(&&Discard::OutdatedVersion {
            received: 0,
            known: 1
        })
    );
    let group = network.group(BOB, &group_id).unwrap();
    assert_eq!(group.server_blob.group_version, 1);
    assert_eq!(group.server_blob.serialized_group_core_details, b"renamed");
    assert!(group.frozen.is_none());
}

#[test]
fn removed_member_gets_kicked() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let bob = network.devices[BOB].identity;

    update(
        &mut network,
        ALICE,
        protocol_instance_id,
        &group_id,
        vec![Change::MemberRemoved { identity: bob }],
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    assert!(network.group(BOB, &group_id).is_none());
    for device in [ALICE, CAROL] {
        assert_eq!(version(&network, device, &group_id), Some(1));
        assert!(!members(&network, device, &group_id).contains(&bob));
    }
}

#[test]
fn forged_kicks_are_ignored() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let bob = network.devices[BOB].identity;
    let bob_group = network.group(BOB, &group_id).unwrap();
    let main_seed = bob_group.blob_keys.blob_main_seed.clone().unwrap();
    let bob_nonce = bob_group.server_blob.group_members[&bob]
        .group_invitation_nonce
        .clone();
    let trusted_chain = bob_group.server_blob.administrators_chain.clone();

    let rng = Rng::from_seed([42; 32]);
    let mut solver = MemorySolver::default();
    let eve = solver.generate_identity(&rng).unwrap();
    let mut kick = |encrypted_administrators_chain: Vec<u8>| {
        let signature = solver
            .solve_challenge(
                &Challenge::GroupKick {
                    encrypted_administrators_chain: encrypted_administrators_chain.clone(),
                    group_invitation_nonce: bob_nonce.clone(),
                },
                &eve,
            )
            .unwrap();
        network.inject(
            BOB,
            Inbound::new(
                protocol_instance_id,
                ReceptionChannel::AsymmetricBroadcast,
                ProtocolMessage::Kick {
                    group_id: group_id.clone(),
                    encrypted_administrators_chain,
                    signature,
                },
            ),
        );
    };

    // Chain of a group Eve created herself.
    let foreign_chain = AdministratorsChain::start_new_chain(&eve, &[], &rng, &solver).unwrap();
    kick(foreign_chain.encrypt(&main_seed, &rng).unwrap());

    // Valid chain, but Eve is not one of its administrators.
    kick(trusted_chain.encrypt(&main_seed, &rng).unwrap());

    let discards_before = network.discards_of(BOB).len();
    network.run();
    let discards = network.discards_of(BOB);
    assert_eq!(
        &discards[discards_before..],
        &[&Discard::InvalidAdministratorsChain, &Discard::InvalidSignature]
    );
    assert_eq!(version(&network, BOB, &group_id), Some(0));
}

fn demote(
    network: &mut Network,
    protocol_instance_id: ProtocolInstanceId,
    group_id: &GroupIdentifier,
    administrator: Identity,
) {
    update(
        network,
        ALICE,
        protocol_instance_id,
        group_id,
        vec![Change::MemberChanged {
            identity: administrator,
            permissions: BTreeSet::from([Permission::SendMessage]),
        }],
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);
}

#[test]
fn kick_with_outdated_chain_is_ignored() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let carol = network.devices[CAROL].identity;
    let outdated_chain = network
        .group(CAROL, &group_id)
        .unwrap()
        .server_blob
        .administrators_chain
        .clone();

    demote(&mut network, protocol_instance_id, &group_id, carol);
    let bob = network.devices[BOB].identity;
    let bob_group = network.group(BOB, &group_id).unwrap();
    assert_eq!(bob_group.server_blob.administrators_chain.len(), 2);
    let main_seed = bob_group.blob_keys.blob_main_seed.clone().unwrap();
    let bob_nonce = bob_group.server_blob.group_members[&bob]
        .group_invitation_nonce
        .clone();

    // Carol was an administrator in the first block of the chain but not anymore.
    let rng = Rng::from_seed([42; 32]);
    let encrypted_administrators_chain = outdated_chain.encrypt(&main_seed, &rng).unwrap();
    let signature = network.devices[CAROL]
        .solver
        .solve_challenge(
            &Challenge::GroupKick {
                encrypted_administrators_chain: encrypted_administrators_chain.clone(),
                group_invitation_nonce: bob_nonce,
            },
            &carol,
        )
        .unwrap();
    network.inject(
        BOB,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::AsymmetricBroadcast,
            ProtocolMessage::Kick {
                group_id: group_id.clone(),
                encrypted_administrators_chain,
                signature,
            },
        ),
    );
    network.run();

    assert_eq!(
        network.discards_of(BOB).last(),
        Some(&&Discard::ForeignAdministratorsChain)
    );
    assert_eq!(version(&network, BOB, &group_id), Some(1));
}

#[test]
fn forked_chain_from_server_is_ignored() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let alice = network.devices[ALICE].identity;
    let carol = network.devices[CAROL].identity;
    let first_chain = network
        .group(ALICE, &group_id)
        .unwrap()
        .server_blob
        .administrators_chain
        .clone();

    demote(&mut network, protocol_instance_id, &group_id, carol);

    // Same genesis block, but the second block keeps Carol as an administrator.
    let forked_chain = first_chain
        .add_block(&alice, &[carol], &network.devices[ALICE].solver)
        .unwrap();
    let bob_group = network.group(BOB, &group_id).unwrap();
    assert!(!bob_group.server_blob.administrators_chain.is_prefix_of(&forked_chain));
    let main_seed = bob_group.blob_keys.blob_main_seed.clone().unwrap();
    let mut forked_blob = bob_group.server_blob.clone();
    forked_blob.administrators_chain = forked_chain;
    forked_blob.group_version = 2;

    let rng = Rng::from_seed([42; 32]);
    let version_seed = Seed::generate(&rng).unwrap();
    let encrypted_blob = forked_blob
        .sign_then_encrypt(
            &alice,
            &main_seed,
            &version_seed,
            &network.devices[ALICE].solver,
            &rng,
            &Config::default(),
        )
        .unwrap();
    network
        .server
        .blobs
        .get_mut(&group_id)
        .unwrap()
        .encrypted_blob = encrypted_blob;

    network.inject(
        BOB,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::AsymmetricBroadcast,
            ProtocolMessage::InvitationOrMembersUpdateBroadcast {
                group_id: group_id.clone(),
                group_version: 2,
                blob_keys: BlobKeys::new(None, version_seed, None),
            },
        ),
    );
    network.run();

    assert_eq!(
        network.discards_of(BOB).last(),
        Some(&&Discard::ForeignAdministratorsChain)
    );
    let group = network.group(BOB, &group_id).unwrap();
    assert_eq!(group.server_blob.group_version, 1);
    assert_eq!(group.server_blob.administrators_chain.len(), 2);
    assert!(group.frozen.is_none());
}

#[test]
fn demotion_rotates_admin_key() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let carol = network.devices[CAROL].identity;
    let admin_key_of = |network: &Network, device: usize| {
        network
            .group(device, &group_id)
            .unwrap()
            .blob_keys
            .group_admin_private_key
            .clone()
    };
    let previous_key = admin_key_of(&network, ALICE).unwrap();
    assert_eq!(admin_key_of(&network, CAROL), Some(previous_key.clone()));

    demote(&mut network, protocol_instance_id, &group_id, carol);

    let rotated_key = admin_key_of(&network, ALICE).unwrap();
    assert_ne!(rotated_key, previous_key);
    assert_eq!(
        network.server.blobs[&group_id].admin_public_key,
        rotated_key.public_key()
    );

    // The demoted administrator neither keeps the old key nor learns the new one.
    assert_eq!(admin_key_of(&network, CAROL), None);
    assert_eq!(admin_key_of(&network, BOB), None);
    assert_eq!(version(&network, CAROL, &group_id), Some(1));
    assert!(
        !network
            .group(CAROL, &group_id)
            .unwrap()
            .server_blob
            .administrators_chain
            .all_current_administrators()
            .contains(&carol)
    );
}

#[test]
fn kick_reaches_every_owned_device() {
    setup_logging();
    let mut alice = Device::new(1);
    let mut bob = Device::new(2);
    let mut bob_laptop = bob.sibling(5);
    alice.add_contact(&bob);
    bob.add_contact(&alice);
    bob_laptop.add_contact(&alice);
    let bob_identity = bob.identity;
    let message = creation_message(SERVER_URL, &[(&bob, false)]);

    let mut network = Network::new(vec![alice, bob, bob_laptop]);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();
    assert!(network.answer_dialog(BOB, true));
    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .unwrap();
    assert!(network.group(2, &group_id).is_some());

    // Each device forwards the kick to the other one before checking it.
    update(
        &mut network,
        ALICE,
        group_id.protocol_instance_id().unwrap(),
        &group_id,
        vec![Change::MemberRemoved {
            identity: bob_identity,
        }],
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    assert!(network.group(BOB, &group_id).is_none());
    assert!(network.group(2, &group_id).is_none());
    assert_eq!(version(&network, ALICE, &group_id), Some(1));
}

#[test]
fn member_leaves_group() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let bob = network.devices[BOB].identity;

    network.inject(
        BOB,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::Local,
            ProtocolMessage::InitiateGroupLeave {
                group_id: group_id.clone(),
            },
        ),
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    assert!(network.group(BOB, &group_id).is_none());
    assert_eq!(network.server.blobs[&group_id].log_entries.len(), 1);

    // Remaining members drop Bob once they consolidated the blob with the leave log.
    for device in [ALICE, CAROL] {
        assert_eq!(version(&network, device, &group_id), Some(0));
        assert!(!members(&network, device, &group_id).contains(&bob));
    }
}

#[test]
fn sole_administrator_can_not_leave() {
    setup_logging();
    let mut devices = vec![Device::new(1), Device::new(2)];
    introduce(&mut devices);
    let message = creation_message(SERVER_URL, &[(&devices[BOB], false)]);
    let mut network = Network::new(devices);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();
    assert!(network.answer_dialog(BOB, true));
    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .unwrap();

    network.inject(
        ALICE,
        Inbound::new(
            group_id.protocol_instance_id().unwrap(),
            ReceptionChannel::Local,
            ProtocolMessage::InitiateGroupLeave {
                group_id: group_id.clone(),
            },
        ),
    );
    network.run();

    assert_eq!(
        network.discards_of(ALICE).last(),
        Some(&&Discard::SoleAdministrator)
    );
    assert!(network.group(ALICE, &group_id).is_some());
    assert!(network.server.blobs[&group_id].log_entries.is_empty());
}

#[test]
fn rejected_invitation_removes_member() {
    setup_logging();
    let mut devices = vec![Device::new(1), Device::new(2), Device::new(3)];
    introduce(&mut devices);
    let message = creation_message(
        SERVER_URL,
        &[(&devices[BOB], false), (&devices[CAROL], true)],
    );
    let mut network = Network::new(devices);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();
    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .unwrap();
    let bob = network.devices[BOB].identity;

    assert!(network.answer_dialog(CAROL, true));
    assert!(network.answer_dialog(BOB, false));
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    assert!(network.group(BOB, &group_id).is_none());
    assert!(network.dialogs.is_empty());
    for device in [ALICE, CAROL] {
        assert!(!members(&network, device, &group_id).contains(&bob));
    }
}

#[test]
fn administrator_disbands_group() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();

    network.inject(
        ALICE,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::Local,
            ProtocolMessage::InitiateGroupDisband {
                group_id: group_id.clone(),
            },
        ),
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    assert!(network.server.blobs.is_empty());
    for device in [ALICE, BOB, CAROL] {
        assert!(network.group(device, &group_id).is_none(), "device {device}");
    }
}

#[test]
fn members_can_not_disband_group() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();

    network.inject(
        BOB,
        Inbound::new(
            protocol_instance_id,
            ReceptionChannel::Local,
            ProtocolMessage::InitiateGroupDisband {
                group_id: group_id.clone(),
            },
        ),
    );
    network.run();

    assert_eq!(
        network.discards_of(BOB).last(),
        Some(&&Discard::NotAnAdministrator)
    );
    assert!(network.server.blobs.contains_key(&group_id));
}

#[test]
fn invitation_reaches_every_owned_device() {
    setup_logging();
    let mut alice = Device::new(1);
    let mut bob = Device::new(2);
    let mut bob_laptop = bob.sibling(5);

    // Alice only knows about Bob's first device.
    alice.add_contact(&bob);
    bob.add_contact(&alice);
    bob_laptop.add_contact(&alice);
    let message = creation_message(SERVER_URL, &[(&bob, false)]);

    let mut network = Network::new(vec![alice, bob, bob_laptop]);
    network.inject(
        ALICE,
        Inbound::new(instance_id(1), ReceptionChannel::Local, message),
    );
    network.run();

    // Both of Bob's devices show the invitation, answering it on one answers it on both.
    assert_eq!(network.dialogs.len(), 2);
    assert!(network.answer_dialog(BOB, true));
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    let group_id = network.devices[ALICE]
        .store
        .groups
        .keys()
        .next()
        .cloned()
        .unwrap();
    assert!(network.dialogs.is_empty());
    assert_eq!(version(&network, BOB, &group_id), Some(0));
    assert_eq!(version(&network, 2, &group_id), Some(0));
    assert!(
        network
            .group(ALICE, &group_id)
            .unwrap()
            .pending
            .is_empty()
    );
}

#[test]
fn keys_are_resent_after_channel_creation() {
    let (mut network, group_id, protocol_instance_id) = group_of_three();
    let bob = network.devices[BOB].identity;
    let bob_device = network.devices[BOB].device_id;

    network.inject(
        ALICE,
        Inbound::new(
            instance_id(7),
            ReceptionChannel::Local,
            ProtocolMessage::InitiateBatchKeysResend {
                contact: bob,
                device: bob_device,
            },
        ),
    );
    network.run();
    assert!(network.errors.is_empty(), "{:?}", network.errors);

    // Bob already holds this version.
    assert_eq!(
        network.discards_of(BOB).last(),
        Some(&&Discard::VersionNotNewer { received: 0 })
    );
    assert!(network.state(BOB, &protocol_instance_id).is_none());
    assert_eq!(version(&network, BOB, &group_id), Some(0));
}
