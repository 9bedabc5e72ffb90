// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key candidates gathered from every message concerning a group we are not yet able to read.
//!
//! Invitations, broadcast updates and propagated copies arrive in any order and each one may
//! only carry part of the keys. Candidates are accumulated here until one combination decrypts
//! the downloaded blob.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::blob::ServerBlob;
use crate::identifier::GroupIdentifier;
use crate::identity::Identity;
use crate::seed::{AdminPrivateKey, AdminPublicKey, BlobKeys, Seed};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCollectedData {
    inviter_and_main_seed_candidates: BTreeMap<Identity, Seed>,
    version_seed_candidates: Vec<Seed>,
    admin_key_candidates: Vec<AdminPrivateKey>,
}

/// Blob decrypted with one of the collected candidate pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedBlob {
    pub inviter: Identity,
    pub blob: ServerBlob,
    pub blob_keys: BlobKeys,
}

impl InvitationCollectedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new value containing the given candidates as well. Inserting the same keys
    /// twice has no effect.
    ///
    /// A main seed is only kept when we know who sent it.
    pub fn inserting_blob_keys_candidates(
        &self,
        blob_keys: &BlobKeys,
        inviter: Option<&Identity>,
    ) -> Self {
        let mut collected = self.clone();

        if let (Some(main_seed), Some(inviter)) = (&blob_keys.blob_main_seed, inviter) {
            collected
                .inviter_and_main_seed_candidates
                .insert(*inviter, main_seed.clone());
        }

        if !collected
            .version_seed_candidates
            .contains(&blob_keys.blob_version_seed)
        {
            collected
                .version_seed_candidates
                .push(blob_keys.blob_version_seed.clone());
        }

        if let Some(admin_key) = &blob_keys.group_admin_private_key {
            if !collected.admin_key_candidates.contains(admin_key) {
                collected.admin_key_candidates.push(admin_key.clone());
            }
        }

        collected
    }

    /// Tries every main seed and version seed pair on the encrypted blob.
    ///
    /// Failing pairs are expected and skipped. The admin private key is picked among the
    /// candidates by comparing it with the public key the server returned.
    pub fn try_to_decrypt(
        &self,
        encrypted_blob: &[u8],
        admin_public_key: &AdminPublicKey,
        expected_group_id: &GroupIdentifier,
    ) -> Option<DecryptedBlob> {
        for (inviter, main_seed) in &self.inviter_and_main_seed_candidates {
            for version_seed in &self.version_seed_candidates {
                let blob = match ServerBlob::decrypt(
                    encrypted_blob,
                    main_seed,
                    version_seed,
                    expected_group_id,
                ) {
                    Ok(blob) => blob,
                    Err(err) => {
                        trace!("candidate seeds of {inviter} did not decrypt blob: {err}");
                        continue;
                    }
                };

                if !blob.administrators_chain.integrity_checked() {
                    continue;
                }

                let group_admin_private_key = self
                    .admin_key_candidates
                    .iter()
                    .find(|key| &key.public_key() == admin_public_key)
                    .cloned();

                return Some(DecryptedBlob {
                    inviter: *inviter,
                    blob,
                    blob_keys: BlobKeys::new(
                        Some(main_seed.clone()),
                        version_seed.clone(),
                        group_admin_private_key,
                    ),
                });
            }
        }

        None
    }

    pub fn main_seed_candidates(&self) -> impl Iterator<Item = (&Identity, &Seed)> {
        self.inviter_and_main_seed_candidates.iter()
    }

    pub fn version_seed_candidates(&self) -> &[Seed] {
        &self.version_seed_candidates
    }

    pub fn admin_key_candidates(&self) -> &[AdminPrivateKey] {
        &self.admin_key_candidates
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::blob::{GroupMember, ServerBlob};
    use crate::chain::AdministratorsChain;
    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::identifier::{Category, GroupIdentifier};
    use crate::identity::Identity;
    use crate::seed::{AdminPrivateKey, BlobKeys, Seed};
    use crate::test_utils::{MemorySolver, raw_permissions};

    use super::InvitationCollectedData;

    #[test]
    fn collect_candidates() {
        let rng = Rng::from_seed([1; 32]);
        let inviter = Identity::from_bytes([1; 32]);
        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed = Seed::generate(&rng).unwrap();
        let admin_key = AdminPrivateKey::generate(&rng).unwrap();
        let blob_keys = BlobKeys::new(Some(main_seed), version_seed, Some(admin_key));

        // Main seeds of unknown senders are dropped.
        let collected =
            InvitationCollectedData::new().inserting_blob_keys_candidates(&blob_keys, None);
        assert_eq!(collected.main_seed_candidates().count(), 0);
        assert_eq!(collected.version_seed_candidates().len(), 1);
        assert_eq!(collected.admin_key_candidates().len(), 1);

        let collected = collected.inserting_blob_keys_candidates(&blob_keys, Some(&inviter));
        let again = collected.inserting_blob_keys_candidates(&blob_keys, Some(&inviter));
        assert_eq!(again, collected);
        assert_eq!(collected.main_seed_candidates().count(), 1);
        assert_eq!(collected.version_seed_candidates().len(), 1);
    }

    #[test]
    fn decrypt_with_matching_candidates() {
        let rng = Rng::from_seed([1; 32]);
        let mut solver = MemorySolver::default();
        let alice = solver.generate_identity(&rng).unwrap();
        let bob = solver.generate_identity(&rng).unwrap();

        let chain = AdministratorsChain::start_new_chain(&alice, &[], &rng, &solver).unwrap();
        let group_id = GroupIdentifier::new(*chain.group_uid(), "https://blobs", Category::Server);
        let blob = ServerBlob {
            administrators_chain: chain,
            group_members: BTreeMap::from([(
                alice,
                GroupMember {
                    identity: alice,
                    raw_permissions: raw_permissions(true),
                    serialized_identity_core_details: b"alice".to_vec(),
                    group_invitation_nonce: vec![1; 16],
                },
            )]),
            group_version: 3,
            serialized_group_core_details: b"group".to_vec(),
            server_photo_info: None,
        };

        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed = Seed::generate(&rng).unwrap();
        let admin_key = AdminPrivateKey::generate(&rng).unwrap();
        let encrypted = blob
            .sign_then_encrypt(
                &alice,
                &main_seed,
                &version_seed,
                &solver,
                &rng,
                &Config::default(),
            )
            .unwrap();

        // An outdated version seed and a foreign admin key arrive first.
        let collected = InvitationCollectedData::new()
            .inserting_blob_keys_candidates(
                &BlobKeys::new(
                    None,
                    Seed::generate(&rng).unwrap(),
                    Some(AdminPrivateKey::generate(&rng).unwrap()),
                ),
                None,
            )
            .inserting_blob_keys_candidates(
                &BlobKeys::new(Some(main_seed.clone()), Seed::generate(&rng).unwrap(), None),
                Some(&bob),
            );
        assert!(
            collected
                .try_to_decrypt(&encrypted, &admin_key.public_key(), &group_id)
                .is_none()
        );

        let collected = collected.inserting_blob_keys_candidates(
            &BlobKeys::new(None, version_seed.clone(), Some(admin_key.clone())),
            None,
        );
        let decrypted = collected
            .try_to_decrypt(&encrypted, &admin_key.public_key(), &group_id)
            .unwrap();
        assert_eq!(decrypted.inviter, bob);
        assert_eq!(decrypted.blob, blob);
        assert_eq!(
            decrypted.blob_keys,
            BlobKeys::new(Some(main_seed), version_seed, Some(admin_key))
        );
    }
}
