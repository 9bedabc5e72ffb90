// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical snapshot of a group as stored encrypted on the blob server.
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::chain::{AdministratorsChain, ChainError};
use crate::challenge::Challenge;
use crate::changeset::{Change, Changeset};
use crate::config::Config;
use crate::crypto::ed25519::Signature;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::xchacha20::{XAeadError, open, seal};
use crate::crypto::{Rng, RngError};
use crate::identifier::GroupIdentifier;
use crate::identity::{Identity, Uid};
use crate::permission::{is_group_admin, to_raw_permissions};
use crate::seed::{Seed, blob_key};
use crate::traits::{GroupStore, SolveChallenge};

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub identity: Identity,
    pub raw_permissions: BTreeSet<String>,
    #[serde(with = "serde_bytes")]
    pub serialized_identity_core_details: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub group_invitation_nonce: Vec<u8>,
}

impl GroupMember {
    pub fn has_group_admin_permission(&self) -> bool {
        is_group_admin(&self.raw_permissions)
    }
}

/// Where to find the encrypted group photo on the server and how to decrypt it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPhotoInfo {
    #[serde(with = "serde_bytes")]
    pub key: [u8; 32],
    pub label: Uid,

    /// Administrator who uploaded the photo.
    pub uploader: Identity,
}

impl ServerPhotoInfo {
    pub fn generate(uploader: &Identity, rng: &Rng) -> Result<Self, RngError> {
        Ok(Self {
            key: rng.random_array()?,
            label: Uid::random(rng)?,
            uploader: *uploader,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBlob {
    pub administrators_chain: AdministratorsChain,

    /// Exactly one entry per member identity.
    pub group_members: BTreeMap<Identity, GroupMember>,

    pub group_version: u64,
    #[serde(with = "serde_bytes")]
    pub serialized_group_core_details: Vec<u8>,
    pub server_photo_info: Option<ServerPhotoInfo>,
}

#[derive(Serialize, Deserialize)]
struct SignedBlob {
    #[serde(with = "serde_bytes")]
    encoded_blob: Vec<u8>,
    signer: Identity,
    signature: Signature,
}

impl ServerBlob {
    /// Signs the blob with the owned identity, pads it and encrypts it with the key derived
    /// from both seeds.
    pub fn sign_then_encrypt<X: SolveChallenge>(
        &self,
        owned_identity: &Identity,
        blob_main_seed: &Seed,
        blob_version_seed: &Seed,
        solver: &X,
        rng: &Rng,
        config: &Config,
    ) -> Result<Vec<u8>, BlobError> {
        let encoded_blob = encode_cbor(self)?;
        let challenge = Challenge::GroupBlob {
            encoded_blob: encoded_blob.clone(),
        };
        let signature = solver
            .solve_challenge(&challenge, owned_identity)
            .map_err(|err| BlobError::Challenge(Box::new(err)))?;
        let signed = encode_cbor(&SignedBlob {
            encoded_blob,
            signer: *owned_identity,
            signature,
        })?;

        let length = u32::try_from(signed.len()).map_err(|_| BlobError::TooLarge(signed.len()))?;
        let unpadded_len = LENGTH_PREFIX_SIZE + signed.len();
        let padded_len = unpadded_len.div_ceil(config.blob_padding) * config.blob_padding;
        let mut plaintext = Vec::with_capacity(padded_len);
        plaintext.extend_from_slice(&length.to_be_bytes());
        plaintext.extend_from_slice(&signed);
        plaintext.resize(padded_len, 0);

        let key = blob_key(blob_main_seed, blob_version_seed)?;
        Ok(seal(&key, &plaintext, rng)?)
    }

    /// Decrypts a blob and checks its signature and administrators chain.
    pub fn decrypt(
        encrypted_blob: &[u8],
        blob_main_seed: &Seed,
        blob_version_seed: &Seed,
        expected_group_id: &GroupIdentifier,
    ) -> Result<Self, BlobError> {
        let key = blob_key(blob_main_seed, blob_version_seed)?;
        let plaintext = open(&key, encrypted_blob)?;

        let (length, padded) = plaintext
            .split_first_chunk::<LENGTH_PREFIX_SIZE>()
            .ok_or(BlobError::InvalidPadding)?;
        let length = u32::from_be_bytes(*length) as usize;
        let signed = padded.get(..length).ok_or(BlobError::InvalidPadding)?;
        let SignedBlob {
            encoded_blob,
            signer,
            signature,
        } = decode_cbor(signed)?;

        let challenge = Challenge::GroupBlob {
            encoded_blob: encoded_blob.clone(),
        };
        if !challenge.verify(&signature, &signer) {
            return Err(BlobError::InvalidSignature);
        }
        let blob: ServerBlob = decode_cbor(&encoded_blob[..])?;

        let administrators_chain = blob
            .administrators_chain
            .with_checked_integrity(&expected_group_id.group_uid)?;
        let administrators = administrators_chain.all_current_administrators();
        if administrators.is_empty() {
            return Err(BlobError::NoAdministrators);
        }
        if !administrators.contains(&signer) {
            return Err(BlobError::SignerNotAdministrator(signer));
        }
        if let Some(member) = blob.group_members.values().find(|member| {
            member.has_group_admin_permission() && !administrators.contains(&member.identity)
        }) {
            return Err(BlobError::AdministratorNotInChain(member.identity));
        }

        Ok(Self {
            administrators_chain,
            ..blob
        })
    }

    /// Removes every member who signed a leave log entry with their invitation nonce.
    pub fn consolidate_with_log_entries(
        &self,
        group_id: &GroupIdentifier,
        log_entries: &[Signature],
    ) -> Self {
        let group_members = self
            .group_members
            .iter()
            .filter(|(_, member)| {
                let challenge = Challenge::GroupLeaveNonce {
                    group_id: group_id.clone(),
                    nonce: member.group_invitation_nonce.clone(),
                };
                !log_entries
                    .iter()
                    .any(|entry| challenge.verify(entry, &member.identity))
            })
            .map(|(identity, member)| (*identity, member.clone()))
            .collect();

        Self {
            group_members,
            ..self.clone()
        }
    }

    /// Applies a locally authored changeset and returns the next version of the blob.
    pub fn consolidate_with_changeset<S, X>(
        &self,
        changeset: &Changeset,
        owned_identity: &Identity,
        store: &S,
        rng: &Rng,
        solver: &X,
        config: &Config,
    ) -> Result<Self, BlobError>
    where
        S: GroupStore,
        X: SolveChallenge,
    {
        let mut serialized_group_core_details = self.serialized_group_core_details.clone();
        let mut server_photo_info = self.server_photo_info.clone();

        // Details of every contact are refreshed, even for members the changeset does not touch.
        let mut group_members = BTreeMap::new();
        for (identity, member) in &self.group_members {
            let mut member = member.clone();
            match store.contact_core_details(identity) {
                Ok(Some(details)) => member.serialized_identity_core_details = details,
                Ok(None) => (),
                Err(err) => debug!("could not refresh core details of {identity}: {err}"),
            }
            group_members.insert(*identity, member);
        }

        for change in changeset.changes() {
            match change {
                Change::MemberRemoved { identity } => {
                    group_members.remove(identity);
                }
                Change::MemberAdded {
                    identity,
                    permissions,
                } => {
                    if group_members.contains_key(identity) {
                        continue;
                    }
                    let details = store
                        .contact_core_details(identity)
                        .map_err(|err| BlobError::Store(Box::new(err)))?
                        .ok_or(BlobError::NotAContact(*identity))?;
                    group_members.insert(
                        *identity,
                        GroupMember {
                            identity: *identity,
                            raw_permissions: to_raw_permissions(permissions),
                            serialized_identity_core_details: details,
                            group_invitation_nonce: rng
                                .random_vec(config.group_invitation_nonce_len)?,
                        },
                    );
                }
                Change::MemberChanged {
                    identity,
                    permissions,
                } => {
                    let Some(member) = group_members.get_mut(identity) else {
                        continue;
                    };
                    let raw_permissions = to_raw_permissions(permissions);
                    if member.raw_permissions != raw_permissions {
                        member.raw_permissions = raw_permissions;
                        member.group_invitation_nonce =
                            rng.random_vec(config.group_invitation_nonce_len)?;
                    }
                }
                Change::OwnPermissionsChanged { permissions } => {
                    let member = group_members
                        .get_mut(owned_identity)
                        .ok_or(BlobError::NotAMember(*owned_identity))?;
                    member.raw_permissions = to_raw_permissions(permissions);
                }
                Change::GroupDetails {
                    serialized_group_core_details: details,
                } => {
                    serialized_group_core_details = details.clone();
                }
                Change::GroupPhoto { photo } => {
                    server_photo_info = match photo {
                        Some(_) => Some(ServerPhotoInfo::generate(owned_identity, rng)?),
                        None => None,
                    };
                }
            }
        }

        let chain_administrators = self.administrators_chain.all_current_administrators();
        let blob_administrators: BTreeSet<Identity> = group_members
            .values()
            .filter(|member| member.has_group_admin_permission())
            .map(|member| member.identity)
            .collect();
        let administrators_chain = if chain_administrators != blob_administrators {
            let other_administrators: Vec<Identity> = blob_administrators
                .into_iter()
                .filter(|identity| identity != owned_identity)
                .collect();
            self.administrators_chain
                .add_block(owned_identity, &other_administrators, solver)?
        } else {
            self.administrators_chain.clone()
        };

        Ok(Self {
            administrators_chain,
            group_members,
            group_version: self.group_version + 1,
            serialized_group_core_details,
            server_photo_info,
        })
    }

    pub fn with_checked_administrators_chain_integrity(
        &self,
        expected_group_id: &GroupIdentifier,
    ) -> Result<Self, BlobError> {
        Ok(Self {
            administrators_chain: self
                .administrators_chain
                .with_checked_integrity(&expected_group_id.group_uid)?,
            ..self.clone()
        })
    }

    /// Only for blobs obtained from an already verified source.
    pub fn with_forced_checked_administrators_chain_integrity(&self) -> Self {
        if self.administrators_chain.integrity_checked() {
            return self.clone();
        }
        Self {
            administrators_chain: self.administrators_chain.with_forced_checked_integrity(),
            ..self.clone()
        }
    }

    /// Raw permissions and invitation nonce of the owned identity, `None` if we are not a member.
    pub fn own_permissions_and_nonce(
        &self,
        owned_identity: &Identity,
    ) -> Option<(BTreeSet<String>, Vec<u8>)> {
        self.group_members.get(owned_identity).map(|member| {
            (
                member.raw_permissions.clone(),
                member.group_invitation_nonce.clone(),
            )
        })
    }

    pub fn other_group_members(&self, owned_identity: &Identity) -> Vec<GroupMember> {
        self.group_members
            .values()
            .filter(|member| &member.identity != owned_identity)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("signed blob of {0} bytes is too large")]
    TooLarge(usize),

    #[error("decrypted blob has an invalid length prefix")]
    InvalidPadding,

    #[error("blob signature is invalid")]
    InvalidSignature,

    #[error("blob was signed by {0} who is not a current administrator")]
    SignerNotAdministrator(Identity),

    #[error("last block of the administrators chain lists no administrator")]
    NoAdministrators,

    #[error("administrator {0} is not listed in the administrators chain")]
    AdministratorNotInChain(Identity),

    #[error("added member {0} is not a contact")]
    NotAContact(Identity),

    #[error("{0} is not a member of the group")]
    NotAMember(Identity),

    #[error("could not sign blob: {0}")]
    Challenge(Box<dyn StdError + Send + Sync + 'static>),

    #[error("store error: {0}")]
    Store(Box<dyn StdError + Send + Sync + 'static>),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use assert_matches::assert_matches;

    use crate::chain::AdministratorsChain;
    use crate::challenge::Challenge;
    use crate::changeset::{Change, Changeset};
    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::identifier::{Category, GroupIdentifier};
    use crate::identity::Identity;
    use crate::permission::Permission;
    use crate::seed::Seed;
    use crate::test_utils::{MemorySolver, MemoryStore, raw_permissions};
    use crate::traits::SolveChallenge;

    use super::{BlobError, GroupMember, ServerBlob};

    struct Setup {
        rng: Rng,
        solver: MemorySolver,
        alice: Identity,
        bob: Identity,
        group_id: GroupIdentifier,
        blob: ServerBlob,
    }

    fn member(identity: Identity, admin: bool, rng: &Rng) -> GroupMember {
        GroupMember {
            identity,
            raw_permissions: raw_permissions(admin),
            serialized_identity_core_details: identity.as_bytes().to_vec(),
            group_invitation_nonce: rng.random_vec(16).unwrap(),
        }
    }

    fn setup() -> Setup {
        let rng = Rng::from_seed([1; 32]);
        let mut solver = MemorySolver::default();
        let alice = solver.generate_identity(&rng).unwrap();
        let bob = solver.generate_identity(&rng).unwrap();

        let chain = AdministratorsChain::start_new_chain(&alice, &[], &rng, &solver).unwrap();
        let group_id = GroupIdentifier::new(*chain.group_uid(), "https://blobs", Category::Server);
        let blob = ServerBlob {
            administrators_chain: chain,
            group_members: BTreeMap::from([
                (alice, member(alice, true, &rng)),
                (bob, member(bob, false, &rng)),
            ]),
            group_version: 0,
            serialized_group_core_details: b"group".to_vec(),
            server_photo_info: None,
        };

        Setup {
            rng,
            solver,
            alice,
            bob,
            group_id,
            blob,
        }
    }

    #[test]
    fn encrypt_and_decrypt() {
        let Setup {
            rng,
            solver,
            alice,
            group_id,
            blob,
            ..
        } = setup();
        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed = Seed::generate(&rng).unwrap();
        let config = Config::default();

        let encrypted = blob
            .sign_then_encrypt(&alice, &main_seed, &version_seed, &solver, &rng, &config)
            .unwrap();
        let decrypted = ServerBlob::decrypt(&encrypted, &main_seed, &version_seed, &group_id).unwrap();
        assert_eq!(decrypted, blob);

        // Blobs of different size are padded to the same length.
        let smaller = ServerBlob {
            serialized_group_core_details: Vec::new(),
            ..blob.clone()
        };
        let encrypted_smaller = smaller
            .sign_then_encrypt(&alice, &main_seed, &version_seed, &solver, &rng, &config)
            .unwrap();
        assert_eq!(encrypted.len(), encrypted_smaller.len());

        // Every version has its own key.
        let other_version_seed = Seed::generate(&rng).unwrap();
        assert_matches!(
            ServerBlob::decrypt(&encrypted, &main_seed, &other_version_seed, &group_id),
            Err(BlobError::XAead(_))
        );
    }

    #[test]
    fn only_administrators_sign_blobs() {
        let Setup {
            rng,
            solver,
            bob,
            group_id,
            blob,
            ..
        } = setup();
        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed = Seed::generate(&rng).unwrap();

        let encrypted = blob
            .sign_then_encrypt(
                &bob,
                &main_seed,
                &version_seed,
                &solver,
                &rng,
                &Config::default(),
            )
            .unwrap();
        assert_matches!(
            ServerBlob::decrypt(&encrypted, &main_seed, &version_seed, &group_id),
            Err(BlobError::SignerNotAdministrator(signer)) if signer == bob
        );
    }

    #[test]
    fn administrators_must_be_in_chain() {
        let Setup {
            rng,
            solver,
            alice,
            bob,
            group_id,
            mut blob,
        } = setup();
        let main_seed = Seed::generate(&rng).unwrap();
        let version_seed = Seed::generate(&rng).unwrap();

        // Bob claims admin permission without being listed in the administrators chain.
        blob.group_members.insert(bob, member(bob, true, &rng));
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
        assert_matches!(
            ServerBlob::decrypt(&encrypted, &main_seed, &version_seed, &group_id),
            Err(BlobError::AdministratorNotInChain(identity)) if identity == bob
        );
    }

    #[test]
    fn leave_log_entries_remove_members() {
        let Setup {
            solver,
            bob,
            group_id,
            blob,
            ..
        } = setup();
        let bob_nonce = blob.group_members[&bob].group_invitation_nonce.clone();

        let foreign_entry = solver
            .solve_challenge(
                &Challenge::GroupLeaveNonce {
                    group_id: group_id.clone(),
                    nonce: vec![0; 16],
                },
                &bob,
            )
            .unwrap();
        let unchanged = blob.consolidate_with_log_entries(&group_id, &[foreign_entry.clone()]);
        assert_eq!(unchanged, blob);

        let leave_entry = solver
            .solve_challenge(
                &Challenge::GroupLeaveNonce {
                    group_id: group_id.clone(),
                    nonce: bob_nonce,
                },
                &bob,
            )
            .unwrap();
        let consolidated =
            blob.consolidate_with_log_entries(&group_id, &[foreign_entry, leave_entry.clone()]);
        assert!(!consolidated.group_members.contains_key(&bob));
        assert_eq!(consolidated.group_version, blob.group_version);

        // Applying the log a second time changes nothing.
        assert_eq!(
            consolidated.consolidate_with_log_entries(&group_id, &[leave_entry]),
            consolidated
        );
    }

    #[test]
    fn changeset_produces_next_version() {
        let Setup {
            rng,
            solver,
            alice,
            bob,
            blob,
            ..
        } = setup();
        let mut store = MemoryStore::new(alice, b"alice".to_vec());
        store.contacts.insert(bob, b"bob, updated".to_vec());
        let config = Config::default();
        let carol = Identity::from_bytes([9; 32]);

        // Only contacts can be added.
        let changeset = Changeset::new(vec![Change::MemberAdded {
            identity: carol,
            permissions: BTreeSet::from([Permission::SendMessage]),
        }])
        .unwrap();
        assert_matches!(
            blob.consolidate_with_changeset(&changeset, &alice, &store, &rng, &solver, &config),
            Err(BlobError::NotAContact(identity)) if identity == carol
        );

        // Promoting Bob extends the administrators chain and gives him a fresh nonce.
        let changeset = Changeset::new(vec![Change::MemberChanged {
            identity: bob,
            permissions: BTreeSet::from([Permission::GroupAdmin, Permission::SendMessage]),
        }])
        .unwrap();
        let next = blob
            .consolidate_with_changeset(&changeset, &alice, &store, &rng, &solver, &config)
            .unwrap();
        assert_eq!(next.group_version, blob.group_version + 1);
        assert_eq!(next.administrators_chain.len(), 2);
        assert_eq!(
            next.administrators_chain.all_current_administrators(),
            BTreeSet::from([alice, bob])
        );
        let bob_member = &next.group_members[&bob];
        assert!(bob_member.has_group_admin_permission());
        assert_ne!(
            bob_member.group_invitation_nonce,
            blob.group_members[&bob].group_invitation_nonce
        );
        assert_eq!(bob_member.serialized_identity_core_details, b"bob, updated");

        // Changing details keeps the chain as it is.
        let changeset = Changeset::new(vec![Change::GroupDetails {
            serialized_group_core_details: b"renamed".to_vec(),
        }])
        .unwrap();
        let renamed = next
            .consolidate_with_changeset(&changeset, &alice, &store, &rng, &solver, &config)
            .unwrap();
        assert_eq!(renamed.group_version, 2);
        assert_eq!(renamed.administrators_chain, next.administrators_chain);
        assert_eq!(renamed.serialized_group_core_details, b"renamed");
    }
}
