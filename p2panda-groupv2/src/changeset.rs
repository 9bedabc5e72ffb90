// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locally authored edits of a group, applied by an administrator on top of the latest blob.
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;
use crate::permission::Permission;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    MemberRemoved {
        identity: Identity,
    },
    MemberAdded {
        identity: Identity,
        permissions: BTreeSet<Permission>,
    },
    MemberChanged {
        identity: Identity,
        permissions: BTreeSet<Permission>,
    },
    /// Administrators may change their own permissions.
    OwnPermissionsChanged {
        permissions: BTreeSet<Permission>,
    },
    GroupDetails {
        #[serde(with = "serde_bytes")]
        serialized_group_core_details: Vec<u8>,
    },
    /// Sets a new group photo, `None` removes it.
    GroupPhoto {
        photo: Option<PathBuf>,
    },
}

impl Change {
    /// Position of the change when a changeset is applied.
    fn order(&self) -> u8 {
        match self {
            Change::MemberRemoved { .. } => 0,
            Change::MemberChanged { .. } => 1,
            Change::MemberAdded { .. } => 2,
            Change::OwnPermissionsChanged { .. } => 3,
            Change::GroupDetails { .. } => 4,
            Change::GroupPhoto { .. } => 5,
        }
    }

    fn member(&self) -> Option<&Identity> {
        match self {
            Change::MemberRemoved { identity }
            | Change::MemberAdded { identity, .. }
            | Change::MemberChanged { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

/// Validated set of changes, kept in the order in which they are applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Change>", into = "Vec<Change>")]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new(mut changes: Vec<Change>) -> Result<Self, ChangesetError> {
        let mut members = HashSet::new();
        for identity in changes.iter().filter_map(Change::member) {
            if !members.insert(*identity) {
                return Err(ChangesetError::DuplicateMember(*identity));
            }
        }

        let count = |predicate: fn(&Change) -> bool| changes.iter().filter(|c| predicate(c)).count();
        if count(|change| matches!(change, Change::GroupDetails { .. })) > 1 {
            return Err(ChangesetError::DuplicateGroupDetails);
        }
        if count(|change| matches!(change, Change::GroupPhoto { .. })) > 1 {
            return Err(ChangesetError::DuplicateGroupPhoto);
        }
        if count(|change| matches!(change, Change::OwnPermissionsChanged { .. })) > 1 {
            return Err(ChangesetError::DuplicateOwnPermissions);
        }

        changes.sort_by_key(Change::order);
        Ok(Self { changes })
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Path of the new group photo, if the changeset sets one.
    pub fn photo(&self) -> Option<&Path> {
        self.changes.iter().find_map(|change| match change {
            Change::GroupPhoto { photo } => photo.as_deref(),
            _ => None,
        })
    }

    pub fn contains_delete_photo_change(&self) -> bool {
        self.changes
            .iter()
            .any(|change| matches!(change, Change::GroupPhoto { photo: None }))
    }

    /// Returns a changeset where the photo change, if any, is replaced by the given path.
    pub fn with_photo(&self, photo: PathBuf) -> Self {
        let mut changes: Vec<Change> = self
            .changes
            .iter()
            .filter(|change| !matches!(change, Change::GroupPhoto { .. }))
            .cloned()
            .collect();
        changes.push(Change::GroupPhoto { photo: Some(photo) });
        Self { changes }
    }

    pub fn removed_members(&self) -> BTreeSet<Identity> {
        self.changes
            .iter()
            .filter_map(|change| match change {
                Change::MemberRemoved { identity } => Some(*identity),
                _ => None,
            })
            .collect()
    }

    pub fn added_members(&self) -> BTreeSet<Identity> {
        self.changes
            .iter()
            .filter_map(|change| match change {
                Change::MemberAdded { identity, .. } => Some(*identity),
                _ => None,
            })
            .collect()
    }
}

impl TryFrom<Vec<Change>> for Changeset {
    type Error = ChangesetError;

    fn try_from(changes: Vec<Change>) -> Result<Self, Self::Error> {
        Self::new(changes)
    }
}

impl From<Changeset> for Vec<Change> {
    fn from(changeset: Changeset) -> Self {
        changeset.changes
    }
}

#[derive(Debug, Error)]
pub enum ChangesetError {
    #[error("changeset contains more than one change for member {0}")]
    DuplicateMember(Identity),

    #[error("changeset contains more than one group details change")]
    DuplicateGroupDetails,

    #[error("changeset contains more than one group photo change")]
    DuplicateGroupPhoto,

    #[error("changeset contains more than one own permissions change")]
    DuplicateOwnPermissions,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use assert_matches::assert_matches;

    use crate::cbor::{decode_cbor, encode_cbor};
    use crate::identity::Identity;
    use crate::permission::Permission;

    use super::{Change, Changeset, ChangesetError};

    #[test]
    fn changes_are_ordered() {
        let alice = Identity::from_bytes([1; 32]);
        let bob = Identity::from_bytes([2; 32]);

        let changeset = Changeset::new(vec![
            Change::GroupDetails {
                serialized_group_core_details: b"name".to_vec(),
            },
            Change::MemberAdded {
                identity: alice,
                permissions: BTreeSet::from([Permission::SendMessage]),
            },
            Change::MemberRemoved { identity: bob },
        ])
        .unwrap();

        assert_matches!(changeset.changes()[0], Change::MemberRemoved { .. });
        assert_matches!(changeset.changes()[1], Change::MemberAdded { .. });
        assert_matches!(changeset.changes()[2], Change::GroupDetails { .. });
        assert_eq!(changeset.removed_members(), BTreeSet::from([bob]));
        assert_eq!(changeset.added_members(), BTreeSet::from([alice]));
    }

    #[test]
    fn reject_conflicting_changes() {
        let alice = Identity::from_bytes([1; 32]);

        assert_matches!(
            Changeset::new(vec![
                Change::MemberRemoved { identity: alice },
                Change::MemberChanged {
                    identity: alice,
                    permissions: BTreeSet::new(),
                },
            ]),
            Err(ChangesetError::DuplicateMember(_))
        );

        assert_matches!(
            Changeset::new(vec![
                Change::GroupPhoto { photo: None },
                Change::GroupPhoto {
                    photo: Some(PathBuf::from("/tmp/photo.jpg")),
                },
            ]),
            Err(ChangesetError::DuplicateGroupPhoto)
        );

        // Decoding runs the same validation.
        let bytes = encode_cbor(&vec![
            Change::GroupPhoto { photo: None },
            Change::GroupPhoto { photo: None },
        ])
        .unwrap();
        assert!(decode_cbor::<Changeset, _>(&bytes[..]).is_err());
    }

    #[test]
    fn photo_changes() {
        let changeset = Changeset::new(vec![Change::GroupPhoto { photo: None }]).unwrap();
        assert!(changeset.contains_delete_photo_change());
        assert!(changeset.photo().is_none());

        let changeset = changeset.with_photo(PathBuf::from("/scratch/photo"));
        assert!(!changeset.contains_delete_photo_change());
        assert_eq!(changeset.photo(), Some(PathBuf::from("/scratch/photo").as_path()));
    }
}
