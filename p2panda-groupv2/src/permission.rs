// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Permissions a group member can hold.
///
/// Permissions are stored in the blob as their raw string representation so that permissions
/// introduced by newer clients survive a round trip through an older one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    GroupAdmin,
    RemoteDeleteAnything,
    EditOrRemoteDeleteOwnMessages,
    ChangeSettings,
    SendMessage,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::GroupAdmin,
        Permission::RemoteDeleteAnything,
        Permission::EditOrRemoteDeleteOwnMessages,
        Permission::ChangeSettings,
        Permission::SendMessage,
    ];

    pub fn raw(&self) -> &'static str {
        match self {
            Permission::GroupAdmin => "ga",
            Permission::RemoteDeleteAnything => "rd",
            Permission::EditOrRemoteDeleteOwnMessages => "eo",
            Permission::ChangeSettings => "cs",
            Permission::SendMessage => "sm",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|permission| permission.raw() == raw)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// Converts a set of permissions into the raw representation stored in a blob.
pub fn to_raw_permissions(permissions: &BTreeSet<Permission>) -> BTreeSet<String> {
    permissions
        .iter()
        .map(|permission| permission.raw().to_string())
        .collect()
}

/// Known permissions contained in a raw set, unknown entries are skipped.
pub fn from_raw_permissions(raw_permissions: &BTreeSet<String>) -> BTreeSet<Permission> {
    raw_permissions
        .iter()
        .filter_map(|raw| Permission::from_raw(raw))
        .collect()
}

pub fn is_group_admin(raw_permissions: &BTreeSet<String>) -> bool {
    raw_permissions.contains(Permission::GroupAdmin.raw())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{Permission, from_raw_permissions, is_group_admin, to_raw_permissions};

    #[test]
    fn raw_conversion() {
        for permission in Permission::ALL {
            assert_eq!(Permission::from_raw(permission.raw()), Some(permission));
        }
        assert_eq!(Permission::from_raw("xx"), None);
    }

    #[test]
    fn unknown_permissions_are_skipped() {
        let raw = BTreeSet::from(["ga".to_string(), "future".to_string()]);
        assert!(is_group_admin(&raw));
        assert_eq!(
            from_raw_permissions(&raw),
            BTreeSet::from([Permission::GroupAdmin])
        );

        let raw = to_raw_permissions(&BTreeSet::from([Permission::SendMessage]));
        assert!(!is_group_admin(&raw));
        assert_eq!(raw, BTreeSet::from(["sm".to_string()]));
    }
}
