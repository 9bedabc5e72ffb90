// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory collaborators and a simulated network of devices and blob server for tests.
mod channel;
mod device;
mod network;
mod server;
mod solver;
mod store;

use std::collections::BTreeSet;

pub use channel::MemoryChannel;
pub use device::Device;
pub use network::Network;
pub use server::{BlobServer, HostedBlob};
pub use solver::{MemorySolver, SolverError};
pub use store::{MemoryStore, StoreError, StoredGroup};

use crate::identifier::ProtocolInstanceId;
use crate::message::{IdentityAndPermissions, ProtocolMessage};
use crate::permission::Permission;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

pub fn instance_id(seed: u8) -> ProtocolInstanceId {
    ProtocolInstanceId::from_bytes([seed; 32])
}

/// Raw permissions of an administrator (`true`) or a plain member (`false`).
pub fn raw_permissions(admin: bool) -> BTreeSet<String> {
    let mut permissions = BTreeSet::from([Permission::SendMessage.raw().to_string()]);
    if admin {
        permissions.insert(Permission::GroupAdmin.raw().to_string());
    }
    permissions
}

/// Request to create a group administrated by the local device with the given members.
pub fn creation_message(server_url: &str, members: &[(&Device, bool)]) -> ProtocolMessage {
    ProtocolMessage::InitiateGroupCreation {
        server_url: server_url.to_string(),
        own_raw_permissions: raw_permissions(true),
        other_members: members
            .iter()
            .map(|(device, admin)| IdentityAndPermissions {
                identity: device.identity,
                raw_permissions: raw_permissions(*admin),
            })
            .collect(),
        serialized_group_core_details: b"group".to_vec(),
        photo: None,
    }
}
