// SPDX-License-Identifier: MIT OR Apache-2.0

//! Requests sent to the untrusted blob server.
//!
//! Responses re-enter the protocol as messages received on
//! [`ReceptionChannel::ServerQuery`](crate::channel::ReceptionChannel::ServerQuery).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::blob::ServerPhotoInfo;
use crate::crypto::ed25519::Signature;
use crate::identifier::GroupIdentifier;
use crate::identity::QueryId;
use crate::seed::AdminPublicKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerQuery {
    /// Answered by a `DownloadGroupBlob` message carrying the same query id.
    GetGroupBlob {
        group_id: GroupIdentifier,
        query_id: QueryId,
    },

    CreateGroupBlob {
        group_id: GroupIdentifier,
        admin_public_key: AdminPublicKey,
        #[serde(with = "serde_bytes")]
        encrypted_blob: Vec<u8>,
    },

    /// Requires the lock obtained with the same nonce. The signature is computed with the
    /// current admin key over a `GroupUpdate` challenge.
    UpdateGroupBlob {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        lock_nonce: Vec<u8>,
        #[serde(with = "serde_bytes")]
        encrypted_blob: Vec<u8>,
        admin_public_key: AdminPublicKey,
        signature: Signature,
    },

    RequestGroupBlobLock {
        group_id: GroupIdentifier,
        #[serde(with = "serde_bytes")]
        lock_nonce: Vec<u8>,
        signature: Signature,
    },

    DeleteGroupBlob {
        group_id: GroupIdentifier,
        signature: Signature,
    },

    /// Appends a leave log entry to the group.
    PutGroupLog {
        group_id: GroupIdentifier,
        signature: Signature,
    },

    /// Uploads the encrypted group photo.
    PutUserData {
        server_photo_info: ServerPhotoInfo,
        photo: PathBuf,
    },
}
