// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use crate::blob::ServerPhotoInfo;
use crate::challenge::Challenge;
use crate::crypto::ed25519::Signature;
use crate::identifier::GroupIdentifier;
use crate::message::{DownloadResult, LockResult, ProtocolMessage, UploadResult};
use crate::query::ServerQuery;
use crate::seed::AdminPublicKey;

/// Encrypted blob of one group as the server keeps it.
#[derive(Clone, Debug)]
pub struct HostedBlob {
    pub encrypted_blob: Vec<u8>,
    pub admin_public_key: AdminPublicKey,
    pub log_entries: Vec<Signature>,
    pub lock_nonce: Option<Vec<u8>>,
}

/// Untrusted blob server answering queries immediately.
///
/// Requests signed with the admin key are checked against the key registered for the group,
/// the server never sees any plaintext.
#[derive(Clone, Debug, Default)]
pub struct BlobServer {
    pub blobs: BTreeMap<GroupIdentifier, HostedBlob>,
    pub photos: Vec<(ServerPhotoInfo, PathBuf)>,

    /// Number of lock requests received so far.
    pub lock_requests: usize,

    /// Returned for every blob update instead of applying it, if set.
    pub forced_upload_result: Option<UploadResult>,
}

impl BlobServer {
    pub fn answer(&mut self, query: ServerQuery) -> ProtocolMessage {
        match query {
            ServerQuery::GetGroupBlob { group_id, query_id } => {
                let result = match self.blobs.get(&group_id) {
                    Some(hosted) => DownloadResult::BlobDownloaded {
                        encrypted_blob: hosted.encrypted_blob.clone(),
                        log_entries: hosted.log_entries.clone(),
                        admin_public_key: hosted.admin_public_key,
                    },
                    None => DownloadResult::BlobWasDeletedFromServer,
                };
                ProtocolMessage::DownloadGroupBlob { query_id, result }
            }
            ServerQuery::CreateGroupBlob {
                group_id,
                admin_public_key,
                encrypted_blob,
            } => {
                if self.blobs.contains_key(&group_id) {
                    return ProtocolMessage::UploadGroupBlob {
                        result: UploadResult::PermanentFailure,
                    };
                }
                self.blobs.insert(
                    group_id,
                    HostedBlob {
                        encrypted_blob,
                        admin_public_key,
                        log_entries: Vec::new(),
                        lock_nonce: None,
                    },
                );
                ProtocolMessage::UploadGroupBlob {
                    result: UploadResult::Success,
                }
            }
            ServerQuery::RequestGroupBlobLock {
                group_id,
                lock_nonce,
                signature,
            } => {
                self.lock_requests += 1;
                let challenge = Challenge::GroupLockNonce {
                    lock_nonce: lock_nonce.clone(),
                };
                let result = match self.blobs.get_mut(&group_id) {
                    Some(hosted)
                        if challenge.verify_admin(&signature, &hosted.admin_public_key) =>
                    {
                        // A newer lock replaces the previous one.
                        hosted.lock_nonce = Some(lock_nonce.clone());
                        LockResult::LockObtained {
                            encrypted_blob: hosted.encrypted_blob.clone(),
                            log_entries: hosted.log_entries.clone(),
                            admin_public_key: hosted.admin_public_key,
                            lock_nonce,
                        }
                    }
                    _ => LockResult::PermanentFailure,
                };
                ProtocolMessage::RequestServerLock { result }
            }
            ServerQuery::UpdateGroupBlob {
                group_id,
                lock_nonce,
                encrypted_blob,
                admin_public_key,
                signature,
            } => {
                let result = match self.forced_upload_result {
                    Some(result) => result,
                    None => self.update(
                        &group_id,
                        lock_nonce,
                        encrypted_blob,
                        admin_public_key,
                        &signature,
                    ),
                };
                ProtocolMessage::UploadGroupBlob { result }
            }
            ServerQuery::DeleteGroupBlob {
                group_id,
                signature,
            } => {
                let success = self.blobs.get(&group_id).is_some_and(|hosted| {
                    Challenge::GroupDelete.verify_admin(&signature, &hosted.admin_public_key)
                });
                if success {
                    self.blobs.remove(&group_id);
                }
                ProtocolMessage::DeleteGroupBlobFromServer { success }
            }
            ServerQuery::PutGroupLog {
                group_id,
                signature,
            } => {
                if let Some(hosted) = self.blobs.get_mut(&group_id) {
                    hosted.log_entries.push(signature);
                }
                ProtocolMessage::PutGroupLogOnServer
            }
            ServerQuery::PutUserData {
                server_photo_info,
                photo,
            } => {
                self.photos.push((server_photo_info, photo));
                ProtocolMessage::UploadGroupPhoto
            }
        }
    }

    fn update(
        &mut self,
        group_id: &GroupIdentifier,
        lock_nonce: Vec<u8>,
        encrypted_blob: Vec<u8>,
        admin_public_key: AdminPublicKey,
        signature: &Signature,
    ) -> UploadResult {
        let Some(hosted) = self.blobs.get_mut(group_id) else {
            return UploadResult::PermanentFailure;
        };
        if hosted.lock_nonce.as_ref() != Some(&lock_nonce) {
            debug!("lock of group {group_id} is held by another update");
            return UploadResult::TemporaryFailure;
        }
        let challenge = Challenge::GroupUpdate {
            lock_nonce,
            encrypted_blob: encrypted_blob.clone(),
            admin_public_key,
        };
        if !challenge.verify_admin(signature, &hosted.admin_public_key) {
            return UploadResult::PermanentFailure;
        }
        hosted.encrypted_blob = encrypted_blob;
        hosted.admin_public_key = admin_public_key;
        hosted.lock_nonce = None;
        UploadResult::Success
    }
}
