// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Configuration of the group protocol engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Number of temporary blob upload failures after which a group update is given up.
    pub(crate) max_failed_upload_count: u32,

    /// Length in bytes of the nonce each member proves knowledge of the group with.
    pub(crate) group_invitation_nonce_len: usize,

    /// Length in bytes of the nonce identifying a blob lock on the server.
    pub(crate) lock_nonce_len: usize,

    /// Encrypted blobs are padded to a multiple of this many bytes.
    pub(crate) blob_padding: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_failed_upload_count: 10,
            group_invitation_nonce_len: 16,
            lock_nonce_len: 32,
            blob_padding: 4096,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_failed_upload_count(mut self, count: u32) -> Self {
        self.max_failed_upload_count = count;
        self
    }

    pub fn group_invitation_nonce_len(mut self, len: usize) -> Self {
        self.group_invitation_nonce_len = len;
        self
    }

    pub fn lock_nonce_len(mut self, len: usize) -> Self {
        self.lock_nonce_len = len;
        self
    }

    /// Padding is at least one byte.
    pub fn blob_padding(mut self, padding: usize) -> Self {
        self.blob_padding = padding.max(1);
        self
    }
}
