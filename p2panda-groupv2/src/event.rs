// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use crate::blob::ServerPhotoInfo;
use crate::identifier::GroupIdentifier;

/// Events returned next to the new state, to be handled by the application once the step's
/// transaction committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Group creation or update could not be completed.
    GroupUpdateFailed { group_id: GroupIdentifier },

    /// Members, permissions or details of a group changed locally.
    GroupMembersChanged { group_id: GroupIdentifier },

    /// Photo of the group has to be downloaded from the server.
    PhotoDownloadRequested {
        group_id: GroupIdentifier,
        server_photo_info: ServerPhotoInfo,
    },

    /// Scratch copy of a photo is not needed anymore and can be removed.
    ScratchPhotoReleased { path: PathBuf },
}
