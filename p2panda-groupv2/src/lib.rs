// SPDX-License-Identifier: MIT OR Apache-2.0

//! `p2panda-groupv2` keeps the membership of end-to-end encrypted groups consistent across all
//! devices of all members, using an untrusted blob server as the single point of coordination.
//!
//! The current state of a group (members, their permissions, group details and photo) is kept
//! in a "server blob". The blob is signed by the administrator who uploaded it, encrypted
//! (XChaCha20-Poly1305) with keys derived from two seeds and stored on a server which never sees
//! any plaintext:
//!
//! * The **main seed** is handed to every member over a pairwise, end-to-end encrypted channel
//!   and rarely changes.
//! * The **version seed** changes with every uploaded version and may be broadcast to all
//!   members.
//!
//! Only administrators hold the **admin key** which authenticates writes to the server. Which
//! identities are administrators is decided by the administrators chain, a hash chain of blocks
//! signed by the administrators of the previous block. A member never accepts a chain which does
//! not extend the one it already trusts.
//!
//! ## Protocol
//!
//! Every group is driven by a small state machine, one instance per group and device. Inbound
//! messages from other devices, the server, the user interface or the application itself are
//! handed to [`dispatch`] together with the current [`ProtocolState`]. The dispatcher selects
//! the step handling this message in this state, runs it and returns the next state, together
//! with events for the application and the reason a message was dropped, if any.
//!
//! Outbound messages, server queries and dialogs are posted through the [`ChannelPost`]
//! interface, group data is read and written through [`GroupStore`] and signatures of the owned
//! identity are created by [`SolveChallenge`]. Delivery, persistence and key custody are left to
//! the application.
//!
//! ## Concurrent updates
//!
//! Administrators lock the blob on the server before uploading a new version. A lock request
//! replaces any previous lock, a failed upload is retried with a fresh lock up to a configurable
//! number of times (see [`Config`]). Members only ever move forward: a blob older than the
//! version a device already knows is discarded, which protects against a server serving stale
//! data.
//!
//! ## Leaving without write access
//!
//! Members who are not administrators can not write the blob. They leave (or reject an
//! invitation) by appending a signed entry to the log of the group on the server. Every device
//! downloading the blob removes members found in the log before using it.
pub mod blob;
pub mod cbor;
pub mod chain;
pub mod challenge;
pub mod changeset;
pub mod channel;
pub mod collected;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod event;
pub mod identifier;
pub mod identity;
pub mod message;
pub mod permission;
pub mod query;
pub mod seed;
pub mod state;
mod steps;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;

pub use blob::{GroupMember, ServerBlob, ServerPhotoInfo};
pub use chain::AdministratorsChain;
pub use changeset::{Change, Changeset};
pub use config::Config;
pub use crypto::{Rng, RngError};
pub use dispatch::{Abort, Collaborators, Discard, Outcome, ProtocolError, dispatch};
pub use event::Event;
pub use identifier::{Category, GroupIdentifier, GroupUid, ProtocolInstanceId};
pub use identity::{DeviceId, DialogId, Identity};
pub use message::{Inbound, ProtocolMessage};
pub use permission::Permission;
pub use seed::BlobKeys;
pub use state::ProtocolState;
pub use traits::{ChannelPost, GroupStore, SolveChallenge};
