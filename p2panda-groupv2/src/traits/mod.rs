// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces of the collaborators the protocol engine consumes.
mod challenge;
mod channel;
mod store;

pub use challenge::SolveChallenge;
pub use channel::ChannelPost;
pub use store::{FreezeLease, GroupStore, StoredMember, TrustedPhoto, UpdateAuthor};
