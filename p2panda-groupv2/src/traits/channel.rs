// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::error::Error;

use crate::channel::Outbound;
use crate::identity::{DeviceId, Identity};

/// Hands outbound messages, server queries and dialogs to the transport layer.
///
/// Delivery is at-least-once and unordered across channel kinds.
pub trait ChannelPost {
    type Error: Error + Send + Sync + 'static;

    fn post(&mut self, outbound: Outbound) -> Result<(), Self::Error>;

    /// Devices of the identity we share a confirmed pairwise channel with.
    fn confirmed_channel_device_uids(
        &self,
        identity: &Identity,
    ) -> Result<BTreeSet<DeviceId>, Self::Error>;
}
