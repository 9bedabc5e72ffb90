// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

use crate::channel::Outbound;
use crate::identity::{DeviceId, Identity};
use crate::traits::ChannelPost;

/// Collects everything a device posts, to be routed by the test network.
#[derive(Clone, Debug, Default)]
pub struct MemoryChannel {
    pub outbound: Vec<Outbound>,
    pub confirmed_channels: BTreeMap<Identity, BTreeSet<DeviceId>>,
}

impl MemoryChannel {
    pub fn confirm(&mut self, identity: Identity, device_id: DeviceId) {
        self.confirmed_channels
            .entry(identity)
            .or_default()
            .insert(device_id);
    }
}

impl ChannelPost for MemoryChannel {
    type Error = Infallible;

    fn post(&mut self, outbound: Outbound) -> Result<(), Self::Error> {
        self.outbound.push(outbound);
        Ok(())
    }

    fn confirmed_channel_device_uids(
        &self,
        identity: &Identity,
    ) -> Result<BTreeSet<DeviceId>, Self::Error> {
        Ok(self
            .confirmed_channels
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }
}
