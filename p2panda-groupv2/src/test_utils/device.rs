// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::channel::Outbound;
use crate::config::Config;
use crate::crypto::Rng;
use crate::dispatch::{Collaborators, Outcome, ProtocolError, dispatch};
use crate::identity::{DeviceId, Identity, Uid};
use crate::message::Inbound;
use crate::state::ProtocolState;
use crate::test_utils::channel::MemoryChannel;
use crate::test_utils::solver::MemorySolver;
use crate::test_utils::store::MemoryStore;

/// One device of an identity together with all collaborators it needs to run the protocol.
#[derive(Debug)]
pub struct Device {
    pub identity: Identity,
    pub device_id: DeviceId,
    pub store: MemoryStore,
    pub channel: MemoryChannel,
    pub solver: MemorySolver,
    pub rng: Rng,
    pub config: Config,
}

impl Device {
    /// Creates a device of a fresh identity, fully determined by the seed.
    pub fn new(seed: u8) -> Self {
        let rng = Rng::from_seed([seed; 32]);
        let mut solver = MemorySolver::default();
        let identity = solver.generate_identity(&rng).unwrap();
        Self {
            identity,
            device_id: Uid::from_bytes([seed; 32]),
            store: MemoryStore::new(identity, format!("identity {seed}").into_bytes()),
            channel: MemoryChannel::default(),
            solver,
            rng,
            config: Config::default(),
        }
    }

    /// Creates another device of the same identity which shares contacts and channels with this
    /// one.
    pub fn sibling(&mut self, seed: u8) -> Device {
        let device_id = Uid::from_bytes([seed; 32]);
        let mut store = MemoryStore::new(self.identity, self.store.owned_core_details.clone());
        store.contacts = self.store.contacts.clone();
        store.other_owned_devices = self.store.other_owned_devices.clone();
        store.other_owned_devices.insert(self.device_id);
        self.store.other_owned_devices.insert(device_id);

        Device {
            identity: self.identity,
            device_id,
            store,
            channel: MemoryChannel {
                outbound: Vec::new(),
                confirmed_channels: self.channel.confirmed_channels.clone(),
            },
            solver: self.solver.clone(),
            rng: Rng::from_seed([seed; 32]),
            config: self.config.clone(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Makes the other identity a contact with a confirmed channel to the given device.
    pub fn add_contact(&mut self, other: &Device) {
        self.store
            .contacts
            .insert(other.identity, other.store.owned_core_details.clone());
        self.channel.confirm(other.identity, other.device_id);
    }

    pub fn collaborators(&mut self) -> Collaborators<'_, MemoryStore, MemoryChannel, MemorySolver> {
        Collaborators::new(
            self.identity,
            &mut self.store,
            &mut self.channel,
            &self.solver,
            &self.rng,
            &self.config,
        )
    }

    pub fn receive(
        &mut self,
        state: ProtocolState,
        inbound: Inbound,
    ) -> Result<Outcome, ProtocolError> {
        dispatch(state, inbound, &mut self.collaborators())
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.channel.outbound)
    }
}
