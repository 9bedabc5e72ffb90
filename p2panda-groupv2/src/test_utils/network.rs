// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use crate::channel::{Dialog, Outbound, ReceptionChannel, SendChannel};
use crate::dispatch::{Abort, Discard, ProtocolError};
use crate::event::Event;
use crate::identifier::{GroupIdentifier, ProtocolInstanceId};
use crate::identity::DialogId;
use crate::message::{Inbound, ProtocolMessage};
use crate::state::ProtocolState;
use crate::test_utils::device::Device;
use crate::test_utils::server::BlobServer;
use crate::test_utils::store::StoredGroup;

/// Upper bound of delivered messages per run, guards against message loops in tests.
const MAX_DELIVERIES: usize = 10_000;

/// Routes messages between devices and the blob server until no message is left.
///
/// Every device runs one protocol instance per protocol instance id. Messages which no step
/// accepts in the current state of an instance are kept and delivered again once the instance
/// moved on, like a message which stays in the inbox until it can be processed.
#[derive(Debug, Default)]
pub struct Network {
    pub devices: Vec<Device>,
    pub server: BlobServer,
    pub instances: BTreeMap<(usize, ProtocolInstanceId), ProtocolState>,
    pub events: Vec<(usize, Event)>,
    pub discards: Vec<(usize, Discard)>,
    pub aborts: Vec<(usize, Abort)>,
    pub errors: Vec<(usize, ProtocolError)>,
    pub dialogs: BTreeMap<(usize, DialogId), (ProtocolInstanceId, Dialog)>,

    /// Messages sent over asymmetric broadcasts, by sender.
    pub broadcasts: Vec<(usize, ProtocolMessage)>,
    queue: VecDeque<(usize, Inbound)>,
    parked: BTreeMap<(usize, ProtocolInstanceId), Vec<Inbound>>,
}

impl Network {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    pub fn inject(&mut self, device: usize, inbound: Inbound) {
        self.queue.push_back((device, inbound));
    }

    /// Delivers queued messages until the network is quiet.
    pub fn run(&mut self) {
        let mut deliveries = 0;
        while let Some((device, inbound)) = self.queue.pop_front() {
            deliveries += 1;
            assert!(deliveries < MAX_DELIVERIES, "message loop in test network");
            self.deliver(device, inbound);
        }
    }

    /// Answers the first pending invitation dialog shown on the device.
    pub fn answer_dialog(&mut self, device: usize, accept: bool) -> bool {
        let Some((dialog_id, protocol_instance_id)) =
            self.dialogs
                .iter()
                .find_map(|((index, dialog_id), (protocol_instance_id, dialog))| {
                    (*index == device && matches!(dialog, Dialog::AcceptInvite { .. }))
                        .then_some((*dialog_id, *protocol_instance_id))
                })
        else {
            return false;
        };
        self.inject(
            device,
            Inbound::new(
                protocol_instance_id,
                ReceptionChannel::UserInterface,
                ProtocolMessage::DialogAcceptGroupV2Invitation {
                    dialog_id,
                    invitation_accepted: accept,
                },
            ),
        );
        self.run();
        true
    }

    pub fn state(
        &self,
        device: usize,
        protocol_instance_id: &ProtocolInstanceId,
    ) -> Option<&ProtocolState> {
        self.instances.get(&(device, *protocol_instance_id))
    }

    pub fn group(&self, device: usize, group_id: &GroupIdentifier) -> Option<&StoredGroup> {
        self.devices[device].store.groups.get(group_id)
    }

    pub fn discards_of(&self, device: usize) -> Vec<&Discard> {
        self.discards
            .iter()
            .filter(|(index, _)| *index == device)
            .map(|(_, discard)| discard)
            .collect()
    }

    pub fn aborts_of(&self, device: usize) -> Vec<&Abort> {
        self.aborts
            .iter()
            .filter(|(index, _)| *index == device)
            .map(|(_, abort)| abort)
            .collect()
    }

    fn deliver(&mut self, device: usize, inbound: Inbound) {
        let key = (device, inbound.protocol_instance_id);
        let state = self.instances.remove(&key).unwrap_or_default();
        let previous = state.clone();
        trace!(
            "device {device} receives {:?} in state {:?}",
            inbound.message.tag(),
            previous.tag()
        );

        let outcome = match self.devices[device].receive(state, inbound.clone()) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.errors.push((device, err));
                self.keep_state(key, previous);
                return;
            }
        };

        self.events
            .extend(outcome.events.into_iter().map(|event| (device, event)));
        if let Some(abort) = outcome.abort {
            self.aborts.push((device, abort));
        }
        match outcome.discard {
            Some(Discard::NoStep) => self.parked.entry(key).or_default().push(inbound),
            Some(discard) => self.discards.push((device, discard)),
            None => (),
        }

        let changed = outcome.state != previous;
        self.keep_state(key, outcome.state);

        for outbound in self.devices[device].take_outbound() {
            self.route(device, outbound);
        }

        if changed {
            if let Some(parked) = self.parked.remove(&key) {
                self.queue
                    .extend(parked.into_iter().map(|inbound| (device, inbound)));
            }
        }
    }

    fn keep_state(&mut self, key: (usize, ProtocolInstanceId), state: ProtocolState) {
        match state {
            ProtocolState::Initial | ProtocolState::Final => (),
            state => {
                self.instances.insert(key, state);
            }
        }
    }

    fn route(&mut self, sender: usize, outbound: Outbound) {
        match outbound {
            Outbound::Protocol {
                protocol_instance_id,
                channel,
                message,
            } => {
                if matches!(channel, SendChannel::AsymmetricBroadcast { .. }) {
                    self.broadcasts.push((sender, message.clone()));
                }
                for (recipient, reception) in self.recipients(sender, &channel) {
                    self.queue.push_back((
                        recipient,
                        Inbound::new(protocol_instance_id, reception, message.clone()),
                    ));
                }
            }
            Outbound::ServerQuery {
                protocol_instance_id,
                query,
            } => {
                let response = self.server.answer(query);
                self.queue.push_back((
                    sender,
                    Inbound::new(
                        protocol_instance_id,
                        ReceptionChannel::ServerQuery,
                        response,
                    ),
                ));
            }
            Outbound::Dialog {
                protocol_instance_id,
                dialog_id,
                dialog,
            } => match dialog {
                Dialog::Delete => {
                    self.dialogs.remove(&(sender, dialog_id));
                }
                dialog => {
                    self.dialogs
                        .insert((sender, dialog_id), (protocol_instance_id, dialog));
                }
            },
        }
    }

    fn recipients(&self, sender: usize, channel: &SendChannel) -> Vec<(usize, ReceptionChannel)> {
        let from = &self.devices[sender];
        let pairwise = |to_owned: bool| {
            if to_owned {
                ReceptionChannel::ObliviousChannelWithOwnedDevice {
                    remote_device: from.device_id,
                }
            } else {
                ReceptionChannel::ObliviousChannel {
                    remote_identity: from.identity,
                    remote_device: from.device_id,
                }
            }
        };

        let others = self
            .devices
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != sender);
        match channel {
            SendChannel::Local => vec![(sender, ReceptionChannel::Local)],
            SendChannel::ObliviousChannel { to, device_uids } => others
                .filter(|(_, device)| {
                    &device.identity == to && device_uids.contains(&device.device_id)
                })
                .map(|(index, _)| (index, pairwise(to == &from.identity)))
                .collect(),
            SendChannel::AsymmetricBroadcast { to } => others
                .filter(|(_, device)| &device.identity == to)
                .map(|(index, _)| (index, ReceptionChannel::AsymmetricBroadcast))
                .collect(),
            SendChannel::AllOwnedDevices => others
                .filter(|(_, device)| device.identity == from.identity)
                .map(|(index, _)| (index, pairwise(true)))
                .collect(),
        }
    }
}
