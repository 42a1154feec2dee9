//! Component endpoints on the bus.

use crossbeam_channel::{Receiver, Sender};
use crate::bus::lane::{Delivery, Envelope, Lane};
use crate::bus::BusError;
use crate::isa::{Fragment, Origin, Signal};

/// Submission handle. Cheap to clone; any number of threads may send.
#[derive(Debug, Clone)]
pub struct BusSender {
    pub(crate) submit: Sender<Envelope>,
}

impl BusSender {
    /// Queue a payload for delivery to `channel`.
    pub fn send_to(
        &self,
        channel: &str,
        origin: Origin,
        signal: Signal,
        payload: Vec<Fragment>,
    ) -> Result<(), BusError> {
        let envelope = Envelope { channel: channel.to_string(), origin, signal, payload };
        self.submit.send(envelope).map_err(|_| BusError::Disconnected)
    }
}

/// A named channel's receiving end plus a sender.
#[derive(Debug, Clone)]
pub struct Port {
    name: String,
    sender: BusSender,
    lanes: [Receiver<Delivery>; 3],
}

impl Port {
    pub(crate) fn new(name: &str, sender: BusSender, lanes: [Receiver<Delivery>; 3]) -> Self {
        Self { name: name.to_string(), sender, lanes }
    }

    /// Channel this port receives on.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send_to(
        &self,
        channel: &str,
        origin: Origin,
        signal: Signal,
        payload: Vec<Fragment>,
    ) -> Result<(), BusError> {
        self.sender.send_to(channel, origin, signal, payload)
    }

    /// Oldest ready delivery on one lane, or `None` without waiting.
    pub fn receive_from(&self, lane: Lane) -> Option<Delivery> {
        self.lanes[lane.slot()].try_recv().ok()
    }

    /// Every fragment waiting on any lane of this channel.
    pub fn drain(&self) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        for lane in Lane::ALL {
            while let Some(delivery) = self.receive_from(lane) {
                fragments.extend(delivery.payload);
            }
        }
        fragments
    }

    /// Whether any lane still holds an undelivered message.
    pub fn has_waiting(&self) -> bool {
        self.lanes.iter().any(|lane| !lane.is_empty())
    }
}
