//! The shared system bus.
//!
//! Components submit payloads with [`Port::send_to`]. Each tick the router
//! moves submissions into its pending buffer, then walks the buffer in
//! arrival order and delivers every chunk whose lane still has budget left
//! this tick. Chunks that do not fit wait for the next tick.

mod lane;
mod port;

pub use lane::{Delivery, Lane};
pub use port::{BusSender, Port};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::clock;
use lane::{Chunk, Envelope};

/// Bus geometry and clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bytes each lane may carry per tick.
    pub width: usize,
    /// Ticks per second.
    pub frequency: u32,
}

impl BusConfig {
    /// Largest chunk a payload is cut into: `width / 8` fragments, at least one.
    pub fn chunk_size(&self) -> usize {
        (self.width / 8).max(1)
    }

    /// Time between two router ticks.
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.frequency.max(1)
    }
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub ticks: u64,
    pub delivered_fragments: u64,
    /// Chunk-ticks spent waiting for lane budget.
    pub deferrals: u64,
    /// Chunks still in the pending buffer.
    pub in_flight: usize,
}

/// The router. Owns the pending buffer and the lane queues.
pub struct Bus {
    config: BusConfig,
    submit: Sender<Envelope>,
    submissions: Receiver<Envelope>,
    pending: VecDeque<Chunk>,
    outbound: HashMap<String, [Sender<Delivery>; 3]>,
    inbound: HashMap<String, [Receiver<Delivery>; 3]>,
    stats: BusStats,
}

impl Bus {
    pub fn new(config: BusConfig) -> Self {
        let (submit, submissions) = unbounded();
        Self {
            config,
            submit,
            submissions,
            pending: VecDeque::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            stats: BusStats::default(),
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Create the three lane queues for `name`. Calling it twice is a no-op.
    pub fn make_channel(&mut self, name: &str) {
        if self.outbound.contains_key(name) {
            return;
        }
        let (address_tx, address_rx) = unbounded();
        let (data_tx, data_rx) = unbounded();
        let (instruction_tx, instruction_rx) = unbounded();
        self.outbound.insert(name.to_string(), [address_tx, data_tx, instruction_tx]);
        self.inbound.insert(name.to_string(), [address_rx, data_rx, instruction_rx]);
    }

    /// Send-only handle.
    pub fn sender(&self) -> BusSender {
        BusSender { submit: self.submit.clone() }
    }

    /// Receiving endpoint for an existing channel.
    pub fn port(&self, name: &str) -> Result<Port, BusError> {
        let lanes = self
            .inbound
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownChannel(name.to_string()))?;
        Ok(Port::new(name, self.sender(), lanes))
    }

    /// Nothing submitted and nothing pending.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.submissions.is_empty()
    }

    /// One router pass. Returns the number of fragments delivered.
    pub fn tick(&mut self) -> Result<usize, BusError> {
        let chunk_size = self.config.chunk_size();
        for envelope in self.submissions.try_iter() {
            self.pending.extend(lane::slice(envelope, chunk_size));
        }

        let mut admitted = [0usize; 3];
        let mut delivered = 0;
        let mut waiting = VecDeque::with_capacity(self.pending.len());

        while let Some(chunk) = self.pending.pop_front() {
            let used = &mut admitted[chunk.lane.slot()];
            if *used + chunk.size() > self.config.width {
                waiting.push_back(chunk);
                continue;
            }
            *used += chunk.size();
            delivered += chunk.size();
            self.deliver(chunk)?;
        }

        if !waiting.is_empty() {
            log::debug!("bus: {} chunk(s) deferred to next tick", waiting.len());
        }

        self.pending = waiting;
        self.stats.ticks += 1;
        self.stats.delivered_fragments += delivered as u64;
        self.stats.deferrals += self.pending.len() as u64;
        self.stats.in_flight = self.pending.len();
        Ok(delivered)
    }

    fn deliver(&self, chunk: Chunk) -> Result<(), BusError> {
        let lanes = self
            .outbound
            .get(&chunk.channel)
            .ok_or_else(|| BusError::UnknownChannel(chunk.channel.clone()))?;

        log::trace!(
            "bus: {} -> {}/{} ({} fragments, {:?})",
            chunk.delivery.origin,
            chunk.channel,
            chunk.lane,
            chunk.size(),
            chunk.delivery.signal
        );
        lanes[chunk.lane.slot()]
            .send(chunk.delivery)
            .map_err(|_| BusError::Disconnected)
    }

    /// Start the periodic delivery loop on its own thread.
    ///
    /// The loop stops when `stop` is raised or a delivery fails, handing the
    /// bus back for inspection.
    pub fn run(self, stop: Arc<AtomicBool>) -> JoinHandle<Result<Bus, BusError>> {
        let period = self.config.period();
        clock::spawn_ticker("bus", self, period, stop, Bus::tick)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.config)
            .field("channels", &self.outbound.keys().collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Errors raised by the router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no channel named {0:?}")]
    UnknownChannel(String),

    #[error("bus disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::fragment::stamp;
    use crate::isa::{FragmentType, Origin, Signal};

    fn literals(n: usize) -> Vec<crate::isa::Fragment> {
        let bytes: Vec<_> = (0..n).map(|i| (FragmentType::Literal, i as u8)).collect();
        stamp(0, Signal::Write, Origin::Loader, &bytes)
    }

    fn bus(width: usize) -> Bus {
        let mut bus = Bus::new(BusConfig { width, frequency: 10 });
        bus.make_channel("memory");
        bus
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(BusConfig { width: 8, frequency: 1 }.chunk_size(), 1);
        assert_eq!(BusConfig { width: 32, frequency: 1 }.chunk_size(), 4);
        assert_eq!(BusConfig { width: 4, frequency: 1 }.chunk_size(), 1);
    }

    #[test]
    fn test_deliver_within_budget() {
        let mut bus = bus(8);
        let port = bus.port("memory").unwrap();
        port.send_to("memory", Origin::Loader, Signal::Write, literals(4)).unwrap();

        assert_eq!(bus.tick().unwrap(), 4);
        assert!(bus.is_idle());
        assert_eq!(port.drain().len(), 4);
    }

    #[test]
    fn test_excess_deferred_not_dropped() {
        let mut bus = bus(8);
        let port = bus.port("memory").unwrap();
        port.send_to("memory", Origin::Loader, Signal::Write, literals(20)).unwrap();

        assert_eq!(bus.tick().unwrap(), 8);
        assert_eq!(port.drain().len(), 8);
        assert_eq!(bus.stats().in_flight, 12);

        assert_eq!(bus.tick().unwrap(), 8);
        assert_eq!(bus.tick().unwrap(), 4);
        assert_eq!(port.drain().len(), 12);
        assert!(bus.is_idle());
        assert_eq!(bus.stats().delivered_fragments, 20);
    }

    #[test]
    fn test_lanes_have_separate_budgets() {
        let mut bus = bus(8);
        let port = bus.port("memory").unwrap();
        let mut payload = literals(8);
        let bytes: Vec<_> = (0..8).map(|i| (FragmentType::Call, i as u8)).collect();
        payload.extend(stamp(1, Signal::Write, Origin::Loader, &bytes));
        port.send_to("memory", Origin::Loader, Signal::Write, payload).unwrap();

        assert_eq!(bus.tick().unwrap(), 16);
        assert!(port.receive_from(Lane::Data).is_some());
        assert!(port.receive_from(Lane::Instruction).is_some());
    }

    #[test]
    fn test_first_come_first_served() {
        let mut bus = bus(8);
        let port = bus.port("memory").unwrap();
        let first = stamp(1, Signal::Write, Origin::Loader, &[(FragmentType::Literal, 1); 8]);
        let second = stamp(2, Signal::Write, Origin::Loader, &[(FragmentType::Literal, 2); 8]);
        port.send_to("memory", Origin::Loader, Signal::Write, first).unwrap();
        port.send_to("memory", Origin::Loader, Signal::Write, second).unwrap();

        bus.tick().unwrap();
        assert!(port.drain().iter().all(|f| f.key == 1));
        bus.tick().unwrap();
        assert!(port.drain().iter().all(|f| f.key == 2));
    }

    #[test]
    fn test_unknown_channel() {
        let mut bus = bus(8);
        assert!(matches!(bus.port("gpu"), Err(BusError::UnknownChannel(_))));

        bus.sender().send_to("gpu", Origin::Cpu, Signal::Read, literals(1)).unwrap();
        assert_eq!(bus.tick(), Err(BusError::UnknownChannel("gpu".into())));
    }

    #[test]
    fn test_receive_from_empty_lane() {
        let bus = bus(8);
        let port = bus.port("memory").unwrap();
        assert!(port.receive_from(Lane::Address).is_none());
        assert!(!port.has_waiting());
    }
}
