//! Word-addressable memory unit.
//!
//! The store is a fixed array of slots, each holding one whole fragment
//! group. The lower half is the program region, filled by the loader through
//! a circular write cursor. The upper half is the data region; CPU data
//! address `a` lives in slot `half + a`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use crate::bus::{BusError, Port};
use crate::clock;
use crate::isa::fragment::{self, CPU_CHANNEL};
use crate::isa::{
    DecodeError, Decoder, EncodeError, Encoder, Fragment, FragmentType, Key, Origin,
    Reassembler, ReassemblyError, Signal, TRANSACTION_KEY_BASE,
};
use crate::word::WordLength;

/// The memory component.
pub struct MemoryUnit {
    port: Port,
    word: WordLength,
    decoder: Decoder,
    encoder: Encoder,
    reassembler: Reassembler,
    slots: Vec<Option<Vec<Fragment>>>,
    /// Next program slot to write.
    cursor: usize,
    /// CPU transactions that arrived ahead of their turn.
    parked: BTreeMap<Key, Vec<Fragment>>,
    next_transaction: Key,
    ticks: u64,
}

impl MemoryUnit {
    /// Build a store of `size` bytes for the given word length.
    pub fn new(port: Port, size: usize, word: WordLength) -> Result<Self, MemoryError> {
        let slots = Self::slot_count(size, word);
        if slots < 2 {
            return Err(MemoryError::TooSmall { size, slots });
        }
        log::debug!("memory: {} slots ({} program, {} data)", slots, slots / 2, slots - slots / 2);

        Ok(Self {
            port,
            word,
            decoder: Decoder::new(word),
            encoder: Encoder::new(&[], word),
            reassembler: Reassembler::new(),
            slots: vec![None; slots],
            cursor: 0,
            parked: BTreeMap::new(),
            next_transaction: TRANSACTION_KEY_BASE,
            ticks: 0,
        })
    }

    /// Slots a store of `size` bytes holds: a quarter of its words.
    pub fn slot_count(size: usize, word: WordLength) -> usize {
        size / word.bytes() / 4
    }

    pub fn word(&self) -> WordLength {
        self.word
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First data slot; also the size of the program region.
    pub fn half(&self) -> usize {
        self.slots.len() / 2
    }

    /// Number of data addresses.
    pub fn data_len(&self) -> usize {
        self.slots.len() - self.half()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // ==== Store ====

    /// Raw slot contents.
    pub fn read(&self, slot: usize) -> Option<&[Fragment]> {
        self.slots.get(slot).and_then(|s| s.as_deref())
    }

    /// Store a program group at the cursor and return its slot.
    ///
    /// The cursor wraps to slot 0 once the program region is full,
    /// overwriting the oldest group.
    pub fn write(&mut self, group: Vec<Fragment>) -> usize {
        if self.cursor >= self.half() {
            log::debug!("memory: program region full, wrapping to slot 0");
            self.cursor = 0;
        }
        let slot = self.cursor;
        self.slots[slot] = Some(group);
        self.cursor += 1;
        slot
    }

    /// Value stored at a data address. Unwritten cells read as 0.
    pub fn read_data(&self, address: i64) -> Result<i64, MemoryError> {
        let slot = self.data_slot(address)?;
        match &self.slots[slot] {
            None => Ok(0),
            Some(group) => self.cell_value(group),
        }
    }

    /// Store `value` at a data address.
    pub fn write_data(&mut self, address: i64, value: i64) -> Result<(), MemoryError> {
        let slot = self.data_slot(address)?;
        let group = self.encoder.encode_words(
            0,
            Signal::Write,
            Origin::Memory,
            &[(FragmentType::Memory, address), (FragmentType::Literal, value)],
        )?;
        self.slots[slot] = Some(group);
        Ok(())
    }

    /// Every written data cell with a non-zero value, by address.
    pub fn data_cells(&self) -> Vec<(i64, i64)> {
        (0..self.data_len() as i64)
            .filter_map(|address| match self.read_data(address) {
                Ok(0) | Err(_) => None,
                Ok(value) => Some((address, value)),
            })
            .collect()
    }

    fn data_slot(&self, address: i64) -> Result<usize, MemoryError> {
        if address < 0 || address >= self.data_len() as i64 {
            return Err(MemoryError::AddressOutOfRange { address, limit: self.data_len() });
        }
        Ok(self.half() + address as usize)
    }

    fn cell_value(&self, group: &[Fragment]) -> Result<i64, MemoryError> {
        let words = self.decoder.words(group)?;
        match words.as_slice() {
            [_, (FragmentType::Literal, value)] => Ok(*value),
            _ => Err(MemoryError::MalformedRequest(group[0].key)),
        }
    }

    // ==== Tick ====

    /// Nothing buffered, parked or waiting on the lanes.
    pub fn is_idle(&self) -> bool {
        self.reassembler.is_empty() && self.parked.is_empty() && !self.port.has_waiting()
    }

    /// Drain the lanes and serve every group completed by this tick.
    ///
    /// Returns the number of groups served.
    pub fn tick(&mut self) -> Result<usize, MemoryError> {
        self.ticks += 1;
        let fragments = self.port.drain();
        let mut served = 0;

        for group in self.reassembler.extend(fragments)? {
            let head = group[0];
            match (head.origin, head.signal) {
                (Origin::Loader, Signal::Write) => {
                    self.store_program(group)?;
                    served += 1;
                }
                (Origin::Cpu, _) => {
                    self.parked.insert(head.key, group);
                }
                (origin, signal) => {
                    return Err(MemoryError::UnexpectedGroup { key: head.key, origin, signal });
                }
            }
        }

        while let Some(group) = self.parked.remove(&self.next_transaction) {
            self.serve(group)?;
            self.next_transaction = self.next_transaction.wrapping_add(1);
            served += 1;
        }
        Ok(served)
    }

    /// Start the tick loop on its own thread.
    pub fn run(self, period: Duration, stop: Arc<AtomicBool>) -> JoinHandle<Result<MemoryUnit, MemoryError>> {
        clock::spawn_ticker("memory", self, period, stop, MemoryUnit::tick)
    }

    fn store_program(&mut self, group: Vec<Fragment>) -> Result<(), MemoryError> {
        let key = group[0].key;
        let slot = self.write(group);
        log::debug!("memory: instruction {} stored at slot {}", key, slot);

        let report = self.encoder.encode_words(
            key,
            Signal::Read,
            Origin::Memory,
            &[(FragmentType::Memory, slot as i64)],
        )?;
        self.port.send_to(CPU_CHANNEL, Origin::Memory, Signal::Read, report)?;
        Ok(())
    }

    fn serve(&mut self, group: Vec<Fragment>) -> Result<(), MemoryError> {
        let key = group[0].key;
        let words = self.decoder.words(&group)?;

        match (group[0].signal, words.as_slice()) {
            (Signal::Read, [(FragmentType::Call, slot)]) => {
                let stored = usize::try_from(*slot)
                    .ok()
                    .filter(|&s| s < self.half())
                    .and_then(|s| self.read(s))
                    .ok_or(MemoryError::EmptySlot(*slot))?;
                let response = fragment::restamp(stored, stored[0].key, Signal::Write, Origin::Memory);
                log::trace!("memory: fetch slot {} -> instruction {}", slot, stored[0].key);
                self.port.send_to(CPU_CHANNEL, Origin::Memory, Signal::Write, response)?;
            }
            (Signal::Read, [(FragmentType::Memory, address)]) => {
                let value = self.read_data(*address)?;
                let response = self.encoder.encode_words(
                    key,
                    Signal::Write,
                    Origin::Memory,
                    &[(FragmentType::Memory, *address), (FragmentType::Literal, value)],
                )?;
                log::trace!("memory: read 0x{:x} = {}", address, value);
                self.port.send_to(CPU_CHANNEL, Origin::Memory, Signal::Write, response)?;
            }
            (Signal::Write, [(FragmentType::Memory, address), (FragmentType::Literal, value)]) => {
                log::trace!("memory: write 0x{:x} = {}", address, value);
                self.write_data(*address, *value)?;
            }
            _ => return Err(MemoryError::MalformedRequest(key)),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryUnit")
            .field("word", &self.word)
            .field("slots", &self.slots.len())
            .field("cursor", &self.cursor)
            .field("parked", &self.parked.len())
            .finish()
    }
}

/// Errors raised by the memory unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory of {size} bytes holds {slots} slot(s); at least 2 are required")]
    TooSmall { size: usize, slots: usize },

    #[error("data address {address} out of range (0-{})", .limit.saturating_sub(1))]
    AddressOutOfRange { address: i64, limit: usize },

    #[error("program slot {0} is empty")]
    EmptySlot(i64),

    #[error("malformed memory request {0}")]
    MalformedRequest(Key),

    #[error("unexpected {signal:?} group {key} from {origin}")]
    UnexpectedGroup { key: Key, origin: Origin, signal: Signal },

    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusConfig};
    use crate::isa::fragment::MEMORY_CHANNEL;

    struct Rig {
        bus: Bus,
        memory: MemoryUnit,
        cpu: Port,
        encoder: Encoder,
    }

    fn rig(size: usize) -> Rig {
        let mut bus = Bus::new(BusConfig { width: 64, frequency: 10 });
        bus.make_channel(MEMORY_CHANNEL);
        bus.make_channel(CPU_CHANNEL);
        let memory = MemoryUnit::new(bus.port(MEMORY_CHANNEL).unwrap(), size, WordLength::Bits16).unwrap();
        let cpu = bus.port(CPU_CHANNEL).unwrap();
        let encoder = Encoder::new(&["A".to_string()], WordLength::Bits16);
        Rig { bus, memory, cpu, encoder }
    }

    impl Rig {
        fn settle(&mut self) {
            for _ in 0..8 {
                self.bus.tick().unwrap();
                self.memory.tick().unwrap();
            }
        }

        fn cpu_request(&self, key: Key, signal: Signal, words: &[(FragmentType, i64)]) {
            let group = self.encoder.encode_words(key, signal, Origin::Cpu, words).unwrap();
            self.cpu.send_to(MEMORY_CHANNEL, Origin::Cpu, signal, group).unwrap();
        }

        fn replies(&mut self) -> Vec<Vec<Fragment>> {
            let mut reassembler = Reassembler::new();
            reassembler.extend(self.cpu.drain()).unwrap()
        }
    }

    #[test]
    fn test_slot_geometry() {
        assert_eq!(MemoryUnit::slot_count(1024, WordLength::Bits16), 128);
        assert_eq!(MemoryUnit::slot_count(1024, WordLength::Bits64), 32);
        let r = rig(1024);
        assert_eq!(r.memory.half(), 64);
        assert_eq!(r.memory.data_len(), 64);
    }

    #[test]
    fn test_too_small() {
        let mut bus = Bus::new(BusConfig { width: 8, frequency: 10 });
        bus.make_channel(MEMORY_CHANNEL);
        let port = bus.port(MEMORY_CHANNEL).unwrap();
        let err = MemoryUnit::new(port, 8, WordLength::Bits16).unwrap_err();
        assert_eq!(err, MemoryError::TooSmall { size: 8, slots: 1 });
    }

    #[test]
    fn test_program_cursor_wraps() {
        let mut r = rig(32); // 4 slots, 2 program
        let g = |k| r.encoder.encode(k, "inc", &["A"], Signal::Write, Origin::Loader).unwrap();
        let (a, b, c) = (g(0), g(1), g(2));
        assert_eq!(r.memory.write(a), 0);
        assert_eq!(r.memory.write(b), 1);
        assert_eq!(r.memory.write(c), 0);
        assert_eq!(r.memory.read(0).unwrap()[0].key, 2);
    }

    #[test]
    fn test_loader_write_reports_slot() {
        let mut r = rig(1024);
        let group = r.encoder.encode(5, "mov", &["A", "1"], Signal::Write, Origin::Loader).unwrap();
        r.bus.sender().send_to(MEMORY_CHANNEL, Origin::Loader, Signal::Write, group).unwrap();
        r.settle();
        r.bus.tick().unwrap();

        let replies = r.replies();
        assert_eq!(replies.len(), 1);
        let report = &replies[0];
        assert_eq!(report[0].key, 5);
        assert_eq!(report[0].signal, Signal::Read);
        let words = Decoder::new(WordLength::Bits16).words(report).unwrap();
        assert_eq!(words, vec![(FragmentType::Memory, 0)]);
    }

    #[test]
    fn test_fetch_returns_stored_group() {
        let mut r = rig(1024);
        let group = r.encoder.encode(3, "inc", &["A"], Signal::Write, Origin::Loader).unwrap();
        r.memory.write(group);

        r.cpu_request(TRANSACTION_KEY_BASE, Signal::Read, &[(FragmentType::Call, 0)]);
        r.settle();
        r.bus.tick().unwrap();

        let replies = r.replies();
        assert_eq!(replies.len(), 1);
        let action = Decoder::new(WordLength::Bits16).decode(&replies[0]).unwrap();
        assert_eq!(action.key, 3);
        assert_eq!(action.origin, Origin::Memory);
        assert_eq!(action.signal, Signal::Write);
    }

    #[test]
    fn test_unwritten_cell_reads_zero() {
        let r = rig(1024);
        assert_eq!(r.memory.read_data(0x10), Ok(0));
        assert!(r.memory.data_cells().is_empty());
    }

    #[test]
    fn test_data_region_bounds() {
        let mut r = rig(1024);
        assert!(matches!(r.memory.write_data(64, 1), Err(MemoryError::AddressOutOfRange { .. })));
        assert!(matches!(r.memory.read_data(-1), Err(MemoryError::AddressOutOfRange { .. })));
        r.memory.write_data(63, -9).unwrap();
        assert_eq!(r.memory.read_data(63), Ok(-9));
        assert_eq!(r.memory.data_cells(), vec![(63, -9)]);
    }

    #[test]
    fn test_transactions_applied_in_key_order() {
        let mut r = rig(1024);
        let base = TRANSACTION_KEY_BASE;
        // The read is sent before the write but carries the later key.
        r.cpu_request(base + 1, Signal::Read, &[(FragmentType::Memory, 0x10)]);
        r.cpu_request(
            base,
            Signal::Write,
            &[(FragmentType::Memory, 0x10), (FragmentType::Literal, 7)],
        );
        r.settle();
        r.bus.tick().unwrap();

        let replies = r.replies();
        assert_eq!(replies.len(), 1);
        let words = Decoder::new(WordLength::Bits16).words(&replies[0]).unwrap();
        assert_eq!(words, vec![(FragmentType::Memory, 0x10), (FragmentType::Literal, 7)]);
        assert_eq!(replies[0][0].key, base + 1);
        assert!(r.memory.is_idle());
    }

    #[test]
    fn test_out_of_range_request_is_fatal() {
        let mut r = rig(1024);
        r.cpu_request(TRANSACTION_KEY_BASE, Signal::Read, &[(FragmentType::Memory, 500)]);
        r.bus.tick().unwrap();
        assert!(matches!(r.memory.tick(), Err(MemoryError::AddressOutOfRange { address: 500, .. })));
    }
}
