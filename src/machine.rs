//! The composition root.
//!
//! A [`Machine`] owns the bus, the memory unit and the CPU, wired together
//! through bus ports at construction. It can be driven two ways over the
//! same components:
//! - [`Machine::step`] ticks bus, memory and CPU once each, in that order,
//!   on the calling thread (deterministic; used by tests, the monitor and wasm)
//! - [`Machine::spawn`] moves each component onto its own thread with its
//!   own tick period, until [`RunningMachine::stop`] is called

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::asm::{assemble, load_image, AssemblerError, ImageError, Program};
use crate::bus::{Bus, BusError, BusSender, BusStats};
use crate::config::{ConfigError, MachineConfig};
use crate::cpu::{Cacheable, Cpu, CpuError};
use crate::isa::fragment::{self, CPU_CHANNEL, MEMORY_CHANNEL};
use crate::isa::{DecodeError, Encoder, Key, Origin, Signal};
use crate::memory::{MemoryError, MemoryUnit};
use crate::word::WordLength;

/// Steps [`Machine::run_until_idle`] takes when the caller has no limit in mind.
pub const DEFAULT_MAX_STEPS: u64 = 100_000;

/// The whole emulated machine.
pub struct Machine {
    config: MachineConfig,
    bus: Bus,
    memory: MemoryUnit,
    cpu: Cpu,
    loader: BusSender,
    encoder: Encoder,
    /// Key the next loaded instruction gets.
    next_key: Key,
    steps: u64,
}

impl Machine {
    /// Validate `config` and build every component.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        config.validate()?;

        let mut bus = Bus::new(config.bus());
        bus.make_channel(MEMORY_CHANNEL);
        bus.make_channel(CPU_CHANNEL);

        let memory = MemoryUnit::new(bus.port(MEMORY_CHANNEL)?, config.memory_size, config.word_length)?;
        let cpu = Cpu::new(bus.port(CPU_CHANNEL)?, &config.registers, config.word_length, memory.data_len());
        let loader = bus.sender();
        let encoder = Encoder::new(&config.registers, config.word_length);

        log::info!(
            "machine: {} registers, {}, bus {} bytes/tick at {} Hz, {} memory slots",
            config.registers.len(),
            config.word_length,
            config.bus_width,
            config.frequency,
            memory.capacity()
        );

        Ok(Self { config, bus, memory, cpu, loader, encoder, next_key: 0, steps: 0 })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Encoder matching this machine's registers and word length.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn memory(&self) -> &MemoryUnit {
        &self.memory
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Deterministic steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    // ==== Loading ====

    /// Assemble source for this machine.
    pub fn assemble(&self, source: &str) -> Result<Program, MachineError> {
        Ok(assemble(source, &self.encoder)?)
    }

    /// Hand every group of `program` to the bus, addressed to memory.
    ///
    /// Keys are shifted past every previously loaded instruction, so a
    /// later program runs after the earlier ones.
    pub fn load(&mut self, program: &Program) -> Result<(), MachineError> {
        if program.word != self.config.word_length {
            return Err(MachineError::WordMismatch { program: program.word, machine: self.config.word_length });
        }
        let offset = self.next_key;
        for group in &program.groups {
            let Some(head) = group.first() else {
                continue;
            };
            let key = offset.wrapping_add(head.key);
            let group = fragment::restamp(group, key, Signal::Write, Origin::Loader);
            self.loader.send_to(MEMORY_CHANNEL, Origin::Loader, Signal::Write, group)?;
            self.next_key = self.next_key.max(key.wrapping_add(1));
        }
        log::info!("machine: loaded {} instructions ({} fragments)", program.len(), program.fragment_count());
        Ok(())
    }

    /// Assemble and load in one go.
    pub fn load_source(&mut self, source: &str) -> Result<Program, MachineError> {
        let program = self.assemble(source)?;
        self.load(&program)?;
        Ok(program)
    }

    /// Load a program file: a `.json` wire image as-is, anything else as
    /// assembly source.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Program, MachineError> {
        let path = path.as_ref();
        let program = if path.extension().map_or(false, |e| e == "json") {
            load_image(path)?
        } else {
            let source = std::fs::read_to_string(path).map_err(|e| MachineError::IoError(e.to_string()))?;
            self.assemble(&source)?
        };
        self.load(&program)?;
        Ok(program)
    }

    // ==== Deterministic driver ====

    /// Tick the bus, then memory, then the CPU.
    pub fn step(&mut self) -> Result<(), MachineError> {
        self.bus.tick()?;
        self.memory.tick()?;
        self.cpu.tick()?;
        self.steps += 1;
        Ok(())
    }

    /// No component has anything left to do.
    pub fn is_idle(&self) -> bool {
        self.bus.is_idle() && self.memory.is_idle() && self.cpu.is_idle()
    }

    /// Step until idle or until `max_steps` steps were taken.
    ///
    /// Returns the number of steps taken; check [`Machine::is_idle`] to tell
    /// the two apart.
    pub fn run_until_idle(&mut self, max_steps: u64) -> Result<u64, MachineError> {
        let start = self.steps;
        while self.steps - start < max_steps {
            self.step()?;
            if self.is_idle() {
                break;
            }
        }
        Ok(self.steps - start)
    }

    // ==== Threaded driver ====

    /// Run each component on its own thread: the bus at the configured
    /// frequency, memory at twice and the CPU at four times that rate.
    pub fn spawn(self) -> RunningMachine {
        let stop = Arc::new(AtomicBool::new(false));
        let period = self.config.bus().period();
        log::info!("machine: starting threads");

        RunningMachine {
            bus: self.bus.run(stop.clone()),
            memory: self.memory.run(period / 2, stop.clone()),
            cpu: self.cpu.run(period / 4, stop.clone()),
            stop,
            config: self.config,
            loader: self.loader,
            encoder: self.encoder,
            next_key: self.next_key,
            steps: self.steps,
        }
    }

    // ==== Inspection ====

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            steps: self.steps,
            registers: self.cpu.registers().iter().map(|(n, v)| (n.to_string(), v)).collect(),
            data: self.memory.data_cells(),
            cache: self.cpu.cache().iter().collect(),
            loop_state: self.cpu.loop_state().to_string(),
            executed: self.cpu.executed(),
            bus: self.bus.stats(),
            idle: self.is_idle(),
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("steps", &self.steps)
            .field("bus", &self.bus)
            .field("memory", &self.memory)
            .field("cpu", &self.cpu)
            .finish()
    }
}

/// A machine whose components are running on their own threads.
pub struct RunningMachine {
    stop: Arc<AtomicBool>,
    bus: JoinHandle<Result<Bus, BusError>>,
    memory: JoinHandle<Result<MemoryUnit, MemoryError>>,
    cpu: JoinHandle<Result<Cpu, CpuError>>,
    config: MachineConfig,
    loader: BusSender,
    encoder: Encoder,
    next_key: Key,
    steps: u64,
}

impl RunningMachine {
    /// Stop every thread and reassemble the machine for inspection.
    ///
    /// If a component failed, its error is returned. The bus error wins over
    /// memory, memory over the CPU.
    pub fn stop(self) -> Result<Machine, MachineError> {
        self.stop.store(true, Ordering::Relaxed);

        let bus = self.bus.join().map_err(|_| MachineError::ThreadPanicked("bus"));
        let memory = self.memory.join().map_err(|_| MachineError::ThreadPanicked("memory"));
        let cpu = self.cpu.join().map_err(|_| MachineError::ThreadPanicked("cpu"));
        log::info!("machine: threads stopped");

        Ok(Machine {
            bus: bus??,
            memory: memory??,
            cpu: cpu??,
            config: self.config,
            loader: self.loader,
            encoder: self.encoder,
            next_key: self.next_key,
            steps: self.steps,
        })
    }
}

/// Serializable view of the machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub steps: u64,
    pub registers: Vec<(String, i64)>,
    /// Non-zero data cells by address.
    pub data: Vec<(i64, i64)>,
    /// Dirty cache entries by address.
    pub cache: Vec<(i64, Cacheable)>,
    pub loop_state: String,
    pub executed: u64,
    pub bus: BusStats,
    pub idle: bool,
}

impl MachineSnapshot {
    pub fn register(&self, name: &str) -> Option<i64> {
        self.registers.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn data_at(&self, address: i64) -> i64 {
        self.data.iter().find(|(a, _)| *a == address).map_or(0, |(_, v)| *v)
    }
}

/// Any error the machine can stop with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("CPU error: {0}")]
    Cpu(#[from] CpuError),

    #[error("assembler error: {0}")]
    Assembler(#[from] AssemblerError),

    #[error("wire image error: {0}")]
    Image(#[from] ImageError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("program encoded for {program}, machine uses {machine}")]
    WordMismatch { program: WordLength, machine: WordLength },

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
