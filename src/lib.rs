//! # vonbus
//!
//! A Von Neumann machine emulator built around a shared, bandwidth-limited
//! bus.
//!
//! Instructions and data travel as one-byte fragments over three lanes
//! (address, data, instruction). The memory unit stores programs and data,
//! and the CPU fetches in order, compiles `label`/`JMP` loops and keeps a
//! write-back cache for memory written inside loops.

pub mod word;
pub mod isa;
pub mod bus;
pub mod memory;
pub mod cpu;
pub mod asm;
pub mod config;
pub mod clock;
pub mod machine;

#[cfg(feature = "tui")]
pub mod tui;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export commonly used types
pub use word::WordLength;
pub use isa::{Action, Decoder, Encoder, Fragment, FragmentType, Opcode, Origin, Signal};
pub use bus::{Bus, BusConfig, BusError, BusStats, Lane};
pub use memory::{MemoryError, MemoryUnit};
pub use cpu::{Cpu, CpuError, LoopState, Registers, WriteBackCache};
pub use asm::{assemble, disassemble, AssemblerError, Program, load_image, save_image};
pub use config::{ConfigError, MachineConfig};
pub use machine::{Machine, MachineError, MachineSnapshot, RunningMachine};

#[cfg(feature = "tui")]
pub use tui::run_monitor;
