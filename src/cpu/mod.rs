//! The CPU core.
//!
//! - [`Registers`] - named register bank
//! - [`WriteBackCache`] - memory words mutated inside loops
//! - [`LoopState`] / [`Loop`] - loop compilation and replay
//! - [`Cpu`] - fetch, decode and execute over the bus

pub mod registers;
pub mod cache;
pub mod loops;
pub mod execute;

pub use registers::Registers;
pub use cache::{Cacheable, WriteBackCache, FLUSH_THRESHOLD};
pub use loops::{Conditional, Loop, LoopId, LoopState};
pub use execute::{Cpu, CpuError, Mode, MAX_STEPS_PER_TICK};
