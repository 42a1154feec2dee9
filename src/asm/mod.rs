//! Producer-side tooling.
//!
//! This module provides:
//! - A line assembler (text → fragment groups, keys from 0)
//! - A disassembler (decoded actions → text)
//! - Wire images (pre-encoded programs as JSON)

pub mod assembler;
pub mod disasm;
pub mod image;

pub use assembler::{assemble, AssemblerError, Program};
pub use disasm::{disassemble, format_action};
pub use image::{load_image, save_image, ImageError};
