//! Instruction set codec.
//!
//! This module covers everything between assembly text and the CPU:
//! - [`Fragment`] - one byte on the wire with its key, position and type tags
//! - [`Encoder`] - statements to fragment groups (including the conditional rewrite)
//! - [`Decoder`] - complete groups back to [`Action`]s
//! - [`Reassembler`] - out-of-order fragments to complete groups

pub mod fragment;
pub mod action;
pub mod encoder;
pub mod decoder;
pub mod reassembly;

pub use fragment::{Fragment, FragmentType, Key, Origin, Signal, TRANSACTION_KEY_BASE};
pub use action::{Action, Opcode, ParamType, Parameter};
pub use encoder::{Encoder, EncodeError};
pub use decoder::{Decoder, DecodeError};
pub use reassembly::{GroupId, Reassembler, ReassemblyError};
