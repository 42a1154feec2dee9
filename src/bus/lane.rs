//! Lanes, envelopes and deliveries.

use std::fmt;
use serde::{Serialize, Deserialize};
use crate::isa::{Fragment, FragmentType, Origin, Signal};

/// One of the three sub-queues multiplexed onto every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Register and memory references.
    Address,
    /// Literals.
    Data,
    /// Opcodes.
    Instruction,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Address, Lane::Data, Lane::Instruction];

    /// Lane a fragment type travels on.
    pub fn of(kind: FragmentType) -> Self {
        match kind {
            FragmentType::Register | FragmentType::Memory => Lane::Address,
            FragmentType::Literal => Lane::Data,
            FragmentType::Call => Lane::Instruction,
        }
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        match self {
            Lane::Address => 0,
            Lane::Data => 1,
            Lane::Instruction => 2,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lane::Address => "address",
            Lane::Data => "data",
            Lane::Instruction => "instruction",
        };
        f.write_str(name)
    }
}

/// What a receiver pulls off a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub origin: Origin,
    pub signal: Signal,
    pub payload: Vec<Fragment>,
}

/// A submitted message waiting to be routed.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub channel: String,
    pub origin: Origin,
    pub signal: Signal,
    pub payload: Vec<Fragment>,
}

/// One lane-sized slice of an envelope in the pending buffer.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub channel: String,
    pub lane: Lane,
    pub delivery: Delivery,
}

impl Chunk {
    /// Size in bytes; every fragment is one byte on the wire.
    pub fn size(&self) -> usize {
        self.delivery.payload.len()
    }
}

/// Split an envelope by lane, then into chunks of at most `chunk` fragments.
pub(crate) fn slice(envelope: Envelope, chunk: usize) -> Vec<Chunk> {
    let chunk = chunk.max(1);
    let mut out = Vec::new();

    for lane in Lane::ALL {
        let fragments: Vec<Fragment> = envelope
            .payload
            .iter()
            .copied()
            .filter(|f| Lane::of(f.kind) == lane)
            .collect();

        for piece in fragments.chunks(chunk) {
            out.push(Chunk {
                channel: envelope.channel.clone(),
                lane,
                delivery: Delivery {
                    origin: envelope.origin,
                    signal: envelope.signal,
                    payload: piece.to_vec(),
                },
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::fragment::stamp;

    #[test]
    fn test_lane_of() {
        assert_eq!(Lane::of(FragmentType::Call), Lane::Instruction);
        assert_eq!(Lane::of(FragmentType::Register), Lane::Address);
        assert_eq!(Lane::of(FragmentType::Memory), Lane::Address);
        assert_eq!(Lane::of(FragmentType::Literal), Lane::Data);
    }

    #[test]
    fn test_slice_by_lane_and_width() {
        let bytes = [
            (FragmentType::Call, 1),
            (FragmentType::Call, 2),
            (FragmentType::Register, 3),
            (FragmentType::Register, 4),
            (FragmentType::Literal, 5),
            (FragmentType::Literal, 6),
        ];
        let envelope = Envelope {
            channel: "memory".into(),
            origin: Origin::Loader,
            signal: Signal::Write,
            payload: stamp(0, Signal::Write, Origin::Loader, &bytes),
        };

        let chunks = slice(envelope, 1);
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0].lane, Lane::Address);
        assert_eq!(chunks[2].lane, Lane::Data);
        assert_eq!(chunks[4].lane, Lane::Instruction);
        assert!(chunks.iter().all(|c| c.size() == 1));
    }
}
