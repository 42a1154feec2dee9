//! The wire unit: one byte of an encoded instruction plus its routing tags.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Instruction sequence number carried by every fragment of a group.
pub type Key = u32;

/// First key of the CPU transaction space.
///
/// Instruction keys are handed out by the loader from zero; keys the CPU
/// allocates for its own memory transactions start here so the two never
/// meet inside a reassembly table.
pub const TRANSACTION_KEY_BASE: Key = 1 << 31;

/// What a fragment's byte belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentType {
    /// Part of an opcode word.
    Call,
    /// Part of a memory address.
    Memory,
    /// Part of an immediate value.
    Literal,
    /// Part of a register reference.
    Register,
}

/// Direction of a bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Signal {
    Read,
    Write,
}

/// The component that produced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// The external program producer.
    Loader,
    Cpu,
    Memory,
}

impl Origin {
    /// Channel name replies to this origin are sent to.
    pub fn channel(self) -> &'static str {
        match self {
            Origin::Loader => LOADER_CHANNEL,
            Origin::Cpu => CPU_CHANNEL,
            Origin::Memory => MEMORY_CHANNEL,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

/// Bus channel owned by the CPU.
pub const CPU_CHANNEL: &str = "cpu";
/// Bus channel owned by the memory unit.
pub const MEMORY_CHANNEL: &str = "memory";
/// Name the loader signs its traffic with. It never receives.
pub const LOADER_CHANNEL: &str = "io";

/// One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fragment {
    pub key: Key,
    #[serde(rename = "type")]
    pub kind: FragmentType,
    /// Position within the group.
    pub index: u16,
    /// Fragment count of the group minus one.
    pub length: u16,
    pub signal: Signal,
    pub value: u8,
    pub origin: Origin,
}

impl Fragment {
    /// Number of fragments in this fragment's group.
    #[inline]
    pub fn group_size(&self) -> usize {
        self.length as usize + 1
    }
}

/// Stamp a run of typed bytes with key, position and routing tags.
///
/// `bytes` is the flattened group in index order.
pub fn stamp(
    key: Key,
    signal: Signal,
    origin: Origin,
    bytes: &[(FragmentType, u8)],
) -> Vec<Fragment> {
    let length = bytes.len().saturating_sub(1) as u16;
    bytes
        .iter()
        .enumerate()
        .map(|(index, &(kind, value))| Fragment {
            key,
            kind,
            index: index as u16,
            length,
            signal,
            value,
            origin,
        })
        .collect()
}

/// Copy a group under new routing tags, keeping byte order and types.
pub fn restamp(group: &[Fragment], key: Key, signal: Signal, origin: Origin) -> Vec<Fragment> {
    let mut sorted = group.to_vec();
    sorted.sort_by_key(|f| f.index);
    let bytes: Vec<_> = sorted.iter().map(|f| (f.kind, f.value)).collect();
    stamp(key, signal, origin, &bytes)
}

/// Check that a group covers `0..=length` exactly once with one shared length.
pub fn is_complete(group: &[Fragment]) -> bool {
    let Some(first) = group.first() else {
        return false;
    };
    if group.len() != first.group_size() {
        return false;
    }

    let mut seen = vec![false; group.len()];
    for fragment in group {
        if fragment.length != first.length || fragment.key != first.key {
            return false;
        }
        match seen.get_mut(fragment.index as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(len: usize) -> Vec<Fragment> {
        let bytes: Vec<_> = (0..len).map(|i| (FragmentType::Literal, i as u8)).collect();
        stamp(3, Signal::Write, Origin::Loader, &bytes)
    }

    #[test]
    fn test_stamp_sets_positions() {
        let g = group(4);
        assert!(g.iter().all(|f| f.length == 3 && f.key == 3));
        assert_eq!(g.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_complete_in_any_order() {
        let mut g = group(4);
        g.reverse();
        assert!(is_complete(&g));
    }

    #[test]
    fn test_missing_fragment_incomplete() {
        let mut g = group(4);
        g.remove(2);
        assert!(!is_complete(&g));
        assert!(!is_complete(&[]));
    }

    #[test]
    fn test_duplicate_index_incomplete() {
        let mut g = group(3);
        g[2] = g[1];
        assert!(!is_complete(&g));
    }

    #[test]
    fn test_restamp_sorts_by_index() {
        let mut g = group(3);
        g.swap(0, 2);
        let out = restamp(&g, 9, Signal::Read, Origin::Memory);
        assert_eq!(out.iter().map(|f| f.value).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(out.iter().all(|f| f.key == 9 && f.origin == Origin::Memory));
    }
}
