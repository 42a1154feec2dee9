//! Reassembly of fragment groups delivered in any order.

use std::collections::BTreeMap;
use thiserror::Error;
use crate::isa::fragment::{Fragment, Key, Origin, Signal};

/// Identity of a group in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId {
    pub key: Key,
    pub origin: Origin,
    pub signal: Signal,
}

impl GroupId {
    pub fn of(fragment: &Fragment) -> Self {
        Self { key: fragment.key, origin: fragment.origin, signal: fragment.signal }
    }
}

#[derive(Debug)]
struct Entry {
    slots: Vec<Option<Fragment>>,
    received: usize,
}

/// Key -> fixed-size fragment array + received count.
///
/// An entry leaves the table only when its last fragment arrives.
#[derive(Debug, Default)]
pub struct Reassembler {
    entries: BTreeMap<GroupId, Entry>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment; returns the whole group once it is complete.
    pub fn insert(&mut self, fragment: Fragment) -> Result<Option<Vec<Fragment>>, ReassemblyError> {
        let id = GroupId::of(&fragment);
        let size = fragment.group_size();

        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            slots: vec![None; size],
            received: 0,
        });

        if entry.slots.len() != size {
            return Err(ReassemblyError::LengthMismatch {
                key: fragment.key,
                expected: entry.slots.len(),
                found: size,
            });
        }

        let slot = entry
            .slots
            .get_mut(fragment.index as usize)
            .ok_or(ReassemblyError::IndexOutOfRange { key: fragment.key, index: fragment.index })?;

        if slot.is_some() {
            log::warn!("dropping duplicate fragment {} of group {}", fragment.index, fragment.key);
            return Ok(None);
        }
        *slot = Some(fragment);
        entry.received += 1;

        if entry.received < size {
            return Ok(None);
        }

        let group = self
            .entries
            .remove(&id)
            .map(|entry| entry.slots.into_iter().flatten().collect());
        Ok(group)
    }

    /// Add a batch, collecting every group completed by it.
    pub fn extend(&mut self, fragments: impl IntoIterator<Item = Fragment>) -> Result<Vec<Vec<Fragment>>, ReassemblyError> {
        let mut complete = Vec::new();
        for fragment in fragments {
            if let Some(group) = self.insert(fragment)? {
                complete.push(group);
            }
        }
        Ok(complete)
    }

    /// Number of groups still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Errors for fragments that cannot belong to their group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("group {key}: expected {expected} fragments, fragment declares {found}")]
    LengthMismatch { key: Key, expected: usize, found: usize },

    #[error("group {key}: fragment index {index} past the declared length")]
    IndexOutOfRange { key: Key, index: u16 },
}
