//! Named general-purpose registers.
//!
//! The configured name list fixes both the register count and each
//! register's wire index: the first name is register 0.

use serde::{Serialize, Deserialize};
use crate::cpu::CpuError;
use crate::word::WordLength;

/// The register file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    names: Vec<String>,
    values: Vec<i64>,
    word: WordLength,
}

impl Registers {
    /// Create a register file with every register zeroed.
    pub fn new(names: &[String], word: WordLength) -> Self {
        Self {
            names: names.to_vec(),
            values: vec![0; names.len()],
            word,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Wire index of a register name.
    pub fn index_of(&self, name: &str) -> Option<i64> {
        self.names.iter().position(|n| n == name).map(|i| i as i64)
    }

    pub fn get(&self, index: i64) -> Result<i64, CpuError> {
        let slot = self.slot(index)?;
        Ok(self.values[slot])
    }

    /// Store a value, wrapped to the word width.
    pub fn set(&mut self, index: i64, value: i64) -> Result<(), CpuError> {
        let slot = self.slot(index)?;
        self.values[slot] = self.word.wrap(value);
        Ok(())
    }

    /// Look a register up by name.
    pub fn by_name(&self, name: &str) -> Option<i64> {
        self.index_of(name).and_then(|i| self.get(i).ok())
    }

    /// `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.names.iter().map(String::as_str).zip(self.values.iter().copied())
    }

    fn slot(&self, index: i64) -> Result<usize, CpuError> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.values.len())
            .ok_or(CpuError::RegisterOutOfRange { index, count: self.values.len() })
    }
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            map.entry(&name, &value);
        }
        map.finish()
    }
}
