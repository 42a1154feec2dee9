//! Machine configuration.

use std::collections::HashSet;
use std::path::Path;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::bus::BusConfig;
use crate::memory::MemoryUnit;
use crate::word::WordLength;

/// Everything needed to build a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Register names in wire order.
    pub registers: Vec<String>,
    pub word_length: WordLength,
    /// Bytes per lane per bus tick.
    pub bus_width: usize,
    /// Memory size in bytes.
    pub memory_size: usize,
    /// Bus clock in Hz. Memory ticks at twice, the CPU at four times this rate.
    pub frequency: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            registers: ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect(),
            word_length: WordLength::Bits16,
            bus_width: 8,
            memory_size: 1024,
            frequency: 100,
        }
    }
}

impl MachineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig { width: self.bus_width, frequency: self.frequency }
    }

    /// Check every option before any component is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registers.is_empty() {
            return Err(ConfigError::NoRegisters);
        }

        let mut seen = HashSet::new();
        for name in &self.registers {
            let valid = name.chars().next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid || name.to_ascii_lowercase().starts_with("0x") {
                return Err(ConfigError::InvalidRegisterName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateRegister(name.clone()));
            }
        }

        if self.bus_width == 0 {
            return Err(ConfigError::ZeroBusWidth);
        }
        if self.frequency == 0 {
            return Err(ConfigError::ZeroFrequency);
        }

        let slots = MemoryUnit::slot_count(self.memory_size, self.word_length);
        if slots < 2 {
            return Err(ConfigError::MemoryTooSmall { size: self.memory_size, word: self.word_length });
        }
        Ok(())
    }
}

/// Errors in a machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("invalid configuration: {0}")]
    Parse(String),

    #[error("at least one register is required")]
    NoRegisters,

    #[error("invalid register name: {0:?}")]
    InvalidRegisterName(String),

    #[error("duplicate register name: {0}")]
    DuplicateRegister(String),

    #[error("bus width must be at least one byte")]
    ZeroBusWidth,

    #[error("frequency must be at least 1 Hz")]
    ZeroFrequency,

    #[error("{size} bytes of memory cannot hold two {word} slots")]
    MemoryTooSmall { size: usize, word: WordLength },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MachineConfig::default();
        assert_eq!(config.registers.len(), 5);
        assert_eq!(config.bus().chunk_size(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MachineConfig::from_json(r#"{"registers": ["X", "Y"], "word_length": 64}"#).unwrap();
        assert_eq!(config.registers, vec!["X", "Y"]);
        assert_eq!(config.word_length, WordLength::Bits64);
        assert_eq!(config.bus_width, 8);
    }

    #[test]
    fn test_rejects_bad_word_length() {
        assert!(matches!(
            MachineConfig::from_json(r#"{"word_length": 24}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_registers() {
        let mut config = MachineConfig::default();
        config.registers = vec!["A".into(), "A".into()];
        assert_eq!(config.validate(), Err(ConfigError::DuplicateRegister("A".into())));

        config.registers = vec!["12".into()];
        assert_eq!(config.validate(), Err(ConfigError::InvalidRegisterName("12".into())));

        config.registers = vec!["0x1".into()];
        assert!(config.validate().is_err());

        config.registers.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoRegisters));
    }

    #[test]
    fn test_validate_resources() {
        let mut config = MachineConfig::default();
        config.bus_width = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBusWidth));

        let mut config = MachineConfig::default();
        config.memory_size = 15;
        assert!(matches!(config.validate(), Err(ConfigError::MemoryTooSmall { .. })));

        let mut config = MachineConfig::default();
        config.frequency = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroFrequency));
    }
}
