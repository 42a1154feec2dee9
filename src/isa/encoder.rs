//! Assembly statements to wire fragments.

use std::collections::HashMap;
use thiserror::Error;
use crate::isa::action::Opcode;
use crate::isa::fragment::{self, Fragment, FragmentType, Key, Origin, Signal};
use crate::word::{WordError, WordLength};

/// Turns mnemonics and operand text into fragment groups.
#[derive(Debug, Clone)]
pub struct Encoder {
    word: WordLength,
    /// Register name -> register index.
    registers: HashMap<String, i64>,
}

impl Encoder {
    pub fn new(registers: &[String], word: WordLength) -> Self {
        let registers = registers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i64))
            .collect();
        Self { word, registers }
    }

    pub fn word(&self) -> WordLength {
        self.word
    }

    /// Classify one operand into its fragment type and wire value.
    ///
    /// Register N travels as `-(N + 1)` so it never collides with an address
    /// or a non-negative literal.
    pub fn classify(&self, operand: &str) -> Result<(FragmentType, i64), EncodeError> {
        let operand = operand.trim();

        if let Some(hex) = operand.strip_prefix("0x").or_else(|| operand.strip_prefix("0X")) {
            let address = i64::from_str_radix(hex, 16)
                .map_err(|_| EncodeError::UnknownOperand(operand.to_string()))?;
            return Ok((FragmentType::Memory, address));
        }

        if let Ok(value) = operand.parse::<i64>() {
            return Ok((FragmentType::Literal, value));
        }

        match self.registers.get(operand) {
            Some(&index) => Ok((FragmentType::Register, -(index + 1))),
            None => Err(EncodeError::UnknownOperand(operand.to_string())),
        }
    }

    /// Expand a typed value into `word.bytes()` typed bytes.
    pub fn expand(&self, kind: FragmentType, value: i64) -> Result<Vec<(FragmentType, u8)>, EncodeError> {
        let bytes = self.word.encode(value).map_err(|source| EncodeError::Word { value, source })?;
        Ok(bytes.into_iter().map(|b| (kind, b)).collect())
    }

    /// Encode a group made of whole typed words.
    pub fn encode_words(
        &self,
        key: Key,
        signal: Signal,
        origin: Origin,
        words: &[(FragmentType, i64)],
    ) -> Result<Vec<Fragment>, EncodeError> {
        let mut bytes = Vec::with_capacity(words.len() * self.word.bytes());
        for &(kind, value) in words {
            bytes.extend(self.expand(kind, value)?);
        }
        Ok(fragment::stamp(key, signal, origin, &bytes))
    }

    /// Encode one instruction: opcode word, then each operand in order.
    pub fn encode(
        &self,
        key: Key,
        mnemonic: &str,
        operands: &[&str],
        signal: Signal,
        origin: Origin,
    ) -> Result<Vec<Fragment>, EncodeError> {
        let opcode = Opcode::from_mnemonic(mnemonic)
            .ok_or_else(|| EncodeError::UnknownMnemonic(mnemonic.to_string()))?;

        let mut words = vec![(FragmentType::Call, opcode.code())];
        for operand in operands {
            words.push(self.classify(operand)?);
        }
        self.encode_words(key, signal, origin, &words)
    }

    /// Encode one source statement as loader traffic.
    ///
    /// A conditional `lhs cmp rhs : then : else` becomes three consecutive
    /// instructions starting at `first_key`; anything else becomes one.
    pub fn encode_statement(&self, first_key: Key, statement: &str) -> Result<Vec<Vec<Fragment>>, EncodeError> {
        let parts: Vec<&str> = statement.split(':').collect();

        match parts.as_slice() {
            [single] => {
                let (mnemonic, operands) = split_statement(single)?;
                Ok(vec![self.encode(first_key, mnemonic, &operands, Signal::Write, Origin::Loader)?])
            }
            [condition, then_branch, else_branch] => {
                let (op, lhs, rhs) = split_condition(condition)?;
                let mut out = Vec::with_capacity(3);
                out.push(self.encode(first_key, op, &[lhs, rhs], Signal::Write, Origin::Loader)?);

                for (offset, branch) in [then_branch, else_branch].into_iter().enumerate() {
                    let (mnemonic, operands) = split_statement(branch)?;
                    let opcode = Opcode::from_mnemonic(mnemonic);
                    if opcode.map_or(false, Opcode::is_comparison) {
                        return Err(EncodeError::MalformedConditional(statement.trim().to_string()));
                    }
                    let key = first_key + 1 + offset as Key;
                    out.push(self.encode(key, mnemonic, &operands, Signal::Write, Origin::Loader)?);
                }
                Ok(out)
            }
            _ => Err(EncodeError::MalformedConditional(statement.trim().to_string())),
        }
    }
}

/// Split `mnemonic a, b` into the mnemonic and its operands.
fn split_statement(statement: &str) -> Result<(&str, Vec<&str>), EncodeError> {
    let mut tokens = statement
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());
    let mnemonic = tokens.next().ok_or(EncodeError::EmptyStatement)?;
    Ok((mnemonic, tokens.collect()))
}

/// Split `lhs cmp rhs` on its comparison operator.
fn split_condition(condition: &str) -> Result<(&str, &str, &str), EncodeError> {
    let malformed = || EncodeError::MalformedConditional(condition.trim().to_string());

    let start = condition.find(|c: char| matches!(c, '<' | '>' | '=')).ok_or_else(malformed)?;
    let rest = &condition[start..];
    let width = if rest.starts_with(">=") || rest.starts_with("<=") { 2 } else { 1 };

    let op = &condition[start..start + width];
    let lhs = condition[..start].trim();
    let rhs = condition[start + width..].trim();
    if lhs.is_empty() || rhs.is_empty() || rhs.contains(|c: char| matches!(c, '<' | '>' | '=')) {
        return Err(malformed());
    }
    Ok((op, lhs, rhs))
}

/// Errors that can occur while encoding a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("unknown mnemonic: {0}")]
    UnknownMnemonic(String),

    #[error("operand is not a number, a 0x address or a known register: {0}")]
    UnknownOperand(String),

    #[error("operand {value}: {source}")]
    Word { value: i64, source: WordError },

    #[error("malformed conditional: {0}")]
    MalformedConditional(String),

    #[error("empty statement")]
    EmptyStatement,
}
