//! Line assembler producing loader traffic.
//!
//! Syntax:
//! ```text
//! # Comment
//! mov A, 5            # register <- literal
//! mov 0x10, A         # memory <- register
//! label 0; inc A      # `;` separates statements on one line
//! A < 3 : JMP 0 : NULL
//! ```
//!
//! Every statement becomes one fragment group, except a conditional which
//! becomes three (comparison, then-branch, else-branch). Keys are assigned
//! consecutively from 0.

use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::isa::{EncodeError, Encoder, Fragment, Key, TRANSACTION_KEY_BASE};
use crate::word::WordLength;

/// An encoded program, ready to be sent to memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Word length the groups were encoded for.
    pub word: WordLength,
    /// Fragment groups in key order.
    pub groups: Vec<Vec<Fragment>>,
    /// Statement text each group came from (for display).
    pub source_lines: Vec<String>,
}

impl Program {
    pub fn new(word: WordLength) -> Self {
        Self { word, groups: Vec::new(), source_lines: Vec::new() }
    }

    pub fn push(&mut self, group: Vec<Fragment>, source: &str) {
        self.groups.push(group);
        self.source_lines.push(source.to_string());
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total fragments on the wire.
    pub fn fragment_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Assemble source text into a program.
pub fn assemble(source: &str, encoder: &Encoder) -> Result<Program, AssemblerError> {
    let mut program = Program::new(encoder.word());
    let mut key: Key = 0;

    for (line_num, line) in source.lines().enumerate() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };

        for statement in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let groups = encoder
                .encode_statement(key, statement)
                .map_err(|source| AssemblerError::Statement {
                    line: line_num + 1,
                    statement: statement.to_string(),
                    source,
                })?;

            key += groups.len() as Key;
            if key >= TRANSACTION_KEY_BASE {
                return Err(AssemblerError::TooManyInstructions { line: line_num + 1 });
            }
            for group in groups {
                program.push(group, statement);
            }
        }
    }

    Ok(program)
}

/// Errors that can occur during assembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblerError {
    #[error("line {line}: `{statement}`: {source}")]
    Statement { line: usize, statement: String, source: EncodeError },

    #[error("line {line}: program exceeds the instruction key space")]
    TooManyInstructions { line: usize },
}

impl AssemblerError {
    /// 1-based source line of the error.
    pub fn line(&self) -> usize {
        match self {
            AssemblerError::Statement { line, .. } | AssemblerError::TooManyInstructions { line } => *line,
        }
    }
}
