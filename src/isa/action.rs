//! Decoded instructions.

use std::fmt;
use serde::{Serialize, Deserialize};
use crate::isa::fragment::{FragmentType, Key, Origin, Signal};

/// Operation performed by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // ==================== Data ====================

    /// destination += source
    Add,
    /// destination := source
    Mov,
    /// destination += 1
    Inc,
    /// destination := src1 * src2
    Imul,

    // ==================== Control ====================

    /// Replay loop n and evaluate its condition.
    Jump,
    /// Start compiling loop n.
    Label,
    /// Leave the loop context and flush the cache.
    Null,

    // ==================== Comparison ====================

    Eq,
    Gt,
    Lt,
    GtEq,
    LtEq,
}

impl Opcode {
    /// Every opcode, in wire-code order.
    pub const ALL: [Opcode; 12] = [
        Opcode::Add,
        Opcode::Mov,
        Opcode::Inc,
        Opcode::Imul,
        Opcode::Jump,
        Opcode::Label,
        Opcode::Null,
        Opcode::Eq,
        Opcode::Gt,
        Opcode::Lt,
        Opcode::GtEq,
        Opcode::LtEq,
    ];

    /// Numeric code carried in the opcode word.
    pub fn code(self) -> i64 {
        match self {
            Opcode::Add => 0,
            Opcode::Mov => 1,
            Opcode::Inc => 2,
            Opcode::Imul => 3,
            Opcode::Jump => 4,
            Opcode::Label => 5,
            Opcode::Null => 6,
            Opcode::Eq => 7,
            Opcode::Gt => 8,
            Opcode::Lt => 9,
            Opcode::GtEq => 10,
            Opcode::LtEq => 11,
        }
    }

    /// Inverse of [`Opcode::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Look up an assembly mnemonic (case-insensitive) or comparison symbol.
    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        let op = match mnemonic.to_ascii_lowercase().as_str() {
            "add" => Opcode::Add,
            "mov" => Opcode::Mov,
            "inc" => Opcode::Inc,
            "imul" => Opcode::Imul,
            "jmp" => Opcode::Jump,
            "label" => Opcode::Label,
            "null" => Opcode::Null,
            "=" => Opcode::Eq,
            ">" => Opcode::Gt,
            "<" => Opcode::Lt,
            ">=" => Opcode::GtEq,
            "<=" => Opcode::LtEq,
            _ => return None,
        };
        Some(op)
    }

    /// Canonical assembly spelling.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Mov => "mov",
            Opcode::Inc => "inc",
            Opcode::Imul => "imul",
            Opcode::Jump => "JMP",
            Opcode::Label => "label",
            Opcode::Null => "NULL",
            Opcode::Eq => "=",
            Opcode::Gt => ">",
            Opcode::Lt => "<",
            Opcode::GtEq => ">=",
            Opcode::LtEq => "<=",
        }
    }

    /// Whether this is one of the five comparison opcodes.
    pub fn is_comparison(self) -> bool {
        matches!(self, Opcode::Eq | Opcode::Gt | Opcode::Lt | Opcode::GtEq | Opcode::LtEq)
    }

    /// Apply a comparison with signed integer semantics.
    ///
    /// Returns `None` for non-comparison opcodes.
    pub fn compare(self, left: i64, right: i64) -> Option<bool> {
        let result = match self {
            Opcode::Eq => left == right,
            Opcode::Gt => left > right,
            Opcode::Lt => left < right,
            Opcode::GtEq => left >= right,
            Opcode::LtEq => left <= right,
            _ => return None,
        };
        Some(result)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// How a parameter's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Register,
    Memory,
    Literal,
    /// An opcode chunk where an operand was expected. Always rejected by the CPU.
    Call,
}

impl From<FragmentType> for ParamType {
    fn from(kind: FragmentType) -> Self {
        match kind {
            FragmentType::Register => ParamType::Register,
            FragmentType::Memory => ParamType::Memory,
            FragmentType::Literal => ParamType::Literal,
            FragmentType::Call => ParamType::Call,
        }
    }
}

/// A typed operand. Register parameters hold the register index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub value: i64,
    #[serde(rename = "type")]
    pub kind: ParamType,
}

impl Parameter {
    pub fn register(index: i64) -> Self {
        Self { value: index, kind: ParamType::Register }
    }

    pub fn memory(address: i64) -> Self {
        Self { value: address, kind: ParamType::Memory }
    }

    pub fn literal(value: i64) -> Self {
        Self { value, kind: ParamType::Literal }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub key: Key,
    pub signal: Signal,
    pub origin: Origin,
    pub opcode: Opcode,
    pub location: Option<Parameter>,
    pub parameters: Vec<Parameter>,
}

impl Action {
    /// Build an action outside the wire path (tests, branch rewriting).
    pub fn new(opcode: Opcode, location: Option<Parameter>, parameters: Vec<Parameter>) -> Self {
        Self {
            key: 0,
            signal: Signal::Write,
            origin: Origin::Loader,
            opcode,
            location,
            parameters,
        }
    }

    /// All operands: location first, then parameters.
    pub fn operands(&self) -> impl Iterator<Item = &Parameter> {
        self.location.iter().chain(self.parameters.iter())
    }
}
