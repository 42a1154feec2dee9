//! Loop bodies and the loop state machine.

use std::fmt;
use serde::{Serialize, Deserialize};
use crate::isa::Action;

/// A loop is named by the operand of its `label`.
pub type LoopId = i64;

/// A comparison with its two branches, evaluated as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditional {
    pub condition: Action,
    pub if_true: Action,
    pub if_false: Action,
}

/// A compiled loop: the recorded body plus its trailing conditional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub instructions: Vec<Action>,
    pub exit: Option<Conditional>,
}

/// Where the CPU is with respect to loop compilation and execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Plain sequential execution.
    #[default]
    Idle,
    /// Recording the body of a loop after its `label`.
    Building(LoopId),
    /// A comparison was seen; collecting its two branches.
    AwaitingBranch {
        /// The loop the comparison closes, if one was building.
        owner: Option<LoopId>,
        condition: Action,
        if_true: Option<Action>,
    },
    /// Replaying a loop body after a jump.
    Executing(LoopId),
}

impl LoopState {
    /// Memory destinations go through the cache in this state.
    pub fn in_loop(&self) -> bool {
        matches!(self, LoopState::Building(_) | LoopState::Executing(_))
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Building(id) => write!(f, "building loop {}", id),
            LoopState::AwaitingBranch { owner: Some(id), if_true, .. } => {
                write!(f, "loop {} awaiting {} branch", id, if if_true.is_some() { "else" } else { "then" })
            }
            LoopState::AwaitingBranch { owner: None, if_true, .. } => {
                write!(f, "awaiting {} branch", if if_true.is_some() { "else" } else { "then" })
            }
            LoopState::Executing(id) => write!(f, "executing loop {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{Opcode, Parameter};

    #[test]
    fn test_state_queries() {
        assert!(!LoopState::Idle.in_loop());
        assert!(LoopState::Building(2).in_loop());
        assert!(LoopState::Executing(4).in_loop());
        assert_eq!(LoopState::Executing(4).to_string(), "executing loop 4");

        let awaiting = LoopState::AwaitingBranch {
            owner: Some(1),
            condition: Action::new(Opcode::Lt, Some(Parameter::register(0)), vec![Parameter::literal(3)]),
            if_true: None,
        };
        assert!(!awaiting.in_loop());
        assert_eq!(awaiting.to_string(), "loop 1 awaiting then branch");
    }
}
