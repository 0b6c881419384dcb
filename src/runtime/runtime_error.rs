use thiserror::Error;

use crate::bytecode::op::trap;

/// A fault raised while interpreting bytecode. `at` is the offset of the
/// faulting instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("{} (code {code}) at {at}", trap_name(*.code))]
    Trap { code: i64, at: usize },

    #[error("stack overflow at {at}\n  hint: raise the memory size or reduce recursion depth")]
    StackOverflow { at: usize },

    #[error("stack underflow at {at}")]
    StackUnderflow { at: usize },

    #[error("memory access at address {address} out of bounds at {at}")]
    OutOfBounds { address: i64, at: usize },

    #[error("division by zero at {at}")]
    DivisionByZero { at: usize },

    #[error("execution step limit exceeded ({limit})")]
    StepLimit { limit: usize },

    #[error("unresolved label operand at {at}\n  hint: the program was not linked")]
    UnresolvedLabel { at: usize },

    #[error("control transferred to {target}, outside the program (from {at})")]
    BadJump { target: i64, at: usize },

    #[error("invalid operand in '{ins}' at {at}")]
    InvalidOperand { ins: String, at: usize },

    #[error("conditional at {at} executed before any comparison")]
    FlagsUnset { at: usize },
}

fn trap_name(code: i64) -> &'static str {
    match code {
        trap::NULL_POINTER => "null pointer dereference",
        _ => "trap",
    }
}

impl RuntimeError {
    /// Offset of the faulting instruction, when there is one.
    pub fn at(&self) -> Option<usize> {
        match self {
            RuntimeError::Trap { at, .. }
            | RuntimeError::StackOverflow { at }
            | RuntimeError::StackUnderflow { at }
            | RuntimeError::OutOfBounds { at, .. }
            | RuntimeError::DivisionByZero { at }
            | RuntimeError::UnresolvedLabel { at }
            | RuntimeError::BadJump { at, .. }
            | RuntimeError::InvalidOperand { at, .. }
            | RuntimeError::FlagsUnset { at } => Some(*at),
            RuntimeError::StepLimit { .. } => None,
        }
    }
}
