//! Static operand-stack height analysis.
//!
//! Follows every reachable path through one function's code and checks
//! that each instruction is always reached with the same stack height, that
//! nothing pops below the entry height and that `ret` leaves the frame
//! exactly as the call found it.

use std::ops::Range;

use thiserror::Error;

use crate::bytecode::op::{Instruction, Opcode, Operand, Operands, Reg};

/// Stack bytes a call or indirect call consumes once it returns: the saved
/// `gb` and `fp` pushed before it.
const CALL_EFFECT: i64 = -16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackCheckError {
    #[error("stack underflow at {at}: height would be {height}")]
    Underflow { at: usize, height: i64 },

    #[error("inconsistent stack height at {at}: reached with {first} and {second}")]
    Mismatch { at: usize, first: i64, second: i64 },

    #[error("'ret' at {at} with {height} byte(s) left on the frame")]
    UnbalancedReturn { at: usize, height: i64 },

    #[error("jump at {at} leaves the function (target {target})")]
    JumpOutOfRange { at: usize, target: i64 },

    #[error("'{ins}' at {at} has no static stack effect")]
    UnknownEffect { at: usize, ins: String },
}

/// What executing one instruction does to control flow.
enum Flow {
    Next,
    Jump(i64),
    Branch(i64),
    Stop,
}

fn displacement(ins: &Instruction) -> Option<i64> {
    match ins.a() {
        Some(Operand::Imm { value, .. }) => Some(*value),
        _ => None,
    }
}

/// Height change and control flow of the instruction at `at`.
fn effect(ins: &Instruction, at: usize) -> Result<(i64, Flow), StackCheckError> {
    let unknown = || StackCheckError::UnknownEffect {
        at,
        ins: ins.to_string(),
    };
    let sp = |operand: &Operand| matches!(operand, Operand::Reg { reg: Reg::Sp, .. });

    Ok(match (ins.opcode, &ins.operands) {
        (Opcode::Push, Operands::One(a)) => (a.width().bytes() as i64, Flow::Next),
        (Opcode::Pop, Operands::One(a)) => (-(a.width().bytes() as i64), Flow::Next),
        (Opcode::Add, Operands::Two(dst, Operand::Imm { value, .. })) if sp(dst) => (*value, Flow::Next),
        (Opcode::Sub, Operands::Two(dst, Operand::Imm { value, .. })) if sp(dst) => (-*value, Flow::Next),
        (_, Operands::Two(dst, _)) if sp(dst) => return Err(unknown()),
        (Opcode::Call, _) | (Opcode::CallIndirect, _) => (CALL_EFFECT, Flow::Next),
        (Opcode::Jmp, _) => (0, Flow::Jump(displacement(ins).ok_or_else(unknown)?)),
        (op, _) if op.is_conditional_jump() => (0, Flow::Branch(displacement(ins).ok_or_else(unknown)?)),
        (Opcode::Ret | Opcode::Exit | Opcode::Crash, _) => (0, Flow::Stop),
        _ => (0, Flow::Next),
    })
}

/// Record that `at` is reached with `height`, queueing it on first visit.
fn reach(
    heights: &mut [Option<i64>],
    work: &mut Vec<(usize, i64)>,
    start: usize,
    at: usize,
    height: i64,
) -> Result<(), StackCheckError> {
    match heights[at - start] {
        Some(first) if first != height => Err(StackCheckError::Mismatch {
            at,
            first,
            second: height,
        }),
        Some(_) => Ok(()),
        None => {
            heights[at - start] = Some(height);
            work.push((at, height));
            Ok(())
        }
    }
}

/// Check the function occupying `range` of `code`, entered at its start
/// with height zero.
///
/// Returns the height at the function's terminator: zero for `ret`, the
/// size of the frame for `exit`.
pub fn check_function(code: &[Instruction], range: Range<usize>) -> Result<i64, StackCheckError> {
    if range.is_empty() {
        return Ok(0);
    }
    let mut heights: Vec<Option<i64>> = vec![None; range.len()];
    heights[0] = Some(0);
    let mut work = vec![(range.start, 0i64)];
    let mut final_height = None;

    while let Some((at, height)) = work.pop() {
        let ins = &code[at];
        let (delta, flow) = effect(ins, at)?;
        let after = height + delta;
        if after < 0 {
            return Err(StackCheckError::Underflow { at, height: after });
        }

        let in_range = |target: i64| -> Result<usize, StackCheckError> {
            if target >= range.start as i64 && target < range.end as i64 {
                Ok(target as usize)
            } else {
                Err(StackCheckError::JumpOutOfRange { at, target })
            }
        };

        match flow {
            Flow::Next => {
                let next = in_range(at as i64 + 1)?;
                reach(&mut heights, &mut work, range.start, next, after)?;
            }
            Flow::Jump(offset) => {
                let target = in_range(at as i64 + offset)?;
                reach(&mut heights, &mut work, range.start, target, after)?;
            }
            Flow::Branch(offset) => {
                let target = in_range(at as i64 + offset)?;
                reach(&mut heights, &mut work, range.start, target, after)?;
                let next = in_range(at as i64 + 1)?;
                reach(&mut heights, &mut work, range.start, next, after)?;
            }
            Flow::Stop => {
                if ins.opcode == Opcode::Ret && after != 0 {
                    return Err(StackCheckError::UnbalancedReturn { at, height: after });
                }
                if ins.opcode != Opcode::Crash {
                    match final_height {
                        Some(first) if first != after => {
                            return Err(StackCheckError::Mismatch {
                                at,
                                first,
                                second: after,
                            });
                        }
                        _ => final_height = Some(after),
                    }
                }
            }
        }
    }

    Ok(final_height.unwrap_or(0))
}
