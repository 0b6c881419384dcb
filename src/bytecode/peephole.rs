//! Local rewrite rules over one or two adjacent instructions.
//!
//! The rules here only look at instruction shapes. The assembler decides
//! whether a window may be rewritten at all: no instruction in the window may
//! be a branch target or carry a pending label operand.

use crate::bytecode::op::{Instruction, Opcode, Operand, Operands, Reg, Slice, Width};

/// Rewrite of a two-instruction window.
#[derive(Debug, Clone, PartialEq)]
pub enum PairRewrite {
    /// Remove both instructions.
    DeleteBoth,
    /// Replace both instructions with one.
    Fuse(Instruction),
    /// Replace the first instruction, keep the second.
    ReplaceFirst(Instruction),
}

/// Whether a single instruction has no effect and can be deleted.
pub fn is_redundant(ins: &Instruction) -> bool {
    match (ins.opcode, &ins.operands) {
        (Opcode::Nop, _) => true,
        (Opcode::Mov, Operands::Two(Operand::Reg { reg: a, slice: sa }, Operand::Reg { reg: b, slice: sb })) => {
            a == b && sa == sb
        }
        (Opcode::Add | Opcode::Sub, Operands::Two(dst, Operand::Imm { value, .. })) => {
            (*value as u64) & dst.width().mask() == 0
        }
        _ => false,
    }
}

/// Find a rewrite for the window `first, second`.
pub fn rewrite_pair(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    push_pop_to_mov(first, second)
        .or_else(|| push_discard(first, second))
        .or_else(|| merge_immediate_pushes(first, second))
        .or_else(|| fold_add_sub(first, second))
        .or_else(|| dead_pop(first, second))
}

fn sp_adjust(opcode: Opcode, bytes: u64) -> Instruction {
    Instruction::binary(opcode, Operand::reg64(Reg::Sp), Operand::imm64(bytes as i64))
}

/// `push x` + `pop r` of the same width is `mov r, x`.
fn push_pop_to_mov(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    match (first.opcode, &first.operands, second.opcode, &second.operands) {
        (Opcode::Push, Operands::One(src), Opcode::Pop, Operands::One(dst @ Operand::Reg { .. }))
            if src.width() == dst.width() =>
        {
            Some(PairRewrite::Fuse(
                Instruction::binary(Opcode::Mov, *dst, *src).with_span(first.span),
            ))
        }
        _ => None,
    }
}

/// `push x` immediately discarded by `sub sp, w`.
fn push_discard(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    match (first.opcode, &first.operands, second.opcode, &second.operands) {
        (
            Opcode::Push,
            Operands::One(src),
            Opcode::Sub,
            Operands::Two(
                Operand::Reg {
                    reg: Reg::Sp,
                    slice: Slice::Q,
                },
                Operand::Imm { value, .. },
            ),
        ) if *value as u64 == src.width().bytes() => Some(PairRewrite::DeleteBoth),
        _ => None,
    }
}

/// Two immediate pushes of width `w` become one push of width `2w`, the
/// first value in the low half.
fn merge_immediate_pushes(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    match (first.opcode, &first.operands, second.opcode, &second.operands) {
        (
            Opcode::Push,
            Operands::One(Operand::Imm { width: wa, value: a }),
            Opcode::Push,
            Operands::One(Operand::Imm { width: wb, value: b }),
        ) if wa == wb => {
            let wide = wa.double()?;
            let low = (*a as u64) & wa.mask();
            let high = ((*b as u64) & wa.mask()) << wa.bits();
            Some(PairRewrite::Fuse(
                Instruction::unary(Opcode::Push, Operand::imm(wide, (low | high) as i64))
                    .with_span(first.span),
            ))
        }
        _ => None,
    }
}

fn signed_immediate(opcode: Opcode, value: i64) -> Option<i64> {
    match opcode {
        Opcode::Add => Some(value),
        Opcode::Sub => Some(value.wrapping_neg()),
        _ => None,
    }
}

/// `add/sub x, i` + `add/sub x, j` on the same operand.
fn fold_add_sub(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    let (Operands::Two(dst_a, Operand::Imm { value: i, .. }), Operands::Two(dst_b, Operand::Imm { value: j, .. })) =
        (&first.operands, &second.operands)
    else {
        return None;
    };
    if dst_a != dst_b || matches!(dst_a, Operand::Imm { .. } | Operand::Label { .. }) {
        return None;
    }
    let net = signed_immediate(first.opcode, *i)?.wrapping_add(signed_immediate(second.opcode, *j)?);

    let width = dst_a.width();
    let net = width.sign_extend(net as u64);
    let (opcode, magnitude) = if net < 0 && net != i64::MIN {
        (Opcode::Sub, -net)
    } else {
        (Opcode::Add, net)
    };
    let imm_width = if matches!(dst_a, Operand::Reg { reg: Reg::Sp, .. }) {
        Width::W64
    } else {
        width
    };
    Some(PairRewrite::Fuse(
        Instruction::binary(opcode, *dst_a, Operand::imm(imm_width, magnitude)).with_span(first.span),
    ))
}

/// `pop r` + `pop r`: the first popped value is overwritten unread.
fn dead_pop(first: &Instruction, second: &Instruction) -> Option<PairRewrite> {
    match (first.opcode, &first.operands, second.opcode, &second.operands) {
        (
            Opcode::Pop,
            Operands::One(a @ Operand::Reg { reg: Reg::R(_), .. }),
            Opcode::Pop,
            Operands::One(b),
        ) if a == b => Some(PairRewrite::ReplaceFirst(
            sp_adjust(Opcode::Sub, a.width().bytes()).with_span(first.span),
        )),
        _ => None,
    }
}
