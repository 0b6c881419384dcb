use crate::bytecode::label::Label;
use crate::bytecode::op::{Opcode, Operand, Reg, Width};
use crate::lang::node::{BinaryOp, CompareOp, Expr, ExprKind, LogicalOp, UnaryOp};
use crate::lang::types::Type;

use super::{Address, CompileError, Generator};

/// Register width and signedness of a scalar type.
fn scalar(ty: &Type) -> (Width, bool) {
    match ty {
        Type::Bool => (Width::W8, false),
        Type::Int(int) => match Width::from_bytes(int.bytes()) {
            Some(width) => (width, int.signed),
            None => panic!("internal error: no register width for '{}'", ty),
        },
        Type::Pointer(_) | Type::Function(_) => (Width::W64, false),
        Type::Void | Type::Array(..) | Type::Struct(_) => {
            panic!("internal error: '{}' is not a scalar", ty)
        }
    }
}

pub(super) fn is_scalar(ty: &Type) -> bool {
    matches!(
        ty,
        Type::Bool | Type::Int(_) | Type::Pointer(_) | Type::Function(_)
    )
}

fn arithmetic(op: BinaryOp, signed: bool) -> Opcode {
    match (op, signed) {
        (BinaryOp::Add, _) => Opcode::Add,
        (BinaryOp::Sub, _) => Opcode::Sub,
        (BinaryOp::Mul, _) => Opcode::Mul,
        (BinaryOp::Div, true) => Opcode::Div,
        (BinaryOp::Div, false) => Opcode::Divu,
        (BinaryOp::Rem, true) => Opcode::Rem,
        (BinaryOp::Rem, false) => Opcode::Remu,
        (BinaryOp::BitAnd, _) => Opcode::And,
        (BinaryOp::BitOr, _) => Opcode::Or,
        (BinaryOp::BitXor, _) => Opcode::Xor,
        (BinaryOp::Shl, _) => Opcode::Shl,
        (BinaryOp::Shr, true) => Opcode::Shr,
        (BinaryOp::Shr, false) => Opcode::Shru,
    }
}

fn jump_on(op: CompareOp) -> Opcode {
    match op {
        CompareOp::Eq => Opcode::Je,
        CompareOp::Ne => Opcode::Jne,
        CompareOp::Lt => Opcode::Jl,
        CompareOp::Le => Opcode::Jle,
        CompareOp::Gt => Opcode::Jg,
        CompareOp::Ge => Opcode::Jge,
    }
}

fn set_on(op: CompareOp) -> Opcode {
    match op {
        CompareOp::Eq => Opcode::Sete,
        CompareOp::Ne => Opcode::Setne,
        CompareOp::Lt => Opcode::Setl,
        CompareOp::Le => Opcode::Setle,
        CompareOp::Gt => Opcode::Setg,
        CompareOp::Ge => Opcode::Setge,
    }
}

impl Generator<'_> {
    /// Evaluate `expr`, leaving its value on top of the stack.
    pub(super) fn push_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(value) => {
                let (width, _) = scalar(&expr.ty);
                self.asm.push_imm(width, *value);
            }

            ExprKind::Var(_) | ExprKind::Deref(_) => self.push_place(expr),
            ExprKind::Index(..) | ExprKind::Field(..) if expr.is_place() => self.push_place(expr),

            ExprKind::Field(base, field) => {
                let offset = self.field_offset(&base.ty, *field);
                let size = self.size_of(&expr.ty);
                self.push_part(base, offset, size);
            }
            ExprKind::Index(base, index) => {
                let size = self.size_of(&expr.ty);
                match index.kind {
                    ExprKind::Literal(i) => self.push_part(base, (i as u64) * size, size),
                    _ => self.push_element(base, index, size),
                }
            }

            ExprKind::Unary(UnaryOp::Not, operand) => {
                self.push_expr(operand);
                let t = self.regs.get_free(Width::W8);
                self.asm.emit1(Opcode::Pop, t.operand());
                self.asm.emit2(Opcode::Xor, t.operand(), Operand::imm(Width::W8, 1));
                self.asm.emit1(Opcode::Push, t.operand());
            }
            ExprKind::Unary(op, operand) => {
                self.push_expr(operand);
                let (width, _) = scalar(&operand.ty);
                let t = self.regs.get_free(width);
                self.asm.emit1(Opcode::Pop, t.operand());
                let opcode = if *op == UnaryOp::Neg {
                    Opcode::Neg
                } else {
                    Opcode::Not
                };
                self.asm.emit1(opcode, t.operand());
                self.asm.emit1(Opcode::Push, t.operand());
            }

            ExprKind::Binary(op, lhs, rhs) => {
                self.push_expr(lhs);
                self.push_expr(rhs);
                let (rhs_width, _) = scalar(&rhs.ty);
                let (lhs_width, signed) = scalar(&lhs.ty);
                let b = self.regs.get_free(rhs_width);
                self.asm.emit1(Opcode::Pop, b.operand());
                let a = self.regs.get_free(lhs_width);
                self.asm.emit1(Opcode::Pop, a.operand());
                self.asm.emit2(arithmetic(*op, signed), a.operand(), b.operand());
                self.asm.emit1(Opcode::Push, a.operand());
            }

            ExprKind::Compare(op, lhs, rhs) => {
                self.emit_compare(lhs, rhs);
                let t = self.regs.get_free(Width::W8);
                self.asm.emit1(set_on(*op), t.operand());
                self.asm.emit1(Opcode::Push, t.operand());
            }

            ExprKind::Logical(..) => {
                let no = self.asm.define_label();
                let end = self.asm.define_label();
                self.jump_if_false(expr, no);
                self.asm.push_imm(Width::W8, 1);
                self.asm.jump(Opcode::Jmp, end);
                self.asm.bind_label(no);
                self.asm.push_imm(Width::W8, 0);
                self.asm.bind_label(end);
            }

            ExprKind::AddressOf(place) => {
                if place.is_place() {
                    let address = self.place_address(place);
                    let t = self.address_value(&address);
                    self.asm.emit1(Opcode::Push, t.operand());
                } else {
                    self.report(CompileError::not_addressable("a temporary"));
                    self.asm.push_imm(Width::W64, 0);
                }
            }

            ExprKind::Cast(operand) => {
                self.push_expr(operand);
                self.convert_top(&operand.ty, &expr.ty);
            }

            ExprKind::Call(function, args) => self.push_call(*function, args, &expr.ty),
            ExprKind::FunctionRef(function) => {
                let span = self.span();
                let label = self.linker.reference(&mut self.asm, *function, span);
                self.asm.emit1(Opcode::Push, Operand::abs(label));
            }
            ExprKind::CallIndirect(callee, args) => self.push_call_indirect(callee, args, &expr.ty),
        }
    }

    fn push_place(&mut self, expr: &Expr) {
        let size = self.size_of(&expr.ty);
        let address = self.place_address(expr);
        self.push_from(&address, size);
    }

    /// Evaluate `base` and keep only `size` bytes at `offset` of it.
    fn push_part(&mut self, base: &Expr, offset: u64, size: u64) {
        self.push_expr(base);
        let whole = self.size_of(&base.ty);
        if size == whole {
            return;
        }
        self.push_from(&Address::at(Reg::Sp, offset as i64 - whole as i64), size);
        self.keep_top(whole, size);
    }

    /// Evaluate the array `base` and keep only element `index` of it.
    fn push_element(&mut self, base: &Expr, index: &Expr, size: u64) {
        self.push_expr(base);
        let whole = self.size_of(&base.ty);
        // `sp` is read after the index is popped, at the end of the array
        let element = Address::at(Reg::Sp, -(whole as i64)).index(index, size);
        self.push_from(&element, size);
        self.keep_top(whole, size);
    }

    /// Replace a `whole`-byte value with the `size` bytes pushed right after
    /// it.
    fn keep_top(&mut self, whole: u64, size: u64) {
        self.pop_to(&Address::at(Reg::Sp, -((size + whole) as i64)), size);
        self.adjust_sp(-((whole - size) as i64));
    }

    /// Convert the integer on top of the stack from `from` to `to`.
    pub(super) fn convert_top(&mut self, from: &Type, to: &Type) {
        let (from_width, signed) = scalar(from);
        let (to_width, _) = scalar(to);
        if from_width == to_width {
            return;
        }
        let t = self.regs.get_free(Width::W64);
        self.asm.emit1(Opcode::Pop, t.low(from_width));
        if to_width > from_width {
            let extend = if signed { Opcode::Movsx } else { Opcode::Movzx };
            self.asm.emit2(extend, t.low(to_width), t.low(from_width));
        }
        self.asm.emit1(Opcode::Push, t.low(to_width));
    }

    /// Evaluate both operands and compare them at their own width, setting
    /// the flags. Unsigned operands (bools and pointers included) use `cmpu`.
    pub(super) fn emit_compare(&mut self, lhs: &Expr, rhs: &Expr) {
        self.push_expr(lhs);
        self.push_expr(rhs);
        let (width, signed) = scalar(&lhs.ty);
        let b = self.regs.get_free(width);
        self.asm.emit1(Opcode::Pop, b.operand());
        let a = self.regs.get_free(width);
        self.asm.emit1(Opcode::Pop, a.operand());
        let compare = if signed { Opcode::Cmp } else { Opcode::Cmpu };
        self.asm.emit2(compare, a.operand(), b.operand());
    }

    // =========================================================================
    // Conditions
    // =========================================================================

    /// Jump to `target` when `cond` is false; fall through otherwise.
    pub(super) fn jump_if_false(&mut self, cond: &Expr, target: Label) {
        match &cond.kind {
            ExprKind::Logical(LogicalOp::And, lhs, rhs) => {
                self.jump_if_false(lhs, target);
                self.jump_if_false(rhs, target);
            }
            ExprKind::Logical(LogicalOp::Or, lhs, rhs) => {
                let taken = self.asm.define_label();
                self.jump_if_true(lhs, taken);
                self.jump_if_false(rhs, target);
                self.asm.bind_label(taken);
            }
            ExprKind::Unary(UnaryOp::Not, operand) => self.jump_if_true(operand, target),
            ExprKind::Compare(op, lhs, rhs) => {
                self.emit_compare(lhs, rhs);
                self.asm.jump(jump_on(op.negate()), target);
            }
            ExprKind::Literal(value) => {
                if *value == 0 {
                    self.asm.jump(Opcode::Jmp, target);
                }
            }
            _ => self.test_value(cond, Opcode::Je, target),
        }
    }

    /// Jump to `target` when `cond` is true; fall through otherwise.
    pub(super) fn jump_if_true(&mut self, cond: &Expr, target: Label) {
        match &cond.kind {
            ExprKind::Logical(LogicalOp::And, lhs, rhs) => {
                let skip = self.asm.define_label();
                self.jump_if_false(lhs, skip);
                self.jump_if_true(rhs, target);
                self.asm.bind_label(skip);
            }
            ExprKind::Logical(LogicalOp::Or, lhs, rhs) => {
                self.jump_if_true(lhs, target);
                self.jump_if_true(rhs, target);
            }
            ExprKind::Unary(UnaryOp::Not, operand) => self.jump_if_false(operand, target),
            ExprKind::Compare(op, lhs, rhs) => {
                self.emit_compare(lhs, rhs);
                self.asm.jump(jump_on(*op), target);
            }
            ExprKind::Literal(value) => {
                if *value != 0 {
                    self.asm.jump(Opcode::Jmp, target);
                }
            }
            _ => self.test_value(cond, Opcode::Jne, target),
        }
    }

    fn test_value(&mut self, cond: &Expr, jump: Opcode, target: Label) {
        self.push_expr(cond);
        let (width, _) = scalar(&cond.ty);
        let t = self.regs.get_free(width);
        self.asm.emit1(Opcode::Pop, t.operand());
        self.asm.emit2(Opcode::Cmp, t.operand(), Operand::imm(width, 0));
        drop(t);
        self.asm.jump(jump, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::bytecode::op::Instruction;
    use crate::config::CodegenConfig;
    use crate::lang::node::Stmt;
    use crate::lang::program::Program;
    use crate::lang::types::IntType;

    fn main_code(stmts: Vec<Stmt>) -> Vec<Instruction> {
        let mut program = Program::new();
        for stmt in stmts {
            program.push_main(stmt);
        }
        let config = CodegenConfig {
            optimize: false,
            ..CodegenConfig::default()
        };
        compile(&program, config).unwrap().program.instructions
    }

    fn opcodes(code: &[Instruction]) -> Vec<Opcode> {
        code.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_scalar_widths() {
        assert_eq!(scalar(&Type::Bool), (Width::W8, false));
        assert_eq!(scalar(&Type::Int(IntType::I16)), (Width::W16, true));
        assert_eq!(scalar(&Type::pointer_to(Type::Bool)), (Width::W64, false));
        assert!(!is_scalar(&Type::array_of(Type::Bool, 2)));
    }

    #[test]
    fn test_unsigned_compare_uses_cmpu() {
        let x = Expr::int(1, IntType::U8);
        let y = Expr::int(200, IntType::U8);
        let code = main_code(vec![Stmt::expr(Expr::compare(CompareOp::Lt, x, y))]);
        let ops = opcodes(&code);
        assert!(!ops.contains(&Opcode::Cmp));
        assert!(ops.contains(&Opcode::Setl));
        let cmp = code.iter().find(|i| i.opcode == Opcode::Cmpu).unwrap();
        assert_eq!(cmp.a().map(|a| a.width()), Some(Width::W8));
    }

    #[test]
    fn test_arithmetic_follows_signedness() {
        assert_eq!(arithmetic(BinaryOp::Div, true), Opcode::Div);
        assert_eq!(arithmetic(BinaryOp::Div, false), Opcode::Divu);
        assert_eq!(arithmetic(BinaryOp::Rem, false), Opcode::Remu);
        assert_eq!(arithmetic(BinaryOp::Shr, false), Opcode::Shru);
        assert_eq!(arithmetic(BinaryOp::Shl, false), Opcode::Shl);
    }

    #[test]
    fn test_signed_compare_native_width() {
        let x = Expr::int(1, IntType::I32);
        let y = Expr::int(2, IntType::I32);
        let code = main_code(vec![Stmt::expr(Expr::compare(CompareOp::Ge, x, y))]);
        assert!(!opcodes(&code).contains(&Opcode::Movzx));
        let cmp = code.iter().find(|i| i.opcode == Opcode::Cmp).unwrap();
        assert_eq!(cmp.a().map(|a| a.width()), Some(Width::W32));
    }

    #[test]
    fn test_literal_condition_folds() {
        let code = main_code(vec![Stmt::if_(Expr::bool(true), vec![], None)]);
        let ops = opcodes(&code);
        assert!(!ops.contains(&Opcode::Cmp));
        assert!(!ops.contains(&Opcode::Jmp));
    }

    #[test]
    fn test_widening_cast_sign_extends() {
        let code = main_code(vec![Stmt::expr(Expr::cast(
            Expr::int(-1, IntType::I8),
            IntType::I64,
        ))]);
        assert!(opcodes(&code).contains(&Opcode::Movsx));
    }

    #[test]
    fn test_narrowing_cast_truncates() {
        let code = main_code(vec![Stmt::expr(Expr::cast(Expr::i64(300), IntType::U8))]);
        let ops = opcodes(&code);
        assert!(!ops.contains(&Opcode::Movsx));
        assert!(!ops.contains(&Opcode::Movzx));
        let push = code
            .iter()
            .rev()
            .find(|i| i.opcode == Opcode::Push)
            .unwrap();
        assert_eq!(push.a().map(|a| a.width()), Some(Width::W8));
    }

    #[test]
    fn test_address_of_temporary_reported() {
        let mut program = Program::new();
        program.push_main(Stmt::expr(Expr::address_of(Expr::i64(3))));
        let err = compile(&program, CodegenConfig::default()).unwrap_err();
        assert!(matches!(err.0[0].error, CompileError::NotAddressable { .. }));
    }
}
