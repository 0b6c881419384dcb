use crate::bytecode::op::{Opcode, Operand, Reg, Width};
use crate::lang::node::Expr;
use crate::lang::program::FunctionId;
use crate::lang::types::{Param, Type};

use super::{Address, CompileError, Generator};

impl Generator<'_> {
    /// Save `gb` and `fp`, point `fp` at the return-address slot and call.
    pub(super) fn emit_call(&mut self, function: FunctionId) {
        assert!(
            !self.regs.in_use(),
            "internal error: register live across call"
        );
        self.push_frame_tags();
        let span = self.span();
        let label = self.linker.reference(&mut self.asm, function, span);
        self.asm.jump(Opcode::Call, label);
    }

    fn push_frame_tags(&mut self) {
        self.asm.emit1(Opcode::Push, Operand::reg64(Reg::Gb));
        self.asm.emit1(Opcode::Push, Operand::reg64(Reg::Fp));
        self.asm
            .emit2(Opcode::Mov, Operand::reg64(Reg::Fp), Operand::reg64(Reg::Sp));
    }

    /// Call `function` and leave its result on the stack.
    pub(super) fn push_call(&mut self, function: FunctionId, args: &[Expr], ret: &Type) {
        let program = self.program;
        let def = program.function(function).unwrap_or_else(|| {
            panic!("internal error: call to undefined function #{}", function.0)
        });
        let ret_size = self.size_of(ret);
        if args.len() != def.params.len() {
            self.report(CompileError::ArgumentCount {
                function: def.name.clone(),
                expected: def.params.len(),
                found: args.len(),
            });
            self.push_zeros(ret_size);
            return;
        }

        self.adjust_sp(ret_size as i64);
        self.push_arguments(&def.params, args);
        self.emit_call(function);
        self.release_arguments(&def.params);
    }

    /// Call through the function pointer computed by `callee`.
    ///
    /// Arguments are evaluated before the callee.
    pub(super) fn push_call_indirect(&mut self, callee: &Expr, args: &[Expr], ret: &Type) {
        let Some(signature) = callee.ty.signature() else {
            panic!("internal error: indirect call through '{}'", callee.ty);
        };
        let ret_size = self.size_of(ret);
        if args.len() != signature.params.len() {
            self.report(CompileError::ArgumentCount {
                function: callee.ty.to_string(),
                expected: signature.params.len(),
                found: args.len(),
            });
            self.push_zeros(ret_size);
            return;
        }

        self.adjust_sp(ret_size as i64);
        self.push_arguments(&signature.params, args);
        self.push_expr(callee);
        assert!(
            !self.regs.in_use(),
            "internal error: register live across call"
        );
        let target = self.regs.get_free(Width::W64);
        self.asm.emit1(Opcode::Pop, target.operand());
        self.null_check(&target);
        self.push_frame_tags();
        self.asm.emit1(Opcode::CallIndirect, target.operand());
        drop(target);
        self.release_arguments(&signature.params);
    }

    fn push_arguments(&mut self, params: &[Param], args: &[Expr]) {
        for (param, arg) in params.iter().zip(args) {
            if param.by_ref {
                if arg.is_place() {
                    let address = self.place_address(arg);
                    let t = self.address_value(&address);
                    self.asm.emit1(Opcode::Push, t.operand());
                } else {
                    self.report(CompileError::not_addressable("a by-reference argument"));
                    self.asm.push_imm(Width::W64, 0);
                }
            } else if arg.ty != param.ty {
                self.report(CompileError::type_mismatch(&param.ty, &arg.ty));
                let size = self.size_of(&param.ty);
                self.push_zeros(size);
            } else {
                self.push_expr(arg);
            }
        }
    }

    /// After a call returns: destroy by-value arguments that need it, then
    /// pop the argument area so only the result remains.
    fn release_arguments(&mut self, params: &[Param]) {
        let program = self.program;
        let mut above = 0;
        for param in params.iter().rev() {
            above += program.param_size(param);
            if param.by_ref {
                continue;
            }
            let (destructor, deallocator) = program.cleanup_of(&param.ty);
            if destructor.is_some() || deallocator.is_some() {
                self.destroy_at(&Address::at(Reg::Sp, -(above as i64)), destructor, deallocator);
            }
        }
        self.adjust_sp(-(above as i64));
    }

    /// Call `function` with the address of `address` as its only argument.
    pub(super) fn call_with_pointer(&mut self, function: FunctionId, address: &Address<'_>) {
        let t = self.address_value(address);
        self.asm.emit1(Opcode::Push, t.operand());
        drop(t);
        self.emit_call(function);
        self.adjust_sp(-8);
    }
}
