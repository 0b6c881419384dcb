use crate::bytecode::label::Label;
use crate::bytecode::op::{Opcode, Reg};
use crate::lang::node::{Block, Expr, IfArm, Stmt, StmtKind};
use crate::lang::program::{GlobalId, LocalId, POINTER_SIZE};
use crate::lang::types::{IntType, Type};

use super::expr::is_scalar;
use super::{Address, CompileError, ControlFrame, FrameKind, Generator};

/// Which loop exit a `break` or `continue` takes.
#[derive(Clone, Copy)]
enum LoopExit {
    Break,
    Continue,
}

impl Generator<'_> {
    pub(super) fn compile_stmt(&mut self, stmt: &Stmt) {
        if self.skipping() {
            return;
        }
        self.asm.set_span(stmt.span);

        match &stmt.kind {
            StmtKind::Let { var, init } => self.compile_let(*var, init.as_ref()),
            StmtKind::Assign { place, value } => self.compile_assign(place, value),
            StmtKind::Expr(expr) => {
                self.push_expr(expr);
                self.discard(&expr.ty);
            }
            StmtKind::If { arms, otherwise } => self.compile_if(arms, otherwise.as_ref()),
            StmtKind::While { cond, body } => self.compile_while(cond, body),
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => self.compile_for(init.as_deref(), cond.as_ref(), step.as_deref(), body),
            StmtKind::Return(value) => self.compile_return(value.as_ref()),
            StmtKind::Break => self.compile_loop_exit(LoopExit::Break),
            StmtKind::Continue => self.compile_loop_exit(LoopExit::Continue),
            StmtKind::Block(body) => self.compile_block(body),
            StmtKind::Delete(pointer) => self.compile_delete(pointer),
        }
    }

    pub(super) fn compile_block(&mut self, body: &Block) {
        self.enter_scope();
        self.compile_stmts(body);
        self.exit_scope();
    }

    /// Evaluate the initializer of global `index` into its slot.
    pub(super) fn init_global(&mut self, index: usize, init: &Expr) {
        let program = self.program;
        let id = GlobalId(index as u32);
        let ty = &program.global(id).var.ty;
        if init.ty != *ty {
            self.report(CompileError::type_mismatch(ty, &init.ty));
            return;
        }
        self.push_expr(init);
        let offset = program.global_offset(id) as i64;
        let size = self.size_of(ty);
        self.pop_to(&Address::at(Reg::Gb, offset), size);
    }

    fn compile_let(&mut self, var: LocalId, init: Option<&Expr>) {
        let program = self.program;
        let ty = &program.local(var).ty;
        let size = self.size_of(ty);
        match init {
            Some(value) if value.ty == *ty => self.push_expr(value),
            Some(value) => {
                self.report(CompileError::type_mismatch(ty, &value.ty));
                self.push_zeros(size);
            }
            None => self.push_zeros(size),
        }
        self.declare_local(var);
    }

    fn compile_assign(&mut self, place: &Expr, value: &Expr) {
        if !place.is_place() {
            self.report(CompileError::not_addressable("the left side of an assignment"));
            return;
        }
        if place.ty != value.ty {
            self.report(CompileError::type_mismatch(&place.ty, &value.ty));
            return;
        }
        let size = self.size_of(&value.ty);
        self.push_expr(value);
        let address = self.place_address(place);
        self.pop_to(&address, size);
    }

    fn compile_if(&mut self, arms: &[IfArm], otherwise: Option<&Block>) {
        let end = self.asm.define_label();
        for (i, arm) in arms.iter().enumerate() {
            let next = self.asm.define_label();
            self.jump_if_false(&arm.cond, next);
            self.compile_block(&arm.body);
            let last = i + 1 == arms.len();
            if (!last || otherwise.is_some()) && !self.skipping() {
                self.asm.jump(Opcode::Jmp, end);
            }
            self.place_label(next);
        }
        if let Some(body) = otherwise {
            self.compile_block(body);
        }
        self.place_label(end);
    }

    fn enter_loop(&mut self, break_label: Label, continue_label: Label) {
        self.frames.push(ControlFrame {
            kind: FrameKind::Loop {
                break_label,
                continue_label,
                scope_depth: self.scopes.len(),
            },
            skipping: false,
        });
    }

    fn leave_loop(&mut self) {
        match self.frames.pop() {
            Some(ControlFrame {
                kind: FrameKind::Loop { .. },
                ..
            }) => {}
            _ => panic!("internal error: loop frame missing"),
        }
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block) {
        let top = self.asm.mark_label();
        let exit = self.asm.define_label();
        self.jump_if_false(cond, exit);

        self.enter_loop(exit, top);
        self.compile_block(body);
        if !self.skipping() {
            self.asm.jump(Opcode::Jmp, top);
        }
        self.leave_loop();
        self.place_label(exit);
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Block,
    ) {
        self.enter_scope();
        if let Some(init) = init {
            self.compile_stmt(init);
        }

        let top = self.asm.mark_label();
        let exit = self.asm.define_label();
        let next = self.asm.define_label();
        if let Some(cond) = cond {
            self.jump_if_false(cond, exit);
        }

        self.enter_loop(exit, next);
        self.compile_block(body);
        let fell_through = !self.skipping();
        self.leave_loop();

        self.place_label(next);
        if fell_through || self.asm.is_referenced(next) {
            if let Some(step) = step {
                self.compile_stmt(step);
            }
            if !self.skipping() {
                self.asm.jump(Opcode::Jmp, top);
            }
        }
        self.place_label(exit);
        self.exit_scope();
    }

    fn compile_return(&mut self, value: Option<&Expr>) {
        if self.ctx().is_main {
            if let Some(value) = value {
                if is_scalar(&value.ty) {
                    self.push_expr(value);
                    self.convert_top(&value.ty, &Type::Int(IntType::I64));
                    self.pop_to(&Address::at(Reg::Gb, 0), POINTER_SIZE);
                } else {
                    self.report(CompileError::type_mismatch("i64", &value.ty));
                }
            }
        } else {
            let slot = self.ctx().ret.clone();
            match (value, slot) {
                (Some(value), Some(slot)) if value.ty == slot.ty => {
                    self.push_expr(value);
                    self.pop_to(&Address::at(Reg::Fp, slot.offset), slot.size);
                }
                (Some(value), Some(slot)) => {
                    self.report(CompileError::type_mismatch(&slot.ty, &value.ty));
                }
                (Some(value), None) if value.ty.is_void() => self.push_expr(value),
                (Some(value), None) => {
                    self.report(CompileError::type_mismatch("void", &value.ty));
                }
                (None, Some(slot)) => {
                    self.report(CompileError::type_mismatch(&slot.ty, "void"));
                }
                (None, None) => {}
            }
        }

        let base = self.ctx().scope_base;
        self.emit_cleanup_to(base);
        let function = &mut self.frames[0];
        let FrameKind::Function { return_label } = function.kind else {
            panic!("internal error: function frame missing");
        };
        function.skipping = true;
        self.asm.jump(Opcode::Jmp, return_label);
    }

    fn compile_loop_exit(&mut self, exit: LoopExit) {
        let innermost = self
            .frames
            .iter()
            .rposition(|frame| matches!(frame.kind, FrameKind::Loop { .. }));
        let Some(index) = innermost else {
            self.report(match exit {
                LoopExit::Break => CompileError::BreakOutsideLoop,
                LoopExit::Continue => CompileError::ContinueOutsideLoop,
            });
            return;
        };
        let FrameKind::Loop {
            break_label,
            continue_label,
            scope_depth,
        } = self.frames[index].kind
        else {
            unreachable!();
        };

        self.emit_cleanup_to(scope_depth);
        let target = match exit {
            LoopExit::Break => break_label,
            LoopExit::Continue => continue_label,
        };
        self.asm.jump(Opcode::Jmp, target);
        self.frames[index].skipping = true;
    }

    /// Run the pointee's destructor and deallocator on the pointer value.
    fn compile_delete(&mut self, pointer: &Expr) {
        let Some(pointee) = pointer.ty.element() else {
            self.report(CompileError::type_mismatch("a pointer", &pointer.ty));
            return;
        };
        let (destructor, deallocator) = self.program.cleanup_of(pointee);

        self.push_expr(pointer);
        for function in [destructor, deallocator].into_iter().flatten() {
            self.push_from(&Address::at(Reg::Sp, -(POINTER_SIZE as i64)), POINTER_SIZE);
            self.emit_call(function);
            self.adjust_sp(-(POINTER_SIZE as i64));
        }
        self.adjust_sp(-(POINTER_SIZE as i64));
    }
}
