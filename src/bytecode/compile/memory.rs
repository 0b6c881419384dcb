//! Symbolic addresses and the moves between memory and the operand stack.
//!
//! An [`Address`] describes a location without emitting anything. Turning it
//! into an operand happens in two steps: [`Generator::prepare`] pushes the
//! runtime inputs (pointer values, indices) onto the stack, then
//! [`Generator::resolve`] pops them into registers. Every runtime input is on
//! the stack before the first register is claimed, so evaluating one input
//! can never clobber a register holding another.

use crate::bytecode::op::{Opcode, Operand, Reg, Width, trap};
use crate::bytecode::regalloc::Ticket;
use crate::lang::node::{Expr, ExprKind, VarRef};
use crate::lang::types::{IntType, Type};

use super::{CompileError, Generator, LOCALS_BASE};

#[derive(Debug, Clone, PartialEq)]
pub enum Address<'e> {
    /// `inner + delta` bytes.
    Offset(Box<Address<'e>>, i64),
    /// The pointer stored at `inner`.
    Pointer(Box<Address<'e>>),
    /// The value of a register.
    RegisterPointer(Reg),
    /// The pointer computed by an expression.
    RuntimePointer(&'e Expr),
    /// `base + index * size`, the index computed at run time.
    RuntimeIndex(Box<Address<'e>>, &'e Expr, u64),
}

impl<'e> Address<'e> {
    /// `[reg + offset]`.
    pub fn at(reg: Reg, offset: i64) -> Self {
        Address::RegisterPointer(reg).offset(offset)
    }

    pub fn offset(self, delta: i64) -> Self {
        if delta == 0 {
            return self;
        }
        match self {
            Address::Offset(inner, offset) => Address::Offset(inner, offset + delta),
            other => Address::Offset(Box::new(other), delta),
        }
    }

    /// The location the pointer stored here points to.
    pub fn deref(self) -> Self {
        Address::Pointer(Box::new(self))
    }

    /// Element `index` of `size` bytes, starting here. Literal indices fold
    /// into a constant offset.
    pub fn index(self, index: &'e Expr, size: u64) -> Self {
        match index.kind {
            ExprKind::Literal(i) => self.offset(i * size as i64),
            _ => Address::RuntimeIndex(Box::new(self), index, size),
        }
    }
}

/// Register an address is relative to.
pub(super) enum Base {
    Fixed(Reg),
    Ticket(Ticket),
}

/// A resolved address: `base + offset`.
pub(super) struct Place {
    base: Base,
    offset: i64,
}

impl Place {
    fn reg(&self) -> Reg {
        match &self.base {
            Base::Fixed(reg) => *reg,
            Base::Ticket(ticket) => ticket.reg(),
        }
    }

    fn mem(&self, extra: i64, width: Width) -> Operand {
        let offset = self.offset + extra;
        let offset = i32::try_from(offset)
            .unwrap_or_else(|_| panic!("internal error: displacement {} out of range", offset));
        Operand::mem(self.reg(), offset, width)
    }

    fn is_stack(&self) -> bool {
        matches!(self.base, Base::Fixed(Reg::Sp))
    }
}

impl<'p> Generator<'p> {
    // =========================================================================
    // Resolution
    // =========================================================================

    /// Push the runtime inputs of `address`, innermost last.
    pub(super) fn prepare(&mut self, address: &Address<'_>) {
        match address {
            Address::Offset(inner, _) | Address::Pointer(inner) => self.prepare(inner),
            Address::RegisterPointer(_) => {}
            Address::RuntimePointer(expr) => self.push_expr(expr),
            Address::RuntimeIndex(base, index, _) => {
                self.push_expr(index);
                self.convert_top(&index.ty, &Type::Int(IntType::I64));
                self.prepare(base);
            }
        }
    }

    /// Pop the inputs pushed by [`Generator::prepare`] and compute the
    /// location.
    pub(super) fn resolve(&mut self, address: &Address<'_>) -> Place {
        match address {
            Address::Offset(inner, delta) => {
                let mut place = self.resolve(inner);
                place.offset += delta;
                place
            }
            Address::RegisterPointer(reg) => Place {
                base: Base::Fixed(*reg),
                offset: 0,
            },
            Address::Pointer(inner) => {
                let place = self.resolve(inner);
                let source = place.mem(0, Width::W64);
                let ticket = match place.base {
                    Base::Ticket(ticket) => ticket,
                    Base::Fixed(_) => self.regs.get_free(Width::W64),
                };
                self.asm.emit2(Opcode::Mov, ticket.operand(), source);
                self.null_check(&ticket);
                Place {
                    base: Base::Ticket(ticket),
                    offset: 0,
                }
            }
            Address::RuntimePointer(_) => {
                let ticket = self.regs.get_free(Width::W64);
                self.asm.emit1(Opcode::Pop, ticket.operand());
                self.null_check(&ticket);
                Place {
                    base: Base::Ticket(ticket),
                    offset: 0,
                }
            }
            Address::RuntimeIndex(base, _, size) => {
                let place = self.resolve(base);
                let index = self.regs.get_free(Width::W64);
                self.asm.emit1(Opcode::Pop, index.operand());
                if *size != 1 {
                    self.asm
                        .emit2(Opcode::Mul, index.operand(), Operand::imm64(*size as i64));
                }
                match place.base {
                    Base::Ticket(ticket) => {
                        self.asm.emit2(Opcode::Add, ticket.operand(), index.operand());
                        Place {
                            base: Base::Ticket(ticket),
                            offset: place.offset,
                        }
                    }
                    Base::Fixed(reg) => {
                        self.asm.emit2(Opcode::Add, index.operand(), Operand::reg64(reg));
                        Place {
                            base: Base::Ticket(index),
                            offset: place.offset,
                        }
                    }
                }
            }
        }
    }

    /// Trap with `crash 1` if the pointer in `ticket` is null.
    pub(super) fn null_check(&mut self, ticket: &Ticket) {
        if !self.config.null_checks {
            return;
        }
        let ok = self.asm.define_label();
        self.asm
            .emit2(Opcode::Cmp, ticket.operand(), Operand::imm64(0));
        self.asm.jump(Opcode::Jne, ok);
        self.asm
            .emit1(Opcode::Crash, Operand::imm64(trap::NULL_POINTER));
        self.asm.bind_label(ok);
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Push the `size` bytes at `address`, lowest chunk first.
    pub(super) fn push_from(&mut self, address: &Address<'_>, size: u64) {
        self.prepare(address);
        let place = self.resolve(address);
        let mut moved = 0;
        while moved < size {
            let width = self.chunk_width(size - moved);
            // each push moves sp past the bytes already copied
            let shift = if place.is_stack() { 0 } else { moved as i64 };
            self.asm.emit1(Opcode::Push, place.mem(shift, width));
            moved += width.bytes();
        }
    }

    /// Pop `size` bytes from the stack into `address`, highest chunk first.
    pub(super) fn pop_to(&mut self, address: &Address<'_>, size: u64) {
        self.prepare(address);
        let place = self.resolve(address);
        let mut moved = 0;
        while moved < size {
            let width = self.chunk_width(size - moved);
            moved += width.bytes();
            let low = (size - moved) as i64;
            let shift = if place.is_stack() { low + moved as i64 } else { low };
            self.asm.emit1(Opcode::Pop, place.mem(shift, width));
        }
    }

    /// Compute `address` into a 64-bit register.
    pub(super) fn address_value(&mut self, address: &Address<'_>) -> Ticket {
        self.prepare(address);
        let place = self.resolve(address);
        let ticket = match place.base {
            Base::Ticket(ticket) => ticket,
            Base::Fixed(reg) => {
                let ticket = self.regs.get_free(Width::W64);
                self.asm
                    .emit2(Opcode::Mov, ticket.operand(), Operand::reg64(reg));
                ticket
            }
        };
        self.add_const(ticket.operand(), place.offset);
        ticket
    }

    // =========================================================================
    // Places
    // =========================================================================

    /// Symbolic address of a place expression.
    ///
    /// Reports [`CompileError::NotAddressable`] and falls back to the exit
    /// slot for anything else.
    pub(super) fn place_address<'e>(&mut self, expr: &'e Expr) -> Address<'e> {
        match &expr.kind {
            ExprKind::Var(VarRef::Global(id)) => {
                Address::at(Reg::Gb, self.program.global_offset(*id) as i64)
            }
            ExprKind::Var(VarRef::Local(id)) => {
                let offset = self.ctx().locals.get(id).copied().unwrap_or_else(|| {
                    panic!("internal error: local #{} used outside its scope", id.0)
                });
                Address::at(Reg::Fp, LOCALS_BASE + offset as i64)
            }
            ExprKind::Var(VarRef::Param(index)) => {
                let slot = *self.ctx().params.get(*index).unwrap_or_else(|| {
                    panic!("internal error: no parameter #{}", index)
                });
                let address = Address::at(Reg::Fp, slot.offset);
                if slot.by_ref {
                    address.deref()
                } else {
                    address
                }
            }
            ExprKind::Deref(pointer) => match &pointer.kind {
                ExprKind::AddressOf(place) => self.place_address(place),
                _ if pointer.is_place() => self.place_address(pointer).deref(),
                _ => Address::RuntimePointer(&**pointer),
            },
            ExprKind::Index(base, index) => {
                let size = self.size_of(&expr.ty);
                let start = match base.ty {
                    Type::Pointer(_) if base.is_place() => self.place_address(base).deref(),
                    Type::Pointer(_) => Address::RuntimePointer(&**base),
                    _ => self.place_address(base),
                };
                start.index(index, size)
            }
            ExprKind::Field(base, field) => {
                let offset = self.field_offset(&base.ty, *field);
                self.place_address(base).offset(offset as i64)
            }
            _ => {
                self.report(CompileError::not_addressable(describe(expr)));
                Address::at(Reg::Gb, 0)
            }
        }
    }

    pub(super) fn field_offset(&self, ty: &Type, field: usize) -> u64 {
        match ty {
            Type::Struct(id) => self.program.struct_def(*id).fields[field].offset,
            other => panic!("internal error: field access on '{}'", other),
        }
    }
}

fn describe(expr: &Expr) -> &'static str {
    match expr.kind {
        ExprKind::Literal(_) => "a literal",
        ExprKind::Call(..) | ExprKind::CallIndirect(..) => "a call result",
        ExprKind::FunctionRef(_) => "a function reference",
        ExprKind::AddressOf(_) => "an address",
        ExprKind::Field(..) | ExprKind::Index(..) => "a part of a temporary",
        _ => "a computed value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_merge() {
        let a = Address::at(Reg::Fp, 8).offset(4).offset(-2);
        assert_eq!(
            a,
            Address::Offset(Box::new(Address::RegisterPointer(Reg::Fp)), 10)
        );
        assert_eq!(Address::at(Reg::Gb, 0), Address::RegisterPointer(Reg::Gb));
    }

    #[test]
    fn test_literal_index_folds() {
        let i = Expr::i64(3);
        let a = Address::at(Reg::Fp, 8).index(&i, 4);
        assert_eq!(a, Address::at(Reg::Fp, 20));
    }

    #[test]
    fn test_runtime_index_kept() {
        let i = Expr::local(crate::lang::program::LocalId(0), Type::Int(IntType::I64));
        let a = Address::at(Reg::Fp, 8).index(&i, 4);
        assert!(matches!(a, Address::RuntimeIndex(_, _, 4)));
    }

    #[test]
    fn test_offset_of_pointer_wraps() {
        let a = Address::at(Reg::Fp, -24).deref().offset(4);
        match a {
            Address::Offset(inner, 4) => assert!(matches!(*inner, Address::Pointer(_))),
            other => panic!("unexpected {:?}", other),
        }
    }
}
