use crate::bytecode::ir::{DebugInfo, FunctionRange, LineEntry, ScopeInfo, SlotInfo};
use crate::bytecode::label::{Label, LabelTable};
use crate::bytecode::op::{Instruction, Reg};
use crate::lang::program::{FunctionId, LocalId};
use crate::lang::types::Type;

use super::{Address, CompileError, Generator, LOCALS_BASE};

/// A value whose storage is reclaimed when its scope ends.
#[derive(Debug, Clone)]
pub(super) struct CleanupItem {
    pub name: String,
    pub ty: Type,
    /// Offset from the locals base.
    pub offset: u64,
    pub size: u64,
    pub destructor: Option<FunctionId>,
    pub deallocator: Option<FunctionId>,
}

impl CleanupItem {
    fn address(&self) -> Address<'static> {
        Address::at(Reg::Fp, LOCALS_BASE + self.offset as i64)
    }
}

#[derive(Debug)]
pub(super) struct Scope {
    pub items: Vec<CleanupItem>,
    /// Index into the debug scope table.
    debug: usize,
}

impl Scope {
    pub fn size(&self) -> u64 {
        self.items.iter().map(|item| item.size).sum()
    }
}

impl Generator<'_> {
    pub(super) fn enter_scope(&mut self) {
        let start = self.asm.anchor();
        let debug = self.debug.open_scope(start);
        self.scopes.push(Scope {
            items: Vec::new(),
            debug,
        });
    }

    /// Leave the innermost scope, destroying its values if control can
    /// reach the end of it.
    pub(super) fn exit_scope(&mut self) {
        let index = self.scopes.len() - 1;
        if !self.skipping() {
            self.emit_scope_cleanup(index);
        }

        let Some(scope) = self.scopes.pop() else {
            panic!("internal error: scope stack underflow");
        };
        self.ctx_mut().frame_size -= scope.size();

        let end = self.asm.anchor();
        self.debug.close_scope(scope.debug, end);
    }

    /// Destroy the values of scopes `depth..` (innermost first) and release
    /// their storage, without leaving them. Used by `break`, `continue` and
    /// `return`.
    pub(super) fn emit_cleanup_to(&mut self, depth: usize) {
        for index in (depth..self.scopes.len()).rev() {
            self.emit_scope_cleanup(index);
        }
    }

    fn emit_scope_cleanup(&mut self, index: usize) {
        let doomed: Vec<CleanupItem> = self.scopes[index]
            .items
            .iter()
            .rev()
            .filter(|item| item.destructor.is_some() || item.deallocator.is_some())
            .cloned()
            .collect();
        for item in doomed {
            self.destroy_at(&item.address(), item.destructor, item.deallocator);
        }
        let size = self.scopes[index].size();
        self.adjust_sp(-(size as i64));
    }

    /// Run the destructor, then the deallocator, on the value at `address`.
    pub(super) fn destroy_at(
        &mut self,
        address: &Address<'_>,
        destructor: Option<FunctionId>,
        deallocator: Option<FunctionId>,
    ) {
        for function in [destructor, deallocator].into_iter().flatten() {
            self.call_with_pointer(function, address);
        }
    }

    /// Destroy a value of type `ty` sitting on top of the stack, then pop it.
    pub(super) fn discard(&mut self, ty: &Type) {
        let size = self.size_of(ty);
        let (destructor, deallocator) = self.program.cleanup_of(ty);
        if destructor.is_some() || deallocator.is_some() {
            self.destroy_at(&Address::at(Reg::Sp, -(size as i64)), destructor, deallocator);
        }
        self.adjust_sp(-(size as i64));
    }

    /// Register the value just pushed as local `var` of the innermost scope.
    pub(super) fn declare_local(&mut self, var: LocalId) {
        let program = self.program;
        let def = program.local(var);
        let size = program.size_of(&def.ty);
        let (destructor, deallocator) = program.cleanup_of(&def.ty);

        let ctx = self.ctx_mut();
        let offset = ctx.frame_size;
        ctx.locals.insert(var, offset);
        ctx.frame_size += size;
        let frame_size = ctx.frame_size;

        let item = CleanupItem {
            name: def.name.clone(),
            ty: def.ty.clone(),
            offset,
            size,
            destructor,
            deallocator,
        };
        let Some(scope) = self.scopes.last_mut() else {
            panic!("internal error: local declared outside any scope");
        };
        self.debug.add_slot(
            scope.debug,
            SlotInfo {
                name: item.name.clone(),
                base: Reg::Fp,
                offset: LOCALS_BASE + offset as i64,
                size,
                ty: item.ty.to_string(),
            },
        );
        scope.items.push(item);

        let limit = self.config.stack_warning_limit;
        if frame_size > limit && !self.ctx().warned {
            self.ctx_mut().warned = true;
            let function = self.ctx().name.clone();
            self.report(CompileError::LargeFrame {
                function,
                size: frame_size,
                limit,
            });
        }
    }

    /// Add the parameters of the current function to its scope's debug slots.
    pub(super) fn describe_params(&mut self) {
        let program = self.program;
        let Some(def) = self.ctx().id.and_then(|id| program.function(id)) else {
            return;
        };
        let Some(debug) = self.scopes.last().map(|scope| scope.debug) else {
            return;
        };
        let offsets: Vec<i64> = self.ctx().params.iter().map(|slot| slot.offset).collect();
        for (param, offset) in def.params.iter().zip(offsets) {
            let ty = if param.by_ref {
                format!("&{}", param.ty)
            } else {
                param.ty.to_string()
            };
            self.debug.add_slot(
                debug,
                SlotInfo {
                    name: param.name.clone(),
                    base: Reg::Fp,
                    offset,
                    size: program.param_size(param),
                    ty,
                },
            );
        }
    }
}

// =============================================================================
// Debug tables
// =============================================================================

#[derive(Debug)]
struct OpenScope {
    start: Label,
    end: Option<Label>,
    slots: Vec<SlotInfo>,
}

/// Debug metadata recorded against labels during emission, resolved to
/// offsets once the instruction stream is final.
#[derive(Debug, Default)]
pub(super) struct DebugBuilder {
    scopes: Vec<OpenScope>,
    functions: Vec<(String, Label, Label)>,
}

impl DebugBuilder {
    fn open_scope(&mut self, start: Label) -> usize {
        self.scopes.push(OpenScope {
            start,
            end: None,
            slots: Vec::new(),
        });
        self.scopes.len() - 1
    }

    fn close_scope(&mut self, index: usize, end: Label) {
        self.scopes[index].end = Some(end);
    }

    fn add_slot(&mut self, index: usize, slot: SlotInfo) {
        self.scopes[index].slots.push(slot);
    }

    pub(super) fn add_function(&mut self, name: String, entry: Label, end: Label) {
        self.functions.push((name, entry, end));
    }

    pub(super) fn build(self, labels: &LabelTable, instructions: &[Instruction]) -> DebugInfo {
        let scopes = self
            .scopes
            .into_iter()
            .filter_map(|scope| {
                let end = labels.resolve(scope.end?);
                Some(ScopeInfo {
                    start: labels.resolve(scope.start),
                    end,
                    slots: scope.slots,
                })
            })
            .collect();
        let functions = self
            .functions
            .into_iter()
            .map(|(name, entry, end)| FunctionRange {
                name,
                start: labels.resolve(entry),
                end: labels.resolve(end),
            })
            .collect();

        DebugInfo {
            lines: LineEntry::table(instructions),
            scopes,
            functions,
        }
    }
}
