use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::assembler::Assembler;
use crate::bytecode::label::Label;
use crate::lang::node::Span;
use crate::lang::program::FunctionId;

/// A reference to a function whose entry offset is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndefinedOffset {
    /// Label used by the referencing operand.
    pub label: Label,
    /// Position of the reference.
    pub span: Span,
    pub function: FunctionId,
}

/// Binds references to functions to their entry labels, compiling callees
/// on demand.
///
/// References to an already emitted function use its entry label directly.
/// Anything else goes through a fresh label recorded as an
/// [`UndefinedOffset`] until the function is emitted.
#[derive(Debug, Default)]
pub struct Linker {
    entries: HashMap<FunctionId, Label>,
    pending: Vec<UndefinedOffset>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label to use for a call to, or the address of, `function`.
    pub fn reference(&mut self, asm: &mut Assembler, function: FunctionId, span: Span) -> Label {
        if let Some(entry) = self.entries.get(&function) {
            return *entry;
        }
        let label = asm.define_label();
        self.pending.push(UndefinedOffset {
            label,
            span,
            function,
        });
        label
    }

    /// Record `entry` as the entry of `function` and bind every pending
    /// reference to it.
    pub fn define(&mut self, asm: &mut Assembler, function: FunctionId, entry: Label) {
        self.entries.insert(function, entry);

        let mut bound = 0;
        self.pending.retain(|record| {
            if record.function == function {
                asm.bind_label_to(record.label, entry);
                bound += 1;
                false
            } else {
                true
            }
        });
        debug!(function = function.0, bound, "linked function entry");
    }

    pub fn is_defined(&self, function: FunctionId) -> bool {
        self.entries.contains_key(&function)
    }

    /// References still waiting for their function.
    pub fn pending(&self) -> &[UndefinedOffset] {
        &self.pending
    }

    /// Next function that is referenced but not emitted.
    pub fn next_unresolved(&self) -> Option<FunctionId> {
        self.pending.first().map(|record| record.function)
    }
}
