use tracing::trace;

use crate::bytecode::label::{Label, LabelTable};
use crate::bytecode::op::{Instruction, Opcode, Operand, Width};
use crate::bytecode::peephole::{self, PairRewrite};
use crate::lang::node::Span;

/// Owns the instruction stream and its labels.
///
/// Every emitted instruction is offered to the peephole rules together with
/// its predecessor; [`Assembler::finish`] runs the rules once more over the
/// whole stream and replaces label operands with immediates.
pub struct Assembler {
    instructions: Vec<Instruction>,
    labels: LabelTable,
    optimize: bool,
    span: Span,
}

/// Output of [`Assembler::finish`]: resolved instructions plus the label
/// table, so callers can still read the final position of any label.
pub struct Assembled {
    pub instructions: Vec<Instruction>,
    pub labels: LabelTable,
}

impl Assembler {
    pub fn new(optimize: bool) -> Self {
        Self {
            instructions: Vec::new(),
            labels: LabelTable::new(),
            optimize,
            span: Span::default(),
        }
    }

    /// Offset the next instruction will be emitted at.
    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    /// Span attached to subsequently emitted instructions.
    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub fn span(&self) -> Span {
        self.span
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn emit(&mut self, ins: Instruction) {
        for label in ins.labels() {
            self.labels.note_reference(label);
        }
        self.instructions.push(ins.with_span(self.span));
        if self.optimize {
            self.optimize_tail();
        }
    }

    pub fn emit0(&mut self, opcode: Opcode) {
        self.emit(Instruction::new(opcode));
    }

    pub fn emit1(&mut self, opcode: Opcode, a: Operand) {
        self.emit(Instruction::unary(opcode, a));
    }

    pub fn emit2(&mut self, opcode: Opcode, a: Operand, b: Operand) {
        self.emit(Instruction::binary(opcode, a, b));
    }

    /// `jmp`/`jcc`/`call` to `label`.
    pub fn jump(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(opcode.is_relative_jump());
        self.emit1(opcode, Operand::rel(label));
    }

    pub fn push_imm(&mut self, width: Width, value: i64) {
        self.emit1(Opcode::Push, Operand::imm(width, value));
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn define_label(&mut self) -> Label {
        self.labels.define()
    }

    /// A new label bound to the current position.
    pub fn mark_label(&mut self) -> Label {
        self.labels.mark(self.position())
    }

    /// Bind `label` to the current position.
    pub fn bind_label(&mut self, label: Label) {
        let position = self.position();
        self.labels.bind(label, position);
    }

    /// Bind `label` to wherever `target` is bound.
    pub fn bind_label_to(&mut self, label: Label, target: Label) {
        let offset = self.labels.resolve(target);
        self.labels.bind(label, offset);
    }

    /// Debug position marker at the current position.
    pub fn anchor(&mut self) -> Label {
        self.labels.anchor(self.position())
    }

    pub fn is_referenced(&self, label: Label) -> bool {
        self.labels.is_referenced(label)
    }

    // =========================================================================
    // Optimization
    // =========================================================================

    fn can_rewrite(&self, index: usize) -> bool {
        !self.instructions[index].has_label_operand() && !self.labels.is_target(index)
    }

    fn remove(&mut self, index: usize) {
        self.instructions.remove(index);
        self.labels.shift_after_removal(index);
    }

    /// Try every rule on the window starting at `index`.
    fn rewrite_at(&mut self, index: usize) -> bool {
        if !self.can_rewrite(index) {
            return false;
        }
        if peephole::is_redundant(&self.instructions[index]) {
            trace!(index, ins = %self.instructions[index], "peephole: delete");
            self.remove(index);
            return true;
        }

        let next = index + 1;
        if next >= self.instructions.len() || !self.can_rewrite(next) {
            return false;
        }
        let Some(rewrite) = peephole::rewrite_pair(&self.instructions[index], &self.instructions[next])
        else {
            return false;
        };
        trace!(
            index,
            first = %self.instructions[index],
            second = %self.instructions[next],
            ?rewrite,
            "peephole: rewrite pair"
        );
        match rewrite {
            PairRewrite::DeleteBoth => {
                self.remove(next);
                self.remove(index);
            }
            PairRewrite::Fuse(ins) => {
                self.instructions[index] = ins;
                self.remove(next);
            }
            PairRewrite::ReplaceFirst(ins) => {
                self.instructions[index] = ins;
            }
        }
        true
    }

    /// Apply rules at the end of the stream until none fires.
    fn optimize_tail(&mut self) {
        loop {
            let len = self.instructions.len();
            if len == 0 {
                return;
            }
            if self.rewrite_at(len - 1) {
                continue;
            }
            if len >= 2 && self.rewrite_at(len - 2) {
                continue;
            }
            return;
        }
    }

    /// Apply rules everywhere until the stream stops changing.
    fn optimize_all(&mut self) {
        let before = self.instructions.len();
        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = false;
            let mut index = 0;
            while index < self.instructions.len() {
                if self.rewrite_at(index) {
                    changed = true;
                    index = index.saturating_sub(1);
                } else {
                    index += 1;
                }
            }
            if !changed {
                break;
            }
        }
        trace!(
            before,
            after = self.instructions.len(),
            passes,
            "peephole: global pass"
        );
    }

    /// Run the global optimization pass and resolve every label operand.
    ///
    /// Relative references become 32-bit displacements from the referencing
    /// instruction, absolute references 64-bit instruction offsets.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never bound.
    pub fn finish(mut self) -> Assembled {
        if self.optimize {
            self.optimize_all();
        }

        // labels that were defined but never placed must not be read again
        let dangling: Vec<Label> = self.labels.unbound().collect();
        for label in dangling {
            assert!(
                !self.labels.is_referenced(label),
                "internal error: label L{} referenced but never bound",
                label.id()
            );
            self.labels.invalidate(label);
        }

        let labels = self.labels;
        let mut instructions = self.instructions;
        for (site, ins) in instructions.iter_mut().enumerate() {
            for operand in ins.operands_mut() {
                if let Operand::Label {
                    label,
                    absolute,
                    offset,
                } = *operand
                {
                    let target = labels.resolve(label) as i64;
                    *operand = if absolute {
                        Operand::imm(Width::W64, target + offset)
                    } else {
                        Operand::imm(Width::W32, target - site as i64 + offset)
                    };
                }
            }
        }

        Assembled {
            instructions,
            labels,
        }
    }
}
