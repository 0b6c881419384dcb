use serde::{Deserialize, Serialize};

/// Identity of a jump/reference target, independent of its position.
///
/// Two labels bound to the same offset are still distinct labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    Unbound,
    Bound(usize),
    Invalid,
}

#[derive(Debug, Clone)]
struct LabelRecord {
    state: LabelState,
    /// Number of emitted operands naming this label.
    references: u32,
    /// Anchors mark positions for debug metadata and never count as
    /// branch targets.
    anchor: bool,
}

/// Arena of labels indexed by id.
///
/// Operands store label ids, so binding or rebinding a label retargets every
/// operand that refers to it.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    records: Vec<LabelRecord>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, state: LabelState, anchor: bool) -> Label {
        self.records.push(LabelRecord {
            state,
            references: 0,
            anchor,
        });
        Label(self.records.len() as u32 - 1)
    }

    /// A new label with no position yet.
    pub fn define(&mut self) -> Label {
        self.push(LabelState::Unbound, false)
    }

    /// A new label bound to `offset`.
    pub fn mark(&mut self, offset: usize) -> Label {
        self.push(LabelState::Bound(offset), false)
    }

    /// A position marker bound to `offset` that is not a branch target.
    pub fn anchor(&mut self, offset: usize) -> Label {
        self.push(LabelState::Bound(offset), true)
    }

    fn record(&self, label: Label) -> &LabelRecord {
        &self.records[label.0 as usize]
    }

    fn record_mut(&mut self, label: Label) -> &mut LabelRecord {
        &mut self.records[label.0 as usize]
    }

    /// Bind (or rebind) `label` to `offset`.
    pub fn bind(&mut self, label: Label, offset: usize) {
        self.record_mut(label).state = LabelState::Bound(offset);
    }

    /// Mark `label` as dropped; resolving it afterwards is a bug.
    pub fn invalidate(&mut self, label: Label) {
        self.record_mut(label).state = LabelState::Invalid;
    }

    pub fn state(&self, label: Label) -> LabelState {
        self.record(label).state
    }

    /// Final offset of `label`.
    ///
    /// # Panics
    ///
    /// Panics if the label is unbound or invalid: some reference was never
    /// linked, which is a bug in code generation.
    pub fn resolve(&self, label: Label) -> usize {
        match self.state(label) {
            LabelState::Bound(offset) => offset,
            LabelState::Unbound => {
                panic!("internal error: label L{} read before being bound", label.0)
            }
            LabelState::Invalid => panic!("internal error: label L{} is invalid", label.0),
        }
    }

    pub fn note_reference(&mut self, label: Label) {
        self.record_mut(label).references += 1;
    }

    pub fn is_referenced(&self, label: Label) -> bool {
        self.record(label).references > 0
    }

    /// Whether a branch-target label is bound to `offset`.
    pub fn is_target(&self, offset: usize) -> bool {
        self.records
            .iter()
            .any(|r| !r.anchor && r.state == LabelState::Bound(offset))
    }

    /// Account for the instruction at `index` being deleted.
    pub fn shift_after_removal(&mut self, index: usize) {
        for record in &mut self.records {
            if let LabelState::Bound(offset) = &mut record.state {
                if *offset > index {
                    *offset -= 1;
                }
            }
        }
    }

    /// Labels that are still unbound.
    pub fn unbound(&self) -> impl Iterator<Item = Label> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == LabelState::Unbound)
            .map(|(i, _)| Label(i as u32))
    }
}
