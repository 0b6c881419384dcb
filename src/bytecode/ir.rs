use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::op::{Instruction, Reg};
use crate::lang::node::Span;

/// A linked bytecode program.
///
/// Every label operand has been replaced by an immediate; `entry` is the
/// offset of the first top-level instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub instructions: Vec<Instruction>,
    /// Bytes reserved for globals, including the exit-code slot at 0.
    pub globals_size: u64,
    pub entry: usize,
    pub debug: Option<DebugInfo>,
}

impl CompiledProgram {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::Decode)
    }

    /// Name of the function whose range contains `offset`.
    pub fn function_at(&self, offset: usize) -> Option<&str> {
        self.debug
            .as_ref()?
            .functions
            .iter()
            .find(|f| f.start <= offset && offset < f.end)
            .map(|f| f.name.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode: {0}")]
    Encode(postcard::Error),
    #[error("failed to decode: {0}\n  hint: the input must be produced by the same version of kiln")]
    Decode(postcard::Error),
}

// =============================================================================
// Debug metadata
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub lines: Vec<LineEntry>,
    pub scopes: Vec<ScopeInfo>,
    pub functions: Vec<FunctionRange>,
}

impl DebugInfo {
    /// Source position of the instruction at `offset`.
    pub fn span_at(&self, offset: usize) -> Option<Span> {
        self.lines
            .iter()
            .find(|l| l.start <= offset && offset < l.end)
            .map(|l| l.span)
    }
}

/// Instructions `[start, end)` were generated for `span`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineEntry {
    pub start: usize,
    pub end: usize,
    pub span: Span,
}

impl LineEntry {
    /// Collapse per-instruction spans into runs.
    pub fn table(instructions: &[Instruction]) -> Vec<LineEntry> {
        let mut lines: Vec<LineEntry> = Vec::new();
        for (offset, ins) in instructions.iter().enumerate() {
            match lines.last_mut() {
                Some(last) if last.span == ins.span => last.end = offset + 1,
                _ => lines.push(LineEntry {
                    start: offset,
                    end: offset + 1,
                    span: ins.span,
                }),
            }
        }
        lines
    }
}

/// Variables live in instructions `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub start: usize,
    pub end: usize,
    pub slots: Vec<SlotInfo>,
}

/// A named stack slot at `base + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub name: String,
    pub base: Reg,
    pub offset: i64,
    pub size: u64,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRange {
    pub name: String,
    pub start: usize,
    pub end: usize,
}
