use serde::{Deserialize, Serialize};

use crate::bytecode::label::Label;
use crate::lang::node::Span;

// =============================================================================
// Registers
// =============================================================================

/// Number of allocatable general-purpose registers.
pub const GENERAL_REGISTERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reg {
    /// General-purpose register `r0`..`r7`.
    R(u8),
    /// Stack pointer: first free byte of the operand stack.
    Sp,
    /// Frame pointer: address of the current return-address slot.
    Fp,
    /// Absolute global base.
    Gb,
}

impl Reg {
    /// Index into the interpreter's register file.
    pub fn index(self) -> usize {
        match self {
            Reg::R(n) => n as usize,
            Reg::Sp => GENERAL_REGISTERS,
            Reg::Fp => GENERAL_REGISTERS + 1,
            Reg::Gb => GENERAL_REGISTERS + 2,
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reg::R(n) => write!(f, "r{}", n),
            Reg::Sp => write!(f, "sp"),
            Reg::Fp => write!(f, "fp"),
            Reg::Gb => write!(f, "gb"),
        }
    }
}

/// Operand width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> u64 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn from_bytes(bytes: u64) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            8 => Some(Width::W64),
            _ => None,
        }
    }

    /// The width twice as wide, if there is one.
    pub fn double(self) -> Option<Width> {
        Width::from_bytes(self.bytes() * 2)
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }

    /// Truncate `value` to this width, then sign-extend back to 64 bits.
    pub fn sign_extend(self, value: u64) -> i64 {
        let shift = 64 - self.bits();
        ((value << shift) as i64) >> shift
    }
}

/// Bit range of a register addressed by an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slice {
    /// Bits 0..8.
    B0,
    /// Bits 8..16.
    B1,
    /// Bits 0..16.
    W,
    /// Bits 0..32.
    D,
    /// Bits 0..64.
    Q,
}

impl Slice {
    pub fn width(self) -> Width {
        match self {
            Slice::B0 | Slice::B1 => Width::W8,
            Slice::W => Width::W16,
            Slice::D => Width::W32,
            Slice::Q => Width::W64,
        }
    }

    /// Bit position of the slice's least significant bit.
    pub fn shift(self) -> u32 {
        match self {
            Slice::B1 => 8,
            _ => 0,
        }
    }

    /// Occupied bytes of the 64-bit register, one bit per byte.
    pub fn byte_mask(self) -> u8 {
        match self {
            Slice::B0 => 0b0000_0001,
            Slice::B1 => 0b0000_0010,
            Slice::W => 0b0000_0011,
            Slice::D => 0b0000_1111,
            Slice::Q => 0b1111_1111,
        }
    }

    pub fn overlaps(self, other: Slice) -> bool {
        self.byte_mask() & other.byte_mask() != 0
    }

    /// Candidate slices for a width, in allocation order.
    pub fn candidates(width: Width) -> &'static [Slice] {
        match width {
            Width::W8 => &[Slice::B0, Slice::B1],
            Width::W16 => &[Slice::W],
            Width::W32 => &[Slice::D],
            Width::W64 => &[Slice::Q],
        }
    }

    pub fn full(width: Width) -> Slice {
        Slice::candidates(width)[0]
    }
}

// =============================================================================
// Operands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Imm {
        width: Width,
        value: i64,
    },
    Reg {
        reg: Reg,
        slice: Slice,
    },
    /// Memory at `reg + offset`.
    Mem {
        base: Reg,
        offset: i32,
        width: Width,
    },
    /// Pending reference to a label; replaced by an immediate when the
    /// program is linked.
    Label {
        label: Label,
        absolute: bool,
        offset: i64,
    },
}

impl Operand {
    pub fn imm(width: Width, value: i64) -> Operand {
        Operand::Imm { width, value }
    }

    pub fn imm64(value: i64) -> Operand {
        Operand::imm(Width::W64, value)
    }

    pub fn reg(reg: Reg, slice: Slice) -> Operand {
        Operand::Reg { reg, slice }
    }

    pub fn reg64(reg: Reg) -> Operand {
        Operand::reg(reg, Slice::Q)
    }

    pub fn mem(base: Reg, offset: i32, width: Width) -> Operand {
        Operand::Mem {
            base,
            offset,
            width,
        }
    }

    pub fn rel(label: Label) -> Operand {
        Operand::Label {
            label,
            absolute: false,
            offset: 0,
        }
    }

    pub fn abs(label: Label) -> Operand {
        Operand::Label {
            label,
            absolute: true,
            offset: 0,
        }
    }

    /// Width of the value the operand reads or writes.
    pub fn width(&self) -> Width {
        match self {
            Operand::Imm { width, .. } => *width,
            Operand::Reg { slice, .. } => slice.width(),
            Operand::Mem { width, .. } => *width,
            Operand::Label { absolute: true, .. } => Width::W64,
            Operand::Label { absolute: false, .. } => Width::W32,
        }
    }

    pub fn label(&self) -> Option<Label> {
        match self {
            Operand::Label { label, .. } => Some(*label),
            _ => None,
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Operand::Label { .. })
    }

    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Register read when the operand is evaluated, if any.
    pub fn base_register(&self) -> Option<Reg> {
        match self {
            Operand::Reg { reg, .. } => Some(*reg),
            Operand::Mem { base, .. } => Some(*base),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Imm { width, value } => write!(f, "{}:{}", value, width.bits()),
            Operand::Reg { reg, slice } => match (reg, slice) {
                (Reg::R(_), Slice::Q) | (Reg::Sp | Reg::Fp | Reg::Gb, _) => write!(f, "{}", reg),
                (_, Slice::B0) => write!(f, "{}.b0", reg),
                (_, Slice::B1) => write!(f, "{}.b1", reg),
                (_, Slice::W) => write!(f, "{}.w", reg),
                (_, Slice::D) => write!(f, "{}.d", reg),
            },
            Operand::Mem {
                base,
                offset,
                width,
            } => {
                let kind = match width {
                    Width::W8 => "byte",
                    Width::W16 => "word",
                    Width::W32 => "dword",
                    Width::W64 => "qword",
                };
                if *offset == 0 {
                    write!(f, "{} [{}]", kind, base)
                } else {
                    write!(f, "{} [{}{:+}]", kind, base, offset)
                }
            }
            Operand::Label {
                label,
                absolute,
                offset,
            } => {
                let mode = if *absolute { "abs" } else { "rel" };
                if *offset == 0 {
                    write!(f, "{}:L{}", mode, label.id())
                } else {
                    write!(f, "{}:L{}{:+}", mode, label.id(), offset)
                }
            }
        }
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Bytecode opcodes. The discriminants are the interpreter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Mov = 1,
    Movzx = 2,
    Movsx = 3,

    // arithmetic: dst = dst op src
    Add = 4,
    Sub = 5,
    Mul = 6,
    Div = 7,
    Rem = 8,
    And = 9,
    Or = 10,
    Xor = 11,
    Shl = 12,
    Shr = 13,
    Neg = 14,
    Not = 15,

    // comparison
    Cmp = 16,
    Sete = 17,
    Setne = 18,
    Setl = 19,
    Setle = 20,
    Setg = 21,
    Setge = 22,

    // control flow, relative displacements
    Jmp = 23,
    Je = 24,
    Jne = 25,
    Jl = 26,
    Jle = 27,
    Jg = 28,
    Jge = 29,

    // operand stack
    Push = 30,
    Pop = 31,

    // calls
    Call = 32,
    CallIndirect = 33,
    Ret = 34,

    Crash = 35,
    Exit = 36,

    // unsigned variants
    Divu = 37,
    Remu = 38,
    Shru = 39,
    Cmpu = 40,
}

impl Opcode {
    pub const ALL: [Opcode; 41] = [
        Opcode::Nop,
        Opcode::Mov,
        Opcode::Movzx,
        Opcode::Movsx,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Rem,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Neg,
        Opcode::Not,
        Opcode::Cmp,
        Opcode::Sete,
        Opcode::Setne,
        Opcode::Setl,
        Opcode::Setle,
        Opcode::Setg,
        Opcode::Setge,
        Opcode::Jmp,
        Opcode::Je,
        Opcode::Jne,
        Opcode::Jl,
        Opcode::Jle,
        Opcode::Jg,
        Opcode::Jge,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Call,
        Opcode::CallIndirect,
        Opcode::Ret,
        Opcode::Crash,
        Opcode::Exit,
        Opcode::Divu,
        Opcode::Remu,
        Opcode::Shru,
        Opcode::Cmpu,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Opcode> {
        Opcode::ALL.get(code as usize).copied()
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Mov => "mov",
            Opcode::Movzx => "movzx",
            Opcode::Movsx => "movsx",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Cmp => "cmp",
            Opcode::Sete => "sete",
            Opcode::Setne => "setne",
            Opcode::Setl => "setl",
            Opcode::Setle => "setle",
            Opcode::Setg => "setg",
            Opcode::Setge => "setge",
            Opcode::Jmp => "jmp",
            Opcode::Je => "je",
            Opcode::Jne => "jne",
            Opcode::Jl => "jl",
            Opcode::Jle => "jle",
            Opcode::Jg => "jg",
            Opcode::Jge => "jge",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Call => "call",
            Opcode::CallIndirect => "calli",
            Opcode::Ret => "ret",
            Opcode::Crash => "crash",
            Opcode::Exit => "exit",
            Opcode::Divu => "divu",
            Opcode::Remu => "remu",
            Opcode::Shru => "shru",
            Opcode::Cmpu => "cmpu",
        }
    }

    /// Whether the instruction transfers control to a relative label.
    pub fn is_relative_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Je
                | Opcode::Jne
                | Opcode::Jl
                | Opcode::Jle
                | Opcode::Jg
                | Opcode::Jge
                | Opcode::Call
        )
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::Je | Opcode::Jne | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge
        )
    }

    /// Whether execution never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Ret | Opcode::Crash | Opcode::Exit)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Trap codes raised by `crash`.
pub mod trap {
    pub const NULL_POINTER: i64 = 1;
}

// =============================================================================
// Instructions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operands {
    None,
    One(Operand),
    Two(Operand, Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
    /// Source position current when the instruction was emitted.
    pub span: Span,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operands: Operands::None,
            span: Span::default(),
        }
    }

    pub fn unary(opcode: Opcode, a: Operand) -> Self {
        Self {
            opcode,
            operands: Operands::One(a),
            span: Span::default(),
        }
    }

    pub fn binary(opcode: Opcode, a: Operand, b: Operand) -> Self {
        Self {
            opcode,
            operands: Operands::Two(a, b),
            span: Span::default(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// First operand (destination for two-operand forms).
    pub fn a(&self) -> Option<&Operand> {
        match &self.operands {
            Operands::None => None,
            Operands::One(a) | Operands::Two(a, _) => Some(a),
        }
    }

    /// Second operand (source for two-operand forms).
    pub fn b(&self) -> Option<&Operand> {
        match &self.operands {
            Operands::Two(_, b) => Some(b),
            _ => None,
        }
    }

    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        let (a, b) = match &mut self.operands {
            Operands::None => (None, None),
            Operands::One(a) => (Some(a), None),
            Operands::Two(a, b) => (Some(a), Some(b)),
        };
        a.into_iter().chain(b)
    }

    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.a()
            .into_iter()
            .chain(self.b())
            .filter_map(|operand| operand.label())
    }

    pub fn has_label_operand(&self) -> bool {
        self.labels().next().is_some()
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.operands {
            Operands::None => write!(f, "{}", self.opcode),
            Operands::One(a) => write!(f, "{:<7} {}", self.opcode.mnemonic(), a),
            Operands::Two(a, b) => write!(f, "{:<7} {}, {}", self.opcode.mnemonic(), a, b),
        }
    }
}
