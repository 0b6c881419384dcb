pub mod assembler;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod label;
pub mod linker;
pub mod op;
pub mod peephole;
pub mod regalloc;
pub mod stack_check;

pub use compile::{Compiled, compile};
pub use compile_error::{CompileError, Diagnostic, Diagnostics};
pub use ir::CompiledProgram;
pub use op::{Instruction, Opcode, Operand};
