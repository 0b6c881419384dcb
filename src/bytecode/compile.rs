//! Code generation from the resolved IR.
//!
//! The [`Generator`] walks the top-level statements first, then every
//! function reachable from them through the [`Linker`] work-list. Values
//! travel on the operand stack; registers only live inside a single
//! expression step and are never held across a call.

mod call;
mod expr;
mod memory;
mod scope;
mod stmt;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::bytecode::assembler::{Assembled, Assembler};
use crate::bytecode::compile_error::{CompileError, Diagnostic, Diagnostics, Severity};
use crate::bytecode::ir::CompiledProgram;
use crate::bytecode::label::Label;
use crate::bytecode::linker::{Linker, UndefinedOffset};
use crate::bytecode::op::{Opcode, Operand, Reg, Width};
use crate::bytecode::regalloc::RegisterFile;
use crate::config::CodegenConfig;
use crate::lang::node::{Span, Stmt};
use crate::lang::program::{FunctionDef, FunctionId, LocalId, POINTER_SIZE, Program};
use crate::lang::types::Type;

pub use memory::Address;
use scope::{DebugBuilder, Scope};

/// Bytes between `fp` and the first parameter: saved `fp` and saved `gb`.
const FRAME_TAGS: i64 = 16;

/// Offset of the first local from `fp`; `[fp]` holds the return address.
const LOCALS_BASE: i64 = POINTER_SIZE as i64;

/// Successful compilation: the linked program plus any warnings.
#[derive(Debug)]
pub struct Compiled {
    pub program: CompiledProgram,
    pub warnings: Vec<Diagnostic>,
}

/// Compile `program` and every function reachable from its top level.
pub fn compile(program: &Program, config: CodegenConfig) -> Result<Compiled, Diagnostics> {
    let mut generator = Generator::new(program, config);
    generator.compile_main();
    generator.link_all();
    generator.finish()
}

// =============================================================================
// Per-function state
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ParamSlot {
    /// Offset from `fp`.
    offset: i64,
    by_ref: bool,
}

#[derive(Debug, Clone)]
struct ReturnSlot {
    offset: i64,
    size: u64,
    ty: Type,
}

struct FunctionContext {
    /// `None` for the top level.
    id: Option<FunctionId>,
    name: String,
    params: Vec<ParamSlot>,
    ret: Option<ReturnSlot>,
    /// Top level: `return` writes the exit-code slot.
    is_main: bool,
    /// Local offsets from the locals base.
    locals: HashMap<LocalId, u64>,
    /// Bytes of locals currently on the stack.
    frame_size: u64,
    /// Index of the function scope in the scope stack.
    scope_base: usize,
    warned: bool,
}

impl FunctionContext {
    fn main() -> Self {
        Self {
            id: None,
            name: "main".to_string(),
            params: Vec::new(),
            ret: None,
            is_main: true,
            locals: HashMap::new(),
            frame_size: 0,
            scope_base: 0,
            warned: false,
        }
    }

    fn new(program: &Program, id: FunctionId, def: &FunctionDef) -> Self {
        let sizes: Vec<u64> = def.params.iter().map(|p| program.param_size(p)).collect();
        let total: u64 = sizes.iter().sum();

        let mut suffix = total;
        let params = def
            .params
            .iter()
            .zip(&sizes)
            .map(|(param, size)| {
                let slot = ParamSlot {
                    offset: -FRAME_TAGS - suffix as i64,
                    by_ref: param.by_ref,
                };
                suffix -= size;
                slot
            })
            .collect();

        let ret_size = program.size_of(&def.ret);
        let ret = (ret_size > 0).then(|| ReturnSlot {
            offset: -FRAME_TAGS - (total + ret_size) as i64,
            size: ret_size,
            ty: def.ret.clone(),
        });

        Self {
            id: Some(id),
            name: def.name.clone(),
            params,
            ret,
            is_main: false,
            locals: HashMap::new(),
            frame_size: 0,
            scope_base: 0,
            warned: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Loop {
        break_label: Label,
        continue_label: Label,
        /// Scope depth at loop entry; exits clean up everything above it.
        scope_depth: usize,
    },
    Function {
        return_label: Label,
    },
}

#[derive(Debug, Clone, Copy)]
struct ControlFrame {
    kind: FrameKind,
    /// Control left this frame unconditionally; the rest of it is dead.
    skipping: bool,
}

// =============================================================================
// Generator
// =============================================================================

pub struct Generator<'p> {
    program: &'p Program,
    config: CodegenConfig,
    asm: Assembler,
    regs: RegisterFile,
    linker: Linker,
    scopes: Vec<Scope>,
    frames: Vec<ControlFrame>,
    function: Option<FunctionContext>,
    diagnostics: Vec<Diagnostic>,
    debug: DebugBuilder,
    entry: Option<Label>,
}

impl<'p> Generator<'p> {
    pub fn new(program: &'p Program, config: CodegenConfig) -> Self {
        Self {
            program,
            asm: Assembler::new(config.optimize),
            config,
            regs: RegisterFile::new(),
            linker: Linker::new(),
            scopes: Vec::new(),
            frames: Vec::new(),
            function: None,
            diagnostics: Vec::new(),
            debug: DebugBuilder::default(),
            entry: None,
        }
    }

    pub fn assembler(&self) -> &Assembler {
        &self.asm
    }

    /// Calls and function references not linked yet.
    pub fn pending(&self) -> &[UndefinedOffset] {
        self.linker.pending()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Emit the top level: global initializers, then the top-level
    /// statements, then `exit`.
    pub fn compile_main(&mut self) {
        debug!("compiling top level");
        let program = self.program;

        let entry = self.asm.mark_label();
        self.entry = Some(entry);
        self.asm
            .emit2(Opcode::Mov, Operand::reg64(Reg::Fp), Operand::reg64(Reg::Sp));
        // placeholder return address so locals start at fp+8 as in any frame
        self.asm.push_imm(Width::W64, 0);

        self.begin_function(FunctionContext::main());
        for (index, global) in program.globals.iter().enumerate() {
            if let Some(init) = &global.init {
                self.asm.set_span(global.var.span);
                self.init_global(index, init);
            }
        }
        self.compile_stmts(&program.main);
        self.end_function(Opcode::Exit, entry);
    }

    /// Emit every function that is referenced but not emitted yet.
    pub fn link_all(&mut self) {
        while let Some(function) = self.linker.next_unresolved() {
            self.compile_function(function);
        }
    }

    fn compile_function(&mut self, id: FunctionId) {
        let program = self.program;
        let def = program.function(id).unwrap_or_else(|| {
            panic!("internal error: reference to undefined function #{}", id.0)
        });
        assert!(
            !self.linker.is_defined(id),
            "internal error: function '{}' emitted twice",
            def.name
        );
        debug!(name = %def.name, id = id.0, "compiling function");

        self.asm.set_span(def.span);
        let entry = self.asm.mark_label();
        self.linker.define(&mut self.asm, id, entry);

        self.begin_function(FunctionContext::new(program, id, def));
        self.compile_stmts(&def.body);
        self.end_function(Opcode::Ret, entry);
    }

    fn begin_function(&mut self, mut ctx: FunctionContext) {
        let return_label = self.asm.define_label();
        self.frames = vec![ControlFrame {
            kind: FrameKind::Function { return_label },
            skipping: false,
        }];
        ctx.scope_base = self.scopes.len();
        self.function = Some(ctx);
        self.enter_scope();
        self.describe_params();
    }

    fn end_function(&mut self, terminator: Opcode, entry: Label) {
        self.exit_scope();

        let return_label = match self.frames.first() {
            Some(ControlFrame {
                kind: FrameKind::Function { return_label },
                ..
            }) => *return_label,
            _ => panic!("internal error: function frame missing"),
        };
        self.place_label(return_label);
        self.asm.emit0(terminator);

        let end = self.asm.anchor();
        let name = self.ctx().name.clone();
        self.debug.add_function(name, entry, end);

        self.frames.clear();
        self.function = None;
    }

    /// Resolve labels and package the program.
    ///
    /// # Panics
    ///
    /// Panics if a referenced function was never emitted.
    pub fn finish(self) -> Result<Compiled, Diagnostics> {
        let pending = self.linker.pending().len();
        assert!(
            pending == 0,
            "internal error: {} unresolved function reference(s)",
            pending
        );

        let Assembled {
            instructions,
            labels,
        } = self.asm.finish();

        if self.diagnostics.iter().any(Diagnostic::is_error) {
            return Err(Diagnostics(self.diagnostics));
        }

        let entry = self.entry.map(|label| labels.resolve(label)).unwrap_or(0);
        let debug = self
            .config
            .debug_info
            .then(|| self.debug.build(&labels, &instructions));

        debug!(
            instructions = instructions.len(),
            warnings = self.diagnostics.len(),
            "compilation finished"
        );
        Ok(Compiled {
            program: CompiledProgram {
                instructions,
                globals_size: self.program.globals_size(),
                entry,
                debug,
            },
            warnings: self.diagnostics,
        })
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    fn ctx(&self) -> &FunctionContext {
        self.function
            .as_ref()
            .unwrap_or_else(|| panic!("internal error: no function being compiled"))
    }

    fn ctx_mut(&mut self) -> &mut FunctionContext {
        self.function
            .as_mut()
            .unwrap_or_else(|| panic!("internal error: no function being compiled"))
    }

    fn report(&mut self, error: CompileError) {
        let diagnostic = Diagnostic::new(self.asm.span(), error);
        match diagnostic.severity {
            Severity::Error => debug!(%diagnostic, "diagnostic"),
            Severity::Warning => warn!(%diagnostic),
        }
        self.diagnostics.push(diagnostic);
    }

    fn size_of(&self, ty: &Type) -> u64 {
        self.program.size_of(ty)
    }

    /// Whether code emitted now would be unreachable.
    fn skipping(&self) -> bool {
        self.frames.iter().any(|frame| frame.skipping)
    }

    /// Bind `label` here; a referenced label makes the code after it
    /// reachable again.
    fn place_label(&mut self, label: Label) {
        self.asm.bind_label(label);
        if self.asm.is_referenced(label) {
            for frame in &mut self.frames {
                frame.skipping = false;
            }
        }
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
    }

    /// `add`/`sub` of a signed constant; nothing for zero.
    fn add_const(&mut self, dst: Operand, value: i64) {
        if value > 0 {
            self.asm.emit2(Opcode::Add, dst, Operand::imm64(value));
        } else if value < 0 {
            self.asm
                .emit2(Opcode::Sub, dst, Operand::imm64(value.wrapping_neg()));
        }
    }

    /// Move `sp` by `bytes` (positive grows the stack).
    fn adjust_sp(&mut self, bytes: i64) {
        self.add_const(Operand::reg64(Reg::Sp), bytes);
    }

    /// Largest transfer unit for `remaining` bytes.
    fn chunk_width(&self, remaining: u64) -> Width {
        [Width::W64, Width::W32, Width::W16, Width::W8]
            .into_iter()
            .find(|w| w.bytes() <= self.config.pointer_width && remaining % w.bytes() == 0)
            .unwrap_or(Width::W8)
    }

    fn push_zeros(&mut self, size: u64) {
        let mut remaining = size;
        while remaining > 0 {
            let width = self.chunk_width(remaining);
            self.asm.push_imm(width, 0);
            remaining -= width.bytes();
        }
    }

    fn span(&self) -> Span {
        self.asm.span()
    }
}
