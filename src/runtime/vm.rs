use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::bytecode::ir::CompiledProgram;
use crate::bytecode::op::{GENERAL_REGISTERS, Instruction, Opcode, Operand, Operands, Reg, Width};
use crate::runtime::runtime_error::RuntimeError;

/// Size of the register file: general registers plus `sp`, `fp`, `gb`.
const REGISTERS: usize = GENERAL_REGISTERS + 3;

/// Interpreter limits.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Bytes of flat memory; globals at the bottom, the stack above them.
    pub memory_size: usize,
    /// Stop after this many executed instructions.
    pub max_steps: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: 1 << 20,
            max_steps: None,
        }
    }
}

/// Reference interpreter for linked bytecode.
///
/// Memory is one little-endian byte array. `sp` starts right above the
/// globals and grows upward; `gb` starts at zero.
pub struct Vm {
    code: Vec<Instruction>,
    regs: [u64; REGISTERS],
    flags: Option<Ordering>,
    memory: Vec<u8>,
    ip: usize,
    steps: usize,
    config: VmConfig,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            code: Vec::new(),
            regs: [0; REGISTERS],
            flags: None,
            memory: vec![0; config.memory_size],
            ip: 0,
            steps: 0,
            config,
        }
    }

    /// Reset the machine and load `code`, starting at offset zero.
    pub fn load(&mut self, code: &[Instruction], globals_size: u64) {
        self.code = code.to_vec();
        self.regs = [0; REGISTERS];
        self.regs[Reg::Sp.index()] = globals_size;
        self.flags = None;
        self.memory.iter_mut().for_each(|b| *b = 0);
        self.ip = 0;
        self.steps = 0;
    }

    /// Load and run a linked program from its entry point.
    pub fn run_program(&mut self, program: &CompiledProgram) -> Result<i64, RuntimeError> {
        self.load(&program.instructions, program.globals_size);
        self.ip = program.entry;
        let result = self.run();
        if let Err(err) = &result {
            let function = err.at().and_then(|at| program.function_at(at));
            debug!(error = %err, function = function.unwrap_or("?"), "execution failed");
        }
        result
    }

    /// Execute until `exit`, returning the exit code stored in the first
    /// global slot.
    pub fn run(&mut self) -> Result<i64, RuntimeError> {
        loop {
            self.check_limits()?;
            let at = self.ip;
            let ins = match self.code.get(at) {
                Some(ins) => *ins,
                None => {
                    return Err(RuntimeError::BadJump {
                        target: at as i64,
                        at: at.saturating_sub(1),
                    });
                }
            };
            trace!(ip = at, sp = self.regs[Reg::Sp.index()], "{}", ins);

            if let Some(code) = self.step(&ins, at)? {
                debug!(code, steps = self.steps, "program exited");
                return Ok(code);
            }
        }
    }

    /// Registers, flags and the live part of memory (below `sp`).
    pub fn snapshot(&self) -> (Vec<u64>, Option<Ordering>, Vec<u8>) {
        let sp = (self.regs[Reg::Sp.index()] as usize).min(self.memory.len());
        (self.regs.to_vec(), self.flags, self.memory[..sp].to_vec())
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        match self.config.max_steps {
            Some(limit) if self.steps > limit => Err(RuntimeError::StepLimit { limit }),
            _ => Ok(()),
        }
    }

    /// Execute one instruction. Returns the exit code on `exit`.
    fn step(&mut self, ins: &Instruction, at: usize) -> Result<Option<i64>, RuntimeError> {
        let invalid = || RuntimeError::InvalidOperand {
            ins: ins.to_string(),
            at,
        };
        let mut next = at as i64 + 1;

        match (ins.opcode, &ins.operands) {
            (Opcode::Nop, _) => {}

            (Opcode::Mov, Operands::Two(a, b)) => {
                let value = self.read(b, at)?;
                self.write(a, value, at)?;
            }
            (Opcode::Movzx, Operands::Two(a, b)) => {
                let value = self.read(b, at)?;
                self.write(a, value, at)?;
            }
            (Opcode::Movsx, Operands::Two(a, b)) => {
                let value = b.width().sign_extend(self.read(b, at)?);
                self.write(a, value as u64, at)?;
            }

            (
                op @ (Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl),
                Operands::Two(a, b),
            ) => {
                let lhs = self.read(a, at)?;
                let rhs = self.read(b, at)?;
                let value = match op {
                    Opcode::Add => lhs.wrapping_add(rhs),
                    Opcode::Sub => lhs.wrapping_sub(rhs),
                    Opcode::Mul => lhs.wrapping_mul(rhs),
                    Opcode::And => lhs & rhs,
                    Opcode::Or => lhs | rhs,
                    Opcode::Xor => lhs ^ rhs,
                    _ => lhs.checked_shl(rhs as u32).unwrap_or(0),
                };
                self.write(a, value, at)?;
            }
            (op @ (Opcode::Div | Opcode::Rem | Opcode::Shr), Operands::Two(a, b)) => {
                let lhs = a.width().sign_extend(self.read(a, at)?);
                let rhs = b.width().sign_extend(self.read(b, at)?);
                let value = match op {
                    Opcode::Shr => lhs >> rhs.clamp(0, 63),
                    _ if rhs == 0 => return Err(RuntimeError::DivisionByZero { at }),
                    Opcode::Div => lhs.wrapping_div(rhs),
                    _ => lhs.wrapping_rem(rhs),
                };
                self.write(a, value as u64, at)?;
            }
            (op @ (Opcode::Divu | Opcode::Remu | Opcode::Shru), Operands::Two(a, b)) => {
                let lhs = self.read(a, at)?;
                let rhs = self.read(b, at)?;
                let value = match op {
                    Opcode::Shru => lhs.checked_shr(rhs.min(64) as u32).unwrap_or(0),
                    _ if rhs == 0 => return Err(RuntimeError::DivisionByZero { at }),
                    Opcode::Divu => lhs / rhs,
                    _ => lhs % rhs,
                };
                self.write(a, value, at)?;
            }
            (Opcode::Neg, Operands::One(a)) => {
                let value = self.read(a, at)?.wrapping_neg();
                self.write(a, value, at)?;
            }
            (Opcode::Not, Operands::One(a)) => {
                let value = !self.read(a, at)?;
                self.write(a, value, at)?;
            }

            (Opcode::Cmp, Operands::Two(a, b)) => {
                let lhs = a.width().sign_extend(self.read(a, at)?);
                let rhs = b.width().sign_extend(self.read(b, at)?);
                self.flags = Some(lhs.cmp(&rhs));
            }
            (Opcode::Cmpu, Operands::Two(a, b)) => {
                let lhs = self.read(a, at)?;
                let rhs = self.read(b, at)?;
                self.flags = Some(lhs.cmp(&rhs));
            }
            (
                op @ (Opcode::Sete
                | Opcode::Setne
                | Opcode::Setl
                | Opcode::Setle
                | Opcode::Setg
                | Opcode::Setge),
                Operands::One(a),
            ) => {
                let holds = self.condition(op, at)?;
                self.write(a, u64::from(holds), at)?;
            }

            (Opcode::Jmp, Operands::One(a)) => {
                next = at as i64 + self.displacement(a, at)?;
            }
            (op, Operands::One(a)) if op.is_conditional_jump() => {
                if self.condition(op, at)? {
                    next = at as i64 + self.displacement(a, at)?;
                }
            }

            (Opcode::Push, Operands::One(a)) => {
                let value = self.read(a, at)?;
                self.push(value, a.width(), at)?;
            }
            (Opcode::Pop, Operands::One(a)) => {
                let value = self.pop(a.width(), at)?;
                self.write(a, value, at)?;
            }

            (Opcode::Call, Operands::One(a)) => {
                let displacement = self.displacement(a, at)?;
                self.push(at as u64 + 1, Width::W64, at)?;
                next = at as i64 + displacement;
            }
            (Opcode::CallIndirect, Operands::One(a)) => {
                let target = self.read(a, at)?;
                self.push(at as u64 + 1, Width::W64, at)?;
                next = target as i64;
            }
            (Opcode::Ret, Operands::None) => {
                let ra = self.pop(Width::W64, at)?;
                self.regs[Reg::Fp.index()] = self.pop(Width::W64, at)?;
                self.regs[Reg::Gb.index()] = self.pop(Width::W64, at)?;
                next = ra as i64;
            }

            (Opcode::Crash, Operands::One(a)) => {
                let code = a.width().sign_extend(self.read(a, at)?);
                return Err(RuntimeError::Trap { code, at });
            }
            (Opcode::Exit, Operands::None) => {
                let code = self.load_mem(0, Width::W64, at)?;
                return Ok(Some(code as i64));
            }

            _ => return Err(invalid()),
        }

        if next < 0 || next as usize >= self.code.len() {
            return Err(RuntimeError::BadJump { target: next, at });
        }
        self.ip = next as usize;
        Ok(None)
    }

    fn condition(&self, op: Opcode, at: usize) -> Result<bool, RuntimeError> {
        let flags = self.flags.ok_or(RuntimeError::FlagsUnset { at })?;
        Ok(match op {
            Opcode::Je | Opcode::Sete => flags == Ordering::Equal,
            Opcode::Jne | Opcode::Setne => flags != Ordering::Equal,
            Opcode::Jl | Opcode::Setl => flags == Ordering::Less,
            Opcode::Jle | Opcode::Setle => flags != Ordering::Greater,
            Opcode::Jg | Opcode::Setg => flags == Ordering::Greater,
            _ => flags != Ordering::Less,
        })
    }

    fn displacement(&self, operand: &Operand, at: usize) -> Result<i64, RuntimeError> {
        match operand {
            Operand::Imm { value, .. } => Ok(*value),
            Operand::Label { .. } => Err(RuntimeError::UnresolvedLabel { at }),
            _ => Err(RuntimeError::InvalidOperand {
                ins: operand.to_string(),
                at,
            }),
        }
    }

    // =========================================================================
    // Operands
    // =========================================================================

    /// Read an operand, zero-extended to 64 bits.
    fn read(&self, operand: &Operand, at: usize) -> Result<u64, RuntimeError> {
        match *operand {
            Operand::Imm { width, value } => Ok(value as u64 & width.mask()),
            Operand::Reg { reg, slice } => {
                Ok((self.regs[reg.index()] >> slice.shift()) & slice.width().mask())
            }
            Operand::Mem {
                base,
                offset,
                width,
            } => {
                let address = self.effective(base, offset);
                self.load_mem(address, width, at)
            }
            Operand::Label { .. } => Err(RuntimeError::UnresolvedLabel { at }),
        }
    }

    /// Write the low bits of `value` into an operand. Register slices
    /// leave the rest of the register untouched.
    fn write(&mut self, operand: &Operand, value: u64, at: usize) -> Result<(), RuntimeError> {
        match *operand {
            Operand::Reg { reg, slice } => {
                let mask = slice.width().mask() << slice.shift();
                let slot = &mut self.regs[reg.index()];
                *slot = (*slot & !mask) | ((value << slice.shift()) & mask);
                Ok(())
            }
            Operand::Mem {
                base,
                offset,
                width,
            } => {
                let address = self.effective(base, offset);
                self.store_mem(address, value, width, at)
            }
            Operand::Imm { .. } => Err(RuntimeError::InvalidOperand {
                ins: operand.to_string(),
                at,
            }),
            Operand::Label { .. } => Err(RuntimeError::UnresolvedLabel { at }),
        }
    }

    fn effective(&self, base: Reg, offset: i32) -> i64 {
        (self.regs[base.index()] as i64).wrapping_add(i64::from(offset))
    }

    fn bounds(&self, address: i64, width: Width, at: usize) -> Result<usize, RuntimeError> {
        let end = address.checked_add(width.bytes() as i64);
        match end {
            Some(end) if address >= 0 && end as usize <= self.memory.len() => Ok(address as usize),
            _ => Err(RuntimeError::OutOfBounds { address, at }),
        }
    }

    fn load_mem(&self, address: i64, width: Width, at: usize) -> Result<u64, RuntimeError> {
        let start = self.bounds(address, width, at)?;
        let mut bytes = [0u8; 8];
        let len = width.bytes() as usize;
        bytes[..len].copy_from_slice(&self.memory[start..start + len]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn store_mem(&mut self, address: i64, value: u64, width: Width, at: usize) -> Result<(), RuntimeError> {
        let start = self.bounds(address, width, at)?;
        let len = width.bytes() as usize;
        self.memory[start..start + len].copy_from_slice(&value.to_le_bytes()[..len]);
        Ok(())
    }

    // =========================================================================
    // Stack
    // =========================================================================

    fn push(&mut self, value: u64, width: Width, at: usize) -> Result<(), RuntimeError> {
        let sp = self.regs[Reg::Sp.index()];
        if sp + width.bytes() > self.memory.len() as u64 {
            return Err(RuntimeError::StackOverflow { at });
        }
        self.store_mem(sp as i64, value, width, at)?;
        self.regs[Reg::Sp.index()] = sp + width.bytes();
        Ok(())
    }

    fn pop(&mut self, width: Width, at: usize) -> Result<u64, RuntimeError> {
        let sp = self.regs[Reg::Sp.index()];
        if sp < width.bytes() {
            return Err(RuntimeError::StackUnderflow { at });
        }
        let sp = sp - width.bytes();
        self.regs[Reg::Sp.index()] = sp;
        self.load_mem(sp as i64, width, at)
    }
}
