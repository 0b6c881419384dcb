use std::collections::BTreeSet;
use std::fmt::Write;

use crate::bytecode::ir::{CompiledProgram, FunctionRange};
use crate::bytecode::op::{Instruction, Opcode, Operand, Operands};

/// Print disassembly of a linked program.
pub fn print_program(program: &CompiledProgram) {
    print!("{}", disassemble(program));
}

/// Render a linked program, one section per function when debug info is
/// present.
pub fn disassemble(program: &CompiledProgram) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== BYTECODE PROGRAM ===");
    let _ = writeln!(
        out,
        "entry {:04}, {} byte(s) of globals\n",
        program.entry, program.globals_size
    );

    let targets = collect_jump_targets(&program.instructions);
    let sections = match &program.debug {
        Some(debug) if !debug.functions.is_empty() => {
            let mut functions = debug.functions.clone();
            functions.sort_by_key(|f| f.start);
            functions
        }
        _ => vec![FunctionRange {
            name: "code".to_string(),
            start: 0,
            end: program.instructions.len(),
        }],
    };

    for section in &sections {
        let _ = writeln!(out, "════════════════════════════════════════");
        let _ = writeln!(out, " {}", section.name);
        let _ = writeln!(out, " {} instructions", section.end - section.start);
        let _ = writeln!(out, "════════════════════════════════════════");
        for ip in section.start..section.end.min(program.instructions.len()) {
            write_instruction(&mut out, &program.instructions[ip], ip, &targets);
        }
        let _ = writeln!(out);
    }
    out
}

fn collect_jump_targets(code: &[Instruction]) -> BTreeSet<usize> {
    code.iter()
        .enumerate()
        .filter_map(|(ip, ins)| jump_target(ins, ip))
        .collect()
}

fn jump_target(ins: &Instruction, ip: usize) -> Option<usize> {
    if !ins.opcode.is_relative_jump() || ins.opcode == Opcode::Call {
        return None;
    }
    match ins.operands {
        Operands::One(Operand::Imm { value, .. }) => Some((ip as i64 + value) as usize),
        _ => None,
    }
}

fn write_instruction(out: &mut String, ins: &Instruction, ip: usize, targets: &BTreeSet<usize>) {
    let target = targets.contains(&ip);
    if target {
        let _ = writeln!(out, "      ┌──────────────────────────────────");
    }
    let marker = if target { "► " } else { "  " };

    match (ins.opcode.is_relative_jump(), &ins.operands) {
        (true, Operands::One(Operand::Imm { value, .. })) => {
            let destination = (ip as i64 + value) as usize;
            let direction = if *value < 0 { "↑" } else { "↓" };
            let _ = writeln!(
                out,
                "{:04} {}{:<7} {:+} {} (→ {:04})",
                ip,
                marker,
                ins.opcode.mnemonic(),
                value,
                direction,
                destination
            );
        }
        _ => {
            let _ = writeln!(out, "{:04} {}{}", ip, marker, ins);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{Reg, Width};

    fn program(instructions: Vec<Instruction>) -> CompiledProgram {
        CompiledProgram {
            instructions,
            globals_size: 8,
            entry: 0,
            debug: None,
        }
    }

    #[test]
    fn test_jump_rendering() {
        let code = vec![
            Instruction::unary(Opcode::Jmp, Operand::imm(Width::W32, 2)),
            Instruction::new(Opcode::Nop),
            Instruction::new(Opcode::Exit),
        ];
        let text = disassemble(&program(code));
        assert!(text.contains("jmp     +2 ↓ (→ 0002)"));
        assert!(text.contains("0002 ► exit"));
    }

    #[test]
    fn test_backward_jump_arrow() {
        let code = vec![
            Instruction::new(Opcode::Nop),
            Instruction::unary(Opcode::Jne, Operand::imm(Width::W32, -1)),
        ];
        let text = disassemble(&program(code));
        assert!(text.contains("-1 ↑ (→ 0000)"));
    }

    #[test]
    fn test_call_target_not_marked() {
        let code = vec![
            Instruction::unary(Opcode::Call, Operand::imm(Width::W32, 1)),
            Instruction::new(Opcode::Ret),
        ];
        let text = disassemble(&program(code));
        assert!(!text.contains('►'));
        assert!(text.contains("call    +1 ↓ (→ 0001)"));
    }

    #[test]
    fn test_plain_instruction() {
        let code = vec![Instruction::binary(
            Opcode::Mov,
            Operand::reg64(Reg::Fp),
            Operand::reg64(Reg::Sp),
        )];
        let text = disassemble(&program(code));
        assert!(text.contains("0000   mov     fp, sp"));
        assert!(text.contains(" code"));
    }
}
