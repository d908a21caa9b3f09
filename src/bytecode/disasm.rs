use std::collections::{BTreeSet, HashMap};

use crate::bytecode::code::{Insn, Operand};
use crate::bytecode::ir::{BytecodeFunction, ProgramBc};

/// Print disassembly of every function in a program.
pub fn print_program(program: &ProgramBc) {
    print!("{}", disassemble_program(program));
}

/// Disassembly of every function in id order, as a String.
pub fn disassemble_program(program: &ProgramBc) -> String {
    let mut out = String::from("=== BYTECODE PROGRAM ===\n\n");
    for function in &program.functions {
        out.push_str(&disassemble_function(program, function));
        out.push('\n');
    }
    out
}

/// One function: a header with its signature and frame size, then one line
/// per instruction. Branch targets are marked with `►`.
pub fn disassemble_function(program: &ProgramBc, function: &BytecodeFunction) -> String {
    let mut out = String::new();
    let params: Vec<&str> = function.params.iter().map(|t| t.name()).collect();

    out.push_str("════════════════════════════════════════\n");
    out.push_str(&format!(
        " [{}] {} {}({})\n",
        function.id,
        function.return_type,
        function.name,
        params.join(", ")
    ));
    out.push_str(&format!(
        " {} bytes, {} locals, body scope {}\n",
        function.code.len(),
        function.locals,
        function.scope
    ));
    out.push_str("════════════════════════════════════════\n");

    let insns = match function.code.instructions() {
        Ok(insns) => insns,
        Err(e) => {
            out.push_str(&format!("  <undecodable: {}>\n", e));
            return out;
        }
    };
    let targets = collect_jump_targets(&insns);

    for insn in &insns {
        if targets.contains(&insn.offset) {
            out.push_str("      ┌──────────────────────────────────\n");
        }
        let marker = if targets.contains(&insn.offset) { "► " } else { "  " };
        out.push_str(&format!("{:04} {}{}\n", insn.offset, marker, format_insn(program, insn)));
    }
    out
}

fn collect_jump_targets(insns: &[Insn]) -> BTreeSet<usize> {
    insns
        .iter()
        .filter_map(|insn| match insn.operand {
            Operand::Target(target) => Some(target),
            _ => None,
        })
        .collect()
}

fn format_insn(program: &ProgramBc, insn: &Insn) -> String {
    let name = insn.op.mnemonic();
    match insn.operand {
        Operand::None => name.to_string(),
        Operand::Int(n) => format!("{:<12}{}", name, n),
        Operand::Double(d) => format!("{:<12}{:?}", name, d),
        Operand::Str(id) => match program.strings.get(id) {
            Some(s) => format!("{:<12}@{} {:?}", name, id, s),
            None => format!("{:<12}@{} <missing>", name, id),
        },
        Operand::Var { scope, slot } => format!("{:<12}{}:{}", name, scope, slot),
        Operand::Target(target) => {
            let arrow = if target <= insn.offset { "↑" } else { "↓" };
            format!("{:<12}{} {:04}", name, arrow, target)
        }
        Operand::Function(id) => match program.function(id) {
            Some(f) => format!("{:<12}{} ; {}", name, id, f.name),
            None => format!("{:<12}{} ; <unknown>", name, id),
        },
        Operand::Native(id) => match program.native(id) {
            Some(n) => format!("{:<12}{} ; {}", name, id, n.symbol),
            None => format!("{:<12}{} ; <unknown>", name, id),
        },
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print instruction counts and the most frequent opcodes.
pub fn print_program_stats(program: &ProgramBc) {
    println!("=== BYTECODE STATISTICS ===\n");

    let counts = op_counts(program);
    let total: usize = counts.values().sum();
    let bytes: usize = program.functions.iter().map(|f| f.code.len()).sum();

    println!("Functions:        {}", program.functions.len());
    println!("Natives:          {}", program.natives.len());
    println!("String constants: {}", program.strings.len());
    println!("Instructions:     {}", total);
    println!("Bytes:            {}", bytes);
    println!();

    println!("Op frequency:");
    let mut sorted: Vec<_> = counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (op, count) in sorted.iter().take(10) {
        let pct = (**count as f64 / total.max(1) as f64) * 100.0;
        println!("  {:<14} {:>4} ({:>5.1}%)", op, count, pct);
    }
}

fn op_counts(program: &ProgramBc) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for function in &program.functions {
        for insn in function.code.instructions().unwrap_or_default() {
            *counts.entry(insn.op.mnemonic()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::CodeBuilder;
    use crate::bytecode::compile::Compiler;
    use crate::bytecode::op::Op;
    use crate::lang::build::*;
    use crate::lang::program::Program;
    use crate::lang::types::VarType;

    fn sample() -> ProgramBc {
        let mut program = Program::new();
        let top = program.top_scope();
        program.declare_var(top, "i", VarType::Integer);
        let body = program.add_scope(top);
        program.define_top(vec![
            print(vec![string("count: ")]),
            for_loop("i", range(int(1), int(3)), block(body, vec![print(vec![load("i")])])),
        ]);
        Compiler::new().compile_program(&program).unwrap()
    }

    #[test]
    fn test_disassembly_shows_strings_and_targets() {
        let program = sample();
        let text = disassemble_function(&program, program.top().unwrap());
        assert!(text.contains("<top>"));
        assert!(text.contains("SLOAD"));
        assert!(text.contains("\"count: \""));
        assert!(text.contains("►"));
        assert!(text.contains("IFICMPG"));
        assert!(text.contains("↑"));
    }

    #[test]
    fn test_program_listing_covers_every_function() {
        let mut program = Program::new();
        let top = program.top_scope();
        let body = program.declare_function(top, "one", VarType::Integer, &[]);
        program.define(body, vec![ret(Some(int(1)))]);
        program.define_top(vec![print(vec![call("one", vec![])])]);
        let compiled = Compiler::new().compile_program(&program).unwrap();

        let text = disassemble_program(&compiled);
        assert!(text.contains("int one()"));
        assert!(text.contains("CALL        1 ; one"));
    }

    #[test]
    fn test_op_counts() {
        let counts = op_counts(&sample());
        assert_eq!(counts.get("STOP"), Some(&1));
        assert_eq!(counts.get("IADD"), Some(&1));
        assert_eq!(counts.get("SPRINT"), Some(&1));
    }

    #[test]
    fn test_empty_function_keeps_header() {
        let mut program = sample();
        if let Some(f) = program.function_mut(0) {
            f.code = Default::default();
        }
        let text = disassemble_function(&program, program.function(0).unwrap());
        assert!(text.contains("0 bytes"));
    }

    #[test]
    fn test_listing_is_line_per_item() {
        let mut program = sample();
        let text = disassemble_function(&program, program.top().unwrap());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], " [0] void <top>()");
        assert!(lines[2].ends_with("locals, body scope 1"));
        assert!(lines[4].starts_with("0000 "));

        let mut truncated = CodeBuilder::new();
        truncated.add_op(Op::ILoad);
        if let Some(f) = program.function_mut(0) {
            f.code = truncated.finish().unwrap();
        }
        let text = disassemble_function(&program, program.function(0).unwrap());
        assert!(text.ends_with(">\n"));
        assert!(text.lines().last().unwrap().starts_with("  <undecodable: "));
    }
}
