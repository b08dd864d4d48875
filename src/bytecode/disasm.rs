use std::collections::BTreeSet;

use crate::bytecode::{Op, Program};
use crate::lang::value::Value;

/// Print disassembly of a compiled program
pub fn print_program(program: &Program) {
    println!("=== BYTECODE PROGRAM ===\n");
    for line in disassemble(program) {
        println!("{}", line);
    }
}

/// Disassembly as lines: the code segment with jump targets marked, then
/// the non-empty part of the data segment.
pub fn disassemble(program: &Program) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push("════════════════════════════════════════".to_string());
    lines.push(format!(" code: {} instructions, entry {:04}", program.code.len(), program.entry));
    lines.push("════════════════════════════════════════".to_string());

    let targets = jump_targets(&program.code.iter().map(|i| &i.op).collect::<Vec<_>>());
    for (ip, instr) in program.code.iter().enumerate() {
        let is_target = targets.contains(&ip);
        if is_target {
            lines.push("      ┌──────────────────────────────────".to_string());
        }
        let marker = if ip == program.entry {
            "» "
        } else if is_target {
            "► "
        } else {
            "  "
        };
        let mut line = format!("{:04} {}{}", ip, marker, instr.op);
        if let Some(target) = target_of(ip, &instr.op) {
            line.push_str(&format!("  ; -> {:04}", target));
        }
        line = format!("{:<48}{}", line, instr.span);
        lines.push(line);
    }

    if !program.data.is_empty() {
        lines.push(String::new());
        lines.push(format!(" data: {} slots", program.data.len()));
        for (i, value) in program.data.iter().enumerate() {
            lines.push(format!("g{:<4} {}", i, format_value(value)));
        }
    }
    lines
}

fn target_of(ip: usize, op: &Op) -> Option<usize> {
    op.jump_offset()
        .and_then(|rel| usize::try_from(ip as isize + rel).ok())
}

fn jump_targets(ops: &[&Op]) -> BTreeSet<usize> {
    ops.iter()
        .enumerate()
        .filter_map(|(ip, op)| target_of(ip, op))
        .collect()
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("{:?}", s),
        Value::Type(t) => format!("type {}", t),
        Value::Host(h) => format!("host {}", h.name()),
        other => other.to_string(),
    }
}
