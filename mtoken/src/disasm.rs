// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Disassembler for M-Token programs and simulation traces.
//!
//! Two passes: a label scan (function entries, call targets, jump targets),
//! then a formatted listing with byte offsets, raw bytes, mnemonics, and
//! block indentation. Read-only over the same loaded [`Program`] the
//! interpreter executes.

use alloc::format;
use alloc::string::String;
use core::fmt::Write as _;

use hashbrown::HashMap;

use crate::bytecode::Operands;
use crate::opcode::Opcode;
use crate::program::Program;
use crate::trace::SimResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LabelKind {
    Func,
    JumpIn,
}

fn scan_labels(program: &Program) -> HashMap<u32, LabelKind> {
    let mut labels: HashMap<u32, LabelKind> = HashMap::new();

    for (i, t) in program.tokens().iter().enumerate() {
        match (t.opcode, t.operands) {
            (Opcode::Fn, _) => {
                labels.insert(i as u32, LabelKind::Func);
            }
            (Opcode::Cl, Operands::Call { target, .. }) => {
                if let Some(callee) = program.token_at_byte(target) {
                    labels.entry(callee).or_insert(LabelKind::Func);
                }
            }
            (Opcode::Jz | Opcode::Jnz | Opcode::Jmp, Operands::Jump(off)) => {
                let target = i as i64 + 1 + i64::from(off);
                if target >= 0 && target < i64::from(program.token_count()) {
                    labels.entry(target as u32).or_insert(LabelKind::JumpIn);
                }
            }
            _ => {}
        }
    }

    labels
}

fn label_name(program: &Program, token: u32, kind: LabelKind) -> String {
    match kind {
        LabelKind::Func => {
            let offset = program.token_offset(token).unwrap_or(0);
            format!("func_{offset}")
        }
        LabelKind::JumpIn => format!("L{token}"),
    }
}

fn render_operand(program: &Program, index: u32, out: &mut String) {
    let Some(t) = program.token(index) else {
        return;
    };
    match (t.opcode, t.operands) {
        (_, Operands::Literal(v)) => {
            let _ = write!(out, " {v}");
        }
        (Opcode::Iow | Opcode::Ior, Operands::Index(dev)) => {
            let _ = write!(out, " dev={dev}");
        }
        (Opcode::Wait, Operands::Index(ms)) => {
            let _ = write!(out, " {ms}ms");
        }
        (Opcode::Trace, Operands::Index(level)) => {
            let _ = write!(out, " level={level}");
        }
        (_, Operands::Index(v)) => {
            let _ = write!(out, " {v}");
        }
        (_, Operands::Arity(arity)) => {
            let _ = write!(out, " <arity={arity}>,B<body>,E");
        }
        (_, Operands::Jump(off)) => {
            let target = index as i64 + 1 + i64::from(off);
            if target >= 0 && target < i64::from(program.token_count()) {
                let _ = write!(out, " L{target}");
            } else {
                let _ = write!(out, " <target {target} out of range>");
            }
        }
        (_, Operands::Call { target, argc }) => {
            let _ = write!(out, " func_{target}, {argc} args");
        }
        (_, Operands::None) => {}
    }
}

/// Disassembles `program` into a readable listing.
#[must_use]
pub fn disassemble(program: &Program) -> String {
    let labels = scan_labels(program);
    let mut out = String::new();

    let _ = writeln!(out, "; M-Token disassembly: {} bytes, {} tokens", program.byte_len(), program.token_count());

    let mut indent = 0_usize;
    for (i, t) in program.tokens().iter().enumerate() {
        let i = i as u32;
        if let Some(&kind) = labels.get(&i) {
            let _ = writeln!(out, "{}:", label_name(program, i, kind));
        }

        if t.opcode == Opcode::E {
            indent = indent.saturating_sub(1);
        }

        let end = program.token_offset(i + 1).unwrap_or(program.byte_len());
        let mut hex = String::new();
        for b in &program.bytes()[t.offset as usize..end as usize] {
            let _ = write!(hex, "{b:02X} ");
        }

        let _ = write!(
            out,
            "{:>5}:  [{}] {}{:<6}",
            t.offset,
            hex.trim_end(),
            "    ".repeat(indent),
            t.opcode.mnemonic()
        );
        render_operand(program, i, &mut out);
        out.push('\n');

        if t.opcode == Opcode::B {
            indent += 1;
        }
    }

    out
}

/// Formats a simulation result as a summary plus the first trace rows.
#[must_use]
pub fn render_trace(result: &SimResult) -> String {
    let mut out = String::new();
    let fault = result.fault.map_or("NONE", |f| f.name());
    let _ = writeln!(out, "completed={} halted={} fault={} steps={} sp={}",
        result.completed, result.halted, fault, result.steps, result.sp);
    if let Some(v) = result.result {
        let _ = writeln!(out, "result={v}");
    }

    let _ = writeln!(out, "{:<6} {:<6} {:<8} {:<4} {:<8}", "step", "pc", "op", "sp", "top");
    for row in result.trace.iter().take(15) {
        let _ = writeln!(
            out,
            "{:<6} {:<6} {:<8} {:<4} {:<8}",
            row.step,
            row.pc,
            row.opcode.mnemonic(),
            row.sp,
            row.stack_top
        );
    }
    if result.trace.len() > 15 {
        let _ = writeln!(out, "... and {} more rows", result.trace.len() - 15);
    }

    out
}
