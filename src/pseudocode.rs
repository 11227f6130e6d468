//! Per-instruction pseudocode rendering.
//!
//! Pure over its inputs: each instruction gets a comment line with the raw
//! disassembly, followed by a one-line pseudo expression when the mnemonic
//! matches a recognized template. Unrecognized mnemonics keep the comment
//! only.

use std::fmt::Write as _;

use crate::functions::{Function, FunctionFinder};
use crate::Instruction;

/// Render the pseudocode listing for a function found at `address`.
pub fn generate_at(address: u64, finder: &FunctionFinder) -> String {
    match finder.function_at(address) {
        Some(func) => generate(func, finder),
        None => String::from("// Function not found\n"),
    }
}

/// Render the pseudocode listing for one function.
pub fn generate(func: &Function, finder: &FunctionFinder) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "// Function: {}", func.name);
    let _ = writeln!(out, "// Address: 0x{:x}", func.address);
    let _ = writeln!(out, "// Size: {} bytes", func.size);
    let _ = writeln!(out, "// Leaf: {}", if func.is_leaf { "yes" } else { "no" });
    out.push('\n');

    let _ = writeln!(out, "void {}(void) {{", func.name);

    for insn in &func.instructions {
        let _ = writeln!(
            out,
            "    // 0x{:x}: {} {}",
            insn.address, insn.mnemonic, insn.operands
        );
        let pseudo = translate(insn, finder);
        if !pseudo.is_empty() {
            let _ = writeln!(out, "    {}", pseudo);
        }
        out.push('\n');
    }

    out.push_str("}\n");
    out
}

/// Render every function, keyed by entry address.
pub fn generate_all(finder: &FunctionFinder) -> Vec<(u64, String)> {
    finder
        .functions()
        .values()
        .map(|f| (f.address, generate(f, finder)))
        .collect()
}

/// One-line pseudo expression for a recognized instruction, empty otherwise.
fn translate(insn: &Instruction, finder: &FunctionFinder) -> String {
    let m = insn.mnemonic.as_str();
    let ops = split_operands(&insn.operands);

    match m {
        "mov" if ops.len() >= 2 => {
            format!("{} = {};", reg(&ops[0]), reg(&ops[1]))
        }
        "add" if ops.len() >= 3 => {
            format!("{} = {} + {};", reg(&ops[0]), reg(&ops[1]), reg(&ops[2]))
        }
        "sub" if ops.len() >= 3 => {
            format!("{} = {} - {};", reg(&ops[0]), reg(&ops[1]), reg(&ops[2]))
        }
        "mul" if ops.len() >= 3 => {
            format!("{} = {} * {};", reg(&ops[0]), reg(&ops[1]), reg(&ops[2]))
        }
        "ldr" | "ldrsw" | "ldrb" | "ldrh" if ops.len() >= 2 => {
            format!("{} = *({});", reg(&ops[0]), ops[1])
        }
        "str" | "strb" | "strh" if ops.len() >= 2 => {
            format!("*({}) = {};", ops[1], reg(&ops[0]))
        }
        "bl" if insn.branch_target != 0 => {
            let name = finder
                .function_at(insn.branch_target)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| Function::default_name(insn.branch_target));
            format!("{}();", name)
        }
        "ret" => String::from("return;"),
        "cmp" if ops.len() >= 2 => {
            format!("// compare {}, {}", reg(&ops[0]), reg(&ops[1]))
        }
        "b" if insn.branch_target != 0 => {
            format!("goto 0x{:x};", insn.branch_target)
        }
        "stp" => String::from("// save registers to stack"),
        "ldp" => String::from("// load registers from stack"),
        "adrp" => String::from("// load page address"),
        "nop" => String::from("// nop"),
        _ if m.starts_with("b.") && insn.is_branch => {
            format!("if ({}) goto 0x{:x};", &m[2..], insn.branch_target)
        }
        _ => String::new(),
    }
}

/// Split an operand string on commas, keeping bracketed memory operands
/// whole ("x0, [sp, #16]" splits into two operands, not three).
fn split_operands(operands: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for c in operands.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                let piece = current.trim();
                if !piece.is_empty() {
                    out.push(piece.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let piece = current.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
    out
}

/// Canonicalize a register or immediate operand: lowercase, `#` stripped
/// from immediates, frame and link registers by role, zero registers as 0.
fn reg(operand: &str) -> String {
    let r = operand.to_lowercase();

    if let Some(imm) = r.strip_prefix('#') {
        return imm.to_string();
    }

    match r.as_str() {
        "x30" | "lr" => "lr".to_string(),
        "x29" | "fp" => "fp".to_string(),
        "xzr" | "wzr" => "0".to_string(),
        _ => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn insn(mnemonic: &str, operands: &str) -> Instruction {
        Instruction {
            address: 0x1000,
            bytes: vec![0; 4],
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            is_branch: mnemonic == "b" || mnemonic.starts_with("b."),
            is_call: mnemonic == "bl",
            is_return: mnemonic == "ret",
            is_load: mnemonic.starts_with("ld"),
            is_store: mnemonic.starts_with("st"),
            branch_target: 0,
        }
    }

    fn empty_finder() -> FunctionFinder {
        FunctionFinder::new()
    }

    #[test]
    fn splits_bracketed_operands() {
        assert_eq!(
            split_operands("x0, [sp, #16]"),
            vec!["x0".to_string(), "[sp, #16]".to_string()]
        );
        assert_eq!(
            split_operands("x0, x1, #4"),
            vec!["x0".to_string(), "x1".to_string(), "#4".to_string()]
        );
    }

    #[test]
    fn canonicalizes_registers() {
        assert_eq!(reg("X30"), "lr");
        assert_eq!(reg("x29"), "fp");
        assert_eq!(reg("WZR"), "0");
        assert_eq!(reg("#0x10"), "0x10");
        assert_eq!(reg("sp"), "sp");
        assert_eq!(reg("X3"), "x3");
    }

    #[test]
    fn translates_data_templates() {
        let finder = empty_finder();
        assert_eq!(translate(&insn("mov", "x0, x1"), &finder), "x0 = x1;");
        assert_eq!(
            translate(&insn("add", "x0, x1, #4"), &finder),
            "x0 = x1 + 4;"
        );
        assert_eq!(
            translate(&insn("ldr", "x0, [sp, #16]"), &finder),
            "x0 = *([sp, #16]);"
        );
        assert_eq!(
            translate(&insn("str", "x0, [sp]"), &finder),
            "*([sp]) = x0;"
        );
        assert_eq!(translate(&insn("ret", ""), &finder), "return;");
        assert_eq!(translate(&insn("nop", ""), &finder), "// nop");
    }

    #[test]
    fn translates_branches() {
        let finder = empty_finder();

        let mut b = insn("b", "#0x2000");
        b.branch_target = 0x2000;
        assert_eq!(translate(&b, &finder), "goto 0x2000;");

        let mut bne = insn("b.ne", "#0x2000");
        bne.branch_target = 0x2000;
        assert_eq!(translate(&bne, &finder), "if (ne) goto 0x2000;");
    }

    #[test]
    fn call_uses_synthetic_name_when_unknown() {
        let finder = empty_finder();
        let mut bl = insn("bl", "#0x7100002000");
        bl.branch_target = 0x7100002000;
        assert_eq!(translate(&bl, &finder), "FUN_7100002000();");
    }

    #[test]
    fn unrecognized_mnemonic_is_comment_only() {
        let finder = empty_finder();
        assert_eq!(translate(&insn("madd", "x0, x1, x2, x3"), &finder), "");
    }

    #[test]
    fn listing_contains_comment_lines() {
        let func = Function {
            address: 0x1000,
            end_address: 0x1008,
            size: 8,
            name: "FUN_1000".into(),
            instructions: vec![insn("nop", ""), insn("ret", "")],
            calls_to: BTreeSet::new(),
            called_from: BTreeSet::new(),
            basic_blocks: vec![(0x1000, 0x1008)],
            is_leaf: true,
            is_thunk: false,
            is_noreturn: false,
        };

        let text = generate(&func, &empty_finder());
        assert!(text.contains("// Function: FUN_1000"));
        assert!(text.contains("void FUN_1000(void) {"));
        assert!(text.contains("// 0x1000: nop"));
        assert!(text.contains("return;"));
        assert!(text.ends_with("}\n"));
    }
}
