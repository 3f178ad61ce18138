use crate::bytecode::ir::Contract;
use crate::bytecode::op::{Opcode, jump_target};
use crate::lang::types::Type;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Human-readable listing of a contract.
///
/// Every instruction is printed with its word offset; jump targets are
/// marked with `►` and function entry points are labelled.
pub fn disassemble(contract: &Contract) -> String {
    let mut out = String::new();
    let code = &contract.code;
    let targets = collect_jump_targets(code);

    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(
        out,
        " {}{} ({} words)",
        contract.name,
        if contract.read { " [read]" } else { "" },
        code.len()
    );
    for (name, info) in contract.params_by_slot() {
        let _ = writeln!(out, " data {} {} @{}", name, info.ty, info.index);
    }
    let _ = writeln!(out, "════════════════════════════════════════");

    let mut ip = 0;
    while ip < code.len() {
        if let Some(func) = contract.func_at(ip) {
            let params: Vec<String> = func
                .params
                .iter()
                .map(|p| format!("{} {}", p.name, p.ty))
                .collect();
            let _ = writeln!(out, "      ┌── func {}({}) {}", func.name, params.join(", "), func.result);
        } else if targets.contains(&ip) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }
        let marker = if targets.contains(&ip) { "►" } else { " " };

        let Ok(op) = Opcode::try_from(code[ip]) else {
            let _ = writeln!(out, "{:04} {} ??? {}", ip, marker, code[ip]);
            ip += 1;
            continue;
        };
        let width = op.operand_len(code, ip);
        let end = (ip + 1 + width).min(code.len());
        let args = &code[ip + 1..end];
        let _ = writeln!(out, "{:04} {} {:<14}{}", ip, marker, op.mnemonic(), format_operands(op, ip, args));
        ip = end;
    }
    out
}

fn collect_jump_targets(code: &[u16]) -> BTreeSet<usize> {
    let mut targets = BTreeSet::new();
    let mut ip = 0;
    while ip < code.len() {
        let Ok(op) = Opcode::try_from(code[ip]) else {
            ip += 1;
            continue;
        };
        if op.is_relative() && op != Opcode::CallFunc {
            if let Some(target) = code.get(ip + 1).and_then(|&w| jump_target(ip + 1, w)) {
                targets.insert(target);
            }
        }
        ip += 1 + op.operand_len(code, ip);
    }
    targets
}

fn format_operands(op: Opcode, ip: usize, args: &[u16]) -> String {
    match (op, args) {
        (_, [offset]) if op.is_relative() => match jump_target(ip + 1, *offset) {
            Some(target) => {
                let arrow = if (*offset as i16) < 0 { "↑" } else { "↓" };
                format!("{:+} {} (→ {:04})", *offset as i16, arrow, target)
            }
            None => format!("{:+} (out of range)", *offset as i16),
        },
        (Opcode::Push16, [w]) => format!("{}", *w as i16),
        (Opcode::Push32, [hi, lo]) => format!("{}", ((*hi as u32) << 16 | *lo as u32) as i32),
        (Opcode::Push64, words) => {
            let bits = words.iter().fold(0u64, |acc, &w| acc << 16 | w as u64);
            format!("{} ; {:#018x}", bits as i64, bits)
        }
        (Opcode::PushStr, [offset, len]) => format!("data[{}..{}]", offset, *offset as usize + *len as usize),
        (Opcode::Data, [count, ..]) => format!("{} words", count),
        (Opcode::InitVars, [_, types @ ..]) => {
            let types: Vec<String> = types.iter().map(|&t| Type::from_tag(t).to_string()).collect();
            types.join(" ")
        }
        (Opcode::Copy | Opcode::Return, [tag]) => Type::from_tag(*tag).to_string(),
        (Opcode::ParContract, [slot, tag]) => format!("@{} {}", slot, Type::from_tag(*tag)),
        (_, args) => args
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::FuncInfo;

    fn w(op: Opcode) -> u16 {
        op.into()
    }

    #[test]
    fn test_disassemble_marks_jump_targets() {
        let mut contract = Contract::new("Loop");
        contract.code = vec![
            w(Opcode::Push16),
            (-5i16) as u16,
            w(Opcode::Jze),
            (-4i16) as u16,
            w(Opcode::Return),
            Type::VOID.tag(),
        ];
        let listing = disassemble(&contract);
        assert!(listing.contains(" Loop (6 words)"));
        assert!(listing.contains("0000 ► PUSH16"));
        assert!(listing.contains("-5\n"));
        assert!(listing.contains("-4 ↑ (→ 0000)"));
        assert!(listing.contains("RETURN"));
    }

    #[test]
    fn test_disassemble_labels_functions() {
        let mut contract = Contract::new("F");
        contract.code = vec![w(Opcode::Jmp), 2, w(Opcode::Push16), 1, w(Opcode::RetFunc)];
        contract.funcs.push(FuncInfo {
            name: "one".into(),
            result: Type::INT,
            params: Vec::new(),
            offset: 2,
            frame: 0,
        });
        let listing = disassemble(&contract);
        assert!(listing.contains("┌── func one() int"));
        assert!(listing.contains("+2 ↓ (→ 0004)"));
    }

    #[test]
    fn test_disassemble_survives_bad_words() {
        let mut contract = Contract::new("Bad");
        contract.code = vec![999, w(Opcode::Push32), 1];
        let listing = disassemble(&contract);
        assert!(listing.contains("0000   ??? 999"));
        assert!(listing.contains("PUSH32"));
    }
}
