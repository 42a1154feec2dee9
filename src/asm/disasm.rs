//! Disassembler: decoded actions back to assembly text.

use crate::asm::Program;
use crate::isa::{Action, DecodeError, Decoder, ParamType, Parameter};

/// Format one operand. Registers print by name when the index is known.
pub fn format_parameter(param: &Parameter, registers: &[String]) -> String {
    match param.kind {
        ParamType::Register => usize::try_from(param.value)
            .ok()
            .and_then(|i| registers.get(i))
            .cloned()
            .unwrap_or_else(|| format!("r{}", param.value)),
        ParamType::Memory => format!("0x{:x}", param.value),
        ParamType::Literal => param.value.to_string(),
        ParamType::Call => format!("?{}", param.value),
    }
}

/// Format a decoded action as an assembly statement.
pub fn format_action(action: &Action, registers: &[String]) -> String {
    let operands: Vec<String> = action.operands().map(|p| format_parameter(p, registers)).collect();

    if action.opcode.is_comparison() && operands.len() == 2 {
        return format!("{} {} {}", operands[0], action.opcode, operands[1]);
    }
    if operands.is_empty() {
        return action.opcode.to_string();
    }
    format!("{} {}", action.opcode, operands.join(", "))
}

/// Disassemble a whole program into a listing.
pub fn disassemble(program: &Program, registers: &[String]) -> Result<String, DecodeError> {
    let decoder = Decoder::new(program.word);
    let mut output = String::new();
    output.push_str(&format!("# {}-bit program, {} instructions\n", program.word.bits(), program.len()));

    for group in &program.groups {
        let action = decoder.decode(group)?;
        output.push_str(&format!(
            "{:03}: {:<24} # {} fragments\n",
            action.key,
            format_action(&action, registers),
            group.len()
        ));
    }
    Ok(output)
}
