//! Chunk disassembler.
//!
//! Renders compiled bytecode as text: offset, source line, opcode and
//! operands, with constants shown inline. Used by the compiler's debug
//! tracing and by tests that verify jump targets survive compilation.

use xen_core::{Chunk, Heap, OpCode};

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("== {} ==\n", name));
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Append one instruction's rendering; returns the next offset.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    out.push_str(&format!("{:04} ", offset));
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        out.push_str(&format!("unknown opcode {}\n", chunk.code[offset]));
        return offset + 1;
    };

    use OpCode::*;
    match op {
        Constant | DefineGlobal | GetGlobal | SetGlobal | GetProperty | SetProperty | Class
        | Include | IsType | Cast => constant_instruction(heap, chunk, op, offset, out),
        GetLocal | SetLocal | Call | CallInit | ArrayNew => {
            byte_instruction(chunk, op, offset, out)
        }
        Jump | JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        Loop => jump_instruction(chunk, op, -1, offset, out),
        Invoke => invoke_instruction(heap, chunk, offset, out),
        Property | Method => member_instruction(heap, chunk, op, offset, out),
        _ => {
            out.push_str(op.name());
            out.push('\n');
            offset + 1
        }
    }
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    out.push_str(&format!(
        "{:<16} {:4} '{}'\n",
        op.name(),
        idx,
        heap.format_value(chunk.constants[idx])
    ));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    out.push_str(&format!("{:<16} {:4}\n", op.name(), chunk.code[offset + 1]));
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    op: OpCode,
    sign: i64,
    offset: usize,
    out: &mut String,
) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    out.push_str(&format!("{:<16} {:4} -> {}\n", op.name(), offset, target));
    offset + 3
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    out.push_str(&format!(
        "{:<16} ({} args) {:4} '{}'\n",
        "OP_INVOKE",
        argc,
        idx,
        heap.format_value(chunk.constants[idx])
    ));
    offset + 3
}

fn member_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let is_private = chunk.code[offset + 2] != 0;
    out.push_str(&format!(
        "{:<16} {:4} '{}'{}\n",
        op.name(),
        idx,
        heap.format_value(chunk.constants[idx]),
        if is_private { " (private)" } else { "" }
    ));
    offset + 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use xen_core::Value;

    #[test]
    fn test_disassembles_constants_and_jumps() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(7.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'7'"));
        // Jump at offset 2, operand 2: target 2 + 3 + 2 = 7.
        assert!(text.contains("OP_JUMP_IF_FALSE    2 -> 7"));
    }

    #[test]
    fn test_line_column_collapses_repeats() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Null, 3);
        chunk.write_op(OpCode::Pop, 3);
        let text = disassemble_chunk(&heap, &chunk, "lines");
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].contains("   3 "));
        assert!(lines[2].contains("   | "));
    }
}
