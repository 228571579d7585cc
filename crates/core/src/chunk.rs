//! Bytecode chunks.
//!
//! A chunk is a function's compiled body: a flat byte array of opcodes and
//! immediate operands, a parallel line table for error reporting, and a
//! constant pool.

use crate::value::Value;

/// The full opcode set. All opcodes are one byte; operands are immediate
/// bytes following the opcode. Jump operands are 16-bit big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    Null,
    True,
    False,
    Not,
    Equal,
    Greater,
    Less,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Pop,
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    CallInit,
    Invoke,
    GetProperty,
    SetProperty,
    IndexGet,
    IndexSet,
    ArrayNew,
    ArrayLen,
    DictNew,
    DictAdd,
    Class,
    Property,
    Method,
    Initializer,
    Include,
    IsType,
    Cast,
    Return,
}

/// Every opcode in discriminant order, for byte decoding.
const OPCODES: [OpCode; 42] = [
    OpCode::Constant,
    OpCode::Null,
    OpCode::True,
    OpCode::False,
    OpCode::Not,
    OpCode::Equal,
    OpCode::Greater,
    OpCode::Less,
    OpCode::Negate,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Multiply,
    OpCode::Divide,
    OpCode::Mod,
    OpCode::Pop,
    OpCode::DefineGlobal,
    OpCode::GetGlobal,
    OpCode::SetGlobal,
    OpCode::GetLocal,
    OpCode::SetLocal,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::Loop,
    OpCode::Call,
    OpCode::CallInit,
    OpCode::Invoke,
    OpCode::GetProperty,
    OpCode::SetProperty,
    OpCode::IndexGet,
    OpCode::IndexSet,
    OpCode::ArrayNew,
    OpCode::ArrayLen,
    OpCode::DictNew,
    OpCode::DictAdd,
    OpCode::Class,
    OpCode::Property,
    OpCode::Method,
    OpCode::Initializer,
    OpCode::Include,
    OpCode::IsType,
    OpCode::Cast,
    OpCode::Return,
];

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OPCODES.get(byte as usize).copied()
    }

    /// Disassembly name.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "OP_CONSTANT",
            OpCode::Null => "OP_NULL",
            OpCode::True => "OP_TRUE",
            OpCode::False => "OP_FALSE",
            OpCode::Not => "OP_NOT",
            OpCode::Equal => "OP_EQUAL",
            OpCode::Greater => "OP_GREATER",
            OpCode::Less => "OP_LESS",
            OpCode::Negate => "OP_NEGATE",
            OpCode::Add => "OP_ADD",
            OpCode::Subtract => "OP_SUBTRACT",
            OpCode::Multiply => "OP_MULTIPLY",
            OpCode::Divide => "OP_DIVIDE",
            OpCode::Mod => "OP_MOD",
            OpCode::Pop => "OP_POP",
            OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
            OpCode::GetGlobal => "OP_GET_GLOBAL",
            OpCode::SetGlobal => "OP_SET_GLOBAL",
            OpCode::GetLocal => "OP_GET_LOCAL",
            OpCode::SetLocal => "OP_SET_LOCAL",
            OpCode::Jump => "OP_JUMP",
            OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
            OpCode::Loop => "OP_LOOP",
            OpCode::Call => "OP_CALL",
            OpCode::CallInit => "OP_CALL_INIT",
            OpCode::Invoke => "OP_INVOKE",
            OpCode::GetProperty => "OP_GET_PROPERTY",
            OpCode::SetProperty => "OP_SET_PROPERTY",
            OpCode::IndexGet => "OP_INDEX_GET",
            OpCode::IndexSet => "OP_INDEX_SET",
            OpCode::ArrayNew => "OP_ARRAY_NEW",
            OpCode::ArrayLen => "OP_ARRAY_LEN",
            OpCode::DictNew => "OP_DICT_NEW",
            OpCode::DictAdd => "OP_DICT_ADD",
            OpCode::Class => "OP_CLASS",
            OpCode::Property => "OP_PROPERTY",
            OpCode::Method => "OP_METHOD",
            OpCode::Initializer => "OP_INITIALIZER",
            OpCode::Include => "OP_INCLUDE",
            OpCode::IsType => "OP_IS_TYPE",
            OpCode::Cast => "OP_CAST",
            OpCode::Return => "OP_RETURN",
        }
    }
}

/// A growable bytecode sequence with its line map and constant pool.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// Source line of each byte in `code`.
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    /// Append a constant and return its pool index.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_byte_roundtrip() {
        for op in OPCODES {
            assert_eq!(OpCode::from_byte(op as u8), Some(op));
        }
        assert_eq!(OpCode::from_byte(OPCODES.len() as u8), None);
        assert_eq!(OpCode::from_byte(0xff), None);
    }

    #[test]
    fn test_write_tracks_lines() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Pop, 2);
        assert_eq!(chunk.code, vec![OpCode::Null as u8, OpCode::Pop as u8]);
        assert_eq!(chunk.lines, vec![1, 2]);
    }

    #[test]
    fn test_add_constant_returns_index() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Number(1.0)), 0);
        assert_eq!(chunk.add_constant(Value::Null), 1);
    }
}
