//! `.xenb` bytecode serialization.
//!
//! Little-endian on-disk format:
//!
//! ```text
//! 'X' 'E' 'N' 'B'                 ; magic
//! u8  version = 1
//! u32 line_count
//! u32 entrypoint_name_length
//! u8[] entrypoint_name            ; not null-terminated
//! u32 arity
//! u32 constants_count
//! ConstantEntry[constants_count]  ; u8 typeid, u32 value_len, payload
//! u32 bytecode_size
//! u8[bytecode_size]
//! ```
//!
//! Constant payloads: Bool and Null are one byte, Number is 8 bytes,
//! String is a u32 length followed by the bytes. Only scalar and string
//! constants serialize; a chunk holding nested function constants cannot
//! be written in format version 1.

use xen_core::{Chunk, FunctionObj, Heap, Obj, ObjRef, Value, typeid};

pub const MAGIC: [u8; 4] = *b"XENB";
pub const VERSION: u8 = 1;

#[derive(Debug)]
pub enum EncodeError {
    /// The constant pool holds a value the format cannot represent.
    UnsupportedConstant(i32),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::UnsupportedConstant(id) => write!(
                f,
                "cannot serialize constant of type '{}' in bytecode format v{}",
                typeid::name(*id),
                VERSION
            ),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug)]
pub enum DecodeError {
    BadMagic,
    BadVersion(u8),
    Truncated,
    BadConstant(u8),
    BadString,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadMagic => write!(f, "invalid bytecode format"),
            DecodeError::BadVersion(v) => {
                write!(f, "incorrect version: {} (expected: {})", v, VERSION)
            }
            DecodeError::Truncated => write!(f, "bytecode is truncated"),
            DecodeError::BadConstant(id) => write!(f, "unknown constant type id: {}", id),
            DecodeError::BadString => write!(f, "string constant is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialize a compiled function.
pub fn encode(heap: &Heap, function: ObjRef) -> Result<Vec<u8>, EncodeError> {
    let function = heap.function(function);
    let chunk = &function.chunk;

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);

    let line_count = chunk.lines.iter().copied().max().unwrap_or(0);
    put_u32(&mut out, line_count);

    let name = match function.name {
        Some(name) => heap.str_text(name),
        None => "",
    };
    put_u32(&mut out, name.len() as u32);
    out.extend_from_slice(name.as_bytes());

    put_u32(&mut out, function.arity as u32);
    put_u32(&mut out, chunk.constants.len() as u32);

    for &constant in &chunk.constants {
        let id = heap.type_id(constant);
        out.push(id as u8);
        match constant {
            Value::Bool(b) => {
                put_u32(&mut out, 1);
                out.push(b as u8);
            }
            Value::Null => {
                put_u32(&mut out, 1);
                out.push(0);
            }
            Value::Number(n) => {
                put_u32(&mut out, 8);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Value::Obj(r) => match heap.get(r) {
                Obj::Str(s) => {
                    put_u32(&mut out, 4 + s.text.len() as u32);
                    put_u32(&mut out, s.text.len() as u32);
                    out.extend_from_slice(s.text.as_bytes());
                }
                _ => return Err(EncodeError::UnsupportedConstant(id)),
            },
        }
    }

    put_u32(&mut out, chunk.code.len() as u32);
    out.extend_from_slice(&chunk.code);
    Ok(out)
}

/// Deserialize into a fresh function object.
pub fn decode(heap: &mut Heap, bytes: &[u8]) -> Result<ObjRef, DecodeError> {
    let mut reader = Reader { bytes, offset: 0 };

    if reader.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let line_count = reader.u32()?;

    let name_len = reader.u32()? as usize;
    let name_bytes = reader.take(name_len)?;
    let name = std::str::from_utf8(name_bytes).map_err(|_| DecodeError::BadString)?;
    let name = if name.is_empty() {
        None
    } else {
        Some(heap.intern(name))
    };

    let arity = reader.u32()? as usize;
    let constants_count = reader.u32()? as usize;

    let mut constants = Vec::with_capacity(constants_count);
    for _ in 0..constants_count {
        let id = reader.u8()?;
        let value_len = reader.u32()? as usize;
        let value = match id as i32 {
            typeid::BOOL => {
                let payload = reader.take(value_len)?;
                Value::Bool(payload.first().copied().unwrap_or(0) != 0)
            }
            typeid::NULL => {
                reader.take(value_len)?;
                Value::Null
            }
            typeid::NUMBER => {
                let payload = reader.take(value_len)?;
                let raw: [u8; 8] = payload.try_into().map_err(|_| DecodeError::Truncated)?;
                Value::Number(f64::from_le_bytes(raw))
            }
            id if id == typeid::STRING => {
                let len = reader.u32()? as usize;
                let payload = reader.take(len)?;
                let text = std::str::from_utf8(payload).map_err(|_| DecodeError::BadString)?;
                // value_len covers the length prefix plus the bytes.
                Value::Obj(heap.intern(text))
            }
            _ => return Err(DecodeError::BadConstant(id)),
        };
        constants.push(value);
    }

    let code_len = reader.u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    // The format stores a single line figure, not the per-byte table.
    let lines = vec![line_count; code.len()];

    Ok(heap.new_function(FunctionObj {
        arity,
        name,
        chunk: Chunk {
            code,
            lines,
            constants,
        },
    }))
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct Reader<'b> {
    bytes: &'b [u8],
    offset: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, count: usize) -> Result<&'b [u8], DecodeError> {
        let end = self.offset.checked_add(count).ok_or(DecodeError::Truncated)?;
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| DecodeError::Truncated)?;
        Ok(u32::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xen_core::OpCode;

    fn sample_function(heap: &mut Heap) -> ObjRef {
        let mut chunk = Chunk::new();
        let greeting = heap.intern("hello");
        let n = chunk.add_constant(Value::Number(3.5));
        let s = chunk.add_constant(Value::Obj(greeting));
        chunk.add_constant(Value::Bool(true));
        chunk.add_constant(Value::Null);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(n as u8, 1);
        chunk.write_op(OpCode::Constant, 2);
        chunk.write(s as u8, 2);
        chunk.write_op(OpCode::Add, 2);
        chunk.write_op(OpCode::Return, 3);
        let name = heap.intern("entry");
        heap.new_function(FunctionObj {
            arity: 2,
            name: Some(name),
            chunk,
        })
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut heap = Heap::new();
        let function = sample_function(&mut heap);
        let bytes = encode(&heap, function).unwrap();

        let decoded = decode(&mut heap, &bytes).unwrap();
        let original = heap.function(function);
        let restored = heap.function(decoded);

        assert_eq!(restored.arity, original.arity);
        assert_eq!(restored.chunk.code, original.chunk.code);
        assert_eq!(restored.chunk.constants.len(), 4);
        assert_eq!(restored.chunk.constants[0], Value::Number(3.5));
        assert_eq!(restored.chunk.constants[2], Value::Bool(true));
        assert_eq!(restored.chunk.constants[3], Value::Null);
        // The string constant re-interns to the same handle.
        assert_eq!(
            restored.chunk.constants[1],
            original.chunk.constants[1]
        );
        let name = restored.name.expect("name survives");
        assert_eq!(heap.str_text(name), "entry");
        // Line info collapses to the highest line.
        assert!(restored.chunk.lines.iter().all(|&l| l == 3));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut heap = Heap::new();
        let mut bytes = {
            let f = sample_function(&mut heap);
            encode(&heap, f).unwrap()
        };
        bytes[0] = b'Z';
        assert!(matches!(
            decode(&mut heap, &bytes),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut heap = Heap::new();
        let mut bytes = {
            let f = sample_function(&mut heap);
            encode(&heap, f).unwrap()
        };
        bytes[4] = 9;
        assert!(matches!(
            decode(&mut heap, &bytes),
            Err(DecodeError::BadVersion(9))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let mut heap = Heap::new();
        let bytes = {
            let f = sample_function(&mut heap);
            encode(&heap, f).unwrap()
        };
        assert!(matches!(
            decode(&mut heap, &bytes[..bytes.len() - 3]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn test_function_constant_not_serializable() {
        let mut heap = Heap::new();
        let inner = heap.new_function(FunctionObj {
            arity: 0,
            name: None,
            chunk: Chunk::new(),
        });
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Obj(inner));
        chunk.write_op(OpCode::Return, 1);
        let outer = heap.new_function(FunctionObj {
            arity: 0,
            name: None,
            chunk,
        });
        assert!(matches!(
            encode(&heap, outer),
            Err(EncodeError::UnsupportedConstant(_))
        ));
    }
}
