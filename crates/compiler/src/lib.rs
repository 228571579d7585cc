//! Xen compiler library.
//!
//! Compiles Xen source into bytecode chunks in a single pass: the scanner
//! feeds tokens straight into a Pratt parser that emits opcodes as it goes.
//! The crate also provides the chunk disassembler and the `.xenb` bytecode
//! encoder/decoder.
//!
//! ```rust,ignore
//! use bumpalo::Bump;
//! use xen_core::Heap;
//! use xen_compiler::{compile, CompileCtx};
//!
//! let mut heap = Heap::new();
//! let mut ctx = CompileCtx::new();
//! let arena = Bump::new();
//! let script = compile("io.println(1 + 2);", &mut heap, &mut ctx, &arena)?;
//! ```

pub mod compiler;
pub mod disasm;
pub mod scanner;
pub mod xenb;

pub use compiler::{CompileCtx, CompileError, compile};
pub use disasm::{disassemble_chunk, disassemble_instruction};
pub use scanner::{Scanner, ScannerState, Token, TokenKind};
pub use xenb::{DecodeError, EncodeError, decode, encode};
