//! Core data model for the Xen language.
//!
//! Everything the compiler and the VM agree on lives here: the tagged
//! [`Value`] type, the [`Heap`] that owns every runtime object for the
//! lifetime of one VM, the interned-string [`Table`], and the bytecode
//! [`Chunk`] with its opcode set.
//!
//! This crate is deliberately free of compiler and VM types. Native
//! functions are referenced by [`NativeId`] so the heap can store them
//! without knowing the VM's function signature.

pub mod chunk;
pub mod config;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use config::VmConfig;
pub use object::{
    ArrayObj, BoundCallable, BoundMethodObj, ClassObj, DictObj, ErrorObj, FunctionObj, Heap,
    InstanceObj, NamespaceObj, NativeId, NativeObj, Obj, ObjRef, PropertyDef, StrObj, U8ArrayObj,
};
pub use table::Table;
pub use value::Value;

/// Stable type identifiers, used by `typeof`/`typeid` and the bytecode
/// constant table. Primitives keep small ids, object kinds start at 100.
pub mod typeid {
    pub const UNDEFINED: i32 = -1;
    pub const BOOL: i32 = 0;
    pub const NULL: i32 = 1;
    pub const NUMBER: i32 = 2;
    pub const STRING: i32 = 100;
    pub const FUNCTION: i32 = 101;
    pub const NATIVE_FUNCTION: i32 = 102;
    pub const NAMESPACE: i32 = 103;
    pub const ARRAY: i32 = 104;
    pub const BOUND_METHOD: i32 = 105;
    pub const DICT: i32 = 106;
    pub const CLASS: i32 = 107;
    pub const INSTANCE: i32 = 108;
    pub const U8ARRAY: i32 = 109;
    pub const ERROR: i32 = 110;

    /// Human-readable name for a type id, as reported by `typeof`.
    pub fn name(id: i32) -> &'static str {
        match id {
            BOOL => "bool",
            NULL => "null",
            NUMBER => "number",
            STRING => "string",
            FUNCTION => "function",
            NATIVE_FUNCTION => "native_function",
            NAMESPACE => "namespace",
            ARRAY => "array",
            BOUND_METHOD => "bound_method",
            DICT => "dict",
            CLASS => "class",
            INSTANCE => "instance",
            U8ARRAY => "u8array",
            ERROR => "error",
            _ => "undefined",
        }
    }
}
