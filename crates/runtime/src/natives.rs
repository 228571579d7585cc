//! Native function registry and builtin method tables.
//!
//! Heap objects refer to native functions by [`NativeId`]; the VM owns the
//! registry that maps ids back to function pointers. Built-in receiver
//! types (string, array, number, dict, u8array, error) each carry a small
//! static method table consulted during property and method dispatch.

use xen_core::{Heap, NativeId, Obj, Value, typeid};

use crate::vm::Vm;

/// The native-function ABI. `args[0]` is the receiver for method dispatch.
/// An `Err` feeds the VM's runtime-error channel.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

pub struct NativeDef {
    pub name: &'static str,
    pub func: NativeFn,
}

#[derive(Debug, Default)]
pub struct Natives {
    defs: Vec<(&'static str, NativeFnHolder)>,
}

/// fn pointers don't implement Debug; wrap for the derive.
#[derive(Clone, Copy)]
struct NativeFnHolder(NativeFn);

impl std::fmt::Debug for NativeFnHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native fn>")
    }
}

impl Natives {
    pub fn new() -> Self {
        Natives::default()
    }

    pub fn register(&mut self, name: &'static str, func: NativeFn) -> NativeId {
        self.defs.push((name, NativeFnHolder(func)));
        (self.defs.len() - 1) as NativeId
    }

    pub fn get(&self, id: NativeId) -> Option<(&'static str, NativeFn)> {
        self.defs.get(id as usize).map(|(name, f)| (*name, f.0))
    }
}

/// One `(name, native, is_property)` row of a builtin method table.
/// Property entries are invoked immediately on read with the receiver as
/// sole argument; the rest bind into a callable.
#[derive(Debug, Clone, Copy)]
pub struct MethodEntry {
    pub name: &'static str,
    pub native: NativeId,
    pub is_property: bool,
}

/// Static method tables for the built-in receiver types.
#[derive(Debug, Default)]
pub struct MethodTables {
    pub string: Vec<MethodEntry>,
    pub array: Vec<MethodEntry>,
    pub number: Vec<MethodEntry>,
    pub dict: Vec<MethodEntry>,
    pub u8array: Vec<MethodEntry>,
    pub error: Vec<MethodEntry>,
}

impl MethodTables {
    /// Resolve a method on a value by receiver type and name.
    pub fn lookup(&self, heap: &Heap, value: Value, name: &str) -> Option<MethodEntry> {
        let table = match heap.type_id(value) {
            typeid::NUMBER => &self.number,
            typeid::STRING => &self.string,
            typeid::ARRAY => &self.array,
            typeid::DICT => &self.dict,
            typeid::U8ARRAY => &self.u8array,
            typeid::ERROR => &self.error,
            _ => return None,
        };
        table.iter().find(|entry| entry.name == name).copied()
    }
}

// ---- shared argument helpers -------------------------------------------

pub(crate) fn require_arg(
    args: &[Value],
    slot: usize,
    arg_name: &str,
    fn_name: &str,
) -> Result<Value, String> {
    args.get(slot).copied().ok_or_else(|| {
        format!(
            "argument '{}' (position {}) required for {}",
            arg_name, slot, fn_name
        )
    })
}

pub(crate) fn require_number(
    args: &[Value],
    slot: usize,
    arg_name: &str,
    fn_name: &str,
) -> Result<f64, String> {
    match require_arg(args, slot, arg_name, fn_name)? {
        Value::Number(n) => Ok(n),
        other => Err(format!(
            "argument '{}' of {} must be a number (got {})",
            arg_name,
            fn_name,
            typeid_name_of(other)
        )),
    }
}

pub(crate) fn require_str(
    heap: &Heap,
    args: &[Value],
    slot: usize,
    arg_name: &str,
    fn_name: &str,
) -> Result<String, String> {
    let value = require_arg(args, slot, arg_name, fn_name)?;
    match heap.as_str(value) {
        Some(r) => Ok(heap.str_text(r).to_string()),
        None => Err(format!(
            "argument '{}' of {} must be a string",
            arg_name, fn_name
        )),
    }
}

fn typeid_name_of(value: Value) -> &'static str {
    match value {
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Number(_) => "number",
        Value::Obj(_) => "object",
    }
}

pub(crate) fn value_as_array(heap: &Heap, value: Value) -> Option<&[Value]> {
    match value {
        Value::Obj(r) => match heap.get(r) {
            Obj::Array(a) => Some(&a.values),
            _ => None,
        },
        _ => None,
    }
}
