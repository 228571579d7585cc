//! Builtin namespaces, global natives and type constructors.
//!
//! Each submodule provides one namespace (`math`, `io`, `string`,
//! `datetime`, `array`, `dict`, `os`, `net`) registered with the VM at
//! startup; `include <name>;` binds them into a program's globals. This
//! module also registers the free-standing globals (`typeof`, `typeid`,
//! the capitalized type constructors) and the per-type method tables used
//! by property dispatch.

pub mod array;
pub mod datetime;
pub mod dict;
pub mod io;
pub mod math;
pub mod net;
pub mod os;
pub mod string;

use xen_core::{Heap, Obj, ObjRef, Value, typeid};

use crate::natives::{MethodEntry, MethodTables, NativeFn, require_arg};
use crate::vm::Vm;

pub fn register_all(vm: &mut Vm) {
    math::register(vm);
    io::register(vm);
    string::register(vm);
    datetime::register(vm);
    array::register(vm);
    os::register(vm);
    dict::register(vm);
    net::register(vm);

    vm.define_native_fn("typeof", native_typeof);
    vm.define_native_fn("typeid", native_typeid);

    // Type constructors use capitalization to stand apart from namespaces.
    vm.define_native_fn("Number", number_ctor);
    vm.define_native_fn("String", string_ctor);
    vm.define_native_fn("Bool", bool_ctor);
    vm.define_native_fn("Array", array_ctor);
    vm.define_native_fn("Dictionary", dict_ctor);
    vm.define_native_fn("UInt8Array", u8array_ctor);
    vm.define_native_fn("Error", error_ctor);

    register_method_tables(vm);
}

/// Build the `(name, native, is_property)` tables for built-in receiver
/// types. Property entries resolve on read without a call.
fn register_method_tables(vm: &mut Vm) {
    fn entry(vm: &mut Vm, name: &'static str, func: NativeFn, is_property: bool) -> MethodEntry {
        MethodEntry {
            name,
            native: vm.register_native(name, func),
            is_property,
        }
    }

    let string_table = vec![
        entry(vm, "len", string::str_len, true),
        entry(vm, "upper", string::str_upper, false),
        entry(vm, "lower", string::str_lower, false),
        entry(vm, "trim", string::str_trim, false),
        entry(vm, "contains", string::str_contains, false),
        entry(vm, "starts_with", string::str_starts_with, false),
        entry(vm, "ends_with", string::str_ends_with, false),
        entry(vm, "substr", string::str_substr, false),
        entry(vm, "find", string::str_find, false),
        entry(vm, "split", string::str_split, false),
        entry(vm, "replace", string::str_replace, false),
    ];

    let array_table = vec![
        entry(vm, "len", array::arr_len, true),
        entry(vm, "first", array::arr_first, true),
        entry(vm, "last", array::arr_last, true),
        entry(vm, "push", array::arr_push, false),
        entry(vm, "pop", array::arr_pop, false),
        entry(vm, "clear", array::arr_clear, false),
        entry(vm, "contains", array::arr_contains, false),
        entry(vm, "index_of", array::arr_index_of, false),
        entry(vm, "reverse", array::arr_reverse, false),
        entry(vm, "join", array::arr_join, false),
    ];

    let number_table = vec![
        entry(vm, "abs", math::num_abs, false),
        entry(vm, "floor", math::num_floor, false),
        entry(vm, "ceil", math::num_ceil, false),
        entry(vm, "round", math::num_round, false),
        entry(vm, "to_string", math::num_to_string, false),
    ];

    let dict_table = vec![
        entry(vm, "len", dict::dict_len, true),
        entry(vm, "keys", dict::dict_keys, false),
        entry(vm, "values", dict::dict_values, false),
        entry(vm, "has", dict::dict_has, false),
        entry(vm, "remove", dict::dict_remove, false),
        entry(vm, "clear", dict::dict_clear, false),
    ];

    let u8array_table = vec![entry(vm, "len", array::arr_len, true)];

    let error_table = vec![entry(vm, "msg", error_msg, true)];

    vm.methods = MethodTables {
        string: string_table,
        array: array_table,
        number: number_table,
        dict: dict_table,
        u8array: u8array_table,
        error: error_table,
    };
}

/// Build a namespace from function and constant entries and register it.
pub(crate) fn make_namespace(
    vm: &mut Vm,
    ns_name: &'static str,
    fns: &[(&'static str, NativeFn)],
    consts: &[(&'static str, Value)],
) -> ObjRef {
    let ns = vm.heap.new_namespace(ns_name);
    for &(name, func) in fns {
        let id = vm.register_native(name, func);
        let obj = vm.heap.new_native(id, name);
        if let Obj::Namespace(n) = vm.heap.get_mut(ns) {
            n.set(name, Value::Obj(obj));
        }
    }
    for &(name, value) in consts {
        if let Obj::Namespace(n) = vm.heap.get_mut(ns) {
            n.set(name, value);
        }
    }
    vm.register_namespace(ns_name, ns);
    // Builtin namespaces are visible without an include; `include name;`
    // re-binds the same object.
    vm.define_global(ns_name, Value::Obj(ns));
    ns
}

// ---- shared conversions -------------------------------------------------

/// Numeric coercion shared by the `Number` constructor and `as Number`.
/// Strings parse with leading-prefix semantics (an unparseable string is 0,
/// a parseable prefix wins); non-string objects don't convert.
pub fn number_from_value(heap: &Heap, value: Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        Value::Number(n) => Some(n),
        Value::Obj(r) => match heap.get(r) {
            Obj::Str(s) => Some(parse_number_prefix(&s.text)),
            _ => None,
        },
    }
}

fn parse_number_prefix(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// Truthiness coercion for the `Bool` constructor and `as Bool`: null is
/// false, numbers compare against zero, everything else is true.
pub fn bool_from_value(value: Value) -> bool {
    match value {
        Value::Bool(b) => b,
        Value::Null => false,
        Value::Number(n) => n != 0.0,
        Value::Obj(_) => true,
    }
}

// ---- globals -------------------------------------------------------------

fn native_typeof(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "type", "typeof")?;
    let name = typeid::name(vm.heap.type_id(value));
    Ok(Value::Obj(vm.heap.intern(name)))
}

fn native_typeid(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "type", "typeid")?;
    Ok(Value::Number(vm.heap.type_id(value) as f64))
}

// ---- type constructors ---------------------------------------------------

fn number_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "construct_from", "Number")?;
    match number_from_value(&vm.heap, value) {
        Some(n) => Ok(Value::Number(n)),
        None => Err(format!(
            "cannot construct number from {}",
            typeid::name(vm.heap.type_id(value))
        )),
    }
}

fn string_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "construct_from", "String")?;
    let text = vm.heap.format_value(value);
    Ok(Value::Obj(vm.heap.intern(&text)))
}

fn bool_ctor(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "construct_from", "Bool")?;
    Ok(Value::Bool(bool_from_value(value)))
}

/// `Array(count, default?)` builds a pre-filled array.
fn array_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() > 2 {
        return Err("array constructor has invalid number of arguments".to_string());
    }
    let count = match args.first() {
        None => 0,
        Some(Value::Number(n)) => *n as usize,
        Some(_) => return Err("element count must be a number".to_string()),
    };
    let default = args.get(1).copied().unwrap_or(Value::Null);
    let array = vm.heap.new_array(vec![default; count]);
    Ok(Value::Obj(array))
}

fn dict_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err("dictionary constructor takes no arguments".to_string());
    }
    Ok(Value::Obj(vm.heap.new_dict()))
}

fn u8array_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() > 2 {
        return Err("u8array constructor has invalid number of arguments".to_string());
    }
    let count = match args.first() {
        None => 0,
        Some(Value::Number(n)) => *n as usize,
        Some(_) => return Err("element count must be a number".to_string()),
    };
    let default = match args.get(1) {
        None => 0,
        Some(Value::Number(n)) => *n as u8,
        Some(_) => return Err("default value must be a number".to_string()),
    };
    let array = vm.heap.new_u8array(vec![default; count]);
    Ok(Value::Obj(array))
}

fn error_ctor(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = require_arg(args, 0, "msg", "Error")?;
    let msg = vm.heap.format_value(value);
    Ok(Value::Obj(vm.heap.new_error(&msg)))
}

/// `.msg` accessor on error values.
fn error_msg(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first().and_then(|v| v.as_obj()) {
        Some(r) => match vm.heap.get(r) {
            Obj::Error(e) => Ok(Value::Obj(e.msg)),
            _ => Ok(Value::Obj(vm.heap.intern(""))),
        },
        None => Ok(Value::Obj(vm.heap.intern(""))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_prefix() {
        assert_eq!(parse_number_prefix("42"), 42.0);
        assert_eq!(parse_number_prefix("3.5x"), 3.5);
        assert_eq!(parse_number_prefix("  -2"), -2.0);
        assert_eq!(parse_number_prefix("abc"), 0.0);
        assert_eq!(parse_number_prefix(""), 0.0);
    }

    #[test]
    fn test_bool_from_value() {
        assert!(!bool_from_value(Value::Null));
        assert!(!bool_from_value(Value::Number(0.0)));
        assert!(bool_from_value(Value::Number(2.0)));
        assert!(bool_from_value(Value::Bool(true)));
    }
}
