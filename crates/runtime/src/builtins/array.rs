//! The `array` namespace and array method table.

use xen_core::{Obj, ObjRef, Value};

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "array",
        &[
            ("len", arr_len),
            ("push", arr_push),
            ("pop", arr_pop),
            ("first", arr_first),
            ("last", arr_last),
            ("clear", arr_clear),
            ("contains", arr_contains),
            ("index_of", arr_index_of),
            ("reverse", arr_reverse),
            ("join", arr_join),
        ],
        &[],
    );
}

fn receiver(vm: &Vm, args: &[Value]) -> Option<ObjRef> {
    match args.first()? {
        Value::Obj(r) if matches!(vm.heap.get(*r), Obj::Array(_)) => Some(*r),
        _ => None,
    }
}

/// `.len` works for arrays and u8arrays (the u8array table reuses it).
pub(crate) fn arr_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first().and_then(|v| v.as_obj()) {
        Some(r) => match vm.heap.get(r) {
            Obj::Array(a) => Ok(Value::Number(a.values.len() as f64)),
            Obj::U8Array(a) => Ok(Value::Number(a.values.len() as f64)),
            _ => Ok(Value::Number(-1.0)),
        },
        None => Ok(Value::Number(-1.0)),
    }
}

/// Append every argument; returns the new length.
pub(crate) fn arr_push(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    let len = match vm.heap.get_mut(r) {
        Obj::Array(a) => {
            a.values.extend_from_slice(&args[1..]);
            a.values.len()
        }
        _ => return Ok(Value::Null),
    };
    Ok(Value::Number(len as f64))
}

pub(crate) fn arr_pop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    match vm.heap.get_mut(r) {
        Obj::Array(a) => Ok(a.values.pop().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn arr_first(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    match vm.heap.get(r) {
        Obj::Array(a) => Ok(a.values.first().copied().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn arr_last(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    match vm.heap.get(r) {
        Obj::Array(a) => Ok(a.values.last().copied().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn arr_clear(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if let Some(r) = receiver(vm, args) {
        if let Obj::Array(a) = vm.heap.get_mut(r) {
            a.values.clear();
        }
    }
    Ok(Value::Null)
}

pub(crate) fn arr_contains(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Bool(false));
    };
    let Some(needle) = args.get(1).copied() else {
        return Ok(Value::Bool(false));
    };
    let found = match vm.heap.get(r) {
        Obj::Array(a) => a.values.iter().any(|&v| vm.heap.values_equal(v, needle)),
        _ => false,
    };
    Ok(Value::Bool(found))
}

pub(crate) fn arr_index_of(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Number(-1.0));
    };
    let Some(needle) = args.get(1).copied() else {
        return Ok(Value::Number(-1.0));
    };
    let index = match vm.heap.get(r) {
        Obj::Array(a) => a
            .values
            .iter()
            .position(|&v| vm.heap.values_equal(v, needle)),
        _ => None,
    };
    Ok(Value::Number(index.map(|i| i as f64).unwrap_or(-1.0)))
}

/// In-place reversal; returns the receiver.
pub(crate) fn arr_reverse(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    if let Obj::Array(a) = vm.heap.get_mut(r) {
        a.values.reverse();
    }
    Ok(args[0])
}

/// Join elements into a string, converting each like the `String`
/// constructor. The delimiter defaults to ", ".
pub(crate) fn arr_join(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    let delim = match args.get(1).and_then(|v| vm.heap.as_str(*v)) {
        Some(d) => vm.heap.str_text(d).to_string(),
        None => ", ".to_string(),
    };
    let values = match vm.heap.get(r) {
        Obj::Array(a) => a.values.clone(),
        _ => return Ok(Value::Null),
    };
    let parts: Vec<String> = values.iter().map(|&v| vm.heap.format_value(v)).collect();
    let joined = parts.join(&delim);
    Ok(Value::Obj(vm.heap.intern(&joined)))
}
