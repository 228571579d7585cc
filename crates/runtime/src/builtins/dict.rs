//! The `dict` namespace and dict method table.

use xen_core::{Obj, ObjRef, Table, Value};

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "dict",
        &[
            ("len", dict_len),
            ("keys", dict_keys),
            ("values", dict_values),
            ("has", dict_has),
            ("remove", dict_remove),
            ("clear", dict_clear),
        ],
        &[],
    );
}

fn receiver(vm: &Vm, args: &[Value]) -> Option<ObjRef> {
    match args.first()? {
        Value::Obj(r) if matches!(vm.heap.get(*r), Obj::Dict(_)) => Some(*r),
        _ => None,
    }
}

pub(crate) fn dict_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Number(0.0));
    };
    match vm.heap.get(r) {
        Obj::Dict(d) => Ok(Value::Number(d.table.len() as f64)),
        _ => Ok(Value::Number(0.0)),
    }
}

pub(crate) fn dict_keys(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    let keys: Vec<Value> = match vm.heap.get(r) {
        Obj::Dict(d) => d.table.iter().map(|(k, _)| Value::Obj(k)).collect(),
        _ => Vec::new(),
    };
    Ok(Value::Obj(vm.heap.new_array(keys)))
}

pub(crate) fn dict_values(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Null);
    };
    let values: Vec<Value> = match vm.heap.get(r) {
        Obj::Dict(d) => d.table.iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    };
    Ok(Value::Obj(vm.heap.new_array(values)))
}

pub(crate) fn dict_has(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Bool(false));
    };
    let Some(key) = args.get(1).and_then(|v| vm.heap.as_str(*v)) else {
        return Ok(Value::Bool(false));
    };
    let hash = vm.heap.str_hash(key);
    let present = match vm.heap.get(r) {
        Obj::Dict(d) => d.table.get(key, hash).is_some(),
        _ => false,
    };
    Ok(Value::Bool(present))
}

pub(crate) fn dict_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(r) = receiver(vm, args) else {
        return Ok(Value::Bool(false));
    };
    let Some(key) = args.get(1).and_then(|v| vm.heap.as_str(*v)) else {
        return Ok(Value::Bool(false));
    };
    let hash = vm.heap.str_hash(key);
    let removed = match vm.heap.get_mut(r) {
        Obj::Dict(d) => d.table.delete(key, hash),
        _ => false,
    };
    Ok(Value::Bool(removed))
}

pub(crate) fn dict_clear(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if let Some(r) = receiver(vm, args) {
        if let Obj::Dict(d) = vm.heap.get_mut(r) {
            d.table = Table::new();
        }
    }
    Ok(Value::Null)
}
