//! The `string` namespace and string method table.
//!
//! Every operation takes the subject string as its first argument, which
//! is also the receiver slot when reached through method dispatch
//! (`s.upper()` and `string.upper(s)` are the same native).

use xen_core::Value;

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "string",
        &[
            ("len", str_len),
            ("upper", str_upper),
            ("lower", str_lower),
            ("substr", str_substr),
            ("find", str_find),
            ("trim", str_trim),
            ("contains", str_contains),
            ("starts_with", str_starts_with),
            ("ends_with", str_ends_with),
            ("split", str_split),
            ("replace", str_replace),
        ],
        &[],
    );
}

fn subject(vm: &Vm, args: &[Value]) -> Option<String> {
    let r = vm.heap.as_str(*args.first()?)?;
    Some(vm.heap.str_text(r).to_string())
}

fn subject_pair(vm: &Vm, args: &[Value]) -> Option<(String, String)> {
    let a = subject(vm, args)?;
    let b = vm.heap.as_str(*args.get(1)?)?;
    Some((a, vm.heap.str_text(b).to_string()))
}

pub(crate) fn str_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject(vm, args) {
        Some(s) => Ok(Value::Number(s.len() as f64)),
        None => Ok(Value::Null),
    }
}

pub(crate) fn str_upper(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject(vm, args) {
        Some(s) => {
            let upper = s.to_uppercase();
            Ok(Value::Obj(vm.heap.intern(&upper)))
        }
        None => Ok(Value::Null),
    }
}

pub(crate) fn str_lower(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject(vm, args) {
        Some(s) => {
            let lower = s.to_lowercase();
            Ok(Value::Obj(vm.heap.intern(&lower)))
        }
        None => Ok(Value::Null),
    }
}

pub(crate) fn str_trim(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject(vm, args) {
        Some(s) => {
            let trimmed = s.trim().to_string();
            Ok(Value::Obj(vm.heap.intern(&trimmed)))
        }
        None => Ok(Value::Null),
    }
}

pub(crate) fn str_contains(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject_pair(vm, args) {
        Some((haystack, needle)) => Ok(Value::Bool(haystack.contains(&needle))),
        None => Ok(Value::Bool(false)),
    }
}

pub(crate) fn str_starts_with(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject_pair(vm, args) {
        Some((s, prefix)) => Ok(Value::Bool(s.starts_with(&prefix))),
        None => Ok(Value::Bool(false)),
    }
}

pub(crate) fn str_ends_with(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject_pair(vm, args) {
        Some((s, suffix)) => Ok(Value::Bool(s.ends_with(&suffix))),
        None => Ok(Value::Bool(false)),
    }
}

/// `substr(s, start, len?)` with clamped bounds; out-of-range start yields
/// the empty string.
pub(crate) fn str_substr(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(s) = subject(vm, args) else {
        return Ok(Value::Null);
    };
    let Some(Value::Number(start)) = args.get(1) else {
        return Ok(Value::Null);
    };

    let start = (*start).max(0.0) as usize;
    if start >= s.len() {
        return Ok(Value::Obj(vm.heap.intern("")));
    }
    let len = match args.get(2) {
        Some(Value::Number(n)) => (*n).max(0.0) as usize,
        _ => s.len() - start,
    };
    let end = (start + len).min(s.len());
    let sub = s[start..end].to_string();
    Ok(Value::Obj(vm.heap.intern(&sub)))
}

/// Byte offset of the first occurrence, or -1.
pub(crate) fn str_find(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match subject_pair(vm, args) {
        Some((haystack, needle)) => Ok(Value::Number(
            haystack.find(&needle).map(|i| i as f64).unwrap_or(-1.0),
        )),
        None => Ok(Value::Number(-1.0)),
    }
}

/// Split on a delimiter into an array; an empty delimiter splits into
/// single characters.
pub(crate) fn str_split(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some((s, delim)) = subject_pair(vm, args) else {
        return Ok(Value::Null);
    };

    let parts: Vec<String> = if delim.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        let mut parts: Vec<String> = s.split(&delim).map(|p| p.to_string()).collect();
        // Trailing delimiter does not produce an empty tail element.
        if parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }
        parts
    };

    let values: Vec<Value> = parts
        .iter()
        .map(|p| Value::Obj(vm.heap.intern(p)))
        .collect();
    Ok(Value::Obj(vm.heap.new_array(values)))
}

/// Replace every occurrence; an empty pattern returns the subject
/// unchanged.
pub(crate) fn str_replace(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some((s, find)) = subject_pair(vm, args) else {
        return Ok(args.first().copied().unwrap_or(Value::Null));
    };
    let Some(replace) = args.get(2).and_then(|v| vm.heap.as_str(*v)) else {
        return Ok(args[0]);
    };
    if find.is_empty() {
        return Ok(args[0]);
    }
    let replacement = vm.heap.str_text(replace).to_string();
    let replaced = s.replace(&find, &replacement);
    Ok(Value::Obj(vm.heap.intern(&replaced)))
}
