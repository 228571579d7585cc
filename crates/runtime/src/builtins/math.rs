//! The `math` namespace and the number method table.

use xen_core::Value;
use xen_core::value::format_number;

use crate::natives::require_number;
use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "math",
        &[
            ("sqrt", math_sqrt),
            ("abs", num_abs),
            ("floor", num_floor),
            ("ceil", num_ceil),
            ("round", num_round),
            ("sin", math_sin),
            ("cos", math_cos),
            ("tan", math_tan),
            ("pow", math_pow),
            ("log", math_log),
            ("log10", math_log10),
            ("exp", math_exp),
            ("min", math_min),
            ("max", math_max),
            ("random", math_random),
        ],
        &[
            ("PI", Value::Number(std::f64::consts::PI)),
            ("E", Value::Number(std::f64::consts::E)),
            ("TAU", Value::Number(std::f64::consts::TAU)),
        ],
    );
}

fn math_sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "sqrt")?.sqrt()))
}

fn math_sin(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "sin")?.sin()))
}

fn math_cos(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "cos")?.cos()))
}

fn math_tan(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "tan")?.tan()))
}

fn math_pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let base = require_number(args, 0, "base", "pow")?;
    let exponent = require_number(args, 1, "exponent", "pow")?;
    Ok(Value::Number(base.powf(exponent)))
}

fn math_log(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "log")?.ln()))
}

fn math_log10(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(
        require_number(args, 0, "value", "log10")?.log10(),
    ))
}

fn math_exp(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(require_number(args, 0, "value", "exp")?.exp()))
}

/// Smallest of the numeric arguments; non-numbers are skipped.
fn math_min(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut min = require_number(args, 0, "value", "min")?;
    for arg in &args[1..] {
        if let Value::Number(n) = arg {
            if *n < min {
                min = *n;
            }
        }
    }
    Ok(Value::Number(min))
}

fn math_max(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut max = require_number(args, 0, "value", "max")?;
    for arg in &args[1..] {
        if let Value::Number(n) = arg {
            if *n > max {
                max = *n;
            }
        }
    }
    Ok(Value::Number(max))
}

fn math_random(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(rand::random::<f64>()))
}

// Number methods; lenient on bad receivers like the rest of the method
// tables.

pub(crate) fn num_abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(n.abs())),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn num_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(n.floor())),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn num_ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(n.ceil())),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn num_round(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(n.round())),
        _ => Ok(Value::Null),
    }
}

pub(crate) fn num_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::Number(n)) => {
            let text = format_number(*n);
            Ok(Value::Obj(vm.heap.intern(&text)))
        }
        _ => Ok(Value::Null),
    }
}
