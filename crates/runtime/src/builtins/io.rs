//! The `io` namespace.
//!
//! Program output goes through the VM's output sink rather than straight
//! to stdout, so front-ends and tests can capture it.

use std::io::BufRead;

use xen_core::Value;

use crate::natives::require_arg;
use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "io",
        &[
            ("println", io_println),
            ("print", io_print),
            ("input", io_input),
            ("clear", io_clear),
            ("pause", io_pause),
        ],
        &[],
    );
}

fn io_println(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    require_arg(args, 0, "msg", "println")?;
    for arg in args {
        let text = vm.heap.format_value(*arg);
        vm.write_out(&text);
    }
    vm.write_out("\n");
    Ok(Value::Null)
}

fn io_print(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    require_arg(args, 0, "msg", "print")?;
    for arg in args {
        let text = vm.heap.format_value(*arg);
        vm.write_out(&text);
    }
    Ok(Value::Null)
}

/// Read one line from stdin, without the trailing newline. An optional
/// string argument is printed first as a prompt. Returns null at EOF.
fn io_input(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if let Some(prompt) = args.first().and_then(|v| vm.heap.as_str(*v)) {
        let text = vm.heap.str_text(prompt).to_string();
        vm.write_out(&text);
    }

    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Ok(Value::Null),
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Value::Obj(vm.heap.intern(&line)))
        }
    }
}

fn io_clear(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    vm.write_out("\x1b[2J\x1b[H");
    Ok(Value::Bool(true))
}

/// Block until the user presses enter.
fn io_pause(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Ok(Value::Number(-1.0)),
        Ok(_) => Ok(Value::Number('\n' as u32 as f64)),
    }
}
