//! The `datetime` namespace.

use std::time::{SystemTime, UNIX_EPOCH};

use xen_core::Value;

use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "datetime",
        &[("now", time_now), ("clock", time_clock)],
        &[],
    );
}

/// Wall-clock seconds since the Unix epoch.
fn time_now(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}

/// Seconds of VM run time; monotonic, for measuring durations.
fn time_clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.elapsed_seconds()))
}
