//! The `os` namespace: files, directories, environment and processes.

use std::fs;
use std::process::Command;

use xen_core::{Obj, Value};

use crate::natives::{require_number, require_str, value_as_array};
use crate::vm::Vm;

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "os",
        &[
            ("readtxt", os_readtxt),
            ("readlines", os_readlines),
            ("readbytes", os_readbytes),
            ("writetxt", os_writetxt),
            ("writebytes", os_writebytes),
            ("exists", os_exists),
            ("mkdir", os_mkdir),
            ("rmdir", os_rmdir),
            ("remove", os_remove),
            ("listdir", os_listdir),
            ("getenv", os_getenv),
            ("exec", os_exec),
            ("sleep", os_sleep),
            ("exit", os_exit),
        ],
        &[],
    );
}

fn os_readtxt(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "filename", "readtxt")?;
    let contents =
        fs::read_to_string(&path).map_err(|_| format!("failed to open file: {}", path))?;
    Ok(Value::Obj(vm.heap.intern(&contents)))
}

fn os_readlines(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "filename", "readlines")?;
    let contents =
        fs::read_to_string(&path).map_err(|_| format!("failed to open file: {}", path))?;
    let lines: Vec<Value> = contents
        .lines()
        .map(|line| Value::Obj(vm.heap.intern(line)))
        .collect();
    Ok(Value::Obj(vm.heap.new_array(lines)))
}

fn os_readbytes(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "filename", "readbytes")?;
    let bytes = fs::read(&path).map_err(|_| format!("failed to open file: {}", path))?;
    Ok(Value::Obj(vm.heap.new_u8array(bytes)))
}

fn os_writetxt(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "filename", "writetxt")?;
    let contents = require_str(&vm.heap, args, 1, "contents", "writetxt")?;
    fs::write(&path, contents).map_err(|_| format!("failed to write file: {}", path))?;
    Ok(Value::Bool(true))
}

fn os_writebytes(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "filename", "writebytes")?;
    let bytes = match args.get(1).and_then(|v| v.as_obj()) {
        Some(r) => match vm.heap.get(r) {
            Obj::U8Array(a) => a.values.clone(),
            _ => return Err("argument 'bytes' of writebytes must be a u8array".to_string()),
        },
        None => return Err("argument 'bytes' (position 1) required for writebytes".to_string()),
    };
    fs::write(&path, bytes).map_err(|_| format!("failed to write file: {}", path))?;
    Ok(Value::Bool(true))
}

fn os_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "path", "exists")?;
    Ok(Value::Bool(fs::metadata(&path).is_ok()))
}

fn os_mkdir(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "path", "mkdir")?;
    Ok(Value::Bool(fs::create_dir_all(&path).is_ok()))
}

/// Remove a directory; pass true as the second argument for recursive
/// removal.
fn os_rmdir(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "path", "rmdir")?;
    let recursive = matches!(args.get(1), Some(Value::Bool(true)));
    let result = if recursive {
        fs::remove_dir_all(&path)
    } else {
        fs::remove_dir(&path)
    };
    Ok(Value::Bool(result.is_ok()))
}

fn os_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "path", "remove")?;
    Ok(Value::Bool(fs::remove_file(&path).is_ok()))
}

fn os_listdir(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = require_str(&vm.heap, args, 0, "path", "listdir")?;
    let entries =
        fs::read_dir(&path).map_err(|_| format!("failed to open directory: {}", path))?;
    let mut names = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        names.push(Value::Obj(vm.heap.intern(&name)));
    }
    Ok(Value::Obj(vm.heap.new_array(names)))
}

fn os_getenv(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = require_str(&vm.heap, args, 0, "name", "getenv")?;
    match std::env::var(&name) {
        Ok(value) => Ok(Value::Obj(vm.heap.intern(&value))),
        Err(_) => Ok(Value::Null),
    }
}

/// `os.exec(cmd, args[]?)` runs a command through the shell and returns
/// its exit code.
fn os_exec(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let cmd = require_str(&vm.heap, args, 0, "cmd", "exec")?;

    let mut command_line = cmd;
    if let Some(extra) = args.get(1).and_then(|v| value_as_array(&vm.heap, *v)) {
        for arg in extra {
            if let Some(r) = vm.heap.as_str(*arg) {
                command_line.push(' ');
                command_line.push_str(vm.heap.str_text(r));
            }
        }
    }

    let status = if cfg!(windows) {
        Command::new("cmd").arg("/C").arg(&command_line).status()
    } else {
        Command::new("sh").arg("-c").arg(&command_line).status()
    };

    match status {
        Ok(status) => Ok(Value::Number(status.code().unwrap_or(-1) as f64)),
        Err(_) => Err(format!("failed to run command: {}", command_line)),
    }
}

/// `os.sleep(duration)` blocks the calling thread for a whole number of
/// seconds and returns the seconds slept.
fn os_sleep(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let duration = require_number(args, 0, "duration", "sleep")?.max(0.0) as u64;
    std::thread::sleep(std::time::Duration::from_secs(duration));
    Ok(Value::Number(duration as f64))
}

fn os_exit(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let code = match args.first() {
        Some(Value::Number(n)) => *n as i32,
        _ => 0,
    };
    vm.write_out(&format!("Xen was terminated with exit code {}\n", code));
    std::process::exit(code);
}
