//! The `net` namespace: blocking TCP sockets.
//!
//! Sockets live in a VM-side registry and are handed to programs as
//! numeric handles. All operations block the calling thread; there is no
//! async surface in the language.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use xen_core::{Obj, Value};

use crate::natives::{require_number, require_str};
use crate::vm::Vm;

const DEFAULT_READ_SIZE: usize = 1024;

/// Open sockets by handle.
#[derive(Debug, Default)]
pub struct SocketRegistry {
    next_handle: u32,
    listeners: HashMap<u32, TcpListener>,
    streams: HashMap<u32, TcpStream>,
}

impl SocketRegistry {
    fn fresh_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn insert_listener(&mut self, listener: TcpListener) -> u32 {
        let handle = self.fresh_handle();
        self.listeners.insert(handle, listener);
        handle
    }

    fn insert_stream(&mut self, stream: TcpStream) -> u32 {
        let handle = self.fresh_handle();
        self.streams.insert(handle, stream);
        handle
    }

    pub fn open_count(&self) -> usize {
        self.listeners.len() + self.streams.len()
    }
}

pub fn register(vm: &mut Vm) {
    super::make_namespace(
        vm,
        "net",
        &[
            ("listen", net_listen),
            ("accept", net_accept),
            ("connect", net_connect),
            ("read", net_read),
            ("write", net_write),
            ("close", net_close),
            ("resolve", net_resolve),
        ],
        &[],
    );
}

/// `net.listen(port)` binds a listener on all interfaces and returns its
/// handle.
fn net_listen(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let port = require_number(args, 0, "port", "listen")? as u16;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| format!("failed to bind port {}: {}", port, e))?;
    Ok(Value::Number(vm.sockets.insert_listener(listener) as f64))
}

/// Block until a client connects; returns the connection's handle.
fn net_accept(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let handle = require_number(args, 0, "socket", "accept")? as u32;
    let Some(listener) = vm.sockets.listeners.get(&handle) else {
        return Err(format!("invalid socket handle: {}", handle));
    };
    let (stream, _) = listener
        .accept()
        .map_err(|e| format!("accept failed: {}", e))?;
    Ok(Value::Number(vm.sockets.insert_stream(stream) as f64))
}

fn net_connect(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let host = require_str(&vm.heap, args, 0, "host", "connect")?;
    let port = require_number(args, 1, "port", "connect")? as u16;
    let stream = TcpStream::connect((host.as_str(), port))
        .map_err(|e| format!("failed to connect to {}:{}: {}", host, port, e))?;
    Ok(Value::Number(vm.sockets.insert_stream(stream) as f64))
}

/// Read up to `max` bytes (default 1024). Returns the bytes as a string,
/// or null once the peer closes the connection.
fn net_read(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let handle = require_number(args, 0, "socket", "read")? as u32;
    let max = match args.get(1) {
        Some(Value::Number(n)) => *n as usize,
        _ => DEFAULT_READ_SIZE,
    };
    let Some(stream) = vm.sockets.streams.get_mut(&handle) else {
        return Err(format!("invalid socket handle: {}", handle));
    };
    let mut buffer = vec![0u8; max.max(1)];
    let count = stream
        .read(&mut buffer)
        .map_err(|e| format!("read failed: {}", e))?;
    if count == 0 {
        return Ok(Value::Null);
    }
    let text = String::from_utf8_lossy(&buffer[..count]).into_owned();
    Ok(Value::Obj(vm.heap.intern(&text)))
}

/// Write a string or u8array; returns the byte count written.
fn net_write(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let handle = require_number(args, 0, "socket", "write")? as u32;
    let payload: Vec<u8> = match args.get(1).and_then(|v| v.as_obj()) {
        Some(r) => match vm.heap.get(r) {
            Obj::Str(s) => s.text.as_bytes().to_vec(),
            Obj::U8Array(a) => a.values.clone(),
            _ => return Err("argument 'data' of write must be a string or u8array".to_string()),
        },
        None => return Err("argument 'data' (position 1) required for write".to_string()),
    };
    let Some(stream) = vm.sockets.streams.get_mut(&handle) else {
        return Err(format!("invalid socket handle: {}", handle));
    };
    stream
        .write_all(&payload)
        .map_err(|e| format!("write failed: {}", e))?;
    Ok(Value::Number(payload.len() as f64))
}

fn net_close(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let handle = require_number(args, 0, "socket", "close")? as u32;
    let closed = vm.sockets.streams.remove(&handle).is_some()
        || vm.sockets.listeners.remove(&handle).is_some();
    Ok(Value::Bool(closed))
}

/// Resolve a host name to its first address.
fn net_resolve(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let host = require_str(&vm.heap, args, 0, "host", "resolve")?;
    let mut addrs = (host.as_str(), 0u16)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve '{}': {}", host, e))?;
    match addrs.next() {
        Some(addr) => {
            let ip = addr.ip().to_string();
            Ok(Value::Obj(vm.heap.intern(&ip)))
        }
        None => Ok(Value::Null),
    }
}
