//! The Xen virtual machine.
//!
//! A stack machine: one value stack shared by up to 64 call frames, each
//! frame windowing into it at its `slots` base. The call convention places
//! the callee at slot 0 (`this` for methods), arguments after it; `return`
//! collapses the window into the result value.
//!
//! A runtime error prints a stack trace, resets both stacks and leaves the
//! VM ready for the next top-level program, which is what keeps the REPL
//! alive across failures.

use std::collections::HashSet;
use std::time::Instant;

use bumpalo::Bump;
use xen_core::{
    BoundCallable, Heap, NativeId, Obj, ObjRef, OpCode, Table, Value, VmConfig, typeid,
};
use xen_compiler::{CompileCtx, compile};

use crate::builtins;
use crate::builtins::net::SocketRegistry;
use crate::natives::{MethodTables, NativeFn, Natives};

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity: 256 slots per frame.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of executing one top-level program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    Ok,
    CompileError,
    RuntimeError,
    /// The value stack hit capacity; a process-level error.
    OverCapacity,
}

#[derive(Debug)]
pub(crate) enum VmError {
    Runtime(String),
    OverCapacity,
}

enum Step {
    Continue,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    function: ObjRef,
    ip: usize,
    /// Index into the value stack of this frame's local slot 0.
    slots: usize,
}

/// Where `io.print` and friends write.
pub enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

pub struct Vm {
    pub heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    /// `const` globals by name; writes are rejected at runtime too, so a
    /// REPL line cannot clobber a constant from an earlier line.
    const_global_names: HashSet<String>,
    namespaces: Table,
    pub(crate) natives: Natives,
    pub(crate) methods: MethodTables,
    /// Compilation state shared across REPL lines.
    pub ctx: CompileCtx,
    config: VmConfig,
    out: OutputSink,
    /// Last compile or runtime error message, for front-ends and tests.
    pub last_error: Option<String>,
    pub(crate) sockets: SocketRegistry,
    start_time: Instant,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        Self::with_output(config, OutputSink::Stdout)
    }

    /// A VM whose program output is captured in memory; used by tests.
    pub fn new_captured(config: VmConfig) -> Vm {
        Self::with_output(config, OutputSink::Buffer(Vec::new()))
    }

    fn with_output(config: VmConfig, out: OutputSink) -> Vm {
        let mut vm = Vm {
            heap: Heap::new(),
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            const_global_names: HashSet::new(),
            namespaces: Table::new(),
            natives: Natives::new(),
            methods: MethodTables::default(),
            ctx: CompileCtx::new(),
            config,
            out,
            last_error: None,
            sockets: SocketRegistry::default(),
            start_time: Instant::now(),
        };
        builtins::register_all(&mut vm);
        tracing::debug!(
            objects = vm.heap.object_count(),
            "VM initialized with builtin namespaces"
        );
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    // ---- program output ------------------------------------------------

    pub fn write_out(&mut self, text: &str) {
        match &mut self.out {
            OutputSink::Stdout => {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            OutputSink::Buffer(buffer) => buffer.extend_from_slice(text.as_bytes()),
        }
    }

    /// Drain captured output (empty for a stdout-backed VM).
    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Stdout => String::new(),
            OutputSink::Buffer(buffer) => {
                String::from_utf8_lossy(&std::mem::take(buffer)).into_owned()
            }
        }
    }

    // ---- globals and namespaces ----------------------------------------

    pub fn define_global(&mut self, name: &str, value: Value) {
        let key = self.heap.intern(name);
        let hash = self.heap.str_hash(key);
        self.globals.set(key, hash, value);
    }

    pub fn global_get(&self, name: ObjRef) -> Option<Value> {
        self.globals.get(name, self.heap.str_hash(name))
    }

    pub fn global_get_by_name(&mut self, name: &str) -> Option<Value> {
        let key = self.heap.intern(name);
        self.global_get(key)
    }

    pub fn register_namespace(&mut self, name: &str, namespace: ObjRef) {
        let key = self.heap.intern(name);
        let hash = self.heap.str_hash(key);
        self.namespaces.set(key, hash, Value::Obj(namespace));
    }

    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> NativeId {
        self.natives.register(name, func)
    }

    /// Register a native and bind it as a global function value.
    pub fn define_native_fn(&mut self, name: &'static str, func: NativeFn) {
        let id = self.natives.register(name, func);
        let obj = self.heap.new_native(id, name);
        self.define_global(name, Value::Obj(obj));
    }

    // ---- execution entry points ----------------------------------------

    /// Compile and run one source unit.
    pub fn interpret(&mut self, source: &str) -> ExecResult {
        self.last_error = None;
        let arena = Bump::new();
        let function = match compile(source, &mut self.heap, &mut self.ctx, &arena) {
            Ok(function) => function,
            Err(error) => {
                eprintln!("{}", error);
                self.last_error = Some(error.to_string());
                return ExecResult::CompileError;
            }
        };
        // Track const globals declared by this unit for runtime rejection.
        self.const_global_names
            .extend(self.ctx.const_globals.iter().cloned());
        self.execute_function(function)
    }

    /// Run an already-compiled script function.
    pub fn execute_function(&mut self, function: ObjRef) -> ExecResult {
        self.last_error = None;
        if self.push(Value::Obj(function)).is_err() {
            return ExecResult::OverCapacity;
        }
        if let Err(error) = self.call(function, 0) {
            return self.fail(error);
        }
        self.run()
    }

    fn run(&mut self) -> ExecResult {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => return ExecResult::Ok,
                Err(error) => return self.fail(error),
            }
        }
    }

    fn fail(&mut self, error: VmError) -> ExecResult {
        match error {
            VmError::Runtime(msg) => {
                self.runtime_error(&msg);
                ExecResult::RuntimeError
            }
            VmError::OverCapacity => {
                eprintln!("value stack over capacity");
                self.last_error = Some("value stack over capacity".to_string());
                self.reset_stack();
                ExecResult::OverCapacity
            }
        }
    }

    /// Report a runtime error with a stack trace, then reset both stacks
    /// so the VM can accept the next program.
    fn runtime_error(&mut self, msg: &str) {
        eprintln!("{}", msg);
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function
                .chunk
                .lines
                .get(instruction)
                .copied()
                .unwrap_or(0);
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.str_text(name)),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.last_error = Some(msg.to_string());
        self.reset_stack();
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
    }

    // ---- stack ---------------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= STACK_MAX {
            return Err(VmError::OverCapacity);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack
            .len()
            .checked_sub(1 + distance)
            .map(|i| self.stack[i])
            .unwrap_or(Value::Null)
    }

    // ---- instruction decoding ------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[idx]
    }

    fn read_string(&mut self) -> Result<ObjRef, VmError> {
        let value = self.read_constant();
        self.heap
            .as_str(value)
            .ok_or_else(|| VmError::Runtime("name constant is not a string".to_string()))
    }

    // ---- calls ---------------------------------------------------------

    fn call(&mut self, function: ObjRef, argc: usize) -> Result<(), VmError> {
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(VmError::Runtime(format!(
                "expected {} arguments but got {}",
                arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(VmError::Runtime("stack overflow".to_string()));
        }
        self.frames.push(CallFrame {
            function,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), VmError> {
        if let Value::Obj(r) = callee {
            match self.heap.get(r) {
                Obj::Function(_) => return self.call(r, argc),
                Obj::Native(native) => {
                    let id = native.native;
                    return self.call_native_plain(id, argc);
                }
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let callable = bound.callable;
                    // The receiver takes the callee's slot so it becomes
                    // local slot 0 of the invoked method.
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = receiver;
                    return match callable {
                        BoundCallable::Function(function) => self.call(function, argc),
                        BoundCallable::Native(id) => self.call_native_method(id, argc),
                    };
                }
                _ => {}
            }
        }
        Err(VmError::Runtime("can only call functions".to_string()))
    }

    fn call_native_raw(&mut self, id: NativeId, args: &[Value]) -> Result<Value, VmError> {
        let (_, func) = self
            .natives
            .get(id)
            .ok_or_else(|| VmError::Runtime("unknown native function".to_string()))?;
        func(self, args).map_err(VmError::Runtime)
    }

    /// Call a native in global style: `[..., callee, a1..aN]` becomes
    /// `[..., result]`; the callee is not passed as an argument.
    fn call_native_plain(&mut self, id: NativeId, argc: usize) -> Result<(), VmError> {
        let args_base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_base..].to_vec();
        let result = self.call_native_raw(id, &args)?;
        self.stack.truncate(args_base - 1);
        self.push(result)
    }

    /// Call a native in method style: the receiver below the arguments is
    /// passed as `args[0]`.
    fn call_native_method(&mut self, id: NativeId, argc: usize) -> Result<(), VmError> {
        let base = self.stack.len() - argc - 1;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = self.call_native_raw(id, &args)?;
        self.stack.truncate(base);
        self.push(result)
    }

    fn is_same_class_context(&self, target_class: ObjRef) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };
        match self.stack.get(frame.slots) {
            Some(Value::Obj(r)) => {
                matches!(self.heap.get(*r), Obj::Instance(i) if i.class == target_class)
            }
            _ => false,
        }
    }

    fn find_property(&self, class: ObjRef, name: ObjRef) -> Option<(usize, bool)> {
        self.heap
            .class(class)
            .properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| (p.index, p.is_private))
    }

    fn callable_of(&self, method: Value, name: &str) -> Result<BoundCallable, VmError> {
        match method {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Function(_) => Ok(BoundCallable::Function(r)),
                Obj::Native(n) => Ok(BoundCallable::Native(n.native)),
                _ => Err(VmError::Runtime(format!("'{}' is not callable", name))),
            },
            _ => Err(VmError::Runtime(format!("'{}' is not callable", name))),
        }
    }

    // ---- property and method dispatch ----------------------------------

    fn get_property(&mut self, name: ObjRef) -> Result<(), VmError> {
        let obj_val = self.peek(0);
        let name_text = self.heap.str_text(name).to_string();

        if let Value::Obj(r) = obj_val {
            if let Obj::Instance(instance) = self.heap.get(r) {
                let class = instance.class;
                // Declared properties first.
                if let Some((index, is_private)) = self.find_property(class, name) {
                    if is_private && !self.is_same_class_context(class) {
                        return Err(VmError::Runtime(format!(
                            "cannot access private property '{}'",
                            name_text
                        )));
                    }
                    let value = self.heap.instance(r).fields[index];
                    self.pop();
                    return self.push(value);
                }

                // Then methods: public table, then private.
                let hash = self.heap.str_hash(name);
                if let Some(method) = self.heap.class(class).methods.get(name, hash) {
                    let callable = self.callable_of(method, &name_text)?;
                    let receiver = self.pop();
                    let bound = self.heap.new_bound_method(receiver, callable, &name_text);
                    return self.push(Value::Obj(bound));
                }
                if let Some(method) = self.heap.class(class).private_methods.get(name, hash) {
                    if !self.is_same_class_context(class) {
                        return Err(VmError::Runtime(format!(
                            "cannot access private method '{}'",
                            name_text
                        )));
                    }
                    let callable = self.callable_of(method, &name_text)?;
                    let receiver = self.pop();
                    let bound = self.heap.new_bound_method(receiver, callable, &name_text);
                    return self.push(Value::Obj(bound));
                }

                return Err(VmError::Runtime(format!(
                    "undefined property '{}'",
                    name_text
                )));
            }

            if let Obj::Namespace(ns) = self.heap.get(r) {
                let ns_name = ns.name.clone();
                return match ns.get(&name_text) {
                    Some(value) => {
                        self.pop();
                        self.push(value)
                    }
                    None => Err(VmError::Runtime(format!(
                        "undefined property '{}' in namespace '{}'",
                        name_text, ns_name
                    ))),
                };
            }
        }

        // Built-in type method tables.
        if let Some(entry) = self.methods.lookup(&self.heap, obj_val, &name_text) {
            let receiver = self.pop();
            if entry.is_property {
                // Property entries are invoked immediately on read.
                let result = self.call_native_raw(entry.native, &[receiver])?;
                return self.push(result);
            }
            let bound = self.heap.new_bound_method(
                receiver,
                BoundCallable::Native(entry.native),
                &name_text,
            );
            return self.push(Value::Obj(bound));
        }

        Err(VmError::Runtime(format!(
            "undefined property '{}'",
            name_text
        )))
    }

    fn set_property(&mut self, name: ObjRef) -> Result<(), VmError> {
        let value = self.pop();
        let inst_val = self.peek(0);
        let name_text = self.heap.str_text(name).to_string();

        let Value::Obj(r) = inst_val else {
            return Err(VmError::Runtime(
                "only instances have properties".to_string(),
            ));
        };
        let Obj::Instance(instance) = self.heap.get(r) else {
            return Err(VmError::Runtime(
                "only instances have properties".to_string(),
            ));
        };
        let class = instance.class;

        let Some((index, is_private)) = self.find_property(class, name) else {
            return Err(VmError::Runtime(format!(
                "undefined property '{}'",
                name_text
            )));
        };
        if is_private && !self.is_same_class_context(class) {
            return Err(VmError::Runtime(format!(
                "cannot access private property '{}'",
                name_text
            )));
        }

        if let Obj::Instance(instance) = self.heap.get_mut(r) {
            instance.fields[index] = value;
        }

        // Assignment is an expression; the value replaces the instance.
        self.pop();
        self.push(value)
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), VmError> {
        let receiver = self.peek(argc);
        let name_text = self.heap.str_text(name).to_string();

        if let Value::Obj(r) = receiver {
            if let Obj::Instance(instance) = self.heap.get(r) {
                let class = instance.class;
                let hash = self.heap.str_hash(name);

                if let Some(method) = self.heap.class(class).methods.get(name, hash) {
                    return self.call_method_value(method, argc, &name_text);
                }
                if let Some(method) = self.heap.class(class).private_methods.get(name, hash) {
                    if !self.is_same_class_context(class) {
                        return Err(VmError::Runtime(format!(
                            "cannot access private method '{}'",
                            name_text
                        )));
                    }
                    return self.call_method_value(method, argc, &name_text);
                }
                return Err(VmError::Runtime(format!(
                    "undefined method '{}'",
                    name_text
                )));
            }

            if let Obj::Namespace(ns) = self.heap.get(r) {
                let ns_name = ns.name.clone();
                let Some(method_val) = ns.get(&name_text) else {
                    return Err(VmError::Runtime(format!(
                        "undefined method '{}' in namespace '{}'",
                        name_text, ns_name
                    )));
                };
                // The function takes the namespace's stack slot, restoring
                // the plain call convention.
                let base = self.stack.len() - argc - 1;
                self.stack[base] = method_val;
                return self.call_value(method_val, argc);
            }
        }

        if let Some(entry) = self.methods.lookup(&self.heap, receiver, &name_text) {
            return self.call_native_method(entry.native, argc);
        }

        Err(VmError::Runtime(format!(
            "undefined method '{}'",
            name_text
        )))
    }

    fn call_method_value(
        &mut self,
        method: Value,
        argc: usize,
        name: &str,
    ) -> Result<(), VmError> {
        match self.callable_of(method, name)? {
            BoundCallable::Function(function) => self.call(function, argc),
            BoundCallable::Native(id) => self.call_native_method(id, argc),
        }
    }

    // ---- numeric helpers -----------------------------------------------

    fn binary_number_op(
        &mut self,
        make: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), VmError> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(VmError::Runtime("operands must be numbers".to_string()));
        };
        self.pop();
        self.pop();
        self.push(make(a, b))
    }

    // ---- the interpreter loop ------------------------------------------

    fn step(&mut self) -> Result<Step, VmError> {
        let byte = self.read_byte();
        let Some(op) = OpCode::from_byte(byte) else {
            return Err(VmError::Runtime(format!("unknown instruction ({})", byte)));
        };
        tracing::trace!(op = op.name(), depth = self.stack.len(), "exec");

        match op {
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("return without active frame");
                if self.frames.is_empty() {
                    self.pop();
                    return Ok(Step::Done);
                }
                self.stack.truncate(frame.slots);
                self.push(result)?;
            }
            OpCode::Constant => {
                let constant = self.read_constant();
                self.push(constant)?;
            }
            OpCode::Null => self.push(Value::Null)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                let equal = self.heap.values_equal(a, b);
                self.push(Value::Bool(equal))?;
            }
            OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
            OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
            OpCode::Negate => {
                let Value::Number(n) = self.peek(0) else {
                    return Err(VmError::Runtime("operand must be a number".to_string()));
                };
                self.pop();
                self.push(Value::Number(-n))?;
            }
            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsy()))?;
            }
            OpCode::Add => {
                let b = self.peek(0);
                let a = self.peek(1);
                if let (Some(sa), Some(sb)) = (self.heap.as_str(a), self.heap.as_str(b)) {
                    let combined =
                        format!("{}{}", self.heap.str_text(sa), self.heap.str_text(sb));
                    self.pop();
                    self.pop();
                    let result = self.heap.intern(&combined);
                    self.push(Value::Obj(result))?;
                } else if let (Value::Number(x), Value::Number(y)) = (a, b) {
                    self.pop();
                    self.pop();
                    self.push(Value::Number(x + y))?;
                } else {
                    return Err(VmError::Runtime(
                        "operands must be of matching types".to_string(),
                    ));
                }
            }
            OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
            OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
            OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
            OpCode::Mod => self.binary_number_op(|a, b| Value::Number(a % b))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::DefineGlobal => {
                let name = self.read_string()?;
                let hash = self.heap.str_hash(name);
                let value = self.peek(0);
                self.globals.set(name, hash, value);
                self.pop();
            }
            OpCode::GetGlobal => {
                let name = self.read_string()?;
                match self.global_get(name) {
                    Some(value) => self.push(value)?,
                    None => {
                        return Err(VmError::Runtime(format!(
                            "undefined variable '{}'",
                            self.heap.str_text(name)
                        )));
                    }
                }
            }
            OpCode::SetGlobal => {
                let name = self.read_string()?;
                let text = self.heap.str_text(name).to_string();
                if self.const_global_names.contains(&text) {
                    return Err(VmError::Runtime(format!(
                        "cannot assign to constant variable '{}'",
                        text
                    )));
                }
                let hash = self.heap.str_hash(name);
                let value = self.peek(0);
                if self.globals.set(name, hash, value) {
                    self.globals.delete(name, hash);
                    return Err(VmError::Runtime(format!("undefined variable '{}'", text)));
                }
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().slots;
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let value = self.peek(0);
                let base = self.frame().slots;
                self.stack[base + slot] = value;
            }
            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().expect("no active call frame").ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_falsy() {
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().expect("no active call frame").ip -= offset;
            }
            OpCode::Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            OpCode::CallInit => {
                let argc = self.read_byte() as usize;
                self.call_init(argc)?;
            }
            OpCode::Invoke => {
                let name = self.read_string()?;
                let argc = self.read_byte() as usize;
                self.invoke(name, argc)?;
            }
            OpCode::GetProperty => {
                let name = self.read_string()?;
                self.get_property(name)?;
            }
            OpCode::SetProperty => {
                let name = self.read_string()?;
                self.set_property(name)?;
            }
            OpCode::IndexGet => self.index_get()?,
            OpCode::IndexSet => self.index_set()?,
            OpCode::ArrayNew => {
                let count = self.read_byte() as usize;
                let mut values = vec![Value::Null; count];
                for slot in values.iter_mut().rev() {
                    *slot = self.pop();
                }
                let array = self.heap.new_array(values);
                self.push(Value::Obj(array))?;
            }
            OpCode::ArrayLen => {
                let value = self.pop();
                let len = match value.as_obj().map(|r| self.heap.get(r)) {
                    Some(Obj::Array(a)) => a.values.len(),
                    Some(Obj::U8Array(a)) => a.values.len(),
                    _ => {
                        return Err(VmError::Runtime(
                            "can only get length of arrays".to_string(),
                        ));
                    }
                };
                self.push(Value::Number(len as f64))?;
            }
            OpCode::DictNew => {
                let dict = self.heap.new_dict();
                self.push(Value::Obj(dict))?;
            }
            OpCode::DictAdd => {
                let value = self.pop();
                let key = self.pop();
                let dict_val = self.peek(0);
                let Some(dict) = dict_val.as_obj() else {
                    return Err(VmError::Runtime("expected dictionary".to_string()));
                };
                self.dict_set(dict, key, value)?;
            }
            OpCode::Class => {
                let name = self.read_string()?;
                let class = self.heap.new_class(name);
                self.push(Value::Obj(class))?;
            }
            OpCode::Property => {
                let name = self.read_string()?;
                let is_private = self.read_byte() != 0;
                let default = self.pop();
                let class_val = self.peek(0);
                let class = match class_val.as_obj() {
                    Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                    _ => {
                        return Err(VmError::Runtime(
                            "can only add properties to classes".to_string(),
                        ));
                    }
                };
                let class_obj = self.heap.class_mut(class);
                let index = class_obj.properties.len();
                class_obj.properties.push(xen_core::PropertyDef {
                    name,
                    default,
                    is_private,
                    index,
                });
            }
            OpCode::Method => {
                let name = self.read_string()?;
                let is_private = self.read_byte() != 0;
                let method = self.pop();
                let class_val = self.peek(0);
                let Some(class) = class_val.as_obj() else {
                    return Err(VmError::Runtime(
                        "can only add methods to classes".to_string(),
                    ));
                };
                let hash = self.heap.str_hash(name);
                let class_obj = self.heap.class_mut(class);
                if is_private {
                    class_obj.private_methods.set(name, hash, method);
                } else {
                    class_obj.methods.set(name, hash, method);
                }
            }
            OpCode::Initializer => {
                let init = self.pop();
                let class_val = self.peek(0);
                let (Some(class), Some(init_fn)) = (class_val.as_obj(), init.as_obj()) else {
                    return Err(VmError::Runtime("malformed class initializer".to_string()));
                };
                self.heap.class_mut(class).initializer = Some(init_fn);
            }
            OpCode::Include => {
                let name = self.read_string()?;
                let hash = self.heap.str_hash(name);
                match self.namespaces.get(name, hash) {
                    Some(namespace) => {
                        self.globals.set(name, hash, namespace);
                    }
                    None => {
                        return Err(VmError::Runtime(format!(
                            "unknown namespace '{}'",
                            self.heap.str_text(name)
                        )));
                    }
                }
            }
            OpCode::IsType => {
                let name = self.read_string()?;
                let value = self.pop();
                let matches = self.type_matches(value, name)?;
                self.push(Value::Bool(matches))?;
            }
            OpCode::Cast => {
                let name = self.read_string()?;
                let value = self.pop();
                let result = self.cast_value(value, name)?;
                self.push(result)?;
            }
        }

        Ok(Step::Continue)
    }

    // ---- instantiation -------------------------------------------------

    fn call_init(&mut self, argc: usize) -> Result<(), VmError> {
        let class_val = self.peek(argc);
        let class = match class_val.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => {
                return Err(VmError::Runtime(
                    "can only instantiate classes".to_string(),
                ));
            }
        };

        let instance = self.heap.new_instance(class);
        let base = self.stack.len() - argc - 1;
        self.stack[base] = Value::Obj(instance);

        let (native_init, bytecode_init) = {
            let class_obj = self.heap.class(class);
            (class_obj.native_initializer, class_obj.initializer)
        };

        if let Some(id) = native_init {
            let args: Vec<Value> = self.stack[base..].to_vec();
            let result = self.call_native_raw(id, &args)?;
            self.stack.truncate(base + 1);
            let valid = result.is_null()
                || matches!(result, Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)));
            if !valid {
                let class_name = self.heap.str_text(self.heap.class(class).name).to_string();
                return Err(VmError::Runtime(format!(
                    "native initializer for class '{}' returned invalid type: {}",
                    class_name,
                    self.heap.type_id(result)
                )));
            }
        } else if let Some(init) = bytecode_init {
            self.call(init, argc)?;
        } else if argc != 0 {
            return Err(VmError::Runtime(format!(
                "expected 0 arguments but got {}",
                argc
            )));
        }
        Ok(())
    }

    // ---- indexing ------------------------------------------------------

    fn index_get(&mut self) -> Result<(), VmError> {
        let index = self.pop();
        let container = self.pop();

        let Some(r) = container.as_obj() else {
            return Err(VmError::Runtime(
                "can only index arrays and dictionaries".to_string(),
            ));
        };

        match self.heap.get(r) {
            Obj::Array(array) => {
                let Value::Number(n) = index else {
                    return Err(VmError::Runtime("array index must be a number".to_string()));
                };
                let idx = n as i64;
                if idx < 0 || idx as usize >= array.values.len() {
                    return Err(VmError::Runtime(format!(
                        "array index {} out of bounds (length {})",
                        idx,
                        array.values.len()
                    )));
                }
                let value = array.values[idx as usize];
                self.push(value)
            }
            Obj::U8Array(array) => {
                let Value::Number(n) = index else {
                    return Err(VmError::Runtime("array index must be a number".to_string()));
                };
                let idx = n as i64;
                if idx < 0 || idx as usize >= array.values.len() {
                    return Err(VmError::Runtime(format!(
                        "array index {} out of bounds (length {})",
                        idx,
                        array.values.len()
                    )));
                }
                let value = array.values[idx as usize];
                self.push(Value::Number(value as f64))
            }
            Obj::Dict(dict) => {
                let result = match self.heap.as_str(index) {
                    Some(key) => dict
                        .table
                        .get(key, self.heap.str_hash(key))
                        .unwrap_or(Value::Null),
                    None => Value::Null,
                };
                self.push(result)
            }
            Obj::Str(s) => {
                let Value::Number(n) = index else {
                    return Err(VmError::Runtime(
                        "string index must be a number".to_string(),
                    ));
                };
                let idx = n as i64;
                let text = &s.text;
                if idx < 0 || idx as usize >= text.len() {
                    return Err(VmError::Runtime(format!(
                        "character index {} out of bounds (length {})",
                        idx,
                        text.len()
                    )));
                }
                let ch = text[idx as usize..idx as usize + 1].to_string();
                let interned = self.heap.intern(&ch);
                self.push(Value::Obj(interned))
            }
            _ => Err(VmError::Runtime(
                "can only index arrays and dictionaries".to_string(),
            )),
        }
    }

    fn index_set(&mut self) -> Result<(), VmError> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();

        let Some(r) = container.as_obj() else {
            return Err(VmError::Runtime(
                "can only perform index assignments on arrays and dictionaries".to_string(),
            ));
        };

        match self.heap.get(r) {
            Obj::Array(array) => {
                let Value::Number(n) = index else {
                    return Err(VmError::Runtime("array index must be a number".to_string()));
                };
                let idx = n as i64;
                if idx < 0 || idx as usize >= array.values.len() {
                    return Err(VmError::Runtime(format!(
                        "array index {} out of bounds (length {})",
                        idx,
                        array.values.len()
                    )));
                }
                if let Obj::Array(array) = self.heap.get_mut(r) {
                    array.values[idx as usize] = value;
                }
            }
            Obj::U8Array(array) => {
                let Value::Number(n) = index else {
                    return Err(VmError::Runtime("array index must be a number".to_string()));
                };
                let idx = n as i64;
                if idx < 0 || idx as usize >= array.values.len() {
                    return Err(VmError::Runtime(format!(
                        "array index {} out of bounds (length {})",
                        idx,
                        array.values.len()
                    )));
                }
                let Value::Number(byte) = value else {
                    return Err(VmError::Runtime(
                        "u8array elements must be numbers".to_string(),
                    ));
                };
                if let Obj::U8Array(array) = self.heap.get_mut(r) {
                    array.values[idx as usize] = byte as u8;
                }
            }
            Obj::Dict(_) => {
                self.dict_set(r, index, value)?;
            }
            _ => {
                return Err(VmError::Runtime(
                    "can only perform index assignments on arrays and dictionaries".to_string(),
                ));
            }
        }

        // Assignment is an expression; the value stays on the stack.
        self.push(value)
    }

    pub(crate) fn dict_set(
        &mut self,
        dict: ObjRef,
        key: Value,
        value: Value,
    ) -> Result<(), VmError> {
        let Some(key) = self.heap.as_str(key) else {
            return Err(VmError::Runtime(
                "dictionary keys must be strings".to_string(),
            ));
        };
        let hash = self.heap.str_hash(key);
        if let Obj::Dict(d) = self.heap.get_mut(dict) {
            d.table.set(key, hash, value);
        }
        Ok(())
    }

    // ---- is / as -------------------------------------------------------

    fn type_matches(&self, value: Value, name: ObjRef) -> Result<bool, VmError> {
        let name_text = self.heap.str_text(name);
        if let Some(expected) = builtin_type_id(name_text) {
            return Ok(self.heap.type_id(value) == expected);
        }
        // A class global matches instances of exactly that class.
        if let Some(Value::Obj(class)) = self.global_get(name) {
            if matches!(self.heap.get(class), Obj::Class(_)) {
                return Ok(matches!(
                    value,
                    Value::Obj(v) if matches!(self.heap.get(v), Obj::Instance(i) if i.class == class)
                ));
            }
        }
        Err(VmError::Runtime(format!("unknown type '{}'", name_text)))
    }

    fn cast_value(&mut self, value: Value, name: ObjRef) -> Result<Value, VmError> {
        let name_text = self.heap.str_text(name).to_string();
        match name_text.as_str() {
            "Number" => match builtins::number_from_value(&self.heap, value) {
                Some(n) => Ok(Value::Number(n)),
                None => Err(VmError::Runtime(format!(
                    "cannot cast {} to 'Number'",
                    typeid::name(self.heap.type_id(value))
                ))),
            },
            "String" => {
                let text = self.heap.format_value(value);
                let interned = self.heap.intern(&text);
                Ok(Value::Obj(interned))
            }
            "Bool" => Ok(Value::Bool(builtins::bool_from_value(value))),
            _ => Err(VmError::Runtime(format!("cannot cast to '{}'", name_text))),
        }
    }
}

fn builtin_type_id(name: &str) -> Option<i32> {
    match name {
        "Bool" => Some(typeid::BOOL),
        "Null" => Some(typeid::NULL),
        "Number" => Some(typeid::NUMBER),
        "String" => Some(typeid::STRING),
        "Function" => Some(typeid::FUNCTION),
        "NativeFunction" => Some(typeid::NATIVE_FUNCTION),
        "Namespace" => Some(typeid::NAMESPACE),
        "Array" => Some(typeid::ARRAY),
        "BoundMethod" => Some(typeid::BOUND_METHOD),
        "Dictionary" => Some(typeid::DICT),
        "Class" => Some(typeid::CLASS),
        "Instance" => Some(typeid::INSTANCE),
        "UInt8Array" => Some(typeid::U8ARRAY),
        "Error" => Some(typeid::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Vm {
        Vm::new_captured(VmConfig::default())
    }

    #[test]
    fn test_vm_owns_all_state_and_is_send() {
        // Two VMs on two threads must be safe; nothing is process-global.
        fn assert_send<T: Send>() {}
        assert_send::<Vm>();
    }

    #[test]
    fn test_arithmetic_and_output() {
        let mut vm = vm();
        assert_eq!(vm.interpret("io.println(1 + 2 * 3);"), ExecResult::Ok);
        assert_eq!(vm.take_output(), "7\n");
    }

    #[test]
    fn test_stack_depth_restored_after_call() {
        let mut vm = vm();
        let result = vm.interpret("fn id(x) { return x; } id(1); id(2);");
        assert_eq!(result, ExecResult::Ok);
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        let mut vm = vm();
        assert_eq!(vm.interpret("missing;"), ExecResult::RuntimeError);
        assert!(vm.last_error.as_deref().unwrap().contains("undefined variable 'missing'"));
    }

    #[test]
    fn test_vm_recovers_after_runtime_error() {
        let mut vm = vm();
        assert_eq!(vm.interpret("missing;"), ExecResult::RuntimeError);
        assert_eq!(vm.interpret("io.println(1);"), ExecResult::Ok);
        assert_eq!(vm.take_output(), "1\n");
    }

    #[test]
    fn test_recursion_depth_limit() {
        let mut vm = vm();
        let result = vm.interpret("fn spin() { return spin(); } spin();");
        assert_eq!(result, ExecResult::RuntimeError);
        assert_eq!(vm.last_error.as_deref(), Some("stack overflow"));
    }

    #[test]
    fn test_arity_mismatch() {
        let mut vm = vm();
        let result = vm.interpret("fn two(a, b) { return a; } two(1);");
        assert_eq!(result, ExecResult::RuntimeError);
        assert!(vm
            .last_error
            .as_deref()
            .unwrap()
            .contains("expected 2 arguments but got 1"));
    }

    #[test]
    fn test_const_global_rejected_across_units() {
        let mut vm = vm();
        assert_eq!(vm.interpret("const limit = 10;"), ExecResult::Ok);
        // A later REPL line cannot assign it either.
        assert_eq!(vm.interpret("limit = 20;"), ExecResult::CompileError);
    }

    #[test]
    fn test_bound_method_is_first_class() {
        let mut vm = vm();
        let result = vm.interpret(
            "class Greeter { name = \"xen\"; fn get() => this.name; };\n\
             var g = new Greeter();\n\
             var m = g.get;\n\
             io.println(m());",
        );
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(vm.take_output(), "xen\n");
    }

    #[test]
    fn test_is_operator() {
        let mut vm = vm();
        let result = vm.interpret(
            "io.println(1 is Number); io.println(\"s\" is Number); io.println([1] is Array);",
        );
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(vm.take_output(), "true\nfalse\ntrue\n");
    }

    #[test]
    fn test_is_operator_on_class_instances() {
        let mut vm = vm();
        let result = vm.interpret(
            "class A { }; class B { };\n\
             var a = new A();\n\
             io.println(a is A); io.println(a is B);",
        );
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(vm.take_output(), "true\nfalse\n");
    }

    #[test]
    fn test_is_operator_on_callable_types() {
        let mut vm = vm();
        let result = vm.interpret(
            "include math;\n\
             io.println(math.sqrt is NativeFunction);\n\
             io.println(math.sqrt is BoundMethod);\n\
             var m = [1, 2].pop;\n\
             io.println(m is BoundMethod);\n\
             io.println(1 is NativeFunction);",
        );
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(vm.take_output(), "true\nfalse\ntrue\nfalse\n");
    }

    #[test]
    fn test_as_operator() {
        let mut vm = vm();
        let result =
            vm.interpret("io.println(\"5\" as Number); io.println(5 as String); io.println(0 as Bool);");
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(vm.take_output(), "5\n5\nfalse\n");
    }

    #[test]
    fn test_cast_failure() {
        let mut vm = vm();
        assert_eq!(vm.interpret("[1] as Number;"), ExecResult::RuntimeError);
        assert!(vm.last_error.as_deref().unwrap().contains("cannot cast"));
    }

    #[test]
    fn test_string_indexing() {
        let mut vm = vm();
        assert_eq!(vm.interpret("io.println(\"abc\"[1]);"), ExecResult::Ok);
        assert_eq!(vm.take_output(), "b\n");
    }

    #[test]
    fn test_array_index_out_of_bounds() {
        let mut vm = vm();
        assert_eq!(vm.interpret("[1, 2][5];"), ExecResult::RuntimeError);
        assert!(vm
            .last_error
            .as_deref()
            .unwrap()
            .contains("array index 5 out of bounds (length 2)"));
    }

    #[test]
    fn test_dict_non_string_key_rejected() {
        let mut vm = vm();
        assert_eq!(vm.interpret("var d = { \"a\": 1 }; d[1] = 2;"), ExecResult::RuntimeError);
        assert!(vm
            .last_error
            .as_deref()
            .unwrap()
            .contains("dictionary keys must be strings"));
    }

    #[test]
    fn test_native_initializer_classes() {
        fn point_init(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
            // args[0] is the fresh instance.
            let instance = args[0];
            let x = args.get(1).copied().unwrap_or(Value::Number(0.0));
            if let Value::Obj(r) = instance {
                if let Obj::Instance(i) = vm.heap.get_mut(r) {
                    i.fields[0] = x;
                }
            }
            Ok(Value::Null)
        }

        let mut vm = vm();
        let id = vm.register_native("point_init", point_init);
        let name = vm.heap.intern("Point");
        let class = vm.heap.new_class(name);
        let x_name = vm.heap.intern("x");
        vm.heap.class_mut(class).properties.push(xen_core::PropertyDef {
            name: x_name,
            default: Value::Number(0.0),
            is_private: false,
            index: 0,
        });
        vm.heap.class_mut(class).native_initializer = Some(id);
        vm.define_global("Point", Value::Obj(class));

        assert_eq!(
            vm.interpret("var p = new Point(7); io.println(p.x);"),
            ExecResult::Ok
        );
        assert_eq!(vm.take_output(), "7\n");
    }
}
