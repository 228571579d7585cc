//! Xen runtime library.
//!
//! The stack-based virtual machine that executes compiled chunks, the
//! native-function registry, and the builtin standard library namespaces.
//!
//! ```rust,ignore
//! use xen_core::VmConfig;
//! use xen_runtime::{ExecResult, Vm};
//!
//! let mut vm = Vm::new(VmConfig::default());
//! assert_eq!(vm.interpret("include math; io.println(math.sqrt(16));"), ExecResult::Ok);
//! ```

pub mod builtins;
pub mod natives;
pub mod vm;

pub use natives::{MethodEntry, NativeDef, NativeFn};
pub use vm::{ExecResult, FRAMES_MAX, OutputSink, STACK_MAX, Vm};
