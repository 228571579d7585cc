//! Xen CLI.
//!
//! One binary: run a source file, emit bytecode, print VM configuration,
//! or drop into the REPL when invoked with no file.

mod ansi;
mod repl;

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use clap::error::ErrorKind;
use xen_core::config::bytes_order_of_magnitude;
use xen_core::VmConfig;
use xen_runtime::{ExecResult, FRAMES_MAX, STACK_MAX, Vm};

/// Exit codes for abnormal termination.
pub mod exit_code {
    pub const ALLOCATION_FAILED: i32 = 101;
    pub const OVER_CAPACITY: i32 = 102;
    pub const EXEC_COMPILE: i32 = 103;
    pub const EXEC_RUNTIME: i32 = 104;
    pub const OPEN_FILE: i32 = 105;
    pub const EXPECTED_EXPRESSION: i32 = 106;
    pub const INVALID_ARGS: i32 = 107;

    pub fn name(code: i32) -> &'static str {
        match code {
            ALLOCATION_FAILED => "XEN_ERR_ALLOCATION_FAILED",
            OVER_CAPACITY => "XEN_ERR_OVER_CAPACITY",
            EXEC_COMPILE => "XEN_ERR_EXEC_COMPILE",
            EXEC_RUNTIME => "XEN_ERR_EXEC_RUNTIME",
            OPEN_FILE => "XEN_ERR_OPEN_FILE",
            EXPECTED_EXPRESSION => "XEN_ERR_EXPECTED_EXPRESSION",
            INVALID_ARGS => "XEN_ERR_INVALID_ARGS",
            _ => "UNKNOWN_ERROR",
        }
    }
}

/// Report a fatal error and terminate with a distinct exit code.
pub fn panic_exit(code: i32, msg: &str) -> ! {
    eprintln!("{}{}(panicked) {}{}", ansi::BOLD, ansi::RED, ansi::RESET, msg);
    eprintln!("exited with code {} ({})", code, exit_code::name(code));
    process::exit(code);
}

#[derive(Parser)]
#[command(name = "xen")]
#[command(about = "The Xen programming language", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Source file (.xen) to compile and execute, or bytecode (.xenb)
    file: Option<PathBuf>,

    /// Compile and serialize bytecode to this path instead of executing
    #[arg(long = "emit-bytecode", value_name = "OUT")]
    emit_bytecode: Option<PathBuf>,

    /// Print the VM memory-arena and stack configuration
    #[arg(long = "vm-config")]
    vm_config: bool,

    /// Print version and platform information
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// VM configuration file (TOML); defaults to ./xen.toml when present
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = error.print();
                return;
            }
            _ => {
                let _ = error.print();
                process::exit(exit_code::INVALID_ARGS);
            }
        },
    };

    if cli.version {
        print_version();
        return;
    }

    let config = load_config(cli.config.as_deref());

    if cli.vm_config {
        print_vm_config(&config);
        return;
    }

    match cli.file {
        None => repl::run(config),
        Some(file) => run_file(&file, cli.emit_bytecode.as_deref(), config),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("XEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> VmConfig {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from("xen.toml");
            if !default.exists() {
                return VmConfig::default();
            }
            default
        }
    };

    let Ok(text) = std::fs::read_to_string(&path) else {
        panic_exit(
            exit_code::OPEN_FILE,
            &format!("failed to open file: {}", path.display()),
        );
    };
    match VmConfig::from_toml(&text) {
        Ok(config) => config,
        Err(error) => panic_exit(exit_code::INVALID_ARGS, &error),
    }
}

fn print_version() {
    println!("version  : {}", env!("CARGO_PKG_VERSION"));
    println!(
        "platform : {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn print_vm_config(config: &VmConfig) {
    let (perm, perm_unit) = bytes_order_of_magnitude(config.mem_size_permanent);
    let (generation, gen_unit) = bytes_order_of_magnitude(config.mem_size_generation);
    let (temp, temp_unit) = bytes_order_of_magnitude(config.mem_size_temporary);
    let (stack, stack_unit) = bytes_order_of_magnitude(config.stack_size);

    println!("=== VM Configuration ===");
    println!("Memory (Perm) : {} {}", perm, perm_unit);
    println!("Memory (Gen)  : {} {}", generation, gen_unit);
    println!("Memory (Temp) : {} {}", temp, temp_unit);
    println!("Stack Size    : {} {}", stack, stack_unit);
    println!("Value Stack   : {} slots", STACK_MAX);
    println!("Call Frames   : {}", FRAMES_MAX);
}

/// What kind of input a file path names, by extension.
#[derive(Debug, PartialEq, Eq)]
enum FileKind {
    Source,
    Bytecode,
    NoExtension,
    Unknown,
}

fn classify_file(path: &Path) -> FileKind {
    match path.extension().and_then(|e| e.to_str()) {
        None => FileKind::NoExtension,
        Some("xen") => FileKind::Source,
        Some("xenb") | Some("xnb") => FileKind::Bytecode,
        Some(_) => FileKind::Unknown,
    }
}

fn run_file(path: &Path, emit_bytecode: Option<&Path>, config: VmConfig) {
    match classify_file(path) {
        FileKind::NoExtension => panic_exit(
            exit_code::INVALID_ARGS,
            "supplied filename is invalid (no extension)",
        ),
        FileKind::Unknown => panic_exit(
            exit_code::INVALID_ARGS,
            &format!("unrecognized file type: {}", path.display()),
        ),
        FileKind::Bytecode => {
            // Reserved: deserialize and execute.
            println!("Bytecode execution is not currently supported");
        }
        FileKind::Source => execute_source(path, emit_bytecode, config),
    }
}

fn execute_source(path: &Path, emit_bytecode: Option<&Path>, config: VmConfig) {
    let Ok(source) = std::fs::read_to_string(path) else {
        panic_exit(
            exit_code::OPEN_FILE,
            &format!("failed to open file: {}", path.display()),
        );
    };

    let mut vm = Vm::new(config);
    if let Some(parent) = path.parent() {
        vm.ctx.base_dir = parent.to_path_buf();
    }

    if let Some(out) = emit_bytecode {
        emit_bytecode_file(&mut vm, &source, out);
        return;
    }

    match vm.interpret(&source) {
        ExecResult::Ok => {}
        ExecResult::CompileError => {
            let expected_expression = vm
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("expected expression"));
            let code = if expected_expression {
                exit_code::EXPECTED_EXPRESSION
            } else {
                exit_code::EXEC_COMPILE
            };
            panic_exit(code, "failed to compile input");
        }
        ExecResult::RuntimeError => process::exit(exit_code::EXEC_RUNTIME),
        ExecResult::OverCapacity => process::exit(exit_code::OVER_CAPACITY),
    }
}

/// Compile and serialize without executing.
fn emit_bytecode_file(vm: &mut Vm, source: &str, out: &Path) {
    let arena = bumpalo::Bump::new();
    let function = match xen_compiler::compile(source, &mut vm.heap, &mut vm.ctx, &arena) {
        Ok(function) => function,
        Err(error) => {
            eprintln!("{}", error);
            panic_exit(exit_code::EXEC_COMPILE, "failed to compile input");
        }
    };

    let bytes = match xen_compiler::encode(&vm.heap, function) {
        Ok(bytes) => bytes,
        Err(error) => panic_exit(exit_code::EXEC_COMPILE, &error.to_string()),
    };

    if std::fs::write(out, &bytes).is_err() {
        panic_exit(
            exit_code::OPEN_FILE,
            &format!("failed to write file: {}", out.display()),
        );
    }
    println!("Wrote bytecode to {}", out.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_file() {
        assert_eq!(classify_file(Path::new("prog.xen")), FileKind::Source);
        assert_eq!(classify_file(Path::new("prog.xenb")), FileKind::Bytecode);
        assert_eq!(classify_file(Path::new("prog.xnb")), FileKind::Bytecode);
        assert_eq!(classify_file(Path::new("prog")), FileKind::NoExtension);
        assert_eq!(classify_file(Path::new("prog.txt")), FileKind::Unknown);
    }

    #[test]
    fn test_cli_parses_file_and_emit() {
        let cli = Cli::try_parse_from(["xen", "prog.xen", "--emit-bytecode", "out.xenb"]).unwrap();
        assert_eq!(cli.file.as_deref(), Some(Path::new("prog.xen")));
        assert_eq!(cli.emit_bytecode.as_deref(), Some(Path::new("out.xenb")));
        assert!(!cli.vm_config);
    }

    #[test]
    fn test_cli_parses_flags_without_file() {
        let cli = Cli::try_parse_from(["xen", "--vm-config"]).unwrap();
        assert!(cli.vm_config);
        assert!(cli.file.is_none());

        let cli = Cli::try_parse_from(["xen", "-v"]).unwrap();
        assert!(cli.version);
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["xen", "--frobnicate"]).is_err());
    }

    #[test]
    fn test_emit_bytecode_writes_decodable_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.xenb");
        let mut vm = Vm::new(VmConfig::default());
        emit_bytecode_file(&mut vm, "var x = 1 + 2;", &out);

        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..4], b"XENB");
        let decoded = xen_compiler::decode(&mut vm.heap, &bytes).unwrap();
        assert_eq!(vm.heap.function(decoded).arity, 0);
    }

    #[test]
    fn test_exit_code_names() {
        assert_eq!(exit_code::name(103), "XEN_ERR_EXEC_COMPILE");
        assert_eq!(exit_code::name(101), "XEN_ERR_ALLOCATION_FAILED");
        assert_eq!(exit_code::name(106), "XEN_ERR_EXPECTED_EXPRESSION");
        assert_eq!(exit_code::name(1), "UNKNOWN_ERROR");
    }
}
