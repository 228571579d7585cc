//! Interactive REPL.
//!
//! Line editing and up/down history browsing come from rustyline with a
//! capped history; history persists under the user data directory. One VM
//! lives for the whole session, so globals, constants and includes carry
//! across lines. Compile and runtime errors are printed and the session
//! continues; only an over-capacity VM error aborts.

use std::path::PathBuf;

use rustyline::Config;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use xen_core::VmConfig;
use xen_runtime::{ExecResult, Vm};

use crate::ansi;
use crate::{exit_code, panic_exit};

const MAX_LINE_HISTORY: usize = 100;

pub fn run(config: VmConfig) {
    print_banner();
    tracing::debug!("starting REPL session");

    let mut vm = Vm::new(config);

    let editor_config = Config::builder()
        .max_history_size(MAX_LINE_HISTORY)
        .map(|b| b.build())
        .unwrap_or_default();
    let mut editor = match DefaultEditor::with_config(editor_config) {
        Ok(editor) => editor,
        Err(error) => panic_exit(
            exit_code::INVALID_ARGS,
            &format!("failed to initialize line editor: {}", error),
        ),
    };

    let history_path = history_file();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("=> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed == ".exit" {
                    break;
                }
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);

                // Errors were already reported; the REPL survives both
                // compile and runtime failures.
                if vm.interpret(&line) == ExecResult::OverCapacity {
                    panic_exit(exit_code::OVER_CAPACITY, "value stack over capacity");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("input error: {}", error);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }
}

fn print_banner() {
    println!(
        "{}{}Xen{} {} {}- Copyright (C) 2025 Jake Rieger{}",
        ansi::BOLD,
        ansi::BRIGHT_BLUE,
        ansi::RESET,
        env!("CARGO_PKG_VERSION"),
        ansi::DIM,
        ansi::RESET
    );
    println!(
        "{}Type {}{}.exit{}{} to quit the REPL.{}\n",
        ansi::ITALIC,
        ansi::RESET,
        ansi::BOLD,
        ansi::RESET,
        ansi::ITALIC,
        ansi::RESET
    );
}

fn history_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("xen").join("history"))
}
