//! Single-pass bytecode compiler.
//!
//! Pratt precedence parsing over the scanner's token stream, emitting
//! bytecode directly into per-function chunks — there is no AST. Locals
//! resolve to stack slots, globals by interned name, and forward jumps are
//! backpatched as 16-bit big-endian offsets.
//!
//! Slot 0 of every function is reserved: methods and initializers keep
//! `this` there, plain functions keep the callee itself (which is what the
//! VM's call convention puts in that position).
//!
//! On a syntax error the compiler records the message, enters panic mode
//! and resynchronizes at the next declaration boundary; a unit with any
//! error yields no function.

use std::collections::HashSet;
use std::path::PathBuf;

use bumpalo::Bump;
use xen_core::{Chunk, FunctionObj, Heap, ObjRef, OpCode, Value};

use crate::disasm::disassemble_chunk;
use crate::scanner::{Scanner, Token, TokenKind};

/// Locals are addressed by a single operand byte.
const MAX_LOCALS: usize = 256;
/// Constant pool indices are a single operand byte.
const MAX_CONSTANTS: usize = 256;
/// Declared parameter limit.
const MAX_ARITY: usize = 255;

/// Compilation state that outlives a single unit: which globals were
/// declared `const`, and which files have already been included (the
/// include-cycle guard). A REPL threads one of these through every line.
#[derive(Debug, Default)]
pub struct CompileCtx {
    pub const_globals: HashSet<String>,
    pub included_paths: HashSet<PathBuf>,
    /// Directory that relative include paths resolve against.
    pub base_dir: PathBuf,
}

impl CompileCtx {
    pub fn new() -> Self {
        CompileCtx::default()
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        CompileCtx {
            base_dir,
            ..CompileCtx::default()
        }
    }
}

/// All diagnostics from one failed unit, in source order.
#[derive(Debug)]
pub struct CompileError {
    pub errors: Vec<String>,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Compile a source unit into a top-level script function.
///
/// `arena` owns the text of any files pulled in by `include "...";` so the
/// scanner can borrow them for the rest of the compilation.
pub fn compile<'src>(
    source: &'src str,
    heap: &mut Heap,
    ctx: &mut CompileCtx,
    arena: &'src Bump,
) -> Result<ObjRef, CompileError> {
    Compiler::new(source, heap, ctx, arena).run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_const: bool,
}

/// Per-function compilation state.
struct FnState<'src> {
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
}

impl<'src> FnState<'src> {
    fn new(name: Option<ObjRef>, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the callee ('this' inside methods).
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_const: false,
        };
        FnState {
            function: FunctionObj {
                arity: 0,
                name,
                chunk: Chunk::new(),
            },
            kind,
            locals: vec![slot_zero],
            scope_depth: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >= is as
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Postfix,    // ++ --
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Postfix,
            Postfix => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'a> = fn(&mut Compiler<'src, 'a>, bool);

struct ParseRule<'src, 'a> {
    prefix: Option<ParseFn<'src, 'a>>,
    infix: Option<ParseFn<'src, 'a>>,
    precedence: Precedence,
}

struct Compiler<'src, 'a> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    heap: &'a mut Heap,
    ctx: &'a mut CompileCtx,
    arena: &'src Bump,
    states: Vec<FnState<'src>>,
}

impl<'src, 'a> Compiler<'src, 'a> {
    fn new(
        source: &'src str,
        heap: &'a mut Heap,
        ctx: &'a mut CompileCtx,
        arena: &'src Bump,
    ) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Compiler {
            scanner: Scanner::new(source),
            previous: placeholder,
            current: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            ctx,
            arena,
            states: vec![FnState::new(None, FunctionKind::Script)],
        }
    }

    fn run(mut self) -> Result<ObjRef, CompileError> {
        self.advance();
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.emit_return();

        if self.had_error {
            return Err(CompileError {
                errors: self.errors,
            });
        }

        let state = self
            .states
            .pop()
            .expect("compiler state stack is never empty");
        tracing::debug!(
            "\n{}",
            disassemble_chunk(self.heap, &state.function.chunk, "<script>")
        );
        Ok(self.heap.new_function(state.function))
    }

    // ---- token plumbing ------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.emit();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current_raw(&msg);
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(msg);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- error reporting -----------------------------------------------

    fn error_at(&mut self, token: Token<'src>, msg: &str, is_error_token: bool) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let formatted = if token.kind == TokenKind::Eof {
            format!("[line {}] error at end: {}", token.line, msg)
        } else if is_error_token {
            format!("[line {}] error: {}", token.line, msg)
        } else {
            format!("[line {}] error at '{}': {}", token.line, token.lexeme, msg)
        };
        self.errors.push(formatted);
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg, false);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg, false);
    }

    fn error_at_current_raw(&mut self, msg: &str) {
        self.error_at(self.current, msg, true);
    }

    /// Skip tokens until a declaration boundary so one mistake doesn't
    /// cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Const
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Include => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emission ------------------------------------------------------

    fn state(&mut self) -> &mut FnState<'src> {
        self.states
            .last_mut()
            .expect("compiler state stack is never empty")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.current_chunk().constants.len() >= MAX_CONSTANTS {
            self.error("too many constants in one chunk");
            return 0;
        }
        self.current_chunk().add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    fn code_len(&mut self) -> usize {
        self.current_chunk().code.len()
    }

    /// Emit a forward jump with a placeholder operand; returns the operand
    /// offset for [`Self::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("too much code to jump over");
        }
        self.current_chunk().code[offset] = (jump >> 8) as u8;
        self.current_chunk().code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    // ---- scopes and locals ---------------------------------------------

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.state();
            let depth = state.scope_depth;
            if !state.locals.last().is_some_and(|local| local.depth > depth) {
                break;
            }
            self.state().locals.pop();
            self.emit_op(OpCode::Pop);
        }
    }

    fn add_local(&mut self, name: &'src str, is_const: bool) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        self.state().locals.push(Local {
            name,
            depth: -1,
            is_const,
        });
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Declare (and immediately initialize) a loop bookkeeping local whose
    /// value was just pushed onto the stack.
    fn add_loop_local(&mut self, name: &'src str) -> u8 {
        self.add_local(name, false);
        self.mark_initialized();
        (self.state().locals.len() - 1) as u8
    }

    fn resolve_local(&mut self, name: &str) -> Option<(u8, bool)> {
        let mut uninitialized = false;
        let mut found = None;
        {
            let state = self
                .states
                .last()
                .expect("compiler state stack is never empty");
            for (slot, local) in state.locals.iter().enumerate().rev() {
                if local.name == name {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = Some((slot as u8, local.is_const));
                    break;
                }
            }
        }
        if uninitialized {
            self.error("cannot read local variable in its own initializer");
        }
        found
    }

    fn declare_variable(&mut self, is_const: bool) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self
            .states
            .last()
            .expect("compiler state stack is never empty");
        let mut shadowed = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                shadowed = true;
                break;
            }
        }
        if shadowed {
            self.error(&format!(
                "a variable named '{}' already exists in this scope",
                name
            ));
        }
        self.add_local(name, is_const);
    }

    fn parse_variable(&mut self, msg: &str, is_const: bool) -> u8 {
        self.consume(TokenKind::Identifier, msg);
        self.declare_variable(is_const);
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8, name: &str, is_const: bool) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
        if is_const {
            self.ctx.const_globals.insert(name.to_string());
        }
    }

    // ---- declarations --------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Const) {
            self.var_declaration(true);
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Include) {
            self.include_statement();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        let global = self.parse_variable("expected variable name", is_const);
        let name = self.previous.lexeme;

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Null);
        }
        self.consume(
            TokenKind::Semicolon,
            "expected ';' after variable declaration",
        );
        self.define_variable(global, name, is_const);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("expected function name", false);
        let name = self.previous.lexeme;
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        self.function(FunctionKind::Function, name);
        self.define_variable(global, name, false);
    }

    /// Compile a function body into its own chunk and emit the resulting
    /// function object as a constant in the enclosing chunk.
    fn function(&mut self, kind: FunctionKind, name: &str) {
        let name_ref = self.heap.intern(name);
        self.states.push(FnState::new(Some(name_ref), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().function.arity >= MAX_ARITY {
                    self.error_at_current("cannot have more than 255 parameters");
                }
                self.state().function.arity += 1;
                let param = self.parse_variable("expected parameter name", false);
                let param_name = self.previous.lexeme;
                self.define_variable(param, param_name, false);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");

        if self.matches(TokenKind::Arrow) {
            // Arrow form returns its expression implicitly.
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after expression");
            self.emit_op(OpCode::Return);
        } else {
            self.consume(TokenKind::LeftBrace, "expected '{' before function body");
            self.block();
            self.emit_return();
        }

        let state = self
            .states
            .pop()
            .expect("function state pushed at function start");
        tracing::debug!(
            "\n{}",
            disassemble_chunk(self.heap, &state.function.chunk, name)
        );
        let function = self.heap.new_function(state.function);
        self.emit_constant(Value::Obj(function));
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        self.declare_variable(false);

        self.emit_bytes(OpCode::Class as u8, name_idx);
        self.define_variable(name_idx, name, false);

        // Push the class back so member opcodes can mutate it.
        self.named_variable(name, false);

        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let is_private = self.matches(TokenKind::Private);
            if self.matches(TokenKind::Fn) {
                self.method(is_private);
            } else if self.matches(TokenKind::Init) {
                if is_private {
                    self.error("initializer cannot be private");
                }
                self.initializer();
            } else {
                self.property(is_private);
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Semicolon, "expected ';' after class declaration");
    }

    fn method(&mut self, is_private: bool) {
        self.consume(TokenKind::Identifier, "expected method name");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        self.function(FunctionKind::Method, name);
        self.emit_bytes(OpCode::Method as u8, name_idx);
        self.emit_byte(is_private as u8);
    }

    fn initializer(&mut self) {
        self.function(FunctionKind::Initializer, "init");
        self.emit_op(OpCode::Initializer);
    }

    fn property(&mut self, is_private: bool) {
        self.consume(TokenKind::Identifier, "expected property name");
        let name_idx = self.identifier_constant(self.previous.lexeme);
        self.consume(TokenKind::Equal, "expected '=' after property name");
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after property default");
        self.emit_bytes(OpCode::Property as u8, name_idx);
        self.emit_byte(is_private as u8);
    }

    fn include_statement(&mut self) {
        if self.matches(TokenKind::Str) {
            let raw = self.previous.lexeme;
            let path = decode_string_literal(&raw[1..raw.len() - 1]);
            self.consume(TokenKind::Semicolon, "expected ';' after include");
            self.include_file(&path);
        } else {
            self.consume(TokenKind::Identifier, "expected namespace name");
            let name_idx = self.identifier_constant(self.previous.lexeme);
            self.consume(TokenKind::Semicolon, "expected ';' after include");
            self.emit_bytes(OpCode::Include as u8, name_idx);
        }
    }

    /// Compile another source file inline at global scope: the current
    /// scanner is parked, the included text (owned by the arena) is scanned
    /// to completion, then the original cursors are restored.
    fn include_file(&mut self, path: &str) {
        if self.states.len() > 1 || self.state().scope_depth > 0 {
            self.error("include is only allowed at top level");
            return;
        }

        let full_path = self.ctx.base_dir.join(path);
        if !self.ctx.included_paths.insert(full_path.clone()) {
            // Already included once; re-including is a no-op.
            return;
        }

        let contents = match std::fs::read_to_string(&full_path) {
            Ok(text) => text,
            Err(_) => {
                self.error(&format!(
                    "failed to open include file '{}'",
                    full_path.display()
                ));
                return;
            }
        };
        let text: &'src str = self.arena.alloc_str(&contents);

        let saved_scanner = std::mem::replace(&mut self.scanner, Scanner::new(text));
        let saved_previous = self.previous;
        let saved_current = self.current;

        self.advance();
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }

        self.scanner = saved_scanner;
        self.previous = saved_previous;
        self.current = saved_current;
    }

    // ---- statements ----------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// Three shapes, dispatched by two-token lookahead after `(`:
    /// C-style `(init; cond; incr)`, numeric range `(var i in A..B)`, and
    /// array iteration `(var x in arr)`.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.check(TokenKind::Var) && self.lookahead_is_for_in() {
            self.for_in_statement();
        } else {
            self.for_c_statement();
        }
        self.end_scope();
    }

    fn lookahead_is_for_in(&mut self) -> bool {
        let state = self.scanner.save_state();
        let previous = self.previous;
        let current = self.current;

        self.advance(); // var
        self.advance(); // name
        let is_in = self.current.kind == TokenKind::In;

        self.scanner.restore_state(state);
        self.previous = previous;
        self.current = current;
        is_in
    }

    fn for_in_statement(&mut self) {
        self.advance(); // var
        self.consume(TokenKind::Identifier, "expected variable name");
        let var_name = self.previous.lexeme;
        self.consume(TokenKind::In, "expected 'in'");
        self.expression();

        if self.matches(TokenKind::DotDot) {
            // Numeric range: the first expression is the loop variable's
            // initial value, the second is the exclusive upper bound.
            let i_slot = self.add_loop_local(var_name);
            self.expression();
            let end_slot = self.add_loop_local("__end");
            self.consume(TokenKind::RightParen, "expected ')' after range");

            let loop_start = self.code_len();
            self.emit_bytes(OpCode::GetLocal as u8, i_slot);
            self.emit_bytes(OpCode::GetLocal as u8, end_slot);
            self.emit_op(OpCode::Less);
            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);

            self.statement();

            self.emit_bytes(OpCode::GetLocal as u8, i_slot);
            self.emit_constant(Value::Number(1.0));
            self.emit_op(OpCode::Add);
            self.emit_bytes(OpCode::SetLocal as u8, i_slot);
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);

            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        } else {
            // Array iteration over hidden array/length/index locals.
            let arr_slot = self.add_loop_local("__arr");
            self.emit_bytes(OpCode::GetLocal as u8, arr_slot);
            self.emit_op(OpCode::ArrayLen);
            let len_slot = self.add_loop_local("__len");
            self.emit_constant(Value::Number(0.0));
            let idx_slot = self.add_loop_local("__i");
            self.consume(TokenKind::RightParen, "expected ')' after expression");

            let loop_start = self.code_len();
            self.emit_bytes(OpCode::GetLocal as u8, idx_slot);
            self.emit_bytes(OpCode::GetLocal as u8, len_slot);
            self.emit_op(OpCode::Less);
            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);

            // Fresh element local each iteration.
            self.emit_bytes(OpCode::GetLocal as u8, arr_slot);
            self.emit_bytes(OpCode::GetLocal as u8, idx_slot);
            self.emit_op(OpCode::IndexGet);
            self.add_loop_local(var_name);

            self.statement();

            self.state().locals.pop();
            self.emit_op(OpCode::Pop);

            self.emit_bytes(OpCode::GetLocal as u8, idx_slot);
            self.emit_constant(Value::Number(1.0));
            self.emit_op(OpCode::Add);
            self.emit_bytes(OpCode::SetLocal as u8, idx_slot);
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);

            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
    }

    fn for_c_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // The body runs before the increment, so jump over the
            // increment code and loop back to it afterwards.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("cannot return from top-level code");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("cannot return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- expressions ---------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("expected expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let decoded = decode_string_literal(&raw[1..raw.len() - 1]);
        let interned = self.heap.intern(&decoded);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Null => self.emit_op(OpCode::Null),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let precedence = get_rule(op).precedence;
        self.parse_precedence(precedence.one_higher());

        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Mod),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// Short-circuit `and`: if the left side is falsy it stays on the
    /// stack as the result.
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let (get_op, set_op, arg, is_const) = match self.resolve_local(name) {
            Some((slot, is_const)) => (OpCode::GetLocal, OpCode::SetLocal, slot, is_const),
            None => {
                let idx = self.identifier_constant(name);
                let is_const = self.ctx.const_globals.contains(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, idx, is_const)
            }
        };

        if can_assign && self.matches(TokenKind::Equal) {
            if is_const {
                self.error(&format!("cannot assign to constant variable '{}'", name));
                // Parse the right-hand side anyway; the unit has already
                // failed, and skipping it keeps the parser in sync.
                self.expression();
                return;
            }
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else if can_assign && let Some(op) = compound_op(self.current.kind) {
            self.advance();
            if is_const {
                self.error(&format!("cannot assign to constant variable '{}'", name));
                self.expression();
                return;
            }
            self.emit_bytes(get_op as u8, arg);
            self.expression();
            self.emit_op(op);
            self.emit_bytes(set_op as u8, arg);
        } else if self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus) {
            self.advance();
            let op = if self.previous.kind == TokenKind::PlusPlus {
                OpCode::Add
            } else {
                OpCode::Subtract
            };
            if is_const {
                self.error(&format!("cannot modify constant variable '{}'", name));
                return;
            }
            // Postfix: the expression's value is the value before the
            // increment, so read it twice and drop the written value.
            self.emit_bytes(get_op as u8, arg);
            self.emit_bytes(get_op as u8, arg);
            self.emit_constant(Value::Number(1.0));
            self.emit_op(op);
            self.emit_bytes(set_op as u8, arg);
            self.emit_op(OpCode::Pop);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if !matches!(
            self.state().kind,
            FunctionKind::Method | FunctionKind::Initializer
        ) {
            self.error("cannot use 'this' outside of a class");
            return;
        }
        self.emit_bytes(OpCode::GetLocal as u8, 0);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("cannot have more than 255 arguments");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name_idx = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, name_idx);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name_idx);
            self.emit_byte(argc);
        } else if compound_op(self.current.kind).is_some()
            || self.check(TokenKind::PlusPlus)
            || self.check(TokenKind::MinusMinus)
        {
            self.error_at_current("compound assignment target must be a named variable");
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name_idx);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::IndexSet);
        } else if compound_op(self.current.kind).is_some()
            || self.check(TokenKind::PlusPlus)
            || self.check(TokenKind::MinusMinus)
        {
            self.error_at_current("compound assignment target must be a named variable");
        } else {
            self.emit_op(OpCode::IndexGet);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("array literal is limited to 255 elements");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
        self.emit_bytes(OpCode::ArrayNew as u8, count as u8);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::DictNew);
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after dictionary key");
                self.expression();
                self.emit_op(OpCode::DictAdd);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after dictionary entries");
    }

    fn new_instance(&mut self, _can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected class name after 'new'");
        let name = self.previous.lexeme;
        self.named_variable(name, false);
        while self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected class name after '.'");
            let idx = self.identifier_constant(self.previous.lexeme);
            self.emit_bytes(OpCode::GetProperty as u8, idx);
        }
        self.consume(TokenKind::LeftParen, "expected '(' after class name");
        let argc = self.argument_list();
        self.emit_bytes(OpCode::CallInit as u8, argc);
    }

    /// `value is T` / `value as T` — `T` names a type (a builtin type
    /// constructor or a class global).
    fn type_test(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.consume(TokenKind::Identifier, "expected type name");
        let name_idx = self.identifier_constant(self.previous.lexeme);
        match op {
            TokenKind::Is => self.emit_bytes(OpCode::IsType as u8, name_idx),
            TokenKind::As => self.emit_bytes(OpCode::Cast as u8, name_idx),
            _ => unreachable!("type test rule on non-is/as token"),
        }
    }
}

/// The opcode a compound-assignment token lowers to, if any.
fn compound_op(kind: TokenKind) -> Option<OpCode> {
    match kind {
        TokenKind::PlusEqual => Some(OpCode::Add),
        TokenKind::MinusEqual => Some(OpCode::Subtract),
        TokenKind::StarEqual => Some(OpCode::Multiply),
        TokenKind::SlashEqual => Some(OpCode::Divide),
        TokenKind::PercentEqual => Some(OpCode::Mod),
        _ => None,
    }
}

fn get_rule<'src, 'a>(kind: TokenKind) -> ParseRule<'src, 'a> {
    use TokenKind::*;

    fn rule<'src, 'a>(
        prefix: Option<ParseFn<'src, 'a>>,
        infix: Option<ParseFn<'src, 'a>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'a> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        LeftParen => rule(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBrace => rule(Some(Compiler::dict_literal), None, Precedence::None),
        LeftBracket => rule(
            Some(Compiler::array_literal),
            Some(Compiler::index),
            Precedence::Call,
        ),
        Dot => rule(None, Some(Compiler::dot), Precedence::Call),
        Minus => rule(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => rule(None, Some(Compiler::binary), Precedence::Term),
        Slash | Star | Percent => rule(None, Some(Compiler::binary), Precedence::Factor),
        Bang => rule(Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => rule(None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(Compiler::binary), Precedence::Comparison)
        }
        Is | As => rule(None, Some(Compiler::type_test), Precedence::Comparison),
        Identifier => rule(Some(Compiler::variable), None, Precedence::None),
        Str => rule(Some(Compiler::string), None, Precedence::None),
        Number => rule(Some(Compiler::number), None, Precedence::None),
        And => rule(None, Some(Compiler::and_), Precedence::And),
        Or => rule(None, Some(Compiler::or_), Precedence::Or),
        True | False | Null => rule(Some(Compiler::literal), None, Precedence::None),
        This => rule(Some(Compiler::this_), None, Precedence::None),
        New => rule(Some(Compiler::new_instance), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

/// Decode the escape sequences of a string literal body.
fn decode_string_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_str(source: &str) -> Result<(Heap, ObjRef), CompileError> {
        let mut heap = Heap::new();
        let mut ctx = CompileCtx::new();
        let arena = Bump::new();
        let function = compile(source, &mut heap, &mut ctx, &arena)?;
        Ok((heap, function))
    }

    fn ops(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = &heap.function(function).chunk;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("valid opcode");
            out.push(op);
            offset += 1 + operand_width(op);
        }
        out
    }

    fn operand_width(op: OpCode) -> usize {
        use OpCode::*;
        match op {
            Constant | DefineGlobal | GetGlobal | SetGlobal | GetLocal | SetLocal | Call
            | CallInit | GetProperty | SetProperty | ArrayNew | Class | Include | IsType
            | Cast => 1,
            Jump | JumpIfFalse | Loop | Property | Method => 2,
            Invoke => 2,
            _ => 0,
        }
    }

    #[test]
    fn test_expression_statement_pops() {
        let (heap, function) = compile_str("1 + 2;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, Constant, Add, Pop, Null, Return]
        );
    }

    #[test]
    fn test_var_declaration_defines_global() {
        let (heap, function) = compile_str("var x = 1;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, DefineGlobal, Null, Return]
        );
    }

    #[test]
    fn test_uninitialized_var_defaults_null() {
        let (heap, function) = compile_str("var x;").unwrap();
        use OpCode::*;
        assert_eq!(ops(&heap, function), vec![Null, DefineGlobal, Null, Return]);
    }

    #[test]
    fn test_compound_assignment_lowering() {
        let (heap, function) = compile_str("var x = 1; x += 2;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![
                Constant, DefineGlobal, GetGlobal, Constant, Add, SetGlobal, Pop, Null, Return
            ]
        );
    }

    #[test]
    fn test_postfix_increment_yields_old_value() {
        let (heap, function) = compile_str("var x = 1; x++;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![
                Constant, DefineGlobal, GetGlobal, GetGlobal, Constant, Add, SetGlobal, Pop,
                Pop, Null, Return
            ]
        );
    }

    #[test]
    fn test_if_else_jump_targets() {
        let (heap, function) = compile_str("if (true) 1; else 2;").unwrap();
        let chunk = &heap.function(function).chunk;
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![
                True, JumpIfFalse, Pop, Constant, Pop, Jump, Pop, Constant, Pop, Null, Return
            ]
        );
        // JumpIfFalse at offset 1 must land exactly on the else-side Pop.
        let jump = ((chunk.code[2] as usize) << 8) | chunk.code[3] as usize;
        let target = 4 + jump;
        assert_eq!(OpCode::from_byte(chunk.code[target]), Some(Pop));
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let (heap, function) = compile_str("while (false) 1;").unwrap();
        let chunk = &heap.function(function).chunk;
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![False, JumpIfFalse, Pop, Constant, Pop, Loop, Pop, Null, Return]
        );
        // The Loop operand must land back on offset 0 (the condition).
        let loop_offset = chunk
            .code
            .iter()
            .position(|&b| b == Loop as u8)
            .expect("loop emitted");
        let jump =
            ((chunk.code[loop_offset + 1] as usize) << 8) | chunk.code[loop_offset + 2] as usize;
        assert_eq!(loop_offset + 3 - jump, 0);
    }

    #[test]
    fn test_and_short_circuits() {
        let (heap, function) = compile_str("true and false;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![True, JumpIfFalse, Pop, False, Pop, Null, Return]
        );
    }

    #[test]
    fn test_or_short_circuits() {
        let (heap, function) = compile_str("true or false;").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![True, JumpIfFalse, Jump, Pop, False, Pop, Null, Return]
        );
    }

    #[test]
    fn test_fn_declaration_emits_constant() {
        let (heap, function) = compile_str("fn add(a, b) { return a + b; }").unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![Constant, DefineGlobal, Null, Return]
        );
        // The function constant has arity 2 and its own chunk.
        let chunk = &heap.function(function).chunk;
        let inner = chunk.constants[0];
        let inner_ref = inner.as_obj().expect("function constant");
        let inner_fn = heap.function(inner_ref);
        assert_eq!(inner_fn.arity, 2);
        assert_eq!(
            ops(&heap, inner_ref),
            vec![GetLocal, GetLocal, Add, Return, Null, Return]
        );
    }

    #[test]
    fn test_arrow_fn_returns_expression() {
        let (heap, function) = compile_str("fn twice(n) => n * 2;").unwrap();
        let chunk = &heap.function(function).chunk;
        let inner_ref = chunk.constants[0].as_obj().expect("function constant");
        use OpCode::*;
        assert_eq!(
            ops(&heap, inner_ref),
            vec![GetLocal, Constant, Multiply, Return]
        );
    }

    #[test]
    fn test_class_emission_sequence() {
        let (heap, function) = compile_str(
            "class Counter { n = 0; fn get() => this.n; private fn bump() { this.n = this.n + 1; } };",
        )
        .unwrap();
        use OpCode::*;
        assert_eq!(
            ops(&heap, function),
            vec![
                Class, DefineGlobal, GetGlobal, Constant, Property, Constant, Method, Constant,
                Method, Pop, Null, Return
            ]
        );
        // Privacy flags: first method public, second private.
        let chunk = &heap.function(function).chunk;
        let mut flags = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("valid opcode");
            if op == Method {
                flags.push(chunk.code[offset + 2]);
            }
            offset += 1 + operand_width(op);
        }
        assert_eq!(flags, vec![0, 1]);
    }

    #[test]
    fn test_initializer_emits_initializer_op() {
        let (heap, function) =
            compile_str("class P { x = 0; init(x) { this.x = x; } };").unwrap();
        let all = ops(&heap, function);
        assert!(all.contains(&OpCode::Initializer));
        // The init chunk returns slot 0 (the instance).
        let chunk = &heap.function(function).chunk;
        let init_ref = chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find(|&r| matches!(heap.get(r), xen_core::Obj::Function(f) if f.arity == 1))
            .expect("init function constant");
        use OpCode::*;
        assert_eq!(
            ops(&heap, init_ref),
            vec![GetLocal, GetLocal, SetProperty, Pop, GetLocal, Return]
        );
    }

    #[test]
    fn test_method_invocation_compiles_to_invoke() {
        let (heap, function) = compile_str("var x = 1; x.floor();").unwrap();
        assert!(ops(&heap, function).contains(&OpCode::Invoke));
    }

    #[test]
    fn test_range_for_desugars_to_while() {
        let (heap, function) =
            compile_str("var sum = 0; for (var i in 0..5) { sum += i; }").unwrap();
        use OpCode::*;
        let all = ops(&heap, function);
        assert!(all.contains(&Loop));
        assert!(all.contains(&Less));
        // Two hidden locals are dropped at scope end: i and __end.
        let pops = all.iter().filter(|&&op| op == Pop).count();
        assert!(pops >= 3);
    }

    #[test]
    fn test_array_for_uses_array_len_and_index() {
        let (heap, function) =
            compile_str("var xs = [1, 2]; for (var x in xs) { x; }").unwrap();
        use OpCode::*;
        let all = ops(&heap, function);
        assert!(all.contains(&ArrayLen));
        assert!(all.contains(&IndexGet));
        assert!(all.contains(&Loop));
    }

    #[test]
    fn test_c_style_for_compiles() {
        let (heap, function) =
            compile_str("for (var i = 0; i < 3; i += 1) { i; }").unwrap();
        let all = ops(&heap, function);
        assert!(all.contains(&OpCode::Loop));
        assert!(all.contains(&OpCode::JumpIfFalse));
    }

    #[test]
    fn test_infinite_for_allows_missing_clauses() {
        assert!(compile_str("fn spin() { for (;;) { return; } }").is_ok());
    }

    #[test]
    fn test_const_assignment_rejected() {
        let err = compile_str("const x = 1; x = 2;").unwrap_err();
        assert!(err.errors[0].contains("cannot assign to constant variable 'x'"));
    }

    #[test]
    fn test_const_increment_rejected() {
        let err = compile_str("const x = 1; x++;").unwrap_err();
        assert!(err.errors[0].contains("constant variable 'x'"));
    }

    #[test]
    fn test_read_in_own_initializer_rejected() {
        let err = compile_str("{ var a = 1; { var a = a; } }").unwrap_err();
        assert!(err.errors[0].contains("own initializer"));
    }

    #[test]
    fn test_this_outside_class_rejected() {
        let err = compile_str("this;").unwrap_err();
        assert!(err.errors[0].contains("outside of a class"));
    }

    #[test]
    fn test_return_at_top_level_rejected() {
        let err = compile_str("return 1;").unwrap_err();
        assert!(err.errors[0].contains("top-level"));
    }

    #[test]
    fn test_panic_mode_resynchronizes() {
        // Two independent errors, both reported after resync.
        let err = compile_str("var = 1; var = 2;").unwrap_err();
        assert_eq!(err.errors.len(), 2);
    }

    #[test]
    fn test_error_format() {
        let err = compile_str("var 1 = 2;").unwrap_err();
        assert!(err.errors[0].starts_with("[line 1] error at '1':"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = compile_str("1 + 2 = 3;").unwrap_err();
        assert!(err.errors[0].contains("invalid assignment target"));
    }

    #[test]
    fn test_array_and_dict_literals() {
        let (heap, function) = compile_str("var a = [1, 2, 3]; var d = { \"k\": 1 };").unwrap();
        use OpCode::*;
        let all = ops(&heap, function);
        assert!(all.contains(&ArrayNew));
        assert!(all.contains(&DictNew));
        assert!(all.contains(&DictAdd));
    }

    #[test]
    fn test_is_and_as_emit_type_ops() {
        let (heap, function) = compile_str("var a = 1 is Number; var b = \"5\" as Number;").unwrap();
        let all = ops(&heap, function);
        assert!(all.contains(&OpCode::IsType));
        assert!(all.contains(&OpCode::Cast));
    }

    #[test]
    fn test_new_emits_call_init() {
        let (heap, function) = compile_str("class A { }; var a = new A();").unwrap();
        assert!(ops(&heap, function).contains(&OpCode::CallInit));
    }

    #[test]
    fn test_include_namespace_emits_include() {
        let (heap, function) = compile_str("include math;").unwrap();
        use OpCode::*;
        assert_eq!(ops(&heap, function), vec![Include, Null, Return]);
    }

    #[test]
    fn test_include_file_compiles_inline() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.xen");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "var shared = 42;").unwrap();

        let mut heap = Heap::new();
        let mut ctx = CompileCtx::with_base_dir(dir.path().to_path_buf());
        let arena = Bump::new();
        let function = compile(
            "include \"lib.xen\";\nvar x = shared;",
            &mut heap,
            &mut ctx,
            &arena,
        )
        .unwrap();
        use OpCode::*;
        // The included declaration lands before the including file's own.
        assert_eq!(
            ops(&heap, function),
            vec![Constant, DefineGlobal, GetGlobal, DefineGlobal, Null, Return]
        );
    }

    #[test]
    fn test_include_cycle_is_noop() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xen");
        let b = dir.path().join("b.xen");
        writeln!(std::fs::File::create(&a).unwrap(), "include \"b.xen\"; var x = 1;").unwrap();
        writeln!(std::fs::File::create(&b).unwrap(), "include \"a.xen\"; var y = 2;").unwrap();

        let mut heap = Heap::new();
        let mut ctx = CompileCtx::with_base_dir(dir.path().to_path_buf());
        let arena = Bump::new();
        assert!(compile("include \"a.xen\";", &mut heap, &mut ctx, &arena).is_ok());
    }

    #[test]
    fn test_missing_include_file_is_error() {
        let err = compile_str("include \"no-such-file.xen\";").unwrap_err();
        assert!(err.errors[0].contains("failed to open include file"));
    }

    #[test]
    fn test_too_many_constants_rejected() {
        let mut source = String::new();
        for n in 0..300 {
            source.push_str(&format!("{};", n));
        }
        let err = compile_str(&source).unwrap_err();
        assert!(err.errors[0].contains("too many constants"));
    }
}
