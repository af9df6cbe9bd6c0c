use crate::bytecode::chunk::Chunk;
use crate::bytecode::compile_error::{CompileError, Location, Report};
use crate::bytecode::op::OpCode;
use crate::frontend::lexer::Lexer;
use crate::frontend::token::{Token, TokenKind};
use crate::lang::object::{FunctionObj, Heap, Obj, ObjRef};
use crate::lang::value::Value;

/// Local slots and upvalue indexes are one-byte operands.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Scope depth of a declared-but-uninitialized local. Reading a local at
/// this depth means its own initializer mentions it (`var a = a;`).
const UNINITIALIZED: i32 = -1;

// =============================================================================
// Precedence levels for Pratt parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
}

impl Precedence {
    /// The next-tighter level; makes binary operators left-associative.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

/// Infix binding power of a token; `None` for tokens with no infix role.
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            Precedence::Comparison
        }
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star => Precedence::Factor,
        TokenKind::LeftParen => Precedence::Call,
        _ => Precedence::None,
    }
}

// =============================================================================
// Per-function compilation state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Script,
    Function,
}

#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

/// Compile-time upvalue descriptor; becomes the (is-local, index) operand
/// pair that `OpCode::Closure` reads at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

/// State for one function currently being compiled. The `enclosing` chain
/// mirrors lexical function nesting the way a call stack would, but at
/// compile time; upvalue resolution walks it outward.
#[derive(Debug)]
struct FuncScope {
    enclosing: Option<Box<FuncScope>>,
    kind: FuncKind,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
}

impl FuncScope {
    fn new(kind: FuncKind, name: Option<String>) -> Self {
        // Slot 0 holds the callee itself and is never resolvable by name.
        let locals = vec![Local {
            name: String::new(),
            depth: 0,
            is_captured: false,
        }];

        FuncScope {
            enclosing: None,
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Backward scan so the innermost declaration shadows outer ones. A
    /// variable whose own initializer is still being compiled (depth is the
    /// sentinel) does not resolve to itself; the scan continues outward so a
    /// shadowing initializer can read the binding it shadows.
    fn resolve_local(&self, name: &str) -> LocalResolution {
        let mut saw_uninitialized = false;
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == UNINITIALIZED {
                    saw_uninitialized = true;
                    continue;
                }
                return LocalResolution::Slot(i as u8);
            }
        }
        if saw_uninitialized {
            LocalResolution::OnlySelf
        } else {
            LocalResolution::None
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        let slot = UpvalueSlot { index, is_local };
        for (i, existing) in self.upvalues.iter().enumerate() {
            if *existing == slot {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("too many captured variables in function");
        }
        self.upvalues.push(slot);
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Look for `name` in enclosing functions, recording a capture descriptor
    /// in every function along the chain. A hit on an enclosing local marks
    /// that local captured so scope exit closes it instead of popping it.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let local = match self.enclosing.as_mut() {
            None => return Ok(None),
            Some(enclosing) => match enclosing.resolve_local(name) {
                LocalResolution::Slot(slot) => {
                    enclosing.locals[slot as usize].is_captured = true;
                    Some(slot)
                }
                LocalResolution::OnlySelf | LocalResolution::None => None,
            },
        };
        if let Some(slot) = local {
            return self.add_upvalue(slot, true).map(Some);
        }

        let upvalue = match self.enclosing.as_mut() {
            None => None,
            Some(enclosing) => enclosing.resolve_upvalue(name)?,
        };
        match upvalue {
            Some(index) => self.add_upvalue(index, false).map(Some),
            None => Ok(None),
        }
    }
}

/// Result of looking a name up in one function's locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalResolution {
    /// Resolved to an initialized local slot.
    Slot(u8),
    /// The only match is the variable currently being initialized.
    OnlySelf,
    None,
}

// =============================================================================
// Compiler: token stream -> bytecode, single pass
// =============================================================================

/// Compile a source text into the implicit top-level script function.
///
/// All syntax/semantic errors are collected (with panic-mode synchronization
/// at statement boundaries to bound cascades); any recorded error fails the
/// whole compilation.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

struct Compiler<'h> {
    lexer: Lexer,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    reports: Vec<Report>,
    heap: &'h mut Heap,
    func: Box<FuncScope>,
}

impl<'h> Compiler<'h> {
    fn new(source: &str, heap: &'h mut Heap) -> Self {
        Compiler {
            lexer: Lexer::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            had_error: false,
            panic_mode: false,
            reports: Vec::new(),
            heap,
            func: Box::new(FuncScope::new(FuncKind::Script, None)),
        }
    }

    fn finish(mut self) -> Result<ObjRef, CompileError> {
        self.emit_return();
        if self.had_error {
            return Err(CompileError::new(self.reports));
        }
        let scope = std::mem::replace(
            &mut self.func,
            Box::new(FuncScope::new(FuncKind::Script, None)),
        );
        Ok(self.wrap_function(*scope))
    }

    /// Turn a finished scope into a heap function object.
    fn wrap_function(&mut self, scope: FuncScope) -> ObjRef {
        let name = scope.name.as_deref().map(|n| self.heap.intern(n));
        self.heap.alloc(Obj::Function(FunctionObj {
            arity: scope.arity,
            upvalue_count: scope.upvalues.len(),
            name,
            chunk: scope.chunk,
        }))
    }

    // =========================================================================
    // Token plumbing and error reporting
    // =========================================================================

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::empty());
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
        }
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    /// Record a report unless already panicking; subsequent errors are
    /// suppressed until `synchronize` clears the panic at a statement
    /// boundary.
    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => Location::AtEnd,
            TokenKind::Error => Location::Bare,
            _ => Location::At(token.lexeme.clone()),
        };
        self.reports.push(Report {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // =========================================================================
    // Emit helpers
    // =========================================================================

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.func.chunk.write_op(op, line);
    }

    fn emit_pair(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.func.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("too many constants in one chunk");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_pair(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    /// Emit a jump with a two-byte placeholder offset; returns the offset's
    /// position for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.func.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.func.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("too much code to jump over");
            return;
        }
        self.func.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        self.func.chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.func.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // =========================================================================
    // Scope handling
    // =========================================================================

    fn begin_scope(&mut self) {
        self.func.scope_depth += 1;
    }

    /// Pop every local declared in the closing scope. Captured locals are
    /// hoisted into their upvalue instead of discarded.
    fn end_scope(&mut self) {
        self.func.scope_depth -= 1;

        while let Some(local) = self.func.locals.last() {
            if local.depth <= self.func.scope_depth {
                break;
            }
            let op = if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_op(op);
            self.func.locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.func.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();

        let mut duplicate = false;
        for local in self.func.locals.iter().rev() {
            if local.depth != UNINITIALIZED && local.depth < self.func.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("already a variable with this name in this scope");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.func.locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        self.func.locals.push(Local {
            name,
            depth: UNINITIALIZED,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.func.scope_depth == 0 {
            return;
        }
        let depth = self.func.scope_depth;
        if let Some(local) = self.func.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Consume an identifier; locals are declared here, globals get their
    /// name interned into the constant pool.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.func.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.func.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(OpCode::DefineGlobal, global);
    }

    // =========================================================================
    // Declarations and statements
    // =========================================================================

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expected variable name");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "expected ';' after variable declaration",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expected function name");
        // The name is usable inside the body (recursion), so it counts as
        // initialized before the body compiles.
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    /// Compile a function body in a nested scope and emit the `Closure`
    /// instruction (with one operand pair per upvalue) into the enclosing
    /// chunk.
    fn function(&mut self) {
        let name = self.previous.lexeme.clone();
        let enclosing = std::mem::replace(
            &mut self.func,
            Box::new(FuncScope::new(FuncKind::Function, Some(name))),
        );
        self.func.enclosing = Some(enclosing);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func.arity == u8::MAX {
                    self.error_at_current("cannot have more than 255 parameters");
                } else {
                    self.func.arity += 1;
                }
                let constant = self.parse_variable("expected parameter name");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        self.emit_return();
        let mut scope = std::mem::replace(
            &mut self.func,
            Box::new(FuncScope::new(FuncKind::Script, None)),
        );
        if let Some(enclosing) = scope.enclosing.take() {
            self.func = enclosing;
        }

        let upvalues = scope.upvalues.clone();
        let function = self.wrap_function(*scope);
        let constant = self.make_constant(Value::Obj(function));
        self.emit_pair(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
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

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(OpCode::Print);
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

    fn return_statement(&mut self) {
        if self.func.kind == FuncKind::Script {
            self.error("cannot return from top-level code");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.func.chunk.code.len();
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

    /// `for` desugars entirely to jumps: initializer once, condition before
    /// each round, increment after the body (the body jumps over the
    /// increment on the way in, the loop runs back through it).
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.func.chunk.code.len();

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.func.chunk.code.len();
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
        self.end_scope();
    }

    // =========================================================================
    // Expressions (precedence climbing)
    // =========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Consume one prefix expression, then fold infix operators while the
    /// current token binds at least as tightly as `prec`. Assignment targets
    /// are only legal below operator precedence, tracked by `can_assign`.
    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let can_assign = prec <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("expected expression");
            return;
        }

        while prec <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    /// Dispatch the prefix handler for `kind`; false when the token cannot
    /// start an expression.
    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::Nil | TokenKind::True | TokenKind::False => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LeftParen => self.call(),
            _ => self.binary(kind),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;

        // Compile the operand first; the operator applies to its result.
        self.parse_precedence(Precedence::Unary);

        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => {}
        }
    }

    fn binary(&mut self, op_kind: TokenKind) {
        self.parse_precedence(infix_precedence(op_kind).next());

        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
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
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => {}
        }
    }

    fn number(&mut self) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error("invalid number literal"),
        }
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme.clone();
        let interned = self.heap.intern(&lexeme);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    /// Resolve an identifier: local slot first (innermost declaration wins),
    /// then captured upvalue, otherwise a global access keyed by interned
    /// name. A name whose only binding is the variable currently being
    /// initialized resolves to nothing at all, which is the
    /// `var a = a;` error.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let local = self.func.resolve_local(name);
        let (get_op, set_op, arg) = match local {
            LocalResolution::Slot(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            LocalResolution::OnlySelf | LocalResolution::None => {
                match self.func.resolve_upvalue(name) {
                    Err(message) => {
                        self.error(message);
                        return;
                    }
                    Ok(Some(index)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index),
                    Ok(None) => {
                        if local == LocalResolution::OnlySelf {
                            self.error("cannot read local variable in its own initializer");
                            return;
                        }
                        let constant = self.identifier_constant(name);
                        (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                    }
                }
            }
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    /// `and` short-circuits: when the left side is falsey, skip the right
    /// side and leave the left value as the result.
    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_pair(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("cannot have more than 255 arguments");
                } else {
                    count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count
    }
}
