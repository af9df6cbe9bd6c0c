use std::io::Write;

use crate::bytecode::compile::compile;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::OpCode;
use crate::lang::object::{ClosureObj, Heap, NativeFn, NativeObj, Obj, ObjRef, Upvalue};
use crate::lang::table::Table;
use crate::lang::value::Value;
use crate::runtime::runtime_error::{RuntimeError, TraceFrame};

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum call-frame depth; exceeding it is a "stack overflow" runtime
    /// error. Each frame addresses at most 256 slots, so this also bounds the
    /// value stack.
    pub max_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { max_frames: 64 }
    }
}

/// Outcome of `Vm::interpret`: compile errors never reach execution, runtime
/// errors abort it.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for InterpretError {}

/// One active function invocation: the running closure, its function (cached
/// to skip a heap hop per fetch), the instruction pointer into that
/// function's chunk, and the base stack slot of its window. The base slot
/// holds the callee; parameters and locals follow it.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    function: ObjRef,
    ip: usize,
    base: usize,
}

/// The bytecode interpreter: one contiguous value stack shared by every
/// frame, a bounded frame stack, the globals table, and the list of upvalues
/// still pointing into live stack slots.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    config: VmConfig,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            config,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(NativeObj { name, function }));
        let hash = self.heap.str_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native));
    }

    /// Compile and run a source text. Globals and interned strings persist
    /// across calls, which is what makes the REPL stateful.
    pub fn interpret(&mut self, source: &str, out: &mut impl Write) -> Result<(), InterpretError> {
        let function =
            compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        self.run_function(function, out)
            .map_err(InterpretError::Runtime)
    }

    /// Run an already-compiled script function (freshly compiled or thawed
    /// from a bytecode image).
    pub fn run_function(
        &mut self,
        function: ObjRef,
        out: &mut impl Write,
    ) -> Result<(), RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = self.heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: 0,
        });

        self.run(out)
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn run(&mut self, out: &mut impl Write) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte()?;
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(unknown) => {
                    return Err(self.runtime_error(&format!("unknown opcode {}", unknown)));
                }
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant()?;
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame().base;
                    let value = match self.stack.get(base + slot) {
                        Some(v) => *v,
                        None => return Err(self.runtime_error("invalid stack slot")),
                    };
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame().base;
                    let value = self.peek(0)?;
                    match self.stack.get_mut(base + slot) {
                        Some(dest) => *dest = value,
                        None => return Err(self.runtime_error("invalid stack slot")),
                    }
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("undefined variable '{}'", self.heap.str_chars(name));
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0)?;
                    self.globals.set(name, hash, value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0)?;
                    if self.globals.set(name, hash, value) {
                        // Assignment must not create globals; undo the insert.
                        self.globals.delete(name, hash);
                        let message =
                            format!("undefined variable '{}'", self.heap.str_chars(name));
                        return Err(self.runtime_error(&message));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let closure = self.frame().closure;
                    let upvalue = match self.heap.closure(closure).upvalues.get(index) {
                        Some(r) => *r,
                        None => return Err(self.runtime_error("invalid upvalue index")),
                    };
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let closure = self.frame().closure;
                    let upvalue = match self.heap.closure(closure).upvalues.get(index) {
                        Some(r) => *r,
                        None => return Err(self.runtime_error("invalid upvalue index")),
                    };
                    let value = self.peek(0)?;
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(cell) => *cell = value,
                    }
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater | OpCode::Less => self.binary_comparison(op)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide => {
                    self.binary_arithmetic(op)?
                }

                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("operand must be a number")),
                    }
                }

                OpCode::Print => {
                    let value = self.pop()?;
                    let text = value.show(&self.heap);
                    if let Err(e) = writeln!(out, "{}", text) {
                        return Err(
                            self.runtime_error(&format!("could not write output: {}", e))
                        );
                    }
                }

                OpCode::Jump => {
                    let offset = self.read_u16()?;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16()?;
                    let ip = self.frame().ip;
                    if offset > ip {
                        return Err(self.runtime_error("invalid loop target"));
                    }
                    self.frame_mut().ip = ip - offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte()?;
                    let callee = self.peek(arg_count as usize)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    self.make_closure()?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len().saturating_sub(1);
                    self.close_upvalues(top);
                    self.pop()?;
                }

                OpCode::Return => {
                    let result = self.pop()?;
                    let base = self.frame().base;
                    self.close_upvalues(base);

                    self.frames.pop();
                    if self.frames.is_empty() {
                        // `result` is the program's final value; execution
                        // halts with an empty stack.
                        self.stack.clear();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
            }
        }
    }

    // =========================================================================
    // Operand fetch
    // =========================================================================

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let last = self.frames.len() - 1;
        let fetched = {
            let frame = &self.frames[last];
            self.heap
                .function(frame.function)
                .chunk
                .code
                .get(frame.ip)
                .copied()
        };
        match fetched {
            Some(byte) => {
                self.frames[last].ip += 1;
                Ok(byte)
            }
            None => Err(self.runtime_error("instruction pointer out of bounds")),
        }
    }

    fn read_u16(&mut self) -> Result<usize, RuntimeError> {
        let hi = self.read_byte()? as usize;
        let lo = self.read_byte()? as usize;
        Ok((hi << 8) | lo)
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeError> {
        let index = self.read_byte()? as usize;
        let frame = self.frame();
        match self
            .heap
            .function(frame.function)
            .chunk
            .constants
            .get(index)
        {
            Some(value) => Ok(*value),
            None => Err(self.runtime_error("invalid constant index")),
        }
    }

    fn read_string_constant(&mut self) -> Result<ObjRef, RuntimeError> {
        let value = self.read_constant()?;
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Str(_)) => Ok(r),
            _ => Err(self.runtime_error("constant is not a string")),
        }
    }

    // =========================================================================
    // Stack
    // =========================================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.runtime_error("stack underflow")),
        }
    }

    fn peek(&mut self, distance: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(self.runtime_error("stack underflow"));
        }
        Ok(self.stack[len - 1 - distance])
    }

    // =========================================================================
    // Operators
    // =========================================================================

    /// `+` is overloaded: two numbers add, two strings concatenate (the
    /// result is interned like every string), anything else is an error.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;

        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop()?;
                self.pop()?;
                self.push(Value::Number(x + y));
            }
            (Value::Obj(x), Value::Obj(y))
                if matches!(self.heap.get(x), Obj::Str(_))
                    && matches!(self.heap.get(y), Obj::Str(_)) =>
            {
                let joined = format!("{}{}", self.heap.str_chars(x), self.heap.str_chars(y));
                self.pop()?;
                self.pop()?;
                let interned = self.heap.intern(&joined);
                self.push(Value::Obj(interned));
            }
            _ => {
                return Err(self.runtime_error("operands must be two numbers or two strings"));
            }
        }
        Ok(())
    }

    fn binary_arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
            return Err(self.runtime_error("operands must be numbers"));
        };
        let result = match op {
            OpCode::Subtract => x - y,
            OpCode::Multiply => x * y,
            OpCode::Divide => x / y,
            _ => return Err(self.runtime_error("not an arithmetic opcode")),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn binary_comparison(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
            return Err(self.runtime_error("operands must be numbers"));
        };
        let result = match op {
            OpCode::Greater => x > y,
            OpCode::Less => x < y,
            _ => return Err(self.runtime_error("not a comparison opcode")),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    // =========================================================================
    // Calls and closures
    // =========================================================================

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        enum Kind {
            Closure { closure: ObjRef, function: ObjRef },
            Native(NativeFn),
            NotCallable,
        }

        let kind = match callee.as_obj() {
            Some(r) => match self.heap.get(r) {
                Obj::Closure(c) => Kind::Closure {
                    closure: r,
                    function: c.function,
                },
                Obj::Native(n) => Kind::Native(n.function),
                _ => Kind::NotCallable,
            },
            None => Kind::NotCallable,
        };

        match kind {
            // The callee object itself sits just below the arguments and
            // becomes the new frame's base slot.
            Kind::Closure { closure, function } => {
                self.call_closure(closure, function, arg_count)
            }
            Kind::Native(function) => {
                let argc = arg_count as usize;
                if self.stack.len() < argc + 1 {
                    return Err(self.runtime_error("stack underflow"));
                }
                let args_start = self.stack.len() - argc;
                let result = function(&self.stack[args_start..]);
                // The result replaces the callee and its arguments.
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Kind::NotCallable => {
                let message =
                    format!("can only call functions, got {}", callee.type_name(&self.heap));
                Err(self.runtime_error(&message))
            }
        }
    }

    fn call_closure(
        &mut self,
        closure: ObjRef,
        function: ObjRef,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            let message = format!("expected {} arguments but got {}", arity, arg_count);
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(self.runtime_error("stack overflow"));
        }

        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// `Closure`: instantiate the function constant, wiring each declared
    /// upvalue either to a (possibly shared) open upvalue over the current
    /// frame's slot, or to an upvalue the enclosing closure already holds.
    fn make_closure(&mut self) -> Result<(), RuntimeError> {
        let function = match self.read_constant()? {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Function(_)) => r,
            _ => return Err(self.runtime_error("constant is not a function")),
        };

        let upvalue_count = self.heap.function(function).upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte()? == 1;
            let index = self.read_byte()? as usize;

            if is_local {
                let base = self.frame().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let enclosing = self.frame().closure;
                let upvalue = match self.heap.closure(enclosing).upvalues.get(index) {
                    Some(r) => *r,
                    None => return Err(self.runtime_error("invalid upvalue index")),
                };
                upvalues.push(upvalue);
            }
        }

        let closure = self.heap.alloc(Obj::Closure(ClosureObj { function, upvalues }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    /// Reuse the open upvalue for `slot` if one exists so every closure over
    /// one variable shares a single cell.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &existing in &self.open_upvalues {
            if matches!(self.heap.upvalue(existing), Upvalue::Open(s) if *s == slot) {
                return existing;
            }
        }
        let upvalue = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.push(upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from_slot`: move the slot's
    /// current value into the upvalue so closures keep working after the
    /// slot disappears.
    fn close_upvalues(&mut self, from_slot: usize) {
        let mut still_open = Vec::with_capacity(self.open_upvalues.len());
        for &upvalue in &self.open_upvalues {
            let slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => {
                    continue;
                }
            };
            if slot >= from_slot {
                let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
                *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            } else {
                still_open.push(upvalue);
            }
        }
        self.open_upvalues = still_open;
    }

    // =========================================================================
    // Error unwinding
    // =========================================================================

    /// Capture the frame chain (innermost first) into the error, then reset
    /// all execution state; a runtime error never resumes.
    fn runtime_error(&mut self, message: &str) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let func = self.heap.function(frame.function);
            trace.push(TraceFrame {
                line: func.chunk.line_at(frame.ip.saturating_sub(1)),
                function: self.heap.function_name(frame.function).map(str::to_string),
            });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError::with_trace(message, trace)
    }
}

/// Seconds since the Unix epoch, as a Number. The only host interaction the
/// runtime ships with.
fn native_clock(_args: &[Value]) -> Value {
    let seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<String, InterpretError> {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret(source, &mut out)?;
        Ok(String::from_utf8(out).expect("output is utf-8"))
    }

    fn run_ok(source: &str) -> String {
        run(source).expect("program should run")
    }

    fn run_runtime_err(source: &str) -> RuntimeError {
        match run(source) {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {:?}", other.map(|s| s.to_string())),
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(run_ok("print 2 + 3 * 4;"), "14\n");
        assert_eq!(run_ok("print (2 + 3) * 4;"), "20\n");
    }

    #[test]
    fn test_unary_and_grouping() {
        assert_eq!(run_ok("print -2 + 3;"), "1\n");
        assert_eq!(run_ok("print !(1 > 2);"), "true\n");
        assert_eq!(run_ok("print !nil;"), "true\n");
    }

    #[test]
    fn test_division_and_comparison() {
        assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
        assert_eq!(run_ok("print 1 <= 1;"), "true\n");
        assert_eq!(run_ok("print 2 >= 3;"), "false\n");
    }

    #[test]
    fn test_equality_across_types() {
        assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
        assert_eq!(run_ok("print nil == nil;"), "true\n");
        assert_eq!(run_ok("print nil == false;"), "false\n");
        assert_eq!(run_ok("print 2 != 3;"), "true\n");
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(run_ok("print \"foo\" + \"bar\";"), "foobar\n");
    }

    #[test]
    fn test_string_interning_identity() {
        assert_eq!(run_ok("print \"abc\" == \"abc\";"), "true\n");
        // A computed string is canonicalized to the same handle as a literal.
        assert_eq!(run_ok("print \"ab\" + \"c\" == \"abc\";"), "true\n");
    }

    #[test]
    fn test_and_or_return_operand_values() {
        assert_eq!(run_ok("print true and 2;"), "2\n");
        assert_eq!(run_ok("print false and 2;"), "false\n");
        assert_eq!(run_ok("print nil or \"d\";"), "d\n");
        assert_eq!(run_ok("print 1 or 2;"), "1\n");
    }

    // =========================================================================
    // Variables and scope
    // =========================================================================

    #[test]
    fn test_global_mutation() {
        assert_eq!(run_ok("var x = 1; x = x + 1; print x;"), "2\n");
    }

    #[test]
    fn test_global_redefinition_overwrites_silently() {
        assert_eq!(run_ok("var x = 1; var x = 2; print x;"), "2\n");
    }

    #[test]
    fn test_undefined_global_get() {
        let err = run_runtime_err("print y;");
        assert!(err.message.contains("undefined variable 'y'"));
    }

    #[test]
    fn test_undefined_global_assignment() {
        let err = run_runtime_err("y = 1;");
        assert!(err.message.contains("undefined variable 'y'"));
        // And the failed assignment must not have created the global.
        let err = run_runtime_err("y = 1;");
        assert!(err.message.contains("undefined"));
    }

    #[test]
    fn test_local_shadowing() {
        let output = run_ok("{ var a = 1; { var a = a + 1; print a; } print a; }");
        assert_eq!(output, "2\n1\n");
    }

    #[test]
    fn test_assignment_is_an_expression() {
        assert_eq!(run_ok("var a = 1; var b = 2; a = b = 3; print a; print b;"), "3\n3\n");
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_if_else() {
        assert_eq!(run_ok("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
        assert_eq!(run_ok("if (1 > 2) print \"yes\"; else print \"no\";"), "no\n");
        assert_eq!(run_ok("if (false) print 1;"), "");
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(
            run_ok("var i = 0; var s = 0; while (i < 5) { s = s + i; i = i + 1; } print s;"),
            "10\n"
        );
    }

    #[test]
    fn test_for_loop() {
        assert_eq!(
            run_ok("var s = 0; for (var i = 0; i < 5; i = i + 1) { s = s + i; } print s;"),
            "10\n"
        );
    }

    #[test]
    fn test_for_loop_with_partial_clauses() {
        assert_eq!(
            run_ok("var i = 0; for (; i < 3; i = i + 1) print i;"),
            "0\n1\n2\n"
        );
        assert_eq!(
            run_ok("for (var i = 0; i < 2;) { print i; i = i + 1; }"),
            "0\n1\n"
        );
    }

    // =========================================================================
    // Functions and closures
    // =========================================================================

    #[test]
    fn test_function_call_and_return() {
        assert_eq!(
            run_ok("fun add(a, b) { return a + b; } print add(1, 2);"),
            "3\n"
        );
    }

    #[test]
    fn test_implicit_return_is_nil() {
        assert_eq!(run_ok("fun noop() {} print noop();"), "nil\n");
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            run_ok("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
            "55\n"
        );
    }

    #[test]
    fn test_function_prints_by_name() {
        assert_eq!(run_ok("fun greet() {} print greet;"), "<fn greet>\n");
        assert_eq!(run_ok("print clock;"), "<native fn clock>\n");
    }

    #[test]
    fn test_closure_shares_open_upvalue() {
        let source = "
            fun make() {
                var i = 0;
                fun inc() { i = i + 1; return i; }
                return inc;
            }
            var c = make();
            print c();
            print c();
        ";
        assert_eq!(run_ok(source), "1\n2\n");
    }

    #[test]
    fn test_closure_reads_closed_upvalue_after_frame_returns() {
        let source = "
            fun make() {
                var i = 10;
                fun get() { return i; }
                return get;
            }
            var g = make();
            print g();
        ";
        assert_eq!(run_ok(source), "10\n");
    }

    #[test]
    fn test_closures_from_separate_calls_are_independent() {
        let source = "
            fun make() {
                var i = 0;
                fun inc() { i = i + 1; return i; }
                return inc;
            }
            var a = make();
            var b = make();
            print a();
            print a();
            print b();
        ";
        assert_eq!(run_ok(source), "1\n2\n1\n");
    }

    #[test]
    fn test_two_closures_share_one_variable() {
        let source = "
            fun make() {
                var value = 0;
                fun set(v) { value = v; }
                fun get() { return value; }
                set(42);
                return get;
            }
            print make()();
        ";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn test_upvalue_closed_by_scope_exit() {
        let source = "
            var f = nil;
            {
                var x = \"kept\";
                fun capture() { return x; }
                f = capture;
            }
            print f();
        ";
        assert_eq!(run_ok(source), "kept\n");
    }

    #[test]
    fn test_native_clock_returns_number() {
        assert_eq!(run_ok("print clock() >= 0;"), "true\n");
    }

    // =========================================================================
    // Runtime errors
    // =========================================================================

    #[test]
    fn test_add_type_errors() {
        let err = run_runtime_err("1 + \"x\";");
        assert!(err.message.contains("two numbers or two strings"));
        let err = run_runtime_err("nil + 1;");
        assert!(err.message.contains("two numbers or two strings"));
    }

    #[test]
    fn test_comparison_requires_numbers() {
        let err = run_runtime_err("1 < \"a\";");
        assert!(err.message.contains("operands must be numbers"));
    }

    #[test]
    fn test_negate_requires_number() {
        let err = run_runtime_err("-nil;");
        assert!(err.message.contains("operand must be a number"));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = run_runtime_err("fun f(a, b) {} f(1);");
        assert!(err.message.contains("expected 2 arguments but got 1"));
    }

    #[test]
    fn test_calling_non_callable() {
        let err = run_runtime_err("var x = 1; x();");
        assert!(err.message.contains("can only call functions"));
    }

    #[test]
    fn test_call_stack_overflow() {
        let err = run_runtime_err("fun f() { f(); } f();");
        assert_eq!(err.message, "stack overflow");
    }

    #[test]
    fn test_error_unwinds_whole_frame_chain() {
        let source = "
            fun inner() { return 1 + nil; }
            fun outer() { inner(); }
            outer();
        ";
        let err = run_runtime_err(source);
        assert_eq!(err.trace.len(), 3);
        assert_eq!(err.trace[0].function.as_deref(), Some("inner"));
        assert_eq!(err.trace[1].function.as_deref(), Some("outer"));
        assert_eq!(err.trace[2].function, None);
    }

    #[test]
    fn test_vm_state_survives_runtime_error() {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        assert!(vm.interpret("var x = 5; nil + 1;", &mut out).is_err());
        // Stack was reset; the next interpretation starts clean and still
        // sees the global defined before the error.
        vm.interpret("print x;", &mut out).expect("globals persist");
        assert_eq!(String::from_utf8(out).expect("utf-8"), "5\n");
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    #[test]
    fn test_repl_style_persistence() {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret("var x = 7;", &mut out).expect("defines");
        vm.interpret("print x;", &mut out).expect("reads back");
        assert_eq!(String::from_utf8(out).expect("utf-8"), "7\n");
    }

    #[test]
    fn test_thawed_image_runs() {
        use crate::bytecode::image::{freeze, thaw};

        let mut heap = Heap::new();
        let function =
            compile("print \"img\" + \"!\";", &mut heap).expect("compiles");
        let bytes = freeze(&heap, function).expect("freezes");

        let mut vm = Vm::new();
        let thawed = thaw(vm.heap_mut(), &bytes).expect("thaws");
        let mut out = Vec::new();
        vm.run_function(thawed, &mut out).expect("runs");
        assert_eq!(String::from_utf8(out).expect("utf-8"), "img!\n");
    }
}
