//! The bytecode virtual machine.
//!
//! Executes code objects with a stack-based model: every activation gets a
//! [`Frame`] on the call stack, each frame owns its operand stack and
//! instruction pointer, and the run loop drives fetch -> decode -> dispatch
//! until a completion signal bubbles out of all blocks.
//!
//! Control transfer is threaded explicitly: opcode handlers return a
//! [`Why`] signal (or a `RunError`, which the loop converts into the
//! exception signal), and the block-unwinding algorithm in `exceptions`
//! resolves the signal against the frame's block stack. `yield` is the one
//! signal that skips unwinding entirely - it suspends the frame with all
//! state intact.
//!
//! # Module Structure
//!
//! - `attr` - attribute, subscript and slice handlers
//! - `binary` - unary/binary/in-place/comparison handlers
//! - `call` - calls, argument plumbing, function and class construction
//! - `collections` - container build/unpack/append handlers
//! - `exceptions` - raise/except/finally handlers and block unwinding

mod attr;
mod binary;
mod call;
mod collections;
mod exceptions;

use std::{cell::RefCell, rc::Rc};

use crate::{
    builtins::default_builtins,
    code::Code,
    error::{Exc, ExcType, RunError, RunResult, SimpleException, VmError},
    frame::{BlockKind, Cell, Frame},
    function::{Generator, GeneratorState},
    io::{PrintWriter, StdPrint},
    op::{Opcode, Operand, OperandMode},
    resource::ResourceLimits,
    value::{BinaryOp, Namespace, Value, ValueIter},
};

/// The control-transfer outcome of one instruction or one unwind step.
#[derive(Debug)]
pub(crate) enum Why {
    Return(Value),
    Break,
    Continue,
    Yield(Value),
    Exception(Exc),
    /// An `EndFinally` re-raise; collapses to `Exception` before unwinding.
    Reraise(Exc),
}

/// How a frame finished executing.
#[derive(Debug)]
pub(crate) enum FrameExit {
    /// The frame signalled `return`.
    Return(Value),
    /// The frame suspended at a `yield`; its state is preserved.
    Yield(Value),
}

/// The virtual machine: the call stack, the exception context being
/// handled, execution limits and the output writer.
///
/// One instance executes one instruction at a time; there is no parallel
/// execution of frames. Results and errors are threaded explicitly through
/// [`run`](Self::run) / [`call`](Self::call) / [`resume`](Self::resume) -
/// the only hidden state is the exception context consumed by bare
/// re-raise and handler exits.
pub struct Vm<P: PrintWriter = StdPrint> {
    /// Call stack; the last frame is the one executing.
    frames: Vec<Frame>,
    /// The exception currently being handled, for bare `raise` and for
    /// restoring outer context when an except-handler block unwinds.
    exception: Option<Exc>,
    limits: ResourceLimits,
    print_writer: P,
}

impl Default for Vm<StdPrint> {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm<StdPrint> {
    /// A VM with default limits, writing output to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(StdPrint)
    }
}

impl<P: PrintWriter> Vm<P> {
    /// A VM with a custom output writer.
    pub fn with_writer(print_writer: P) -> Self {
        Self {
            frames: Vec::new(),
            exception: None,
            limits: ResourceLimits::default(),
            print_writer,
        }
    }

    /// Replaces the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The output writer, for reading back collected output.
    pub fn print_writer(&self) -> &P {
        &self.print_writer
    }

    /// Consumes the VM, returning its writer.
    pub fn into_writer(self) -> P {
        self.print_writer
    }

    // ------------------------------------------------------------------
    // Public entry points
    // ------------------------------------------------------------------

    /// Executes a code object in a fresh top-level frame to completion.
    ///
    /// Fails with [`VmError::Internal`] if the call stack or the terminal
    /// frame's operand stack is non-empty at exit - both indicate an
    /// internal-consistency violation, not a program error.
    pub fn run(&mut self, code: &Rc<Code>) -> Result<Value, VmError> {
        self.run_with_env(code, None, None)
    }

    /// Executes a code object with explicit global/local namespaces.
    ///
    /// With `globals` given and `locals` absent, locals alias globals, as
    /// at module level. With both absent a fresh shared namespace is
    /// created and the default builtins are installed (a `__builtins__`
    /// mapping in the supplied locals overrides them).
    pub fn run_with_env(
        &mut self,
        code: &Rc<Code>,
        globals: Option<Rc<RefCell<Namespace>>>,
        locals: Option<Rc<RefCell<Namespace>>>,
    ) -> Result<Value, VmError> {
        let frame = self
            .make_frame(Rc::clone(code), Namespace::default(), globals, locals, &[])
            .map_err(VmError::from)?;
        let (frame, exit) = self.run_frame(frame).map_err(VmError::from)?;

        if !self.frames.is_empty() {
            self.frames.clear();
            return Err(VmError::Internal("frames left over after top-level run".to_owned()));
        }
        match exit {
            FrameExit::Return(value) => {
                if frame.stack.is_empty() {
                    Ok(value)
                } else {
                    Err(VmError::Internal("data left on operand stack after top-level run".to_owned()))
                }
            }
            FrameExit::Yield(_) => Err(VmError::Internal("yield escaped a non-generator frame".to_owned())),
        }
    }

    /// Calls a callable value with positional and keyword arguments.
    ///
    /// Calling a function whose code object is generator-flagged returns a
    /// suspended [`Value::Generator`] without executing any instruction.
    pub fn call(
        &mut self,
        callable: &Value,
        args: Vec<Value>,
        kwargs: Vec<(Rc<str>, Value)>,
    ) -> Result<Value, VmError> {
        self.call_value(callable.clone(), args, kwargs).map_err(VmError::from)
    }

    /// Pulls the next value from a generator.
    ///
    /// A finished generator always fails with an uncaught `StopIteration`
    /// (the exhausted condition); it never re-executes any instruction.
    pub fn resume(&mut self, generator: &Value) -> Result<Value, VmError> {
        match generator {
            Value::Generator(generator) => self.gen_next(generator).map_err(VmError::from),
            other => Err(VmError::Internal(format!(
                "resume() requires a generator, got '{}'",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Frame management
    // ------------------------------------------------------------------

    /// Builds a frame for `code`, resolving namespaces against the current
    /// call stack and wiring closure cells.
    ///
    /// Cell wiring: each cell variable declared by the code object gets a
    /// fresh cell seeded from the corresponding local (or `None`), published
    /// into the caller frame's cell map so nested closures can capture it.
    /// Each free variable binds to the definition-time closure cell when one
    /// was captured, falling back to name lookup in the caller's cell map;
    /// a free variable with no cell anywhere is a fatal construction error.
    pub(crate) fn make_frame(
        &mut self,
        code: Rc<Code>,
        callargs: Namespace,
        globals: Option<Rc<RefCell<Namespace>>>,
        locals: Option<Rc<RefCell<Namespace>>>,
        closure: &[Cell],
    ) -> RunResult<Frame> {
        let (globals, locals) = match (globals, locals) {
            (Some(g), Some(l)) => (g, l),
            (Some(g), None) => (Rc::clone(&g), g),
            (None, locals) => {
                let g = match self.frames.last() {
                    Some(frame) => Rc::clone(&frame.globals),
                    None => Rc::new(RefCell::new(Namespace::default())),
                };
                let l = locals.unwrap_or_else(|| {
                    if self.frames.is_empty() {
                        Rc::clone(&g)
                    } else {
                        Rc::new(RefCell::new(Namespace::default()))
                    }
                });
                (g, l)
            }
        };
        locals.borrow_mut().extend(callargs);

        let builtins = if let Some(back) = self.frames.last() {
            Rc::clone(&back.builtins)
        } else {
            let reserved = locals.borrow().get("__builtins__").cloned();
            match reserved {
                Some(Value::Dict(dict)) => {
                    let mut ns = Namespace::default();
                    for (key, value) in dict.borrow().iter() {
                        if let Value::Str(name) = &key.0 {
                            ns.insert(Rc::clone(name), value.clone());
                        }
                    }
                    Rc::new(RefCell::new(ns))
                }
                _ => Rc::new(RefCell::new(default_builtins())),
            }
        };

        let mut cells = ahash::AHashMap::new();
        let mut back = self.frames.last_mut();
        for name in code.cellvars() {
            let seed = locals.borrow().get(name).cloned().unwrap_or(Value::None);
            let cell = Cell::new(seed);
            if let Some(back) = back.as_deref_mut() {
                back.cells.insert(Rc::clone(name), cell.clone());
            }
            cells.insert(Rc::clone(name), cell);
        }
        for (i, name) in code.freevars().iter().enumerate() {
            let cell = match closure.get(i) {
                Some(cell) => cell.clone(),
                None => back
                    .as_deref_mut()
                    .and_then(|b| b.cells.get(name).cloned())
                    .ok_or_else(|| {
                        RunError::internal(format!("free variable '{name}' has no cell in the caller frame"))
                    })?,
            };
            cells.insert(Rc::clone(name), cell);
        }

        let mut frame = Frame::new(code, globals, locals, builtins);
        frame.cells = cells;
        Ok(frame)
    }

    fn push_frame(&mut self, frame: Frame) -> RunResult<()> {
        if self.frames.len() >= self.limits.max_recursion_depth {
            let exc = SimpleException::new_msg(ExcType::RecursionError, "maximum recursion depth exceeded");
            return Err(RunError::Uncatchable(Box::new(Exc::from_exception(exc))));
        }
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) -> RunResult<Frame> {
        self.frames
            .pop()
            .ok_or_else(|| RunError::internal("call stack underflow"))
    }

    pub(crate) fn current_frame(&self) -> RunResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| RunError::internal("no active frame"))
    }

    pub(crate) fn current_frame_mut(&mut self) -> RunResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| RunError::internal("no active frame"))
    }

    // ------------------------------------------------------------------
    // Operand stack helpers (delegating to the current frame)
    // ------------------------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) -> RunResult<()> {
        self.current_frame_mut()?.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> RunResult<Value> {
        self.current_frame_mut()?.pop()
    }

    pub(crate) fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        self.current_frame_mut()?.pop_n(n)
    }

    pub(crate) fn peek(&self, depth: usize) -> RunResult<Value> {
        Ok(self.current_frame()?.peek(depth)?.clone())
    }

    pub(crate) fn jump(&mut self, target: usize) -> RunResult<()> {
        self.current_frame_mut()?.ip = target;
        Ok(())
    }

    // ------------------------------------------------------------------
    // The run loop
    // ------------------------------------------------------------------

    /// Pushes `frame` and drives it until it returns, yields, or fails.
    ///
    /// The frame is handed back to the caller in every non-fatal outcome so
    /// generators can retain it across pulls.
    pub(crate) fn run_frame(&mut self, frame: Frame) -> RunResult<(Frame, FrameExit)> {
        self.push_frame(frame)?;
        let outcome = self.frame_loop();
        let frame = self.pop_frame()?;
        outcome.map(|exit| (frame, exit))
    }

    fn frame_loop(&mut self) -> RunResult<FrameExit> {
        loop {
            let (op, operand) = self.fetch_decode()?;
            let why = match self.exec_op(op, operand) {
                Ok(why) => why,
                Err(RunError::Exc(exc)) => {
                    // Host-level failure inside a handler becomes the
                    // exception signal, stamped with the current line.
                    let mut exc = *exc;
                    exc.push_line(self.current_frame()?.line_number());
                    Some(Why::Exception(exc))
                }
                Err(fatal) => return Err(fatal),
            };
            let Some(why) = why else { continue };
            let why = match why {
                Why::Reraise(exc) => Why::Exception(exc),
                other => other,
            };
            if let Why::Yield(value) = why {
                // yield suspends without unwinding any block
                if !self.current_frame()?.is_generator {
                    return Err(RunError::internal("yield from a non-generator frame"));
                }
                return Ok(FrameExit::Yield(value));
            }

            let mut pending = Some(why);
            while let Some(signal) = pending.take() {
                if self.current_frame()?.blocks.is_empty() {
                    pending = Some(signal);
                    break;
                }
                pending = self.manage_block_stack(signal)?;
            }
            match pending {
                None => {}
                Some(Why::Return(value)) => return Ok(FrameExit::Return(value)),
                Some(Why::Exception(exc)) => return Err(RunError::Exc(Box::new(exc))),
                Some(_) => {
                    return Err(RunError::internal("break/continue signal escaped the frame"));
                }
            }
        }
    }

    /// Fetches one instruction, decoding its operand per addressing mode.
    fn fetch_decode(&mut self) -> RunResult<(Opcode, Operand)> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| RunError::internal("fetch with no active frame"))?;
        let offset = frame.ip;
        let bytecode = frame.code.bytecode();
        let byte = *bytecode
            .get(offset)
            .ok_or_else(|| RunError::internal("instruction pointer ran past the end of the bytecode"))?;
        frame.ip += 1;
        let op = Opcode::from_repr(byte).ok_or(RunError::UnknownOpcode { byte, offset })?;

        let mode = op.operand_mode();
        if mode == OperandMode::None {
            return Ok((op, Operand::None));
        }
        let (lo, hi) = match (bytecode.get(frame.ip), bytecode.get(frame.ip + 1)) {
            (Some(lo), Some(hi)) => (*lo, *hi),
            _ => return Err(RunError::internal("truncated operand at the end of the bytecode")),
        };
        frame.ip += 2;
        let arg = u16::from_le_bytes([lo, hi]);
        let operand = match mode {
            OperandMode::Const => Operand::Const(arg),
            OperandMode::Name => Operand::Name(arg),
            OperandMode::Local => Operand::Local(arg),
            OperandMode::CellFree => Operand::CellFree(arg),
            OperandMode::RelJump => Operand::Jump(frame.ip + usize::from(arg)),
            OperandMode::AbsJump => Operand::Jump(usize::from(arg)),
            OperandMode::Imm => Operand::Imm(arg),
            OperandMode::None => unreachable!("handled above"),
        };
        Ok((op, operand))
    }

    /// Dispatches one decoded instruction to its handler.
    fn exec_op(&mut self, op: Opcode, operand: Operand) -> RunResult<Option<Why>> {
        match op {
            // --- stack shuffles ---
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                let pair = self.pop_n(2)?;
                let [a, b]: [Value; 2] = into_array(pair)?;
                self.push(b)?;
                self.push(a)?;
            }
            Opcode::RotThree => {
                let triple = self.pop_n(3)?;
                let [a, b, c]: [Value; 3] = into_array(triple)?;
                self.push(c)?;
                self.push(a)?;
                self.push(b)?;
            }
            Opcode::DupTop => {
                let top = self.peek(1)?;
                self.push(top)?;
            }
            Opcode::DupTopTwo => {
                let a = self.peek(2)?;
                let b = self.peek(1)?;
                self.push(a)?;
                self.push(b)?;
            }

            // --- operators ---
            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                self.op_unary(op)?;
            }
            Opcode::BinarySubscr => self.op_binary_subscr()?,
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr => self.op_binary(binary_op_for(op))?,
            Opcode::InplacePower
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => self.op_inplace(binary_op_for(op))?,
            Opcode::CompareOp => self.op_compare(operand.imm())?,

            // --- subscripts ---
            Opcode::StoreSubscr => self.op_store_subscr()?,
            Opcode::DeleteSubscr => self.op_delete_subscr()?,

            // --- iteration ---
            Opcode::GetIter => {
                let value = self.pop()?;
                let iter = make_iter(value)?;
                self.push(iter)?;
            }
            Opcode::ForIter => {
                let iter = self.peek(1)?;
                match self.iter_next(&iter)? {
                    Some(value) => self.push(value)?,
                    None => {
                        self.pop()?;
                        self.jump(operand.jump())?;
                    }
                }
            }

            Opcode::PrintExpr => self.op_print_expr()?,

            // --- control transfer ---
            Opcode::BreakLoop => return Ok(Some(Why::Break)),
            Opcode::ContinueLoop => return Ok(Some(Why::Continue)),
            Opcode::ReturnValue => {
                let value = self.pop()?;
                return Ok(Some(Why::Return(value)));
            }
            Opcode::YieldValue => {
                let value = self.pop()?;
                return Ok(Some(Why::Yield(value)));
            }

            // --- blocks ---
            Opcode::SetupLoop => {
                let restart = self.current_frame()?.ip;
                self.current_frame_mut()?.push_block(BlockKind::Loop { restart }, operand.jump());
            }
            Opcode::SetupExcept => {
                self.current_frame_mut()?.push_block(BlockKind::ExceptGuard, operand.jump());
            }
            Opcode::SetupFinally => {
                self.current_frame_mut()?.push_block(BlockKind::Finally, operand.jump());
            }
            Opcode::PopBlock => {
                self.current_frame_mut()?.pop_block()?;
            }
            Opcode::PopExcept => self.op_pop_except()?,
            Opcode::EndFinally => return self.op_end_finally(),
            Opcode::Raise => self.op_raise(operand.imm())?,

            // --- comprehension appends ---
            Opcode::ListAppend => self.op_list_append(usize::from(operand.imm()))?,
            Opcode::SetAdd => self.op_set_add(usize::from(operand.imm()))?,
            Opcode::MapAdd => self.op_map_add(usize::from(operand.imm()))?,

            // --- constants and names ---
            Opcode::LoadConst => self.op_load_const(operand.index())?,
            Opcode::LoadName => self.op_load_name(operand.index())?,
            Opcode::StoreName => self.op_store_name(operand.index())?,
            Opcode::DeleteName => self.op_delete_name(operand.index())?,
            Opcode::LoadGlobal => self.op_load_global(operand.index())?,
            Opcode::StoreGlobal => self.op_store_global(operand.index())?,
            Opcode::DeleteGlobal => self.op_delete_global(operand.index())?,
            Opcode::LoadFast => self.op_load_fast(operand.index())?,
            Opcode::StoreFast => self.op_store_fast(operand.index())?,
            Opcode::DeleteFast => self.op_delete_fast(operand.index())?,
            Opcode::LoadDeref => self.op_load_deref(operand.index())?,
            Opcode::StoreDeref => self.op_store_deref(operand.index())?,
            Opcode::LoadClosure => self.op_load_closure(operand.index())?,
            Opcode::LoadLocals => self.op_load_locals()?,

            // --- attributes ---
            Opcode::LoadAttr => self.op_load_attr(operand.index())?,
            Opcode::StoreAttr => self.op_store_attr(operand.index())?,
            Opcode::DeleteAttr => self.op_delete_attr(operand.index())?,

            // --- jumps ---
            Opcode::JumpForward | Opcode::JumpAbsolute => self.jump(operand.jump())?,
            Opcode::PopJumpIfTrue => {
                if self.pop()?.is_truthy() {
                    self.jump(operand.jump())?;
                }
            }
            Opcode::PopJumpIfFalse => {
                if !self.pop()?.is_truthy() {
                    self.jump(operand.jump())?;
                }
            }
            Opcode::JumpIfTrueOrPop => {
                if self.peek(1)?.is_truthy() {
                    self.jump(operand.jump())?;
                } else {
                    self.pop()?;
                }
            }
            Opcode::JumpIfFalseOrPop => {
                if self.peek(1)?.is_truthy() {
                    self.pop()?;
                } else {
                    self.jump(operand.jump())?;
                }
            }

            // --- container builds ---
            Opcode::BuildTuple => self.op_build_tuple(usize::from(operand.imm()))?,
            Opcode::BuildList => self.op_build_list(usize::from(operand.imm()))?,
            Opcode::BuildSet => self.op_build_set(usize::from(operand.imm()))?,
            Opcode::BuildMap => self.op_build_map(usize::from(operand.imm()))?,
            Opcode::BuildString => self.op_build_string(usize::from(operand.imm()))?,
            Opcode::BuildSlice => self.op_build_slice(usize::from(operand.imm()))?,
            Opcode::UnpackSequence => self.op_unpack_sequence(usize::from(operand.imm()))?,

            // --- functions and calls ---
            Opcode::MakeFunction => self.op_make_function(usize::from(operand.imm()), false)?,
            Opcode::MakeClosure => self.op_make_function(usize::from(operand.imm()), true)?,
            Opcode::CallFunction => self.op_call_function(operand.imm())?,
            Opcode::CallFunctionVar => self.op_call_function_var(operand.imm())?,
            Opcode::CallFunctionKw => self.op_call_function_kw(operand.imm())?,
            Opcode::CallFunctionVarKw => self.op_call_function_var_kw(operand.imm())?,
            Opcode::LoadBuildClass => {
                self.push(Value::Builtin(crate::builtins::Builtin::BuildClass))?;
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------

    fn code_name(&self, idx: usize) -> RunResult<Rc<str>> {
        self.current_frame()?
            .code
            .names()
            .get(idx)
            .cloned()
            .ok_or_else(|| RunError::internal("name index out of range"))
    }

    fn code_varname(&self, idx: usize) -> RunResult<Rc<str>> {
        self.current_frame()?
            .code
            .varnames()
            .get(idx)
            .cloned()
            .ok_or_else(|| RunError::internal("local variable index out of range"))
    }

    fn code_cell_name(&self, idx: usize) -> RunResult<Rc<str>> {
        self.current_frame()?
            .code
            .cell_free_name(idx)
            .cloned()
            .ok_or_else(|| RunError::internal("cell/free variable index out of range"))
    }

    fn op_load_const(&mut self, idx: usize) -> RunResult<()> {
        let frame = self.current_frame()?;
        let constant = frame
            .code
            .consts()
            .get(idx)
            .ok_or_else(|| RunError::internal("constant index out of range"))?;
        let value = Value::from_const(constant);
        self.push(value)
    }

    /// `LoadName` read precedence: fast-local, then declared cell/free
    /// variable, then global, then builtin.
    fn op_load_name(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let frame = self.current_frame()?;
        let value = frame
            .locals
            .borrow()
            .get(&name)
            .cloned()
            .or_else(|| frame.cells.get(&name).map(Cell::get))
            .or_else(|| frame.globals.borrow().get(&name).cloned())
            .or_else(|| frame.builtins.borrow().get(&name).cloned())
            .ok_or_else(|| ExcType::NameError.raise(format!("name '{name}' is not defined")))?;
        self.push(value)
    }

    fn op_store_name(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let value = self.pop()?;
        self.current_frame()?.locals.borrow_mut().insert(name, value);
        Ok(())
    }

    fn op_delete_name(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        self.current_frame()?
            .locals
            .borrow_mut()
            .remove(&name)
            .map(drop)
            .ok_or_else(|| ExcType::NameError.raise(format!("name '{name}' is not defined")))
    }

    fn op_load_global(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let frame = self.current_frame()?;
        let value = frame
            .globals
            .borrow()
            .get(&name)
            .cloned()
            .or_else(|| frame.builtins.borrow().get(&name).cloned())
            .ok_or_else(|| ExcType::NameError.raise(format!("global name '{name}' is not defined")))?;
        self.push(value)
    }

    fn op_store_global(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        let value = self.pop()?;
        self.current_frame()?.globals.borrow_mut().insert(name, value);
        Ok(())
    }

    fn op_delete_global(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_name(idx)?;
        self.current_frame()?
            .globals
            .borrow_mut()
            .remove(&name)
            .map(drop)
            .ok_or_else(|| ExcType::NameError.raise(format!("global name '{name}' is not defined")))
    }

    fn op_load_fast(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_varname(idx)?;
        let value = self
            .current_frame()?
            .locals
            .borrow()
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                ExcType::UnboundLocalError.raise(format!("local variable '{name}' referenced before assignment"))
            })?;
        self.push(value)
    }

    fn op_store_fast(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_varname(idx)?;
        let value = self.pop()?;
        self.current_frame()?.locals.borrow_mut().insert(name, value);
        Ok(())
    }

    fn op_delete_fast(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_varname(idx)?;
        self.current_frame()?
            .locals
            .borrow_mut()
            .remove(&name)
            .map(drop)
            .ok_or_else(|| {
                ExcType::UnboundLocalError.raise(format!("local variable '{name}' referenced before assignment"))
            })
    }

    fn op_load_deref(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_cell_name(idx)?;
        let value = self
            .current_frame()?
            .cells
            .get(&name)
            .map(Cell::get)
            .ok_or_else(|| RunError::internal(format!("no cell bound for variable '{name}'")))?;
        self.push(value)
    }

    fn op_store_deref(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_cell_name(idx)?;
        let value = self.pop()?;
        self.current_frame()?
            .cells
            .get(&name)
            .ok_or_else(|| RunError::internal(format!("no cell bound for variable '{name}'")))?
            .set(value);
        Ok(())
    }

    fn op_load_closure(&mut self, idx: usize) -> RunResult<()> {
        let name = self.code_cell_name(idx)?;
        let cell = self
            .current_frame()?
            .cells
            .get(&name)
            .cloned()
            .ok_or_else(|| RunError::internal(format!("no cell bound for variable '{name}'")))?;
        self.push(Value::Cell(cell))
    }

    fn op_load_locals(&mut self) -> RunResult<()> {
        let frame = self.current_frame()?;
        let mut map = crate::value::DictMap::default();
        for (name, value) in frame.locals.borrow().iter() {
            map.insert(crate::value::Key(Value::Str(Rc::clone(name))), value.clone());
        }
        self.push(Value::new_dict(map))
    }

    fn op_print_expr(&mut self) -> RunResult<()> {
        let value = self.pop()?;
        let text = value.repr();
        self.print_writer
            .stdout_write(text.into())
            .and_then(|()| self.print_writer.stdout_push('\n'))
            .map_err(|_| ExcType::RuntimeError.raise("output writer failed"))
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Advances an iterator value; `Ok(None)` signals exhaustion.
    ///
    /// Generators are advanced by resuming their frame; a `StopIteration`
    /// out of the resume is exhaustion, any other error propagates.
    pub(crate) fn iter_next(&mut self, value: &Value) -> RunResult<Option<Value>> {
        match value {
            Value::Iter(iter) => Ok(iter.borrow_mut().next()),
            Value::Generator(generator) => match self.gen_next(generator) {
                Ok(item) => Ok(Some(item)),
                Err(RunError::Exc(exc)) if exc.exc_type == ExcType::StopIteration => Ok(None),
                Err(err) => Err(err),
            },
            other => Err(ExcType::TypeError.raise(format!("'{}' object is not an iterator", other.type_name()))),
        }
    }

    // ------------------------------------------------------------------
    // Generators
    // ------------------------------------------------------------------

    /// Drives one pull of a generator.
    ///
    /// The generator's frame is moved onto the call stack for the duration
    /// of the pull - the call stack itself is the caller chain, so nested
    /// calls during the pull see correct frames and no stale back-pointer
    /// is retained afterwards. On the first pull the frame starts at
    /// instruction zero; on later pulls the resume sentinel the suspended
    /// `yield` expects is pushed first.
    pub(crate) fn gen_next(&mut self, generator: &Rc<RefCell<Generator>>) -> RunResult<Value> {
        let frame = {
            let mut g = generator.borrow_mut();
            match g.state {
                GeneratorState::Finished => return Err(ExcType::StopIteration.raise_plain()),
                GeneratorState::Running => {
                    return Err(ExcType::ValueError.raise("generator already executing"));
                }
                GeneratorState::NotStarted | GeneratorState::Suspended => {}
            }
            let mut frame = g
                .frame
                .take()
                .ok_or_else(|| RunError::internal("generator frame missing"))?;
            if g.state == GeneratorState::Suspended {
                frame.push(Value::None);
            }
            g.state = GeneratorState::Running;
            frame
        };

        let result = self.run_frame(frame);
        let mut g = generator.borrow_mut();
        match result {
            Ok((frame, FrameExit::Yield(value))) => {
                g.frame = Some(frame);
                g.state = GeneratorState::Suspended;
                Ok(value)
            }
            Ok((_, FrameExit::Return(_))) => {
                g.state = GeneratorState::Finished;
                Err(ExcType::StopIteration.raise_plain())
            }
            Err(err) => {
                g.state = GeneratorState::Finished;
                Err(err)
            }
        }
    }
}

/// Wraps an iterable value in a live iterator.
///
/// Iterators and generators pass through unchanged; dict and set iteration
/// snapshots the keys at this point.
pub(crate) fn make_iter(value: Value) -> RunResult<Value> {
    let iter = match value {
        Value::Iter(_) | Value::Generator(_) => return Ok(value),
        Value::List(items) => ValueIter::List { items, index: 0 },
        Value::Tuple(items) => ValueIter::Tuple { items, index: 0 },
        Value::Str(text) => ValueIter::Str { text, byte_index: 0 },
        Value::Dict(map) => {
            let items = map.borrow().keys().map(|k| k.0.clone()).collect();
            ValueIter::Snapshot { items, index: 0 }
        }
        Value::Set(set) => {
            let items = set.borrow().iter().map(|k| k.0.clone()).collect();
            ValueIter::Snapshot { items, index: 0 }
        }
        other => {
            return Err(ExcType::TypeError.raise(format!("'{}' object is not iterable", other.type_name())));
        }
    };
    Ok(Value::Iter(Rc::new(RefCell::new(iter))))
}

/// Converts a popped-in-order vector into a fixed-size array.
pub(crate) fn into_array<const N: usize>(values: Vec<Value>) -> RunResult<[Value; N]> {
    values
        .try_into()
        .map_err(|_| RunError::internal("operand stack shape mismatch"))
}


/// Maps a `Binary*`/`Inplace*` opcode to its arithmetic operator.
fn binary_op_for(op: Opcode) -> BinaryOp {
    match op {
        Opcode::BinaryPower | Opcode::InplacePower => BinaryOp::Pow,
        Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinaryOp::Mul,
        Opcode::BinaryModulo | Opcode::InplaceModulo => BinaryOp::Mod,
        Opcode::BinaryAdd | Opcode::InplaceAdd => BinaryOp::Add,
        Opcode::BinarySubtract | Opcode::InplaceSubtract => BinaryOp::Sub,
        Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => BinaryOp::FloorDiv,
        Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => BinaryOp::TrueDiv,
        Opcode::BinaryLshift | Opcode::InplaceLshift => BinaryOp::Lshift,
        Opcode::BinaryRshift | Opcode::InplaceRshift => BinaryOp::Rshift,
        Opcode::BinaryAnd | Opcode::InplaceAnd => BinaryOp::BitAnd,
        Opcode::BinaryXor | Opcode::InplaceXor => BinaryOp::BitXor,
        Opcode::BinaryOr | Opcode::InplaceOr => BinaryOp::BitOr,
        _ => unreachable!("not an arithmetic opcode"),
    }
}
