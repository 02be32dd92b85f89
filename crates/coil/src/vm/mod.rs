//! The frame engine: a stack VM with explicit block-stack unwinding.
//!
//! Each [`Frame`] owns its value stack, block stack, and instruction
//! pointer, so a suspended frame (a generator) is fully described by its
//! own state - nothing about it lives on the host call stack. The dispatch
//! loop executes one opcode at a time; any non-local control transfer
//! produces an [`UnwindReason`] which the unroll algorithm feeds through
//! the active frame blocks.
//!
//! # Module Structure
//!
//! - `unwind` - unwind reasons, tokens, and frame blocks
//! - `call` - argument decoding and calls into interpreted functions

mod call;
mod unwind;

use std::rc::Rc;

use smallvec::SmallVec;

pub use unwind::{BlockKind, FrameBlock, UnwindReason, UnwindToken};

use crate::{
    bytecode::{Code, CodeFlags, CompareArg, Opcode},
    error::{ExcKind, RunError, RunResult, VmException},
    function::FunctionObj,
    generator::{Advance, GeneratorIterator},
    space::{Args, BinaryOp, ObjectSpace, UnaryOp},
    tracer::VmTracer,
    value::{CellRef, Namespace, Value, new_namespace},
};
use unwind::{except_handler_slots, finally_handler_slots};

/// Default limit on nested interpreted calls.
///
/// Interpreted calls nest on the host stack, so the limit is deliberately
/// conservative; raise it only with a correspondingly larger host stack.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// What one dispatch step asks the main loop to do next.
pub(crate) enum Flow {
    /// Keep executing sequentially.
    Next,
    /// Leave sequential dispatch and unroll the block stack.
    Unwind(UnwindReason),
}

/// How a frame left its dispatch loop.
#[derive(Debug)]
pub(crate) enum FrameExit {
    /// The frame returned a value (or fell off the end).
    Return(Value),
    /// The frame suspended at a yield; its state is intact for resumption.
    Yield(Value),
}

/// Result of [`ExecutionContext::run`].
#[derive(Debug)]
pub enum FrameOutcome {
    /// Ordinary code ran to completion.
    Finished(Value),
    /// The code object is generator-flagged; nothing ran yet.
    Generator(Rc<GeneratorIterator>),
}

/// Storage for a frame's local variables.
#[derive(Debug)]
enum Locals {
    /// Indexed slots; used when the code is optimized (functions).
    Fast(Vec<Option<Value>>),
    /// Named mapping; used for module-level code.
    Named(Namespace),
}

/// A single activation of a [`Code`] object.
///
/// Mutated only by the one logical thread currently executing it; a
/// generator's frame is checked out for the duration of one `advance` call.
#[derive(Debug)]
pub struct Frame {
    code: Rc<Code>,
    value_stack: Vec<Value>,
    block_stack: SmallVec<[FrameBlock; 4]>,
    globals: Namespace,
    locals: Locals,
    /// Cell variables first, then cells received from the closure.
    cells: Vec<CellRef>,
    next_instr: usize,
    /// Offset of the currently-executing instruction, for tracebacks.
    last_instr: usize,
    /// Most recent exception seen by this frame, for bare `raise`.
    last_exception: Option<Box<VmException>>,
}

impl Frame {
    /// Creates a frame for free-standing (module-level) execution.
    ///
    /// `closure` must supply exactly one cell per free variable of `code`.
    pub fn new(code: Rc<Code>, globals: Namespace, closure: Vec<CellRef>) -> RunResult<Self> {
        let locals = if code.is_optimized() {
            Locals::Fast(vec![None; code.local_count as usize])
        } else if code.flags.contains(CodeFlags::NEWLOCALS) {
            Locals::Named(new_namespace())
        } else {
            Locals::Named(globals.clone())
        };
        Self::build(code, globals, closure, locals)
    }

    /// Creates a frame for a function call with pre-bound fast locals.
    pub(crate) fn for_call(func: &FunctionObj, fast_locals: Vec<Option<Value>>) -> RunResult<Self> {
        Self::build(
            func.code.clone(),
            func.globals.clone(),
            func.closure.clone(),
            Locals::Fast(fast_locals),
        )
    }

    fn build(code: Rc<Code>, globals: Namespace, closure: Vec<CellRef>, mut locals: Locals) -> RunResult<Self> {
        if closure.len() != code.free_names.len() {
            return Err(RunError::internal(format!(
                "code '{}' expects {} closure cells, got {}",
                code.name,
                code.free_names.len(),
                closure.len()
            )));
        }
        let mut cells: Vec<CellRef> = (0..code.cell_names.len()).map(|_| CellRef::empty()).collect();
        // captured parameters move from their local slot into the cell
        if let Locals::Fast(slots) = &mut locals {
            for (cell, cell_name) in cells.iter().zip(&code.cell_names) {
                if let Some(slot) = code.local_names.iter().position(|name| name == cell_name)
                    && let Some(value) = slots[slot].take()
                {
                    cell.set(value);
                }
            }
        }
        cells.extend(closure);
        let stack_capacity = code.stack_depth as usize;
        Ok(Self {
            code,
            value_stack: Vec::with_capacity(stack_capacity),
            block_stack: SmallVec::new(),
            globals,
            locals,
            cells,
            next_instr: 0,
            last_instr: 0,
            last_exception: None,
        })
    }

    /// The code object this frame executes.
    #[must_use]
    pub fn code(&self) -> &Rc<Code> {
        &self.code
    }

    /// The frame's globals mapping.
    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    /// Runs the dispatch loop until the frame returns, suspends, or raises
    /// uncaught.
    pub(crate) fn execute<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
    ) -> RunResult<FrameExit> {
        loop {
            if let Some(exc) = ctx.tracer.interrupt() {
                match self.unroll(UnwindReason::Raise(Box::new(exc)), ctx)? {
                    Some(exit) => return Ok(exit),
                    None => continue,
                }
            }
            self.last_instr = self.next_instr;
            let mut reason = match self.dispatch_one(ctx) {
                Ok(Flow::Next) => continue,
                Ok(Flow::Unwind(reason)) => reason,
                Err(RunError::Exc(exc)) => UnwindReason::Raise(exc),
                Err(fatal) => return Err(fatal),
            };
            if let UnwindReason::Raise(exc) = &mut reason {
                exc.set_line_once(self.code.line_for_offset(self.last_instr));
                ctx.tracer.on_exception(exc.kind);
                self.last_exception = Some(exc.clone());
            }
            match self.unroll(reason, ctx)? {
                Some(exit) => return Ok(exit),
                None => {}
            }
        }
    }

    /// Feeds an unwind reason through the block stack.
    ///
    /// Returns `Ok(None)` when a block handled the reason and dispatch
    /// resumes at the new instruction pointer, `Ok(Some(exit))` when the
    /// frame is done (return or suspension), and `Err` for uncaught
    /// exceptions and corruption.
    fn unroll<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        reason: UnwindReason,
        ctx: &mut ExecutionContext<S, Tr>,
    ) -> RunResult<Option<FrameExit>> {
        // Yield suspends immediately: the block stack must survive for the
        // frame to be resumable.
        let mut reason = match reason {
            UnwindReason::Yield(value) => {
                ctx.tracer.on_yield();
                return Ok(Some(FrameExit::Yield(value)));
            }
            other => other,
        };
        while let Some(block) = self.block_stack.pop() {
            self.value_stack.truncate(block.stack_depth as usize);
            match block.kind {
                BlockKind::Loop => match reason {
                    UnwindReason::Break => {
                        self.next_instr = block.handler as usize;
                        return Ok(None);
                    }
                    UnwindReason::Continue(target) => {
                        // the loop stays active: a later break/continue in
                        // the body must still find it
                        self.block_stack.push(block);
                        self.next_instr = target as usize;
                        return Ok(None);
                    }
                    other => reason = other,
                },
                BlockKind::Except => match reason {
                    UnwindReason::Raise(exc) => {
                        for slot in except_handler_slots(exc) {
                            self.value_stack.push(slot);
                        }
                        self.next_instr = block.handler as usize;
                        return Ok(None);
                    }
                    other => reason = other,
                },
                BlockKind::Finally => {
                    for slot in finally_handler_slots(reason) {
                        self.value_stack.push(slot);
                    }
                    self.next_instr = block.handler as usize;
                    return Ok(None);
                }
            }
        }
        match reason {
            UnwindReason::Break | UnwindReason::Continue(_) => {
                Err(RunError::corruption("break/continue outside of any loop block"))
            }
            UnwindReason::Return(value) => Ok(Some(FrameExit::Return(value))),
            UnwindReason::Raise(mut exc) => {
                exc.record_frame(
                    &self.code.filename,
                    &self.code.name,
                    self.code.line_for_offset(self.last_instr),
                );
                Err(RunError::Exc(exc))
            }
            UnwindReason::Yield(_) => unreachable!("yield handled before unrolling"),
        }
    }

    /// Fetches and executes one instruction.
    fn dispatch_one<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
    ) -> RunResult<Flow> {
        let (opcode, arg) = self.fetch()?;
        ctx.tracer.on_instruction(self.last_instr, opcode, self.value_stack.len());
        match opcode {
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                let len = self.value_stack.len();
                if len < 2 {
                    return Err(self.underflow(opcode));
                }
                self.value_stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let len = self.value_stack.len();
                if len < 3 {
                    return Err(self.underflow(opcode));
                }
                let top = self.value_stack.pop().expect("checked length");
                self.value_stack.insert(len - 3, top);
            }
            Opcode::DupTop => {
                let top = self.peek()?.clone();
                self.push(top);
            }
            Opcode::Nop => {}

            Opcode::UnaryPositive => self.unary_op(ctx, UnaryOp::Pos)?,
            Opcode::UnaryNegative => self.unary_op(ctx, UnaryOp::Neg)?,
            Opcode::UnaryInvert => self.unary_op(ctx, UnaryOp::Invert)?,
            Opcode::UnaryNot => {
                let value = self.pop()?;
                let truth = ctx.space.is_true(&value)?;
                self.push(Value::Bool(!truth));
            }

            Opcode::BinaryPower => self.binary_op(ctx, BinaryOp::Pow)?,
            Opcode::BinaryMultiply => self.binary_op(ctx, BinaryOp::Mul)?,
            Opcode::BinaryDivide => self.binary_op(ctx, BinaryOp::Div)?,
            Opcode::BinaryFloorDivide => self.binary_op(ctx, BinaryOp::FloorDiv)?,
            Opcode::BinaryModulo => self.binary_op(ctx, BinaryOp::Mod)?,
            Opcode::BinaryAdd => self.binary_op(ctx, BinaryOp::Add)?,
            Opcode::BinarySubtract => self.binary_op(ctx, BinaryOp::Sub)?,
            Opcode::BinaryLshift => self.binary_op(ctx, BinaryOp::Lshift)?,
            Opcode::BinaryRshift => self.binary_op(ctx, BinaryOp::Rshift)?,
            Opcode::BinaryAnd => self.binary_op(ctx, BinaryOp::And)?,
            Opcode::BinaryXor => self.binary_op(ctx, BinaryOp::Xor)?,
            Opcode::BinaryOr => self.binary_op(ctx, BinaryOp::Or)?,
            Opcode::BinarySubscr => {
                let key = self.pop()?;
                let obj = self.pop()?;
                let value = ctx.space.getitem(&obj, &key)?;
                self.push(value);
            }
            Opcode::StoreSubscr => {
                let key = self.pop()?;
                let obj = self.pop()?;
                let value = self.pop()?;
                ctx.space.setitem(&obj, &key, value)?;
            }
            Opcode::DeleteSubscr => {
                let key = self.pop()?;
                let obj = self.pop()?;
                ctx.space.delitem(&obj, &key)?;
            }

            Opcode::GetIter => {
                let value = self.pop()?;
                let iter = if matches!(value, Value::Generator(_)) {
                    value
                } else {
                    ctx.space.iter(value)?
                };
                self.push(iter);
            }
            Opcode::ForIter => {
                let iter = self.peek()?.clone();
                match ctx.iter_next(&iter)? {
                    Some(item) => self.push(item),
                    // the iterator stays: it sits below the loop block's
                    // entry depth so that continue-truncation preserves it,
                    // and the loop epilogue discards it
                    None => self.next_instr += arg as usize,
                }
            }

            Opcode::PopBlock => {
                let block = self
                    .block_stack
                    .pop()
                    .ok_or_else(|| RunError::corruption("PopBlock on an empty block stack"))?;
                self.value_stack.truncate(block.stack_depth as usize);
                if block.kind == BlockKind::Finally {
                    // complete the uniform three-slot layout: the bytecode
                    // contributes the bottom slot, these are the placeholders
                    self.push(Value::None);
                    self.push(Value::None);
                }
            }
            Opcode::EndFinally => {
                self.pop()?;
                self.pop()?;
                let bottom = self.pop()?;
                match bottom {
                    Value::None => {}
                    Value::Token(token) => return Ok(Flow::Unwind(token.into_reason())),
                    other => {
                        return Err(RunError::corruption(format!(
                            "EndFinally found '{}' instead of an unwind token",
                            other.type_name()
                        )));
                    }
                }
            }
            Opcode::BreakLoop => return Ok(Flow::Unwind(UnwindReason::Break)),
            Opcode::ContinueLoop => return Ok(Flow::Unwind(UnwindReason::Continue(arg))),
            Opcode::ReturnValue => {
                let value = self.pop()?;
                return Ok(Flow::Unwind(UnwindReason::Return(value)));
            }
            Opcode::YieldValue => {
                let value = self.pop()?;
                return Ok(Flow::Unwind(UnwindReason::Yield(value)));
            }
            Opcode::RaiseVarargs => return self.op_raise(ctx, arg),

            Opcode::LoadConst => {
                let value = self
                    .code
                    .constants
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| RunError::corruption(format!("constant index {arg} out of range")))?;
                self.push(value);
            }

            Opcode::LoadFast => {
                let value = self.fast_slot(arg)?.clone().ok_or_else(|| self.unbound_local(arg))?;
                self.push(value);
            }
            Opcode::StoreFast => {
                let value = self.pop()?;
                *self.fast_slot_mut(arg)? = Some(value);
            }
            Opcode::DeleteFast => {
                let slot = self.fast_slot_mut(arg)?;
                if slot.take().is_none() {
                    return Err(self.unbound_local(arg));
                }
            }

            Opcode::LoadGlobal => {
                let name = self.global_name(arg)?;
                let value = self.globals.borrow().get(&name).cloned();
                let value = value.or_else(|| ctx.space.builtin(&name));
                match value {
                    Some(value) => self.push(value),
                    None => {
                        return Err(RunError::exc(
                            ExcKind::NameError,
                            format!("global name '{name}' is not defined"),
                        ));
                    }
                }
            }
            Opcode::StoreGlobal => {
                let name = self.global_name(arg)?;
                let value = self.pop()?;
                self.globals.borrow_mut().insert(name, value);
            }
            Opcode::DeleteGlobal => {
                let name = self.global_name(arg)?;
                if self.globals.borrow_mut().remove(&name).is_none() {
                    return Err(RunError::exc(
                        ExcKind::NameError,
                        format!("global name '{name}' is not defined"),
                    ));
                }
            }

            Opcode::LoadName => {
                let name = self.global_name(arg)?;
                let value = self
                    .named_locals()?
                    .borrow()
                    .get(&name)
                    .cloned()
                    .or_else(|| self.globals.borrow().get(&name).cloned())
                    .or_else(|| ctx.space.builtin(&name));
                match value {
                    Some(value) => self.push(value),
                    None => {
                        return Err(RunError::exc(ExcKind::NameError, format!("name '{name}' is not defined")));
                    }
                }
            }
            Opcode::StoreName => {
                let name = self.global_name(arg)?;
                let value = self.pop()?;
                self.named_locals()?.borrow_mut().insert(name, value);
            }
            Opcode::DeleteName => {
                let name = self.global_name(arg)?;
                if self.named_locals()?.borrow_mut().remove(&name).is_none() {
                    return Err(RunError::exc(ExcKind::NameError, format!("name '{name}' is not defined")));
                }
            }

            Opcode::LoadAttr => {
                let name = self.global_name(arg)?;
                let obj = self.pop()?;
                let value = ctx.space.getattr(&obj, &name)?;
                self.push(value);
            }
            Opcode::StoreAttr => {
                let name = self.global_name(arg)?;
                let obj = self.pop()?;
                let value = self.pop()?;
                ctx.space.setattr(&obj, &name, value)?;
            }
            Opcode::DeleteAttr => {
                let name = self.global_name(arg)?;
                let obj = self.pop()?;
                ctx.space.delattr(&obj, &name)?;
            }

            Opcode::LoadDeref => {
                let cell = self.cell(arg)?;
                match cell.get() {
                    Some(value) => self.push(value),
                    None => return Err(self.unbound_deref(arg)),
                }
            }
            Opcode::StoreDeref => {
                let value = self.pop()?;
                self.cell(arg)?.set(value);
            }
            Opcode::LoadClosure => {
                let cell = self.cell(arg)?.clone();
                self.push(Value::Cell(cell));
            }

            Opcode::BuildTuple => {
                let items = self.pop_many(arg as usize)?;
                self.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = self.pop_many(arg as usize)?;
                self.push(Value::list(items));
            }
            Opcode::BuildMap => {
                let mut entries = Vec::with_capacity(arg as usize);
                for _ in 0..arg {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    entries.push((key, value));
                }
                entries.reverse();
                let mut dict = crate::value::Dict::new();
                for (key, value) in entries {
                    dict.insert(key, value);
                }
                self.push(Value::Dict(Rc::new(std::cell::RefCell::new(dict))));
            }
            Opcode::UnpackSequence => {
                let expected = arg as usize;
                let value = self.pop()?;
                let items = ctx.iterate(value)?;
                if items.len() < expected {
                    return Err(RunError::exc(
                        ExcKind::ValueError,
                        format!("need more than {} values to unpack", items.len()),
                    ));
                }
                if items.len() > expected {
                    return Err(RunError::exc(ExcKind::ValueError, "too many values to unpack"));
                }
                for item in items.into_iter().rev() {
                    self.push(item);
                }
            }

            Opcode::CompareOp => {
                let cmp = CompareArg::from_repr(arg as u8)
                    .ok_or_else(|| RunError::corruption(format!("unknown comparison operand {arg}")))?;
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = match cmp {
                    CompareArg::Is => Value::Bool(lhs.is_same(&rhs)),
                    CompareArg::IsNot => Value::Bool(!lhs.is_same(&rhs)),
                    CompareArg::ExcMatch => Value::Bool(exc_match(&lhs, &rhs)?),
                    _ => ctx.space.compare(cmp, &lhs, &rhs)?,
                };
                self.push(result);
            }

            Opcode::JumpForward => self.next_instr += arg as usize,
            Opcode::JumpAbsolute => self.next_instr = arg as usize,
            Opcode::JumpIfFalse => {
                let value = self.pop()?;
                if !ctx.space.is_true(&value)? {
                    self.next_instr += arg as usize;
                }
            }
            Opcode::JumpIfTrue => {
                let value = self.pop()?;
                if ctx.space.is_true(&value)? {
                    self.next_instr += arg as usize;
                }
            }

            Opcode::SetupLoop => self.push_block(BlockKind::Loop, arg),
            Opcode::SetupExcept => self.push_block(BlockKind::Except, arg),
            Opcode::SetupFinally => self.push_block(BlockKind::Finally, arg),

            Opcode::CallFunction | Opcode::CallFunctionVar | Opcode::CallFunctionKw | Opcode::CallFunctionVarKw => {
                self.op_call(ctx, opcode, arg)?;
            }
            Opcode::MakeFunction => self.op_make_function(arg, false)?,
            Opcode::MakeClosure => self.op_make_function(arg, true)?,

            Opcode::ExtendedArg => {
                return Err(RunError::corruption("dangling widening prefix"));
            }
        }
        Ok(Flow::Next)
    }

    fn op_raise<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
        arg: u32,
    ) -> RunResult<Flow> {
        let exc = match arg {
            0 => match &self.last_exception {
                Some(exc) => exc.clone(),
                None => {
                    return Err(RunError::exc(ExcKind::RuntimeError, "no active exception to re-raise"));
                }
            },
            1 => {
                let value = self.pop()?;
                to_exception(&ctx.space, value, None)?
            }
            2 => {
                let value = self.pop()?;
                let exc_type = self.pop()?;
                to_exception(&ctx.space, exc_type, Some(value))?
            }
            _ => {
                return Err(RunError::corruption(format!("RaiseVarargs with operand {arg}")));
            }
        };
        Ok(Flow::Unwind(UnwindReason::Raise(exc)))
    }

    fn unary_op<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
        op: UnaryOp,
    ) -> RunResult<()> {
        let value = self.pop()?;
        let result = ctx.space.unary(op, value)?;
        self.push(result);
        Ok(())
    }

    fn binary_op<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
        op: BinaryOp,
    ) -> RunResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = ctx.space.binary(op, lhs, rhs)?;
        self.push(result);
        Ok(())
    }

    fn push_block(&mut self, kind: BlockKind, arg: u32) {
        self.block_stack.push(FrameBlock {
            kind,
            handler: (self.next_instr + arg as usize) as u32,
            stack_depth: self.value_stack.len() as u32,
        });
    }

    // --- fetch & stack plumbing ---

    fn fetch_byte(&mut self) -> RunResult<u8> {
        let byte = self
            .code
            .bytecode
            .get(self.next_instr)
            .copied()
            .ok_or_else(|| RunError::corruption("instruction pointer past the end of bytecode"))?;
        self.next_instr += 1;
        Ok(byte)
    }

    fn fetch(&mut self) -> RunResult<(Opcode, u32)> {
        let byte = self.fetch_byte()?;
        let mut opcode =
            Opcode::from_repr(byte).ok_or_else(|| RunError::corruption(format!("unknown opcode byte {byte}")))?;
        let mut high = 0u32;
        if opcode == Opcode::ExtendedArg {
            high = u32::from(self.fetch_byte()?);
            let next = self.fetch_byte()?;
            opcode = Opcode::from_repr(next)
                .ok_or_else(|| RunError::corruption(format!("unknown opcode byte {next} after widening prefix")))?;
            if !opcode.has_arg() {
                return Err(RunError::corruption("widening prefix before an operand-less opcode"));
            }
        }
        let arg = if opcode.has_arg() {
            (high << 8) | u32::from(self.fetch_byte()?)
        } else {
            0
        };
        Ok((opcode, arg))
    }

    fn push(&mut self, value: Value) {
        self.value_stack.push(value);
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.value_stack
            .pop()
            .ok_or_else(|| RunError::corruption("value stack underflow"))
    }

    /// Pops `count` values, restoring their push order.
    fn pop_many(&mut self, count: usize) -> RunResult<Vec<Value>> {
        if self.value_stack.len() < count {
            return Err(RunError::corruption("value stack underflow"));
        }
        Ok(self.value_stack.split_off(self.value_stack.len() - count))
    }

    fn peek(&self) -> RunResult<&Value> {
        self.value_stack
            .last()
            .ok_or_else(|| RunError::corruption("value stack underflow"))
    }

    fn underflow(&self, opcode: Opcode) -> RunError {
        RunError::corruption(format!("value stack underflow in {opcode}"))
    }

    // --- name plumbing ---

    fn global_name(&self, arg: u32) -> RunResult<String> {
        self.code
            .global_names
            .get(arg as usize)
            .cloned()
            .ok_or_else(|| RunError::corruption(format!("name index {arg} out of range")))
    }

    fn fast_slot(&self, arg: u32) -> RunResult<&Option<Value>> {
        let Locals::Fast(slots) = &self.locals else {
            return Err(RunError::corruption("fast-local opcode in an unoptimized frame"));
        };
        slots
            .get(arg as usize)
            .ok_or_else(|| RunError::corruption(format!("local slot {arg} out of range")))
    }

    fn fast_slot_mut(&mut self, arg: u32) -> RunResult<&mut Option<Value>> {
        let Locals::Fast(slots) = &mut self.locals else {
            return Err(RunError::corruption("fast-local opcode in an unoptimized frame"));
        };
        slots
            .get_mut(arg as usize)
            .ok_or_else(|| RunError::corruption(format!("local slot {arg} out of range")))
    }

    fn named_locals(&self) -> RunResult<&Namespace> {
        match &self.locals {
            Locals::Named(map) => Ok(map),
            Locals::Fast(_) => Err(RunError::corruption("named-local opcode in an optimized frame")),
        }
    }

    fn cell(&self, arg: u32) -> RunResult<&CellRef> {
        self.cells
            .get(arg as usize)
            .ok_or_else(|| RunError::corruption(format!("cell index {arg} out of range")))
    }

    fn unbound_local(&self, arg: u32) -> RunError {
        let name = self
            .code
            .local_names
            .get(arg as usize)
            .map_or("?", String::as_str);
        RunError::exc(
            ExcKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    fn unbound_deref(&self, arg: u32) -> RunError {
        let index = arg as usize;
        if index < self.code.cell_names.len() {
            RunError::exc(
                ExcKind::UnboundLocalError,
                format!(
                    "local variable '{}' referenced before assignment",
                    self.code.cell_names[index]
                ),
            )
        } else {
            let name = self
                .code
                .free_names
                .get(index - self.code.cell_names.len())
                .map_or("?", String::as_str);
            RunError::exc(
                ExcKind::NameError,
                format!("free variable '{name}' referenced before assignment in enclosing scope"),
            )
        }
    }
}

/// `except` clause matching: does the raised exception match the handler's
/// class (or tuple of classes)?
fn exc_match(exc: &Value, matcher: &Value) -> RunResult<bool> {
    let kind = match exc {
        Value::ExcInstance(exc) => exc.kind,
        Value::ExcType(kind) => *kind,
        other => {
            return Err(RunError::exc(
                ExcKind::TypeError,
                format!("cannot match '{}' as an exception", other.type_name()),
            ));
        }
    };
    let matches_single = |candidate: &Value| match candidate {
        Value::ExcType(handler) => Ok(kind.is_subclass_of(*handler)),
        other => Err(RunError::exc(
            ExcKind::TypeError,
            format!(
                "catching '{}' that does not inherit from BaseException is not allowed",
                other.type_name()
            ),
        )),
    };
    match matcher {
        Value::Tuple(candidates) => {
            for candidate in candidates.iter() {
                if matches_single(candidate)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        single => matches_single(single),
    }
}

/// Normalizes a raised value into an exception.
///
/// `extra` is the separate value of the two-argument raise form; it becomes
/// the message of a freshly-constructed instance.
fn to_exception<S: ObjectSpace>(space: &S, value: Value, extra: Option<Value>) -> RunResult<Box<VmException>> {
    match value {
        Value::ExcInstance(exc) => {
            if extra.is_some_and(|extra| !matches!(extra, Value::None)) {
                return Err(RunError::exc(
                    ExcKind::TypeError,
                    "instance exception may not have a separate value",
                ));
            }
            Ok(exc)
        }
        Value::ExcType(kind) => {
            let message = match extra {
                None | Some(Value::None) => String::new(),
                Some(Value::Str(s)) => s,
                Some(other) => space.repr(&other),
            };
            Ok(Box::new(VmException::new(kind, message)))
        }
        other => Err(RunError::exc(
            ExcKind::TypeError,
            format!("exceptions must derive from BaseException, not '{}'", other.type_name()),
        )),
    }
}

/// One logical thread of control: a space handle, a tracer, and the nested
/// call discipline.
///
/// Concurrency at the process level means one `ExecutionContext` per OS or
/// green thread, each with its own frame chain; frames are never shared
/// across contexts.
#[derive(Debug)]
pub struct ExecutionContext<S: ObjectSpace, Tr: VmTracer> {
    pub space: S,
    pub tracer: Tr,
    /// Limit on nested interpreted calls before `RecursionError`.
    pub max_call_depth: usize,
    call_depth: usize,
}

impl<S: ObjectSpace, Tr: VmTracer> ExecutionContext<S, Tr> {
    pub fn new(space: S, tracer: Tr) -> Self {
        Self {
            space,
            tracer,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            call_depth: 0,
        }
    }

    /// Runs a frame to its outcome.
    ///
    /// A generator-flagged code object does not execute at all: the frame
    /// is parked in a [`GeneratorIterator`] and returned to the caller.
    pub fn run(&mut self, mut frame: Frame) -> RunResult<FrameOutcome> {
        if frame.code.is_generator() {
            return Ok(FrameOutcome::Generator(Rc::new(GeneratorIterator::new(frame))));
        }
        match frame.execute(self)? {
            FrameExit::Return(value) => Ok(FrameOutcome::Finished(value)),
            FrameExit::Yield(_) => Err(RunError::corruption("yield in a non-generator frame")),
        }
    }

    /// Assembles a fresh globals namespace and runs `code` in it.
    pub fn run_module(&mut self, code: &Rc<Code>) -> RunResult<Value> {
        let globals = new_namespace();
        self.run_module_in(code, &globals)
    }

    /// Runs `code` at module level against an existing globals namespace.
    pub fn run_module_in(&mut self, code: &Rc<Code>, globals: &Namespace) -> RunResult<Value> {
        let frame = Frame::new(code.clone(), globals.clone(), Vec::new())?;
        match self.run(frame)? {
            FrameOutcome::Finished(value) => Ok(value),
            FrameOutcome::Generator(generator) => Ok(Value::Generator(generator)),
        }
    }

    /// Calls a value with already-decoded arguments.
    ///
    /// Interpreted functions run in a nested frame; generator functions
    /// return their iterator; exception classes construct instances;
    /// everything else is delegated to the space.
    pub fn call_value(&mut self, callee: &Value, args: Args) -> RunResult<Value> {
        match callee {
            Value::Function(func) => self.call_function(&func.clone(), args),
            Value::ExcType(kind) => construct_exception(&self.space, *kind, args),
            _ => self.space.call(callee, args),
        }
    }

    /// Advances any iterator value, including generators.
    pub fn iter_next(&mut self, iter: &Value) -> RunResult<Option<Value>> {
        match iter {
            Value::Generator(generator) => match generator.clone().advance(self)? {
                Advance::Yielded(value) => Ok(Some(value)),
                Advance::Exhausted => Ok(None),
            },
            _ => self.space.iter_next(iter),
        }
    }

    /// Materializes any iterable, including generators, into a vector.
    pub fn iterate(&mut self, value: Value) -> RunResult<Vec<Value>> {
        let iter = if matches!(value, Value::Generator(_)) {
            value
        } else {
            self.space.iter(value)?
        };
        let mut items = Vec::new();
        while let Some(item) = self.iter_next(&iter)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Calls an interpreted function, running its frame to completion (or
    /// parking it in a generator).
    pub(crate) fn call_function(&mut self, func: &Rc<FunctionObj>, args: Args) -> RunResult<Value> {
        let locals = crate::function::bind_args(func, args)?;
        let frame = Frame::for_call(func, locals)?;
        if func.code.is_generator() {
            return Ok(Value::Generator(Rc::new(GeneratorIterator::new(frame))));
        }
        let mut frame = frame;
        self.enter_call()?;
        self.tracer.on_call(&func.code.name, self.call_depth);
        let result = frame.execute(self);
        self.leave_call();
        self.tracer.on_return(self.call_depth);
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(RunError::corruption("yield in a non-generator frame")),
        }
    }

    pub(crate) fn enter_call(&mut self) -> RunResult<()> {
        if self.call_depth >= self.max_call_depth {
            return Err(RunError::exc(ExcKind::RecursionError, "maximum recursion depth exceeded"));
        }
        self.call_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.call_depth -= 1;
    }
}

/// Calling an exception class constructs an instance, so `raise E("msg")`
/// and `raise E` both work without space involvement.
fn construct_exception<S: ObjectSpace>(space: &S, kind: ExcKind, args: Args) -> RunResult<Value> {
    if !args.keywords.is_empty() {
        return Err(RunError::exc(
            ExcKind::TypeError,
            format!("{kind}() takes no keyword arguments"),
        ));
    }
    let message = match args.positional.as_slice() {
        [] => String::new(),
        [Value::Str(s)] => s.clone(),
        [other] => space.repr(other),
        many => {
            let parts: Vec<String> = many.iter().map(|value| space.repr(value)).collect();
            format!("({})", parts.join(", "))
        }
    };
    Ok(Value::ExcInstance(Box::new(VmException::new(kind, message))))
}
