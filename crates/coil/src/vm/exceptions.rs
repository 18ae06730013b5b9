//! Block unwinding and the exception opcode handlers.
//!
//! The unwinding algorithm runs after every dispatch while a non-yield
//! signal is pending and the frame still has open blocks. Each step pops
//! the innermost block, restores the operand stack to the block's recorded
//! level (plus three slots for an except-handler, which parks the exception
//! triple on the stack), and either consumes the signal or passes it to the
//! next enclosing block. A signal no block consumes propagates out of the
//! frame.
//!
//! One exception to the pop-first order: `continue` hitting its loop block
//! re-enters the body with the block intact, since the loop is still live.

use crate::{
    error::{Exc, ExcType, RunError, RunResult, SimpleException},
    frame::{Block, BlockKind},
    io::PrintWriter,
    value::{Marker, Value},
};

use super::{Vm, Why};

impl<P: PrintWriter> Vm<P> {
    /// One unwinding step: resolves `why` against the innermost block.
    ///
    /// Returns the still-pending signal, or `None` once a block consumed it.
    pub(super) fn manage_block_stack(&mut self, why: Why) -> RunResult<Option<Why>> {
        let block = *self
            .current_frame()?
            .blocks
            .last()
            .ok_or_else(|| RunError::internal("unwind step with an empty block stack"))?;

        // continue re-enters the loop body; the block stays pushed
        if let (BlockKind::Loop { restart }, Why::Continue) = (block.kind, &why) {
            self.jump(restart)?;
            return Ok(None);
        }

        self.current_frame_mut()?.pop_block()?;
        self.unwind_block(&block)?;

        match (block.kind, why) {
            (BlockKind::Loop { .. }, Why::Break) => {
                self.jump(block.handler)?;
                Ok(None)
            }
            (BlockKind::ExceptGuard | BlockKind::Finally, Why::Exception(exc)) => {
                // Enter the handler: record the triple's stack slots with a
                // fresh except-handler block, then push the triple twice so
                // the handler prologue and the eventual PopExcept/EndFinally
                // pop symmetrically.
                self.current_frame_mut()?.push_block(BlockKind::ExceptHandler, 0);
                self.exception = Some(exc.clone());
                for _ in 0..2 {
                    self.push(exc.traceback.clone())?;
                    self.push(exc.value.clone())?;
                    self.push(Value::ExcType(exc.exc_type))?;
                }
                self.jump(block.handler)?;
                Ok(None)
            }
            (BlockKind::Finally, why) => {
                // Park the pending signal for EndFinally to resume.
                match why {
                    Why::Return(value) => {
                        self.push(value)?;
                        self.push(Value::Marker(Marker::Return))?;
                    }
                    Why::Continue => {
                        self.push(Value::None)?;
                        self.push(Value::Marker(Marker::Continue))?;
                    }
                    Why::Break => {
                        self.push(Value::Marker(Marker::Break))?;
                    }
                    _ => return Err(RunError::internal("unexpected signal entering a finally block")),
                }
                self.jump(block.handler)?;
                Ok(None)
            }
            (_, why) => Ok(Some(why)),
        }
    }

    /// Restores the operand stack to a popped block's recorded level.
    ///
    /// An except-handler block keeps three extra slots - its exception
    /// triple - which are popped here to restore the outer exception
    /// context.
    pub(super) fn unwind_block(&mut self, block: &Block) -> RunResult<()> {
        let keep = if matches!(block.kind, BlockKind::ExceptHandler) { 3 } else { 0 };
        let frame = self.current_frame_mut()?;
        frame.stack.truncate(block.level + keep);
        if matches!(block.kind, BlockKind::ExceptHandler) {
            let [traceback, value, exc_type] = super::into_array::<3>(frame.pop_n(3)?)?;
            self.restore_exception(exc_type, value, traceback);
        }
        Ok(())
    }

    /// Restores (or clears) the handled-exception context from three
    /// popped triple slots.
    fn restore_exception(&mut self, exc_type: Value, value: Value, traceback: Value) {
        match exc_type {
            Value::ExcType(t) => self.exception = Some(Exc::from_slots(t, value, traceback)),
            _ => self.exception = None,
        }
    }

    /// `PopExcept`: leave an exception handler, restoring outer context.
    ///
    /// Popping any other block kind here is an internal-consistency error.
    pub(super) fn op_pop_except(&mut self) -> RunResult<()> {
        let block = self.current_frame_mut()?.pop_block()?;
        if !matches!(block.kind, BlockKind::ExceptHandler) {
            return Err(RunError::internal("popped block is not an except handler"));
        }
        self.unwind_block(&block)
    }

    /// `EndFinally`: resume whatever the finally body interrupted.
    ///
    /// The stack top tells the story: a signal marker resumes that signal,
    /// `None` means the body was entered normally, an exception class means
    /// the parked triple below it must be re-raised.
    pub(super) fn op_end_finally(&mut self) -> RunResult<Option<Why>> {
        match self.pop()? {
            Value::Marker(Marker::Return) => {
                let value = self.pop()?;
                Ok(Some(Why::Return(value)))
            }
            Value::Marker(Marker::Continue) => {
                self.pop()?;
                Ok(Some(Why::Continue))
            }
            Value::Marker(Marker::Break) => Ok(Some(Why::Break)),
            Value::None => Ok(None),
            Value::ExcType(exc_type) => {
                let value = self.pop()?;
                let traceback = self.pop()?;
                Ok(Some(Why::Reraise(Exc::from_slots(exc_type, value, traceback))))
            }
            other => Err(RunError::internal(format!(
                "confused EndFinally: unexpected '{}' on the stack",
                other.type_name()
            ))),
        }
    }

    /// `Raise` with 0, 1 or 2 arguments.
    ///
    /// Zero arguments re-raises the exception currently being handled.
    /// Two arguments pop a cause, which is not modeled and discarded.
    pub(super) fn op_raise(&mut self, argc: u16) -> RunResult<()> {
        let exc = match argc {
            0 => self
                .exception
                .clone()
                .ok_or_else(|| ExcType::RuntimeError.raise("No active exception to re-raise"))?,
            1 => {
                let value = self.pop()?;
                exc_from_value(value)?
            }
            2 => {
                let _cause = self.pop()?;
                let value = self.pop()?;
                exc_from_value(value)?
            }
            n => return Err(RunError::internal(format!("Raise argument count {n} out of range"))),
        };
        Err(exc.into())
    }
}

/// Builds an exception triple from a raised value: an exception class
/// raises a fresh instance of it, an instance raises as-is.
fn exc_from_value(value: Value) -> RunResult<Exc> {
    match value {
        Value::ExcType(t) => Ok(Exc::from_exception(SimpleException::new(t))),
        Value::Exception(exc) => Ok(Exc {
            exc_type: exc.exc_type,
            value: Value::Exception(exc),
            traceback: Value::None,
        }),
        _ => Err(ExcType::TypeError.raise("exceptions must derive from BaseException")),
    }
}
