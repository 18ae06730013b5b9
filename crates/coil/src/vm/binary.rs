//! Unary, binary, in-place and comparison opcode handlers.
//!
//! The arithmetic itself lives on [`Value`]; these handlers own the stack
//! discipline (pop fixed operand counts, push one result) and the single
//! genuinely in-place case: `+=` on a list extends the shared storage so
//! every alias observes the mutation.

use crate::{
    error::{ExcType, RunError, RunResult},
    io::PrintWriter,
    op::{CmpOp, Opcode},
    value::{BinaryOp, Value},
};

use super::{Vm, into_array};

impl<P: PrintWriter> Vm<P> {
    pub(super) fn op_unary(&mut self, op: Opcode) -> RunResult<()> {
        let value = self.pop()?;
        let result = match op {
            Opcode::UnaryPositive => value.positive()?,
            Opcode::UnaryNegative => value.negate()?,
            Opcode::UnaryNot => Value::Bool(!value.is_truthy()),
            Opcode::UnaryInvert => value.invert()?,
            _ => return Err(RunError::internal("not a unary opcode")),
        };
        self.push(result)
    }

    pub(super) fn op_binary(&mut self, op: BinaryOp) -> RunResult<()> {
        let [lhs, rhs] = into_array(self.pop_n(2)?)?;
        let result = Value::binary(op, &lhs, &rhs)?;
        self.push(result)
    }

    /// In-place operators: `list += iterable` mutates the list in place;
    /// every other combination falls back to the binary operator and
    /// rebinds.
    pub(super) fn op_inplace(&mut self, op: BinaryOp) -> RunResult<()> {
        let [lhs, rhs] = into_array(self.pop_n(2)?)?;
        if op == BinaryOp::Add
            && let Value::List(items) = &lhs
        {
            // Snapshot the extension first so `a += a` cannot alias the
            // borrow it is extending.
            let extension: Vec<Value> = match &rhs {
                Value::List(other) => other.borrow().clone(),
                Value::Tuple(other) => other.to_vec(),
                other => {
                    return Err(ExcType::TypeError.raise(format!(
                        "can only concatenate list (not \"{}\") to list",
                        other.type_name()
                    )));
                }
            };
            items.borrow_mut().extend(extension);
            return self.push(lhs);
        }
        let result = Value::binary(op, &lhs, &rhs)?;
        self.push(result)
    }

    pub(super) fn op_compare(&mut self, selector: u16) -> RunResult<()> {
        let op = u8::try_from(selector)
            .ok()
            .and_then(CmpOp::from_repr)
            .ok_or_else(|| RunError::internal("invalid comparison selector"))?;
        let [lhs, rhs] = into_array(self.pop_n(2)?)?;
        let result = Value::compare(op, &lhs, &rhs)?;
        self.push(result)
    }
}
