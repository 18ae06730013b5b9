//! Container build, unpack and comprehension-append opcode handlers.
//!
//! Build opcodes pop a known count of operands and push one aggregate,
//! preserving the operands' left-to-right order. The append family mutates
//! a container seen through `peek`, which is how comprehension loops keep
//! their accumulator on the stack while iterating.

use crate::{
    error::{ExcType, RunError, RunResult},
    io::PrintWriter,
    value::{DictMap, SetStorage, Slice, Value},
};

use super::{Vm, attr::dict_key, into_array};

impl<P: PrintWriter> Vm<P> {
    pub(super) fn op_build_tuple(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count)?;
        self.push(Value::new_tuple(items))
    }

    pub(super) fn op_build_list(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count)?;
        self.push(Value::new_list(items))
    }

    pub(super) fn op_build_set(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count)?;
        let mut set = SetStorage::default();
        for item in items {
            set.insert(dict_key(item)?);
        }
        self.push(Value::new_set(set))
    }

    /// `BuildMap` pops `2 * count` slots of alternating key/value pairs,
    /// pushed in insertion order.
    pub(super) fn op_build_map(&mut self, count: usize) -> RunResult<()> {
        let mut flat = self.pop_n(count * 2)?;
        let mut map = DictMap::with_capacity(count);
        // Drain pairwise from the front to keep insertion order.
        for _ in 0..count {
            let key = flat.remove(0);
            let value = flat.remove(0);
            map.insert(dict_key(key)?, value);
        }
        self.push(Value::new_dict(map))
    }

    /// `BuildString` concatenates string fragments (the formatted-string
    /// build path).
    pub(super) fn op_build_string(&mut self, count: usize) -> RunResult<()> {
        let fragments = self.pop_n(count)?;
        let mut out = String::new();
        for fragment in fragments {
            match fragment {
                Value::Str(s) => out.push_str(&s),
                other => {
                    return Err(ExcType::TypeError
                        .raise(format!("sequence item: expected str instance, {} found", other.type_name())));
                }
            }
        }
        self.push(Value::new_str(out))
    }

    pub(super) fn op_build_slice(&mut self, count: usize) -> RunResult<()> {
        let bound = |value: &Value| -> RunResult<Option<i64>> {
            match value {
                Value::None => Ok(None),
                Value::Int(i) => Ok(Some(*i)),
                other => Err(ExcType::TypeError.raise(format!(
                    "slice indices must be integers or None, not {}",
                    other.type_name()
                ))),
            }
        };
        let slice = match count {
            2 => {
                let [start, stop] = into_array(self.pop_n(2)?)?;
                Slice {
                    start: bound(&start)?,
                    stop: bound(&stop)?,
                    step: None,
                }
            }
            3 => {
                let [start, stop, step] = into_array(self.pop_n(3)?)?;
                Slice {
                    start: bound(&start)?,
                    stop: bound(&stop)?,
                    step: bound(&step)?,
                }
            }
            n => return Err(RunError::internal(format!("strange BuildSlice count: {n}"))),
        };
        self.push(Value::Slice(std::rc::Rc::new(slice)))
    }

    /// `UnpackSequence` pops a sequence of exactly `count` elements and
    /// pushes them in reverse, so the first element ends up on top.
    pub(super) fn op_unpack_sequence(&mut self, count: usize) -> RunResult<()> {
        let sequence = self.pop()?;
        let items: Vec<Value> = match &sequence {
            Value::Tuple(items) => items.to_vec(),
            Value::List(items) => items.borrow().clone(),
            other => {
                return Err(ExcType::TypeError
                    .raise(format!("cannot unpack non-sequence {}", other.type_name())));
            }
        };
        if items.len() < count {
            return Err(ExcType::ValueError.raise(format!(
                "not enough values to unpack (expected {count}, got {})",
                items.len()
            )));
        }
        if items.len() > count {
            return Err(ExcType::ValueError.raise(format!("too many values to unpack (expected {count})")));
        }
        for item in items.into_iter().rev() {
            self.push(item)?;
        }
        Ok(())
    }

    /// `ListAppend(depth)`: append the popped value to the list `depth`
    /// slots below the new top.
    pub(super) fn op_list_append(&mut self, depth: usize) -> RunResult<()> {
        let value = self.pop()?;
        match self.peek(depth)? {
            Value::List(items) => {
                items.borrow_mut().push(value);
                Ok(())
            }
            other => Err(RunError::internal(format!(
                "ListAppend target is '{}', not a list",
                other.type_name()
            ))),
        }
    }

    pub(super) fn op_set_add(&mut self, depth: usize) -> RunResult<()> {
        let value = self.pop()?;
        match self.peek(depth)? {
            Value::Set(items) => {
                items.borrow_mut().insert(dict_key(value)?);
                Ok(())
            }
            other => Err(RunError::internal(format!(
                "SetAdd target is '{}', not a set",
                other.type_name()
            ))),
        }
    }

    /// `MapAdd(depth)`: pops `[value, key]` and inserts into the mapping
    /// `depth` slots below the new top.
    pub(super) fn op_map_add(&mut self, depth: usize) -> RunResult<()> {
        let [value, key] = into_array(self.pop_n(2)?)?;
        match self.peek(depth)? {
            Value::Dict(map) => {
                map.borrow_mut().insert(dict_key(key)?, value);
                Ok(())
            }
            other => Err(RunError::internal(format!(
                "MapAdd target is '{}', not a dict",
                other.type_name()
            ))),
        }
    }
}
