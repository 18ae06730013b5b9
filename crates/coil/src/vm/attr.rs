//! Attribute, subscript and slice opcode handlers.
//!
//! Attribute lookup on an instance checks its own attributes first, then
//! the class namespace - a function found there binds into a method.
//! Subscripting delegates to the target's index protocol: integer indices
//! normalize negative offsets, slices resolve through `Slice::indices`.

use std::rc::Rc;

use crate::{
    error::{ExcType, RunError, RunResult},
    function::Method,
    io::PrintWriter,
    value::{Key, Value},
};

use super::{Vm, into_array};

impl<P: PrintWriter> Vm<P> {
    pub(super) fn op_load_attr(&mut self, idx: usize) -> RunResult<()> {
        let name = self.attr_name(idx)?;
        let target = self.pop()?;
        let value = load_attr(&target, &name)?;
        self.push(value)
    }

    pub(super) fn op_store_attr(&mut self, idx: usize) -> RunResult<()> {
        let name = self.attr_name(idx)?;
        let [value, target] = into_array(self.pop_n(2)?)?;
        match &target {
            Value::Instance(obj) => {
                obj.attrs.borrow_mut().insert(name, value);
                Ok(())
            }
            Value::Class(class) => {
                class.namespace.borrow_mut().insert(name, value);
                Ok(())
            }
            other => Err(ExcType::AttributeError.raise(format!(
                "'{}' object has no settable attribute '{name}'",
                other.type_name()
            ))),
        }
    }

    pub(super) fn op_delete_attr(&mut self, idx: usize) -> RunResult<()> {
        let name = self.attr_name(idx)?;
        let target = self.pop()?;
        let removed = match &target {
            Value::Instance(obj) => obj.attrs.borrow_mut().remove(&name),
            Value::Class(class) => class.namespace.borrow_mut().remove(&name),
            _ => None,
        };
        removed.map(drop).ok_or_else(|| {
            ExcType::AttributeError.raise(format!("'{}' object has no attribute '{name}'", target.type_name()))
        })
    }

    fn attr_name(&self, idx: usize) -> RunResult<Rc<str>> {
        self.current_frame()?
            .code
            .names()
            .get(idx)
            .cloned()
            .ok_or_else(|| RunError::internal("attribute name index out of range"))
    }

    pub(super) fn op_binary_subscr(&mut self) -> RunResult<()> {
        let [target, index] = into_array(self.pop_n(2)?)?;
        let value = get_item(&target, &index)?;
        self.push(value)
    }

    pub(super) fn op_store_subscr(&mut self) -> RunResult<()> {
        let [value, target, index] = into_array(self.pop_n(3)?)?;
        set_item(&target, index, value)
    }

    pub(super) fn op_delete_subscr(&mut self) -> RunResult<()> {
        let [target, index] = into_array(self.pop_n(2)?)?;
        del_item(&target, &index)
    }
}

/// Attribute read with method binding.
pub(crate) fn load_attr(target: &Value, name: &Rc<str>) -> RunResult<Value> {
    match target {
        Value::Instance(obj) => {
            if let Some(value) = obj.attrs.borrow().get(name) {
                return Ok(value.clone());
            }
            let class_value = obj.class.namespace.borrow().get(name).cloned();
            match class_value {
                Some(Value::Function(function)) => Ok(Value::Method(Rc::new(Method {
                    receiver: target.clone(),
                    class: Rc::clone(&obj.class),
                    function,
                }))),
                Some(value) => Ok(value),
                None => Err(ExcType::AttributeError
                    .raise(format!("'{}' object has no attribute '{name}'", obj.class.name))),
            }
        }
        Value::Class(class) => class.namespace.borrow().get(name).cloned().ok_or_else(|| {
            ExcType::AttributeError.raise(format!("type object '{}' has no attribute '{name}'", class.name))
        }),
        other => Err(ExcType::AttributeError.raise(format!(
            "'{}' object has no attribute '{name}'",
            other.type_name()
        ))),
    }
}

/// Subscript read: `target[index]`.
fn get_item(target: &Value, index: &Value) -> RunResult<Value> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            let idx = normalize_index(*i, items.len(), "list")?;
            Ok(items[idx].clone())
        }
        (Value::List(items), Value::Slice(slice)) => {
            let items = items.borrow();
            let selected = slice.iter_indices(items.len())?;
            Ok(Value::new_list(selected.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Tuple(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len(), "tuple")?;
            Ok(items[idx].clone())
        }
        (Value::Tuple(items), Value::Slice(slice)) => {
            let selected = slice.iter_indices(items.len())?;
            Ok(Value::new_tuple(selected.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len(), "string")?;
            Ok(Value::new_str(chars[idx].to_string()))
        }
        (Value::Str(s), Value::Slice(slice)) => {
            let chars: Vec<char> = s.chars().collect();
            let selected = slice.iter_indices(chars.len())?;
            Ok(Value::new_str(selected.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        (Value::Dict(map), key) => {
            let key = dict_key(key.clone())?;
            map.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| ExcType::KeyError.raise(key.0.repr()))
        }
        (Value::List(_) | Value::Tuple(_) | Value::Str(_), other) => Err(ExcType::TypeError.raise(format!(
            "{} indices must be integers or slices, not {}",
            target.type_name(),
            other.type_name()
        ))),
        (other, _) => Err(ExcType::TypeError.raise(format!("'{}' object is not subscriptable", other.type_name()))),
    }
}

/// Subscript write: `target[index] = value`.
fn set_item(target: &Value, index: Value, value: Value) -> RunResult<()> {
    match (target, &index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let idx = normalize_index(*i, len, "list")?;
            items[idx] = value;
            Ok(())
        }
        (Value::List(items), Value::Slice(slice)) => {
            // Slice assignment splices; only unit steps are supported.
            if slice.step.unwrap_or(1) != 1 {
                return Err(ExcType::ValueError.raise("slice assignment requires step 1"));
            }
            let replacement: Vec<Value> = match &value {
                Value::List(other) => other.borrow().clone(),
                Value::Tuple(other) => other.to_vec(),
                other => {
                    return Err(ExcType::TypeError.raise(format!("can only assign an iterable, not {}", other.type_name())));
                }
            };
            let mut items = items.borrow_mut();
            let (start, stop, _) = slice.indices(items.len())?;
            let (start, stop) = (start as usize, (stop.max(start)) as usize);
            items.splice(start..stop, replacement);
            Ok(())
        }
        (Value::Dict(map), _) => {
            let key = dict_key(index)?;
            map.borrow_mut().insert(key, value);
            Ok(())
        }
        (other, _) => Err(ExcType::TypeError.raise(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Subscript delete: `del target[index]`.
fn del_item(target: &Value, index: &Value) -> RunResult<()> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let idx = normalize_index(*i, len, "list")?;
            items.remove(idx);
            Ok(())
        }
        (Value::List(items), Value::Slice(slice)) => {
            let mut selected = slice.iter_indices(items.borrow().len())?;
            selected.sort_unstable();
            let mut items = items.borrow_mut();
            for idx in selected.into_iter().rev() {
                items.remove(idx);
            }
            Ok(())
        }
        (Value::Dict(map), key) => {
            let key = dict_key(key.clone())?;
            map.borrow_mut()
                .shift_remove(&key)
                .map(drop)
                .ok_or_else(|| ExcType::KeyError.raise(key.0.repr()))
        }
        (other, _) => Err(ExcType::TypeError.raise(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

/// Wraps a value as a dict/set key or raises the unhashable error.
pub(crate) fn dict_key(value: Value) -> RunResult<Key> {
    Key::new(value).map_err(|value| ExcType::TypeError.raise(format!("unhashable type: '{}'", value.type_name())))
}

/// Maps a possibly-negative index into bounds.
fn normalize_index(index: i64, len: usize, what: &str) -> RunResult<usize> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        Err(ExcType::IndexError.raise(format!("{what} index out of range")))
    } else {
        Ok(adjusted as usize)
    }
}
