//! Native builtin functions and the default builtins namespace.
//!
//! The builtins namespace is the last stop of name resolution. Root frames
//! receive it through the reserved `__builtins__` entry of their locals (or
//! the crate default when the embedder supplies none); child frames inherit
//! it from their caller.

use std::rc::Rc;

use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{
    error::{ExcType, RunResult},
    io::PrintWriter,
    value::{Namespace, Value, ValueIter},
    vm::Vm,
};

/// A native builtin function, stored directly in a `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Builtin {
    Abs,
    Isinstance,
    Iter,
    Len,
    Next,
    Range,
    Repr,
    /// The class-building builtin pushed by `LoadBuildClass`; calling it
    /// with `(body_function, name)` runs the body and captures its locals
    /// as the new class's namespace.
    #[strum(serialize = "__build_class__")]
    BuildClass,
}

impl Builtin {
    /// Dispatches a builtin call. Needs the VM because `next`, `iter` and
    /// `__build_class__` can run frames.
    pub(crate) fn invoke<P: PrintWriter>(self, vm: &mut Vm<P>, args: Vec<Value>) -> RunResult<Value> {
        match self {
            Self::Abs => {
                let [value] = take_args::<1>(self, args)?;
                match &value {
                    Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(|| {
                        ExcType::OverflowError.raise("integer result too large")
                    }),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    other => Err(ExcType::TypeError.raise(format!("bad operand type for abs(): '{}'", other.type_name()))),
                }
            }
            Self::Isinstance => {
                let [value, class] = take_args::<2>(self, args)?;
                let result = match (&value, &class) {
                    (Value::Instance(obj), Value::Class(cls)) => Rc::ptr_eq(&obj.class, cls),
                    (Value::Exception(exc), Value::ExcType(t)) => exc.exc_type.is_subclass_of(*t),
                    (_, Value::Class(_) | Value::ExcType(_)) => false,
                    (_, other) => {
                        return Err(ExcType::TypeError.raise(format!(
                            "isinstance() arg 2 must be a type, not {}",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::Bool(result))
            }
            Self::Iter => {
                let [value] = take_args::<1>(self, args)?;
                crate::vm::make_iter(value)
            }
            Self::Len => {
                let [value] = take_args::<1>(self, args)?;
                Ok(Value::Int(value.length()? as i64))
            }
            Self::Next => {
                let [value] = take_args::<1>(self, args)?;
                match vm.iter_next(&value)? {
                    Some(item) => Ok(item),
                    None => Err(ExcType::StopIteration.raise_plain()),
                }
            }
            Self::Range => {
                let ints: Vec<i64> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => Ok(*i),
                        other => Err(ExcType::TypeError.raise(format!(
                            "'{}' object cannot be interpreted as an integer",
                            other.type_name()
                        ))),
                    })
                    .collect::<RunResult<_>>()?;
                let (next, stop, step) = match ints[..] {
                    [stop] => (0, stop, 1),
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => {
                        if step == 0 {
                            return Err(ExcType::ValueError.raise("range() arg 3 must not be zero"));
                        }
                        (start, stop, step)
                    }
                    _ => {
                        return Err(ExcType::TypeError
                            .raise(format!("range expected 1 to 3 arguments, got {}", args.len())));
                    }
                };
                Ok(Value::Iter(Rc::new(std::cell::RefCell::new(ValueIter::Range {
                    next,
                    stop,
                    step,
                }))))
            }
            Self::Repr => {
                let [value] = take_args::<1>(self, args)?;
                Ok(Value::new_str(value.repr()))
            }
            Self::BuildClass => vm.build_class(args),
        }
    }
}

/// Pops an exact argument count, or raises the usual arity error.
fn take_args<const N: usize>(builtin: Builtin, args: Vec<Value>) -> RunResult<[Value; N]> {
    let got = args.len();
    args.try_into()
        .map_err(|_| ExcType::TypeError.raise(format!("{builtin}() takes exactly {} argument(s) ({got} given)", N)))
}

/// The default builtins namespace: native functions plus the exception
/// classes.
#[must_use]
pub fn default_builtins() -> Namespace {
    let mut ns = Namespace::default();
    for builtin in Builtin::iter() {
        let name: &'static str = builtin.into();
        ns.insert(Rc::from(name), Value::Builtin(builtin));
    }
    for exc_type in ExcType::iter() {
        let name: &'static str = exc_type.into();
        ns.insert(Rc::from(name), Value::ExcType(exc_type));
    }
    ns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_namespace_contents() {
        let ns = default_builtins();
        assert!(matches!(ns.get("len"), Some(Value::Builtin(Builtin::Len))));
        assert!(matches!(ns.get("__build_class__"), Some(Value::Builtin(Builtin::BuildClass))));
        assert!(matches!(ns.get("ValueError"), Some(Value::ExcType(ExcType::ValueError))));
        assert!(ns.get("nonsense").is_none());
    }
}
