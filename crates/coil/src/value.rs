//! Runtime values and their operator protocols.
//!
//! `Value` is a tagged enum: small immediate values (ints, floats, bools)
//! are stored inline, while containers and callables are shared behind `Rc`.
//! Cloning a `Value` is always a cheap reference clone - container state is
//! never duplicated, so two frames holding the same list observe each
//! other's writes. Rust's ownership model stands in for the reference
//! counting of the modeled runtime.
//!
//! The arithmetic, comparison, truthiness and iteration protocols live here
//! as methods on `Value`; attribute and subscript protocols, which need VM
//! context, live in `vm::attr`.

use std::{
    borrow::Cow,
    cell::RefCell,
    cmp::Ordering,
    hash::{Hash, Hasher},
    rc::Rc,
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    builtins::Builtin,
    code::{Code, Const},
    error::{ExcType, RunResult, SimpleException},
    frame::Cell,
    function::{Function, Generator, Method},
    op::CmpOp,
};

/// Name-keyed variable storage for locals, globals and builtins.
pub type Namespace = ahash::AHashMap<Rc<str>, Value>;

/// Insertion-ordered mapping storage backing `Value::Dict`.
pub type DictMap = IndexMap<Key, Value>;

/// Insertion-ordered storage backing `Value::Set`.
pub type SetStorage = IndexSet<Key>;

/// Primary value type representing runtime objects.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Tuple(Rc<[Value]>),
    List(Rc<RefCell<Vec<Value>>>),
    Set(Rc<RefCell<SetStorage>>),
    Dict(Rc<RefCell<DictMap>>),
    Slice(Rc<Slice>),
    /// A compiled code object, pushed by `LoadConst` for `MakeFunction`.
    Code(Rc<Code>),
    Function(Rc<Function>),
    Method(Rc<Method>),
    Generator(Rc<RefCell<Generator>>),
    Class(Rc<ClassObj>),
    Instance(Rc<InstanceObj>),
    /// A closure cell, pushed by `LoadClosure` for `MakeClosure`.
    Cell(Cell),
    /// A native builtin function.
    Builtin(Builtin),
    /// An exception class (e.g. the `ValueError` builtin).
    ExcType(ExcType),
    /// A raised exception instance.
    Exception(Rc<SimpleException>),
    /// A live iterator produced by `GetIter`.
    Iter(Rc<RefCell<ValueIter>>),
    /// Resumption marker pushed by `finally` unwinding, consumed by
    /// `EndFinally`. Never observable by well-formed programs.
    Marker(Marker),
}

/// Which pending signal a `finally` block parked on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Return,
    Break,
    Continue,
}

/// A slice object built by `BuildSlice`; `None` fields mean "default".
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl Slice {
    /// Resolves the slice against a sequence length, clamping like the
    /// modeled runtime: returns `(start, stop, step)` ready for stepping.
    pub(crate) fn indices(&self, len: usize) -> RunResult<(i64, i64, i64)> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(ExcType::ValueError.raise("slice step cannot be zero"));
        }
        let default_start = if step > 0 { 0 } else { len - 1 };
        // -1 is the "stop before index 0" sentinel for negative steps; user
        // stops clamp into the same range below.
        let default_stop = if step > 0 { len } else { -1 };
        let clamp = |idx: i64, low: i64, high: i64| {
            let idx = if idx < 0 { idx + len } else { idx };
            idx.clamp(low, high)
        };
        let (low, high) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let start = self.start.map_or(default_start, |i| clamp(i, low, high));
        let stop = self.stop.map_or(default_stop, |i| clamp(i, low, high));
        Ok((start, stop, step))
    }

    /// The element indices this slice selects from a sequence of `len`.
    pub(crate) fn iter_indices(&self, len: usize) -> RunResult<Vec<usize>> {
        let (start, stop, step) = self.indices(len)?;
        let mut out = Vec::new();
        let mut i = start;
        if step > 0 {
            while i < stop {
                out.push(i as usize);
                i += step;
            }
        } else {
            while i > stop {
                out.push(i as usize);
                i += step;
            }
        }
        Ok(out)
    }
}

/// A user-defined class: a name plus the namespace its body produced.
#[derive(Debug)]
pub struct ClassObj {
    pub name: Rc<str>,
    pub namespace: RefCell<Namespace>,
}

/// An instance of a user-defined class.
#[derive(Debug)]
pub struct InstanceObj {
    pub class: Rc<ClassObj>,
    pub attrs: RefCell<Namespace>,
}

/// A hashable dict/set key wrapping a `Value`.
///
/// Construction enforces hashability; hashing unifies bools, ints and
/// integral floats so `1`, `1.0` and `True` collide as keys, matching the
/// equality rules below.
#[derive(Debug, Clone)]
pub struct Key(pub Value);

impl Key {
    /// Wraps a value as a key, handing the value back if it is unhashable.
    pub fn new(value: Value) -> Result<Self, Value> {
        if Self::hashable(&value) { Ok(Self(value)) } else { Err(value) }
    }

    fn hashable(value: &Value) -> bool {
        match value {
            Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::ExcType(_)
            | Value::Builtin(_)
            | Value::Code(_)
            | Value::Function(_)
            | Value::Method(_)
            | Value::Class(_)
            | Value::Instance(_)
            | Value::Exception(_) => true,
            Value::Tuple(items) => items.iter().all(Self::hashable),
            _ => false,
        }
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
            match value {
                Value::None => state.write_u8(0),
                Value::Bool(b) => state.write_i64(i64::from(*b)),
                Value::Int(i) => state.write_i64(*i),
                Value::Float(f) => {
                    // Integral floats hash like the equal int.
                    if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                        state.write_i64(*f as i64);
                    } else {
                        state.write_u64(f.to_bits());
                    }
                }
                Value::Str(s) => s.hash(state),
                Value::Tuple(items) => {
                    state.write_usize(items.len());
                    for item in items.iter() {
                        hash_value(item, state);
                    }
                }
                Value::ExcType(t) => t.hash(state),
                Value::Builtin(b) => b.hash(state),
                Value::Code(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                Value::Function(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                Value::Method(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                Value::Class(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                Value::Instance(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                Value::Exception(rc) => state.write_usize(Rc::as_ptr(rc) as usize),
                _ => state.write_u8(0xff),
            }
        }
        hash_value(&self.0, state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Key {}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            // Numeric cross-type equality: bools behave as 0/1.
            (a, b) if a.as_num().is_some() && b.as_num().is_some() => match (a.as_num().unwrap(), b.as_num().unwrap()) {
                (Num::Int(x), Num::Int(y)) => x == y,
                (x, y) => x.as_f64() == y.as_f64(),
            },
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y),
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Self::Set(a), Self::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|k| b.contains(k))
            }
            (Self::Slice(a), Self::Slice(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => a == b,
            (Self::Marker(a), Self::Marker(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Method(a), Self::Method(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Numeric view of a value, unifying bools with ints.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

/// Binary arithmetic/bitwise operator selector shared by the `Binary*` and
/// `Inplace*` opcode families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Pow,
    FloorDiv,
    TrueDiv,
    Mod,
    Lshift,
    Rshift,
    BitAnd,
    BitXor,
    BitOr,
}

impl BinaryOp {
    /// Operator symbol for error messages.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Pow => "**",
            Self::FloorDiv => "//",
            Self::TrueDiv => "/",
            Self::Mod => "%",
            Self::Lshift => "<<",
            Self::Rshift => ">>",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
        }
    }
}

impl Value {
    /// Materializes a constant-pool entry.
    #[must_use]
    pub fn from_const(c: &Const) -> Self {
        match c {
            Const::None => Self::None,
            Const::Bool(b) => Self::Bool(*b),
            Const::Int(i) => Self::Int(*i),
            Const::Float(f) => Self::Float(*f),
            Const::Str(s) => Self::Str(Rc::clone(s)),
            Const::Tuple(items) => Self::Tuple(items.iter().map(Self::from_const).collect()),
            Const::Code(code) => Self::Code(Rc::clone(code)),
        }
    }

    pub fn new_str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn new_list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn new_tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    #[must_use]
    pub fn new_dict(map: DictMap) -> Self {
        Self::Dict(Rc::new(RefCell::new(map)))
    }

    #[must_use]
    pub fn new_set(set: SetStorage) -> Self {
        Self::Set(Rc::new(RefCell::new(set)))
    }

    /// The value's type name, as used in error messages.
    #[must_use]
    pub fn type_name(&self) -> Cow<'static, str> {
        match self {
            Self::None => "NoneType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Str(_) => "str".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::List(_) => "list".into(),
            Self::Set(_) => "set".into(),
            Self::Dict(_) => "dict".into(),
            Self::Slice(_) => "slice".into(),
            Self::Code(_) => "code".into(),
            Self::Function(_) => "function".into(),
            Self::Method(_) => "method".into(),
            Self::Generator(_) => "generator".into(),
            Self::Class(_) => "type".into(),
            Self::Instance(obj) => obj.class.name.to_string().into(),
            Self::Cell(_) => "cell".into(),
            Self::Builtin(_) => "builtin_function_or_method".into(),
            Self::ExcType(_) => "type".into(),
            Self::Exception(exc) => exc.exc_type.to_string().into(),
            Self::Iter(_) => "iterator".into(),
            Self::Marker(_) => "marker".into(),
        }
    }

    /// Truthiness: empty containers, zero numbers and `None` are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Set(items) => !items.borrow().is_empty(),
            Self::Dict(map) => !map.borrow().is_empty(),
            _ => true,
        }
    }

    /// Identity (`is`): reference identity for shared values, value
    /// identity for immediates.
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Set(a), Self::Set(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Slice(a), Self::Slice(b)) => Rc::ptr_eq(a, b),
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Method(a), Self::Method(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => Rc::ptr_eq(a, b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn as_num(&self) -> Option<Num> {
        match self {
            Self::Bool(b) => Some(Num::Int(i64::from(*b))),
            Self::Int(i) => Some(Num::Int(*i)),
            Self::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    /// Membership test (`item in self`).
    pub(crate) fn contains(&self, item: &Self) -> RunResult<bool> {
        match self {
            Self::Str(haystack) => match item {
                Self::Str(needle) => Ok(haystack.contains(&**needle)),
                other => Err(ExcType::TypeError.raise(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Self::Tuple(items) => Ok(items.iter().any(|v| v == item)),
            Self::List(items) => Ok(items.borrow().iter().any(|v| v == item)),
            Self::Set(items) => match Key::new(item.clone()) {
                Ok(key) => Ok(items.borrow().contains(&key)),
                Err(_) => Ok(false),
            },
            Self::Dict(map) => match Key::new(item.clone()) {
                Ok(key) => Ok(map.borrow().contains_key(&key)),
                Err(_) => Ok(false),
            },
            other => Err(ExcType::TypeError.raise(format!("argument of type '{}' is not iterable", other.type_name()))),
        }
    }

    /// Rich comparison dispatch for the `CompareOp` opcode.
    pub(crate) fn compare(op: CmpOp, lhs: &Self, rhs: &Self) -> RunResult<Self> {
        let result = match op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => return Self::compare_ordered(op, lhs, rhs),
            CmpOp::In => rhs.contains(lhs)?,
            CmpOp::NotIn => !rhs.contains(lhs)?,
            CmpOp::Is => lhs.is_identical(rhs),
            CmpOp::IsNot => !lhs.is_identical(rhs),
            CmpOp::ExcMatch => {
                let raised = match lhs {
                    Self::ExcType(t) => *t,
                    Self::Exception(exc) => exc.exc_type,
                    other => {
                        return Err(ExcType::TypeError
                            .raise(format!("catching '{}' is not an exception class", other.type_name())));
                    }
                };
                let handler = match rhs {
                    Self::ExcType(t) => *t,
                    other => {
                        return Err(ExcType::TypeError.raise(format!(
                            "catching classes that do not inherit from BaseException is not allowed (got '{}')",
                            other.type_name()
                        )));
                    }
                };
                raised.is_subclass_of(handler)
            }
        };
        Ok(Self::Bool(result))
    }

    fn compare_ordered(op: CmpOp, lhs: &Self, rhs: &Self) -> RunResult<Self> {
        let ordering = Self::try_ordering(lhs, rhs)?;
        let result = match ordering {
            None => false, // NaN compares false under every ordering
            Some(ord) => match op {
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                _ => unreachable!("compare_ordered called with a non-ordering op"),
            },
        };
        Ok(Self::Bool(result))
    }

    fn try_ordering(lhs: &Self, rhs: &Self) -> RunResult<Option<Ordering>> {
        if let (Some(a), Some(b)) = (lhs.as_num(), rhs.as_num()) {
            return Ok(match (a, b) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
            });
        }
        match (lhs, rhs) {
            (Self::Str(a), Self::Str(b)) => Ok(Some(a.cmp(b))),
            (Self::Tuple(a), Self::Tuple(b)) => Self::seq_ordering(&a[..], &b[..]),
            (Self::List(a), Self::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                Self::seq_ordering(&a[..], &b[..])
            }
            _ => Err(ExcType::TypeError.raise(format!(
                "'<' not supported between instances of '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn seq_ordering(a: &[Self], b: &[Self]) -> RunResult<Option<Ordering>> {
        for (x, y) in a.iter().zip(b.iter()) {
            if x == y {
                continue;
            }
            return Self::try_ordering(x, y);
        }
        Ok(Some(a.len().cmp(&b.len())))
    }

    /// Applies a binary arithmetic/bitwise operator.
    pub(crate) fn binary(op: BinaryOp, lhs: &Self, rhs: &Self) -> RunResult<Self> {
        if let (Some(a), Some(b)) = (lhs.as_num(), rhs.as_num()) {
            return match (a, b) {
                (Num::Int(x), Num::Int(y)) => Self::int_binary(op, x, y),
                (x, y) => Self::float_binary(op, x.as_f64(), y.as_f64()),
            };
        }
        match (op, lhs, rhs) {
            (BinaryOp::Add, Self::Str(a), Self::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Self::new_str(s))
            }
            (BinaryOp::Add, Self::List(a), Self::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Self::new_list(items))
            }
            (BinaryOp::Add, Self::Tuple(a), Self::Tuple(b)) => {
                Ok(Self::Tuple(a.iter().chain(b.iter()).cloned().collect()))
            }
            (BinaryOp::Mul, Self::Str(s), other) | (BinaryOp::Mul, other, Self::Str(s)) => {
                let n = other.repeat_count()?;
                Ok(Self::new_str(s.repeat(n)))
            }
            (BinaryOp::Mul, Self::List(items), other) | (BinaryOp::Mul, other, Self::List(items)) => {
                let n = other.repeat_count()?;
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                Ok(Self::new_list(out))
            }
            (BinaryOp::Mul, Self::Tuple(items), other) | (BinaryOp::Mul, other, Self::Tuple(items)) => {
                let n = other.repeat_count()?;
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                Ok(Self::new_tuple(out))
            }
            (BinaryOp::BitOr, Self::Set(a), Self::Set(b)) => {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                Ok(Self::new_set(out))
            }
            (BinaryOp::BitAnd, Self::Set(a), Self::Set(b)) => {
                let b = b.borrow();
                let out: SetStorage = a.borrow().iter().filter(|k| b.contains(*k)).cloned().collect();
                Ok(Self::new_set(out))
            }
            (BinaryOp::Sub, Self::Set(a), Self::Set(b)) => {
                let b = b.borrow();
                let out: SetStorage = a.borrow().iter().filter(|k| !b.contains(*k)).cloned().collect();
                Ok(Self::new_set(out))
            }
            _ => Err(ExcType::TypeError.raise(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn repeat_count(&self) -> RunResult<usize> {
        match self.as_num() {
            Some(Num::Int(n)) => Ok(usize::try_from(n).unwrap_or(0)),
            _ => Err(ExcType::TypeError.raise(format!("can't multiply sequence by non-int of type '{}'", self.type_name()))),
        }
    }

    fn int_binary(op: BinaryOp, x: i64, y: i64) -> RunResult<Self> {
        let overflow = || ExcType::OverflowError.raise("integer result too large");
        let value = match op {
            BinaryOp::Add => Self::Int(x.checked_add(y).ok_or_else(overflow)?),
            BinaryOp::Sub => Self::Int(x.checked_sub(y).ok_or_else(overflow)?),
            BinaryOp::Mul => Self::Int(x.checked_mul(y).ok_or_else(overflow)?),
            BinaryOp::Pow => {
                if y < 0 {
                    Self::Float((x as f64).powf(y as f64))
                } else {
                    let exp = u32::try_from(y).map_err(|_| overflow())?;
                    Self::Int(x.checked_pow(exp).ok_or_else(overflow)?)
                }
            }
            BinaryOp::FloorDiv => {
                if y == 0 {
                    return Err(ExcType::ZeroDivisionError.raise("integer division or modulo by zero"));
                }
                Self::Int(floor_div_i64(x, y))
            }
            BinaryOp::TrueDiv => {
                if y == 0 {
                    return Err(ExcType::ZeroDivisionError.raise("division by zero"));
                }
                Self::Float(x as f64 / y as f64)
            }
            BinaryOp::Mod => {
                if y == 0 {
                    return Err(ExcType::ZeroDivisionError.raise("integer division or modulo by zero"));
                }
                Self::Int(floor_mod_i64(x, y))
            }
            BinaryOp::Lshift => {
                if y < 0 {
                    return Err(ExcType::ValueError.raise("negative shift count"));
                }
                if x == 0 {
                    Self::Int(0)
                } else {
                    let shift = u32::try_from(y).map_err(|_| overflow())?;
                    let factor = 1i64.checked_shl(shift).filter(|f| *f > 0).ok_or_else(overflow)?;
                    Self::Int(x.checked_mul(factor).ok_or_else(overflow)?)
                }
            }
            BinaryOp::Rshift => {
                if y < 0 {
                    return Err(ExcType::ValueError.raise("negative shift count"));
                }
                if y >= 63 {
                    Self::Int(if x < 0 { -1 } else { 0 })
                } else {
                    Self::Int(x >> y)
                }
            }
            BinaryOp::BitAnd => Self::Int(x & y),
            BinaryOp::BitXor => Self::Int(x ^ y),
            BinaryOp::BitOr => Self::Int(x | y),
        };
        Ok(value)
    }

    fn float_binary(op: BinaryOp, x: f64, y: f64) -> RunResult<Self> {
        let value = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Pow => x.powf(y),
            BinaryOp::FloorDiv => {
                if y == 0.0 {
                    return Err(ExcType::ZeroDivisionError.raise("float floor division by zero"));
                }
                (x / y).floor()
            }
            BinaryOp::TrueDiv => {
                if y == 0.0 {
                    return Err(ExcType::ZeroDivisionError.raise("float division by zero"));
                }
                x / y
            }
            BinaryOp::Mod => {
                if y == 0.0 {
                    return Err(ExcType::ZeroDivisionError.raise("float modulo"));
                }
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
            }
            BinaryOp::Lshift | BinaryOp::Rshift | BinaryOp::BitAnd | BinaryOp::BitXor | BinaryOp::BitOr => {
                return Err(ExcType::TypeError.raise(format!(
                    "unsupported operand type(s) for {}: 'float' and 'float'",
                    op.symbol()
                )));
            }
        };
        Ok(Self::Float(value))
    }

    /// Unary negation.
    pub(crate) fn negate(&self) -> RunResult<Self> {
        match self.as_num() {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Self::Int)
                .ok_or_else(|| ExcType::OverflowError.raise("integer result too large")),
            Some(Num::Float(f)) => Ok(Self::Float(-f)),
            None => Err(ExcType::TypeError.raise(format!("bad operand type for unary -: '{}'", self.type_name()))),
        }
    }

    /// Unary plus: numeric identity (bools promote to ints).
    pub(crate) fn positive(&self) -> RunResult<Self> {
        match self.as_num() {
            Some(Num::Int(i)) => Ok(Self::Int(i)),
            Some(Num::Float(f)) => Ok(Self::Float(f)),
            None => Err(ExcType::TypeError.raise(format!("bad operand type for unary +: '{}'", self.type_name()))),
        }
    }

    /// Unary bitwise inversion.
    pub(crate) fn invert(&self) -> RunResult<Self> {
        match self.as_num() {
            Some(Num::Int(i)) => Ok(Self::Int(!i)),
            _ => Err(ExcType::TypeError.raise(format!("bad operand type for unary ~: '{}'", self.type_name()))),
        }
    }

    /// The repr string, as pushed by `PrintExpr` and used in diagnostics.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => fmt_float(*f),
            Self::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Self::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Self::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Self::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Set(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    "set()".to_owned()
                } else {
                    let inner: Vec<String> = items.iter().map(|k| k.0.repr()).collect();
                    format!("{{{}}}", inner.join(", "))
                }
            }
            Self::Dict(map) => {
                let inner: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.0.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Slice(s) => format!(
                "slice({}, {}, {})",
                s.start.map_or_else(|| "None".to_owned(), |i| i.to_string()),
                s.stop.map_or_else(|| "None".to_owned(), |i| i.to_string()),
                s.step.map_or_else(|| "None".to_owned(), |i| i.to_string()),
            ),
            Self::Code(code) => format!("<code object {}>", code.name()),
            Self::Function(f) => format!("<function {} at {:#x}>", f.name, Rc::as_ptr(f) as usize),
            Self::Method(m) => format!("<bound method {}.{}>", m.class.name, m.function.name),
            Self::Generator(g) => format!("<generator object {}>", g.borrow().name()),
            Self::Class(c) => format!("<class '{}'>", c.name),
            Self::Instance(obj) => format!("<{} object at {:#x}>", obj.class.name, Rc::as_ptr(obj) as usize),
            Self::Cell(_) => "<cell>".to_owned(),
            Self::Builtin(b) => format!("<built-in function {b}>"),
            Self::ExcType(t) => format!("<class '{t}'>"),
            Self::Exception(exc) => match &exc.message {
                Some(m) => format!("{}('{}')", exc.exc_type, m),
                None => format!("{}()", exc.exc_type),
            },
            Self::Iter(_) => "<iterator>".to_owned(),
            Self::Marker(_) => "<signal marker>".to_owned(),
        }
    }

    /// The str() rendering: raw text for strings, repr for everything else.
    #[must_use]
    pub fn str_value(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }

    /// Sequence/container length, where defined.
    pub(crate) fn length(&self) -> RunResult<usize> {
        match self {
            Self::Str(s) => Ok(s.chars().count()),
            Self::Tuple(items) => Ok(items.len()),
            Self::List(items) => Ok(items.borrow().len()),
            Self::Set(items) => Ok(items.borrow().len()),
            Self::Dict(map) => Ok(map.borrow().len()),
            other => Err(ExcType::TypeError.raise(format!("object of type '{}' has no len()", other.type_name()))),
        }
    }
}

/// Floor division matching the modeled runtime (round toward negative
/// infinity, not toward zero).
fn floor_div_i64(x: i64, y: i64) -> i64 {
    let q = x / y;
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) { q - 1 } else { q }
}

/// Modulo taking the sign of the divisor.
fn floor_mod_i64(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) { r + y } else { r }
}

/// Float repr: integral floats keep a trailing `.0`.
fn fmt_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// State of a live iterator value.
///
/// Iterators over shared containers hold the container reference and an
/// index, so concurrent mutation is observed (and may skip or repeat
/// elements, exactly like the modeled runtime). Dict and set iteration
/// snapshots the keys at `GetIter` time.
#[derive(Debug)]
pub enum ValueIter {
    List { items: Rc<RefCell<Vec<Value>>>, index: usize },
    Tuple { items: Rc<[Value]>, index: usize },
    Str { text: Rc<str>, byte_index: usize },
    Range { next: i64, stop: i64, step: i64 },
    Snapshot { items: Vec<Value>, index: usize },
}

impl Iterator for ValueIter {
    type Item = Value;

    /// Advances the iterator; `None` signals exhaustion.
    fn next(&mut self) -> Option<Value> {
        match self {
            Self::List { items, index } => {
                let items = items.borrow();
                let value = items.get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            Self::Tuple { items, index } => {
                let value = items.get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            Self::Str { text, byte_index } => {
                let ch = text[*byte_index..].chars().next()?;
                *byte_index += ch.len_utf8();
                Some(Value::new_str(ch.to_string()))
            }
            Self::Range { next, stop, step } => {
                let exhausted = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if exhausted {
                    return None;
                }
                let value = *next;
                *next += *step;
                Some(Value::Int(value))
            }
            Self::Snapshot { items, index } => {
                let value = items.get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_unifies_bool_int_float() {
        assert_eq!(Value::Int(1), Value::Bool(true));
        assert_eq!(Value::Float(2.0), Value::Int(2));
        assert_ne!(Value::Int(1), Value::Int(2));
        assert_ne!(Value::Int(0), Value::None);
    }

    #[test]
    fn int_overflow_is_an_error() {
        let err = Value::binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1));
        assert!(matches!(
            err,
            Err(crate::error::RunError::Exc(e)) if e.exc_type == ExcType::OverflowError
        ));
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(
            Value::binary(BinaryOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            Value::binary(BinaryOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            Value::binary(BinaryOp::Mod, &Value::Int(7), &Value::Int(-2)).unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn true_division_produces_floats() {
        assert_eq!(
            Value::binary(BinaryOp::TrueDiv, &Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Float(3.5)
        );
        assert!(matches!(
            Value::binary(BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(0)),
            Err(crate::error::RunError::Exc(e)) if e.exc_type == ExcType::ZeroDivisionError
        ));
    }

    #[test]
    fn sequence_concat_and_repeat() {
        let ab = Value::binary(BinaryOp::Add, &Value::new_str("a"), &Value::new_str("b")).unwrap();
        assert_eq!(ab, Value::new_str("ab"));

        let repeated = Value::binary(BinaryOp::Mul, &Value::new_str("ab"), &Value::Int(3)).unwrap();
        assert_eq!(repeated, Value::new_str("ababab"));

        let list = Value::new_list(vec![Value::Int(1)]);
        let doubled = Value::binary(BinaryOp::Mul, &list, &Value::Int(2)).unwrap();
        assert_eq!(doubled, Value::new_list(vec![Value::Int(1), Value::Int(1)]));
    }

    #[test]
    fn key_unification() {
        let mut map = DictMap::default();
        map.insert(Key::new(Value::Int(1)).unwrap(), Value::new_str("int"));
        map.insert(Key::new(Value::Float(1.0)).unwrap(), Value::new_str("float"));
        // 1 and 1.0 are the same key; the second insert overwrote the value.
        assert_eq!(map.len(), 1);
        assert_eq!(map[&Key::new(Value::Bool(true)).unwrap()], Value::new_str("float"));
    }

    #[test]
    fn unhashable_keys_are_rejected() {
        assert!(Key::new(Value::new_list(vec![])).is_err());
        assert!(Key::new(Value::new_tuple(vec![Value::new_list(vec![])])).is_err());
        assert!(Key::new(Value::new_tuple(vec![Value::Int(1)])).is_ok());
    }

    #[test]
    fn repr_formatting() {
        assert_eq!(Value::Float(1.0).repr(), "1.0");
        assert_eq!(Value::Float(0.5).repr(), "0.5");
        assert_eq!(Value::new_str("hi").repr(), "'hi'");
        assert_eq!(Value::new_tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::new_list(vec![Value::Int(1), Value::None]).repr(),
            "[1, None]"
        );
    }

    #[test]
    fn ordering_mismatch_is_a_type_error() {
        assert!(matches!(
            Value::compare(CmpOp::Lt, &Value::Int(1), &Value::new_str("a")),
            Err(crate::error::RunError::Exc(e)) if e.exc_type == ExcType::TypeError
        ));
        assert_eq!(
            Value::compare(CmpOp::Lt, &Value::new_str("a"), &Value::new_str("b")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn slice_indices_clamp() {
        let s = Slice {
            start: Some(-2),
            stop: None,
            step: None,
        };
        assert_eq!(s.iter_indices(5).unwrap(), vec![3, 4]);

        let rev = Slice {
            start: None,
            stop: None,
            step: Some(-1),
        };
        assert_eq!(rev.iter_indices(3).unwrap(), vec![2, 1, 0]);
    }
}
