//! Callable values: functions, bound methods and generators.
//!
//! A [`Function`] is a closure over a code object: name, defaults, captured
//! cells and the globals of its defining module. A [`Method`] binds a
//! receiver to a function. A [`Generator`] wraps the suspended frame of a
//! generator-flagged function and is resumed one pull at a time by the VM.

use std::{cell::RefCell, rc::Rc};

use crate::{
    code::Code,
    error::{ExcType, RunResult},
    frame::{Cell, Frame},
    value::{ClassObj, Namespace, Value},
};

/// A plain closure over a code object and captured cells.
#[derive(Debug)]
pub struct Function {
    /// The function name (used for error messages and repr).
    pub name: Rc<str>,
    /// Compiled body.
    pub code: Rc<Code>,
    /// Default values for the trailing parameters, in declaration order.
    pub defaults: Vec<Value>,
    /// Cells captured at definition time, aligned with the code object's
    /// free-variable table.
    pub closure: Vec<Cell>,
    /// The globals mapping of the defining module.
    pub globals: Rc<RefCell<Namespace>>,
}

impl Function {
    /// Binds call-site arguments against the declared parameter names and
    /// stored defaults, producing the callee's initial locals.
    ///
    /// Binding rules: positionals fill parameters left to right, keywords
    /// fill by name, defaults fill the remaining tail. Extra positionals,
    /// unknown keywords, duplicate bindings and missing parameters are all
    /// arity/type errors.
    pub fn bind_args(&self, args: Vec<Value>, kwargs: Vec<(Rc<str>, Value)>) -> RunResult<Namespace> {
        let params = self.code.param_names();
        let mut bound = Namespace::with_capacity(params.len());

        if args.len() > params.len() {
            return Err(ExcType::TypeError.raise(format!(
                "{}() takes {} positional argument{} but {} were given",
                self.name,
                params.len(),
                if params.len() == 1 { "" } else { "s" },
                args.len(),
            )));
        }
        for (name, value) in params.iter().zip(args) {
            bound.insert(Rc::clone(name), value);
        }

        for (name, value) in kwargs {
            if !params.iter().any(|p| **p == *name) {
                return Err(ExcType::TypeError
                    .raise(format!("{}() got an unexpected keyword argument '{}'", self.name, name)));
            }
            if bound.contains_key(&name) {
                return Err(ExcType::TypeError
                    .raise(format!("{}() got multiple values for argument '{}'", self.name, name)));
            }
            bound.insert(name, value);
        }

        // Defaults cover the trailing parameters.
        let usable = self.defaults.len().min(params.len());
        let default_start = params.len() - usable;
        for (offset, default) in self.defaults[self.defaults.len() - usable..].iter().enumerate() {
            let name = &params[default_start + offset];
            if !bound.contains_key(name) {
                bound.insert(Rc::clone(name), default.clone());
            }
        }

        if bound.len() < params.len() {
            let missing: Vec<&str> = params
                .iter()
                .filter(|p| !bound.contains_key(&***p))
                .map(|p| &**p)
                .collect();
            return Err(ExcType::TypeError.raise(format!(
                "{}() missing {} required positional argument{}: {}",
                self.name,
                missing.len(),
                if missing.len() == 1 { "" } else { "s" },
                missing.join(", "),
            )));
        }

        Ok(bound)
    }
}

/// A receiver-bound function produced by attribute lookup on an instance.
///
/// Transient: lives only as long as the call-site expression that produced
/// it.
#[derive(Debug)]
pub struct Method {
    /// The bound receiver (always an instance of `class`).
    pub receiver: Value,
    /// The class the function was found on.
    pub class: Rc<ClassObj>,
    /// The wrapped function.
    pub function: Rc<Function>,
}

/// Generator execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created but never pulled; the frame starts at instruction zero.
    NotStarted,
    /// A pull is in progress; re-entrant pulls are an error.
    Running,
    /// Suspended at a `yield`; the frame's full state is preserved.
    Suspended,
    /// The frame signalled `return` (or raised); every further pull fails
    /// with an exhausted condition.
    Finished,
}

/// A suspended generator: a callable whose invocation produced a frame
/// instead of running one.
///
/// The generator exclusively owns its frame while suspended; during a pull
/// the frame is moved onto the VM call stack (so nested calls see the
/// correct caller chain) and moved back afterwards.
#[derive(Debug)]
pub struct Generator {
    name: Rc<str>,
    pub(crate) state: GeneratorState,
    pub(crate) frame: Option<Frame>,
}

impl Generator {
    pub(crate) fn new(name: Rc<str>, frame: Frame) -> Self {
        Self {
            name,
            state: GeneratorState::NotStarted,
            frame: Some(frame),
        }
    }

    #[must_use]
    pub fn name(&self) -> Rc<str> {
        Rc::clone(&self.name)
    }

    #[must_use]
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == GeneratorState::Finished
    }
}
