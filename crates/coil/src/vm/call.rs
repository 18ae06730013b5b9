//! Call opcodes, callable dispatch, and function/class construction.
//!
//! Call opcodes pop the callee, positional argument block and keyword
//! pairs (count packed as `kw_count * 256 + pos_count`), bind them against
//! the callee and push exactly one result. Calling a generator-flagged
//! function wraps the fresh frame in a generator instead of running it.

use std::{cell::RefCell, rc::Rc};

use crate::{
    error::{ExcType, RunError, RunResult, SimpleException},
    frame::Cell,
    function::{Function, Generator},
    io::PrintWriter,
    value::{ClassObj, InstanceObj, Namespace, Value},
};

use super::{FrameExit, Vm, into_array};

impl<P: PrintWriter> Vm<P> {
    /// `MakeFunction` / `MakeClosure`: pop name, code object (and captured
    /// cells for closures), then the default arguments; push a function.
    pub(super) fn op_make_function(&mut self, default_count: usize, with_closure: bool) -> RunResult<()> {
        let name = match self.pop()? {
            Value::Str(s) => s,
            other => {
                return Err(RunError::internal(format!(
                    "function name must be a string, got '{}'",
                    other.type_name()
                )));
            }
        };
        let (closure, code) = if with_closure {
            let [closure_v, code_v] = into_array(self.pop_n(2)?)?;
            (closure_cells(closure_v)?, code_v)
        } else {
            (Vec::new(), self.pop()?)
        };
        let code = match code {
            Value::Code(code) => code,
            other => {
                return Err(RunError::internal(format!(
                    "MakeFunction expects a code object, got '{}'",
                    other.type_name()
                )));
            }
        };
        let defaults = self.pop_n(default_count)?;
        let globals = Rc::clone(&self.current_frame()?.globals);
        let function = Function {
            name,
            code,
            defaults,
            closure,
            globals,
        };
        self.push(Value::Function(Rc::new(function)))
    }

    pub(super) fn op_call_function(&mut self, argc: u16) -> RunResult<()> {
        self.call_function_with(argc, Vec::new(), Vec::new())
    }

    /// `CallFunctionVar`: an iterable of extra positionals sits on top.
    pub(super) fn op_call_function_var(&mut self, argc: u16) -> RunResult<()> {
        let star = self.pop()?;
        self.call_function_with(argc, star_args(star)?, Vec::new())
    }

    /// `CallFunctionKw`: a mapping of extra keywords sits on top.
    pub(super) fn op_call_function_kw(&mut self, argc: u16) -> RunResult<()> {
        let kw = self.pop()?;
        self.call_function_with(argc, Vec::new(), star_kwargs(kw)?)
    }

    /// `CallFunctionVarKw`: both, with the mapping on top.
    pub(super) fn op_call_function_var_kw(&mut self, argc: u16) -> RunResult<()> {
        let [star, kw] = into_array(self.pop_n(2)?)?;
        self.call_function_with(argc, star_args(star)?, star_kwargs(kw)?)
    }

    fn call_function_with(
        &mut self,
        argc: u16,
        extra_args: Vec<Value>,
        extra_kwargs: Vec<(Rc<str>, Value)>,
    ) -> RunResult<()> {
        let kw_count = usize::from(argc >> 8);
        let pos_count = usize::from(argc & 0xff);

        let mut kwargs = Vec::with_capacity(kw_count + extra_kwargs.len());
        for _ in 0..kw_count {
            let [key, value] = into_array(self.pop_n(2)?)?;
            match key {
                Value::Str(key) => kwargs.push((key, value)),
                other => {
                    return Err(ExcType::TypeError
                        .raise(format!("keywords must be strings, not '{}'", other.type_name())));
                }
            }
        }
        kwargs.extend(extra_kwargs);

        let mut args = self.pop_n(pos_count)?;
        args.extend(extra_args);

        let callee = self.pop()?;
        let result = self.call_value(callee, args, kwargs)?;
        self.push(result)
    }

    /// Calls any callable value and returns its result.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(Rc<str>, Value)>,
    ) -> RunResult<Value> {
        match callee {
            Value::Function(function) => self.call_function_obj(&function, args, kwargs),
            Value::Method(method) => {
                // The receiver must be an instance of the method's declaring
                // class.
                let valid = matches!(&method.receiver, Value::Instance(obj) if Rc::ptr_eq(&obj.class, &method.class));
                if !valid {
                    return Err(ExcType::TypeError.raise(format!(
                        "{}() must be called with a {} instance as first argument",
                        method.function.name, method.class.name
                    )));
                }
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(method.receiver.clone());
                full.extend(args);
                self.call_function_obj(&method.function, full, kwargs)
            }
            Value::Builtin(builtin) => {
                if !kwargs.is_empty() {
                    return Err(ExcType::TypeError.raise(format!("{builtin}() takes no keyword arguments")));
                }
                builtin.invoke(self, args)
            }
            Value::ExcType(exc_type) => {
                if !kwargs.is_empty() {
                    return Err(ExcType::TypeError.raise(format!("{exc_type}() takes no keyword arguments")));
                }
                construct_exception(exc_type, args)
            }
            Value::Class(class) => self.instantiate(&class, args, kwargs),
            other => Err(ExcType::TypeError.raise(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    /// Builds a child frame for `function` and either runs it to completion
    /// or, for generator-flagged code, wraps it unexecuted.
    fn call_function_obj(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(Rc<str>, Value)>,
    ) -> RunResult<Value> {
        let callargs = function.bind_args(args, kwargs)?;
        let locals = Rc::new(RefCell::new(Namespace::default()));
        let mut frame = self.make_frame(
            Rc::clone(&function.code),
            callargs,
            Some(Rc::clone(&function.globals)),
            Some(locals),
            &function.closure,
        )?;

        if function.code.is_generator() {
            frame.is_generator = true;
            let generator = Generator::new(Rc::clone(&function.name), frame);
            return Ok(Value::Generator(Rc::new(RefCell::new(generator))));
        }

        match self.run_frame(frame)? {
            (_, FrameExit::Return(value)) => Ok(value),
            (_, FrameExit::Yield(_)) => Err(RunError::internal("yield escaped a non-generator frame")),
        }
    }

    /// Instantiates a class: fresh instance, then `__init__` if defined.
    fn instantiate(
        &mut self,
        class: &Rc<ClassObj>,
        args: Vec<Value>,
        kwargs: Vec<(Rc<str>, Value)>,
    ) -> RunResult<Value> {
        let instance = Rc::new(InstanceObj {
            class: Rc::clone(class),
            attrs: RefCell::new(Namespace::default()),
        });
        let init = class.namespace.borrow().get("__init__").cloned();
        match init {
            Some(Value::Function(init)) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(Value::Instance(Rc::clone(&instance)));
                full.extend(args);
                let result = self.call_function_obj(&init, full, kwargs)?;
                if !matches!(result, Value::None) {
                    return Err(ExcType::TypeError.raise(format!(
                        "__init__() should return None, not '{}'",
                        result.type_name()
                    )));
                }
            }
            _ => {
                if !args.is_empty() || !kwargs.is_empty() {
                    return Err(ExcType::TypeError.raise(format!("{}() takes no arguments", class.name)));
                }
            }
        }
        Ok(Value::Instance(instance))
    }

    /// `__build_class__(body, name)`: run the class body function and
    /// capture the namespace mapping it returns as the class namespace.
    pub(crate) fn build_class(&mut self, args: Vec<Value>) -> RunResult<Value> {
        let [body, name] = args.try_into().map_err(|_| {
            ExcType::TypeError.raise("__build_class__() takes exactly 2 arguments (class bases are not supported)")
        })?;
        let name = match name {
            Value::Str(s) => s,
            other => {
                return Err(ExcType::TypeError
                    .raise(format!("__build_class__() name must be a string, got '{}'", other.type_name())));
            }
        };
        let body = match body {
            Value::Function(f) => f,
            other => {
                return Err(ExcType::TypeError
                    .raise(format!("__build_class__() body must be a function, got '{}'", other.type_name())));
            }
        };

        let namespace_value = self.call_function_obj(&body, Vec::new(), Vec::new())?;
        let namespace = match namespace_value {
            Value::Dict(map) => {
                let mut ns = Namespace::default();
                for (key, value) in map.borrow().iter() {
                    if let Value::Str(attr) = &key.0 {
                        ns.insert(Rc::clone(attr), value.clone());
                    }
                }
                ns
            }
            other => {
                return Err(ExcType::TypeError
                    .raise(format!("class body must return a namespace mapping, got '{}'", other.type_name())));
            }
        };
        Ok(Value::Class(Rc::new(ClassObj {
            name,
            namespace: RefCell::new(namespace),
        })))
    }
}

/// Extracts the cell list captured by `MakeClosure`.
fn closure_cells(value: Value) -> RunResult<Vec<Cell>> {
    let items = match value {
        Value::Tuple(items) => items,
        other => {
            return Err(RunError::internal(format!(
                "closure must be a tuple of cells, got '{}'",
                other.type_name()
            )));
        }
    };
    items
        .iter()
        .map(|item| match item {
            Value::Cell(cell) => Ok(cell.clone()),
            other => Err(RunError::internal(format!(
                "closure tuple holds '{}', expected a cell",
                other.type_name()
            ))),
        })
        .collect()
}

/// Splats an iterable of extra positional arguments.
fn star_args(value: Value) -> RunResult<Vec<Value>> {
    match value {
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::List(items) => Ok(items.borrow().clone()),
        other => Err(ExcType::TypeError.raise(format!(
            "argument after * must be an iterable, not '{}'",
            other.type_name()
        ))),
    }
}

/// Splats a mapping of extra keyword arguments.
fn star_kwargs(value: Value) -> RunResult<Vec<(Rc<str>, Value)>> {
    match value {
        Value::Dict(map) => map
            .borrow()
            .iter()
            .map(|(key, val)| match &key.0 {
                Value::Str(name) => Ok((Rc::clone(name), val.clone())),
                other => Err(ExcType::TypeError.raise(format!("keywords must be strings, not '{}'", other.type_name()))),
            })
            .collect(),
        other => Err(ExcType::TypeError.raise(format!(
            "argument after ** must be a mapping, not '{}'",
            other.type_name()
        ))),
    }
}

/// Calling an exception class constructs an instance of it.
fn construct_exception(exc_type: ExcType, mut args: Vec<Value>) -> RunResult<Value> {
    let exc = match args.len() {
        0 => SimpleException::new(exc_type),
        1 => match args.remove(0) {
            Value::Str(message) => SimpleException {
                exc_type,
                message: Some(message),
            },
            other => SimpleException::new_msg(exc_type, other.str_value()),
        },
        n => {
            return Err(ExcType::TypeError.raise(format!("{exc_type}() takes at most 1 argument ({n} given)")));
        }
    };
    Ok(Value::Exception(Rc::new(exc)))
}
