#![doc = include_str!("../../../README.md")]

mod builtins;
mod code;
mod error;
mod frame;
mod function;
mod io;
mod op;
mod resource;
mod value;
mod vm;

pub use crate::{
    builtins::{Builtin, default_builtins},
    code::{Code, CodeBuilder, CodeFlags, Const, JumpLabel},
    error::{ExcType, Exception, SimpleException, VmError},
    frame::Cell,
    function::{Function, Generator, GeneratorState, Method},
    io::{CollectStringPrint, PrintWriter, StdPrint},
    op::{CmpOp, Opcode, OperandMode},
    resource::{DEFAULT_MAX_RECURSION_DEPTH, ResourceLimits},
    value::{ClassObj, DictMap, InstanceObj, Key, Marker, Namespace, SetStorage, Slice, Value, ValueIter},
    vm::Vm,
};
