//! Closure cells: sharing between enclosing and nested frames, in both
//! directions, and forwarding across two levels of nesting.

use std::rc::Rc;

use coil::{CodeBuilder, Const, Opcode, Value, Vm, VmError};
use pretty_assertions::assert_eq;

fn run(b: CodeBuilder) -> Result<Value, VmError> {
    Vm::new().run(&Rc::new(b.build()))
}

fn run_ok(b: CodeBuilder) -> Value {
    run(b).expect("run failed")
}

/// Emits `MakeFunction` for a code constant (no captured cells).
fn emit_make_function(b: &mut CodeBuilder, code: Const, name: &str) {
    let code = b.add_const(code);
    let name = b.add_const(Const::Str(name.into()));
    b.emit_arg(Opcode::LoadConst, code);
    b.emit_arg(Opcode::LoadConst, name);
    b.emit_arg(Opcode::MakeFunction, 0);
}

/// Emits `MakeClosure` capturing one cell by name.
fn emit_make_closure(b: &mut CodeBuilder, captured: &str, code: Const, name: &str) {
    let cell = b.cellvar_idx(captured);
    let code = b.add_const(code);
    let name = b.add_const(Const::Str(name.into()));
    b.emit_arg(Opcode::LoadClosure, cell);
    b.emit_arg(Opcode::BuildTuple, 1);
    b.emit_arg(Opcode::LoadConst, code);
    b.emit_arg(Opcode::LoadConst, name);
    b.emit_arg(Opcode::MakeClosure, 0);
}

/// A nested frame's write through a cell is observed by the enclosing
/// frame's subsequent read.
#[test]
fn inner_write_is_seen_by_outer() {
    // def outer():
    //     x = 1
    //     def inner(): x = 99          (nonlocal write)
    //     inner()
    //     return x
    let mut inner = CodeBuilder::new("inner");
    let x_free = inner.freevar_idx("x");
    let v99 = inner.add_const(Const::Int(99));
    let none = inner.add_const(Const::None);
    inner.emit_arg(Opcode::LoadConst, v99);
    inner.emit_arg(Opcode::StoreDeref, x_free);
    inner.emit_arg(Opcode::LoadConst, none);
    inner.emit(Opcode::ReturnValue);
    let inner = Rc::new(inner.build());

    let mut outer = CodeBuilder::new("outer");
    let one = outer.add_const(Const::Int(1));
    let x_cell = outer.cellvar_idx("x");
    let f = outer.varname_idx("f");
    outer.emit_arg(Opcode::LoadConst, one);
    outer.emit_arg(Opcode::StoreDeref, x_cell);
    emit_make_closure(&mut outer, "x", Const::Code(Rc::clone(&inner)), "inner");
    outer.emit_arg(Opcode::StoreFast, f);
    outer.emit_arg(Opcode::LoadFast, f);
    outer.emit_arg(Opcode::CallFunction, 0);
    outer.emit(Opcode::PopTop);
    outer.emit_arg(Opcode::LoadDeref, x_cell);
    outer.emit(Opcode::ReturnValue);
    let outer = Rc::new(outer.build());

    let mut module = CodeBuilder::new("module");
    emit_make_function(&mut module, Const::Code(outer), "outer");
    module.emit_arg(Opcode::CallFunction, 0);
    module.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(module), Value::Int(99));
}

/// The enclosing frame's write after the closure was made is observed by
/// the nested frame's read.
#[test]
fn outer_write_is_seen_by_inner() {
    // def outer():
    //     x = 1
    //     def inner(): return x
    //     x = 42
    //     return inner()
    let mut inner = CodeBuilder::new("inner");
    let x_free = inner.freevar_idx("x");
    inner.emit_arg(Opcode::LoadDeref, x_free);
    inner.emit(Opcode::ReturnValue);
    let inner = Rc::new(inner.build());

    let mut outer = CodeBuilder::new("outer");
    let one = outer.add_const(Const::Int(1));
    let v42 = outer.add_const(Const::Int(42));
    let x_cell = outer.cellvar_idx("x");
    let f = outer.varname_idx("f");
    outer.emit_arg(Opcode::LoadConst, one);
    outer.emit_arg(Opcode::StoreDeref, x_cell);
    emit_make_closure(&mut outer, "x", Const::Code(Rc::clone(&inner)), "inner");
    outer.emit_arg(Opcode::StoreFast, f);
    outer.emit_arg(Opcode::LoadConst, v42);
    outer.emit_arg(Opcode::StoreDeref, x_cell);
    outer.emit_arg(Opcode::LoadFast, f);
    outer.emit_arg(Opcode::CallFunction, 0);
    outer.emit(Opcode::ReturnValue);
    let outer = Rc::new(outer.build());

    let mut module = CodeBuilder::new("module");
    emit_make_function(&mut module, Const::Code(outer), "outer");
    module.emit_arg(Opcode::CallFunction, 0);
    module.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(module), Value::Int(42));
}

/// Two levels of cell forwarding: the innermost function reads a variable
/// captured by its grandparent.
#[test]
fn two_level_cell_forwarding() {
    // def grand():
    //     x = 7
    //     def mid():
    //         def inner(): return x
    //         return inner()
    //     return mid()
    let mut inner = CodeBuilder::new("inner");
    let x_free = inner.freevar_idx("x");
    inner.emit_arg(Opcode::LoadDeref, x_free);
    inner.emit(Opcode::ReturnValue);
    let inner = Rc::new(inner.build());

    // mid captures x as a free variable and forwards it to inner.
    let mut mid = CodeBuilder::new("mid");
    let x_free = mid.freevar_idx("x");
    let f = mid.varname_idx("f");
    let code = mid.add_const(Const::Code(inner));
    let name = mid.add_const(Const::Str("inner".into()));
    mid.emit_arg(Opcode::LoadClosure, x_free);
    mid.emit_arg(Opcode::BuildTuple, 1);
    mid.emit_arg(Opcode::LoadConst, code);
    mid.emit_arg(Opcode::LoadConst, name);
    mid.emit_arg(Opcode::MakeClosure, 0);
    mid.emit_arg(Opcode::StoreFast, f);
    mid.emit_arg(Opcode::LoadFast, f);
    mid.emit_arg(Opcode::CallFunction, 0);
    mid.emit(Opcode::ReturnValue);
    let mid = Rc::new(mid.build());

    let mut grand = CodeBuilder::new("grand");
    let seven = grand.add_const(Const::Int(7));
    let x_cell = grand.cellvar_idx("x");
    let f = grand.varname_idx("f");
    grand.emit_arg(Opcode::LoadConst, seven);
    grand.emit_arg(Opcode::StoreDeref, x_cell);
    emit_make_closure(&mut grand, "x", Const::Code(mid), "mid");
    grand.emit_arg(Opcode::StoreFast, f);
    grand.emit_arg(Opcode::LoadFast, f);
    grand.emit_arg(Opcode::CallFunction, 0);
    grand.emit(Opcode::ReturnValue);
    let grand = Rc::new(grand.build());

    let mut module = CodeBuilder::new("module");
    emit_make_function(&mut module, Const::Code(grand), "grand");
    module.emit_arg(Opcode::CallFunction, 0);
    module.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(module), Value::Int(7));
}

/// A cell variable seeded from a parameter: the closure reads the bound
/// argument.
#[test]
fn cell_seeded_from_parameter() {
    // def outer(x):
    //     def inner(): return x
    //     return inner()
    let mut inner = CodeBuilder::new("inner");
    let x_free = inner.freevar_idx("x");
    inner.emit_arg(Opcode::LoadDeref, x_free);
    inner.emit(Opcode::ReturnValue);
    let inner = Rc::new(inner.build());

    let mut outer = CodeBuilder::new("outer");
    outer.varname_idx("x");
    outer.set_arg_count(1);
    let f = outer.varname_idx("f");
    emit_make_closure(&mut outer, "x", Const::Code(inner), "inner");
    outer.emit_arg(Opcode::StoreFast, f);
    outer.emit_arg(Opcode::LoadFast, f);
    outer.emit_arg(Opcode::CallFunction, 0);
    outer.emit(Opcode::ReturnValue);
    let outer = Rc::new(outer.build());

    let mut module = CodeBuilder::new("module");
    let arg = module.add_const(Const::Int(11));
    emit_make_function(&mut module, Const::Code(outer), "outer");
    module.emit_arg(Opcode::LoadConst, arg);
    module.emit_arg(Opcode::CallFunction, 1);
    module.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(module), Value::Int(11));
}
