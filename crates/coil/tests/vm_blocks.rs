//! Block-structured control transfer: loops, except guards and finally
//! regions, and the unwinding between them.
//!
//! The top-level `run` entry enforces the balanced-stack property on every
//! test here: a loop exited via break must leave the operand stack at the
//! loop's entry depth or the run itself fails with an internal error.

use std::{cell::RefCell, rc::Rc};

use coil::{CodeBuilder, Const, ExcType, Namespace, Opcode, Value, Vm, VmError};
use pretty_assertions::assert_eq;

fn run(b: CodeBuilder) -> Result<Value, VmError> {
    Vm::new().run(&Rc::new(b.build()))
}

fn run_ok(b: CodeBuilder) -> Value {
    run(b).expect("run failed")
}

/// A while-style loop driven entirely by `continue`, exited by `break`.
#[test]
fn loop_break_and_continue() {
    // i = 0
    // loop: if i == 3: break
    //       i = i + 1; continue
    // return i
    let mut b = CodeBuilder::new("loop");
    let zero = b.add_const(Const::Int(0));
    let one = b.add_const(Const::Int(1));
    let three = b.add_const(Const::Int(3));
    let i = b.varname_idx("i");

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, i);
    let exit = b.emit_jump(Opcode::SetupLoop);
    // restart:
    b.emit_arg(Opcode::LoadFast, i);
    b.emit_arg(Opcode::LoadConst, three);
    b.emit_arg(Opcode::CompareOp, 2); // Eq
    let not_done = b.emit_jump(Opcode::PopJumpIfFalse);
    b.emit(Opcode::BreakLoop);
    b.patch_jump(not_done);
    b.emit_arg(Opcode::LoadFast, i);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, i);
    b.emit(Opcode::ContinueLoop);
    b.patch_jump(exit);
    b.emit_arg(Opcode::LoadFast, i);
    b.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(b), Value::Int(3));
}

/// A for-style loop: iterator below the block, `ForIter` as the restart
/// target, separate exhaustion and break exits.
fn for_loop_sum(values: Vec<Const>, with_sentinel_break: bool) -> CodeBuilder {
    // total = 0
    // for v in values:
    //     if v == 99: break      (when with_sentinel_break)
    //     if v < 0: continue
    //     total = total + v
    // return total
    let mut b = CodeBuilder::new("for_loop");
    let zero = b.add_const(Const::Int(0));
    let sentinel = b.add_const(Const::Int(99));
    let values = b.add_const(Const::Tuple(values));
    let total = b.varname_idx("total");
    let v = b.varname_idx("v");

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, total);
    b.emit_arg(Opcode::LoadConst, values);
    b.emit(Opcode::GetIter);
    let break_exit = b.emit_jump(Opcode::SetupLoop);
    // restart (the ForIter instruction):
    let restart = b.offset();
    let exhausted = b.emit_jump(Opcode::ForIter);
    b.emit_arg(Opcode::StoreFast, v);
    if with_sentinel_break {
        b.emit_arg(Opcode::LoadFast, v);
        b.emit_arg(Opcode::LoadConst, sentinel);
        b.emit_arg(Opcode::CompareOp, 2); // Eq
        let no_break = b.emit_jump(Opcode::PopJumpIfFalse);
        b.emit(Opcode::BreakLoop);
        b.patch_jump(no_break);
    }
    b.emit_arg(Opcode::LoadFast, v);
    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::CompareOp, 0); // Lt
    let not_negative = b.emit_jump(Opcode::PopJumpIfFalse);
    b.emit(Opcode::ContinueLoop);
    b.patch_jump(not_negative);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit_arg(Opcode::LoadFast, v);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, total);
    b.emit_arg(Opcode::JumpAbsolute, restart as u16);
    // exhaustion exit: iterator already popped, block still open
    b.patch_jump(exhausted);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    // break exit: block popped by unwinding, iterator still on the stack
    b.patch_jump(break_exit);
    b.emit(Opcode::PopTop);
    b.patch_jump(done);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit(Opcode::ReturnValue);
    b
}

#[test]
fn for_loop_runs_to_exhaustion() {
    let b = for_loop_sum(vec![Const::Int(1), Const::Int(-2), Const::Int(3)], false);
    assert_eq!(run_ok(b), Value::Int(4));
}

#[test]
fn for_loop_break_restores_entry_depth() {
    let b = for_loop_sum(
        vec![Const::Int(1), Const::Int(-2), Const::Int(3), Const::Int(99), Const::Int(5)],
        true,
    );
    // Breaking at the sentinel leaves 1 + 3; the balanced-stack check in
    // `run` verifies the iterator was unwound with the loop block.
    assert_eq!(run_ok(b), Value::Int(4));
}

/// An except-guard catches a failing subscript and the handler's return
/// value is what `run` observes.
#[test]
fn except_guard_catches_subscript_error() {
    let mut b = CodeBuilder::new("try_except");
    let pair = b.add_const(Const::Tuple(vec![Const::Int(1), Const::Int(2)]));
    let five = b.add_const(Const::Int(5));
    let fallback = b.add_const(Const::Int(42));

    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadConst, pair);
    b.emit_arg(Opcode::LoadConst, five);
    b.emit(Opcode::BinarySubscr); // IndexError
    b.emit(Opcode::ReturnValue); // unreachable
    b.patch_jump(handler);
    // handler prologue: discard one (type, value, traceback) triple
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, fallback);
    b.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(b), Value::Int(42));
}

/// Handler with an exception-class match: matched exceptions are consumed
/// via PopExcept, unmatched ones re-raise to the caller.
fn except_matching(handler_class: &str) -> CodeBuilder {
    // try: raise ValueError("boom")
    // except <handler_class>: return 7
    let mut b = CodeBuilder::new("matching");
    let boom = b.add_const(Const::Str("boom".into()));
    let seven = b.add_const(Const::Int(7));
    let value_error = b.name_idx("ValueError");
    let handler_name = b.name_idx(handler_class);

    let handler = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadGlobal, value_error);
    b.emit_arg(Opcode::LoadConst, boom);
    b.emit_arg(Opcode::CallFunction, 1);
    b.emit_arg(Opcode::Raise, 1);
    b.patch_jump(handler);
    b.emit(Opcode::DupTop);
    b.emit_arg(Opcode::LoadGlobal, handler_name);
    b.emit_arg(Opcode::CompareOp, 10); // ExcMatch
    let no_match = b.emit_jump(Opcode::PopJumpIfFalse);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.emit_arg(Opcode::LoadConst, seven);
    b.emit(Opcode::ReturnValue);
    b.patch_jump(no_match);
    b.emit_arg(Opcode::Raise, 0); // bare re-raise
    b
}

#[test]
fn matched_handler_consumes_the_exception() {
    assert_eq!(run_ok(except_matching("ValueError")), Value::Int(7));
}

#[test]
fn unmatched_handler_reraises() {
    match run(except_matching("IndexError")) {
        Err(VmError::Uncaught(exc)) => {
            assert_eq!(exc.exc_type, ExcType::ValueError);
            assert_eq!(exc.message.as_deref(), Some("boom"));
        }
        other => panic!("expected the ValueError to propagate, got {other:?}"),
    }
}

/// `finally` runs on the return path and the parked return value survives.
#[test]
fn finally_runs_on_return() {
    // try: return 5
    // finally: ran = True
    let mut b = CodeBuilder::new("finally_return");
    let five = b.add_const(Const::Int(5));
    let truthy = b.add_const(Const::Bool(true));
    let ran = b.name_idx("ran");

    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit_arg(Opcode::LoadConst, five);
    b.emit(Opcode::ReturnValue);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadConst, truthy);
    b.emit_arg(Opcode::StoreGlobal, ran);
    b.emit(Opcode::EndFinally);

    let globals = Rc::new(RefCell::new(Namespace::default()));
    let mut vm = Vm::new();
    let result = vm
        .run_with_env(
            &Rc::new(b.build()),
            Some(Rc::clone(&globals)),
            Some(Rc::new(RefCell::new(Namespace::default()))),
        )
        .unwrap();
    assert_eq!(result, Value::Int(5));
    assert_eq!(globals.borrow().get("ran"), Some(&Value::Bool(true)));
}

/// The normal (fall-through) path through a finally body resumes nothing.
#[test]
fn finally_fall_through() {
    // try: x = 1
    // finally: x = x + 2
    // return x
    let mut b = CodeBuilder::new("finally_normal");
    let one = b.add_const(Const::Int(1));
    let two = b.add_const(Const::Int(2));
    let none = b.add_const(Const::None);
    let x = b.varname_idx("x");

    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::StoreFast, x);
    b.emit(Opcode::PopBlock);
    b.emit_arg(Opcode::LoadConst, none);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadFast, x);
    b.emit_arg(Opcode::LoadConst, two);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, x);
    b.emit(Opcode::EndFinally);
    b.emit_arg(Opcode::LoadFast, x);
    b.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(b), Value::Int(3));
}

/// `finally` on the break path: the parked break resumes after the body
/// and still exits the loop.
#[test]
fn finally_runs_on_break() {
    // ran = 0
    // loop: try: break
    //       finally: ran = ran + 1
    // return ran
    let mut b = CodeBuilder::new("finally_break");
    let zero = b.add_const(Const::Int(0));
    let one = b.add_const(Const::Int(1));
    let ran = b.varname_idx("ran");

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, ran);
    let exit = b.emit_jump(Opcode::SetupLoop);
    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit(Opcode::BreakLoop);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadFast, ran);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, ran);
    b.emit(Opcode::EndFinally);
    b.patch_jump(exit);
    b.emit_arg(Opcode::LoadFast, ran);
    b.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(b), Value::Int(1));
}

/// An exception crossing a finally body re-raises after the body ran.
#[test]
fn finally_reraises_pending_exception() {
    let mut b = CodeBuilder::new("finally_raise");
    let truthy = b.add_const(Const::Bool(true));
    let ran = b.name_idx("ran");
    let value_error = b.name_idx("ValueError");

    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit_arg(Opcode::LoadGlobal, value_error);
    b.emit_arg(Opcode::Raise, 1);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadConst, truthy);
    b.emit_arg(Opcode::StoreGlobal, ran);
    b.emit(Opcode::EndFinally);

    let globals = Rc::new(RefCell::new(Namespace::default()));
    let mut vm = Vm::new();
    let result = vm.run_with_env(
        &Rc::new(b.build()),
        Some(Rc::clone(&globals)),
        Some(Rc::new(RefCell::new(Namespace::default()))),
    );
    match result {
        Err(VmError::Uncaught(exc)) => assert_eq!(exc.exc_type, ExcType::ValueError),
        other => panic!("expected the ValueError to propagate, got {other:?}"),
    }
    assert_eq!(globals.borrow().get("ran"), Some(&Value::Bool(true)));
}

/// `continue` crossing a try/finally runs the body, then re-enters the
/// loop at its restart target.
#[test]
fn continue_through_finally() {
    // i = 0; total = 0
    // loop: if i >= 3: break
    //       i = i + 1
    //       try: continue
    //       finally: total = total + i
    // return (i, total)
    let mut b = CodeBuilder::new("continue_finally");
    let zero = b.add_const(Const::Int(0));
    let one = b.add_const(Const::Int(1));
    let three = b.add_const(Const::Int(3));
    let i = b.varname_idx("i");
    let total = b.varname_idx("total");

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, i);
    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, total);
    let exit = b.emit_jump(Opcode::SetupLoop);
    // restart:
    b.emit_arg(Opcode::LoadFast, i);
    b.emit_arg(Opcode::LoadConst, three);
    b.emit_arg(Opcode::CompareOp, 5); // Ge
    let keep_going = b.emit_jump(Opcode::PopJumpIfFalse);
    b.emit(Opcode::BreakLoop);
    b.patch_jump(keep_going);
    b.emit_arg(Opcode::LoadFast, i);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, i);
    let finally = b.emit_jump(Opcode::SetupFinally);
    b.emit(Opcode::ContinueLoop);
    b.patch_jump(finally);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit_arg(Opcode::LoadFast, i);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, total);
    b.emit(Opcode::EndFinally);
    b.patch_jump(exit);
    b.emit_arg(Opcode::LoadFast, i);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit_arg(Opcode::BuildTuple, 2);
    b.emit(Opcode::ReturnValue);

    assert_eq!(
        run_ok(b),
        Value::new_tuple(vec![Value::Int(3), Value::Int(6)])
    );
}

/// Nested guards: the inner except consumes the exception; the outer one
/// never fires.
#[test]
fn nested_except_guards() {
    let mut b = CodeBuilder::new("nested");
    let one = b.add_const(Const::Int(1));
    let zero = b.add_const(Const::Int(0));
    let inner_caught = b.add_const(Const::Int(10));

    let outer = b.emit_jump(Opcode::SetupExcept);
    let inner = b.emit_jump(Opcode::SetupExcept);
    b.emit_arg(Opcode::LoadConst, one);
    b.emit_arg(Opcode::LoadConst, zero);
    b.emit(Opcode::BinaryTrueDivide); // ZeroDivisionError
    b.emit(Opcode::ReturnValue);
    b.patch_jump(inner);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.emit(Opcode::PopBlock); // leave the outer guard
    b.emit_arg(Opcode::LoadConst, inner_caught);
    b.emit(Opcode::ReturnValue);
    b.patch_jump(outer);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_arg(Opcode::LoadConst, zero);
    b.emit(Opcode::ReturnValue);

    assert_eq!(run_ok(b), Value::Int(10));
}
