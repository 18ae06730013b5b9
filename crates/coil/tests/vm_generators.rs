//! Generator suspension and resumption.

use std::rc::Rc;

use coil::{CodeBuilder, Const, ExcType, GeneratorState, Opcode, Value, Vm, VmError};
use pretty_assertions::assert_eq;

/// Builds a module that defines a generator function from `gen_code` and
/// returns one fresh generator from calling it.
fn generator_module(gen_code: Rc<coil::Code>) -> CodeBuilder {
    let mut module = CodeBuilder::new("module");
    let code = module.add_const(Const::Code(gen_code));
    let name = module.add_const(Const::Str("g".into()));
    module.emit_arg(Opcode::LoadConst, code);
    module.emit_arg(Opcode::LoadConst, name);
    module.emit_arg(Opcode::MakeFunction, 0);
    module.emit_arg(Opcode::CallFunction, 0);
    module.emit(Opcode::ReturnValue);
    module
}

/// A generator yielding 1 then 2.
fn one_two_generator() -> Rc<coil::Code> {
    let mut g = CodeBuilder::new("g");
    g.mark_generator();
    let one = g.add_const(Const::Int(1));
    let two = g.add_const(Const::Int(2));
    let none = g.add_const(Const::None);
    g.emit_arg(Opcode::LoadConst, one);
    g.emit(Opcode::YieldValue);
    g.emit(Opcode::PopTop); // discard the resume sentinel
    g.emit_arg(Opcode::LoadConst, two);
    g.emit(Opcode::YieldValue);
    g.emit(Opcode::PopTop);
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::ReturnValue);
    Rc::new(g.build())
}

/// Calling a generator function returns a suspended generator without
/// executing any instruction.
#[test]
fn call_returns_unstarted_generator() {
    let mut vm = Vm::new();
    let value = vm.run(&Rc::new(generator_module(one_two_generator()).build())).unwrap();
    match &value {
        Value::Generator(generator) => assert_eq!(generator.borrow().state(), GeneratorState::NotStarted),
        other => panic!("expected a generator, got {other:?}"),
    }
}

#[test]
fn resume_pulls_yielded_values_then_exhausts() {
    let mut vm = Vm::new();
    let generator = vm.run(&Rc::new(generator_module(one_two_generator()).build())).unwrap();

    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(1));
    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(2));

    // The pull that drives the frame to `return` reports exhaustion...
    match vm.resume(&generator) {
        Err(VmError::Uncaught(exc)) => assert_eq!(exc.exc_type, ExcType::StopIteration),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    // ...and every further pull is idempotent: exhausted, no re-execution.
    for _ in 0..3 {
        match vm.resume(&generator) {
            Err(VmError::Uncaught(exc)) => assert_eq!(exc.exc_type, ExcType::StopIteration),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
    match &generator {
        Value::Generator(generator) => assert!(generator.borrow().is_finished()),
        other => panic!("expected a generator, got {other:?}"),
    }
}

/// The injected resume sentinel is the value of the suspended yield
/// expression.
#[test]
fn resume_sentinel_is_yield_expression_value() {
    // def g(): x = yield 1; yield x
    let mut g = CodeBuilder::new("g");
    g.mark_generator();
    let one = g.add_const(Const::Int(1));
    let none = g.add_const(Const::None);
    let x = g.varname_idx("x");
    g.emit_arg(Opcode::LoadConst, one);
    g.emit(Opcode::YieldValue);
    g.emit_arg(Opcode::StoreFast, x);
    g.emit_arg(Opcode::LoadFast, x);
    g.emit(Opcode::YieldValue);
    g.emit(Opcode::PopTop);
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::ReturnValue);

    let mut vm = Vm::new();
    let generator = vm.run(&Rc::new(generator_module(Rc::new(g.build())).build())).unwrap();
    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(1));
    assert_eq!(vm.resume(&generator).unwrap(), Value::None);
}

/// Suspension preserves the operand stack below the yield.
#[test]
fn operand_stack_survives_suspension() {
    // Stack holds a 10 across the first yield; the second yield returns
    // 10 + 5 computed from it.
    let mut g = CodeBuilder::new("g");
    g.mark_generator();
    let ten = g.add_const(Const::Int(10));
    let thirty_two = g.add_const(Const::Int(32));
    let five = g.add_const(Const::Int(5));
    let none = g.add_const(Const::None);
    g.emit_arg(Opcode::LoadConst, ten);
    g.emit_arg(Opcode::LoadConst, thirty_two);
    g.emit(Opcode::YieldValue); // yields 32, leaves 10 on the stack
    g.emit(Opcode::PopTop); // sentinel
    g.emit_arg(Opcode::LoadConst, five);
    g.emit(Opcode::BinaryAdd); // 10 + 5
    g.emit(Opcode::YieldValue);
    g.emit(Opcode::PopTop);
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::ReturnValue);

    let mut vm = Vm::new();
    let generator = vm.run(&Rc::new(generator_module(Rc::new(g.build())).build())).unwrap();
    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(32));
    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(15));
}

/// `ForIter` drives a generator inside another run, converting its
/// exhaustion into the loop exit.
#[test]
fn for_loop_over_generator() {
    let mut g = CodeBuilder::new("g");
    g.mark_generator();
    let none = g.add_const(Const::None);
    for n in [1i64, 2, 3] {
        let c = g.add_const(Const::Int(n));
        g.emit_arg(Opcode::LoadConst, c);
        g.emit(Opcode::YieldValue);
        g.emit(Opcode::PopTop);
    }
    g.emit_arg(Opcode::LoadConst, none);
    g.emit(Opcode::ReturnValue);

    // total = 0
    // for v in g(): total = total + v
    // return total
    let mut b = CodeBuilder::new("module");
    let zero = b.add_const(Const::Int(0));
    let code = b.add_const(Const::Code(Rc::new(g.build())));
    let name = b.add_const(Const::Str("g".into()));
    let total = b.varname_idx("total");
    let v = b.varname_idx("v");

    b.emit_arg(Opcode::LoadConst, zero);
    b.emit_arg(Opcode::StoreFast, total);
    b.emit_arg(Opcode::LoadConst, code);
    b.emit_arg(Opcode::LoadConst, name);
    b.emit_arg(Opcode::MakeFunction, 0);
    b.emit_arg(Opcode::CallFunction, 0);
    b.emit(Opcode::GetIter); // a generator is its own iterator
    let break_exit = b.emit_jump(Opcode::SetupLoop);
    let restart = b.offset();
    let exhausted = b.emit_jump(Opcode::ForIter);
    b.emit_arg(Opcode::StoreFast, v);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit_arg(Opcode::LoadFast, v);
    b.emit(Opcode::BinaryAdd);
    b.emit_arg(Opcode::StoreFast, total);
    b.emit_arg(Opcode::JumpAbsolute, restart as u16);
    b.patch_jump(exhausted);
    b.emit(Opcode::PopBlock);
    let done = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(break_exit);
    b.emit(Opcode::PopTop);
    b.patch_jump(done);
    b.emit_arg(Opcode::LoadFast, total);
    b.emit(Opcode::ReturnValue);

    assert_eq!(Vm::new().run(&Rc::new(b.build())).unwrap(), Value::Int(6));
}

/// An exception raised inside a generator propagates to the resumer and
/// finishes the generator.
#[test]
fn generator_exception_finishes_it() {
    let mut g = CodeBuilder::new("g");
    g.mark_generator();
    let one = g.add_const(Const::Int(1));
    let zero = g.add_const(Const::Int(0));
    g.emit_arg(Opcode::LoadConst, one);
    g.emit(Opcode::YieldValue);
    g.emit(Opcode::PopTop);
    g.emit_arg(Opcode::LoadConst, one);
    g.emit_arg(Opcode::LoadConst, zero);
    g.emit(Opcode::BinaryTrueDivide); // ZeroDivisionError
    g.emit(Opcode::ReturnValue);

    let mut vm = Vm::new();
    let generator = vm.run(&Rc::new(generator_module(Rc::new(g.build())).build())).unwrap();
    assert_eq!(vm.resume(&generator).unwrap(), Value::Int(1));
    match vm.resume(&generator) {
        Err(VmError::Uncaught(exc)) => assert_eq!(exc.exc_type, ExcType::ZeroDivisionError),
        other => panic!("expected the ZeroDivisionError to propagate, got {other:?}"),
    }
    // The failure finished the generator; further pulls are exhausted.
    match vm.resume(&generator) {
        Err(VmError::Uncaught(exc)) => assert_eq!(exc.exc_type, ExcType::StopIteration),
        other => panic!("expected exhaustion, got {other:?}"),
    }
}
