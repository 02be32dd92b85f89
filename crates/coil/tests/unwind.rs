//! Block-stack unwinding: loops, except handlers, finally blocks, and the
//! corruption cases.

mod common;

use coil::{CodeAssembler, CompareArg, ExcKind, Opcode, RunError, ScopeInfo, Value};
use common::{global, globals_with, run, run_in};
use pretty_assertions::assert_eq;

fn module_asm() -> CodeAssembler {
    CodeAssembler::new("<module>", "test.py", 1, &ScopeInfo::module())
}

/// `counter = counter + 1` against the globals.
fn emit_increment(asm: &mut CodeAssembler, name: &str) {
    asm.emit_op_name(Opcode::LoadGlobal, name);
    asm.load_const(Value::Int(1));
    asm.emit_op(Opcode::BinaryAdd);
    asm.emit_op_name(Opcode::StoreGlobal, name);
}

#[test]
fn break_restores_the_entry_depth_and_jumps_to_the_break_target() {
    // two values below the loop block, three pushed inside: break must
    // truncate back to exactly two and transfer to the loop's handler
    let mut asm = module_asm();
    asm.load_const(Value::Int(10));
    asm.load_const(Value::Int(20));
    let end = asm.new_block();
    asm.emit_jump(Opcode::SetupLoop, end);
    asm.use_next_block();
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(2));
    asm.load_const(Value::Int(3));
    asm.emit_op(Opcode::BreakLoop);
    asm.use_next_block_with(end);
    asm.emit_op_arg(Opcode::BuildTuple, 2);
    asm.emit_op(Opcode::ReturnValue);
    let result = run(asm.assemble().unwrap()).unwrap();
    assert_eq!(result, Value::tuple(vec![Value::Int(10), Value::Int(20)]));
}

#[test]
fn continue_re_establishes_the_loop_and_preserves_the_iterator() {
    // sum the even numbers of range(6), skipping odds via continue; the
    // iterator lives below the loop block so continue-truncation keeps it
    let globals = globals_with(&[("acc", Value::Int(0))]);
    let mut asm = module_asm();
    asm.emit_op_name(Opcode::LoadGlobal, "range");
    asm.load_const(Value::Int(6));
    asm.emit_op_arg(Opcode::CallFunction, 1);
    asm.emit_op(Opcode::GetIter);
    let end = asm.new_block();
    let exit = asm.new_block();
    let skip = asm.new_block();
    asm.emit_jump(Opcode::SetupLoop, end);
    let head = asm.use_next_block();
    asm.emit_jump(Opcode::ForIter, exit);
    asm.emit_op_name(Opcode::StoreGlobal, "i");
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.load_const(Value::Int(2));
    asm.emit_op(Opcode::BinaryModulo);
    asm.emit_jump(Opcode::JumpIfTrue, skip);
    asm.emit_op_name(Opcode::LoadGlobal, "acc");
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.emit_op(Opcode::BinaryAdd);
    asm.emit_op_name(Opcode::StoreGlobal, "acc");
    asm.emit_jump(Opcode::JumpAbsolute, head);
    asm.use_next_block_with(skip);
    asm.emit_jump(Opcode::ContinueLoop, head);
    asm.use_next_block_with(exit);
    asm.emit_op(Opcode::PopBlock);
    asm.use_next_block_with(end);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op_name(Opcode::LoadGlobal, "acc");
    asm.emit_op(Opcode::ReturnValue);
    let result = run_in(asm.assemble().unwrap(), &globals).unwrap();
    assert_eq!(result, Value::Int(0 + 2 + 4));
}

#[test]
fn except_catches_a_matching_exception() {
    // try: 1 / 0 except ArithmeticError: "caught" - the subclass matches
    let mut asm = module_asm();
    let handler = asm.new_block();
    let end = asm.new_block();
    let no_match = asm.new_block();
    asm.emit_jump(Opcode::SetupExcept, handler);
    asm.use_next_block();
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(0));
    asm.emit_op(Opcode::BinaryDivide);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopBlock);
    asm.load_const(Value::Str("not caught".to_owned()));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(handler);
    // handler entry: [token, value, type], type on top
    asm.emit_op(Opcode::DupTop);
    asm.emit_op_name(Opcode::LoadGlobal, "ArithmeticError");
    asm.emit_op_arg(Opcode::CompareOp, CompareArg::ExcMatch as u32);
    asm.emit_jump(Opcode::JumpIfFalse, no_match);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.load_const(Value::Str("caught".to_owned()));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(no_match);
    asm.emit_op(Opcode::EndFinally);
    asm.use_next_block_with(end);
    asm.load_const(Value::None);
    asm.emit_op(Opcode::ReturnValue);
    let result = run(asm.assemble().unwrap()).unwrap();
    assert_eq!(result, Value::Str("caught".to_owned()));
}

#[test]
fn except_re_raises_a_non_matching_exception() {
    // try: raise KeyError except TypeError: ... - the KeyError must come
    // out of the frame unchanged, re-raised by the handler's EndFinally
    let mut asm = module_asm();
    let handler = asm.new_block();
    let no_match = asm.new_block();
    asm.emit_jump(Opcode::SetupExcept, handler);
    asm.use_next_block();
    asm.emit_op_name(Opcode::LoadGlobal, "KeyError");
    asm.emit_op_arg(Opcode::RaiseVarargs, 1);
    asm.use_next_block_with(handler);
    asm.emit_op(Opcode::DupTop);
    asm.emit_op_name(Opcode::LoadGlobal, "TypeError");
    asm.emit_op_arg(Opcode::CompareOp, CompareArg::ExcMatch as u32);
    asm.emit_jump(Opcode::JumpIfFalse, no_match);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.load_const(Value::Str("wrong handler".to_owned()));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(no_match);
    asm.emit_op(Opcode::EndFinally);
    let err = run(asm.assemble().unwrap()).unwrap_err();
    assert!(matches!(err, RunError::Exc(ref exc) if exc.kind == ExcKind::KeyError), "got {err:?}");
}

#[test]
fn bare_raise_re_raises_the_active_exception() {
    // except ZeroDivisionError: raise - the original exception propagates
    let mut asm = module_asm();
    let handler = asm.new_block();
    asm.emit_jump(Opcode::SetupExcept, handler);
    asm.use_next_block();
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(0));
    asm.emit_op(Opcode::BinaryModulo);
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(handler);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op_arg(Opcode::RaiseVarargs, 0);
    let err = run(asm.assemble().unwrap()).unwrap_err();
    assert!(
        matches!(err, RunError::Exc(ref exc) if exc.kind == ExcKind::ZeroDivisionError),
        "got {err:?}"
    );
}

// --- finally runs exactly once for every exit path ---

/// try-body emitter -> assembled module with `counter` incremented in the
/// finally handler. The body block must end control flow itself (return,
/// raise) or fall through normally.
fn finally_module(body: impl FnOnce(&mut CodeAssembler), normal_fallthrough: bool) -> coil::Code {
    let mut asm = module_asm();
    let finally = asm.new_block();
    asm.emit_jump(Opcode::SetupFinally, finally);
    asm.use_next_block();
    body(&mut asm);
    if normal_fallthrough {
        asm.emit_op(Opcode::PopBlock);
        asm.load_const(Value::None);
    }
    asm.use_next_block_with(finally);
    emit_increment(&mut asm, "counter");
    asm.emit_op(Opcode::EndFinally);
    asm.load_const(Value::Str("fell through".to_owned()));
    asm.emit_op(Opcode::ReturnValue);
    asm.assemble().unwrap()
}

#[test]
fn finally_runs_once_on_normal_completion() {
    let globals = globals_with(&[("counter", Value::Int(0))]);
    let code = finally_module(
        |asm| {
            asm.load_const(Value::Int(7));
            asm.emit_op_name(Opcode::StoreGlobal, "x");
        },
        true,
    );
    let result = run_in(code, &globals).unwrap();
    assert_eq!(result, Value::Str("fell through".to_owned()));
    assert_eq!(global(&globals, "counter"), Some(Value::Int(1)));
    assert_eq!(global(&globals, "x"), Some(Value::Int(7)));
}

#[test]
fn finally_runs_once_on_return() {
    let globals = globals_with(&[("counter", Value::Int(0))]);
    let code = finally_module(
        |asm| {
            asm.load_const(Value::Int(42));
            asm.emit_op(Opcode::ReturnValue);
        },
        false,
    );
    let result = run_in(code, &globals).unwrap();
    // EndFinally resumed the parked Return, not the fallthrough path
    assert_eq!(result, Value::Int(42));
    assert_eq!(global(&globals, "counter"), Some(Value::Int(1)));
}

#[test]
fn finally_runs_once_on_raise() {
    let globals = globals_with(&[("counter", Value::Int(0))]);
    let code = finally_module(
        |asm| {
            asm.emit_op_name(Opcode::LoadGlobal, "ValueError");
            asm.emit_op_arg(Opcode::RaiseVarargs, 1);
        },
        false,
    );
    let err = run_in(code, &globals).unwrap_err();
    assert!(matches!(err, RunError::Exc(exc) if exc.kind == ExcKind::ValueError));
    assert_eq!(global(&globals, "counter"), Some(Value::Int(1)));
}

#[test]
fn finally_runs_once_on_break_and_the_loop_still_exits() {
    let globals = globals_with(&[("counter", Value::Int(0))]);
    let mut asm = module_asm();
    let end = asm.new_block();
    let finally = asm.new_block();
    asm.emit_jump(Opcode::SetupLoop, end);
    asm.use_next_block();
    asm.emit_jump(Opcode::SetupFinally, finally);
    asm.use_next_block();
    asm.emit_op(Opcode::BreakLoop);
    asm.use_next_block_with(finally);
    emit_increment(&mut asm, "counter");
    asm.emit_op(Opcode::EndFinally);
    asm.use_next_block_with(end);
    asm.emit_op_name(Opcode::LoadGlobal, "counter");
    asm.emit_op(Opcode::ReturnValue);
    let result = run_in(asm.assemble().unwrap(), &globals).unwrap();
    assert_eq!(result, Value::Int(1));
    assert_eq!(global(&globals, "counter"), Some(Value::Int(1)));
}

#[test]
fn nested_finally_handlers_run_inside_out() {
    let globals = globals_with(&[("order", Value::Str(String::new()))]);
    let append = |asm: &mut CodeAssembler, piece: &str| {
        asm.emit_op_name(Opcode::LoadGlobal, "order");
        asm.load_const(Value::Str(piece.to_owned()));
        asm.emit_op(Opcode::BinaryAdd);
        asm.emit_op_name(Opcode::StoreGlobal, "order");
    };
    let mut asm = module_asm();
    let outer = asm.new_block();
    let inner = asm.new_block();
    asm.emit_jump(Opcode::SetupFinally, outer);
    asm.use_next_block();
    asm.emit_jump(Opcode::SetupFinally, inner);
    asm.use_next_block();
    asm.load_const(Value::Int(1));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(inner);
    append(&mut asm, "inner,");
    asm.emit_op(Opcode::EndFinally);
    asm.use_next_block_with(outer);
    append(&mut asm, "outer");
    asm.emit_op(Opcode::EndFinally);
    let result = run_in(asm.assemble().unwrap(), &globals).unwrap();
    assert_eq!(result, Value::Int(1));
    assert_eq!(global(&globals, "order"), Some(Value::Str("inner,outer".to_owned())));
}

#[test]
fn a_raising_finally_replaces_the_in_flight_reason() {
    // try: return 1 finally: raise ValueError - the ValueError wins
    let mut asm = module_asm();
    let finally = asm.new_block();
    asm.emit_jump(Opcode::SetupFinally, finally);
    asm.use_next_block();
    asm.load_const(Value::Int(1));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(finally);
    asm.emit_op_name(Opcode::LoadGlobal, "ValueError");
    asm.emit_op_arg(Opcode::RaiseVarargs, 1);
    let err = run(asm.assemble().unwrap()).unwrap_err();
    assert!(matches!(err, RunError::Exc(exc) if exc.kind == ExcKind::ValueError));
}

// --- corruption ---

#[test]
fn break_outside_any_loop_is_bytecode_corruption() {
    let mut asm = module_asm();
    asm.emit_op(Opcode::BreakLoop);
    let err = run(asm.assemble().unwrap()).unwrap_err();
    assert!(matches!(err, RunError::Corruption(_)), "got {err:?}");
}

#[test]
fn unknown_opcode_bytes_are_bytecode_corruption() {
    let mut asm = module_asm();
    asm.load_const(Value::None);
    asm.emit_op(Opcode::ReturnValue);
    let mut code = asm.assemble().unwrap();
    code.bytecode[0] = 0xFE;
    let err = run(code).unwrap_err();
    assert!(matches!(err, RunError::Corruption(_)), "got {err:?}");
}

#[test]
fn truncated_bytecode_is_bytecode_corruption() {
    let mut asm = module_asm();
    asm.load_const(Value::None);
    asm.emit_op(Opcode::ReturnValue);
    let mut code = asm.assemble().unwrap();
    code.bytecode.truncate(1);
    let err = run(code).unwrap_err();
    assert!(matches!(err, RunError::Corruption(_)), "got {err:?}");
}
