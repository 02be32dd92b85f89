//! Assembler integration tests: jump resolution, widening, stack depth,
//! and the line-number table, verified by decoding and by execution.

mod common;

use std::rc::Rc;

use coil::{
    AssembleError, CodeAssembler, ExecutionContext, Opcode, PlainSpace, RecordingTracer, ScopeInfo, TraceEvent, Value,
};
use common::run;
use pretty_assertions::assert_eq;

fn module_asm() -> CodeAssembler {
    CodeAssembler::new("<module>", "test.py", 1, &ScopeInfo::module())
}

#[test]
fn conditional_jump_round_trips_and_executes() {
    let mut asm = module_asm();
    let else_block = asm.new_block();
    asm.load_const(Value::Bool(false));
    asm.emit_jump(Opcode::JumpIfFalse, else_block);
    asm.load_const(Value::Int(1));
    asm.emit_op(Opcode::ReturnValue);
    asm.use_next_block_with(else_block);
    asm.load_const(Value::Int(2));
    asm.emit_op(Opcode::ReturnValue);
    let code = asm.assemble().unwrap();

    // decoding the jump must land exactly on the else branch's LoadConst
    let instrs: Vec<_> = code.instructions().collect();
    let jump = instrs.iter().find(|i| i.opcode == Opcode::JumpIfFalse).unwrap();
    let target = instrs.iter().find(|i| i.offset == jump.jump_target()).unwrap();
    assert_eq!(target.opcode, Opcode::LoadConst);
    assert_eq!(code.constants[target.arg as usize], Value::Int(2));

    assert_eq!(run(code).unwrap(), Value::Int(2));
}

#[test]
fn backward_jumps_resolve_absolutely() {
    // a counting loop: the back-edge is an absolute jump to a block that is
    // laid out before the jump instruction
    let mut asm = module_asm();
    asm.load_const(Value::Int(0));
    asm.emit_op_name(Opcode::StoreGlobal, "i");
    let head = asm.use_next_block();
    let exit = asm.new_block();
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.load_const(Value::Int(5));
    asm.emit_op_arg(Opcode::CompareOp, coil::CompareArg::Ge as u32);
    asm.emit_jump(Opcode::JumpIfTrue, exit);
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.load_const(Value::Int(1));
    asm.emit_op(Opcode::BinaryAdd);
    asm.emit_op_name(Opcode::StoreGlobal, "i");
    asm.emit_jump(Opcode::JumpAbsolute, head);
    asm.use_next_block_with(exit);
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.emit_op(Opcode::ReturnValue);
    let code = asm.assemble().unwrap();

    let instrs: Vec<_> = code.instructions().collect();
    let back_edge = instrs.iter().find(|i| i.opcode == Opcode::JumpAbsolute).unwrap();
    // the absolute target must be at or before the jump itself
    assert!(back_edge.jump_target() < back_edge.offset);
    assert_eq!(run(code).unwrap(), Value::Int(5));
}

#[test]
fn oversized_forward_jump_gets_widened() {
    let mut asm = module_asm();
    let end = asm.new_block();
    asm.emit_jump(Opcode::JumpForward, end);
    asm.use_next_block();
    // 200 two-byte instructions of intervening code force the forward jump
    // operand past one byte, which needs a widening prefix, which itself
    // moves the target - the fixed-point iteration must settle
    for i in 0..200 {
        asm.load_const(Value::Int(i));
    }
    asm.use_next_block_with(end);
    asm.load_const(Value::Int(42));
    asm.emit_op(Opcode::ReturnValue);
    let code = asm.assemble().unwrap();

    assert!(code.bytecode.contains(&(Opcode::ExtendedArg as u8)));
    let instrs: Vec<_> = code.instructions().collect();
    let jump = instrs.iter().find(|i| i.opcode == Opcode::JumpForward).unwrap();
    assert!(jump.arg > 0xFF, "expected a widened operand, got {}", jump.arg);
    let target = instrs.iter().find(|i| i.offset == jump.jump_target()).unwrap();
    assert_eq!(code.constants[target.arg as usize], Value::Int(42));

    assert_eq!(run(code).unwrap(), Value::Int(42));
}

#[test]
fn jump_beyond_the_encodable_range_is_code_too_large() {
    let mut asm = module_asm();
    let end = asm.new_block();
    asm.emit_jump(Opcode::JumpForward, end);
    asm.use_next_block();
    // 33k instructions re-using one constant: ~66k bytes of intervening
    // code, past what even a widened operand can express
    for _ in 0..33_000 {
        asm.load_const(Value::Int(0));
    }
    asm.use_next_block_with(end);
    asm.emit_op(Opcode::PopTop);
    let err = asm.assemble().unwrap_err();
    assert!(matches!(err, AssembleError::CodeTooLarge { .. }), "got {err:?}");
}

#[test]
fn relative_jump_to_an_earlier_block_is_internal() {
    let mut asm = module_asm();
    let entry = asm.use_next_block();
    asm.emit_op(Opcode::Nop);
    asm.use_next_block();
    asm.emit_jump(Opcode::JumpForward, entry);
    let err = asm.assemble().unwrap_err();
    assert!(matches!(err, AssembleError::Internal(_)), "got {err:?}");
}

#[test]
fn stack_depth_bounds_every_observed_depth() {
    // branchy code with a loop back-edge: the computed depth must bound
    // everything the dispatch loop actually observes
    let mut asm = module_asm();
    asm.load_const(Value::Int(0));
    asm.emit_op_name(Opcode::StoreGlobal, "acc");
    asm.emit_op_name(Opcode::LoadGlobal, "range");
    asm.load_const(Value::Int(6));
    asm.emit_op_arg(Opcode::CallFunction, 1);
    asm.emit_op(Opcode::GetIter);
    let end = asm.new_block();
    let exit = asm.new_block();
    asm.emit_jump(Opcode::SetupLoop, end);
    let head = asm.use_next_block();
    asm.emit_jump(Opcode::ForIter, exit);
    asm.emit_op_name(Opcode::StoreGlobal, "i");
    asm.emit_op_name(Opcode::LoadGlobal, "acc");
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.emit_op_name(Opcode::LoadGlobal, "i");
    asm.emit_op(Opcode::BinaryMultiply);
    asm.emit_op(Opcode::BinaryAdd);
    asm.emit_op_name(Opcode::StoreGlobal, "acc");
    asm.emit_jump(Opcode::JumpAbsolute, head);
    asm.use_next_block_with(exit);
    asm.emit_op(Opcode::PopBlock);
    asm.use_next_block_with(end);
    asm.emit_op(Opcode::PopTop);
    asm.emit_op_name(Opcode::LoadGlobal, "acc");
    asm.emit_op(Opcode::ReturnValue);
    let code = asm.assemble().unwrap();

    let mut ctx = ExecutionContext::new(PlainSpace, RecordingTracer::new());
    let result = ctx.run_module(&Rc::new(code.clone())).unwrap();
    // 0 + 1 + 4 + 9 + 16 + 25
    assert_eq!(result, Value::Int(55));

    let max_seen = ctx
        .tracer
        .events
        .iter()
        .filter_map(|event| match event {
            TraceEvent::Instruction { stack_depth, .. } => Some(*stack_depth),
            _ => None,
        })
        .max()
        .unwrap();
    assert!(
        max_seen <= code.stack_depth as usize,
        "observed depth {max_seen} exceeds computed bound {}",
        code.stack_depth
    );
}

#[test]
fn line_table_tracks_emission_positions() {
    let mut asm = module_asm();
    asm.update_position(10);
    asm.load_const(Value::Int(1));
    asm.update_position(12);
    asm.load_const(Value::Int(2));
    asm.emit_op(Opcode::BinaryAdd);
    asm.update_position(15);
    asm.emit_op(Opcode::ReturnValue);
    let code = asm.assemble().unwrap();

    let instrs: Vec<_> = code.instructions().collect();
    assert_eq!(code.line_for_offset(instrs[0].offset), 10);
    assert_eq!(code.line_for_offset(instrs[1].offset), 12);
    assert_eq!(code.line_for_offset(instrs[2].offset), 12);
    assert_eq!(code.line_for_offset(instrs[3].offset), 15);
}

#[test]
fn uncaught_exception_reports_the_raising_line() {
    let mut asm = module_asm();
    asm.update_position(3);
    asm.load_const(Value::Int(1));
    asm.load_const(Value::Int(0));
    asm.emit_op(Opcode::BinaryDivide);
    asm.emit_op(Opcode::ReturnValue);
    let err = run(asm.assemble().unwrap()).unwrap_err();
    let coil::RunError::Exc(exc) = err else {
        panic!("expected an exception, got {err:?}");
    };
    assert_eq!(exc.kind, coil::ExcKind::ZeroDivisionError);
    assert_eq!(exc.line, Some(3));
    assert_eq!(exc.frames.len(), 1);
    assert_eq!(exc.frames[0].filename, "test.py");
    assert_eq!(exc.frames[0].code_name, "<module>");
    assert_eq!(exc.frames[0].line, 3);
}
