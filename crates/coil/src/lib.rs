#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::must_use_candidate, reason = "builder-style APIs read better unannotated")]

mod bytecode;
mod error;
mod function;
mod generator;
mod scope;
mod space;
pub mod tracer;
mod value;
mod vm;

pub use crate::{
    bytecode::{BlockId, Code, CodeAssembler, CodeFlags, CompareArg, DecodedInstr, InstructionIter, NameKind, Opcode},
    error::{AssembleError, ExcKind, RunError, RunResult, TracebackFrame, VmException},
    function::FunctionObj,
    generator::{Advance, GeneratorIterator},
    scope::{ScopeInfo, StorageClass, mangle},
    space::{Args, BinaryOp, BuiltinFn, ObjectSpace, PlainSpace, UnaryOp},
    tracer::{CountingTracer, FuelTracer, NoopTracer, RecordingTracer, TraceEvent, VmTracer},
    value::{CellRef, Dict, Namespace, Value, ValueIter, new_namespace},
    vm::{
        BlockKind, DEFAULT_MAX_CALL_DEPTH, ExecutionContext, Frame, FrameBlock, FrameOutcome, UnwindReason,
        UnwindToken,
    },
};
