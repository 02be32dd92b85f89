//! Bytecode representation and assembly.
//!
//! # Module Structure
//!
//! - `op` - opcode definitions, operand encoding, stack-effect table
//! - `assemble` - basic blocks and the [`CodeAssembler`]
//! - `code` - the immutable [`Code`] artifact and its metadata tables

pub use assemble::{BlockId, CodeAssembler, NameKind};
pub use code::{Code, CodeFlags, DecodedInstr, InstructionIter};
pub use op::{CompareArg, HAVE_ARGUMENT, Opcode};

mod assemble;
mod code;
mod op;
