//! The immutable Code artifact and its compact metadata tables.
//!
//! A `Code` is built once by the assembler, then shared read-only by every
//! frame that executes it. The full field set round-trips through a compact
//! postcard encoding (`dump`/`load`) for caching: a loaded artifact behaves
//! identically to the original.

use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use super::op::Opcode;
use crate::value::Value;

/// Code-object flag bits.
///
/// The bit values follow the classic CPython `CO_*` layout so dumps stay
/// recognizable in a hex editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlags(u16);

impl CodeFlags {
    /// Locals are fast slots; `LoadName` is not used inside this code.
    pub const OPTIMIZED: Self = Self(0x0001);
    /// The frame gets a fresh locals mapping (functions, not modules).
    pub const NEWLOCALS: Self = Self(0x0002);
    /// Trailing `*args` parameter.
    pub const VARARGS: Self = Self(0x0004);
    /// Trailing `**kwargs` parameter.
    pub const VARKEYWORDS: Self = Self(0x0008);
    /// Invoking this code produces a generator instead of running it.
    pub const GENERATOR: Self = Self(0x0020);

    /// The empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// An assembled, immutable code object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    /// Name of the function (or `<module>`).
    pub name: String,
    /// Number of declared parameters (excluding `*args`/`**kwargs` slots).
    pub arg_count: u32,
    /// Number of fast-local slots (parameters included).
    pub local_count: u32,
    /// Safe upper bound on the value-stack depth of any execution path.
    pub stack_depth: u32,
    /// Code-object flags.
    pub flags: CodeFlags,
    /// Raw instruction stream.
    pub bytecode: Vec<u8>,
    /// Constant pool, deduplicated by (type, value).
    pub constants: Vec<Value>,
    /// Names used by global/name/attribute opcodes.
    pub global_names: Vec<String>,
    /// Fast-local names, parameters first.
    pub local_names: Vec<String>,
    /// Cell-variable names (captured by nested functions).
    pub cell_names: Vec<String>,
    /// Free-variable names (received through the closure).
    pub free_names: Vec<String>,
    /// Source filename, for tracebacks.
    pub filename: String,
    /// First source line of this code object.
    pub first_line: u32,
    /// Byte-packed (offset delta, line delta) pairs.
    pub line_table: Vec<u8>,
}

impl Code {
    /// Whether invoking this code suspends into a generator.
    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Whether locals are fast slots rather than a named mapping.
    #[must_use]
    pub fn is_optimized(&self) -> bool {
        self.flags.contains(CodeFlags::OPTIMIZED)
    }

    /// Serializes the code object to a compact binary form.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a code object previously produced by [`Code::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Source line for the instruction at `offset`.
    ///
    /// Decodes the delta table: each (addr, line) byte pair advances the
    /// current position; the line recorded for an offset is the one in
    /// effect before the table position first moves past it.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut line = self.first_line;
        let mut addr = 0usize;
        for pair in self.line_table.chunks_exact(2) {
            addr += usize::from(pair[0]);
            if addr > offset {
                break;
            }
            line += u32::from(pair[1]);
        }
        line
    }

    /// Decodes the instruction stream.
    ///
    /// `ExtendedArg` prefixes are folded into the instruction they widen;
    /// the reported `offset` is the prefix's offset, so jump arithmetic
    /// sees the instruction exactly as the assembler laid it out.
    #[must_use]
    pub fn instructions(&self) -> InstructionIter<'_> {
        InstructionIter {
            bytecode: &self.bytecode,
            offset: 0,
        }
    }
}

/// One decoded instruction, as yielded by [`Code::instructions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstr {
    /// Byte offset of the instruction start (including any widening prefix).
    pub offset: usize,
    /// Byte offset just past the instruction; relative jumps are measured
    /// from here.
    pub next_offset: usize,
    pub opcode: Opcode,
    pub arg: u32,
}

impl DecodedInstr {
    /// Absolute byte offset a jump-shaped instruction transfers to.
    #[must_use]
    pub fn jump_target(&self) -> usize {
        if self.opcode.is_absolute_jump() {
            self.arg as usize
        } else {
            self.next_offset + self.arg as usize
        }
    }
}

/// Decoder over a code object's raw bytecode.
///
/// Yields `None` (stops) at the first malformed byte; the VM performs its
/// own checked fetches and reports corruption properly.
#[derive(Debug)]
pub struct InstructionIter<'c> {
    bytecode: &'c [u8],
    offset: usize,
}

impl Iterator for InstructionIter<'_> {
    type Item = DecodedInstr;

    fn next(&mut self) -> Option<DecodedInstr> {
        let start = self.offset;
        let mut byte = *self.bytecode.get(self.offset)?;
        self.offset += 1;
        let mut high = 0u32;
        let mut opcode = Opcode::from_repr(byte)?;
        if opcode == Opcode::ExtendedArg {
            high = u32::from(*self.bytecode.get(self.offset)?);
            self.offset += 1;
            byte = *self.bytecode.get(self.offset)?;
            self.offset += 1;
            opcode = Opcode::from_repr(byte)?;
        }
        let arg = if opcode.has_arg() {
            let low = u32::from(*self.bytecode.get(self.offset)?);
            self.offset += 1;
            (high << 8) | low
        } else {
            0
        };
        Some(DecodedInstr {
            offset: start,
            next_offset: self.offset,
            opcode,
            arg,
        })
    }
}

/// Builder for the byte-packed line-number table.
///
/// Both deltas are unsigned bytes; a delta over 255 in either dimension is
/// split into (255, 0) / (0, 255) steps. The format cannot represent a
/// source line decreasing as the byte offset increases, so such updates are
/// silently dropped - multi-line expressions can legitimately evaluate a
/// lexically-earlier sub-expression later in the bytecode.
#[derive(Debug)]
pub(crate) struct LineTableBuilder {
    current_line: u32,
    current_offset: usize,
    table: Vec<u8>,
}

impl LineTableBuilder {
    pub(crate) fn new(first_line: u32) -> Self {
        Self {
            current_line: first_line,
            current_offset: 0,
            table: Vec::new(),
        }
    }

    pub(crate) fn note_line(&mut self, offset: usize, line: u32) {
        let Some(mut line_delta) = line.checked_sub(self.current_line) else {
            return;
        };
        let mut addr_delta = offset - self.current_offset;
        if addr_delta == 0 && line_delta == 0 {
            return;
        }
        while addr_delta > 255 {
            self.table.push(255);
            self.table.push(0);
            addr_delta -= 255;
        }
        while line_delta > 255 {
            self.table.push(addr_delta as u8);
            self.table.push(255);
            line_delta -= 255;
            addr_delta = 0;
        }
        if addr_delta > 0 || line_delta > 0 {
            self.table.push(addr_delta as u8);
            self.table.push(line_delta as u8);
        }
        self.current_line = line;
        self.current_offset = offset;
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.table
    }
}
