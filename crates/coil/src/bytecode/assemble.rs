//! Control-flow-graph construction and bytecode assembly.
//!
//! A front end drives the assembler with emit calls; blocks hold
//! instructions with symbolic jump targets until [`CodeAssembler::assemble`]
//! linearizes the graph, resolves targets to byte offsets (widening
//! operands at a fixed point), computes the maximum stack depth, and packs
//! the line-number table.

use indexmap::IndexMap;

use super::{
    code::{Code, CodeFlags, LineTableBuilder},
    op::Opcode,
};
use crate::{
    error::AssembleError,
    scope::{ScopeInfo, StorageClass, mangle},
    value::{ConstKey, Value},
};

/// Largest operand encodable with the one-byte widening prefix.
const MAX_OPERAND: u32 = 0xFFFF;

/// Index of a basic block in the assembler's arena.
///
/// Blocks never outlive the assembler that created them, so an index is a
/// full reference; traversals key their visited sets by it instead of
/// scribbling marks on shared block objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(usize);

/// Symbolic jump edge, resolved during assembly.
#[derive(Debug, Clone, Copy)]
struct JumpSpec {
    target: BlockId,
    absolute: bool,
}

/// One emitted instruction.
#[derive(Debug)]
struct Instruction {
    opcode: Opcode,
    arg: u32,
    line: u32,
    jump: Option<JumpSpec>,
}

impl Instruction {
    /// Encoded size in bytes, given the current operand value.
    fn size(&self) -> usize {
        if !self.opcode.has_arg() {
            1
        } else if self.arg > 0xFF {
            4
        } else {
            2
        }
    }
}

/// A basic block: straight-line instructions plus an optional fallthrough
/// successor. Jump successors live on the individual instructions.
#[derive(Debug, Default)]
struct Block {
    instructions: Vec<Instruction>,
    next_block: Option<BlockId>,
    have_return: bool,
}

/// Which interning table [`CodeAssembler::add_name`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Global/name/attribute opcodes.
    Global,
    /// Fast-local slots.
    Local,
    /// The shared deref index space (cell variables before free variables).
    Deref,
}

/// Builds one [`Code`] artifact from a stream of emit calls.
///
/// The local, cell, and free tables are seeded from the external scope
/// resolver's [`ScopeInfo`]; the assembler performs no scope analysis of
/// its own. Errors raised mid-emission (unsupported constants, unknown
/// deref names) are parked and surfaced by `assemble()` so the emit API
/// stays infallible.
#[derive(Debug)]
pub struct CodeAssembler {
    name: String,
    filename: String,
    first_line: u32,
    line: u32,
    arg_count: u32,
    flags: CodeFlags,
    class_name: Option<String>,

    blocks: Vec<Block>,
    entry: BlockId,
    current: BlockId,

    global_names: IndexMap<String, u32>,
    local_names: IndexMap<String, u32>,
    cell_names: Vec<String>,
    free_names: Vec<String>,
    consts: IndexMap<ConstKey, Value>,

    /// Whether the implicit final return loads `None` first.
    pub add_none_return: bool,
    error: Option<AssembleError>,
}

impl CodeAssembler {
    /// Creates an assembler for one code object.
    #[must_use]
    pub fn new(name: &str, filename: &str, first_line: u32, scope: &ScopeInfo) -> Self {
        let mut local_names = IndexMap::new();
        for param in &scope.param_names {
            let slot = local_names.len() as u32;
            local_names.entry(param.clone()).or_insert(slot);
        }
        for (symbol, class) in &scope.symbols {
            if *class == StorageClass::Local {
                let slot = local_names.len() as u32;
                local_names.entry(symbol.clone()).or_insert(slot);
            }
        }
        let cell_names: Vec<String> = scope
            .symbols
            .iter()
            .filter(|(_, class)| **class == StorageClass::Cell)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        let mut arg_count = scope.param_names.len() as u32;
        if scope.flags.contains(CodeFlags::VARARGS) {
            arg_count -= 1;
        }
        if scope.flags.contains(CodeFlags::VARKEYWORDS) {
            arg_count -= 1;
        }

        let blocks = vec![Block::default()];
        let entry = BlockId(0);

        Self {
            name: name.to_owned(),
            filename: filename.to_owned(),
            first_line,
            line: first_line,
            arg_count,
            flags: scope.flags,
            class_name: scope.class_name.clone(),
            blocks,
            entry,
            current: entry,
            global_names: IndexMap::new(),
            local_names,
            cell_names,
            free_names: scope.free_names.clone(),
            consts: IndexMap::new(),
            add_none_return: true,
            error: None,
        }
    }

    /// Creates a fresh, unattached block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block::default());
        id
    }

    /// Makes `block` the current emission target without linking it.
    ///
    /// An unlinked block's position in the final layout follows jump-edge
    /// discovery order, so only blocks whose predecessors all end in
    /// unconditional control transfers may be left unlinked; a block that
    /// must be entered by fallthrough has to be chained with
    /// [`CodeAssembler::use_next_block_with`].
    pub fn use_block(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Links a fresh block as the current block's fallthrough successor and
    /// switches emission to it.
    pub fn use_next_block(&mut self) -> BlockId {
        let block = self.new_block();
        self.use_next_block_with(block);
        block
    }

    /// Links an existing block as the fallthrough successor and switches
    /// emission to it (used when the block is already a jump target).
    pub fn use_next_block_with(&mut self, block: BlockId) {
        self.blocks[self.current.0].next_block = Some(block);
        self.use_block(block);
    }

    /// Sets the source line tagged onto subsequently emitted instructions.
    pub fn update_position(&mut self, line: u32) {
        self.line = line;
    }

    /// Emits an operand-less opcode.
    pub fn emit_op(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "{op} requires an operand");
        if op == Opcode::ReturnValue {
            self.blocks[self.current.0].have_return = true;
        }
        self.push_instr(op, 0, None);
    }

    /// Emits an opcode with an operand.
    pub fn emit_op_arg(&mut self, op: Opcode, arg: u32) {
        debug_assert!(op.has_arg(), "{op} takes no operand");
        self.push_instr(op, arg, None);
    }

    /// Emits a name-indexed opcode, interning (and mangling) the name in
    /// the table implied by the opcode.
    pub fn emit_op_name(&mut self, op: Opcode, name: &str) {
        let kind = match op {
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => NameKind::Local,
            Opcode::LoadDeref | Opcode::StoreDeref | Opcode::LoadClosure => NameKind::Deref,
            _ => NameKind::Global,
        };
        let index = self.add_name(kind, name);
        self.emit_op_arg(op, index);
    }

    /// Emits a jump to `target`; the operand is resolved during assembly.
    /// Absoluteness is a property of the opcode.
    pub fn emit_jump(&mut self, op: Opcode, target: BlockId) {
        debug_assert!(op.has_arg(), "{op} cannot carry a jump target");
        self.push_instr(
            op,
            0,
            Some(JumpSpec {
                target,
                absolute: op.is_absolute_jump(),
            }),
        );
    }

    /// Interns `name` into the table selected by `kind` and returns its
    /// index, applying class-private mangling first.
    ///
    /// Deref names are fixed by the scope resolver; a name missing from
    /// both the cell and free tables is an internal error surfaced by
    /// `assemble()`.
    pub fn add_name(&mut self, kind: NameKind, name: &str) -> u32 {
        let mangled = match &self.class_name {
            Some(class_name) => mangle(name, class_name),
            None => std::borrow::Cow::Borrowed(name),
        };
        match kind {
            NameKind::Global => intern(&mut self.global_names, &mangled),
            NameKind::Local => intern(&mut self.local_names, &mangled),
            NameKind::Deref => {
                if let Some(index) = self.cell_names.iter().position(|n| **n == *mangled) {
                    index as u32
                } else if let Some(index) = self.free_names.iter().position(|n| **n == *mangled) {
                    (self.cell_names.len() + index) as u32
                } else {
                    self.set_error(AssembleError::Internal(format!(
                        "deref name '{mangled}' is neither cell nor free in '{}'",
                        self.name
                    )));
                    0
                }
            }
        }
    }

    /// Interns a constant, deduplicated by (runtime type, value), and
    /// returns its pool index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        let Some(key) = ConstKey::from_value(&value) else {
            self.set_error(AssembleError::Internal(format!(
                "value of type '{}' cannot be a constant",
                value.type_name()
            )));
            return 0;
        };
        match self.consts.get_index_of(&key) {
            Some(index) => index as u32,
            None => {
                self.consts.insert(key, value);
                (self.consts.len() - 1) as u32
            }
        }
    }

    /// Emits `LoadConst` for `value`.
    pub fn load_const(&mut self, value: Value) {
        let index = self.add_const(value);
        self.emit_op_arg(Opcode::LoadConst, index);
    }

    /// Assembles the accumulated blocks into an immutable [`Code`].
    pub fn assemble(mut self) -> Result<Code, AssembleError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.blocks[self.current.0].have_return {
            self.use_next_block();
            if self.add_none_return {
                self.load_const(Value::None);
            }
            self.emit_op(Opcode::ReturnValue);
        }
        self.check_closure_constants()?;
        let order = self.post_order();
        self.resolve_jump_targets(&order)?;
        let stack_depth = self.max_stack_depth(&order);
        let (bytecode, line_table) = self.encode(&order)?;

        Ok(Code {
            name: self.name,
            arg_count: self.arg_count,
            local_count: self.local_names.len() as u32,
            stack_depth,
            flags: self.flags,
            bytecode,
            constants: self.consts.into_values().collect(),
            global_names: self.global_names.into_keys().collect(),
            local_names: self.local_names.into_keys().collect(),
            cell_names: self.cell_names,
            free_names: self.free_names,
            filename: self.filename,
            first_line: self.first_line,
            line_table,
        })
    }

    fn push_instr(&mut self, opcode: Opcode, arg: u32, jump: Option<JumpSpec>) {
        self.blocks[self.current.0].instructions.push(Instruction {
            opcode,
            arg,
            line: self.line,
            jump,
        });
    }

    fn set_error(&mut self, error: AssembleError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Every `MakeClosure` must be immediately preceded by the `LoadConst`
    /// of the nested code object it wraps; anything else is a bug in the
    /// component driving emission.
    fn check_closure_constants(&self) -> Result<(), AssembleError> {
        let consts = &self.consts;
        for block in &self.blocks {
            for (index, instr) in block.instructions.iter().enumerate() {
                if instr.opcode != Opcode::MakeClosure {
                    continue;
                }
                let preceded_by_code = index
                    .checked_sub(1)
                    .and_then(|prev| block.instructions.get(prev))
                    .is_some_and(|prev| {
                        prev.opcode == Opcode::LoadConst
                            && matches!(consts.get_index(prev.arg as usize), Some((_, Value::Code(_))))
                    });
                if !preceded_by_code {
                    return Err(AssembleError::Internal(format!(
                        "MakeClosure in '{}' not preceded by a code constant",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Linearizes the graph: post-order from the entry block, fallthrough
    /// successor first, then jump successors, reversed - so a block tends
    /// to be laid out before the blocks it falls through to. A fresh
    /// visited set makes the traversal safe on back-edges.
    fn post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        self.post_order_visit(self.entry, &mut visited, &mut order);
        order.reverse();
        order
    }

    fn post_order_visit(&self, id: BlockId, visited: &mut [bool], order: &mut Vec<BlockId>) {
        if visited[id.0] {
            return;
        }
        visited[id.0] = true;
        let block = &self.blocks[id.0];
        if let Some(next) = block.next_block {
            self.post_order_visit(next, visited, order);
        }
        for instr in &block.instructions {
            if let Some(jump) = &instr.jump {
                self.post_order_visit(jump.target, visited, order);
            }
        }
        order.push(id);
    }

    /// Assigns byte offsets and resolves jump operands to a fixed point.
    ///
    /// Operand width depends on the operand value, and offsets depend on
    /// instruction widths, so the two are mutually dependent: iterate until
    /// the number of widened jumps stabilizes.
    fn resolve_jump_targets(&mut self, order: &[BlockId]) -> Result<(), AssembleError> {
        let mut offsets = vec![0usize; self.blocks.len()];
        let mut last_widened: Option<usize> = None;
        loop {
            let mut offset = 0usize;
            for &id in order {
                offsets[id.0] = offset;
                offset += self.blocks[id.0].instructions.iter().map(Instruction::size).sum::<usize>();
            }
            let mut widened = 0usize;
            for &id in order {
                let mut here = offsets[id.0];
                // split the borrow: targets are read from `offsets`, args
                // are written into the block
                for index in 0..self.blocks[id.0].instructions.len() {
                    here += self.blocks[id.0].instructions[index].size();
                    let Some(jump) = self.blocks[id.0].instructions[index].jump else {
                        continue;
                    };
                    let target = offsets[jump.target.0];
                    let arg = if jump.absolute {
                        target
                    } else {
                        target.checked_sub(here).ok_or_else(|| {
                            AssembleError::Internal(format!("backward relative jump in '{}'", self.name))
                        })?
                    };
                    self.blocks[id.0].instructions[index].arg = arg as u32;
                    if arg > 0xFF {
                        widened += 1;
                    }
                }
            }
            if last_widened == Some(widened) {
                return Ok(());
            }
            last_widened = Some(widened);
        }
    }

    /// Maximum stack depth over all paths from the entry block.
    ///
    /// A recursive walk applying static stack effects; a block is revisited
    /// only when reached at a strictly greater depth than before, which
    /// both terminates on loop back-edges and keeps the result a safe
    /// over-approximation.
    fn max_stack_depth(&self, order: &[BlockId]) -> u32 {
        let mut on_path = vec![false; self.blocks.len()];
        let mut entry_depth = vec![i32::MIN; self.blocks.len()];
        if order.is_empty() {
            return 0;
        }
        let max = self.depth_walk(self.entry, 0, 0, &mut on_path, &mut entry_depth);
        max.max(0) as u32
    }

    fn depth_walk(&self, id: BlockId, depth: i32, max_depth: i32, on_path: &mut [bool], entry_depth: &mut [i32]) -> i32 {
        if on_path[id.0] || entry_depth[id.0] >= depth {
            return max_depth;
        }
        on_path[id.0] = true;
        entry_depth[id.0] = depth;
        let mut depth = depth;
        let mut max_depth = max_depth;
        let block = &self.blocks[id.0];
        for instr in &block.instructions {
            depth += instr.opcode.stack_effect(instr.arg);
            if depth > max_depth {
                max_depth = depth;
            }
            if let Some(jump) = &instr.jump {
                max_depth = self.depth_walk(jump.target, depth, max_depth, on_path, entry_depth);
                if matches!(instr.opcode, Opcode::JumpForward | Opcode::JumpAbsolute) {
                    break;
                }
            }
        }
        if let Some(next) = block.next_block {
            max_depth = self.depth_walk(next, depth, max_depth, on_path, entry_depth);
        }
        on_path[id.0] = false;
        max_depth
    }

    /// Final byte emission plus the line-number table.
    fn encode(&self, order: &[BlockId]) -> Result<(Vec<u8>, Vec<u8>), AssembleError> {
        let mut bytecode = Vec::new();
        let mut lines = LineTableBuilder::new(self.first_line);
        for &id in order {
            for instr in &self.blocks[id.0].instructions {
                lines.note_line(bytecode.len(), instr.line);
                if instr.opcode.has_arg() {
                    if instr.arg > MAX_OPERAND {
                        return Err(AssembleError::CodeTooLarge {
                            code_name: self.name.clone(),
                            operand: u64::from(instr.arg),
                        });
                    }
                    if instr.arg > 0xFF {
                        bytecode.push(Opcode::ExtendedArg as u8);
                        bytecode.push((instr.arg >> 8) as u8);
                    }
                    bytecode.push(instr.opcode as u8);
                    bytecode.push((instr.arg & 0xFF) as u8);
                } else {
                    bytecode.push(instr.opcode as u8);
                }
            }
        }
        Ok((bytecode, lines.finish()))
    }
}

/// Interns into an insertion-ordered table; the index is the slot number.
fn intern(table: &mut IndexMap<String, u32>, name: &str) -> u32 {
    if let Some(index) = table.get_index_of(name) {
        return index as u32;
    }
    let index = table.len() as u32;
    table.insert(name.to_owned(), index);
    index
}
