//! Call-site argument decoding and function/closure construction.

use std::rc::Rc;

use super::{ExecutionContext, Frame};
use crate::{
    bytecode::Opcode,
    error::{ExcKind, RunError, RunResult},
    function::FunctionObj,
    space::{Args, ObjectSpace},
    tracer::VmTracer,
    value::Value,
};

impl Frame {
    /// Decodes a `CallFunction`-family call site and invokes the callee.
    ///
    /// Stack layout, bottom to top: callee, positional arguments, keyword
    /// (name, value) pairs, then for the Var/Kw variants an extra iterable
    /// of positionals and/or a mapping of keywords (mapping topmost). The
    /// operand packs `positional | keyword << 8`.
    pub(super) fn op_call<S: ObjectSpace, Tr: VmTracer>(
        &mut self,
        ctx: &mut ExecutionContext<S, Tr>,
        opcode: Opcode,
        packed: u32,
    ) -> RunResult<()> {
        let positional_count = (packed & 0xFF) as usize;
        let keyword_count = (packed >> 8) as usize;
        let has_var_seq = matches!(opcode, Opcode::CallFunctionVar | Opcode::CallFunctionVarKw);
        let has_kw_map = matches!(opcode, Opcode::CallFunctionKw | Opcode::CallFunctionVarKw);

        let kw_map = if has_kw_map { Some(self.pop()?) } else { None };
        let var_seq = if has_var_seq { Some(self.pop()?) } else { None };

        let mut keywords = Vec::with_capacity(keyword_count);
        for _ in 0..keyword_count {
            let value = self.pop()?;
            match self.pop()? {
                Value::Str(name) => keywords.push((name, value)),
                other => {
                    return Err(RunError::corruption(format!(
                        "keyword name must be a string constant, found '{}'",
                        other.type_name()
                    )));
                }
            }
        }
        keywords.reverse();

        let mut positional = self.pop_many(positional_count)?;
        let callee = self.pop()?;

        if let Some(seq) = var_seq {
            positional.extend(ctx.iterate(seq)?);
        }
        if let Some(map) = kw_map {
            let Value::Dict(dict) = &map else {
                return Err(RunError::exc(
                    ExcKind::TypeError,
                    format!("argument after ** must be a mapping, not '{}'", map.type_name()),
                ));
            };
            for (key, value) in dict.borrow().iter() {
                let Value::Str(name) = key else {
                    return Err(RunError::exc(ExcKind::TypeError, "keywords must be strings"));
                };
                if keywords.iter().any(|(existing, _)| existing == name) {
                    return Err(RunError::exc(
                        ExcKind::TypeError,
                        format!("got multiple values for keyword argument '{name}'"),
                    ));
                }
                keywords.push((name.clone(), value.clone()));
            }
        }

        let result = ctx.call_value(&callee, Args { positional, keywords })?;
        self.push(result);
        Ok(())
    }

    /// `MakeFunction`/`MakeClosure`: wrap a code constant into a function.
    ///
    /// Stack layout, bottom to top: default values, then (for closures) the
    /// tuple of captured cells, then the code object.
    pub(super) fn op_make_function(&mut self, arg: u32, closure: bool) -> RunResult<()> {
        let code = match self.pop()? {
            Value::Code(code) => code,
            other => {
                return Err(RunError::corruption(format!(
                    "MakeFunction expects a code object, found '{}'",
                    other.type_name()
                )));
            }
        };
        let cells = if closure {
            match self.pop()? {
                Value::Tuple(items) => {
                    let mut cells = Vec::with_capacity(items.len());
                    for item in items.iter() {
                        match item {
                            Value::Cell(cell) => cells.push(cell.clone()),
                            other => {
                                return Err(RunError::corruption(format!(
                                    "closure tuple holds '{}' instead of a cell",
                                    other.type_name()
                                )));
                            }
                        }
                    }
                    cells
                }
                other => {
                    return Err(RunError::corruption(format!(
                        "MakeClosure expects a tuple of cells, found '{}'",
                        other.type_name()
                    )));
                }
            }
        } else {
            Vec::new()
        };
        if cells.len() != code.free_names.len() {
            return Err(RunError::internal(format!(
                "code '{}' expects {} closure cells, got {}",
                code.name,
                code.free_names.len(),
                cells.len()
            )));
        }
        let defaults = self.pop_many(arg as usize)?;
        let func = FunctionObj {
            name: code.name.clone(),
            code,
            globals: self.globals.clone(),
            defaults,
            closure: cells,
        };
        self.push(Value::Function(Rc::new(func)));
        Ok(())
    }
}
