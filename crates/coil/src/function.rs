//! Interpreted function objects and argument binding.

use std::rc::Rc;

use crate::{
    bytecode::{Code, CodeFlags},
    error::{ExcKind, RunError, RunResult},
    space::Args,
    value::{CellRef, Dict, Namespace, Value},
};

/// A function created by `MakeFunction`/`MakeClosure`.
///
/// Carries everything a call needs: the code object, the globals of the
/// defining module, default values for trailing parameters, and the cells
/// captured from enclosing scopes (matched positionally against the code's
/// free-variable table).
#[derive(Debug)]
pub struct FunctionObj {
    pub name: String,
    pub code: Rc<Code>,
    pub globals: Namespace,
    pub defaults: Vec<Value>,
    pub closure: Vec<CellRef>,
}

/// Binds call arguments into a fresh fast-locals array.
///
/// Layout: `[params..., *args slot, **kwargs slot, plain locals...]`, with
/// the star slots present only when the corresponding flag is set. Every
/// arity or keyword mismatch is a `TypeError` carrying the function name.
pub fn bind_args(func: &FunctionObj, args: Args) -> RunResult<Vec<Option<Value>>> {
    let code = &func.code;
    let arg_count = code.arg_count as usize;
    let has_varargs = code.flags.contains(CodeFlags::VARARGS);
    let has_varkw = code.flags.contains(CodeFlags::VARKEYWORDS);
    let mut locals: Vec<Option<Value>> = vec![None; code.local_count as usize];

    let given = args.positional.len();
    let mut extra_positional = Vec::new();
    for (index, value) in args.positional.into_iter().enumerate() {
        if index < arg_count {
            locals[index] = Some(value);
        } else if has_varargs {
            extra_positional.push(value);
        } else {
            return Err(arity_error(func, given));
        }
    }

    let mut extra_keywords = Dict::new();
    for (name, value) in args.keywords {
        match code.local_names[..arg_count].iter().position(|param| *param == name) {
            Some(slot) => {
                if locals[slot].is_some() {
                    return Err(RunError::exc(
                        ExcKind::TypeError,
                        format!("{}() got multiple values for argument '{name}'", func.name),
                    ));
                }
                locals[slot] = Some(value);
            }
            None if has_varkw => extra_keywords.insert(Value::Str(name), value),
            None => {
                return Err(RunError::exc(
                    ExcKind::TypeError,
                    format!("{}() got an unexpected keyword argument '{name}'", func.name),
                ));
            }
        }
    }

    let default_start = arg_count - func.defaults.len().min(arg_count);
    for (offset, default) in func.defaults.iter().enumerate() {
        let slot = default_start + offset;
        if locals[slot].is_none() {
            locals[slot] = Some(default.clone());
        }
    }
    if locals[..arg_count].iter().any(Option::is_none) {
        return Err(arity_error(func, given));
    }

    let mut star_slot = arg_count;
    if has_varargs {
        locals[star_slot] = Some(Value::tuple(extra_positional));
        star_slot += 1;
    }
    if has_varkw {
        locals[star_slot] = Some(Value::Dict(Rc::new(std::cell::RefCell::new(extra_keywords))));
    }
    Ok(locals)
}

fn arity_error(func: &FunctionObj, given: usize) -> RunError {
    let arg_count = func.code.arg_count as usize;
    let defaults = func.defaults.len();
    let expectation = if defaults == 0 {
        format!("exactly {arg_count}")
    } else {
        format!("from {} to {arg_count}", arg_count - defaults.min(arg_count))
    };
    RunError::exc(
        ExcKind::TypeError,
        format!("{}() takes {expectation} arguments ({given} given)", func.name),
    )
}
