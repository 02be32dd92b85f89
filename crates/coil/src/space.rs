//! The object-space interface: every value operation the frame engine
//! needs, behind a trait.
//!
//! The dispatch loop treats each space method as an atomic, possibly-failing
//! primitive; a failure is an ordinary runtime exception that enters the
//! block-stack unwinding machinery. [`PlainSpace`] is the reference
//! implementation - a small dynamic object model (ints, floats, strings,
//! tuples, lists, dicts, `range`) sufficient to run real programs and the
//! test suite. Embeddings provide their own space for a richer model.

use std::{cell::RefCell, rc::Rc};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    bytecode::CompareArg,
    error::{ExcKind, RunError, RunResult},
    value::{Value, ValueIter},
};

/// Call arguments after stack decoding and `*args`/`**kwargs` expansion.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Positional arguments, left to right.
    pub positional: Vec<Value>,
    /// Keyword arguments, in call order.
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    /// Positional-only arguments.
    #[must_use]
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            keywords: Vec::new(),
        }
    }
}

/// Binary operators delegated to the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
}

/// Unary operators delegated to the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
}

/// Builtin callables provided by [`PlainSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum BuiltinFn {
    Range,
    Len,
    Abs,
    Repr,
}

/// The object model consumed by the frame engine.
///
/// Identity comparison (`is`), exception matching, iteration over
/// generators, and calls to interpreted functions are interpreter-level
/// concerns handled by the VM itself; everything else about values goes
/// through here.
pub trait ObjectSpace {
    /// Truth-testing.
    fn is_true(&self, value: &Value) -> RunResult<bool>;

    /// Applies a unary operator.
    fn unary(&self, op: UnaryOp, value: Value) -> RunResult<Value>;

    /// Applies a binary operator.
    fn binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value>;

    /// Rich comparison; returns a boolean value.
    ///
    /// Only called for value comparisons - `Is`/`IsNot`/`ExcMatch` never
    /// reach the space.
    fn compare(&self, op: CompareArg, lhs: &Value, rhs: &Value) -> RunResult<Value>;

    /// Attribute access.
    fn getattr(&self, obj: &Value, name: &str) -> RunResult<Value>;
    fn setattr(&self, obj: &Value, name: &str, value: Value) -> RunResult<()>;
    fn delattr(&self, obj: &Value, name: &str) -> RunResult<()>;

    /// Item access.
    fn getitem(&self, obj: &Value, key: &Value) -> RunResult<Value>;
    fn setitem(&self, obj: &Value, key: &Value, value: Value) -> RunResult<()>;
    fn delitem(&self, obj: &Value, key: &Value) -> RunResult<()>;

    /// Returns an iterator over `value`.
    fn iter(&self, value: Value) -> RunResult<Value>;

    /// Advances an iterator produced by [`ObjectSpace::iter`]; `None` means
    /// exhausted.
    fn iter_next(&self, iter: &Value) -> RunResult<Option<Value>>;

    /// Invokes a space-level callable (builtins). Interpreted functions and
    /// generators never reach here.
    fn call(&self, callee: &Value, args: Args) -> RunResult<Value>;

    /// Looks up a builtin name, as a fallback after the globals mapping.
    fn builtin(&self, name: &str) -> Option<Value>;

    /// Debug representation, used in error messages.
    fn repr(&self, value: &Value) -> String;
}

/// The reference object space.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSpace;

impl PlainSpace {
    fn type_error(message: String) -> RunError {
        RunError::exc(ExcKind::TypeError, message)
    }

    fn numeric_pair(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
        let as_f64 = |v: &Value| match v {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        };
        Some((as_f64(lhs)?, as_f64(rhs)?))
    }

    fn as_int(value: &Value) -> Option<i64> {
        match value {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn int_binary(op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
        let overflow = || RunError::exc(ExcKind::OverflowError, "integer result too large");
        let value = match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Div => {
                if b == 0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "division by zero"));
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            BinaryOp::FloorDiv => {
                if b == 0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "integer division by zero"));
                }
                a.div_euclid(b)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "integer modulo by zero"));
                }
                a.rem_euclid(b)
            }
            BinaryOp::Pow => {
                if b < 0 {
                    return Ok(Value::Float((a as f64).powi(b as i32)));
                }
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exp).ok_or_else(overflow)?
            }
            BinaryOp::Lshift => {
                let shift = u32::try_from(b).map_err(|_| Self::type_error("negative shift count".to_owned()))?;
                a.checked_shl(shift).ok_or_else(overflow)?
            }
            BinaryOp::Rshift => {
                let shift = u32::try_from(b).map_err(|_| Self::type_error("negative shift count".to_owned()))?;
                a >> shift.min(63)
            }
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
        };
        Ok(Value::Int(value))
    }

    fn float_binary(op: BinaryOp, a: f64, b: f64) -> RunResult<Value> {
        let value = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "float division by zero"));
                }
                a / b
            }
            BinaryOp::FloorDiv => {
                if b == 0.0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "float floor division by zero"));
                }
                (a / b).floor()
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    return Err(RunError::exc(ExcKind::ZeroDivisionError, "float modulo by zero"));
                }
                a.rem_euclid(b)
            }
            BinaryOp::Pow => a.powf(b),
            _ => {
                return Err(Self::type_error(format!("unsupported float operation '{op}'")));
            }
        };
        Ok(Value::Float(value))
    }

    /// Numeric equality across int/float/bool, value equality elsewhere.
    fn values_equal(lhs: &Value, rhs: &Value) -> bool {
        if let Some((a, b)) = Self::numeric_pair(lhs, rhs) {
            return a == b;
        }
        lhs == rhs
    }

    fn sequence_index(len: usize, key: &Value) -> RunResult<usize> {
        let index = Self::as_int(key)
            .ok_or_else(|| Self::type_error(format!("indices must be integers, not '{}'", key.type_name())))?;
        let adjusted = if index < 0 { index + len as i64 } else { index };
        usize::try_from(adjusted)
            .ok()
            .filter(|i| *i < len)
            .ok_or_else(|| RunError::exc(ExcKind::IndexError, "index out of range"))
    }

    fn contains(&self, haystack: &Value, needle: &Value) -> RunResult<bool> {
        match haystack {
            Value::Tuple(items) => Ok(items.iter().any(|item| Self::values_equal(item, needle))),
            Value::List(items) => Ok(items.borrow().iter().any(|item| Self::values_equal(item, needle))),
            Value::Dict(dict) => Ok(dict.borrow().get(needle).is_some()),
            Value::Str(s) => match needle {
                Value::Str(sub) => Ok(s.contains(sub.as_str())),
                _ => Err(Self::type_error(format!(
                    "'in <string>' requires string, not '{}'",
                    needle.type_name()
                ))),
            },
            _ => Err(Self::type_error(format!("'{}' is not a container", haystack.type_name()))),
        }
    }
}

impl ObjectSpace for PlainSpace {
    fn is_true(&self, value: &Value) -> RunResult<bool> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            _ => true,
        })
    }

    fn unary(&self, op: UnaryOp, value: Value) -> RunResult<Value> {
        match (&value, op) {
            (Value::Int(i), UnaryOp::Neg) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| RunError::exc(ExcKind::OverflowError, "integer result too large")),
            (Value::Int(_) | Value::Float(_), UnaryOp::Pos) => Ok(value),
            (Value::Int(i), UnaryOp::Invert) => Ok(Value::Int(!i)),
            (Value::Float(f), UnaryOp::Neg) => Ok(Value::Float(-f)),
            (Value::Bool(b), _) => self.unary(op, Value::Int(i64::from(*b))),
            _ => Err(Self::type_error(format!(
                "bad operand type for unary {op}: '{}'",
                value.type_name()
            ))),
        }
    }

    fn binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Self::int_binary(op, *a, *b),
            (Value::Bool(a), Value::Int(b)) => Self::int_binary(op, i64::from(*a), *b),
            (Value::Int(a), Value::Bool(b)) => Self::int_binary(op, *a, i64::from(*b)),
            (Value::Bool(a), Value::Bool(b)) => Self::int_binary(op, i64::from(*a), i64::from(*b)),
            (Value::Float(_) | Value::Int(_), Value::Float(_) | Value::Int(_)) => {
                let (a, b) = Self::numeric_pair(&lhs, &rhs).expect("numeric operands");
                Self::float_binary(op, a, b)
            }
            (Value::Str(a), Value::Str(b)) if op == BinaryOp::Add => Ok(Value::Str(format!("{a}{b}"))),
            (Value::Str(s), Value::Int(n)) if op == BinaryOp::Mul => {
                Ok(Value::Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            (Value::Tuple(a), Value::Tuple(b)) if op == BinaryOp::Add => {
                let mut items = a.as_ref().clone();
                items.extend(b.iter().cloned());
                Ok(Value::tuple(items))
            }
            (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            _ => Err(Self::type_error(format!(
                "unsupported operand type(s) for {op}: '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn compare(&self, op: CompareArg, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let result = match op {
            CompareArg::Eq => Self::values_equal(lhs, rhs),
            CompareArg::Ne => !Self::values_equal(lhs, rhs),
            CompareArg::In => self.contains(rhs, lhs)?,
            CompareArg::NotIn => !self.contains(rhs, lhs)?,
            CompareArg::Lt | CompareArg::Le | CompareArg::Gt | CompareArg::Ge => {
                let ordering = match (lhs, rhs) {
                    (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                    _ => {
                        let (a, b) = Self::numeric_pair(lhs, rhs).ok_or_else(|| {
                            Self::type_error(format!(
                                "'{op}' not supported between instances of '{}' and '{}'",
                                lhs.type_name(),
                                rhs.type_name()
                            ))
                        })?;
                        a.partial_cmp(&b)
                    }
                };
                match ordering {
                    Some(ordering) => match op {
                        CompareArg::Lt => ordering.is_lt(),
                        CompareArg::Le => ordering.is_le(),
                        CompareArg::Gt => ordering.is_gt(),
                        CompareArg::Ge => ordering.is_ge(),
                        _ => unreachable!(),
                    },
                    None => false,
                }
            }
            CompareArg::Is | CompareArg::IsNot | CompareArg::ExcMatch => {
                return Err(RunError::internal(format!("comparison '{op}' must not reach the space")));
            }
        };
        Ok(Value::Bool(result))
    }

    fn getattr(&self, obj: &Value, name: &str) -> RunResult<Value> {
        Err(RunError::exc(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", obj.type_name()),
        ))
    }

    fn setattr(&self, obj: &Value, name: &str, _value: Value) -> RunResult<()> {
        Err(RunError::exc(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", obj.type_name()),
        ))
    }

    fn delattr(&self, obj: &Value, name: &str) -> RunResult<()> {
        Err(RunError::exc(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", obj.type_name()),
        ))
    }

    fn getitem(&self, obj: &Value, key: &Value) -> RunResult<Value> {
        match obj {
            Value::Tuple(items) => {
                let index = Self::sequence_index(items.len(), key)?;
                Ok(items[index].clone())
            }
            Value::List(items) => {
                let items = items.borrow();
                let index = Self::sequence_index(items.len(), key)?;
                Ok(items[index].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let index = Self::sequence_index(chars.len(), key)?;
                Ok(Value::Str(chars[index].to_string()))
            }
            Value::Dict(dict) => dict
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| RunError::exc(ExcKind::KeyError, self.repr(key))),
            _ => Err(Self::type_error(format!(
                "'{}' object is not subscriptable",
                obj.type_name()
            ))),
        }
    }

    fn setitem(&self, obj: &Value, key: &Value, value: Value) -> RunResult<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let index = Self::sequence_index(items.len(), key)?;
                items[index] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                dict.borrow_mut().insert(key.clone(), value);
                Ok(())
            }
            _ => Err(Self::type_error(format!(
                "'{}' object does not support item assignment",
                obj.type_name()
            ))),
        }
    }

    fn delitem(&self, obj: &Value, key: &Value) -> RunResult<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let index = Self::sequence_index(items.len(), key)?;
                items.remove(index);
                Ok(())
            }
            Value::Dict(dict) => dict
                .borrow_mut()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| RunError::exc(ExcKind::KeyError, self.repr(key))),
            _ => Err(Self::type_error(format!(
                "'{}' object does not support item deletion",
                obj.type_name()
            ))),
        }
    }

    fn iter(&self, value: Value) -> RunResult<Value> {
        let iter = match &value {
            Value::Iter(_) | Value::Generator(_) => return Ok(value),
            Value::Tuple(items) => ValueIter::Seq {
                items: items.as_ref().clone(),
                index: 0,
            },
            Value::List(items) => ValueIter::Seq {
                items: items.borrow().clone(),
                index: 0,
            },
            Value::Str(s) => ValueIter::Seq {
                items: s.chars().map(|c| Value::Str(c.to_string())).collect(),
                index: 0,
            },
            Value::Dict(dict) => ValueIter::Seq {
                items: dict.borrow().iter().map(|(k, _)| k.clone()).collect(),
                index: 0,
            },
            _ => {
                return Err(Self::type_error(format!(
                    "'{}' object is not iterable",
                    value.type_name()
                )));
            }
        };
        Ok(Value::Iter(Rc::new(RefCell::new(iter))))
    }

    fn iter_next(&self, iter: &Value) -> RunResult<Option<Value>> {
        match iter {
            Value::Iter(state) => Ok(state.borrow_mut().advance()),
            _ => Err(Self::type_error(format!("'{}' object is not an iterator", iter.type_name()))),
        }
    }

    fn call(&self, callee: &Value, args: Args) -> RunResult<Value> {
        let Value::Builtin(builtin) = callee else {
            return Err(Self::type_error(format!(
                "'{}' object is not callable",
                callee.type_name()
            )));
        };
        if !args.keywords.is_empty() {
            return Err(Self::type_error(format!("{builtin}() takes no keyword arguments")));
        }
        let arity_error =
            |n: usize| Self::type_error(format!("{builtin}() takes wrong number of arguments ({n} given)"));
        match builtin {
            BuiltinFn::Range => {
                let ints: Vec<i64> = args
                    .positional
                    .iter()
                    .map(|arg| Self::as_int(arg).ok_or_else(|| Self::type_error("range() requires integers".to_owned())))
                    .collect::<RunResult<_>>()?;
                let (next, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] if *step != 0 => (*start, *stop, *step),
                    [_, _, _] => {
                        return Err(RunError::exc(ExcKind::ValueError, "range() arg 3 must not be zero"));
                    }
                    _ => return Err(arity_error(args.positional.len())),
                };
                Ok(Value::Iter(Rc::new(RefCell::new(ValueIter::Range { next, stop, step }))))
            }
            BuiltinFn::Len => match args.positional.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [Value::Tuple(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::List(items)] => Ok(Value::Int(items.borrow().len() as i64)),
                [Value::Dict(dict)] => Ok(Value::Int(dict.borrow().len() as i64)),
                [other] => Err(Self::type_error(format!("object of type '{}' has no len()", other.type_name()))),
                _ => Err(arity_error(args.positional.len())),
            },
            BuiltinFn::Abs => match args.positional.as_slice() {
                [Value::Int(i)] => Ok(Value::Int(i.abs())),
                [Value::Float(f)] => Ok(Value::Float(f.abs())),
                [other] => Err(Self::type_error(format!("bad operand type for abs(): '{}'", other.type_name()))),
                _ => Err(arity_error(args.positional.len())),
            },
            BuiltinFn::Repr => match args.positional.as_slice() {
                [value] => Ok(Value::Str(self.repr(value))),
                _ => Err(arity_error(args.positional.len())),
            },
        }
    }

    fn builtin(&self, name: &str) -> Option<Value> {
        // exception classes resolve like builtins, so handler code can load
        // its matcher by name
        if let Ok(kind) = name.parse::<ExcKind>() {
            return Some(Value::ExcType(kind));
        }
        let builtin = match name {
            "range" => BuiltinFn::Range,
            "len" => BuiltinFn::Len,
            "abs" => BuiltinFn::Abs,
            "repr" => BuiltinFn::Repr,
            _ => return None,
        };
        Some(Value::Builtin(builtin))
    }

    fn repr(&self, value: &Value) -> String {
        match value {
            Value::None => "None".to_owned(),
            Value::Bool(true) => "True".to_owned(),
            Value::Bool(false) => "False".to_owned(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => format!("'{s}'"),
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|item| self.repr(item)).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(|item| self.repr(item)).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dict(dict) => {
                let parts: Vec<String> = dict
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.repr(k), self.repr(v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::ExcType(kind) => format!("<class '{kind}'>"),
            Value::ExcInstance(exc) => exc.to_string(),
            Value::Function(func) => format!("<function {}>", func.name),
            Value::Generator(_) => "<generator>".to_owned(),
            Value::Code(code) => format!("<code {}>", code.name),
            Value::Builtin(builtin) => format!("<builtin {builtin}>"),
            Value::Cell(_) => "<cell>".to_owned(),
            Value::Iter(_) => "<iterator>".to_owned(),
            Value::Token(_) => "<unwind-token>".to_owned(),
        }
    }
}
