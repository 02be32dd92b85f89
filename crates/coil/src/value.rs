//! Boxed runtime values.
//!
//! `Value` is the currency of the value stack, the constant pool, and the
//! object-space interface. Constants only ever use the serializable subset
//! (`None`/`Bool`/`Int`/`Float`/`Str`/`Tuple`/`Code`); the runtime-only
//! variants are `#[serde(skip)]` and can never appear in a persisted
//! [`Code`](crate::Code) artifact.

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::Code,
    error::{ExcKind, VmException},
    function::FunctionObj,
    generator::GeneratorIterator,
    space::BuiltinFn,
    vm::UnwindToken,
};

/// A shared string-keyed namespace (globals, module-level locals).
pub type Namespace = Rc<RefCell<AHashMap<String, Value>>>;

/// Creates an empty shared namespace.
#[must_use]
pub fn new_namespace() -> Namespace {
    Rc::new(RefCell::new(AHashMap::new()))
}

/// A single boxed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Rc<Vec<Value>>),
    /// A nested code object, as produced for `MakeFunction`/`MakeClosure`.
    Code(Rc<Code>),
    /// An exception class, as pushed by except-handler entry and matched by
    /// `CompareArg::ExcMatch`.
    ExcType(ExcKind),
    /// An exception instance.
    ExcInstance(Box<VmException>),
    /// A space-provided builtin callable.
    Builtin(BuiltinFn),

    // --- runtime-only variants, never constants ---
    #[serde(skip)]
    List(Rc<RefCell<Vec<Value>>>),
    #[serde(skip)]
    Dict(Rc<RefCell<Dict>>),
    #[serde(skip)]
    Function(Rc<FunctionObj>),
    #[serde(skip)]
    Generator(Rc<GeneratorIterator>),
    #[serde(skip)]
    Cell(CellRef),
    #[serde(skip)]
    Iter(Rc<RefCell<ValueIter>>),
    /// A suspended unwind reason parked on the value stack for a handler;
    /// consumed by `EndFinally`.
    #[serde(skip)]
    Token(Box<UnwindToken>),
}

impl Value {
    /// Builds a list value.
    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    /// Builds a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Rc::new(items))
    }

    /// The user-visible type name, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::Code(_) => "code",
            Self::ExcType(_) => "type",
            Self::ExcInstance(_) => "exception",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Function(_) => "function",
            Self::Generator(_) => "generator",
            Self::Cell(_) => "cell",
            Self::Iter(_) => "iterator",
            Self::Token(_) => "unwind-token",
        }
    }

    /// Identity comparison (`is` / `is not`).
    ///
    /// Structural for immutable scalars, pointer identity for heap values.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    /// Structural equality within one runtime type.
    ///
    /// Cross-type numeric equality (`1 == 1.0`) is object-space policy, not
    /// value identity, and lives in the space implementation.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            // structural, so a dumped-and-loaded constant pool still
            // compares equal to the original
            (Self::Code(a), Self::Code(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::ExcInstance(a), Self::ExcInstance(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Cell(a), Self::Cell(b)) => a.ptr_eq(b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A closure cell: a shared, mutable, possibly-empty slot.
///
/// Cells give captured variables indirect storage: the defining frame and
/// every nested closure hold the same cell, so stores through either side
/// are visible to both.
#[derive(Debug, Clone, Default)]
pub struct CellRef(Rc<RefCell<Option<Value>>>);

impl CellRef {
    /// A new empty cell.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A new cell holding `value`.
    #[must_use]
    pub fn with_value(value: Value) -> Self {
        Self(Rc::new(RefCell::new(Some(value))))
    }

    /// The cell's current value, if any.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = Some(value);
    }

    /// Empties the cell, returning the previous value if any.
    pub fn clear(&self) -> Option<Value> {
        self.0.borrow_mut().take()
    }

    /// Whether two references point at the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A small association-list dict.
///
/// The reference space only needs dicts for `BuildMap` results and
/// `**kwargs` mappings, where entry counts are tiny; a linear scan keeps
/// the key type unconstrained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or replaces, preserving first-insertion order.
    pub fn insert(&mut self, key: Value, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Iterator state for the reference space's iteration protocol.
#[derive(Debug, Clone)]
pub enum ValueIter {
    /// Counting iterator, as produced by `range`.
    Range { next: i64, stop: i64, step: i64 },
    /// Snapshot iterator over a materialized sequence.
    Seq { items: Vec<Value>, index: usize },
}

impl ValueIter {
    /// Advances the iterator, returning `None` on exhaustion.
    pub fn advance(&mut self) -> Option<Value> {
        match self {
            Self::Range { next, stop, step } => {
                let exhausted = if *step >= 0 { *next >= *stop } else { *next <= *stop };
                if exhausted {
                    return None;
                }
                let current = *next;
                *next += *step;
                Some(Value::Int(current))
            }
            Self::Seq { items, index } => {
                let item = items.get(*index).cloned()?;
                *index += 1;
                Some(item)
            }
        }
    }
}

/// Deduplication key for the constant pool: runtime type + value.
///
/// Two constants that compare equal but have different runtime types
/// (`True` vs `1`) get distinct keys, and therefore distinct pool slots.
/// Floats are keyed by bit pattern so `0.0` and `-0.0` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConstKey {
    None,
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Str(String),
    Tuple(Vec<ConstKey>),
    /// Code objects are interned by identity: each emitted nested code
    /// object is its own constant.
    CodePtr(usize),
    ExcType(ExcKind),
}

impl ConstKey {
    /// Builds the key for a constant-pool candidate.
    ///
    /// Returns `None` for values that cannot live in a constant pool
    /// (mutable or runtime-only values).
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::None => Some(Self::None),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Float(f) => Some(Self::FloatBits(f.to_bits())),
            Value::Str(s) => Some(Self::Str(s.clone())),
            Value::Tuple(items) => items.iter().map(Self::from_value).collect::<Option<Vec<_>>>().map(Self::Tuple),
            Value::Code(code) => Some(Self::CodePtr(Rc::as_ptr(code) as usize)),
            Value::ExcType(kind) => Some(Self::ExcType(*kind)),
            _ => None,
        }
    }
}
