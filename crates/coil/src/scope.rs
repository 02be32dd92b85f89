//! Interface to the external scope-resolution pass.
//!
//! The assembler performs no scope analysis of its own: a front end walks
//! the syntax tree, decides the storage class of every identifier, and hands
//! the result over as a [`ScopeInfo`]. The assembler trusts this mapping
//! completely.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::CodeFlags;

/// Maximum length of a mangled private name.
///
/// Combined class-name + identifier length beyond this cap truncates the
/// class-name part; if nothing of the class name survives, the identifier
/// is left unmangled.
const MANGLE_LEN: usize = 256;

/// Where an identifier lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    /// Fast local slot in the executing frame.
    Local,
    /// Captured by a nested function; stored in a cell in this frame.
    Cell,
    /// Defined in an enclosing scope; received through the closure.
    Free,
    /// Global by default (no binding in any enclosing function scope).
    GlobalImplicit,
    /// Declared global by the program.
    GlobalExplicit,
}

/// Per-scope output of the external resolver, consumed by the assembler.
///
/// `symbols` is insertion-ordered so slot numbering is deterministic.
/// `param_names` come first in the local-variable table; cell variables are
/// numbered before free variables in the shared deref index space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeInfo {
    /// Name of the scope (function name, class name, or `<module>`).
    pub name: String,
    /// Innermost enclosing class name, for private-name mangling.
    pub class_name: Option<String>,
    /// Identifier -> storage class, insertion-ordered.
    pub symbols: IndexMap<String, StorageClass>,
    /// Parameter names, in declaration order.
    pub param_names: Vec<String>,
    /// Free-variable names, in resolver order.
    pub free_names: Vec<String>,
    /// Code-object flags decided by the resolver (generator, varargs, ...).
    pub flags: CodeFlags,
}

impl ScopeInfo {
    /// A module-level scope: no fast locals, names resolved dynamically.
    #[must_use]
    pub fn module() -> Self {
        Self {
            name: "<module>".to_owned(),
            ..Self::default()
        }
    }

    /// A function scope with the given parameters, all stored as fast locals.
    #[must_use]
    pub fn function(name: &str, params: &[&str]) -> Self {
        let mut scope = Self {
            name: name.to_owned(),
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            ..Self::default()
        };
        for &param in params {
            scope.param_names.push(param.to_owned());
            scope.symbols.insert(param.to_owned(), StorageClass::Local);
        }
        scope
    }

    /// Applies class-private mangling for this scope's enclosing class.
    #[must_use]
    pub fn mangle<'n>(&self, name: &'n str) -> std::borrow::Cow<'n, str> {
        match &self.class_name {
            Some(class_name) => mangle(name, class_name),
            None => std::borrow::Cow::Borrowed(name),
        }
    }
}

/// Mangles a class-private identifier.
///
/// `__spam` inside class `Ham` becomes `_Ham__spam`. Names that are not
/// dunder-prefixed, or that are dunder-suffixed as well (`__spam__`), are
/// untouched. Leading underscores are stripped from the class name first;
/// a class name consisting only of underscores disables mangling. The
/// combined length is capped, truncating the class-name part - a legacy
/// quirk preserved deliberately.
#[must_use]
pub fn mangle<'n>(name: &'n str, class_name: &str) -> std::borrow::Cow<'n, str> {
    use std::borrow::Cow;

    if !name.starts_with("__") || name.ends_with("__") || name.contains('.') {
        return Cow::Borrowed(name);
    }
    let stripped = class_name.trim_start_matches('_');
    if stripped.is_empty() {
        return Cow::Borrowed(name);
    }
    let mut stripped = stripped;
    let total = stripped.len() + name.len();
    if total > MANGLE_LEN {
        let keep = stripped.len().saturating_sub(total - MANGLE_LEN);
        if keep == 0 {
            return Cow::Borrowed(name);
        }
        stripped = &stripped[..keep];
    }
    Cow::Owned(format!("_{stripped}{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_private_names() {
        assert_eq!(mangle("__x", "Foo"), "_Foo__x");
        assert_eq!(mangle("__x", "_Foo"), "_Foo__x");
        assert_eq!(mangle("__x", "__Foo"), "_Foo__x");
    }

    #[test]
    fn leaves_dunder_and_public_names_alone() {
        assert_eq!(mangle("__x__", "Foo"), "__x__");
        assert_eq!(mangle("x", "Foo"), "x");
        assert_eq!(mangle("_x", "Foo"), "_x");
    }

    #[test]
    fn underscore_only_class_disables_mangling() {
        assert_eq!(mangle("__x", "___"), "__x");
    }

    #[test]
    fn oversized_names_truncate_the_class_part() {
        let class_name = "C".repeat(300);
        let mangled = mangle("__x", &class_name);
        assert_eq!(mangled.len(), 1 + (MANGLE_LEN - 3) + 3);
        assert!(mangled.starts_with("_CCC"));
        assert!(mangled.ends_with("__x"));
    }

    #[test]
    fn wholly_truncated_class_disables_mangling() {
        let name = format!("__{}", "x".repeat(MANGLE_LEN));
        assert_eq!(mangle(&name, "Foo"), name);
    }

    #[test]
    fn scope_mangle_uses_enclosing_class() {
        let mut scope = ScopeInfo::function("method", &["self"]);
        scope.class_name = Some("Widget".to_owned());
        assert_eq!(scope.mangle("__secret"), "_Widget__secret");
        let plain = ScopeInfo::function("f", &[]);
        assert_eq!(plain.mangle("__secret"), "__secret");
    }
}
