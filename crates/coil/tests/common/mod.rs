//! Shared plumbing for the integration tests.

use std::rc::Rc;

use coil::{Code, ExecutionContext, Namespace, NoopTracer, PlainSpace, RunResult, Value, new_namespace};

/// A context over the reference space with no tracing.
pub fn ctx() -> ExecutionContext<PlainSpace, NoopTracer> {
    ExecutionContext::new(PlainSpace, NoopTracer)
}

/// Assembled module code, run in a fresh namespace.
pub fn run(code: Code) -> RunResult<Value> {
    ctx().run_module(&Rc::new(code))
}

/// Assembled module code, run against a caller-held namespace so tests can
/// inspect globals afterwards (including after an uncaught exception).
pub fn run_in(code: Code, globals: &Namespace) -> RunResult<Value> {
    ctx().run_module_in(&Rc::new(code), globals)
}

/// A namespace pre-seeded with the given globals.
pub fn globals_with(entries: &[(&str, Value)]) -> Namespace {
    let globals = new_namespace();
    for (name, value) in entries {
        globals.borrow_mut().insert((*name).to_owned(), value.clone());
    }
    globals
}

/// Reads one global out of a namespace.
pub fn global(globals: &Namespace, name: &str) -> Option<Value> {
    globals.borrow().get(name).cloned()
}
