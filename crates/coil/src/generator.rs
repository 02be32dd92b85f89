//! The generator suspension mechanism.
//!
//! A generator is a [`Frame`] parked in a [`GeneratorIterator`]: its
//! instruction pointer, value stack, and block stack fully capture the
//! suspended state, so nothing about a suspended generator lives on the
//! host call stack. Resuming re-enters the same frame exactly where it
//! yielded, with all locals intact.

use std::cell::{Cell, RefCell};

use crate::{
    error::{RunError, RunResult},
    space::ObjectSpace,
    tracer::VmTracer,
    vm::{ExecutionContext, Frame, FrameExit},
};

/// Result of one [`GeneratorIterator::advance`] call.
#[derive(Debug, PartialEq)]
pub enum Advance {
    /// The frame suspended at a yield with this value.
    Yielded(crate::value::Value),
    /// The frame finished; no value, and no further resumption.
    Exhausted,
}

/// A suspendable frame producing values one resume at a time.
///
/// The `running` flag is a mutual-exclusion latch, not a status display:
/// only one `advance` may be in flight at a time, and a re-entrant resume
/// (from a callback, or from the generator's own body iterating itself) is
/// rejected with [`RunError::AlreadyRunning`] before the frame is touched.
#[derive(Debug)]
pub struct GeneratorIterator {
    frame: RefCell<Frame>,
    running: Cell<bool>,
    exhausted: Cell<bool>,
}

impl GeneratorIterator {
    /// Parks a not-yet-started frame.
    pub(crate) fn new(frame: Frame) -> Self {
        Self {
            frame: RefCell::new(frame),
            running: Cell::new(false),
            exhausted: Cell::new(false),
        }
    }

    /// Whether an `advance` call is currently in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Whether the generator has finished (returned or raised).
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.get()
    }

    /// Resumes the frame until its next yield, return, or uncaught raise.
    ///
    /// - A yield suspends the frame and produces [`Advance::Yielded`].
    /// - A return exhausts the generator and produces [`Advance::Exhausted`];
    ///   generators never produce a value via return, only via yield.
    /// - An uncaught exception exhausts the generator and propagates.
    /// - Advancing an exhausted generator reports exhaustion again without
    ///   re-running stale bytecode; advancing a running generator fails with
    ///   [`RunError::AlreadyRunning`].
    pub fn advance<S: ObjectSpace, Tr: VmTracer>(&self, ctx: &mut ExecutionContext<S, Tr>) -> RunResult<Advance> {
        if self.running.get() {
            return Err(RunError::AlreadyRunning);
        }
        if self.exhausted.get() {
            return Ok(Advance::Exhausted);
        }
        ctx.enter_call()?;
        self.running.set(true);
        let result = self.frame.borrow_mut().execute(ctx);
        self.running.set(false);
        ctx.leave_call();
        match result {
            Ok(FrameExit::Yield(value)) => Ok(Advance::Yielded(value)),
            Ok(FrameExit::Return(_)) => {
                self.exhausted.set(true);
                Ok(Advance::Exhausted)
            }
            Err(error) => {
                self.exhausted.set(true);
                Err(error)
            }
        }
    }
}
