//! The task action contract: the callable a stackful task executes.

use super::fiber::FiberScope;

/// A task body: invoked once with the task's [`FiberScope`], returning an
/// integer result code (conventionally zero for success).
///
/// The scope is the body's line back into the runtime — yield, read the
/// resumer's payload, check identity and status, wait for another task.
/// Any `FnMut(&mut FiberScope) -> i32 + Send + 'static` is an action.
pub trait TaskAction: Send + 'static {
    /// Runs the body to completion.
    fn run(&mut self, scope: &mut FiberScope) -> i32;
}

impl<F> TaskAction for F
where
    F: FnMut(&mut FiberScope) -> i32 + Send + 'static,
{
    fn run(&mut self, scope: &mut FiberScope) -> i32 {
        self(scope)
    }
}
