//! Error codes for the task and task-manager surfaces.
//!
//! The promise/future core never reports errors this way — terminal statuses
//! carry that information. `TaskError` covers the operational surface where
//! the host drives tasks by hand: starting, resuming, registering with a
//! manager, ticking timers.

use thiserror::Error;

/// Errors returned by task and task-manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The task already reached a terminal status.
    #[error("task is already finished")]
    AlreadyFinished,
    /// The task body is currently executing; exactly one start/resume/cancel
    /// may be in flight per task.
    #[error("task is already running")]
    IsRunning,
    /// No task with the given id is registered.
    #[error("task not found")]
    NotFound,
    /// The task is exiting (terminal status reached), so the operation makes
    /// no sense anymore.
    #[error("task is exiting")]
    Exiting,
    /// A task cannot `next`/`await` itself.
    #[error("task can not wait for itself")]
    CannotAwaitSelf,
    /// A task with this id is already registered in the manager.
    #[error("task already registered")]
    AlreadyExists,
    /// The manager is resetting; no mutations are accepted.
    #[error("task manager is resetting")]
    InReset,
    /// An argument was invalid (null task, non-terminal kill status, ...).
    #[error("invalid argument")]
    InvalidArgument,
    /// The follow-up task could not be registered.
    #[error("failed to register follow-up task")]
    AddNextFailed,
    /// The stack pool refused the allocation; the task was not created.
    #[error("stack pool exhausted")]
    StackExhausted,
    /// The execution context could not be created; the task was not created.
    #[error("execution context unavailable")]
    ContextUnavailable,
}
