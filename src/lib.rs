//! Costrand: a coroutine runtime core with cooperative cancellation.
//!
//! # Overview
//!
//! Costrand provides two complementary coroutine primitives and the
//! machinery to compose and cancel them:
//!
//! - **Stackless futures** — [`CallableFuture`] wraps an async body as a
//!   manually driven coroutine with an ordered, monotonic status
//!   (`Created < Running < Done < Cancelled < Killed < Timeout`), precise
//!   caller/callee linkage, and a cooperative [`kill`](CallableFuture::kill)
//!   that propagates terminal statuses through entire await chains.
//! - **Generator futures** — [`GeneratorFuture`] bridges external events in:
//!   an outside actor resolves it through its shared context, waking every
//!   registered awaiter; destroying it while pending auto-resolves to an
//!   error value so no awaiter hangs.
//! - **Combinators** — [`some`]/[`any`]/[`all`] await N-of-M futures with
//!   early exit, discovery-order results, and kill-safe detaching.
//! - **Stackful tasks** — [`Task`] runs a body on its own execution context
//!   (the portable implementation carries it on a dedicated thread) with a
//!   CAS-driven status machine, completion chaining via
//!   [`next`](Task::next), and a [`TaskManager`] layering identity and
//!   timeout-bucketed expiry on top.
//!
//! # Driving model
//!
//! This is not a scheduler. There is no thread pool, no reactor, and no
//! work stealing: the host drives everything explicitly through `start`,
//! `resume`, [`GeneratorContext::set_value`], and
//! [`TaskManager::tick`]. Stackless coroutines execute synchronously on the
//! thread that resumes them and are deliberately `!Send` (`Rc`-shared cells
//! need no locks — the type system is the single-threaded switch); the
//! stackful side is fully thread-safe and may be driven from any thread.
//!
//! # Error model
//!
//! Coroutine outcomes are status-coded, not `Err`-coded: a killed or
//! timed-out future yields a placeholder value synthesized by the
//! [`ErrorValue`] transform of its terminal status (for integers, the
//! negated status code). `Result` appears only on the task/manager surface,
//! where the host drives tasks by hand. Panics from coroutine bodies are
//! not caught; a panic in a stackful task body finishes that task as
//! `Killed`.
//!
//! # Module structure
//!
//! - [`types`]: status codes, ids, tick time
//! - [`poller`]: the pending/ready value slot
//! - [`promise`]: promise state, caller linkage, the error-value transform
//! - [`callable`]: the primary async-function wrapper
//! - [`generator`]: externally resolved futures
//! - [`combinator`]: `some`/`any`/`all`
//! - [`task`]: stackful tasks, the execution-context seam, stack
//!   accounting, and the task manager
//! - [`error`]: task-surface error codes
//! - [`tracing_compat`]: feature-gated structured logging

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod callable;
pub mod combinator;
pub mod error;
pub mod generator;
pub mod poller;
pub mod promise;
pub mod task;
pub mod tracing_compat;
pub mod types;

pub use callable::CallableFuture;
pub use combinator::{all, any, ready_output, some, Combinable, ReadyOutput};
pub use error::TaskError;
pub use generator::{GeneratorContext, GeneratorFuture};
pub use poller::Poller;
pub use promise::{yield_status, ErrorValue, HandleDelegate};
pub use task::{
    ExecutionContext, FiberScope, PrivateData, StackPool, StackPoolConfig, Task, TaskAction,
    TaskManager,
};
pub use types::{PromiseStatus, TaskId, TaskStatus, TickTime};
