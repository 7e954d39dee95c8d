//! The stackful task: identity, status state machine, chaining, and the
//! destructor-time safety net.
//!
//! `start`, `resume`, `cancel`, and `kill` all funnel into compare-and-swap
//! transitions on the task's status cell, so exactly one mutation is in
//! flight per task at any moment — a concurrent `start`/`resume` observes
//! `Running` and fails with [`TaskError::IsRunning`] instead of racing.
//!
//! Tasks are shared with `Arc` semantics. When the last handle drops while
//! the task is in flight, it is force-finished with `Timeout` and its
//! pending follow-up tasks are activated, so nothing is silently lost.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::types::{TaskId, TaskStatus};

use super::action::TaskAction;
use super::fiber::{ExecutionContext, FiberScope, PrivateData, ScopeLink, ThreadFiber, Transfer};
use super::stack_pool::{StackLease, StackPool, DEFAULT_STACK_SIZE};

pub(crate) struct TaskInner {
    pub(crate) link: Arc<ScopeLink>,
    context: Box<dyn ExecutionContext>,
    next_list: Mutex<Vec<(Task, PrivateData)>>,
    ret_code: AtomicI32,
    _lease: Option<StackLease>,
}

impl core::fmt::Debug for TaskInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskInner")
            .field("id", &self.link.id)
            .field("status", &self.link.status.get_status())
            .finish()
    }
}

/// A stackful coroutine task with its own execution context.
///
/// Cloning shares the same task; see the module docs for lifecycle rules.
#[derive(Debug, Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Creates a task running `action` with the default stack size.
    pub fn create(action: impl TaskAction) -> Result<Self, TaskError> {
        Self::build(Box::new(action), DEFAULT_STACK_SIZE, None)
    }

    /// Creates a task with an explicit stack size (zero for the platform
    /// default).
    pub fn create_with_stack(action: impl TaskAction, stack_size: usize) -> Result<Self, TaskError> {
        Self::build(Box::new(action), stack_size, None)
    }

    /// Creates a task whose stack is accounted against `pool`.
    ///
    /// Fails with [`TaskError::StackExhausted`] when the pool refuses the
    /// reservation; no task is created in that case.
    pub fn create_with_pool(
        action: impl TaskAction,
        pool: &Arc<StackPool>,
        stack_size: usize,
    ) -> Result<Self, TaskError> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let lease = pool.acquire(size)?;
        Self::build(Box::new(action), size, Some(lease))
    }

    fn build(
        action: Box<dyn TaskAction>,
        stack_size: usize,
        lease: Option<StackLease>,
    ) -> Result<Self, TaskError> {
        let link = ScopeLink::new(TaskId::allocate());
        let fiber = ThreadFiber::spawn(stack_size, Arc::clone(&link), action)?;
        let inner = Arc::new(TaskInner {
            link,
            context: Box::new(fiber),
            next_list: Mutex::new(Vec::new()),
            ret_code: AtomicI32::new(0),
            _lease: lease,
        });
        let _ = inner.link.task.set(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<TaskInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<TaskInner> {
        &self.inner
    }

    /// This task's process-unique id.
    #[must_use]
    pub fn get_id(&self) -> TaskId {
        self.inner.link.id
    }

    /// Current status.
    #[must_use]
    pub fn get_status(&self) -> TaskStatus {
        self.inner.link.status.get_status()
    }

    /// True once the task reached a terminal status.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.get_status().is_exited()
    }

    /// True once the body physically returned.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.context.is_finished()
    }

    /// The action's result code once the task finished as `Done`; for a task
    /// that exited abnormally (cancelled, killed, timed out, panicked), the
    /// negated status code; zero while in flight.
    #[must_use]
    pub fn get_ret_code(&self) -> i32 {
        let status = self.get_status();
        match status {
            TaskStatus::Done => self.inner.ret_code.load(Ordering::Acquire),
            _ if status.is_exited() => -i32::from(status as u8),
            _ => 0,
        }
    }

    /// Starts a `Created` task, running the body until it yields or returns.
    pub fn start(&self, data: PrivateData) -> Result<(), TaskError> {
        self.advance(data, TaskStatus::Created)
    }

    /// Resumes a `Waiting` task.
    pub fn resume(&self, data: PrivateData) -> Result<(), TaskError> {
        self.advance(data, TaskStatus::Waiting)
    }

    /// The single start/resume state machine: CAS into `Running`, hand
    /// control to the execution context, then settle into `Waiting`, `Done`,
    /// or whatever terminal status a racing kill installed.
    fn advance(&self, data: PrivateData, expected: TaskStatus) -> Result<(), TaskError> {
        let status = &self.inner.link.status;
        let mut from = expected;
        loop {
            if from.is_exited() {
                return Err(TaskError::AlreadyFinished);
            }
            if from == TaskStatus::Running {
                return Err(TaskError::IsRunning);
            }
            if status.set_status(TaskStatus::Running, Some(&mut from)) {
                break;
            }
        }

        let transfer = self.inner.context.resume(data);
        match transfer {
            Transfer::Finished { code, panicked } => {
                self.inner.ret_code.store(code, Ordering::Release);
                let target = if panicked {
                    TaskStatus::Killed
                } else {
                    TaskStatus::Done
                };
                let mut from = TaskStatus::Running;
                while from < TaskStatus::Done {
                    if status.set_status(target, Some(&mut from)) {
                        break;
                    }
                }
                self.notify_finished();
                Ok(())
            }
            Transfer::Yielded => {
                let mut from = TaskStatus::Running;
                loop {
                    if from.is_exited() {
                        // Killed while running: the killer left notification
                        // to us, now that the body has yielded.
                        self.notify_finished();
                        break;
                    }
                    if status.set_status(TaskStatus::Waiting, Some(&mut from)) {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Cancels a task that is not currently running.
    pub fn cancel(&self) -> Result<(), TaskError> {
        let status = &self.inner.link.status;
        let mut from = status.get_status();
        loop {
            if from == TaskStatus::Running {
                return Err(TaskError::IsRunning);
            }
            if from.is_exited() {
                return Err(TaskError::AlreadyFinished);
            }
            if status.set_status(TaskStatus::Cancelled, Some(&mut from)) {
                break;
            }
        }
        self.notify_finished();
        Ok(())
    }

    /// Kills the task with the given terminal status.
    ///
    /// A waiting or created task is finalized immediately; a running task
    /// keeps the terminal status and is finalized by the thread driving it
    /// as soon as the body yields or returns.
    pub fn kill(&self, target: TaskStatus) -> Result<(), TaskError> {
        if !target.is_exited() {
            return Err(TaskError::InvalidArgument);
        }
        let status = &self.inner.link.status;
        let mut from = status.get_status();
        loop {
            if from.is_exited() {
                return Err(TaskError::AlreadyFinished);
            }
            if status.set_status(target, Some(&mut from)) {
                break;
            }
        }
        if from != TaskStatus::Running {
            self.notify_finished();
        }
        Ok(())
    }

    /// Registers `other` to be auto-started (or resumed) when this task
    /// finishes. If this task has already finished, `other` runs immediately
    /// instead — there is no missed-wakeup window. Self-linking is rejected
    /// by returning `self` unchanged.
    ///
    /// Returns `other` on success, `self` on rejection.
    pub fn next_with(&self, other: Task, data: PrivateData) -> Task {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return self.clone();
        }
        let run_now = {
            let mut queue = self.inner.next_list.lock();
            if self.is_exiting() || self.is_completed() {
                Some(data)
            } else {
                queue.push((other.clone(), data));
                None
            }
        };
        if let Some(data) = run_now {
            Self::activate(&other, data);
        }
        other
    }

    /// [`next_with`](Self::next_with) without a payload.
    pub fn next(&self, other: Task) -> Task {
        self.next_with(other, None)
    }

    /// Alias of [`next_with`](Self::next_with).
    pub fn then(&self, other: Task, data: PrivateData) -> Task {
        self.next_with(other, data)
    }

    fn activate(task: &Task, data: PrivateData) {
        match task.get_status() {
            TaskStatus::Created => {
                let _ = task.start(data);
            }
            TaskStatus::Waiting => {
                let _ = task.resume(data);
            }
            _ => {}
        }
    }

    /// Terminal-status epilogue: release the execution context and activate
    /// every registered follow-up task.
    fn notify_finished(&self) {
        crate::tracing_compat::debug!("task {} finished with {}", self.get_id(), self.get_status());
        self.inner.context.shutdown();
        let drained: Vec<(Task, PrivateData)> =
            core::mem::take(&mut *self.inner.next_list.lock());
        for (task, data) in drained {
            Self::activate(&task, data);
        }
    }
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        let status = self.link.status.get_status();
        if status > TaskStatus::Created && !status.is_exited() {
            // Last reference released while in flight: force-finish with
            // Timeout so follow-up tasks still run and the carrier thread is
            // released.
            self.link.status.raise_to(TaskStatus::Timeout);
            crate::tracing_compat::debug!("task {} timed out at teardown", self.link.id);
        }
        self.context.shutdown();
        let drained: Vec<(Task, PrivateData)> = core::mem::take(&mut *self.next_list.lock());
        for (task, data) in drained {
            Task::activate(&task, data);
        }
    }
}

impl FiberScope {
    /// Cooperatively waits for `other` to finish, from inside a task body.
    ///
    /// Registers this task as a follow-up of `other`, then repeatedly yields
    /// until `other` is exiting or completed, aborting early if this task is
    /// itself told to exit. This is spin-via-yield: it relies on the driver
    /// (or `other`'s completion) resuming this task, no blocking primitive
    /// is involved.
    pub fn await_task(&mut self, other: &Task) -> Result<(), TaskError> {
        let me = self
            .link
            .task
            .get()
            .and_then(Weak::upgrade)
            .map(Task::from_inner)
            .ok_or(TaskError::NotFound)?;
        if Arc::ptr_eq(me.inner(), other.inner()) {
            return Err(TaskError::CannotAwaitSelf);
        }
        if other.is_exiting() || other.is_completed() {
            return Err(TaskError::Exiting);
        }
        if me.is_exiting() {
            return Err(TaskError::Exiting);
        }

        let registered = other.next_with(me.clone(), None);
        if !Arc::ptr_eq(registered.inner(), me.inner()) {
            return Err(TaskError::AddNextFailed);
        }

        loop {
            if me.is_exiting() {
                return Err(TaskError::Exiting);
            }
            if other.is_exiting() || other.is_completed() {
                return Ok(());
            }
            self.yield_now()?;
        }
    }
}
