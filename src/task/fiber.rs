//! The stackful execution context: the black-box switch primitive and the
//! portable thread-backed implementation of it.
//!
//! The task layer consumes exactly one contract, [`ExecutionContext`]:
//! "hand control to the context, passing a private-data payload; the call
//! returns when the other side yields or finishes, exactly once per switch".
//! Hosts with a platform fiber primitive can supply their own implementation;
//! the crate ships [`ThreadFiber`], which runs the task body on a dedicated
//! OS thread and uses a mutex/condvar rendezvous so exactly one side executes
//! at a time. Requested stack sizes map onto the spawned thread's stack.
//!
//! A killed task parked in `yield` is woken through the context's
//! [`shutdown`](ExecutionContext::shutdown); its next yield returns
//! [`TaskError::Exiting`] so a cooperative body unwinds and releases the
//! thread. A body that ignores the signal keeps its thread parked — the
//! accepted limitation of cooperative kill: cleanup only runs if the body
//! reaches another suspension point.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::types::{AtomicStatusCell, TaskId, TaskStatus};

use super::action::TaskAction;
use super::task::TaskInner;

/// Opaque payload handed across a context switch.
pub type PrivateData = Option<Box<dyn Any + Send>>;

/// What a [`resume`](ExecutionContext::resume) call observed when control
/// came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// The body yielded; it can be resumed again.
    Yielded,
    /// The body returned (or panicked) with the given result code.
    Finished {
        /// The action's integer result code.
        code: i32,
        /// True when the body unwound with a panic instead of returning.
        panicked: bool,
    },
}

impl Transfer {
    /// True for the `Finished` variant.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// The raw context-switch contract consumed by the task layer.
///
/// Implementations must guarantee that control returns to the `resume` call
/// site exactly once per switch, carrying whatever the other side reported.
pub trait ExecutionContext: Send + Sync {
    /// Hands control to the context; blocks until it yields or finishes.
    fn resume(&self, data: PrivateData) -> Transfer;

    /// True once the body has returned.
    fn is_finished(&self) -> bool;

    /// Signals the context that the task is terminal: a parked body is woken
    /// and every subsequent yield reports [`TaskError::Exiting`].
    fn shutdown(&self);
}

/// Identity and status shared between a task and its running body.
#[derive(Debug)]
pub(crate) struct ScopeLink {
    pub(crate) id: TaskId,
    pub(crate) status: AtomicStatusCell<TaskStatus>,
    pub(crate) task: OnceLock<Weak<TaskInner>>,
}

impl ScopeLink {
    pub(crate) fn new(id: TaskId) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: AtomicStatusCell::new(TaskStatus::Created),
            task: OnceLock::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Host,
    Fiber,
}

struct Channel {
    control: Control,
    payload: PrivateData,
    exit: Option<(i32, bool)>,
    shutdown: bool,
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("control", &self.control)
            .field("has_payload", &self.payload.is_some())
            .field("exit", &self.exit)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

#[derive(Debug)]
struct FiberShared {
    channel: Mutex<Channel>,
    to_fiber: Condvar,
    to_host: Condvar,
}

/// OS-thread-backed execution context.
#[derive(Debug)]
pub struct ThreadFiber {
    shared: Arc<FiberShared>,
}

impl ThreadFiber {
    /// Spawns the carrier thread for `action`. The body does not run until
    /// the first `resume`. A `stack_size` of zero uses the platform default.
    pub(crate) fn spawn(
        stack_size: usize,
        link: Arc<ScopeLink>,
        action: Box<dyn TaskAction>,
    ) -> Result<Self, TaskError> {
        let shared = Arc::new(FiberShared {
            channel: Mutex::new(Channel {
                control: Control::Host,
                payload: None,
                exit: None,
                shutdown: false,
            }),
            to_fiber: Condvar::new(),
            to_host: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let mut builder = thread::Builder::new().name(format!("costrand-{}", link.id));
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || fiber_main(&thread_shared, link, action))
            .map_err(|_| TaskError::ContextUnavailable)?;
        Ok(Self { shared })
    }
}

impl ExecutionContext for ThreadFiber {
    fn resume(&self, data: PrivateData) -> Transfer {
        let mut channel = self.shared.channel.lock();
        if let Some((code, panicked)) = channel.exit {
            return Transfer::Finished { code, panicked };
        }
        channel.payload = data;
        channel.control = Control::Fiber;
        self.shared.to_fiber.notify_all();
        while channel.control == Control::Fiber && channel.exit.is_none() {
            self.shared.to_host.wait(&mut channel);
        }
        match channel.exit {
            Some((code, panicked)) => Transfer::Finished { code, panicked },
            None => Transfer::Yielded,
        }
    }

    fn is_finished(&self) -> bool {
        self.shared.channel.lock().exit.is_some()
    }

    fn shutdown(&self) {
        let mut channel = self.shared.channel.lock();
        channel.shutdown = true;
        self.shared.to_fiber.notify_all();
    }
}

fn fiber_main(shared: &Arc<FiberShared>, link: Arc<ScopeLink>, mut action: Box<dyn TaskAction>) {
    let start_data = {
        let mut channel = shared.channel.lock();
        while channel.control != Control::Fiber && !channel.shutdown {
            shared.to_fiber.wait(&mut channel);
        }
        if channel.control != Control::Fiber {
            // Shut down before ever starting: the body never runs.
            channel.exit = Some((0, false));
            shared.to_host.notify_all();
            return;
        }
        channel.payload.take()
    };

    let mut scope = FiberScope {
        shared: Arc::clone(shared),
        link,
        data: start_data,
        _not_send: std::marker::PhantomData,
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| action.run(&mut scope)));
    let (code, panicked) = match result {
        Ok(code) => (code, false),
        Err(_) => (-1, true),
    };

    let mut channel = shared.channel.lock();
    channel.exit = Some((code, panicked));
    channel.control = Control::Host;
    shared.to_host.notify_all();
}

/// Handle a task body uses to talk back to the runtime: yield, read the
/// resumer's payload, inspect its own identity and status.
pub struct FiberScope {
    shared: Arc<FiberShared>,
    pub(crate) link: Arc<ScopeLink>,
    data: PrivateData,
    /// A scope belongs to exactly one carrier thread.
    _not_send: std::marker::PhantomData<Rc<()>>,
}

impl core::fmt::Debug for FiberScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FiberScope")
            .field("id", &self.link.id)
            .field("status", &self.link.status.get_status())
            .finish()
    }
}

impl FiberScope {
    /// Yields control back to whatever resumed this task.
    ///
    /// Returns the private data the next `resume` passes in, or
    /// [`TaskError::Exiting`] once the task has been cancelled, killed, or
    /// timed out — the body should unwind promptly in that case.
    pub fn yield_now(&mut self) -> Result<PrivateData, TaskError> {
        let mut channel = self.shared.channel.lock();
        if channel.shutdown {
            return Err(TaskError::Exiting);
        }
        channel.control = Control::Host;
        self.shared.to_host.notify_all();
        while channel.control == Control::Host && !channel.shutdown {
            self.shared.to_fiber.wait(&mut channel);
        }
        if channel.shutdown {
            return Err(TaskError::Exiting);
        }
        Ok(channel.payload.take())
    }

    /// Takes the private data delivered by `start` (or the latest resume, if
    /// not consumed through [`yield_now`](Self::yield_now)).
    pub fn take_data(&mut self) -> PrivateData {
        self.data.take()
    }

    /// This task's id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.link.id
    }

    /// This task's current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.link.status.get_status()
    }

    /// True once this task has been told to exit.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.status().is_exited() || self.shared.channel.lock().shutdown
    }
}
