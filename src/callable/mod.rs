//! The callable future: the crate's primary async-function wrapper.
//!
//! A [`CallableFuture`] owns one stackless coroutine. Construction does not
//! run the body; the first [`start`](CallableFuture::start) (or the first
//! await of the future) transitions `Created -> Running` and drives the body
//! to its first suspension point. Completion stores the returned value and
//! resumes every registered caller. [`kill`](CallableFuture::kill) forces a
//! terminal status and, when safe, resumes the coroutine so it can observe
//! the status at its current await point and unwind cooperatively.
//!
//! Dropping a callable future that has not returned repeatedly kills and
//! resumes it until the body runs out; if the body still has not finished
//! (for example it is parked on a foreign future), the state machine is
//! force-destroyed under the `Destroying` flag, which tears down everything
//! the frame still owned — including nested callable futures, which then run
//! the same protocol.

use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::poller::Poller;
use crate::promise::{
    caller_delegate, CoroutineCell, ErrorValue, HandleDelegate, PromiseFlag,
};
use crate::types::PromiseStatus;

/// Typed return-value slot attached to a callable coroutine.
#[derive(Debug)]
pub(crate) struct ValueSlot<T> {
    data: RefCell<Poller<T>>,
}

impl<T> ValueSlot<T> {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(Poller::pending()),
        })
    }

    pub(crate) fn store(&self, value: T) {
        self.data.borrow_mut().reset_ready(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.data.borrow_mut().take()
    }

    pub(crate) fn clone_value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.data.borrow().data().cloned()
    }
}

/// Caller-facing handle for the eventual result of an async computation.
///
/// The future exclusively owns the underlying coroutine's resources; see the
/// module docs for the lifecycle protocol.
#[derive(Debug)]
pub struct CallableFuture<T: ErrorValue + 'static> {
    cell: Rc<CoroutineCell>,
    slot: Rc<ValueSlot<T>>,
}

impl<T: ErrorValue + 'static> CallableFuture<T> {
    /// Wraps `body` as a lazily started coroutine.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        let cell = CoroutineCell::new();
        let slot = ValueSlot::new();
        let weak_cell = Rc::downgrade(&cell);
        let weak_slot = Rc::downgrade(&slot);
        cell.install(Box::pin(async move {
            let value = body.await;
            // Normal return path: runs at most once per coroutine. An
            // abnormal terminal status set by a racing kill is preserved.
            if let Some(cell) = weak_cell.upgrade() {
                let promise = cell.promise();
                promise.raise_done();
                promise.set_flag(PromiseFlag::HasReturned, true);
            }
            if let Some(slot) = weak_slot.upgrade() {
                slot.store(value);
            }
        }));
        Self { cell, slot }
    }

    /// Current status of the underlying promise.
    #[must_use]
    pub fn get_status(&self) -> PromiseStatus {
        self.cell.promise().get_status()
    }

    /// True once the coroutine frame has run to its end.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.cell.finished()
    }

    /// Runs the body up to its first suspension point (or completion).
    /// Subsequent calls are no-ops; awaiting the future starts it implicitly.
    pub fn start(&self) {
        CoroutineCell::activate(&self.cell);
    }

    /// Kills the coroutine with `target`, resuming it only when it is known
    /// to be suspended on something (`is_waiting`). Equivalent to
    /// [`kill_with`](Self::kill_with) with `force_resume = false`.
    pub fn kill(&self, target: PromiseStatus) -> bool {
        self.kill_with(target, false)
    }

    /// Kills the coroutine with `target` (must be terminal; non-terminal
    /// targets are rejected by returning `false`).
    ///
    /// The status is raised through a CAS retry chain so a kill racing the
    /// coroutine's own completion resolves deterministically. When the
    /// transition wins and the coroutine is resumable (`force_resume`, or it
    /// recorded a continuation it waits on), it receives one resume so the
    /// body observes the new status at its await point.
    ///
    /// Returns `true` when this call performed the terminal transition.
    pub fn kill_with(&self, target: PromiseStatus, force_resume: bool) -> bool {
        if !target.is_terminal() {
            return false;
        }
        if self.cell.finished() {
            return false;
        }
        let promise = self.cell.promise();
        let mut current = promise.get_status();
        loop {
            if current >= PromiseStatus::Done {
                return false;
            }
            if promise.set_status(target, Some(&mut current)) {
                break;
            }
        }
        if (force_resume || promise.is_waiting())
            && !promise.check_flag(PromiseFlag::Destroying)
            && !promise.check_flag(PromiseFlag::HasReturned)
        {
            self.cell.resume(&self.cell);
        }
        true
    }

    /// Clones the stored return value, if the body has produced one.
    #[must_use]
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.cell.promise().check_flag(PromiseFlag::HasReturned) {
            self.slot.clone_value()
        } else {
            None
        }
    }

    pub(crate) fn cell(&self) -> &Rc<CoroutineCell> {
        &self.cell
    }

    pub(crate) fn slot(&self) -> &Rc<ValueSlot<T>> {
        &self.slot
    }

    /// The await-protocol ready check: a null/finished frame, a terminal
    /// status, or a stored return all mean "do not suspend". A `Created`
    /// callee is started here, so awaiting implies starting.
    pub(crate) fn ready_check(&self) -> bool {
        if self.cell.finished() {
            return true;
        }
        CoroutineCell::activate(&self.cell);
        let promise = self.cell.promise();
        if promise.get_status() >= PromiseStatus::Done
            || promise.check_flag(PromiseFlag::HasReturned)
        {
            return true;
        }
        self.cell.finished()
    }
}

impl<T: ErrorValue + 'static> Drop for CallableFuture<T> {
    fn drop(&mut self) {
        let promise = self.cell.promise();
        if std::thread::panicking() {
            // Unwinding: a panicked frame must not be polled again, only
            // freed.
            promise.set_flag(PromiseFlag::Destroying, true);
            drop(self.cell.take_machine());
            return;
        }
        // Drive-to-completion loop: each iteration raises the status to
        // Killed and grants at most one resume. Await adapters refuse to
        // suspend once their caller is terminal, so a cooperative body runs
        // out after a single resume; the loop only repeats across races.
        while !self.cell.finished() && !promise.check_flag(PromiseFlag::HasReturned) {
            if promise.check_flag(PromiseFlag::Destroying) {
                break;
            }
            let mut expected = promise.get_status();
            while expected < PromiseStatus::Done {
                if promise.set_status(PromiseStatus::Killed, Some(&mut expected)) {
                    break;
                }
            }
            let was_finished = self.cell.finished();
            self.cell.resume(&self.cell);
            if self.cell.finished() == was_finished {
                // No progress: the body is parked on something we cannot
                // drive. Fall through to forced destruction.
                break;
            }
        }

        if !self.cell.finished() {
            promise.set_flag(PromiseFlag::Destroying, true);
            // Move the frame to a local first so re-entrant teardown (a
            // nested future whose finalizer reaches back into this cell)
            // finds the handle already gone.
            let machine = self.cell.take_machine();
            drop(machine);
        }
    }
}

impl<T: ErrorValue + 'static> IntoFuture for CallableFuture<T> {
    type Output = T;
    type IntoFuture = AwaitCallable<T>;

    fn into_future(self) -> Self::IntoFuture {
        AwaitCallable {
            future: Some(self),
            registered: None,
        }
    }
}

/// Await adapter created when a [`CallableFuture`] is awaited.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct AwaitCallable<T: ErrorValue + 'static> {
    future: Option<CallableFuture<T>>,
    /// The caller we registered with the callee; present while suspended.
    registered: Option<HandleDelegate>,
}

impl<T: ErrorValue + 'static> AwaitCallable<T> {
    fn future(&self) -> &CallableFuture<T> {
        match self.future.as_ref() {
            Some(future) => future,
            None => panic!("callable awaited after completion"),
        }
    }

    /// The await-resume protocol: detach from the callee (inheriting status
    /// onto a still-in-flight callee), drive the callee's own waiting chain,
    /// then read the result — the stored value if the body returned, the
    /// error transform of the callee's terminal status otherwise.
    fn resolve(&mut self) -> T {
        let callee_delegate = HandleDelegate::from_cell(self.future().cell());
        let caller = self.registered.take();
        {
            let future = self.future();
            let callee = future.cell().promise();
            if let Some(ref caller) = caller {
                callee.remove_caller(caller, true);
                caller.with_promise(|p| p.set_waiting_handle(None));
            }
            if callee.get_status() < PromiseStatus::Done {
                // The await is ending while the callee is still in flight:
                // fix the callee's status so it cannot be resumed as a live
                // peer afterwards.
                let callee_ready = future.cell().finished()
                    || callee.check_flag(PromiseFlag::HasReturned);
                match caller.as_ref().and_then(HandleDelegate::status) {
                    Some(caller_status) if !callee_ready => {
                        callee.set_status(caller_status, None);
                    }
                    _ => {
                        callee.set_status(PromiseStatus::Killed, None);
                    }
                }
            }
            callee.resume_waiting(&callee_delegate, true);
        }

        let future = self.future();
        let callee = future.cell().promise();
        if callee.check_flag(PromiseFlag::HasReturned) {
            match future.slot().take() {
                Some(value) => value,
                None => T::from_status(callee.get_status()),
            }
        } else {
            T::from_status(callee.get_status())
        }
    }
}

impl<T: ErrorValue + 'static> Future for AwaitCallable<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.registered.is_none() {
            let future = this.future();
            if !future.ready_check() {
                let caller = caller_delegate(cx);
                let caller_status = caller.status().unwrap_or(PromiseStatus::Running);
                if caller_status < PromiseStatus::Done {
                    // Suspend: link caller -> callee both ways.
                    let callee_delegate = HandleDelegate::from_cell(future.cell());
                    future.cell().promise().add_caller(caller.clone());
                    caller.with_promise(|p| p.set_waiting_handle(Some(callee_delegate)));
                    this.registered = Some(caller);
                    return Poll::Pending;
                }
                // The caller is already terminal: push the status down onto
                // an interruptible callee, give it one resume to unwind, and
                // decline suspension so control returns synchronously.
                let callee = future.cell().promise();
                if !future.cell().finished()
                    && callee.get_status() < PromiseStatus::Done
                    && callee.check_flag(PromiseFlag::InternalWaiting)
                {
                    callee.set_status(caller_status, None);
                    future.cell().resume(future.cell());
                }
            }
        }
        Poll::Ready(this.resolve())
    }
}

impl<T: ErrorValue + 'static> Drop for AwaitCallable<T> {
    fn drop(&mut self) {
        // Dropped mid-suspend (the caller's frame is being destroyed):
        // unlink; the owned future's drop then runs the full teardown.
        if let Some(caller) = self.registered.take() {
            if let Some(future) = self.future.as_ref() {
                future.cell().promise().remove_caller(&caller, true);
                caller.with_promise(|p| p.set_waiting_handle(None));
            }
        }
    }
}
