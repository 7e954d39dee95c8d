//! Promise state, caller linkage, and the poll-driven coroutine frame.
//!
//! Every stackless coroutine in this crate is a [`CoroutineCell`]: an async
//! state machine paired with a [`PromiseBase`] that tracks status, flags, the
//! handle this coroutine is itself suspended on, and the set of callers
//! suspended on *it*. "Resuming" a coroutine means polling its state machine
//! once; suspended await adapters re-examine the linkage on every poll, so a
//! single resume is enough to drive a kill or a completion through an entire
//! caller/callee chain.
//!
//! Cells are shared through `Rc` and are deliberately not `Send`: the
//! stackless core is single-threaded by construction, which is the
//! type-enforced form of a disable-locking build switch. Status cells stay
//! atomic so the ordering contract is uniform with the stackful side.

pub mod error_value;

use core::fmt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::types::{AtomicStatusCell, PromiseStatus};

pub use error_value::ErrorValue;

/// Boolean flags carried by a promise next to its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PromiseFlag {
    /// The owning future is tearing the coroutine down; resumes are refused.
    Destroying = 1 << 0,
    /// The coroutine frame ran to its end and callers have been notified.
    FinalSuspend = 1 << 1,
    /// Suspended on an external event (generator or combinator); a
    /// status-inheriting kill may force-resume it safely.
    InternalWaiting = 1 << 2,
    /// The body executed its normal return path; the value slot is fixed.
    HasReturned = 1 << 3,
}

/// A non-owning reference to a suspended continuation.
///
/// Frame delegates point at in-crate coroutine cells; external delegates wrap
/// a [`Waker`] so futures from this crate can also be awaited under a foreign
/// executor (the host's "poller/waker interface" integration path).
#[derive(Clone)]
pub struct HandleDelegate {
    kind: DelegateKind,
}

#[derive(Clone)]
enum DelegateKind {
    Frame(Weak<CoroutineCell>),
    External(Waker),
}

impl HandleDelegate {
    pub(crate) fn from_cell(cell: &Rc<CoroutineCell>) -> Self {
        Self {
            kind: DelegateKind::Frame(Rc::downgrade(cell)),
        }
    }

    pub(crate) fn external(waker: Waker) -> Self {
        Self {
            kind: DelegateKind::External(waker),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<CoroutineCell>> {
        match &self.kind {
            DelegateKind::Frame(weak) => weak.upgrade(),
            DelegateKind::External(_) => None,
        }
    }

    /// True when both delegates refer to the same continuation.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (DelegateKind::Frame(a), DelegateKind::Frame(b)) => Weak::ptr_eq(a, b),
            (DelegateKind::External(a), DelegateKind::External(b)) => a.will_wake(b),
            _ => false,
        }
    }

    /// True when the referenced coroutine has finished or vanished.
    /// External delegates are never considered done.
    #[must_use]
    pub fn done(&self) -> bool {
        match &self.kind {
            DelegateKind::Frame(weak) => weak.upgrade().is_none_or(|cell| cell.finished()),
            DelegateKind::External(_) => false,
        }
    }

    /// Status of the referenced promise; `None` for external delegates.
    #[must_use]
    pub fn status(&self) -> Option<PromiseStatus> {
        self.upgrade().map(|cell| cell.promise().get_status())
    }

    /// Resumes the referenced continuation: polls a frame, wakes a waker.
    pub fn resume(&self) {
        match &self.kind {
            DelegateKind::Frame(weak) => {
                if let Some(cell) = weak.upgrade() {
                    cell.resume(&cell);
                }
            }
            DelegateKind::External(waker) => waker.wake_by_ref(),
        }
    }

    /// Runs `op` against the referenced promise, if it still exists.
    pub(crate) fn with_promise<R>(&self, op: impl FnOnce(&PromiseBase) -> R) -> Option<R> {
        self.upgrade().map(|cell| op(cell.promise()))
    }
}

impl fmt::Debug for HandleDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DelegateKind::Frame(weak) => write!(f, "HandleDelegate(frame:{:p})", weak.as_ptr()),
            DelegateKind::External(_) => write!(f, "HandleDelegate(external)"),
        }
    }
}

/// Registry of continuations suspended awaiting one promise or context.
///
/// Zero or one entries is the overwhelmingly common case, so the single
/// caller is stored inline; fan-out (several await sites on one future)
/// spills to the heap.
#[derive(Default)]
pub(crate) struct CallerManager {
    callers: SmallVec<[HandleDelegate; 1]>,
}

impl CallerManager {
    /// Registers a caller. Re-registering the same continuation after a
    /// resume is a fresh registration; duplicates collapse to one entry.
    pub(crate) fn add_caller(&mut self, delegate: HandleDelegate) {
        if delegate.done() {
            return;
        }
        if self.callers.iter().any(|c| c.same_target(&delegate)) {
            return;
        }
        self.callers.push(delegate);
    }

    /// Removes a caller; returns whether it was registered.
    pub(crate) fn remove_caller(&mut self, delegate: &HandleDelegate) -> bool {
        let before = self.callers.len();
        self.callers.retain(|c| !c.same_target(delegate));
        self.callers.len() != before
    }

    /// Drains the registry, returning the delegates to resume.
    pub(crate) fn drain(&mut self) -> SmallVec<[HandleDelegate; 1]> {
        core::mem::take(&mut self.callers)
    }

    pub(crate) fn has_multiple_callers(&self) -> bool {
        self.callers.len() > 1
    }

    pub(crate) fn len(&self) -> usize {
        self.callers.len()
    }
}

impl fmt::Debug for CallerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerManager")
            .field("callers", &self.callers.len())
            .finish()
    }
}

/// Status, flags, waiting handle, and caller registry of one coroutine.
#[derive(Debug)]
pub(crate) struct PromiseBase {
    status: AtomicStatusCell<PromiseStatus>,
    flags: Cell<u8>,
    /// The continuation this promise is itself suspended on, if any. Used to
    /// propagate a kill downward through a caller/callee chain.
    waiting: RefCell<Option<HandleDelegate>>,
    callers: RefCell<CallerManager>,
}

impl PromiseBase {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicStatusCell::new(PromiseStatus::Created),
            flags: Cell::new(0),
            waiting: RefCell::new(None),
            callers: RefCell::new(CallerManager::default()),
        }
    }

    pub(crate) fn get_status(&self) -> PromiseStatus {
        self.status.get_status()
    }

    /// See [`AtomicStatusCell::set_status`] for the CAS write-back contract.
    pub(crate) fn set_status(
        &self,
        value: PromiseStatus,
        expected: Option<&mut PromiseStatus>,
    ) -> bool {
        self.status.set_status(value, expected)
    }

    pub(crate) fn check_flag(&self, flag: PromiseFlag) -> bool {
        self.flags.get() & flag as u8 != 0
    }

    pub(crate) fn set_flag(&self, flag: PromiseFlag, value: bool) {
        let bits = self.flags.get();
        if value {
            self.flags.set(bits | flag as u8);
        } else {
            self.flags.set(bits & !(flag as u8));
        }
    }

    /// True when this promise is known to be suspended on something — it
    /// recorded a waiting handle (callable await) or flagged itself as
    /// internally waiting (generator/combinator await) — and is therefore
    /// safe to force-resume.
    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.borrow().is_some() || self.check_flag(PromiseFlag::InternalWaiting)
    }

    pub(crate) fn set_waiting_handle(&self, handle: Option<HandleDelegate>) {
        *self.waiting.borrow_mut() = handle;
    }

    pub(crate) fn add_caller(&self, delegate: HandleDelegate) {
        self.callers.borrow_mut().add_caller(delegate);
    }

    /// Removes `delegate` from the caller set. With `inherit_status`, a
    /// still-in-flight promise adopts the removed caller's terminal status —
    /// "my awaiter was killed, so I must stop too". Plain `Done` does not
    /// inherit; only the abnormal terminals propagate.
    pub(crate) fn remove_caller(&self, delegate: &HandleDelegate, inherit_status: bool) {
        let removed = self.callers.borrow_mut().remove_caller(delegate);
        if removed && inherit_status {
            if let Some(caller_status) = delegate.status() {
                if self.get_status() < PromiseStatus::Done && caller_status > PromiseStatus::Done {
                    self.set_status(caller_status, None);
                }
            }
        }
    }

    /// Raises the status to `Done` unless an abnormal terminal already won.
    pub(crate) fn raise_done(&self) {
        let mut expected = self.get_status();
        while expected < PromiseStatus::Done {
            if self.set_status(PromiseStatus::Done, Some(&mut expected)) {
                break;
            }
        }
    }

    /// Resumes whatever this promise is suspended on, after detaching
    /// `current` (this promise's own delegate) from it. Drives a terminal
    /// status down the chain: the waited-on promise inherits `current`'s
    /// status, then gets one resume to observe it.
    pub(crate) fn resume_waiting(&self, current: &HandleDelegate, inherit_status: bool) {
        let waiting = self.waiting.borrow_mut().take();
        if let Some(target) = waiting {
            if !target.done() {
                if let Some(cell) = target.upgrade() {
                    cell.promise().remove_caller(current, inherit_status);
                    cell.resume(&cell);
                }
            }
        }
    }

    /// Drains the caller set and resumes every entry. Called exactly once
    /// per completion or finalization cycle.
    pub(crate) fn resume_callers(&self) {
        let drained = self.callers.borrow_mut().drain();
        for caller in drained {
            if !caller.done() {
                caller.resume();
            }
        }
    }
}

/// One stackless coroutine: an async state machine plus its promise.
pub(crate) struct CoroutineCell {
    promise: PromiseBase,
    machine: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    finished: Cell<bool>,
}

impl CoroutineCell {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            promise: PromiseBase::new(),
            machine: RefCell::new(None),
            finished: Cell::new(false),
        })
    }

    pub(crate) fn install(&self, machine: Pin<Box<dyn Future<Output = ()>>>) {
        *self.machine.borrow_mut() = Some(machine);
    }

    pub(crate) fn promise(&self) -> &PromiseBase {
        &self.promise
    }

    /// True once the state machine ran to its end (or was force-destroyed).
    pub(crate) fn finished(&self) -> bool {
        self.finished.get()
    }

    /// Polls the state machine once. Reentrant resumes of a frame that is
    /// already mid-poll are no-ops, as are resumes of finished or
    /// being-destroyed frames.
    pub(crate) fn resume(&self, this: &Rc<Self>) {
        if self.finished.get() || self.promise.check_flag(PromiseFlag::Destroying) {
            return;
        }

        let ready = {
            let Ok(mut slot) = self.machine.try_borrow_mut() else {
                return;
            };
            let Some(machine) = slot.as_mut() else {
                return;
            };
            let _frame = ActiveFrameGuard::push(this);
            let mut cx = Context::from_waker(Waker::noop());
            machine.as_mut().poll(&mut cx).is_ready()
        };

        if ready {
            self.finished.set(true);
            // Free the frame before notifying callers; anything the frame
            // still owned is torn down first, exactly like end-of-body
            // destruction.
            let machine = self.machine.borrow_mut().take();
            drop(machine);
            self.promise.set_flag(PromiseFlag::FinalSuspend, true);
            self.promise.resume_callers();
        }
    }

    /// Transitions `Created -> Running` and gives the body its first run.
    /// Safe to call repeatedly; only the first call does anything.
    pub(crate) fn activate(this: &Rc<Self>) {
        let mut expected = PromiseStatus::Created;
        if this
            .promise
            .set_status(PromiseStatus::Running, Some(&mut expected))
        {
            this.resume(this);
        }
    }

    /// Removes the state machine for forced destruction; the cell refuses
    /// all further resumes once its `Destroying` flag is set.
    pub(crate) fn take_machine(&self) -> Option<Pin<Box<dyn Future<Output = ()>>>> {
        self.machine.borrow_mut().take()
    }
}

impl fmt::Debug for CoroutineCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineCell")
            .field("status", &self.promise.get_status())
            .field("finished", &self.finished.get())
            .finish()
    }
}

thread_local! {
    /// Stack of coroutine frames currently being polled on this thread. The
    /// top entry is the frame whose body is executing right now; await
    /// adapters use it to identify their caller.
    static ACTIVE_FRAMES: RefCell<Vec<Weak<CoroutineCell>>> = const { RefCell::new(Vec::new()) };
}

struct ActiveFrameGuard;

impl ActiveFrameGuard {
    fn push(cell: &Rc<CoroutineCell>) -> Self {
        ACTIVE_FRAMES.with(|frames| frames.borrow_mut().push(Rc::downgrade(cell)));
        Self
    }
}

impl Drop for ActiveFrameGuard {
    fn drop(&mut self) {
        ACTIVE_FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Delegate for the coroutine currently executing on this thread, if any.
pub(crate) fn current_frame() -> Option<HandleDelegate> {
    ACTIVE_FRAMES.with(|frames| {
        frames.borrow().last().map(|weak| HandleDelegate {
            kind: DelegateKind::Frame(weak.clone()),
        })
    })
}

/// The caller of an await adapter: the active in-crate frame when present,
/// otherwise an external delegate wrapping the driving executor's waker.
pub(crate) fn caller_delegate(cx: &Context<'_>) -> HandleDelegate {
    current_frame().unwrap_or_else(|| HandleDelegate::external(cx.waker().clone()))
}

/// Awaitable that reports the awaiting coroutine's own status.
///
/// Never suspends. A coroutine that was killed while suspended uses this
/// after an await returns to learn why it was woken:
///
/// ```ignore
/// let status = yield_status().await;
/// if status.is_terminal() {
///     // run cleanup, then return
/// }
/// ```
#[derive(Debug, Default)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldStatus;

impl Future for YieldStatus {
    type Output = PromiseStatus;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let status = current_frame()
            .and_then(|frame| frame.status())
            .unwrap_or(PromiseStatus::Running);
        Poll::Ready(status)
    }
}

/// Reads the current coroutine's status without suspending.
pub fn yield_status() -> YieldStatus {
    YieldStatus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_cell() -> Rc<CoroutineCell> {
        let cell = CoroutineCell::new();
        cell.install(Box::pin(async {}));
        cell
    }

    #[test]
    fn flags_set_and_clear() {
        let promise = PromiseBase::new();
        assert!(!promise.check_flag(PromiseFlag::Destroying));
        promise.set_flag(PromiseFlag::Destroying, true);
        promise.set_flag(PromiseFlag::HasReturned, true);
        assert!(promise.check_flag(PromiseFlag::Destroying));
        assert!(promise.check_flag(PromiseFlag::HasReturned));
        promise.set_flag(PromiseFlag::Destroying, false);
        assert!(!promise.check_flag(PromiseFlag::Destroying));
        assert!(promise.check_flag(PromiseFlag::HasReturned));
    }

    #[test]
    fn caller_registration_is_idempotent() {
        let cell = dummy_cell();
        let mut manager = CallerManager::default();
        manager.add_caller(HandleDelegate::from_cell(&cell));
        manager.add_caller(HandleDelegate::from_cell(&cell));
        assert_eq!(manager.len(), 1);
        assert!(manager.remove_caller(&HandleDelegate::from_cell(&cell)));
        assert_eq!(manager.len(), 0);
        assert!(!manager.remove_caller(&HandleDelegate::from_cell(&cell)));
    }

    #[test]
    fn fan_out_supports_multiple_callers() {
        let a = dummy_cell();
        let b = dummy_cell();
        let mut manager = CallerManager::default();
        manager.add_caller(HandleDelegate::from_cell(&a));
        manager.add_caller(HandleDelegate::from_cell(&b));
        assert!(manager.has_multiple_callers());
        assert_eq!(manager.drain().len(), 2);
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn inherit_status_adopts_abnormal_terminal_only() {
        let killed_caller = dummy_cell();
        killed_caller
            .promise()
            .set_status(PromiseStatus::Killed, None);

        let callee = PromiseBase::new();
        let delegate = HandleDelegate::from_cell(&killed_caller);
        callee.add_caller(delegate.clone());
        callee.remove_caller(&delegate, true);
        assert_eq!(callee.get_status(), PromiseStatus::Killed);

        // A caller that finished normally does not overwrite the callee.
        let done_caller = dummy_cell();
        done_caller.promise().set_status(PromiseStatus::Done, None);
        let callee = PromiseBase::new();
        let delegate = HandleDelegate::from_cell(&done_caller);
        callee.add_caller(delegate.clone());
        callee.remove_caller(&delegate, true);
        assert_eq!(callee.get_status(), PromiseStatus::Created);
    }

    #[test]
    fn delegate_done_tracks_cell_lifetime() {
        let cell = dummy_cell();
        let delegate = HandleDelegate::from_cell(&cell);
        assert!(!delegate.done());
        drop(cell);
        assert!(delegate.done());
    }

    #[test]
    fn resume_runs_machine_to_completion() {
        let cell = CoroutineCell::new();
        cell.install(Box::pin(async {}));
        cell.resume(&cell);
        assert!(cell.finished());
        assert!(cell.promise().check_flag(PromiseFlag::FinalSuspend));
    }
}
