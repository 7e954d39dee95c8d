//! `some` / `any` / `all`: await N-of-M futures with early-exit semantics.
//!
//! The combinators accept any mix-free slice of [`Combinable`] futures —
//! callable or generator — and return a [`CallableFuture`] that resolves to
//! the combinator's final status once `ready_count` of them have become
//! ready. Futures that are already ready at entry count immediately; if the
//! threshold is already met, the combinator completes without suspending and
//! without invoking any suspend callback.
//!
//! The `ready_out` list receives the ready futures: items ready at entry in
//! input order, items resolved later in discovery order. Constituents that
//! are still pending when the combinator finishes (threshold met early, or
//! the awaiting coroutine was killed) are detached — they keep running and
//! can be awaited again later, they are simply off the combinator's hook.
//!
//! Re-invoking a combinator over the same futures after it resolved is
//! memoized by construction: every previously readied constituent partitions
//! straight into the ready set, so the second call returns the same result
//! immediately.
//!
//! `any` is `some` with a threshold of 1; `all` is `some` with a threshold
//! of the input length.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::callable::CallableFuture;
use crate::generator::GeneratorFuture;
use crate::promise::{
    caller_delegate, yield_status, CoroutineCell, ErrorValue, HandleDelegate, PromiseFlag,
};
use crate::types::PromiseStatus;

/// A future the combinators can adopt: it can report pendingness and accept
/// or release a registered caller without forcing its own completion.
pub trait Combinable {
    /// True while the future has not produced its value.
    fn is_pending(&self) -> bool;
    /// Registers `caller` to be resumed when this future becomes ready.
    /// Starting a not-yet-started future is part of attaching.
    fn attach_caller(&self, caller: &HandleDelegate);
    /// Unregisters `caller` without affecting this future's own progress.
    fn detach_caller(&self, caller: &HandleDelegate);
}

impl<T: ErrorValue + 'static> Combinable for CallableFuture<T> {
    fn is_pending(&self) -> bool {
        !self.is_ready() && !self.get_status().is_terminal()
    }

    fn attach_caller(&self, caller: &HandleDelegate) {
        CoroutineCell::activate(self.cell());
        self.cell().promise().add_caller(caller.clone());
    }

    fn detach_caller(&self, caller: &HandleDelegate) {
        self.cell().promise().remove_caller(caller, false);
    }
}

impl<T: ErrorValue + Clone + 'static> Combinable for GeneratorFuture<T> {
    fn is_pending(&self) -> bool {
        self.get_context().is_pending()
    }

    fn attach_caller(&self, caller: &HandleDelegate) {
        self.get_context().add_caller(caller.clone());
        self.dispatch_suspend();
    }

    fn detach_caller(&self, caller: &HandleDelegate) {
        self.get_context().remove_caller(caller);
    }
}

/// Shared output list receiving the futures found ready.
pub type ReadyOutput<F> = Rc<RefCell<Vec<Rc<F>>>>;

/// Creates an empty [`ReadyOutput`] list.
#[must_use]
pub fn ready_output<F>() -> ReadyOutput<F> {
    Rc::new(RefCell::new(Vec::new()))
}

struct SomeContext<F> {
    pending: Vec<Rc<F>>,
    ready: Vec<Rc<F>>,
    ready_bound: usize,
    scan_bound: usize,
    status: PromiseStatus,
    /// The combinator coroutine's own delegate, registered with every
    /// pending constituent. Set once, on first suspension.
    caller: Option<HandleDelegate>,
}

/// Moves every no-longer-pending constituent into the ready set, detaching
/// the combinator's registration from it. Preserves discovery order.
fn scan_ready<F: Combinable>(ctx: &mut SomeContext<F>) {
    let caller = ctx.caller.clone();
    let mut index = 0;
    while index < ctx.pending.len() {
        if ctx.pending[index].is_pending() {
            index += 1;
            continue;
        }
        let future = ctx.pending.remove(index);
        if let Some(ref caller) = caller {
            future.detach_caller(caller);
        }
        ctx.ready.push(future);
    }
}

/// One wake-up's worth of bookkeeping: count it, and once enough wake-ups
/// accumulated to possibly satisfy the bound, do a full scan and decide.
fn on_wake<F: Combinable>(context: &Rc<RefCell<SomeContext<F>>>) {
    let mut ctx = context.borrow_mut();
    ctx.scan_bound += 1;
    if ctx.scan_bound >= ctx.ready_bound {
        scan_ready(&mut ctx);
        ctx.scan_bound = ctx.ready.len();
        if ctx.scan_bound >= ctx.ready_bound && ctx.status < PromiseStatus::Done {
            ctx.status = PromiseStatus::Done;
        }
    }
}

/// Detaches all still-pending constituents when the combinator coroutine
/// unwinds, normally or by kill.
struct DetachGuard<F: Combinable> {
    context: Rc<RefCell<SomeContext<F>>>,
}

impl<F: Combinable> Drop for DetachGuard<F> {
    fn drop(&mut self) {
        let mut ctx = self.context.borrow_mut();
        if let Some(caller) = ctx.caller.take() {
            for future in &ctx.pending {
                future.detach_caller(&caller);
            }
            if ctx.status < PromiseStatus::Done {
                if let Some(status) = caller.status() {
                    ctx.status = status;
                }
            }
        }
        if ctx.status < PromiseStatus::Done {
            ctx.status = PromiseStatus::Killed;
        }
    }
}

/// The combinator's internal await point: pends until enough constituents
/// have reported in (or the combinator coroutine itself goes terminal).
struct SomeAwait<F: Combinable> {
    context: Rc<RefCell<SomeContext<F>>>,
    registered: Option<HandleDelegate>,
}

impl<F: Combinable> Future for SomeAwait<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(caller) = this.registered.take() {
            // Woken: one more constituent (probably) became ready, or the
            // combinator was killed. Either way, account and return.
            caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, false));
            on_wake(&this.context);
            return Poll::Ready(());
        }

        {
            let ctx = this.context.borrow();
            if ctx.status >= PromiseStatus::Done || ctx.pending.is_empty() {
                return Poll::Ready(());
            }
        }

        let caller = caller_delegate(cx);
        let caller_status = caller.status().unwrap_or(PromiseStatus::Running);
        if caller_status >= PromiseStatus::Done {
            return Poll::Ready(());
        }
        caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, true));
        this.registered = Some(caller.clone());

        let need_attach = {
            let mut ctx = this.context.borrow_mut();
            if ctx.caller.is_none() {
                ctx.caller = Some(caller.clone());
                true
            } else {
                false
            }
        };
        if need_attach {
            // Attach outside the borrow: callbacks may re-enter the context.
            let targets = this.context.borrow().pending.clone();
            for future in &targets {
                future.attach_caller(&caller);
            }
            // Attaching may resolve constituents synchronously; their wake
            // could not reach us mid-poll, so account for them here.
            let resolved = this
                .context
                .borrow()
                .pending
                .iter()
                .filter(|future| !future.is_pending())
                .count();
            for _ in 0..resolved {
                on_wake(&this.context);
            }
            if this.context.borrow().status >= PromiseStatus::Done {
                this.registered = None;
                caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, false));
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

/// Awaits the given futures until `ready_count` of them are ready.
///
/// Returns a [`CallableFuture`] resolving to the final combinator status:
/// `Done` when the threshold was met, or the killer's terminal status when
/// the awaiting coroutine was torn down first. `ready_out` receives the
/// ready futures in the order described in the module docs.
pub fn some<F: Combinable + 'static>(
    ready_out: ReadyOutput<F>,
    ready_count: usize,
    futures: &[Rc<F>],
) -> CallableFuture<PromiseStatus> {
    let futures: Vec<Rc<F>> = futures.to_vec();
    CallableFuture::new(async move {
        let mut setup = SomeContext {
            pending: Vec::new(),
            ready: Vec::with_capacity(futures.len()),
            ready_bound: 0,
            scan_bound: 0,
            status: PromiseStatus::Created,
            caller: None,
        };
        for future in futures {
            if future.is_pending() {
                setup.pending.push(future);
            } else {
                setup.ready.push(future);
            }
        }

        if setup.ready.len() >= ready_count {
            *ready_out.borrow_mut() = setup.ready;
            return PromiseStatus::Done;
        }

        let bound = ready_count.min(setup.pending.len() + setup.ready.len());
        setup.ready_bound = bound;
        setup.scan_bound = setup.ready.len();
        setup.status = PromiseStatus::Running;
        let context = Rc::new(RefCell::new(setup));

        {
            let _guard = DetachGuard {
                context: Rc::clone(&context),
            };
            loop {
                if context.borrow().status >= PromiseStatus::Done {
                    break;
                }
                // Killed by the caller: adopt the terminal status and stop.
                let current = yield_status().await;
                if current >= PromiseStatus::Done {
                    context.borrow_mut().status = current;
                    break;
                }
                SomeAwait {
                    context: Rc::clone(&context),
                    registered: None,
                }
                .await;
            }
        }

        let ready = core::mem::take(&mut context.borrow_mut().ready);
        *ready_out.borrow_mut() = ready;
        let status = context.borrow().status;
        status
    })
}

/// Awaits until any one of the given futures is ready.
pub fn any<F: Combinable + 'static>(
    ready_out: ReadyOutput<F>,
    futures: &[Rc<F>],
) -> CallableFuture<PromiseStatus> {
    some(ready_out, 1, futures)
}

/// Awaits until every one of the given futures is ready.
pub fn all<F: Combinable + 'static>(
    ready_out: ReadyOutput<F>,
    futures: &[Rc<F>],
) -> CallableFuture<PromiseStatus> {
    some(ready_out, futures.len(), futures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_generators(values: &[i64]) -> Vec<Rc<GeneratorFuture<i64>>> {
        values
            .iter()
            .map(|_| Rc::new(GeneratorFuture::new(|_| {})))
            .collect()
    }

    #[test]
    fn all_ready_at_entry_completes_without_suspending() {
        let futures = pending_generators(&[1, 2]);
        futures[0].get_context().set_value(1);
        futures[1].get_context().set_value(2);
        let ready = ready_output();
        let combined = some(Rc::clone(&ready), 2, &futures);
        combined.start();
        assert_eq!(combined.get_status(), PromiseStatus::Done);
        assert_eq!(combined.value(), Some(PromiseStatus::Done));
        assert_eq!(ready.borrow().len(), 2);
    }

    #[test]
    fn threshold_met_after_two_resolutions() {
        let futures = pending_generators(&[471, 473, 477]);
        let ready = ready_output();
        let combined = some(Rc::clone(&ready), 2, &futures);
        combined.start();
        assert!(!combined.is_ready());

        futures[0].get_context().set_value(471);
        assert!(!combined.is_ready());
        futures[1].get_context().set_value(473);
        assert!(combined.is_ready());
        assert_eq!(combined.value(), Some(PromiseStatus::Done));

        assert_eq!(ready.borrow().len(), 2);
        let sum: i64 = ready
            .borrow()
            .iter()
            .filter_map(|f| f.get_context().peek())
            .sum();
        assert_eq!(1 + sum, 945);
        // The third constituent is untouched and still pending.
        assert!(futures[2].is_pending());
        assert!(!futures[2].get_context().has_callers());
    }

    #[test]
    fn any_is_some_with_threshold_one() {
        let futures = pending_generators(&[7, 8]);
        let ready = ready_output();
        let combined = any(Rc::clone(&ready), &futures);
        combined.start();
        futures[1].get_context().set_value(8);
        assert!(combined.is_ready());
        assert_eq!(ready.borrow().len(), 1);
        assert_eq!(ready.borrow()[0].get_context().peek(), Some(8));
    }

    #[test]
    fn all_waits_for_every_future() {
        let futures = pending_generators(&[1, 2, 3]);
        let ready = ready_output();
        let combined = all(Rc::clone(&ready), &futures);
        combined.start();
        futures[0].get_context().set_value(1);
        futures[2].get_context().set_value(3);
        assert!(!combined.is_ready());
        futures[1].get_context().set_value(2);
        assert!(combined.is_ready());
        assert_eq!(ready.borrow().len(), 3);
    }

    #[test]
    fn repeated_invocation_is_memoized() {
        let suspend_count = Rc::new(std::cell::Cell::new(0));
        let futures: Vec<Rc<GeneratorFuture<i64>>> = (0..2)
            .map(|_| {
                let count = Rc::clone(&suspend_count);
                Rc::new(GeneratorFuture::new(move |_| count.set(count.get() + 1)))
            })
            .collect();

        let ready = ready_output();
        let first = some(Rc::clone(&ready), 2, &futures);
        first.start();
        assert_eq!(suspend_count.get(), 2);
        futures[0].get_context().set_value(1);
        futures[1].get_context().set_value(2);
        assert_eq!(first.value(), Some(PromiseStatus::Done));
        let first_ready: Vec<i64> = ready
            .borrow()
            .iter()
            .filter_map(|f| f.get_context().peek())
            .collect();

        // A second pass over the same futures resolves immediately: same
        // output, same status, and no suspend callback is re-dispatched.
        let second = some(Rc::clone(&ready), 2, &futures);
        second.start();
        assert_eq!(second.value(), Some(PromiseStatus::Done));
        let second_ready: Vec<i64> = ready
            .borrow()
            .iter()
            .filter_map(|f| f.get_context().peek())
            .collect();
        assert_eq!(first_ready, second_ready);
        assert_eq!(suspend_count.get(), 2);
    }

    #[test]
    fn combinator_over_callable_futures() {
        let futures = vec![
            Rc::new(CallableFuture::new(async { 5i32 })),
            Rc::new(CallableFuture::new(async { 6i32 })),
        ];
        let ready = ready_output();
        let combined = all(Rc::clone(&ready), &futures);
        combined.start();
        // Attaching started both bodies; they completed synchronously.
        assert_eq!(combined.value(), Some(PromiseStatus::Done));
        assert_eq!(ready.borrow().len(), 2);
        let sum: i32 = ready.borrow().iter().filter_map(|f| f.value()).sum();
        assert_eq!(sum, 11);
    }

    #[test]
    fn zero_threshold_completes_immediately() {
        let futures = pending_generators(&[1]);
        let ready = ready_output();
        let combined = some(Rc::clone(&ready), 0, &futures);
        combined.start();
        assert_eq!(combined.value(), Some(PromiseStatus::Done));
        assert!(ready.borrow().is_empty());
        assert!(futures[0].is_pending());
    }
}
