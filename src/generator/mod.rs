//! The generator future: a future resolved by an external actor rather than
//! by an inner coroutine's return.
//!
//! A [`GeneratorFuture`] bridges external async events into the coroutine
//! world. Awaiting it registers the awaiting coroutine with the generator's
//! shared [`GeneratorContext`] and dispatches the user's suspend callback
//! exactly once per armed cycle; the external actor later calls
//! [`GeneratorContext::set_value`], which stores the value and wakes every
//! registered caller.
//!
//! Unlike a callable future, a generator may legitimately be awaited from
//! several coroutines at once (broadcast fan-out). The resolved value stays
//! stored in the context and every reader receives a clone, so value types
//! must be `Clone`; wrap move-only payloads in `Rc`.
//!
//! The await adapter releases its strong reference to the context while
//! suspended. If the last strong reference is dropped before `set_value`,
//! the context auto-resolves to the error transform of `Killed` and wakes
//! all callers — no awaiter is ever left suspended because the generator
//! vanished.

use std::cell::{Cell, RefCell};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::poller::Poller;
use crate::promise::{caller_delegate, CallerManager, ErrorValue, HandleDelegate, PromiseFlag};
use crate::types::PromiseStatus;

type SuspendCallback<T> = dyn Fn(&Rc<GeneratorContext<T>>);
type ResumeCallback<T> = dyn Fn(&GeneratorContext<T>);

/// Shared resolution state of a generator: the value slot plus the registry
/// of coroutines currently awaiting it.
pub struct GeneratorContext<T: ErrorValue + Clone + 'static> {
    data: RefCell<Poller<T>>,
    callers: RefCell<CallerManager>,
    suspend_dispatched: Cell<bool>,
    resume_dispatched: Cell<bool>,
}

impl<T: ErrorValue + Clone + 'static> GeneratorContext<T> {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(Poller::pending()),
            callers: RefCell::new(CallerManager::default()),
            suspend_dispatched: Cell::new(false),
            resume_dispatched: Cell::new(false),
        })
    }

    /// True once a value has been stored.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.data.borrow().is_ready()
    }

    /// True while no value has been stored.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.data.borrow().is_pending()
    }

    /// Stores the resolved value and wakes every registered caller.
    pub fn set_value(&self, value: T) {
        self.data.borrow_mut().reset_ready(value);
        self.wake();
    }

    /// Clears the value and re-arms the callback cycle, so the generator can
    /// be awaited (and resolved) again.
    pub fn reset_value(&self) {
        self.data.borrow_mut().reset();
        self.suspend_dispatched.set(false);
        self.resume_dispatched.set(false);
    }

    /// Clones the stored value, if resolved.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.data.borrow().data().cloned()
    }

    pub(crate) fn add_caller(&self, delegate: HandleDelegate) {
        self.callers.borrow_mut().add_caller(delegate);
    }

    pub(crate) fn remove_caller(&self, delegate: &HandleDelegate) {
        self.callers.borrow_mut().remove_caller(delegate);
    }

    /// True while at least one coroutine is awaiting this generator.
    #[must_use]
    pub fn has_callers(&self) -> bool {
        self.callers.borrow().len() > 0
    }

    /// True while several coroutines are awaiting this generator at once.
    #[must_use]
    pub fn has_multiple_callers(&self) -> bool {
        self.callers.borrow().has_multiple_callers()
    }

    pub(crate) fn wake(&self) {
        let drained = self.callers.borrow_mut().drain();
        for caller in drained {
            if !caller.done() {
                caller.resume();
            }
        }
    }

    fn arm_suspend(&self) -> bool {
        !self.suspend_dispatched.replace(true)
    }

    fn arm_resume(&self) -> bool {
        !self.resume_dispatched.replace(true)
    }
}

impl<T: ErrorValue + Clone + 'static> Drop for GeneratorContext<T> {
    fn drop(&mut self) {
        // Destroyed while pending: auto-resolve so no awaiter hangs forever.
        if self.data.borrow().is_pending() {
            crate::tracing_compat::debug!("generator context dropped while pending");
            self.data
                .borrow_mut()
                .reset_ready(T::from_status(PromiseStatus::Killed));
        }
        self.wake();
    }
}

impl<T: ErrorValue + Clone + 'static> core::fmt::Debug for GeneratorContext<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GeneratorContext")
            .field("ready", &self.is_ready())
            .field("callers", &self.callers.borrow().len())
            .finish()
    }
}

/// A future whose value is supplied externally through callback hooks.
pub struct GeneratorFuture<T: ErrorValue + Clone + 'static> {
    context: Rc<GeneratorContext<T>>,
    on_suspend: Option<Rc<SuspendCallback<T>>>,
    on_resume: Option<Rc<ResumeCallback<T>>>,
}

impl<T: ErrorValue + Clone + 'static> GeneratorFuture<T> {
    /// Creates a generator whose suspend callback is invoked once per armed
    /// cycle, when the first awaiter suspends. The callback receives the
    /// shared context; external code clones it and calls
    /// [`GeneratorContext::set_value`] when the event completes.
    pub fn new(on_suspend: impl Fn(&Rc<GeneratorContext<T>>) + 'static) -> Self {
        Self {
            context: GeneratorContext::new(),
            on_suspend: Some(Rc::new(on_suspend)),
            on_resume: None,
        }
    }

    /// Creates a generator with both suspend and resume hooks; the resume
    /// hook fires once per cycle when the first awaiter detaches.
    pub fn with_callbacks(
        on_suspend: impl Fn(&Rc<GeneratorContext<T>>) + 'static,
        on_resume: impl Fn(&GeneratorContext<T>) + 'static,
    ) -> Self {
        Self {
            context: GeneratorContext::new(),
            on_suspend: Some(Rc::new(on_suspend)),
            on_resume: Some(Rc::new(on_resume)),
        }
    }

    /// True once the generator has been resolved.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.context.is_ready()
    }

    /// True while the generator has not been resolved.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.context.is_pending()
    }

    /// `Done` once resolved, `Running` otherwise.
    #[must_use]
    pub fn get_status(&self) -> PromiseStatus {
        if self.context.is_ready() {
            PromiseStatus::Done
        } else {
            PromiseStatus::Running
        }
    }

    /// The shared resolution context.
    #[must_use]
    pub fn get_context(&self) -> &Rc<GeneratorContext<T>> {
        &self.context
    }

    pub(crate) fn dispatch_suspend(&self) {
        if self.context.arm_suspend() {
            if let Some(callback) = &self.on_suspend {
                callback(&self.context);
            }
        }
    }

    pub(crate) fn dispatch_resume(&self) {
        if self.context.arm_resume() {
            if let Some(callback) = &self.on_resume {
                callback(&self.context);
            }
        }
    }
}

impl<T: ErrorValue + Clone + 'static> Clone for GeneratorFuture<T> {
    fn clone(&self) -> Self {
        Self {
            context: Rc::clone(&self.context),
            on_suspend: self.on_suspend.clone(),
            on_resume: self.on_resume.clone(),
        }
    }
}

impl<T: ErrorValue + Clone + 'static> core::fmt::Debug for GeneratorFuture<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GeneratorFuture")
            .field("context", &self.context)
            .finish()
    }
}

impl<T: ErrorValue + Clone + 'static> IntoFuture for GeneratorFuture<T> {
    type Output = T;
    type IntoFuture = AwaitGenerator<T>;

    fn into_future(self) -> Self::IntoFuture {
        AwaitGenerator {
            context: Rc::downgrade(&self.context),
            keep_alive: Some(Rc::clone(&self.context)),
            on_suspend: self.on_suspend.clone(),
            on_resume: self.on_resume.clone(),
            registered: None,
        }
    }
}

impl<T: ErrorValue + Clone + 'static> IntoFuture for &GeneratorFuture<T> {
    type Output = T;
    type IntoFuture = AwaitGenerator<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

/// Await adapter for a generator future.
///
/// Holds the context weakly while suspended, so external ownership alone
/// decides the generator's lifetime.
#[must_use = "futures do nothing unless awaited"]
pub struct AwaitGenerator<T: ErrorValue + Clone + 'static> {
    context: Weak<GeneratorContext<T>>,
    keep_alive: Option<Rc<GeneratorContext<T>>>,
    on_suspend: Option<Rc<SuspendCallback<T>>>,
    on_resume: Option<Rc<ResumeCallback<T>>>,
    registered: Option<HandleDelegate>,
}

impl<T: ErrorValue + Clone + 'static> AwaitGenerator<T> {
    /// Detach and read out, mirroring the callable await-resume protocol:
    /// clear `InternalWaiting` on the caller, adopt the caller's status when
    /// the context is not ready (the awaiter was killed), unregister, fire
    /// the resume hook, then clone the value or synthesize the error
    /// placeholder.
    fn resolve(&mut self, context: Option<Rc<GeneratorContext<T>>>) -> T {
        let Some(context) = context else {
            // The generator vanished; its drop stored the Killed transform.
            if let Some(caller) = self.registered.take() {
                caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, false));
            }
            return T::from_status(PromiseStatus::Killed);
        };

        let mut result_status = if context.is_ready() {
            PromiseStatus::Done
        } else {
            PromiseStatus::Killed
        };

        if let Some(caller) = self.registered.take() {
            caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, false));
            if !context.is_ready() {
                if let Some(caller_status) = caller.status() {
                    result_status = caller_status;
                }
            }
            context.remove_caller(&caller);
            if self.on_resume.is_some() && context.arm_resume() {
                if let Some(callback) = &self.on_resume {
                    callback(&context);
                }
            }
        }

        if result_status != PromiseStatus::Done {
            return T::from_status(result_status);
        }
        match context.peek() {
            Some(value) => value,
            None => T::from_status(PromiseStatus::Killed),
        }
    }
}

impl<T: ErrorValue + Clone + 'static> Future for AwaitGenerator<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(context) = this.context.upgrade().or_else(|| this.keep_alive.clone()) else {
            return Poll::Ready(this.resolve(None));
        };

        // Woken (value arrived or the caller was killed), already resolved,
        // or the caller is already terminal and suspension is declined.
        if this.registered.is_some() || context.is_ready() {
            return Poll::Ready(this.resolve(Some(context)));
        }
        let caller = caller_delegate(cx);
        let caller_status = caller.status().unwrap_or(PromiseStatus::Running);
        if caller_status >= PromiseStatus::Done {
            return Poll::Ready(this.resolve(Some(context)));
        }

        context.add_caller(caller.clone());
        caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, true));
        this.registered = Some(caller.clone());

        if this.on_suspend.is_some() && context.arm_suspend() {
            if let Some(callback) = &this.on_suspend {
                callback(&context);
            }
        }
        if context.is_ready() {
            // Resolved synchronously by the suspend callback.
            return Poll::Ready(this.resolve(Some(context)));
        }

        // Suspend for real: give up our strong reference so external
        // ownership alone governs the generator's lifetime.
        this.keep_alive = None;
        if Rc::strong_count(&context) <= 1 {
            // We hold the last reference, so the generator is gone the
            // moment we return: resolve as vanished instead of suspending.
            context.remove_caller(&caller);
            return Poll::Ready(this.resolve(None));
        }
        Poll::Pending
    }
}

impl<T: ErrorValue + Clone + 'static> Drop for AwaitGenerator<T> {
    fn drop(&mut self) {
        if let Some(caller) = self.registered.take() {
            caller.with_promise(|p| p.set_flag(PromiseFlag::InternalWaiting, false));
            if let Some(context) = self.context.upgrade() {
                context.remove_caller(&caller);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::CallableFuture;

    #[test]
    fn immediate_value_resolves_without_suspending() {
        let generator: GeneratorFuture<i32> = GeneratorFuture::new(|_| {});
        generator.get_context().set_value(9);
        let future = CallableFuture::new({
            let generator = generator.clone();
            async move { generator.await }
        });
        future.start();
        assert_eq!(future.value(), Some(9));
    }

    #[test]
    fn external_set_value_wakes_the_awaiter() {
        let generator: GeneratorFuture<i32> = GeneratorFuture::new(|_| {});
        let context = Rc::clone(generator.get_context());
        let future = CallableFuture::new(async move { generator.await + 1 });
        future.start();
        assert!(!future.is_ready());
        context.set_value(41);
        assert!(future.is_ready());
        assert_eq!(future.value(), Some(42));
    }

    #[test]
    fn suspend_callback_fires_once_per_armed_cycle() {
        let fired = Rc::new(Cell::new(0));
        let generator: GeneratorFuture<i32> = GeneratorFuture::new({
            let fired = Rc::clone(&fired);
            move |_| fired.set(fired.get() + 1)
        });
        let context = Rc::clone(generator.get_context());

        let first = CallableFuture::new({
            let generator = generator.clone();
            async move { generator.await }
        });
        let second = CallableFuture::new({
            let generator = generator.clone();
            async move { generator.await }
        });
        first.start();
        second.start();
        assert_eq!(fired.get(), 1);

        context.set_value(5);
        assert_eq!(first.value(), Some(5));
        assert_eq!(second.value(), Some(5));

        // Re-arm and await again: the callback fires for the new cycle.
        context.reset_value();
        let third = CallableFuture::new(async move { generator.await });
        third.start();
        assert_eq!(fired.get(), 2);
        context.set_value(6);
        assert_eq!(third.value(), Some(6));
    }

    #[test]
    fn drop_while_pending_auto_resolves_to_killed_transform() {
        let generator: GeneratorFuture<i32> = GeneratorFuture::new(|_| {});
        let future = CallableFuture::new(async move { generator.await });
        // The await adapter releases its strong reference at suspension, and
        // nothing else holds the context here, so the generator dies and
        // auto-resolves during the very first run.
        future.start();
        assert!(future.is_ready());
        assert_eq!(future.value(), Some(-5));
    }

    #[test]
    fn drop_of_external_holder_wakes_awaiter() {
        let generator: GeneratorFuture<i32> = GeneratorFuture::new(|_| {});
        let context = Rc::clone(generator.get_context());
        let future = CallableFuture::new(async move { generator.await });
        future.start();
        assert!(!future.is_ready());
        drop(context);
        assert!(future.is_ready());
        assert_eq!(future.value(), Some(-5));
    }

    #[test]
    fn multiple_awaiters_each_receive_the_value() {
        let generator: GeneratorFuture<i64> = GeneratorFuture::new(|_| {});
        let context = Rc::clone(generator.get_context());
        let futures: Vec<_> = (0..3)
            .map(|offset| {
                let generator = generator.clone();
                CallableFuture::new(async move { generator.await + offset })
            })
            .collect();
        for future in &futures {
            future.start();
        }
        assert!(context.has_multiple_callers());
        context.set_value(100);
        assert!(!context.has_callers());
        for (offset, future) in futures.iter().enumerate() {
            assert_eq!(future.value(), Some(100 + offset as i64));
        }
    }
}
