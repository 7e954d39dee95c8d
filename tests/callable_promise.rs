//! Scenario tests for callable futures: nested awaits driven by one
//! external resume, and kill propagation through caller/callee chains.

use std::rc::Rc;

use costrand::{yield_status, CallableFuture, GeneratorFuture, PromiseStatus};

fn ready_int(value: i32) -> CallableFuture<i32> {
    CallableFuture::new(async move { value })
}

fn gated_int(value: i32, gate: GeneratorFuture<()>) -> CallableFuture<i32> {
    CallableFuture::new(async move {
        gate.await;
        value
    })
}

fn ready_void() -> CallableFuture<()> {
    CallableFuture::new(async {})
}

fn gated_void(gate: GeneratorFuture<()>) -> CallableFuture<()> {
    CallableFuture::new(async move {
        gate.await;
    })
}

#[test]
fn integer_future_resolves_after_one_external_resume() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let control = Rc::clone(gate.get_context());

    let future = CallableFuture::new({
        let gate = gate.clone();
        async move {
            let v = ready_int(3);
            let u = gated_int(11, gate);
            v.await + u.await
        }
    });
    assert_eq!(future.get_status(), PromiseStatus::Created);

    future.start();
    assert_ne!(future.get_status(), PromiseStatus::Done);
    assert!(!future.is_ready());

    // Resolving the single pending point drives the whole chain to Done.
    control.set_value(());
    assert_eq!(future.get_status(), PromiseStatus::Done);
    assert!(future.is_ready());
    assert_eq!(future.value(), Some(14));
}

#[test]
fn integer_future_with_ready_branches_completes_on_start() {
    let future = CallableFuture::new(async move {
        let v = ready_int(33);
        let u = ready_int(31);
        v.await + u.await
    });
    assert_eq!(future.get_status(), PromiseStatus::Created);
    future.start();
    assert_eq!(future.get_status(), PromiseStatus::Done);
    assert!(future.is_ready());
    assert_eq!(future.value(), Some(64));
}

#[test]
fn void_future_resolves_after_one_external_resume() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let control = Rc::clone(gate.get_context());

    let future = CallableFuture::new({
        let gate = gate.clone();
        async move {
            ready_void().await;
            gated_void(gate).await;
        }
    });
    future.start();
    assert_ne!(future.get_status(), PromiseStatus::Done);
    assert!(!future.is_ready());

    control.set_value(());
    assert_eq!(future.get_status(), PromiseStatus::Done);
    assert!(future.is_ready());
}

#[test]
fn int_future_awaiting_void_and_int_branches() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let control = Rc::clone(gate.get_context());

    let future = CallableFuture::new({
        let gate = gate.clone();
        async move {
            ready_void().await;
            gated_void(gate.clone()).await;
            let v = ready_int(17);
            let u = gated_int(23, gate);
            v.await + u.await
        }
    });
    future.start();
    assert!(!future.is_ready());

    control.set_value(());
    assert_eq!(future.get_status(), PromiseStatus::Done);
    assert_eq!(future.value(), Some(40));
}

fn chain_level_3(gate: GeneratorFuture<()>) -> CallableFuture<i32> {
    CallableFuture::new(async move {
        gate.await;
        let status = yield_status().await;
        // Killed from above: report the terminal status as a negative code.
        -i32::from(status.code())
    })
}

fn chain_level_2(gate: GeneratorFuture<()>) -> CallableFuture<i32> {
    CallableFuture::new(async move { chain_level_3(gate).await })
}

fn chain_level_1(gate: GeneratorFuture<()>) -> CallableFuture<i32> {
    CallableFuture::new(async move { chain_level_2(gate).await })
}

#[test]
fn kill_propagates_through_a_three_level_chain() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let control = Rc::clone(gate.get_context());

    let future = chain_level_1(gate.clone());
    future.start();
    assert_ne!(future.get_status(), PromiseStatus::Done);
    assert!(!future.is_ready());

    assert!(future.kill(PromiseStatus::Killed));
    assert!(future.is_ready());
    assert_eq!(future.value(), Some(-5));
    assert_eq!(future.get_status(), PromiseStatus::Killed);

    // Late resolution of the external event is a clean no-op.
    control.set_value(());
    assert_eq!(future.get_status(), PromiseStatus::Killed);
}

#[test]
fn kill_propagates_through_a_two_level_chain() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let control = Rc::clone(gate.get_context());

    let future = chain_level_2(gate.clone());
    future.start();
    assert!(!future.is_ready());

    assert!(future.kill(PromiseStatus::Killed));
    assert!(future.is_ready());
    assert_eq!(future.value(), Some(-5));

    control.set_value(());
    assert_eq!(future.get_status(), PromiseStatus::Killed);
}

#[test]
fn kill_with_timeout_status_is_distinguishable() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let _control = Rc::clone(gate.get_context());

    let future = chain_level_2(gate);
    future.start();
    assert!(future.kill(PromiseStatus::Timeout));
    assert!(future.is_ready());
    assert_eq!(future.get_status(), PromiseStatus::Timeout);
    assert_eq!(future.value(), Some(-6));
}

#[test]
fn second_kill_reports_nothing_to_do() {
    let gate: GeneratorFuture<()> = GeneratorFuture::new(|_| {});
    let _control = Rc::clone(gate.get_context());

    let future = chain_level_2(gate);
    future.start();
    assert!(future.kill(PromiseStatus::Killed));
    assert!(!future.kill(PromiseStatus::Killed));
    assert_eq!(future.get_status(), PromiseStatus::Killed);
}
