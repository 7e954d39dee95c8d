//! Scenario tests for stackful tasks and the task manager: chaining with
//! payloads, cooperative awaiting, pool admission, and timeout expiry.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use costrand::{
    FiberScope, StackPool, StackPoolConfig, Task, TaskError, TaskManager, TaskStatus,
};

#[test]
fn chained_tasks_receive_their_registered_payloads() {
    let (tx, rx) = mpsc::channel();

    let first = Task::create(|scope: &mut FiberScope| {
        let _ = scope.yield_now();
        0
    })
    .expect("create first");

    let second = Task::create(move |scope: &mut FiberScope| {
        let payload = scope
            .take_data()
            .and_then(|data| data.downcast::<&'static str>().ok())
            .map_or("", |boxed| *boxed);
        tx.send(payload).ok();
        0
    })
    .expect("create second");

    first.next_with(second.clone(), Some(Box::new("follow-up")));
    first.start(None).expect("start first");
    first.resume(None).expect("finish first");

    assert_eq!(second.get_status(), TaskStatus::Done);
    let payload = rx.recv_timeout(Duration::from_secs(5)).expect("payload");
    assert_eq!(payload, "follow-up");
}

#[test]
fn await_task_chains_three_tasks() {
    let innermost = Task::create(|scope: &mut FiberScope| {
        let _ = scope.yield_now();
        3
    })
    .expect("create innermost");

    let middle = Task::create({
        let innermost = innermost.clone();
        move |scope: &mut FiberScope| match scope.await_task(&innermost) {
            Ok(()) => 2,
            Err(_) => -2,
        }
    })
    .expect("create middle");

    let outer = Task::create({
        let middle = middle.clone();
        move |scope: &mut FiberScope| match scope.await_task(&middle) {
            Ok(()) => 1,
            Err(_) => -1,
        }
    })
    .expect("create outer");

    innermost.start(None).expect("start innermost");
    middle.start(None).expect("start middle");
    outer.start(None).expect("start outer");
    assert_eq!(outer.get_status(), TaskStatus::Waiting);
    assert_eq!(middle.get_status(), TaskStatus::Waiting);

    // Finishing the innermost task cascades through both waiters.
    innermost.resume(None).expect("finish innermost");
    assert_eq!(innermost.get_status(), TaskStatus::Done);
    assert_eq!(middle.get_status(), TaskStatus::Done);
    assert_eq!(outer.get_status(), TaskStatus::Done);
    assert_eq!(outer.get_ret_code(), 1);
}

#[test]
fn awaiting_self_is_rejected() {
    let (tx, rx) = mpsc::channel();
    let holder: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(None));

    let task = Task::create({
        let holder = Arc::clone(&holder);
        move |scope: &mut FiberScope| {
            let me = holder
                .lock()
                .expect("slot lock")
                .clone()
                .expect("own handle installed");
            let result = scope.await_task(&me);
            tx.send(result).ok();
            0
        }
    })
    .expect("create");
    *holder.lock().expect("slot lock") = Some(task.clone());

    task.start(None).expect("start");
    let result = rx.recv_timeout(Duration::from_secs(5)).expect("result");
    assert_eq!(result.unwrap_err(), TaskError::CannotAwaitSelf);
}

#[test]
fn pool_admission_gates_task_creation() {
    let pool = StackPool::new(
        StackPoolConfig::unbounded()
            .with_max_stack_count(1)
            .with_max_total_size(1024 * 1024),
    );

    let first = Task::create_with_pool(|_scope: &mut FiberScope| 0, &pool, 128 * 1024)
        .expect("first task fits");
    assert_eq!(pool.used_count(), 1);

    let refused = Task::create_with_pool(|_scope: &mut FiberScope| 0, &pool, 128 * 1024);
    assert_eq!(refused.unwrap_err(), TaskError::StackExhausted);

    first.start(None).expect("start");
    drop(first);
    assert_eq!(pool.used_count(), 0);

    Task::create_with_pool(|_scope: &mut FiberScope| 0, &pool, 128 * 1024)
        .expect("slot freed after drop");
}

#[test]
fn manager_timeout_scenario_matches_the_tick_contract() {
    let manager = TaskManager::new();
    manager.tick(3, 0).expect("baseline tick at t=3");

    let timed = Task::create(|scope: &mut FiberScope| {
        while scope.yield_now().is_ok() {}
        0
    })
    .expect("create timed");
    let untimed = Task::create(|scope: &mut FiberScope| {
        while scope.yield_now().is_ok() {}
        0
    })
    .expect("create untimed");

    // Timeout of 5s at tick time 3: absolute expiry 8.
    manager
        .add_task_with_timeout(&timed, 5, 0)
        .expect("add timed");
    manager.add_task(&untimed).expect("add untimed");
    timed.start(None).expect("start timed");
    untimed.start(None).expect("start untimed");

    // Expiry is exclusive of the exactly-equal boundary.
    manager.tick(8, 0).expect("tick at expiry");
    assert!(!timed.is_exiting());
    assert_eq!(manager.task_size(), 2);

    manager.tick(9, 0).expect("tick past expiry");
    assert_eq!(timed.get_status(), TaskStatus::Timeout);
    assert_eq!(manager.task_size(), 1);
    assert!(!untimed.is_exiting());
    assert!(manager.find_task(untimed.get_id()).is_some());

    manager.reset();
    assert_eq!(untimed.get_status(), TaskStatus::Killed);
}

#[test]
fn killed_task_reports_negative_status_ret_code() {
    let task = Task::create(|scope: &mut FiberScope| {
        while scope.yield_now().is_ok() {}
        7
    })
    .expect("create");
    task.start(None).expect("start");
    task.kill(TaskStatus::Killed).expect("kill");
    assert_eq!(task.get_ret_code(), -6);
}
