//! The task manager: identity map, timeout bucket, and the tick loop.
//!
//! Every registered task with a non-zero timeout owns exactly one entry in
//! the checkpoint set, ordered by `(expiry, id)` so ties on identical
//! timestamps resolve deterministically. Removing a task removes its
//! checkpoint and vice versa; the two structures never drift apart.
//!
//! [`tick`](TaskManager::tick) kills every task whose expiry lies strictly
//! before the tick time with status `Timeout` — an entry expiring exactly
//! *at* the tick time survives until the next one. Time never runs
//! backwards: a tick at or before the last tick time is a no-op, and the
//! very first tick only establishes the baseline, rebasing all previously
//! registered relative timeouts onto absolute time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::types::{TaskId, TaskStatus, TickTime};

use super::fiber::PrivateData;
use super::task::Task;

const FLAG_IN_TICK: u8 = 0x01;
const FLAG_IN_RESET: u8 = 0x02;

/// One timeout checkpoint: expiry time, then id as the tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerNode {
    expires: TickTime,
    id: TaskId,
}

#[derive(Debug)]
struct TaskNode {
    task: Task,
    timer: Option<TimerNode>,
}

#[derive(Debug, Default)]
struct ManagerState {
    tasks: HashMap<TaskId, TaskNode>,
    checkpoints: BTreeSet<TimerNode>,
    last_tick: TickTime,
}

impl ManagerState {
    fn clear_timer(&mut self, id: TaskId) {
        if let Some(node) = self.tasks.get_mut(&id) {
            if let Some(timer) = node.timer.take() {
                self.checkpoints.remove(&timer);
            }
        }
    }

    fn set_timer(&mut self, id: TaskId, timeout_sec: i64, timeout_nsec: i32) {
        self.clear_timer(id);
        if timeout_sec <= 0 && timeout_nsec <= 0 {
            return;
        }
        let expires = self.last_tick.advanced_by(timeout_sec, timeout_nsec);
        if let Some(node) = self.tasks.get_mut(&id) {
            let timer = TimerNode { expires, id };
            node.timer = Some(timer);
            self.checkpoints.insert(timer);
        }
    }
}

/// Lifecycle manager for stackful tasks: registration, lookup, driving by
/// id, and timeout-bucketed expiry.
#[derive(Debug, Default)]
pub struct TaskManager {
    state: Mutex<ManagerState>,
    flags: AtomicU8,
}

struct FlagGuard<'a> {
    flags: &'a AtomicU8,
    bit: u8,
}

impl<'a> FlagGuard<'a> {
    fn acquire(flags: &'a AtomicU8, bit: u8) -> Option<Self> {
        let previous = flags.fetch_or(bit, Ordering::AcqRel);
        if previous & bit != 0 {
            return None;
        }
        Some(Self { flags, bit })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flags.fetch_and(!self.bit, Ordering::AcqRel);
    }
}

impl TaskManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flag_set(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    /// Registers a task without a timeout.
    pub fn add_task(&self, task: &Task) -> Result<(), TaskError> {
        self.add_task_with_timeout(task, 0, 0)
    }

    /// Registers a task, arming a timeout relative to the last tick time.
    ///
    /// A task registered before the first tick has its timeout rebased onto
    /// absolute time when the baseline tick arrives.
    pub fn add_task_with_timeout(
        &self,
        task: &Task,
        timeout_sec: i64,
        timeout_nsec: i32,
    ) -> Result<(), TaskError> {
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }
        if task.is_exiting() {
            return Err(TaskError::Exiting);
        }
        let id = task.get_id();
        let mut state = self.state.lock();
        if state.tasks.contains_key(&id) {
            return Err(TaskError::AlreadyExists);
        }
        state.tasks.insert(
            id,
            TaskNode {
                task: task.clone(),
                timer: None,
            },
        );
        state.set_timer(id, timeout_sec, timeout_nsec);
        Ok(())
    }

    /// Sets or updates a registered task's timeout. Zero clears it: the task
    /// never expires.
    pub fn set_timeout(
        &self,
        id: TaskId,
        timeout_sec: i64,
        timeout_nsec: i32,
    ) -> Result<(), TaskError> {
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }
        let mut state = self.state.lock();
        if !state.tasks.contains_key(&id) {
            return Err(TaskError::NotFound);
        }
        state.set_timer(id, timeout_sec, timeout_nsec);
        Ok(())
    }

    /// Unregisters a task, killing it if still in flight.
    pub fn remove_task(&self, id: TaskId) -> Result<(), TaskError> {
        self.remove_task_impl(id, None)
    }

    /// Unregisters `id` only if it still refers to `confirm`.
    pub fn remove_task_confirm(&self, id: TaskId, confirm: &Task) -> Result<(), TaskError> {
        self.remove_task_impl(id, Some(confirm))
    }

    fn remove_task_impl(&self, id: TaskId, confirm: Option<&Task>) -> Result<(), TaskError> {
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }
        let task = {
            let mut state = self.state.lock();
            match state.tasks.get(&id) {
                None => return Err(TaskError::NotFound),
                Some(node) => {
                    if let Some(confirm) = confirm {
                        if !std::sync::Arc::ptr_eq(node.task.inner(), confirm.inner()) {
                            return Err(TaskError::NotFound);
                        }
                    }
                }
            }
            state.clear_timer(id);
            state.tasks.remove(&id).map(|node| node.task)
        };
        if let Some(task) = task {
            let status = task.get_status();
            if status > TaskStatus::Created && !status.is_exited() {
                return task.kill(TaskStatus::Killed);
            }
        }
        Ok(())
    }

    /// Looks up a registered task by id.
    #[must_use]
    pub fn find_task(&self, id: TaskId) -> Option<Task> {
        if self.flag_set(FLAG_IN_RESET) {
            return None;
        }
        self.state.lock().tasks.get(&id).map(|node| node.task.clone())
    }

    /// Starts a registered task by id, unregistering it if it finishes.
    pub fn start(&self, id: TaskId, data: PrivateData) -> Result<(), TaskError> {
        let task = self.driven_task(id)?;
        let result = task.start(data);
        if task.is_exiting() {
            let _ = self.remove_task(id);
        }
        result
    }

    /// Resumes a registered task by id, unregistering it if it finishes.
    pub fn resume(&self, id: TaskId, data: PrivateData) -> Result<(), TaskError> {
        let task = self.driven_task(id)?;
        let result = task.resume(data);
        if task.is_exiting() {
            let _ = self.remove_task(id);
        }
        result
    }

    fn driven_task(&self, id: TaskId) -> Result<Task, TaskError> {
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }
        self.find_task(id).ok_or(TaskError::NotFound)
    }

    /// Unregisters and cancels a task.
    pub fn cancel(&self, id: TaskId) -> Result<(), TaskError> {
        let task = self.take_task(id)?;
        task.cancel()
    }

    /// Unregisters and kills a task with the given terminal status.
    pub fn kill_with_status(&self, id: TaskId, status: TaskStatus) -> Result<(), TaskError> {
        let task = self.take_task(id)?;
        task.kill(status)
    }

    /// Unregisters and kills a task with status `Killed`.
    pub fn kill(&self, id: TaskId) -> Result<(), TaskError> {
        self.kill_with_status(id, TaskStatus::Killed)
    }

    fn take_task(&self, id: TaskId) -> Result<Task, TaskError> {
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }
        let mut state = self.state.lock();
        if !state.tasks.contains_key(&id) {
            return Err(TaskError::NotFound);
        }
        state.clear_timer(id);
        state
            .tasks
            .remove(&id)
            .map(|node| node.task)
            .ok_or(TaskError::NotFound)
    }

    /// Advances the manager clock, expiring overdue tasks.
    ///
    /// Reentrant ticks (from inside a kill-triggered follow-up) and ticks
    /// that do not move time forward are no-ops.
    pub fn tick(&self, sec: i64, nsec: i32) -> Result<(), TaskError> {
        let now = TickTime::new(sec, nsec);
        let Some(_guard) = FlagGuard::acquire(&self.flags, FLAG_IN_TICK) else {
            return Ok(());
        };
        if self.flag_set(FLAG_IN_RESET) {
            return Err(TaskError::InReset);
        }

        {
            let mut state = self.state.lock();
            if now <= state.last_tick {
                return Ok(());
            }
            if state.last_tick.is_zero() {
                // Baseline tick: shift every pre-registered relative timeout
                // onto the absolute clock.
                let rebased: BTreeSet<TimerNode> = state
                    .checkpoints
                    .iter()
                    .map(|node| TimerNode {
                        expires: TickTime::new(
                            node.expires.sec + now.sec,
                            node.expires.nsec + now.nsec,
                        ),
                        id: node.id,
                    })
                    .collect();
                let by_id: BTreeMap<TaskId, TimerNode> =
                    rebased.iter().map(|node| (node.id, *node)).collect();
                state.checkpoints = rebased;
                for (id, node) in &mut state.tasks {
                    if node.timer.is_some() {
                        node.timer = by_id.get(id).copied();
                    }
                }
                state.last_tick = now;
                return Ok(());
            }
        }

        loop {
            let expired = {
                let mut state = self.state.lock();
                let first = state.checkpoints.iter().next().copied();
                match first {
                    // Strict comparison: checkpoints at exactly `now` live on.
                    None => None,
                    Some(node) if now <= node.expires => None,
                    Some(node) => {
                        state.checkpoints.remove(&node);
                        // The task may already be gone through the completion
                        // path; re-validate before killing.
                        state.tasks.remove(&node.id).map(|task_node| task_node.task)
                    }
                }
            };
            match expired {
                None => break,
                Some(task) => {
                    if !task.is_exiting() {
                        crate::tracing_compat::debug!("task {} expired", task.get_id());
                        let _ = task.kill(TaskStatus::Timeout);
                    }
                }
            }
        }

        self.state.lock().last_tick = now;
        Ok(())
    }

    /// Unregisters everything, killing all in-flight tasks.
    pub fn reset(&self) {
        let Some(_guard) = FlagGuard::acquire(&self.flags, FLAG_IN_RESET) else {
            return;
        };
        let all: Vec<Task> = {
            let mut state = self.state.lock();
            let tasks = state.tasks.drain().map(|(_, node)| node.task).collect();
            state.checkpoints.clear();
            state.last_tick = TickTime::ZERO;
            tasks
        };
        for task in all {
            if !task.is_exiting() {
                let _ = task.kill(TaskStatus::Killed);
            }
        }
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn task_size(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Number of armed timeout checkpoints.
    #[must_use]
    pub fn checkpoint_size(&self) -> usize {
        self.state.lock().checkpoints.len()
    }

    /// The time of the last effective tick.
    #[must_use]
    pub fn last_tick_time(&self) -> TickTime {
        self.state.lock().last_tick
    }

    /// Verifies the map/checkpoint one-to-one invariant.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.state.lock();
        let timed: Vec<TimerNode> = state
            .tasks
            .values()
            .filter_map(|node| node.timer)
            .collect();
        assert_eq!(timed.len(), state.checkpoints.len());
        for timer in timed {
            assert!(state.checkpoints.contains(&timer));
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.reset();
    }
}
