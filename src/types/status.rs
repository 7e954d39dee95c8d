//! Status codes for promises and stackful tasks, plus the atomic cell that
//! stores them.
//!
//! Both status spaces are *ordered*: every value greater than or equal to the
//! `Done` marker is terminal, and a status may only ever move to a numerically
//! greater-or-equal value. The ordering is load-bearing — kill and completion
//! race through compare-and-swap chains that rely on monotonicity to
//! terminate.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Status of a promise (stackless coroutine).
///
/// Ordering: `Created < Running < Done < Cancelled < Killed < Timeout`.
/// `Done` and everything above it is terminal; once a promise is terminal it
/// never changes again except to a numerically greater terminal value.
///
/// Discriminants start at 1; 0 is reserved so integer error transforms keep
/// stable codes (see [`crate::promise::ErrorValue`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PromiseStatus {
    /// The coroutine exists but its body has not run yet.
    Created = 1,
    /// The body has started running.
    Running = 2,
    /// The body returned normally.
    Done = 3,
    /// Cancelled before completion.
    Cancelled = 4,
    /// Forcibly terminated by a caller or during teardown.
    Killed = 5,
    /// Terminated because a deadline elapsed.
    Timeout = 6,
}

impl PromiseStatus {
    /// Returns true when no further resumption will produce a value.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self as u8 >= Self::Done as u8
    }

    /// Numeric code of this status, as used by the integer error transform.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PromiseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Killed => write!(f, "killed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Status of a stackful task.
///
/// Ordering: `Created < Running < Waiting < Done < Cancelled < Killed <
/// Timeout`. Everything below `Done` is "in flight", everything at or above
/// it is "exited".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    /// Constructed, body not started.
    Created = 1,
    /// Body currently executing on some thread.
    Running = 2,
    /// Body yielded and waits to be resumed.
    Waiting = 3,
    /// Body returned normally.
    Done = 4,
    /// Cancelled before completion.
    Cancelled = 5,
    /// Forcibly terminated.
    Killed = 6,
    /// Terminated by the timeout machinery.
    Timeout = 7,
}

impl TaskStatus {
    /// Returns true when the task has exited (terminal status).
    #[must_use]
    pub const fn is_exited(self) -> bool {
        self as u8 >= Self::Done as u8
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Killed => write!(f, "killed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// A status type storable in an [`AtomicStatusCell`].
pub trait StatusCode: Copy + Ord {
    /// Raw byte representation.
    fn as_raw(self) -> u8;
    /// Decodes a raw byte written by `as_raw`.
    fn from_raw(raw: u8) -> Self;
}

impl StatusCode for PromiseStatus {
    fn as_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Created,
            2 => Self::Running,
            3 => Self::Done,
            4 => Self::Cancelled,
            5 => Self::Killed,
            _ => Self::Timeout,
        }
    }
}

impl StatusCode for TaskStatus {
    fn as_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Created,
            2 => Self::Running,
            3 => Self::Waiting,
            4 => Self::Done,
            5 => Self::Cancelled,
            6 => Self::Killed,
            _ => Self::Timeout,
        }
    }
}

/// Lock-free status field with a compare-and-swap write contract.
///
/// `set_status(value, Some(&mut expected))` is a CAS: on failure the actually
/// observed status is written back through `expected` and `false` is
/// returned, so callers retry from the real value. The plain form
/// `set_status(value, None)` is an unconditional store and is only legal on
/// paths that hold exclusive write rights at that moment.
#[derive(Debug)]
pub struct AtomicStatusCell<S: StatusCode> {
    raw: AtomicU8,
    _marker: core::marker::PhantomData<S>,
}

impl<S: StatusCode> AtomicStatusCell<S> {
    /// Creates a cell holding `initial`.
    #[must_use]
    pub fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.as_raw()),
            _marker: core::marker::PhantomData,
        }
    }

    /// Atomically loads the current status.
    #[must_use]
    pub fn get_status(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Stores or compare-exchanges the status; see the type docs for the
    /// write-back contract.
    pub fn set_status(&self, value: S, expected: Option<&mut S>) -> bool {
        match expected {
            None => {
                self.raw.store(value.as_raw(), Ordering::Release);
                true
            }
            Some(expected) => {
                match self.raw.compare_exchange(
                    expected.as_raw(),
                    value.as_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => true,
                    Err(observed) => {
                        *expected = S::from_raw(observed);
                        false
                    }
                }
            }
        }
    }

    /// Raises the status to `target` through a CAS retry chain.
    ///
    /// Returns the previously observed status on success, or `None` when the
    /// cell was already at or above `target`.
    pub fn raise_to(&self, target: S) -> Option<S> {
        let mut current = self.get_status();
        loop {
            if current >= target {
                return None;
            }
            if self.set_status(target, Some(&mut current)) {
                return Some(current);
            }
        }
    }
}
