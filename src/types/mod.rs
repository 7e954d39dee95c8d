//! Core value types: status codes, identifiers, and tick time.

pub mod id;
pub mod status;
pub mod time;

pub use id::TaskId;
pub use status::{AtomicStatusCell, PromiseStatus, StatusCode, TaskStatus};
pub use time::TickTime;
