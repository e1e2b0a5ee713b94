#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod error;
pub mod heartbeat;
pub mod history;
pub mod lock;
pub mod manager;
pub mod notify;
pub mod store;
pub mod update;

pub mod test_utils;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use lock::{
    LockAction, LockConflict, LockEvent, LockEventKind, LockHistoryEntry, LockKind, LockRecord,
};
pub use manager::{AcquireOutcome, LockCheck, LockConfig, SessionLockManager};
pub use update::{auto_merge, OptimisticUpdateCoordinator, UpdateOutcome};
