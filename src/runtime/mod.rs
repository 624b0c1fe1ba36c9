//! Runtime Hooks
//!
//! Time and deferral are injected so that several stores can coexist and tests
//! can run on virtual time.
//!
//! - [`clock`]: wall-clock time in unix milliseconds
//! - [`scheduler`]: "run after N ms" and "run when idle" with cancellation

pub mod clock;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{ManualScheduler, Scheduler, Task, TaskHandle, TokioScheduler};
