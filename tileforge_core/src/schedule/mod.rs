//! Next-run computation for recache schedules.
//!
//! Scheduling is a pure function `(schedule, now, last_run) → Option<next>`;
//! the actual timers live in the render runtime and stay thin. Everything
//! here is generic over the timezone so behavior around DST and month ends
//! can be pinned in tests.

mod next_run;

pub use next_run::*;
