//! Utility functions for identifiers and time.
//!
//! All engine components read the current time through [`Clock`] so tests
//! can drive timeouts and retention windows deterministically.

mod clock;
mod ids;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use ids::{new_execution_id, new_lease_token, new_stage_id};
