//! Schedule data model and wire shapes
//!
//! A `Schedule` is the persisted document a replica fleet agrees on; the
//! in-memory firing state derived from it lives in the scheduler. The JSON
//! shape is part of the REST contract: `interval` always rides as a
//! human-readable duration string ("30s", "1h 30m"), never a number, and
//! `times` are absolute RFC3339 instants in UTC.

mod change;
mod schedule;

pub use change::ChangeEvent;
pub use schedule::{Schedule, ScheduleDefinition, ScheduleType};

#[cfg(test)]
#[path = "schedule_test.rs"]
mod schedule_tests;
