//! Per-tab visitor session tracking.
//!
//! A [`SessionTracker`] owns one tab's current session and mirrors every
//! change into the shared [`AggregateStore`](pulse_analytics::AggregateStore).
//! [`PageContext`] wires it to timers, activity signals and teardown.

pub mod activity;
pub mod lifecycle;
pub mod tracker;

pub use activity::{ActivityKind, ActivityThrottle, HeartbeatDriver};
pub use lifecycle::{PageContext, TeardownSignal};
pub use tracker::SessionTracker;
