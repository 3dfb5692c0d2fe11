//! Visitor history, daily aggregates, and reporting for visitor-pulse.
//!
//! Derives dashboard statistics from the durable scope, keeps subscribers
//! converged across trackers, and renders markdown reports.

pub mod aggregations;
pub mod reports;
pub mod sync;

pub use aggregations::{
    format_duration, AggregateConfig, AggregateStore, DailyAggregate, SeriesPoint, Snapshot,
    Statistics, Totals,
};
pub use reports::{ReportGenerator, ReportKind};
pub use sync::Subscription;
