//! Durable visitor history, per-day counters, and derived statistics.
//!
//! Every mutation is a whole-document read-modify-write against the durable
//! scope. Two trackers writing at the same time can lose one update (last
//! writer wins); nothing here tries to prevent that.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use pulse_core::clock::{Clock, SystemClock};
use pulse_core::config::AppConfig;
use pulse_core::error::Result;
use pulse_core::event_bus::{AnalyticsEventType, EventBus};
use pulse_core::session::VisitorSession;
use pulse_core::storage::{
    self, FileStore, KeyValueStore, CURRENT_SESSION_KEY, DAILY_KEY, HISTORY_KEY,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Visitor and page-view counters for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    /// Distinct sessions seen on this date. Always `session_ids.len()`.
    pub visitor_count: u32,
    pub page_views: u32,
    #[serde(default)]
    pub session_ids: BTreeSet<String>,
}

impl DailyAggregate {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            visitor_count: 0,
            page_views: 0,
            session_ids: BTreeSet::new(),
        }
    }

    /// Count one page view for `session_id`.
    pub fn record(&mut self, session_id: &str) {
        if !self.session_ids.contains(session_id) {
            self.session_ids.insert(session_id.to_string());
        }
        self.visitor_count = self.session_ids.len() as u32;
        self.page_views += 1;
    }
}

/// Visitor / page-view pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub visitor_count: u64,
    pub page_views: u64,
}

/// One point of the daily chart series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub visitor_count: u32,
    pub page_views: u32,
}

/// Dashboard statistics derived from history and daily rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub today: Totals,
    /// Last 7 calendar days, today included.
    pub this_week: Totals,
    /// Last 30 calendar days, today included.
    pub this_month: Totals,
    pub total: Totals,
    pub online_now: usize,
    /// Mean duration over ended sessions.
    pub average_duration_secs: Option<u64>,
    /// Most recent first.
    pub recent_visitors: Vec<VisitorSession>,
    pub browser_breakdown: Vec<(String, u32)>,
    pub device_breakdown: Vec<(String, u32)>,
    pub top_pages: Vec<(String, u32)>,
    pub top_referrers: Vec<(String, u32)>,
    /// Most recent first.
    pub daily_series: Vec<SeriesPoint>,
}

impl Statistics {
    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.total == Totals::default()
            && self.today == Totals::default()
            && self.this_week == Totals::default()
            && self.this_month == Totals::default()
            && self.recent_visitors.is_empty()
            && self.daily_series.is_empty()
    }
}

/// Limits and windows applied by the store.
#[derive(Debug, Clone)]
pub struct AggregateConfig {
    pub history_cap: usize,
    pub retention_days: u32,
    pub recent_limit: usize,
    pub series_days: usize,
    pub top_limit: usize,
    pub stale_after_secs: u64,
    pub poll_interval: StdDuration,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl AggregateConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            history_cap: config.storage.history_cap,
            retention_days: config.storage.retention_days,
            recent_limit: config.stats.recent_limit,
            series_days: config.stats.series_days,
            top_limit: config.stats.top_limit,
            stale_after_secs: config.tracker.stale_after_secs,
            poll_interval: StdDuration::from_millis(config.sync.poll_interval_ms.max(50)),
        }
    }
}

/// Point-in-time copy of the durable collections.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub history: Vec<VisitorSession>,
    /// Sorted by date, oldest first.
    pub daily: Vec<DailyAggregate>,
}

impl Snapshot {
    pub fn new(history: Vec<VisitorSession>, mut daily: Vec<DailyAggregate>) -> Self {
        daily.sort_by_key(|row| row.date);
        Self { history, daily }
    }

    pub fn row(&self, date: NaiveDate) -> Option<&DailyAggregate> {
        self.daily.iter().find(|row| row.date == date)
    }

    /// Rows with `start <= date <= end`, oldest first.
    pub fn range(&self, start: NaiveDate, end: NaiveDate) -> Vec<&DailyAggregate> {
        self.daily
            .iter()
            .filter(|row| row.date >= start && row.date <= end)
            .collect()
    }

    /// Sums over the trailing `days` calendar days ending at `today`.
    pub fn window_totals(&self, today: NaiveDate, days: i64) -> Totals {
        let start = today - Duration::days(days.max(1) - 1);
        sum_rows(self.range(start, today))
    }

    /// Derive dashboard statistics as of `now`.
    pub fn statistics(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        config: &AggregateConfig,
    ) -> Statistics {
        let total = Totals {
            visitor_count: self.history.len() as u64,
            page_views: self.daily.iter().map(|row| row.page_views as u64).sum(),
        };

        let recent_visitors = self
            .history
            .iter()
            .rev()
            .take(config.recent_limit)
            .cloned()
            .collect();

        let online_now = self
            .history
            .iter()
            .filter(|s| s.is_online(now, config.stale_after_secs))
            .count();

        let durations: Vec<u64> = self.history.iter().filter_map(|s| s.duration_secs).collect();
        let average_duration_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() / durations.len() as u64)
        };

        let daily_series = self
            .daily
            .iter()
            .rev()
            .take(config.series_days)
            .map(|row| SeriesPoint {
                date: row.date,
                visitor_count: row.visitor_count,
                page_views: row.page_views,
            })
            .collect();

        Statistics {
            today: self.window_totals(today, 1),
            this_week: self.window_totals(today, 7),
            this_month: self.window_totals(today, 30),
            total,
            online_now,
            average_duration_secs,
            recent_visitors,
            browser_breakdown: ranked(self.history.iter().map(|s| s.browser.clone()), usize::MAX),
            device_breakdown: ranked(
                self.history.iter().map(|s| s.device.as_str().to_string()),
                usize::MAX,
            ),
            top_pages: ranked(
                self.history.iter().flat_map(|s| s.visited_paths.iter().cloned()),
                config.top_limit,
            ),
            top_referrers: ranked(self.history.iter().map(|s| s.referrer.clone()), config.top_limit),
            daily_series,
        }
    }
}

fn sum_rows(rows: Vec<&DailyAggregate>) -> Totals {
    rows.iter().fold(Totals::default(), |mut acc, row| {
        acc.visitor_count += row.visitor_count as u64;
        acc.page_views += row.page_views as u64;
        acc
    })
}

/// Count occurrences, sorted by count descending then name.
fn ranked(items: impl Iterator<Item = String>, limit: usize) -> Vec<(String, u32)> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    let mut sorted: Vec<(String, u32)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(limit);
    sorted
}

/// Durable history and daily counters shared by every tracker on a site.
pub struct AggregateStore {
    pub(crate) durable: Arc<dyn KeyValueStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bus: EventBus,
    pub(crate) config: AggregateConfig,
}

impl AggregateStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        config: AggregateConfig,
    ) -> Self {
        Self {
            durable,
            clock,
            bus,
            config,
        }
    }

    /// Open the file-backed durable scope described by `config`, on the
    /// system clock.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let dir = config.store_dir();
        let durable = if config.storage.watch {
            FileStore::watched(dir.clone())?
        } else {
            FileStore::open(dir.clone())?
        };
        debug!("Opened durable store at {}", dir.display());
        Ok(Self::new(
            Arc::new(durable),
            Arc::new(SystemClock),
            EventBus::new(),
            AggregateConfig::from_app(config),
        ))
    }

    pub fn config(&self) -> &AggregateConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn durable(&self) -> &Arc<dyn KeyValueStore> {
        &self.durable
    }

    /// Visitor history, oldest first.
    pub fn history(&self) -> Vec<VisitorSession> {
        storage::read_json(self.durable.as_ref(), HISTORY_KEY)
    }

    /// Daily rows, oldest first.
    pub fn daily(&self) -> Vec<DailyAggregate> {
        let mut rows: Vec<DailyAggregate> = storage::read_json(self.durable.as_ref(), DAILY_KEY);
        rows.sort_by_key(|row| row.date);
        rows
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.history(), self.daily())
    }

    /// Append a new session, evicting the oldest entries over the cap.
    pub fn append_session(&self, session: &VisitorSession) {
        let mut history = self.history();
        history.push(session.clone());
        if history.len() > self.config.history_cap {
            let excess = history.len() - self.config.history_cap;
            history.drain(..excess);
            debug!("Evicted {} oldest session(s) from history", excess);
        }
        storage::write_json(self.durable.as_ref(), HISTORY_KEY, &history);
    }

    /// Replace the history entry with the same id. Missing entries (evicted or
    /// cleared elsewhere) are left alone.
    pub fn update_session(&self, session: &VisitorSession) -> bool {
        let mut history = self.history();
        match history.iter_mut().find(|s| s.id == session.id) {
            Some(entry) => {
                *entry = session.clone();
                storage::write_json(self.durable.as_ref(), HISTORY_KEY, &history)
            }
            None => {
                debug!("Session {} not in history, skipping update", session.id);
                false
            }
        }
    }

    /// Count a page view for `session_id` on the date `at` falls on, then
    /// prune rows past the retention window.
    pub fn record_page_view(&self, session_id: &str, at: DateTime<Utc>) {
        let date = self.clock.date_of(at);
        let mut rows = self.daily();

        match rows.iter_mut().find(|row| row.date == date) {
            Some(row) => row.record(session_id),
            None => {
                let mut row = DailyAggregate::new(date);
                row.record(session_id);
                rows.push(row);
                rows.sort_by_key(|row| row.date);
            }
        }

        let keep_days = self.config.retention_days.max(1);
        let cutoff = date - Duration::days(keep_days as i64);
        rows.retain(|row| row.date > cutoff);

        storage::write_json(self.durable.as_ref(), DAILY_KEY, &rows);
    }

    /// Statistics as of the clock's current reading.
    pub fn statistics(&self) -> Statistics {
        let now = self.clock.now();
        self.snapshot()
            .statistics(self.clock.date_of(now), now, &self.config)
    }

    /// Empty history and daily rows, and the given tab's current session.
    pub fn clear(&self, tab: Option<&dyn KeyValueStore>) {
        storage::remove_key(self.durable.as_ref(), HISTORY_KEY);
        storage::remove_key(self.durable.as_ref(), DAILY_KEY);
        if let Some(tab) = tab {
            storage::remove_key(tab, CURRENT_SESSION_KEY);
        }
        info!("Analytics cleared");
        self.bus.notify(AnalyticsEventType::AnalyticsCleared, None);
    }
}

/// Format seconds as a human-readable duration string.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
