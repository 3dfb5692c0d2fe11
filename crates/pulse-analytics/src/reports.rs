//! Markdown report generation from the durable analytics data.
//!
//! Generates weekly, monthly, and summary reports in markdown format.

use crate::aggregations::{format_duration, AggregateStore, Snapshot, Statistics};
use chrono::{Datelike, Duration, NaiveDate};
use pulse_core::clock::Clock;
use pulse_core::error::AnalyticsError;
use pulse_core::session::VisitorSession;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Which report to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Monday-to-Sunday week containing today.
    Weekly,
    /// Calendar month containing today.
    Monthly,
    /// Terminal summary of the current statistics.
    Summary,
}

impl FromStr for ReportKind {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weekly" | "week" => Ok(Self::Weekly),
            "monthly" | "month" => Ok(Self::Monthly),
            "summary" => Ok(Self::Summary),
            other => Err(AnalyticsError::Config(format!(
                "unknown report kind '{}' (expected weekly, monthly or summary)",
                other
            ))),
        }
    }
}

/// Report generator for creating markdown summaries.
pub struct ReportGenerator;

impl ReportGenerator {
    /// Render `kind` for the store's current date.
    pub fn render(store: &AggregateStore, kind: ReportKind) -> String {
        let clock = store.clock().as_ref();
        let today = clock.today();
        match kind {
            ReportKind::Weekly => {
                let week_start =
                    today - Duration::days(today.weekday().num_days_from_monday() as i64);
                Self::weekly_report(&store.snapshot(), clock, week_start)
            }
            ReportKind::Monthly => {
                Self::monthly_report(&store.snapshot(), clock, today.year(), today.month())
                    .unwrap_or_default()
            }
            ReportKind::Summary => Self::text_summary(&store.statistics()),
        }
    }

    /// Generate a weekly report.
    pub fn weekly_report(snapshot: &Snapshot, clock: &dyn Clock, week_start: NaiveDate) -> String {
        let week_end = week_start + Duration::days(6);
        let rows = snapshot.range(week_start, week_end);
        let sessions = sessions_between(snapshot, clock, week_start, week_end);

        let mut report = String::new();

        report.push_str(&format!(
            "# Weekly Report\n\n**{} - {}**\n\n",
            week_start.format("%B %d, %Y"),
            week_end.format("%B %d, %Y")
        ));

        // Overview.
        let visitors: u32 = rows.iter().map(|r| r.visitor_count).sum();
        let page_views: u32 = rows.iter().map(|r| r.page_views).sum();

        report.push_str("## Overview\n\n");
        report.push_str(&format!("- **Visitors:** {}\n", visitors));
        report.push_str(&format!("- **Page Views:** {}\n", page_views));
        report.push_str(&format!("- **Sessions Started:** {}\n", sessions.len()));
        report.push_str(&format!(
            "- **Avg Session:** {}\n\n",
            average_duration(&sessions)
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string())
        ));

        // Daily breakdown table.
        report.push_str("## Daily Breakdown\n\n");
        report.push_str("| Day | Visitors | Page Views |\n");
        report.push_str("|-----|----------|------------|\n");

        let mut current_date = week_start;
        while current_date <= week_end {
            let day_name = current_date.format("%A");
            match snapshot.row(current_date) {
                Some(row) => report.push_str(&format!(
                    "| {} | {} | {} |\n",
                    day_name, row.visitor_count, row.page_views
                )),
                None => report.push_str(&format!("| {} | 0 | 0 |\n", day_name)),
            }
            current_date += Duration::days(1);
        }
        report.push('\n');

        push_ranking(
            &mut report,
            "Browsers",
            &count_by(&sessions, |s| vec![s.browser.clone()]),
            10,
        );
        push_ranking(
            &mut report,
            "Top Pages",
            &count_by(&sessions, |s| s.visited_paths.clone()),
            10,
        );

        report
    }

    /// Generate a monthly report. `None` for an invalid year/month.
    pub fn monthly_report(
        snapshot: &Snapshot,
        clock: &dyn Clock,
        year: i32,
        month: u32,
    ) -> Option<String> {
        let first_day = NaiveDate::from_ymd_opt(year, month, 1)?;
        let last_day = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)? - Duration::days(1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)? - Duration::days(1)
        };

        let rows = snapshot.range(first_day, last_day);
        let sessions = sessions_between(snapshot, clock, first_day, last_day);

        let mut report = String::new();

        report.push_str(&format!(
            "# Monthly Report\n\n**{}**\n\n",
            first_day.format("%B %Y")
        ));

        // Overview.
        let visitors: u32 = rows.iter().map(|r| r.visitor_count).sum();
        let page_views: u32 = rows.iter().map(|r| r.page_views).sum();
        let active_days = rows.iter().filter(|r| r.page_views > 0).count();

        report.push_str("## Overview\n\n");
        report.push_str(&format!("- **Visitors:** {}\n", visitors));
        report.push_str(&format!("- **Page Views:** {}\n", page_views));
        report.push_str(&format!(
            "- **Active Days:** {} / {}\n",
            active_days,
            last_day.day()
        ));
        report.push_str(&format!(
            "- **Avg Daily Visitors:** {}\n\n",
            if active_days > 0 {
                format!("{:.1}", visitors as f64 / active_days as f64)
            } else {
                "0".to_string()
            }
        ));

        // Weekly breakdown table.
        report.push_str("## Weekly Breakdown\n\n");
        report.push_str("| Week | Visitors | Page Views |\n");
        report.push_str("|------|----------|------------|\n");

        let mut week_num = 1;
        let mut current_date = first_day;
        while current_date <= last_day {
            let week_end = std::cmp::min(current_date + Duration::days(6), last_day);

            let week_rows = snapshot.range(current_date, week_end);
            let week_visitors: u32 = week_rows.iter().map(|r| r.visitor_count).sum();
            let week_views: u32 = week_rows.iter().map(|r| r.page_views).sum();

            report.push_str(&format!(
                "| Week {} | {} | {} |\n",
                week_num, week_visitors, week_views,
            ));

            current_date = week_end + Duration::days(1);
            week_num += 1;
        }
        report.push('\n');

        push_ranking(
            &mut report,
            "Devices",
            &count_by(&sessions, |s| vec![s.device.as_str().to_string()]),
            10,
        );
        push_ranking(
            &mut report,
            "Referrers",
            &count_by(&sessions, |s| vec![s.referrer.clone()]),
            15,
        );

        Some(report)
    }

    /// Generate a compact summary suitable for a terminal.
    pub fn text_summary(stats: &Statistics) -> String {
        let mut output = String::new();

        if stats.today.page_views > 0 {
            output.push_str(&format!(
                "  Today: {} visitors, {} page views\n",
                stats.today.visitor_count, stats.today.page_views
            ));
        } else {
            output.push_str("  Today: no visits\n");
        }

        output.push_str(&format!(
            "  This week: {} visitors, {} page views\n",
            stats.this_week.visitor_count, stats.this_week.page_views
        ));
        output.push_str(&format!(
            "  This month: {} visitors, {} page views\n",
            stats.this_month.visitor_count, stats.this_month.page_views
        ));
        output.push_str(&format!(
            "  All time: {} sessions, {} page views\n",
            stats.total.visitor_count, stats.total.page_views
        ));
        output.push_str(&format!("  Online now: {}\n", stats.online_now));

        if let Some(avg) = stats.average_duration_secs {
            output.push_str(&format!("  Avg session: {}\n", format_duration(avg)));
        }

        if !stats.browser_breakdown.is_empty() {
            output.push_str("  Browsers:");
            for (name, count) in stats.browser_breakdown.iter().take(5) {
                output.push_str(&format!(" {}({})", name, count));
            }
            output.push('\n');
        }

        if !stats.device_breakdown.is_empty() {
            output.push_str("  Devices:");
            for (name, count) in &stats.device_breakdown {
                output.push_str(&format!(" {}({})", name, count));
            }
            output.push('\n');
        }

        if !stats.daily_series.is_empty() {
            output.push_str("  Last days:");
            for point in &stats.daily_series {
                output.push_str(&format!(" {}={}", point.date.format("%m-%d"), point.visitor_count));
            }
            output.push('\n');
        }

        output
    }
}

fn sessions_between<'a>(
    snapshot: &'a Snapshot,
    clock: &dyn Clock,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<&'a VisitorSession> {
    snapshot
        .history
        .iter()
        .filter(|s| {
            let date = clock.date_of(s.entry_at);
            date >= start && date <= end
        })
        .collect()
}

fn average_duration(sessions: &[&VisitorSession]) -> Option<u64> {
    let durations: Vec<u64> = sessions.iter().filter_map(|s| s.duration_secs).collect();
    if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<u64>() / durations.len() as u64)
    }
}

fn count_by<F>(sessions: &[&VisitorSession], keys: F) -> Vec<(String, u32)>
where
    F: Fn(&VisitorSession) -> Vec<String>,
{
    let mut counts: HashMap<String, u32> = HashMap::new();
    for session in sessions {
        for key in keys(session) {
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    let mut sorted: Vec<(String, u32)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

fn push_ranking(report: &mut String, title: &str, ranking: &[(String, u32)], limit: usize) {
    if ranking.is_empty() {
        return;
    }
    report.push_str(&format!("## {}\n\n", title));
    for (i, (name, count)) in ranking.iter().take(limit).enumerate() {
        report.push_str(&format!("{}. `{}` - {}\n", i + 1, name, count));
    }
    report.push('\n');
}
