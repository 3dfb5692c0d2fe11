use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoLocation;
use crate::user_agent::{self, DeviceClass};

/// Referrer recorded when the page was opened directly.
pub const DIRECT_REFERRER: &str = "direct";

/// What the hosting page knows about itself when a session starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageEnvironment {
    pub user_agent: String,
    pub referrer: String,
}

impl PageEnvironment {
    pub fn new(user_agent: impl Into<String>, referrer: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            referrer: referrer.into(),
        }
    }
}

/// One tracked tab lifetime of browsing activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorSession {
    pub id: String,
    pub ip_address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub user_agent: String,
    pub browser: String,
    pub os: String,
    pub device: DeviceClass,
    pub entry_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    pub page_views: u32,
    #[serde(default)]
    pub visited_paths: Vec<String>,
    pub referrer: String,
    /// Last start, heartbeat or end seen for this session.
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl VisitorSession {
    /// Build a fresh session for its first page view.
    pub fn new(
        path: &str,
        env: &PageEnvironment,
        location: GeoLocation,
        now: DateTime<Utc>,
    ) -> Self {
        let ua = user_agent::parse(&env.user_agent);
        let referrer = if env.referrer.trim().is_empty() {
            DIRECT_REFERRER.to_string()
        } else {
            env.referrer.clone()
        };
        Self {
            id: Uuid::new_v4().to_string(),
            ip_address: location.ip,
            country: location.country,
            city: location.city,
            user_agent: env.user_agent.clone(),
            browser: ua.browser,
            os: ua.os,
            device: ua.device,
            entry_at: now,
            exit_at: None,
            duration_secs: None,
            page_views: 1,
            visited_paths: vec![path.to_string()],
            referrer,
            last_seen_at: Some(now),
        }
    }

    /// Count another navigation. Paths are kept distinct, views are not.
    pub fn record_page_view(&mut self, path: &str, now: DateTime<Utc>) {
        self.page_views += 1;
        if !self.visited_paths.iter().any(|p| p == path) {
            self.visited_paths.push(path.to_string());
        }
        self.last_seen_at = Some(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = Some(now);
    }

    /// Close the session. Calling again recomputes from the new exit time.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        let secs = (now - self.entry_at).num_seconds().max(0) as u64;
        self.exit_at = Some(now);
        self.duration_secs = Some(secs);
        self.last_seen_at = Some(now);
    }

    pub fn is_ended(&self) -> bool {
        self.exit_at.is_some()
    }

    /// Online means no exit recorded and, when `stale_after_secs` is non-zero,
    /// seen within that window.
    pub fn is_online(&self, now: DateTime<Utc>, stale_after_secs: u64) -> bool {
        if self.is_ended() {
            return false;
        }
        if stale_after_secs == 0 {
            return true;
        }
        let last = self.last_seen_at.unwrap_or(self.entry_at);
        (now - last).num_seconds() <= stale_after_secs as i64
    }
}
