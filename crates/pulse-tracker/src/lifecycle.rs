//! Page context: binds one tracker to its timers and teardown signals.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::config::TrackerConfig;
use pulse_core::session::VisitorSession;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::activity::{ActivityKind, ActivityThrottle, HeartbeatDriver};
use crate::tracker::SessionTracker;

/// Unload-style signals. All of them end the session; repeats are harmless,
/// and a later navigation in the same tab resumes the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownSignal {
    PageHide,
    BeforeUnload,
    Unload,
    VisibilityHidden,
    Dispose,
}

pub struct PageContext {
    tracker: Arc<SessionTracker>,
    throttle: ActivityThrottle,
    heartbeat_interval: Duration,
    driver: Option<HeartbeatDriver>,
}

impl PageContext {
    pub fn new(tracker: Arc<SessionTracker>, config: &TrackerConfig) -> Self {
        let throttle = ActivityThrottle::new(
            Arc::clone(tracker.store().clock()),
            Duration::from_secs(config.activity_throttle_secs),
        );
        Self {
            tracker,
            throttle,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            driver: None,
        }
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// Whether the heartbeat timer is running.
    pub fn is_mounted(&self) -> bool {
        self.driver.as_ref().is_some_and(HeartbeatDriver::is_running)
    }

    /// Start the session for the first path and arm the heartbeat timer.
    pub async fn mount(&mut self, path: &str) -> VisitorSession {
        let session = self.tracker.start(path).await;
        if !self.is_mounted() {
            self.driver = Some(HeartbeatDriver::spawn(
                Arc::clone(&self.tracker),
                self.heartbeat_interval,
            ));
        }
        session
    }

    /// Route change.
    pub async fn navigate(&self, path: &str) -> VisitorSession {
        self.tracker.start(path).await
    }

    /// Throttled activity heartbeat. `None` when throttled or no live session.
    pub async fn activity(&self, kind: ActivityKind) -> Option<VisitorSession> {
        if !self.throttle.allow() {
            trace!("Throttled {:?} activity", kind);
            return None;
        }
        self.tracker.heartbeat().await
    }

    pub async fn teardown(&self, signal: TeardownSignal) -> Option<VisitorSession> {
        debug!("Teardown signal: {:?}", signal);
        self.tracker.end().await
    }

    /// Stop every timer and end the session.
    pub async fn dispose(&mut self) -> Option<VisitorSession> {
        if let Some(driver) = self.driver.take() {
            driver.stop();
        }
        self.teardown(TeardownSignal::Dispose).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pulse_analytics::{AggregateConfig, AggregateStore};
    use pulse_core::clock::{Clock, ManualClock};
    use pulse_core::event_bus::EventBus;
    use pulse_core::geo::GeoChain;
    use pulse_core::session::PageEnvironment;
    use pulse_core::storage::MemoryStore;

    fn context() -> (PageContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_date(
            NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
        ));
        let store = Arc::new(AggregateStore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            EventBus::new(),
            AggregateConfig::default(),
        ));
        let tracker = Arc::new(SessionTracker::new(
            Arc::new(MemoryStore::new()),
            store,
            GeoChain::disabled(),
            PageEnvironment::default(),
        ));
        (PageContext::new(tracker, &TrackerConfig::default()), clock)
    }

    #[tokio::test]
    async fn test_mount_navigate_dispose() {
        let (mut page, clock) = context();
        let first = page.mount("/").await;
        assert!(page.is_mounted());

        let second = page.navigate("/docs").await;
        assert_eq!(first.id, second.id);
        assert_eq!(second.page_views, 2);

        clock.advance(chrono::Duration::seconds(42));
        let ended = page.dispose().await.unwrap();
        assert!(!page.is_mounted());
        assert_eq!(ended.duration_secs, Some(42));
        assert_eq!(page.tracker().store().history()[0].duration_secs, Some(42));
    }

    #[tokio::test]
    async fn test_every_signal_ends_and_repeats_are_harmless() {
        let (mut page, _) = context();
        page.mount("/").await;

        let signals = [
            TeardownSignal::VisibilityHidden,
            TeardownSignal::PageHide,
            TeardownSignal::BeforeUnload,
            TeardownSignal::Unload,
        ];
        let mut durations = Vec::new();
        for signal in signals {
            let ended = page.teardown(signal).await.unwrap();
            assert!(ended.is_ended());
            durations.push(ended.duration_secs);
        }
        assert!(durations.iter().all(|d| *d == Some(0)));
        assert_eq!(page.tracker().store().history().len(), 1);
    }

    #[tokio::test]
    async fn test_hidden_then_navigate_keeps_one_session() {
        let (mut page, _) = context();
        let first = page.mount("/").await;
        page.teardown(TeardownSignal::VisibilityHidden).await;

        let second = page.navigate("/about").await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.page_views, 2);

        let store = page.tracker().store();
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.statistics().today.visitor_count, 1);
    }

    #[tokio::test]
    async fn test_activity_is_throttled() {
        let (mut page, clock) = context();
        page.mount("/").await;

        assert!(page.activity(ActivityKind::Click).await.is_some());
        assert!(page.activity(ActivityKind::Scroll).await.is_none());

        clock.advance(chrono::Duration::seconds(5));
        let touched = page.activity(ActivityKind::Key).await.unwrap();
        assert_eq!(touched.last_seen_at, Some(clock.now()));
        assert_eq!(touched.page_views, 1);
    }

    #[tokio::test]
    async fn test_teardown_before_mount_is_noop() {
        let (page, _) = context();
        assert!(page.teardown(TeardownSignal::Unload).await.is_none());
        assert!(page.activity(ActivityKind::Touch).await.is_none());
    }
}
