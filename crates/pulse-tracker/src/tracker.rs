//! Session tracker for one tab.
//!
//! The current session lives in the tab-scoped store under
//! [`CURRENT_SESSION_KEY`]; every change to it is mirrored into the durable
//! history entry with the same id and announced on the event bus.

use std::sync::Arc;

use pulse_analytics::AggregateStore;
use pulse_core::clock::Clock;
use pulse_core::event_bus::{AnalyticsEventType, EventBus};
use pulse_core::geo::GeoChain;
use pulse_core::session::{PageEnvironment, VisitorSession};
use pulse_core::storage::{self, KeyValueStore, CURRENT_SESSION_KEY};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct SessionTracker {
    tab: Arc<dyn KeyValueStore>,
    store: Arc<AggregateStore>,
    geo: GeoChain,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    env: PageEnvironment,
    /// Serializes tab mutations so a slow geolocation lookup cannot let a
    /// second `start()` create another session.
    lock: Mutex<()>,
}

impl SessionTracker {
    pub fn new(
        tab: Arc<dyn KeyValueStore>,
        store: Arc<AggregateStore>,
        geo: GeoChain,
        env: PageEnvironment,
    ) -> Self {
        let clock = Arc::clone(store.clock());
        let bus = store.bus().clone();
        Self {
            tab,
            store,
            geo,
            clock,
            bus,
            env,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    pub fn tab(&self) -> &Arc<dyn KeyValueStore> {
        &self.tab
    }

    /// The tab's session record, ended or not.
    pub fn current(&self) -> Option<VisitorSession> {
        storage::read_json_opt(self.tab.as_ref(), CURRENT_SESSION_KEY)
    }

    /// Record a page view for `path`, creating the tab's session first if
    /// the tab has no record. An ended record keeps its id and exit data;
    /// only a cleared tab gets a new session.
    pub async fn start(&self, path: &str) -> VisitorSession {
        let _guard = self.lock.lock().await;

        if let Some(mut session) = self.current() {
            let now = self.clock.now();
            session.record_page_view(path, now);
            self.save(&session);
            self.store.update_session(&session);
            self.store.record_page_view(&session.id, now);
            debug!(
                "Session {} viewed {} ({} views)",
                session.id, path, session.page_views
            );
            self.bus
                .notify(AnalyticsEventType::PageViewed, Some(&session.id));
            return session;
        }

        let location = self.geo.resolve().await;
        let now = self.clock.now();
        let session = VisitorSession::new(path, &self.env, location, now);

        self.save(&session);
        self.store.append_session(&session);
        self.store.record_page_view(&session.id, now);
        info!(
            "Started session {} on {} ({} / {} / {})",
            session.id, path, session.browser, session.os, session.device
        );
        self.bus
            .notify(AnalyticsEventType::SessionStarted, Some(&session.id));
        session
    }

    /// Mark the live session as recently seen. Page views are untouched.
    pub async fn heartbeat(&self) -> Option<VisitorSession> {
        let _guard = self.lock.lock().await;

        let mut session = self.current().filter(|s| !s.is_ended())?;
        session.touch(self.clock.now());
        self.save(&session);
        self.store.update_session(&session);
        debug!("Heartbeat for session {}", session.id);
        self.bus
            .notify(AnalyticsEventType::Heartbeat, Some(&session.id));
        Some(session)
    }

    /// Close the session at the current clock reading. Repeated calls
    /// recompute the exit time and duration.
    pub async fn end(&self) -> Option<VisitorSession> {
        let _guard = self.lock.lock().await;

        let mut session = self.current()?;
        session.finish(self.clock.now());
        self.save(&session);
        self.store.update_session(&session);
        info!(
            "Ended session {} after {}s",
            session.id,
            session.duration_secs.unwrap_or(0)
        );
        self.bus
            .notify(AnalyticsEventType::SessionEnded, Some(&session.id));
        Some(session)
    }

    /// Clear all analytics along with this tab's session.
    pub fn clear(&self) {
        self.store.clear(Some(self.tab.as_ref()));
    }

    fn save(&self, session: &VisitorSession) {
        storage::write_json(self.tab.as_ref(), CURRENT_SESSION_KEY, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};
    use pulse_analytics::AggregateConfig;
    use pulse_core::clock::ManualClock;
    use pulse_core::error::{AnalyticsError, Result};
    use pulse_core::geo::{GeoLocation, GeoProvider, UNKNOWN_IP};
    use pulse_core::storage::{MemoryStore, HISTORY_KEY};
    use std::collections::HashSet;

    const SAFARI: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 \
        (KHTML, like Gecko) Version/17.4 Safari/605.1.15";

    struct Failing;

    #[async_trait]
    impl GeoProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn lookup(&self) -> Result<GeoLocation> {
            Err(AnalyticsError::Lookup {
                provider: "failing".into(),
                message: "unreachable".into(),
            })
        }
    }

    struct Fixed;

    #[async_trait]
    impl GeoProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn lookup(&self) -> Result<GeoLocation> {
            Ok(GeoLocation {
                ip: "203.0.113.7".into(),
                country: "Norway".into(),
                city: "Oslo".into(),
            })
        }
    }

    fn dynp<P: GeoProvider + 'static>(provider: P) -> Arc<dyn GeoProvider> {
        Arc::new(provider)
    }

    struct Harness {
        tracker: SessionTracker,
        clock: Arc<ManualClock>,
        durable: MemoryStore,
    }

    fn harness_with(geo: GeoChain) -> Harness {
        let durable = MemoryStore::new();
        let clock = Arc::new(ManualClock::at_date(
            NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
        ));
        let store = Arc::new(AggregateStore::new(
            Arc::new(durable.handle()),
            clock.clone(),
            EventBus::new(),
            AggregateConfig::default(),
        ));
        let tracker = SessionTracker::new(
            Arc::new(MemoryStore::new()),
            store,
            geo,
            PageEnvironment::new(SAFARI, "https://news.example/item"),
        );
        Harness {
            tracker,
            clock,
            durable,
        }
    }

    fn harness() -> Harness {
        harness_with(GeoChain::disabled())
    }

    #[tokio::test]
    async fn test_start_creates_session() {
        let h = harness();
        let session = h.tracker.start("/").await;

        assert_eq!(session.page_views, 1);
        assert_eq!(session.visited_paths, vec!["/"]);
        assert_eq!(session.browser, "Safari");
        assert_eq!(session.os, "macOS");
        assert_eq!(session.referrer, "https://news.example/item");
        assert!(session.exit_at.is_none());
        assert_eq!(h.tracker.current().unwrap(), session);

        let history = h.tracker.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, session.id);
        let stats = h.tracker.store().statistics();
        assert_eq!(stats.today.visitor_count, 1);
        assert_eq!(stats.today.page_views, 1);
    }

    #[tokio::test]
    async fn test_repeated_start_reuses_session() {
        let h = harness();
        let first = h.tracker.start("/").await;
        let second = h.tracker.start("/about").await;
        let third = h.tracker.start("/about").await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.id, third.id);
        assert_eq!(third.page_views, 3);
        assert_eq!(third.visited_paths, vec!["/", "/about"]);

        let history = h.tracker.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].page_views, 3);

        let stats = h.tracker.store().statistics();
        assert_eq!(stats.today.visitor_count, 1);
        assert_eq!(stats.today.page_views, 3);
        assert_eq!(stats.total.visitor_count, 1);
    }

    #[tokio::test]
    async fn test_start_publishes_events() {
        let h = harness();
        let mut events = h.tracker.store().bus().subscribe();

        h.tracker.start("/").await;
        h.tracker.start("/pricing").await;

        assert_eq!(
            events.recv().await.unwrap().event_type,
            AnalyticsEventType::SessionStarted
        );
        assert_eq!(
            events.recv().await.unwrap().event_type,
            AnalyticsEventType::PageViewed
        );
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_page_views() {
        let h = harness();
        h.tracker.start("/").await;
        h.clock.advance(Duration::seconds(10));

        let session = h.tracker.heartbeat().await.unwrap();
        assert_eq!(session.page_views, 1);
        assert_eq!(session.last_seen_at, Some(h.clock.now()));
        assert_eq!(
            h.tracker.store().history()[0].last_seen_at,
            Some(h.clock.now())
        );
        assert_eq!(h.tracker.store().statistics().today.page_views, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_without_session_is_noop() {
        let h = harness();
        assert!(h.tracker.heartbeat().await.is_none());
        assert!(h.tracker.store().history().is_empty());

        h.tracker.start("/").await;
        h.tracker.end().await;
        assert!(h.tracker.heartbeat().await.is_none());
    }

    #[tokio::test]
    async fn test_end_computes_duration() {
        let h = harness();
        let started = h.tracker.start("/").await;
        h.clock.advance(Duration::milliseconds(95_700));

        let ended = h.tracker.end().await.unwrap();
        assert_eq!(ended.id, started.id);
        assert_eq!(ended.duration_secs, Some(95));
        assert_eq!(ended.exit_at, Some(h.clock.now()));

        let history = h.tracker.store().history();
        assert_eq!(history[0].duration_secs, Some(95));
        assert_eq!(h.tracker.store().statistics().online_now, 0);
    }

    #[tokio::test]
    async fn test_end_twice_is_idempotent() {
        let h = harness();
        h.tracker.start("/").await;
        h.clock.advance(Duration::seconds(30));

        let first = h.tracker.end().await.unwrap();
        let second = h.tracker.end().await.unwrap();
        assert_eq!(first.duration_secs, second.duration_secs);
        assert_eq!(first.exit_at, second.exit_at);

        h.clock.advance(Duration::seconds(5));
        let later = h.tracker.end().await.unwrap();
        assert_eq!(later.duration_secs, Some(35));
    }

    #[tokio::test]
    async fn test_end_without_session_is_noop() {
        let h = harness();
        assert!(h.tracker.end().await.is_none());
    }

    #[tokio::test]
    async fn test_start_after_end_keeps_session() {
        let h = harness();
        let first = h.tracker.start("/").await;
        h.clock.advance(Duration::seconds(20));
        let ended = h.tracker.end().await.unwrap();

        h.clock.advance(Duration::seconds(5));
        let resumed = h.tracker.start("/about").await;
        assert_eq!(resumed.id, first.id);
        assert_eq!(resumed.page_views, 2);
        assert_eq!(resumed.visited_paths, vec!["/", "/about"]);
        assert_eq!(resumed.exit_at, ended.exit_at);
        assert_eq!(resumed.duration_secs, Some(20));

        let history = h.tracker.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].page_views, 2);
        let stats = h.tracker.store().statistics();
        assert_eq!(stats.today.visitor_count, 1);
        assert_eq!(stats.today.page_views, 2);
    }

    #[tokio::test]
    async fn test_start_after_cleared_record_begins_new_session() {
        let h = harness();
        let first = h.tracker.start("/").await;
        h.tracker.end().await;
        h.tracker.tab().remove(CURRENT_SESSION_KEY).unwrap();

        let second = h.tracker.start("/").await;
        assert_ne!(first.id, second.id);
        assert_eq!(second.page_views, 1);
        assert_eq!(h.tracker.store().history().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let h = harness();
        let first = h.tracker.start("/").await;
        h.tracker.start("/blog").await;

        h.tracker.clear();
        let stats = h.tracker.store().statistics();
        assert!(stats.is_empty());
        assert!(stats.recent_visitors.is_empty());
        assert!(h.tracker.current().is_none());

        let next = h.tracker.start("/").await;
        assert_ne!(next.id, first.id);
        assert_eq!(next.page_views, 1);
    }

    #[tokio::test]
    async fn test_failed_geolocation_records_unknown() {
        let geo = GeoChain::new(vec![dynp(Failing), dynp(Failing)]);
        let h = harness_with(geo);

        let session = h.tracker.start("/").await;
        assert_eq!(session.ip_address, UNKNOWN_IP);
        assert_eq!(session.country, "");
        assert_eq!(session.city, "");
        assert_eq!(h.tracker.store().history().len(), 1);
    }

    #[tokio::test]
    async fn test_geolocation_resolved_once() {
        let geo = GeoChain::new(vec![dynp(Failing), dynp(Fixed)]);
        let h = harness_with(geo);

        let session = h.tracker.start("/").await;
        assert_eq!(session.ip_address, "203.0.113.7");
        assert_eq!(session.city, "Oslo");

        let again = h.tracker.start("/next").await;
        assert_eq!(again.country, "Norway");
    }

    #[tokio::test]
    async fn test_statistics_total_matches_history() {
        let h = harness();
        for i in 0..4 {
            let tab = SessionTracker::new(
                Arc::new(MemoryStore::new()),
                Arc::clone(h.tracker.store()),
                GeoChain::disabled(),
                PageEnvironment::default(),
            );
            tab.start(&format!("/p{}", i)).await;
        }

        let history: Vec<VisitorSession> = storage::read_json(&h.durable, HISTORY_KEY);
        let stats = h.tracker.store().statistics();
        assert_eq!(stats.total.visitor_count as usize, history.len());
        assert_eq!(history.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interleaved_tabs_never_duplicate() {
        let h = harness();
        let shared = h.durable.clone();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::new(AggregateStore::new(
                Arc::new(shared.handle()),
                h.clock.clone(),
                EventBus::new(),
                AggregateConfig::default(),
            ));
            let tab = SessionTracker::new(
                Arc::new(MemoryStore::new()),
                store,
                GeoChain::disabled(),
                PageEnvironment::default(),
            );
            handles.push(tokio::spawn(async move { tab.start("/").await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = shared.get(HISTORY_KEY).unwrap().unwrap();
        let history: Vec<VisitorSession> = serde_json::from_str(&raw).unwrap();
        assert!(history.len() == 1 || history.len() == 2);
        let ids: HashSet<&str> = history.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), history.len());
    }
}
