//! Periodic and activity-driven heartbeats.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_core::clock::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::tracker::SessionTracker;

/// User interaction that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Click,
    Key,
    Scroll,
    Touch,
}

/// Repeating heartbeat task. Stopped on `stop()` or drop.
pub struct HeartbeatDriver {
    handle: JoinHandle<()>,
}

impl HeartbeatDriver {
    /// Heartbeat `tracker` every `interval`, starting one interval from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(tracker: Arc<SessionTracker>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            debug!("Heartbeat driver started ({:?})", interval);
            loop {
                ticker.tick().await;
                if tracker.heartbeat().await.is_none() {
                    trace!("Heartbeat skipped, no live session");
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for HeartbeatDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Lets activity through at most once per `gap`.
pub struct ActivityThrottle {
    clock: Arc<dyn Clock>,
    gap: chrono::Duration,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ActivityThrottle {
    pub fn new(clock: Arc<dyn Clock>, gap: Duration) -> Self {
        Self {
            clock,
            gap: chrono::Duration::from_std(gap).unwrap_or_else(|_| chrono::Duration::days(365)),
            last: Mutex::new(None),
        }
    }

    /// `true` if this signal should trigger a heartbeat.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        match *last {
            Some(prev) if now - prev < self.gap => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pulse_analytics::{AggregateConfig, AggregateStore};
    use pulse_core::clock::ManualClock;
    use pulse_core::event_bus::EventBus;
    use pulse_core::geo::GeoChain;
    use pulse_core::session::PageEnvironment;
    use pulse_core::storage::MemoryStore;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_date(
            NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
        ))
    }

    #[test]
    fn test_throttle_allows_once_per_gap() {
        let clock = clock();
        let throttle = ActivityThrottle::new(clock.clone(), Duration::from_secs(5));

        assert!(throttle.allow());
        assert!(!throttle.allow());

        clock.advance(chrono::Duration::seconds(4));
        assert!(!throttle.allow());

        clock.advance(chrono::Duration::seconds(1));
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_zero_gap_never_throttles() {
        let throttle = ActivityThrottle::new(clock(), Duration::ZERO);
        assert!(throttle.allow());
        assert!(throttle.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_heartbeats_on_interval() {
        let store = Arc::new(AggregateStore::new(
            Arc::new(MemoryStore::new()),
            clock(),
            EventBus::new(),
            AggregateConfig::default(),
        ));
        let tracker = Arc::new(SessionTracker::new(
            Arc::new(MemoryStore::new()),
            store,
            GeoChain::disabled(),
            PageEnvironment::default(),
        ));
        tracker.start("/").await;
        let mut events = tracker.store().bus().subscribe();

        let driver = HeartbeatDriver::spawn(Arc::clone(&tracker), Duration::from_secs(10));
        assert!(driver.is_running());

        let event = tokio::time::timeout(Duration::from_secs(11), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.event_type == pulse_core::AnalyticsEventType::Heartbeat {
                    return event;
                }
            }
        })
        .await
        .expect("no heartbeat within one interval");
        assert_eq!(event.session_id, tracker.current().map(|s| s.id));

        driver.stop();
        assert_eq!(tracker.current().unwrap().page_views, 1);
    }
}
