//! Subscriptions that keep dashboards converged on the durable store.
//!
//! Three triggers feed every subscription, because none of them is enough on
//! its own: the in-process [`EventBus`](pulse_core::EventBus) only covers
//! trackers sharing this process, storage change feeds do not exist for every
//! backend, and polling alone adds latency. A subscriber sees any durable
//! change within one poll interval at worst.

use std::sync::Arc;

use pulse_core::storage::{StorageChange, DAILY_KEY, HISTORY_KEY};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::aggregations::{AggregateStore, Statistics};

/// Why a subscription woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Broadcast,
    Storage,
    Poll,
}

/// Handle to a running subscription. Dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl AggregateStore {
    /// Call `callback` with fresh statistics now and whenever they change.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(Statistics) + Send + Sync + 'static,
    {
        let store = Arc::clone(self);
        let mut events = Some(store.bus.subscribe());
        let mut changes = store.durable.changes();
        let poll_interval = store.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial delivery below covers it.
            ticker.tick().await;

            let mut last = store.statistics();
            callback(last.clone());

            loop {
                let trigger = tokio::select! {
                    signal = next_event(&mut events) => {
                        if !signal {
                            events = None;
                            continue;
                        }
                        Trigger::Broadcast
                    }
                    change = next_change(&mut changes) => match change {
                        Some(Some(change)) if is_tracked(&change) => Trigger::Storage,
                        Some(Some(_)) => continue,
                        Some(None) => Trigger::Storage,
                        None => {
                            changes = None;
                            continue;
                        }
                    },
                    _ = ticker.tick() => Trigger::Poll,
                };

                let stats = store.statistics();
                if stats != last {
                    debug!("Statistics changed ({:?}), notifying subscriber", trigger);
                    callback(stats.clone());
                    last = stats;
                } else {
                    trace!("No change after {:?}", trigger);
                }
            }
        });

        Subscription { handle }
    }

    /// Subscription that forwards statistics into a channel.
    pub fn watch(self: &Arc<Self>) -> (Subscription, mpsc::UnboundedReceiver<Statistics>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |stats| {
            let _ = tx.send(stats);
        });
        (subscription, rx)
    }
}

fn is_tracked(change: &StorageChange) -> bool {
    change.key == HISTORY_KEY || change.key == DAILY_KEY
}

/// `true` on an event (or lag), `false` once the bus is gone.
async fn next_event(events: &mut Option<broadcast::Receiver<pulse_core::AnalyticsEvent>>) -> bool {
    match events {
        Some(rx) => match rx.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => false,
        },
        None => std::future::pending().await,
    }
}

/// `Some(Some(change))` on a change, `Some(None)` after lag, `None` once the
/// feed is gone.
async fn next_change(
    changes: &mut Option<broadcast::Receiver<StorageChange>>,
) -> Option<Option<StorageChange>> {
    match changes {
        Some(rx) => match rx.recv().await {
            Ok(change) => Some(Some(change)),
            Err(RecvError::Lagged(_)) => Some(None),
            Err(RecvError::Closed) => None,
        },
        None => std::future::pending().await,
    }
}
