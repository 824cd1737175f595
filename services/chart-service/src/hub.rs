//! Registry of live sessions and fan-out of persisted bars

use crate::candle::Candlestick;
use crate::config::SubscriptionConfig;
use crate::error::{ChartError, ChartResult};
use crate::events::{EngineEvent, EventSink};
use crate::metrics::ChartMetrics;
use crate::session::{
    CloseReason, Offer, QueueLimits, SessionShared, SubscriberSession, SubscriptionFilter,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registry shared with session handles
///
/// Sessions hold a `Weak` reference so dropping a handle can unregister
/// without keeping the hub alive.
#[derive(Debug)]
pub(crate) struct HubInner {
    sessions: DashMap<u64, Arc<SessionShared>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    limits: QueueLimits,
    metrics: Arc<ChartMetrics>,
    events: EventSink,
}

impl HubInner {
    fn remove(&self, session_id: u64, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        session.begin_drain(reason);
        self.metrics.record_session_closed();
        self.events.emit(EngineEvent::SessionClosed { session_id, reason });
        debug!(session_id, ?reason, "Session unregistered");
        true
    }

    pub(crate) fn unregister(&self, session_id: u64) {
        self.remove(session_id, CloseReason::Unsubscribed);
    }
}

/// Fan-out point between the persistence pipeline and subscribers
///
/// `publish` is only ever called for bars the store reported as newly
/// inserted.
#[derive(Debug, Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    /// Create an empty hub
    #[must_use]
    pub fn new(config: &SubscriptionConfig, metrics: Arc<ChartMetrics>, events: EventSink) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                limits: QueueLimits {
                    capacity: config.queue_capacity,
                    policy: config.backpressure,
                    overrun_grace: config.overrun_grace(),
                },
                metrics,
                events,
            }),
        }
    }

    /// Register a session for `filter`
    pub fn register(&self, filter: SubscriptionFilter) -> ChartResult<SubscriberSession> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChartError::EngineShuttingDown);
        }
        if filter.is_empty() {
            return Err(ChartError::InvalidRequest(
                "subscription needs at least one symbol and timeframe".into(),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared::new(id, filter, self.inner.limits));
        self.inner.sessions.insert(id, Arc::clone(&shared));
        shared.activate();
        self.inner.metrics.record_session_opened();

        // close_all may have run between the check and the insert
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.remove(id, CloseReason::EngineShutdown);
            return Err(ChartError::EngineShuttingDown);
        }
        info!(session_id = id, "Session registered");
        Ok(SubscriberSession::new(shared, Arc::downgrade(&self.inner)))
    }

    /// Unregister a session; its queued bars are still delivered
    pub fn unregister(&self, session_id: u64) {
        self.inner.unregister(session_id);
    }

    /// Offer a persisted bar to every matching session
    ///
    /// Never waits on a subscriber. Returns the number of sessions the bar
    /// was enqueued on.
    pub fn publish(&self, bar: &Candlestick) -> usize {
        let inner = &self.inner;
        inner.metrics.record_published();
        let now = Instant::now();
        let mut delivered = 0;
        let mut overrun = Vec::new();

        for entry in &inner.sessions {
            let session = entry.value();
            if !session.filter().matches(&bar.key) {
                continue;
            }
            match session.offer(bar, now) {
                Offer::Enqueued => {
                    delivered += 1;
                    inner.metrics.record_delivered();
                }
                Offer::Evicted => {
                    delivered += 1;
                    inner.metrics.record_delivered();
                    inner.metrics.record_evicted();
                }
                Offer::Rejected => inner.metrics.record_rejected(),
                Offer::Overrun => overrun.push(session.id()),
                Offer::Closed => {}
            }
        }

        // removal takes a shard write lock, so it cannot happen mid-iteration
        for session_id in overrun {
            if inner.remove(session_id, CloseReason::Overrun) {
                warn!(session_id, "Subscriber overrun, session closed");
                inner.metrics.record_overrun();
                inner.events.emit(EngineEvent::SubscriberOverrun { session_id });
            }
        }
        delivered
    }

    /// Close every session and refuse new registrations
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<u64> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            self.inner.remove(id, CloseReason::EngineShutdown);
        }
        info!(sessions = count, "Subscription hub closed");
    }

    /// Registered sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}
