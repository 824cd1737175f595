//! Subscriber sessions: filter, bounded queue and lifecycle
//!
//! Publishing never waits on a session. The hub offers each bar to the
//! session queue under a short lock; the consumer waits on a `Notify`
//! and drains at its own pace.

use crate::bucket::BucketKey;
use crate::candle::Candlestick;
use crate::error::ChartError;
use crate::hub::HubInner;
use crate::timeframe::Timeframe;
use futures::Stream;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use services_common::Symbol;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a full session queue does with the next bar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the queue head to admit the new bar
    #[default]
    DropOldest,
    /// Refuse new bars; close the session if the queue stays full past the grace period
    DisconnectSlow,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not yet registered
    Connecting,
    /// Registered, queue below capacity
    Active,
    /// Registered, queue at capacity
    Backpressured,
    /// Unregistered; remaining bars are flushed, then the session closes
    Draining,
    /// Terminal
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Caller unsubscribed or dropped the session
    Unsubscribed,
    /// Queue stayed full past the grace period
    Overrun,
    /// Service shut down
    EngineShutdown,
}

/// Stream termination carrying the close reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscription {session_id} ended: {reason:?}")]
pub struct StreamEnd {
    /// Closed session
    pub session_id: u64,
    /// Why it closed
    pub reason: CloseReason,
}

impl StreamEnd {
    /// Error form of an abnormal end; `None` after an unsubscribe
    #[must_use]
    pub const fn into_error(self) -> Option<ChartError> {
        match self.reason {
            CloseReason::Unsubscribed => None,
            CloseReason::Overrun => Some(ChartError::SubscriberOverrun {
                session_id: self.session_id,
            }),
            CloseReason::EngineShutdown => Some(ChartError::EngineShuttingDown),
        }
    }
}

/// Symbol and timeframe sets a session receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    symbols: FxHashSet<Symbol>,
    timeframes: FxHashSet<Timeframe>,
}

impl SubscriptionFilter {
    /// Filter over explicit sets
    pub fn new(
        symbols: impl IntoIterator<Item = Symbol>,
        timeframes: impl IntoIterator<Item = Timeframe>,
    ) -> Self {
        Self {
            symbols: symbols.into_iter().collect(),
            timeframes: timeframes.into_iter().collect(),
        }
    }

    /// Filter for several symbols on one timeframe
    pub fn for_timeframe(symbols: impl IntoIterator<Item = Symbol>, timeframe: Timeframe) -> Self {
        Self::new(symbols, [timeframe])
    }

    /// True if bars for `key` belong to this subscription
    #[must_use]
    pub fn matches(&self, key: &BucketKey) -> bool {
        self.timeframes.contains(&key.timeframe) && self.symbols.contains(&key.symbol)
    }

    /// True if the filter can never match
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() || self.timeframes.is_empty()
    }

    /// Subscribed symbols
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

/// One streamed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeResponse {
    /// Instrument of the bar
    pub symbol: Symbol,
    /// Finalized bar
    pub bar: Candlestick,
}

/// Queue limits of one session
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// Maximum queued bars
    pub capacity: usize,
    /// Policy at capacity
    pub policy: BackpressurePolicy,
    /// How long the queue may stay full under `DisconnectSlow`
    pub overrun_grace: Duration,
}

/// Result of offering a bar to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Enqueued,
    /// Enqueued after evicting the oldest bar
    Evicted,
    /// Queue full, bar refused, still within grace
    Rejected,
    /// Queue full past grace; session is now closed
    Overrun,
    /// Session no longer accepts bars
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    queue: VecDeque<Candlestick>,
    state: SessionState,
    close_reason: Option<CloseReason>,
    full_since: Option<Instant>,
}

/// State shared between the hub registry and the session handle
#[derive(Debug)]
pub(crate) struct SessionShared {
    id: u64,
    filter: SubscriptionFilter,
    limits: QueueLimits,
    inner: Mutex<SessionInner>,
    notify: Notify,
}

impl SessionShared {
    pub(crate) fn new(id: u64, filter: SubscriptionFilter, limits: QueueLimits) -> Self {
        Self {
            id,
            filter,
            limits,
            inner: Mutex::new(SessionInner {
                queue: VecDeque::with_capacity(limits.capacity.min(1_024)),
                state: SessionState::Connecting,
                close_reason: None,
                full_since: None,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    pub(crate) fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Connecting {
            inner.state = SessionState::Active;
        }
    }

    pub(crate) fn offer(&self, bar: &Candlestick, now: Instant) -> Offer {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Draining | SessionState::Closed => return Offer::Closed,
            SessionState::Connecting | SessionState::Active | SessionState::Backpressured => {}
        }

        if inner.queue.len() < self.limits.capacity {
            inner.queue.push_back(bar.clone());
            inner.state = SessionState::Active;
            inner.full_since = None;
            drop(inner);
            self.notify.notify_one();
            return Offer::Enqueued;
        }

        inner.state = SessionState::Backpressured;
        match self.limits.policy {
            BackpressurePolicy::DropOldest => {
                inner.queue.pop_front();
                inner.queue.push_back(bar.clone());
                drop(inner);
                self.notify.notify_one();
                Offer::Evicted
            }
            BackpressurePolicy::DisconnectSlow => {
                let full_since = *inner.full_since.get_or_insert(now);
                if now.saturating_duration_since(full_since) < self.limits.overrun_grace {
                    return Offer::Rejected;
                }
                inner.queue.clear();
                inner.state = SessionState::Closed;
                inner.close_reason = Some(CloseReason::Overrun);
                drop(inner);
                self.notify.notify_one();
                Offer::Overrun
            }
        }
    }

    /// Stop accepting bars; queued bars are still delivered
    pub(crate) fn begin_drain(&self, reason: CloseReason) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return;
        }
        inner.state = SessionState::Draining;
        inner.close_reason.get_or_insert(reason);
        drop(inner);
        self.notify.notify_one();
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn try_next(&self) -> Option<Result<Candlestick, StreamEnd>> {
        let mut inner = self.inner.lock();
        if let Some(bar) = inner.queue.pop_front() {
            if inner.state == SessionState::Backpressured
                && inner.queue.len() < self.limits.capacity
            {
                inner.state = SessionState::Active;
                inner.full_since = None;
            }
            return Some(Ok(bar));
        }
        match inner.state {
            SessionState::Draining | SessionState::Closed => {
                inner.state = SessionState::Closed;
                Some(Err(StreamEnd {
                    session_id: self.id,
                    reason: inner.close_reason.unwrap_or(CloseReason::Unsubscribed),
                }))
            }
            SessionState::Connecting | SessionState::Active | SessionState::Backpressured => None,
        }
    }
}

/// Caller-side handle of one subscription
///
/// Dropping the handle (or the stream made from it) unregisters the session.
#[derive(Debug)]
pub struct SubscriberSession {
    shared: Arc<SessionShared>,
    hub: Weak<HubInner>,
}

impl SubscriberSession {
    pub(crate) const fn new(shared: Arc<SessionShared>, hub: Weak<HubInner>) -> Self {
        Self { shared, hub }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Bars queued and not yet received
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue_len()
    }

    /// Next bar, waiting until one is published
    ///
    /// Returns `Err(StreamEnd)` once the session is closed and drained.
    pub async fn recv(&self) -> Result<SubscribeResponse, StreamEnd> {
        loop {
            match self.shared.try_next() {
                Some(Ok(bar)) => {
                    return Ok(SubscribeResponse {
                        symbol: bar.key.symbol.clone(),
                        bar,
                    });
                }
                Some(Err(end)) => return Err(end),
                None => self.shared.notify.notified().await,
            }
        }
    }

    /// Next queued bar without waiting
    pub fn try_recv(&self) -> Option<Result<SubscribeResponse, StreamEnd>> {
        self.shared.try_next().map(|next| {
            next.map(|bar| SubscribeResponse {
                symbol: bar.key.symbol.clone(),
                bar,
            })
        })
    }

    /// Stop receiving new bars; already queued bars are still delivered
    pub fn unsubscribe(&self) {
        match self.hub.upgrade() {
            Some(hub) => hub.unregister(self.shared.id),
            None => self.shared.begin_drain(CloseReason::Unsubscribed),
        }
    }

    /// Convert into a stream of bars
    ///
    /// The stream ends after an unsubscribe has been drained, and yields a
    /// final `Err(StreamEnd)` when the session closed for overrun or shutdown.
    pub fn into_stream(self) -> impl Stream<Item = Result<SubscribeResponse, StreamEnd>> {
        futures::stream::unfold(Some(self), |session| async move {
            let session = session?;
            match session.recv().await {
                Ok(item) => Some((Ok(item), Some(session))),
                Err(end) if end.reason == CloseReason::Unsubscribed => None,
                Err(end) => Some((Err(end), None)),
            }
        })
    }
}

impl Drop for SubscriberSession {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(self.shared.id);
        }
    }
}
