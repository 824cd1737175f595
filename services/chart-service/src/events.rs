//! Engine signals for the alerting and metrics collaborators
//!
//! Signals never flow back to the tick source. Anyone interested (logging,
//! alerting, tests) subscribes to the broadcast channel; emitting with no
//! listener is not an error.

use crate::bucket::BucketKey;
use crate::session::CloseReason;
use crate::timeframe::Timeframe;
use serde::Serialize;
use services_common::{Symbol, TimestampMs};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 4_096;

/// Non-fatal condition reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Tick mapped to a bucket that had already rolled over
    DroppedLateTick {
        /// Instrument
        symbol: Symbol,
        /// Series timeframe
        timeframe: Timeframe,
        /// Timestamp carried by the tick
        tick_timestamp: TimestampMs,
        /// Bucket the tick belonged to
        tick_bucket: TimestampMs,
        /// Newest bucket already open or sealed for the series
        current_bucket: TimestampMs,
    },
    /// Sealed bar dropped after the retry budget ran out
    PersistenceFailed {
        /// Dropped bar
        key: BucketKey,
        /// Attempts made
        attempts: u32,
        /// Last storage error
        reason: String,
    },
    /// Session closed because its queue stayed full
    SubscriberOverrun {
        /// Closed session
        session_id: u64,
    },
    /// Session reached its terminal state
    SessionClosed {
        /// Closed session
        session_id: u64,
        /// Why it closed
        reason: CloseReason,
    },
}

/// Broadcast sender for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventSink {
    /// Create a sink with a bounded replay buffer
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Listen for events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit a signal
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event listeners attached");
        }
    }
}

/// Log every event until the sink is dropped
pub async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::DroppedLateTick {
                symbol,
                timeframe,
                tick_timestamp,
                current_bucket,
                ..
            }) => {
                debug!(
                    %symbol,
                    %timeframe,
                    tick_timestamp = tick_timestamp.as_millis(),
                    current_bucket = current_bucket.as_millis(),
                    "Dropped late tick"
                );
            }
            Ok(EngineEvent::PersistenceFailed {
                key,
                attempts,
                reason,
            }) => {
                error!(%key, attempts, %reason, "Bar dropped after persistence failure");
            }
            Ok(EngineEvent::SubscriberOverrun { session_id }) => {
                warn!(session_id, "Subscriber overran its queue");
            }
            Ok(EngineEvent::SessionClosed { session_id, reason }) => {
                debug!(session_id, ?reason, "Session closed");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
