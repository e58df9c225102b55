//! Bounded outbound queue with a telemetry-first drop policy.
//!
//! Session events are never discarded: when the queue is full and holds no
//! telemetry to evict, the producing session waits for room. Telemetry is
//! cheap to lose, so it is evicted oldest-first (or the incoming snapshot is
//! dropped) and the loss is reported on the next delivered snapshot.

use hostdeck_core::{DeckError, DeckResult, Outbound};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Counters describing bridge behavior since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Events handed to the consumer.
    pub delivered: u64,
    /// Telemetry snapshots discarded under pressure.
    pub telemetry_dropped: u64,
    /// Times a session producer had to wait for room.
    pub session_waits: u64,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<Outbound>,
    closed: bool,
    /// Telemetry dropped since the last delivered snapshot.
    dropped_pending: u64,
    stats: BridgeStats,
}

impl QueueState {
    /// Remove the oldest queued telemetry event. Returns false when the
    /// queue holds none.
    fn evict_oldest_telemetry(&mut self) -> bool {
        match self.events.iter().position(Outbound::is_telemetry) {
            Some(pos) => {
                self.events.remove(pos);
                self.note_dropped();
                true
            }
            None => false,
        }
    }

    fn note_dropped(&mut self) {
        self.dropped_pending += 1;
        self.stats.telemetry_dropped += 1;
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when an event is queued or the bridge closes.
    readable: Notify,
    /// Signalled when room frees up or the bridge closes.
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            debug!(pending = state.events.len(), "outbound queue closed");
        }
        drop(state);
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
    }
}

/// Create a connected sender/receiver pair with the given capacity.
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            events: VecDeque::with_capacity(capacity.min(4096)),
            closed: false,
            dropped_pending: 0,
            stats: BridgeStats::default(),
        }),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        OutboundSender {
            shared: shared.clone(),
        },
        OutboundReceiver { shared },
    )
}

/// Producer side. Cloned into every session pump and the sampler.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Queue an event.
    ///
    /// Telemetry never waits. Every other event waits for room while the
    /// queue is full of undroppable events.
    pub async fn send(&self, event: Outbound) -> DeckResult<()> {
        if event.is_telemetry() {
            return self.push_telemetry(event);
        }

        let mut waited = false;
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(DeckError::BridgeClosed);
                }
                if state.events.len() < self.shared.capacity || state.evict_oldest_telemetry() {
                    state.events.push_back(event);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
                if !waited {
                    waited = true;
                    state.stats.session_waits += 1;
                    trace!(capacity = self.shared.capacity, "outbound queue full, waiting");
                }
            }

            notified.await;
        }
    }

    /// Queue a telemetry event without waiting, discarding the oldest
    /// telemetry (or this one) when the queue is full.
    pub fn push_telemetry(&self, event: Outbound) -> DeckResult<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(DeckError::BridgeClosed);
        }
        if state.events.len() >= self.shared.capacity && !state.evict_oldest_telemetry() {
            state.note_dropped();
            debug!(
                dropped = state.stats.telemetry_dropped,
                "outbound queue saturated by session output, telemetry dropped"
            );
            return Ok(());
        }
        state.events.push_back(event);
        drop(state);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Close the queue. Queued events stay readable; new sends fail.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> BridgeStats {
        self.shared.lock().stats
    }

    /// Number of queued, undelivered events.
    pub fn len(&self) -> usize {
        self.shared.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why `try_recv` returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing queued yet.
    Empty,
    /// Closed and fully drained.
    Closed,
}

/// Consumer side, held by the presentation boundary.
#[derive(Debug)]
pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Wait for the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Outbound> {
        // The wakeup must outlive the `&mut self` borrow taken by `try_recv`.
        let shared = self.shared.clone();
        loop {
            let notified = shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {}
            }

            notified.await;
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        let mut state = self.shared.lock();
        match state.events.pop_front() {
            Some(mut event) => {
                if let Outbound::TelemetryUpdate { dropped_before, .. } = &mut event {
                    *dropped_before = std::mem::take(&mut state.dropped_pending);
                }
                state.stats.delivered += 1;
                drop(state);
                self.shared.writable.notify_waiters();
                Ok(event)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.shared.lock().stats
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        // Nobody is left to drain the queue; release blocked producers.
        self.shared.close();
    }
}
