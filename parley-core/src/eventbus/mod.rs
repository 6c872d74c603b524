//! src/eventbus/mod.rs
//!
//! In-process bus for runtime notices (session state changes, handler failures,
//! loop start/stop). Also carries the stop signal for the event loop.
//!
//! The loop publishes from a single task and must never stall on a slow subscriber,
//! so delivery is best-effort: a full subscriber queue drops the notice with a warning.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use parley_common::models::{AccountId, ConnectionState, SessionHandle};

use crate::runtime::StopReason;

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Published once before the first tick.
    LoopStarted,

    SessionState {
        session: SessionHandle,
        account: AccountId,
        state: ConnectionState,
    },

    /// A handler returned an error. `source` is the event kind or "heartbeat".
    HandlerFailed {
        source: String,
        session: SessionHandle,
        error: String,
    },

    Stopped {
        reason: StopReason,
        ticks: u64,
    },
}

impl BusEvent {
    pub fn event_type(&self) -> String {
        match self {
            BusEvent::LoopStarted => "loop.started".to_string(),
            BusEvent::SessionState { .. } => "session.state".to_string(),
            BusEvent::HandlerFailed { .. } => "handler.failed".to_string(),
            BusEvent::Stopped { .. } => "loop.stopped".to_string(),
        }
    }
}

/// Default size for each subscriber's buffer.
const DEFAULT_BUFFER_SIZE: usize = 10000;

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<BusEvent>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    pub shutdown_rx: watch::Receiver<bool>,
    buffer_size: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Arc::new(Mutex::new(vec![])),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Asks the event loop to stop at its next tick boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Clears a previous shutdown so the loop can be run again.
    pub fn reset_shutdown(&self) {
        let _ = self.shutdown_tx.send(false);
    }

    /// Returns a receiver on which notices will be delivered.
    pub fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<BusEvent> {
        let size = buffer_size.unwrap_or(self.buffer_size).max(1);
        let (tx, rx) = mpsc::channel(size);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish a notice to all subscribers. Closed subscribers are pruned.
    pub fn publish(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| match s.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("(EventBus) subscriber queue full, dropping {}", event.event_type());
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe(Some(5));
        let mut rx2 = bus.subscribe(Some(5));

        bus.publish(BusEvent::LoopStarted);

        let evt1 = rx1.recv().await.expect("rx1 should get event");
        let evt2 = rx2.recv().await.expect("rx2 should get event");
        assert_eq!(evt1, BusEvent::LoopStarted);
        assert_eq!(evt2, BusEvent::LoopStarted);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Some(1));

        bus.publish(BusEvent::LoopStarted);
        // Queue is full, this one is dropped but publish returns right away.
        bus.publish(BusEvent::Stopped { reason: StopReason::Stopped, ticks: 1 });

        assert_eq!(rx.recv().await, Some(BusEvent::LoopStarted));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.publish(BusEvent::LoopStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_shutdown_flag() {
        let bus = EventBus::new();
        assert!(!bus.is_shutdown());

        let clone = bus.clone();
        clone.shutdown();
        assert!(bus.is_shutdown());

        bus.reset_shutdown();
        assert!(!clone.is_shutdown());
    }
}
