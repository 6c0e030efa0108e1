//! Event bus for ledger changes
//!
//! Services emit a [`LedgerEvent`] after their transaction commits. Interested
//! parties hold a [`Subscription`] for as long as they care; dropping it is the
//! unsubscribe. There is no global registry of callbacks.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::db::{RedemptionStatus, VerificationState};

/// Events emitted by services after a successful commit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    BehaviorRecorded {
        id: String,
        child_id: String,
        points: i64,
        state: VerificationState,
    },
    BehaviorDecided {
        id: String,
        child_id: String,
        state: VerificationState,
        decided_by: String,
    },
    RedemptionRequested {
        id: String,
        child_id: String,
        reward_id: String,
        points: i64,
        status: RedemptionStatus,
    },
    RedemptionDecided {
        id: String,
        child_id: String,
        status: RedemptionStatus,
        decided_by: String,
    },
    BalanceChanged {
        child_id: String,
        event_id: String,
        delta: i64,
        balance: i64,
    },
    ChildRemoved {
        id: String,
        family_id: String,
    },
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events until the returned handle is dropped
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped subscription to the event bus
pub struct Subscription {
    receiver: broadcast::Receiver<LedgerEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns None once the bus is gone.
    ///
    /// Events missed because this subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<LedgerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Subscription lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<LedgerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Services log each committed write at `info`; the listener only traces the stream
fn log_event(event: &LedgerEvent) {
    debug!(event = ?event, "Ledger event");
}

/// Spawn a background task that logs all events; it stops when the bus is dropped
pub fn spawn_logging_listener(event_bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut subscription = event_bus.subscribe();

    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            log_event(&event);
        }
        debug!("Event bus closed, stopping listener");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tokio::time::{timeout, Duration};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_listener_stays_below_info() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_event(&LedgerEvent::BehaviorRecorded {
                id: "b1".into(),
                child_id: "kid".into(),
                points: 5,
                state: VerificationState::Verified,
            });
        });

        assert!(captured.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe();

        bus.emit(LedgerEvent::BalanceChanged {
            child_id: "kid".into(),
            event_id: "e1".into(),
            delta: 5,
            balance: 5,
        });

        let event = timeout(Duration::from_millis(100), subscription.recv())
            .await
            .expect("timeout")
            .expect("bus closed");

        match event {
            LedgerEvent::BalanceChanged { child_id, balance, .. } => {
                assert_eq!(child_id, "kid");
                assert_eq!(balance, 5);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let subscription = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic even with no subscribers
        bus.emit(LedgerEvent::ChildRemoved { id: "kid".into(), family_id: "fam".into() });
    }
}
