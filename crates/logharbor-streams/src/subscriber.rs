use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use logharbor_types::ServerEvent;
use tokio::sync::mpsc;

/// One attached consumer with a bounded delivery mailbox and a dropped-event
/// counter. The producer side never blocks on this: a full channel counts
/// as a drop rather than a stall, the same backpressure
/// primitive as `kubescope-logs::stream::LogStreamManager::spawn_pod_stream`
/// (`mpsc::Sender::try_send` plus an atomic drop counter).
#[derive(Clone)]
pub struct Subscriber {
    pub id: u64,
    capacity: usize,
    tx: mpsc::Sender<ServerEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscriber {
    /// Non-blocking delivery: on a full channel, count the drop and return.
    pub fn try_send(&self, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Entries currently queued but not yet consumed.
    pub fn channel_depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a new subscriber and its receiving half. `capacity` is the
/// configured per-subscriber channel depth (`subscriber.buffer_lines`).
pub fn new_subscriber(id: u64, capacity: usize) -> (Subscriber, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let subscriber = Subscriber {
        id,
        capacity: capacity.max(1),
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (subscriber, rx)
}

/// Non-blocking fan-out to every subscriber in `subscribers`. O(subscribers)
/// and independent of any one subscriber's consumption rate.
pub fn broadcast(subscribers: &[Subscriber], event: &ServerEvent) {
    for sub in subscribers {
        sub.try_send(event.clone());
    }
}
