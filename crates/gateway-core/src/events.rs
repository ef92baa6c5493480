//! Per-session event queues drained by long-poll readers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The sentinel returned when a long poll times out with nothing to deliver.
/// It is synthesized on the spot, never drawn from the queue.
pub const KEEPALIVE: &str = r#"{"janus":"keepalive"}"#;

/// A completed JSON event waiting to be delivered to the browser.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    payload: String,
}

impl PendingEvent {
    pub fn new(payload: String) -> Self {
        Self { payload }
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}

/// FIFO of pending events for one session.
///
/// Any number of writers may enqueue; at most one long-poll reader drains at
/// a time (later pollers queue up behind the reader lock). Delivery order is
/// enqueue order.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<PendingEvent>>,
    notify: Notify,
    reader: tokio::sync::Mutex<()>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake a blocked reader, if any.
    pub fn enqueue(&self, event: PendingEvent) {
        self.queue.lock().unwrap().push_back(event);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the head event, blocking up to `wait` if the queue is empty.
    /// Returns `None` on timeout or when `stop` fires; callers turn `None`
    /// into the [`KEEPALIVE`] sentinel.
    pub async fn poll(&self, wait: Duration, stop: &CancellationToken) -> Option<PendingEvent> {
        let _reader = self.reader.lock().await;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register for wakeup before the emptiness check so an enqueue
            // racing between the check and the await is not lost.
            let notified = self.notify.notified();
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return Some(event);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = stop.cancelled() => return None,
            }
        }
    }
}
