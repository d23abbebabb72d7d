//! Lightweight event fan-out.
//!
//! Each emitter (market or pool) owns an `EventBus`; subscribers get an
//! unbounded receiver. Delivery is FIFO per emitter. No ordering guarantee
//! exists across emitters. Closed receivers are pruned on the next publish.

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct EventBus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber. Events published after this call are
    /// delivered in publish order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping closed ones.
    pub fn publish(&self, event: &T) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
