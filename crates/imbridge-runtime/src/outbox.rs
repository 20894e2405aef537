//! Bounded queue of frames for the primary consumer. Survives consumer
//! disconnects; on overflow the oldest frame is dropped.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use imbridge_core::BridgeMessage;
use tokio::sync::Notify;

pub struct Outbox {
    queue: Mutex<VecDeque<BridgeMessage>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, message: BridgeMessage) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        while queue.len() >= self.capacity {
            queue.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = total, "outbox full, dropping oldest frame");
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    /// Put a frame back at the head, e.g. after a failed write.
    pub fn requeue(&self, message: BridgeMessage) {
        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() < self.capacity {
                queue.push_front(message);
            }
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<BridgeMessage> {
        self.queue.lock().ok()?.pop_front()
    }

    /// Wait for the next frame. Cancel-safe: a frame is only removed by the
    /// poll that returns it.
    pub async fn next(&self) -> BridgeMessage {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn take_all(&self) -> Vec<BridgeMessage> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imbridge_core::BridgeStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn error(n: usize) -> BridgeMessage {
        BridgeMessage::error(format!("e{n}"))
    }

    #[test]
    fn overflow_drops_oldest() {
        let outbox = Outbox::new(2);
        outbox.push(error(1));
        outbox.push(error(2));
        outbox.push(error(3));
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.take_all(), vec![error(2), error(3)]);
    }

    #[test]
    fn requeue_goes_to_front() {
        let outbox = Outbox::new(4);
        outbox.push(error(2));
        outbox.requeue(error(1));
        assert_eq!(outbox.take_all(), vec![error(1), error(2)]);
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let outbox = Arc::new(Outbox::new(4));
        let waiter = tokio::spawn({
            let outbox = Arc::clone(&outbox);
            async move { outbox.next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.push(BridgeMessage::status(BridgeStatus::Reconnected));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert_eq!(got, BridgeMessage::status(BridgeStatus::Reconnected));
        assert!(outbox.is_empty());
    }
}
