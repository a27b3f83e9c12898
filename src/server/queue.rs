//! The per-client bounded notification queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::rpc::message::Notification;

/// The maximum number of pending notifications per client. A slow or
/// stuck subscriber loses the oldest entries first; that is safe because
/// compare-on-open, not notification delivery, is the correctness
/// mechanism.
pub const QUEUE_CAPACITY: usize = 1024;

/// Mutable queue state behind the mutex.
#[derive(Debug)]
struct QueueInner {
    /// Pending notifications, oldest first.
    queue: VecDeque<Notification>,
    /// Set once by `cancel`; queues are born open.
    shutdown: bool,
}

/// A bounded FIFO of pending notifications for one subscribed client.
///
/// One producer side (any RPC handler running fan-out, serialized by
/// the mutex) and exactly one consumer (the subscription handler).
/// After `cancel`, `pop` drains the remaining entries and then returns
/// `None`.
#[derive(Debug)]
pub struct NotificationQueue {
    /// Queue state.
    inner: Mutex<QueueInner>,
    /// Wakes the consumer on push and on cancel.
    notify: Notify,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationQueue {
    /// Create a new, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a notification.
    ///
    /// A shut-down queue drops the notification; a full queue drops its
    /// oldest entry to make room.
    pub fn push(&self, notification: Notification) {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            if inner.queue.len() >= QUEUE_CAPACITY {
                warn!(
                    "Notification queue is full, dropping the oldest entry for {:?}",
                    inner.queue.front().map(|n| n.path.clone())
                );
                inner.queue.pop_front();
            }
            inner.queue.push_back(notification);
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the queue has been cancelled and drained.
    pub async fn pop(&self) -> Option<Notification> {
        loop {
            // Register for wakeup before checking, so a push between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(notification) = inner.queue.pop_front() {
                    return Some(notification);
                }
                if inner.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Shut the queue; pending entries remain poppable.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock();
            inner.shutdown = true;
        }
        self.notify.notify_waiters();
    }

    /// Whether `cancel` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// The number of pending notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the queue holds no pending notifications.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::rpc::message::NotificationKind;

    fn update_for(path: &str) -> Notification {
        Notification {
            kind: NotificationKind::Update,
            path: path.to_owned(),
            new_path: None,
            timestamp: 1,
        }
    }

    #[test]
    fn test_queue_born_open() {
        let queue = NotificationQueue::new();
        assert!(!queue.is_shutdown());
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = NotificationQueue::new();
        queue.push(update_for("/a"));
        queue.push(update_for("/b"));
        queue.push(update_for("/c"));

        assert_eq!(queue.pop().await.expect("entry").path, "/a");
        assert_eq!(queue.pop().await.expect("entry").path, "/b");
        assert_eq!(queue.pop().await.expect("entry").path, "/c");
    }

    #[tokio::test]
    async fn test_pop_blocks_until_push() {
        let queue = Arc::new(NotificationQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        queue.push(update_for("/late"));
        let popped = consumer.await.expect("join").expect("entry");
        assert_eq!(popped.path, "/late");
    }

    #[tokio::test]
    async fn test_cancel_drains_then_ends() {
        let queue = NotificationQueue::new();
        queue.push(update_for("/a"));
        queue.cancel();
        queue.push(update_for("/dropped-after-shutdown"));

        assert_eq!(queue.pop().await.expect("entry").path, "/a");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiting_consumer() {
        let queue = Arc::new(NotificationQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.cancel();
        assert!(consumer.await.expect("join").is_none());
    }

    #[tokio::test]
    async fn test_bounded_drops_oldest() {
        let queue = NotificationQueue::new();
        for i in 0..=QUEUE_CAPACITY {
            queue.push(update_for(&format!("/{i}")));
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        // Entry 0 was dropped to make room for the last push.
        assert_eq!(queue.pop().await.expect("entry").path, "/1");
    }
}
