//! The closable, ordered, backpressured channel between pipeline stages.
//!
//! `put` suspends when a bounded queue is full; `get` suspends when the
//! queue is empty. Closing wakes every pending waiter: subsequent `put`
//! calls fail, while `get` drains the remaining items before reporting
//! end-of-stream. This is the sole synchronization primitive between
//! stages.

use crate::error::PipelineError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    /// Signaled when an item arrives or the queue closes.
    readable: Notify,
    /// Signaled when space frees up or the queue closes.
    writable: Notify,
}

/// A bounded FIFO with explicit close-and-drain semantics.
pub struct StreamingQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for StreamingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for StreamingQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> StreamingQueue<T> {
    /// A queue that suspends producers once `capacity` items are buffered.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    /// A queue without producer backpressure.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    capacity,
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// Appends an item, suspending while the queue is full.
    ///
    /// Fails once the queue is closed, including producers that were
    /// suspended when the close happened.
    pub async fn put(&self, item: T) -> Result<(), PipelineError> {
        let mut item = Some(item);
        loop {
            let notified = self.inner.writable.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if state.closed {
                    return Err(PipelineError::QueueClosed);
                }
                let full = state
                    .capacity
                    .is_some_and(|capacity| state.items.len() >= capacity);
                if !full {
                    state.items.push_back(item.take().expect("item taken twice"));
                    self.inner.readable.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Removes the next item, suspending while the queue is empty.
    ///
    /// After close, drains the remaining items and then reports
    /// end-of-stream with `None`.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.readable.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(item) = state.items.pop_front() {
                    self.inner.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue, releasing every blocked producer and consumer.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("queue lock poisoned").closed
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = StreamingQueue::unbounded();
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();
        queue.put(3).await.unwrap();
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, Some(3));
    }

    #[tokio::test]
    async fn bounded_put_suspends_until_space() {
        let queue = StreamingQueue::bounded(1);
        queue.put(1).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(2).await })
        };

        // The producer must be blocked while the queue is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.get().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.get().await, Some(2));
    }

    #[tokio::test]
    async fn get_suspends_until_item_arrives() {
        let queue = StreamingQueue::unbounded();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        queue.put(7).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_drains_buffered_items_then_ends() {
        let queue = StreamingQueue::unbounded();
        queue.put("a").await.unwrap();
        queue.put("b").await.unwrap();
        queue.close();

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None, "end-of-stream is terminal");
    }

    #[tokio::test]
    async fn put_after_close_fails() {
        let queue = StreamingQueue::unbounded();
        queue.close();
        assert!(matches!(
            queue.put(1).await,
            Err(PipelineError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn close_releases_blocked_waiters() {
        let full = StreamingQueue::bounded(1);
        full.put(1).await.unwrap();
        let blocked_producer = {
            let queue = full.clone();
            tokio::spawn(async move { queue.put(2).await })
        };

        let empty: StreamingQueue<i32> = StreamingQueue::unbounded();
        let blocked_consumer = {
            let queue = empty.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        full.close();
        empty.close();

        assert!(matches!(
            blocked_producer.await.unwrap(),
            Err(PipelineError::QueueClosed)
        ));
        assert_eq!(blocked_consumer.await.unwrap(), None);
    }
}
