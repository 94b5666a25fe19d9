//! Hand-off Queues Between Engine Workers
//!
//! Unbounded FIFO of shared request records, with async waiting on the empty
//! queue and on the drained-empty condition. Pushers only signal on the
//! empty-to-non-empty transition, so an idle queue costs nothing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::request::IoRequest;

/// FIFO queue of in-flight request records
pub struct RequestQueue {
    inner: Mutex<VecDeque<Arc<IoRequest>>>,
    /// Woken on empty-to-non-empty
    nonempty: Notify,
    /// Woken whenever the queue drains to empty
    empty: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            nonempty: Notify::new(),
            empty: Notify::new(),
        }
    }

    /// Append a request, waking poppers if the queue was empty
    pub fn push(&self, req: Arc<IoRequest>) {
        let was_empty = {
            let mut queue = self.inner.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(req);
            was_empty
        };
        if was_empty {
            self.nonempty.notify_waiters();
        }
    }

    /// Take the oldest request without waiting
    pub fn try_pop(&self) -> Option<Arc<IoRequest>> {
        let mut queue = self.inner.lock().unwrap();
        let req = queue.pop_front();
        if req.is_some() && queue.is_empty() {
            self.empty.notify_waiters();
        }
        req
    }

    /// Take the oldest request, waiting for one to arrive
    pub async fn pop(&self) -> Arc<IoRequest> {
        loop {
            let notified = self.nonempty.notified();
            if let Some(req) = self.try_pop() {
                return req;
            }
            notified.await;
        }
    }

    /// Remove a specific record, identified by pointer. Used by the
    /// resynchronizer to reclaim a parked sync request on rewind.
    pub fn remove(&self, target: &Arc<IoRequest>) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if let Some(pos) = queue.iter().position(|req| Arc::ptr_eq(req, target)) {
            queue.remove(pos);
            if queue.is_empty() {
                self.empty.notify_waiters();
            }
            true
        } else {
            false
        }
    }

    /// Remove and return the first record matching `pred`. Used by the
    /// remote receiver to pair replies with their parked requests.
    pub fn take_where<F>(&self, pred: F) -> Option<Arc<IoRequest>>
    where
        F: Fn(&IoRequest) -> bool,
    {
        let mut queue = self.inner.lock().unwrap();
        let pos = queue.iter().position(|req| pred(req.as_ref()))?;
        let req = queue.remove(pos);
        if queue.is_empty() {
            self.empty.notify_waiters();
        }
        req
    }

    /// Remove every queued record at once. Used on connection teardown to
    /// fail the requests still waiting on the peer.
    pub fn drain(&self) -> Vec<Arc<IoRequest>> {
        let mut queue = self.inner.lock().unwrap();
        let drained: Vec<_> = queue.drain(..).collect();
        if !drained.is_empty() {
            self.empty.notify_waiters();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Wait until the queue has drained to empty
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.empty.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record() -> Arc<IoRequest> {
        Arc::new(IoRequest::new(512))
    }

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        let first = record();
        let second = record();
        queue.push(first.clone());
        queue.push(second.clone());

        assert!(Arc::ptr_eq(&queue.try_pop().unwrap(), &first));
        assert!(Arc::ptr_eq(&queue.try_pop().unwrap(), &second));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_remove_by_identity() {
        let queue = RequestQueue::new();
        let kept = record();
        let removed = record();
        queue.push(kept.clone());
        queue.push(removed.clone());

        assert!(queue.remove(&removed));
        assert!(!queue.remove(&removed));
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue.try_pop().unwrap(), &kept));
    }

    #[test]
    fn test_take_where_and_drain() {
        let queue = RequestQueue::new();
        let first = record();
        let second = record();
        first.arm(1);
        queue.push(first.clone());
        queue.push(second.clone());

        let taken = queue
            .take_where(|req| std::ptr::eq(req, first.as_ref()))
            .unwrap();
        assert!(Arc::ptr_eq(&taken, &first));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(RequestQueue::new());

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!popper.is_finished());

        let req = record();
        queue.push(req.clone());
        let got = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&got, &req));
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let queue = Arc::new(RequestQueue::new());
        queue.push(record());

        let drained = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_empty().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished());

        queue.try_pop();
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
    }
}
