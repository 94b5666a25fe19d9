//! Fixed Request Pool
//!
//! All request records and their payload buffers are allocated up front; the
//! free list doubles as the engine's admission control. When every record is
//! in flight, `acquire` waits until the reporter releases one, which bounds
//! both memory use and queue depth without any per-request allocation.

use std::sync::Arc;

use super::queue::RequestQueue;
use super::request::IoRequest;

pub struct RequestPool {
    free: RequestQueue,
    depth: usize,
}

impl RequestPool {
    /// Preallocate `depth` records, each with a `buffer_size`-byte payload
    pub fn new(depth: usize, buffer_size: usize) -> Self {
        let free = RequestQueue::new();
        for _ in 0..depth {
            free.push(Arc::new(IoRequest::new(buffer_size)));
        }
        Self { free, depth }
    }

    /// Take a free record, waiting out a fully committed pool
    pub async fn acquire(&self) -> Arc<IoRequest> {
        self.free.pop().await
    }

    /// Return a record to the free list, waking an admission waiter
    pub fn release(&self, req: Arc<IoRequest>) {
        self.free.push(req);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Records currently on the free list
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
