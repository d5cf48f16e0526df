//! Client-side batch pool.
//!
//! A [`BatchSequence`] hands out fixed-size local batches from ranges granted
//! by the server. When the pool runs dry (or drops below the low-water mark)
//! it asks the server for more through a [`BatchRequester`], tagging the
//! request with a fresh request id. Responses carrying any other id are
//! stale and ignored.
//!
//! The "request pending" flag survives disconnects: the next handshake
//! reports it, and the range granted in the handshake ack clears it.

use super::BatchRange;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Sends batch requests to the server.
pub trait BatchRequester: Send + Sync {
    /// Ask for `size` ids under `request_id`. Delivery may fail silently;
    /// the pending flag covers that case.
    fn request_batch(&self, request_id: u64, size: u64);
}

/// Result of asking the pool for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextBatch {
    /// A local batch was available.
    Ready(BatchRange),
    /// The pool was empty; a request was just sent under this id.
    Requested(u64),
    /// The pool is empty and a request is already outstanding.
    Awaiting(u64),
}

#[derive(Debug, Default)]
struct PoolState {
    ranges: VecDeque<BatchRange>,
    last_request_id: u64,
    pending: bool,
    remote_requests: u64,
}

impl PoolState {
    fn remaining(&self) -> u64 {
        self.ranges.iter().map(BatchRange::len).sum()
    }

    fn begin_request(&mut self) -> u64 {
        self.last_request_id += 1;
        self.pending = true;
        self.remote_requests += 1;
        self.last_request_id
    }

    fn push(&mut self, range: BatchRange) {
        if !range.is_empty() {
            self.ranges.push_back(range);
        }
    }
}

/// Local pool of server-granted ids.
pub struct BatchSequence {
    requester: Arc<dyn BatchRequester>,
    batch_size: u64,
    fetch_size: u64,
    low_water: u64,
    state: Mutex<PoolState>,
    arrived: Notify,
}

impl BatchSequence {
    /// Create a pool. A `low_water` of 0 disables prefetch.
    pub fn new(
        requester: Arc<dyn BatchRequester>,
        batch_size: u64,
        fetch_size: u64,
        low_water: u64,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            requester,
            batch_size,
            fetch_size: fetch_size.max(batch_size),
            low_water,
            state: Mutex::new(PoolState::default()),
            arrived: Notify::new(),
        }
    }

    /// Add a range without a request (e.g. granted in a handshake ack).
    pub fn seed(&self, range: BatchRange) {
        self.state.lock().push(range);
        self.arrived.notify_waiters();
    }

    /// Take the next local batch, requesting more from the server if needed.
    ///
    /// A batch never spans two granted ranges; the tail of a range may be
    /// shorter than the batch size.
    pub fn next_batch(&self) -> NextBatch {
        let mut state = self.state.lock();
        let result = loop {
            let Some(front) = state.ranges.front_mut() else {
                break None;
            };
            let taken = front.take_front(self.batch_size);
            if front.is_empty() {
                state.ranges.pop_front();
            }
            if !taken.is_empty() {
                break Some(taken);
            }
        };

        let (next, request) = match result {
            Some(range) => {
                let prefetch = (self.low_water > 0
                    && !state.pending
                    && state.remaining() < self.low_water)
                    .then(|| state.begin_request());
                if let Some(id) = prefetch {
                    tracing::trace!(request_id = id, "prefetching id batch");
                }
                (NextBatch::Ready(range), prefetch)
            }
            None if state.pending => (NextBatch::Awaiting(state.last_request_id), None),
            None => {
                let id = state.begin_request();
                (NextBatch::Requested(id), Some(id))
            }
        };
        // The requester may answer before returning.
        drop(state);
        if let Some(id) = request {
            self.requester.request_batch(id, self.fetch_size);
        }
        next
    }

    /// Take the next batch, waiting for the server if the pool is empty.
    pub async fn acquire(&self) -> BatchRange {
        loop {
            let arrived = self.arrived.notified();
            match self.next_batch() {
                NextBatch::Ready(range) => return range,
                NextBatch::Requested(_) | NextBatch::Awaiting(_) => arrived.await,
            }
        }
    }

    /// Handle a server response. Returns false for a stale response.
    pub fn batch_received(&self, request_id: u64, range: BatchRange) -> bool {
        let mut state = self.state.lock();
        if !state.pending || request_id != state.last_request_id {
            tracing::debug!(
                request_id,
                current = state.last_request_id,
                %range,
                "ignoring stale id batch"
            );
            return false;
        }
        state.pending = false;
        state.push(range);
        drop(state);
        self.arrived.notify_waiters();
        true
    }

    /// Accept ranges granted by a handshake ack, clearing the pending flag.
    pub fn handshake_ranges(&self, ranges: &[BatchRange]) {
        let mut state = self.state.lock();
        if ranges.iter().any(|r| !r.is_empty()) {
            state.pending = false;
        }
        for range in ranges {
            state.push(*range);
        }
        drop(state);
        self.arrived.notify_waiters();
    }

    /// Whether a request is outstanding.
    pub fn is_request_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Ids left in the pool.
    pub fn remaining(&self) -> u64 {
        self.state.lock().remaining()
    }

    /// Requests sent to the server so far.
    pub fn remote_requests(&self) -> u64 {
        self.state.lock().remote_requests
    }
}

impl std::fmt::Debug for BatchSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSequence")
            .field("batch_size", &self.batch_size)
            .field("fetch_size", &self.fetch_size)
            .field("low_water", &self.low_water)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(u64, u64)>>,
    }

    impl BatchRequester for Recorder {
        fn request_batch(&self, request_id: u64, size: u64) {
            self.sent.lock().push((request_id, size));
        }
    }

    #[test]
    fn test_stale_response_ignored() {
        let rec = Arc::new(Recorder::default());
        let seq = BatchSequence::new(rec.clone(), 10, 100, 0);
        let NextBatch::Requested(id) = seq.next_batch() else {
            panic!("expected a request");
        };
        assert!(!seq.batch_received(id + 7, BatchRange::new(0, 100)));
        assert!(seq.is_request_pending());
        assert!(seq.batch_received(id, BatchRange::new(0, 100)));
        assert!(!seq.batch_received(id, BatchRange::new(100, 200)));
        assert_eq!(seq.next_batch(), NextBatch::Ready(BatchRange::new(0, 10)));
    }

    #[test]
    fn test_only_one_outstanding_request() {
        let rec = Arc::new(Recorder::default());
        let seq = BatchSequence::new(rec.clone(), 10, 100, 0);
        let first = seq.next_batch();
        let second = seq.next_batch();
        assert!(matches!(first, NextBatch::Requested(1)));
        assert_eq!(second, NextBatch::Awaiting(1));
        assert_eq!(rec.sent.lock().len(), 1);
    }

    #[test]
    fn test_low_water_prefetch() {
        let rec = Arc::new(Recorder::default());
        let seq = BatchSequence::new(rec.clone(), 10, 100, 25);
        seq.seed(BatchRange::new(0, 40));
        assert!(matches!(seq.next_batch(), NextBatch::Ready(_)));
        assert!(rec.sent.lock().is_empty());
        assert!(matches!(seq.next_batch(), NextBatch::Ready(_)));
        assert_eq!(rec.sent.lock().as_slice(), &[(1, 100)]);
        assert!(matches!(seq.next_batch(), NextBatch::Ready(_)));
        assert_eq!(rec.sent.lock().len(), 1);
    }

    #[test]
    fn test_handshake_ranges_clear_pending() {
        let rec = Arc::new(Recorder::default());
        let seq = BatchSequence::new(rec, 10, 100, 0);
        seq.next_batch();
        assert!(seq.is_request_pending());
        seq.handshake_ranges(&[BatchRange::new(500, 600)]);
        assert!(!seq.is_request_pending());
        assert_eq!(seq.next_batch(), NextBatch::Ready(BatchRange::new(500, 510)));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_response() {
        let rec = Arc::new(Recorder::default());
        let seq = Arc::new(BatchSequence::new(rec.clone(), 10, 100, 0));
        let waiter = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.acquire().await })
        };
        while rec.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        seq.batch_received(1, BatchRange::new(50, 150));
        assert_eq!(waiter.await.unwrap(), BatchRange::new(50, 60));
    }

    // Answers from inside request_batch, like an in-process server would.
    #[derive(Default)]
    struct Immediate {
        pool: std::sync::OnceLock<std::sync::Weak<BatchSequence>>,
    }

    impl BatchRequester for Immediate {
        fn request_batch(&self, request_id: u64, size: u64) {
            if let Some(seq) = self.pool.get().and_then(std::sync::Weak::upgrade) {
                seq.batch_received(request_id, BatchRange::new(0, size));
            }
        }
    }

    #[test]
    fn test_requester_may_answer_synchronously() {
        let requester = Arc::new(Immediate::default());
        let seq = Arc::new(BatchSequence::new(requester.clone(), 10, 100, 0));
        requester.pool.set(Arc::downgrade(&seq)).unwrap();

        assert_eq!(seq.next_batch(), NextBatch::Requested(1));
        assert!(!seq.is_request_pending());
        assert_eq!(seq.remaining(), 100);
        assert_eq!(seq.next_batch(), NextBatch::Ready(BatchRange::new(0, 10)));
    }
}
