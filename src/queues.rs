//! Component B: the two pipeline FIFOs (spec.md §4.B).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::stream::Stream;

/// `requests` (currently writing) and `responses` (awaiting reply), guarded
/// by a single short-held lock (spec.md §5: "the mutex is acquired only for
/// short critical sections"). Handler dispatch and transport I/O never run
/// while this lock is held.
#[derive(Default)]
pub(crate) struct PipelineQueues {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    requests: VecDeque<Arc<Stream>>,
    responses: VecDeque<Arc<Stream>>,
}

impl PipelineQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a freshly created stream to `requests`. Returns `true` if it
    /// is now the sole occupant (spec.md §4.G: admitted immediately).
    pub(crate) fn admit(&self, stream: Arc<Stream>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push_back(stream);
        inner.requests.len() == 1
    }

    /// Pops `requests.front()` once its request body is fully written
    /// (spec.md §4.C `end_request`). Returns the popped stream and the new
    /// front (to admit), if `front_id` still matches the current front.
    pub(crate) fn end_request(
        &self,
        front_id: u64,
    ) -> Option<(Arc<Stream>, Option<Arc<Stream>>)> {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.front() {
            Some(s) if s.id() == front_id => {
                let popped = inner.requests.pop_front().unwrap();
                let new_front = inner.requests.front().cloned();
                Some((popped, new_front))
            }
            _ => None,
        }
    }

    /// Appends to `responses`, done atomically with head emission
    /// (spec.md §4.C).
    pub(crate) fn await_response(&self, stream: Arc<Stream>) {
        self.inner.lock().unwrap().responses.push_back(stream);
    }

    pub(crate) fn responses_front(&self) -> Option<Arc<Stream>> {
        self.inner.lock().unwrap().responses.front().cloned()
    }

    pub(crate) fn requests_front(&self) -> Option<Arc<Stream>> {
        self.inner.lock().unwrap().requests.front().cloned()
    }

    /// Pops `responses.front()` once the response body terminator is
    /// observed. Only pops if it matches the expected stream id.
    pub(crate) fn pop_response_if_front(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.responses.front() {
            Some(s) if s.id() == id => {
                inner.responses.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Removes a stream from `requests` by id, used by the reset path when
    /// a stream hasn't been sent yet (spec.md §4.D).
    pub(crate) fn remove_from_requests(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.requests.len();
        inner.requests.retain(|s| s.id() != id);
        inner.requests.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.requests.is_empty() && inner.responses.is_empty()
    }

    /// Set-union of both deques in insertion order (spec.md §4.B
    /// `pending_streams`), used on connection failure.
    pub(crate) fn pending_streams(&self) -> Vec<Arc<Stream>> {
        let inner = self.inner.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(inner.requests.len() + inner.responses.len());
        for s in inner.requests.iter().chain(inner.responses.iter()) {
            if seen.insert(s.id()) {
                out.push(Arc::clone(s));
            }
        }
        out
    }
}
