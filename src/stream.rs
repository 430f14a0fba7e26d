//! Component A: per-exchange `Stream` state (spec.md §4.A).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::connection::ConnectionInner;
use crate::error::Error;
use crate::metrics::MetricsHandle;
use crate::tracer::TraceHandle;
use crate::transport::{RequestHead, ResponseHead};

/// Runs a user handler invocation on the execution context that created the
/// stream, as opposed to the connection's single I/O executor (spec.md §4.A,
/// §5). The crate ships a `tokio::runtime::Handle`-backed implementation;
/// callers may supply their own to run handlers on a different executor.
pub trait Spawner: Send + Sync {
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns handler delivery onto a Tokio runtime handle.
pub struct TokioSpawner(tokio::runtime::Handle);

impl TokioSpawner {
    #[must_use]
    pub fn current() -> Self {
        TokioSpawner(tokio::runtime::Handle::current())
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self.0.spawn(fut);
    }
}

/// Which half of the polymorphic stream variant this is (spec.md §9:
/// "model as a concrete record with a small set of trait-like capabilities
/// ... a sealed variant").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Request,
    Upgraded,
}

pub(crate) enum InboundItem {
    Continue,
    Head(ResponseHead),
    Chunk(Bytes),
    Trailers(HeaderMap),
}

#[derive(Default)]
struct Handlers {
    continue_: Option<Box<dyn FnMut() + Send>>,
    head: Option<Box<dyn FnMut(ResponseHead) + Send>>,
    chunk: Option<Box<dyn FnMut(Bytes) + Send>>,
    end: Option<Box<dyn FnMut(Option<HeaderMap>) + Send>>,
    drain: Option<Box<dyn FnMut() + Send>>,
    exception: Option<Box<dyn FnMut(Error) + Send>>,
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) kind: Mutex<StreamKind>,
    pub(crate) request: RequestHead,
    pub(crate) is_tunnel: AtomicBool,
    response: Mutex<Option<ResponseHead>>,
    pub(crate) response_ended: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    pub(crate) metrics_handle: Mutex<Option<MetricsHandle>>,
    pub(crate) trace_handle: Mutex<Option<TraceHandle>>,
    writable: AtomicBool,
    pub(crate) reset: AtomicBool,
    /// Set once the request head has been written and the stream has
    /// joined `responses` (spec.md §3 invariant 3); used by the reset path
    /// (§4.D) to decide whether the connection must close.
    pub(crate) in_responses: AtomicBool,
    admitted: AtomicBool,
    admitted_notify: Notify,
    inbound_tx: mpsc::UnboundedSender<InboundItem>,
    inbound_depth: AtomicUsize,
    inbound_capacity: usize,
    inbound_backpressure: AtomicBool,
    handlers: Mutex<Handlers>,
    /// Manual flow-control credit for `pause()`/`fetch(n)` (spec.md §4.A).
    /// Unbounded (`i64::MAX`) until a caller calls `pause()`; a chunk or
    /// trailers item consumes one credit before it is handed to its
    /// handler, independent of the fixed-capacity auto-pause above.
    flow_credits: Mutex<i64>,
    flow_notify: Notify,
}

/// Per-exchange state (spec.md §3 "Stream"). Holds no strong reference to
/// the owning connection (§9): it is owned by the connection's two deques
/// and reached from user code only through a [`StreamHandle`].
pub(crate) struct Stream {
    pub(crate) shared: Arc<Shared>,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        kind: StreamKind,
        request: RequestHead,
        spawner: Arc<dyn Spawner>,
        inbound_capacity: usize,
        on_resume_reads: Arc<dyn Fn() + Send + Sync>,
    ) -> Stream {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundItem>();
        let shared = Arc::new(Shared {
            id,
            kind: Mutex::new(kind),
            request,
            is_tunnel: AtomicBool::new(false),
            response: Mutex::new(None),
            response_ended: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            metrics_handle: Mutex::new(None),
            trace_handle: Mutex::new(None),
            writable: AtomicBool::new(true),
            reset: AtomicBool::new(false),
            in_responses: AtomicBool::new(false),
            admitted: AtomicBool::new(false),
            admitted_notify: Notify::new(),
            inbound_tx: tx,
            inbound_depth: AtomicUsize::new(0),
            inbound_capacity,
            inbound_backpressure: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            flow_credits: Mutex::new(i64::MAX),
            flow_notify: Notify::new(),
        });

        // Single ordered consumer loop: this is what makes the ordering
        // guarantees of spec.md §5 ("continue before head", "head then
        // chunks in order then end") hold even though delivery runs on the
        // stream's own context rather than the I/O executor.
        let worker = Arc::clone(&shared);
        spawner.spawn(Box::pin(async move {
            while let Some(item) = rx.recv().await {
                if worker.reset.load(Ordering::Acquire) {
                    continue;
                }
                let gated = matches!(item, InboundItem::Chunk(_) | InboundItem::Trailers(_));
                if gated {
                    loop {
                        let notified = worker.flow_notify.notified();
                        let acquired = {
                            let mut credits = worker.flow_credits.lock().unwrap();
                            if *credits > 0 {
                                *credits -= 1;
                                true
                            } else {
                                false
                            }
                        };
                        if acquired {
                            break;
                        }
                        notified.await;
                    }
                }
                let mut counts_toward_buffer = false;
                {
                    let mut h = worker.handlers.lock().unwrap();
                    match item {
                        InboundItem::Continue => {
                            if let Some(f) = h.continue_.as_mut() {
                                f();
                            }
                        }
                        InboundItem::Head(head) => {
                            if let Some(f) = h.head.as_mut() {
                                f(head);
                            }
                        }
                        InboundItem::Chunk(bytes) => {
                            counts_toward_buffer = true;
                            if let Some(f) = h.chunk.as_mut() {
                                f(bytes);
                            }
                        }
                        InboundItem::Trailers(map) => {
                            counts_toward_buffer = true;
                            if let Some(f) = h.end.as_mut() {
                                f(if map.is_empty() { None } else { Some(map) });
                            }
                        }
                    }
                }
                if counts_toward_buffer {
                    let depth = worker.inbound_depth.fetch_sub(1, Ordering::AcqRel) - 1;
                    if depth == 0 && worker.inbound_backpressure.swap(false, Ordering::AcqRel) {
                        on_resume_reads();
                    }
                }
            }
        }));

        Stream { shared }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn kind(&self) -> StreamKind {
        *self.shared.kind.lock().unwrap()
    }

    pub(crate) fn set_kind(&self, kind: StreamKind) {
        *self.shared.kind.lock().unwrap() = kind;
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.shared.reset.load(Ordering::Acquire)
    }

    pub(crate) fn response_ended(&self) -> bool {
        self.shared.response_ended.load(Ordering::Acquire)
    }

    pub(crate) fn is_tunnel(&self) -> bool {
        self.shared.is_tunnel.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_tunnel(&self, value: bool) {
        self.shared.is_tunnel.store(value, Ordering::Release);
    }

    pub(crate) fn in_responses(&self) -> bool {
        self.shared.in_responses.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_responses(&self, value: bool) {
        self.shared.in_responses.store(value, Ordering::Release);
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.shared.bytes_read.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.shared.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn set_metrics_handle(&self, handle: MetricsHandle) {
        *self.shared.metrics_handle.lock().unwrap() = Some(handle);
    }

    pub(crate) fn set_trace_handle(&self, handle: TraceHandle) {
        *self.shared.trace_handle.lock().unwrap() = Some(handle);
    }

    pub(crate) fn with_metrics_handle<R>(&self, f: impl FnOnce(&MetricsHandle) -> R) -> Option<R> {
        self.shared.metrics_handle.lock().unwrap().as_ref().map(f)
    }

    pub(crate) fn with_trace_handle<R>(&self, f: impl FnOnce(&TraceHandle) -> R) -> Option<R> {
        self.shared.trace_handle.lock().unwrap().as_ref().map(f)
    }

    pub(crate) fn response(&self) -> Option<ResponseHead> {
        self.shared.response.lock().unwrap().clone()
    }

    /// Stores the response head synchronously, for the dispatcher's own
    /// bookkeeping (spec.md §4.D) — independent of the queued delivery to
    /// the stream's `head` handler, which runs on the stream's context.
    pub(crate) fn store_response(&self, head: ResponseHead) {
        *self.shared.response.lock().unwrap() = Some(head);
    }

    pub(crate) fn mark_response_ended(&self) {
        self.shared.response_ended.store(true, Ordering::Release);
    }

    pub(crate) fn mark_admitted(&self) {
        if !self.shared.admitted.swap(true, Ordering::AcqRel) {
            self.shared.admitted_notify.notify_waiters();
        }
    }

    pub(crate) async fn wait_for_admission(&self) {
        if self.shared.admitted.load(Ordering::Acquire) {
            return;
        }
        loop {
            let notified = self.shared.admitted_notify.notified();
            if self.shared.admitted.load(Ordering::Acquire) {
                return;
            }
            notified.await;
            if self.shared.admitted.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Mirrors transport writability onto this stream (§4.A): `is_writable`
    /// reflects both transport writability and `reset`, and a `drain`
    /// handler fires only on the false→true crossing.
    pub(crate) fn set_writable(&self, writable: bool) {
        let was = self.shared.writable.swap(writable, Ordering::AcqRel);
        if !was && writable && !self.is_reset() {
            let mut h = self.shared.handlers.lock().unwrap();
            if let Some(f) = h.drain.as_mut() {
                f();
            }
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::Acquire) && !self.is_reset()
    }

    /// Marks the stream reset. Idempotent; returns whether this call is the
    /// one that transitioned the stream (spec.md §5: "reset is idempotent").
    pub(crate) fn mark_reset(&self) -> bool {
        !self.shared.reset.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn deliver_continue(&self) {
        let _ = self.shared.inbound_tx.send(InboundItem::Continue);
    }

    pub(crate) fn deliver_head(&self, head: ResponseHead) {
        let _ = self.shared.inbound_tx.send(InboundItem::Head(head));
    }

    /// Pushes a content chunk or the trailers sentinel. Returns whether it
    /// was accepted without exceeding the high-water mark (spec.md §4.A);
    /// `false` tells the dispatcher to pause transport reads.
    pub(crate) fn push_chunk(&self, bytes: Bytes) -> bool {
        let depth = self.shared.inbound_depth.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.shared.inbound_tx.send(InboundItem::Chunk(bytes));
        let accepted = depth <= self.shared.inbound_capacity;
        if !accepted {
            self.shared.inbound_backpressure.store(true, Ordering::Release);
        }
        accepted
    }

    pub(crate) fn push_trailers(&self, trailers: HeaderMap) -> bool {
        let depth = self.shared.inbound_depth.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.shared.inbound_tx.send(InboundItem::Trailers(trailers));
        let accepted = depth <= self.shared.inbound_capacity;
        if !accepted {
            self.shared.inbound_backpressure.store(true, Ordering::Release);
        }
        accepted
    }

    pub(crate) fn deliver_exception(&self, err: Error) {
        let mut h = self.shared.handlers.lock().unwrap();
        if let Some(f) = h.exception.as_mut() {
            f(err);
        }
    }

    /// Stops handing further chunks/trailers to the handler until `fetch`
    /// grants more credit (spec.md §4.A flow control). Items already queued
    /// stay queued rather than being dropped.
    pub(crate) fn pause(&self) {
        *self.shared.flow_credits.lock().unwrap() = 0;
        trace!(stream.id = self.shared.id, "pause");
    }

    /// Grants `n` more items of delivery credit and wakes the consumer loop
    /// if it was waiting (spec.md §4.A flow control).
    pub(crate) fn fetch(&self, n: u64) {
        {
            let mut credits = self.shared.flow_credits.lock().unwrap();
            *credits = credits.saturating_add(n as i64);
        }
        trace!(stream.id = self.shared.id, n, "fetch");
        self.shared.flow_notify.notify_waiters();
    }
}

/// Public handle to a [`Stream`]. Operations delegate to the owning
/// connection's `RequestWriter`/`LifecycleController` since a stream holds
/// no strong reference back to it (spec.md §9).
pub struct StreamHandle {
    pub(crate) stream: Arc<Stream>,
    pub(crate) connection: Weak<ConnectionInner>,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.stream.id()
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.stream.is_writable()
    }

    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.stream.kind()
    }

    pub fn on_continue(&self, f: impl FnMut() + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().continue_ = Some(Box::new(f));
    }

    pub fn on_head(&self, f: impl FnMut(ResponseHead) + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().head = Some(Box::new(f));
    }

    pub fn on_chunk(&self, f: impl FnMut(Bytes) + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().chunk = Some(Box::new(f));
    }

    pub fn on_end(&self, f: impl FnMut(Option<HeaderMap>) + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().end = Some(Box::new(f));
    }

    pub fn on_drain(&self, f: impl FnMut() + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().drain = Some(Box::new(f));
    }

    pub fn on_exception(&self, f: impl FnMut(Error) + Send + 'static) {
        self.stream.shared.handlers.lock().unwrap().exception = Some(Box::new(f));
    }

    /// Writes the request head (and, if `end`, the whole request). Awaits
    /// this stream's admission promise first: the caller is cleared to
    /// write only once it reaches the front of the `requests` queue
    /// (spec.md §4.A, §8 "round-trip" law).
    pub async fn write_head(
        &self,
        chunked: bool,
        initial_body: Option<Bytes>,
        end: bool,
        connect: bool,
    ) -> crate::error::Result<()> {
        self.stream.wait_for_admission().await;
        let conn = self.connection.upgrade().ok_or_else(Error::new_closed)?;
        conn.write_head(&self.stream, chunked, initial_body, end, connect)
            .await
    }

    pub async fn write_body(&self, chunk: Bytes, end: bool) -> crate::error::Result<()> {
        let conn = self.connection.upgrade().ok_or_else(Error::new_closed)?;
        conn.write_body(&self.stream, chunk, end).await
    }

    /// Resets the stream (spec.md §4.D "Reset path"). Idempotent.
    pub fn reset(&self, cause: Error) {
        if let Some(conn) = self.connection.upgrade() {
            conn.reset_stream(&self.stream, cause);
        }
    }

    /// Stops delivering further chunks/trailers until `fetch` is called
    /// (spec.md §4.A Stream Operations: manual flow control, independent of
    /// the fixed-capacity auto-pause on the inbound buffer).
    pub fn pause(&self) {
        self.stream.pause();
    }

    /// Requests `n` more items of delivery credit, resuming a paused stream
    /// (spec.md §4.A Stream Operations).
    pub fn fetch(&self, n: u64) {
        self.stream.fetch(n);
    }

    /// §4.F `to_net_socket`: commits this stream to raw tunnel mode and
    /// evicts the connection from the pool. Subsequent bytes arrive through
    /// the `chunk` handler verbatim.
    pub fn into_net_socket(self) -> crate::error::Result<StreamHandle> {
        let conn = self.connection.upgrade().ok_or_else(Error::new_closed)?;
        crate::upgrade::to_net_socket(&conn, &self.stream);
        Ok(self)
    }
}
