//! Component G: `ConnectionFacade`, the public contract exposed to the pool
//! and user code (spec.md §4.G), plus the shared state every other
//! component reads and mutates.
//!
//! The spec's "single cooperative I/O executor, with public methods
//! trampolined onto it if called off-executor" (§5, §9) is realized here as
//! a `tokio::sync::Mutex` guarding the transport: at most one exchange's
//! worth of work touches the transport at a time, and waiters queue on the
//! lock instead of being hand-trampolined through a channel. The `requests`
//! / `responses` deques and the handful of booleans keep the short
//! `std::sync::Mutex` critical sections spec.md §5 calls for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::Version;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::PoolListener;
use crate::queues::PipelineQueues;
use crate::stream::{Spawner, Stream, StreamHandle, StreamKind};
use crate::tracer::Tracer;
use crate::transport::{BodyEncoding, InboundMessage, RequestHead, Transport};
use crate::{dispatch, lifecycle, upgrade, writer};

/// Shared connection state (spec.md §3 "Connection").
pub(crate) struct ConnectionInner {
    pub(crate) transport: AsyncMutex<Box<dyn Transport>>,
    pub(crate) version: Version,
    pub(crate) authority: String,
    pub(crate) config: ConnectionConfig,
    pub(crate) queues: PipelineQueues,
    pub(crate) closed: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) close_after_current: AtomicBool,
    pub(crate) is_tunnel: AtomicBool,
    pub(crate) keep_alive_timeout_seconds: AtomicU64,
    /// Epoch seconds; 0 means "infinite" (spec.md §3, invariant 4).
    pub(crate) expiration_timestamp: AtomicU64,
    pub(crate) next_stream_id: AtomicU64,
    pub(crate) shutdown_timer_generation: AtomicU64,
    pub(crate) shutdown_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    /// The upgraded WebSocket stream, if any (spec.md §3 "optional
    /// web_socket handle"). Set once `upgrade::connect` completes a
    /// handshake; writability events then route here instead of to
    /// `requests.front()` (§4.G).
    pub(crate) web_socket: Mutex<Option<Arc<Stream>>>,
    pub(crate) spawner: Arc<dyn Spawner>,
    pub(crate) pool: Arc<dyn PoolListener>,
    pub(crate) metrics: Arc<dyn Metrics>,
    pub(crate) tracer: Arc<dyn Tracer>,
}

impl ConnectionInner {
    pub(crate) fn now_epoch_seconds() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn next_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::AcqRel)
    }
}

/// A handle to a multiplexed HTTP/1.x client connection. Cheaply `Clone`.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Builds a [`Connection`] (mirrors `client::conn::http2::Builder` in the
/// teacher: options first, then construct).
pub struct Builder {
    config: ConnectionConfig,
    version: Version,
    authority: String,
    spawner: Arc<dyn Spawner>,
    pool: Arc<dyn PoolListener>,
    metrics: Arc<dyn Metrics>,
    tracer: Arc<dyn Tracer>,
}

impl Builder {
    #[must_use]
    pub fn new(authority: impl Into<String>, spawner: Arc<dyn Spawner>) -> Self {
        Builder {
            config: ConnectionConfig::default(),
            version: Version::HTTP_11,
            authority: authority.into(),
            spawner,
            pool: Arc::new(crate::pool::NoopPoolListener),
            metrics: Arc::new(crate::metrics::NoopMetrics),
            tracer: Arc::new(crate::tracer::NoopTracer),
        }
    }

    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn PoolListener>) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    #[must_use]
    pub fn build(self, transport: Box<dyn Transport>) -> Connection {
        let keep_alive_timeout_seconds = self.config.keep_alive_timeout_seconds;
        let inner = Arc::new(ConnectionInner {
            transport: AsyncMutex::new(transport),
            version: self.version,
            authority: self.authority,
            config: self.config,
            queues: PipelineQueues::new(),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            close_after_current: AtomicBool::new(false),
            is_tunnel: AtomicBool::new(false),
            keep_alive_timeout_seconds: AtomicU64::new(keep_alive_timeout_seconds),
            expiration_timestamp: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(1),
            shutdown_timer_generation: AtomicU64::new(0),
            shutdown_waiters: Mutex::new(Vec::new()),
            web_socket: Mutex::new(None),
            spawner: self.spawner,
            pool: self.pool,
            metrics: self.metrics,
            tracer: self.tracer,
        });
        Connection { inner }
    }
}

impl Connection {
    /// §4.G `create_stream`: allocates a stream id, constructs the
    /// `Stream`, and appends it to `requests`. If it is now the sole
    /// occupant, its admission promise resolves immediately; otherwise it
    /// resolves when an earlier stream's `end_request` advances the queue.
    pub fn create_stream(&self, kind: StreamKind, request: RequestHead) -> Result<StreamHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::new_closed());
        }
        let id = self.inner.next_id();
        let inner_for_resume = Arc::clone(&self.inner);
        let on_resume_reads: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let inner = Arc::clone(&inner_for_resume);
            tokio::spawn(async move {
                let mut t = inner.transport.lock().await;
                t.resume_reads();
            });
        });
        let stream = Arc::new(Stream::new(
            id,
            kind,
            request,
            Arc::clone(&self.inner.spawner),
            self.inner.config.inbound_buffer_capacity,
            on_resume_reads,
        ));
        let is_front = self.inner.queues.admit(Arc::clone(&stream));
        if is_front {
            stream.mark_admitted();
        }
        Ok(StreamHandle {
            stream,
            connection: Arc::downgrade(&self.inner),
        })
    }

    /// §4.G `writability_changed`: delivered to whichever of
    /// `requests.front()` or the upgraded `web_socket` is active.
    pub async fn transport_writable_changed(&self, writable: bool) {
        trace!(writable, "transport writability changed");
        if let Some(ws) = self.inner.web_socket.lock().unwrap().clone() {
            ws.set_writable(writable);
        } else if let Some(front) = self.inner.queues.requests_front() {
            front.set_writable(writable);
        }
    }

    /// Feeds a decoded inbound message into the response dispatcher
    /// (component D). This is the seam the external codec drives.
    pub async fn deliver_inbound(&self, msg: InboundMessage) -> Result<()> {
        dispatch::dispatch_inbound(&self.inner, msg).await
    }

    /// §4.G `handle_closed`.
    pub async fn handle_closed(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("connection closed");
        self.inner.shutdown_timer_generation.fetch_add(1, Ordering::AcqRel);
        self.inner.metrics.endpoint_disconnected();
        let pending = self.inner.queues.pending_streams();
        for stream in pending {
            stream.with_metrics_handle(|h| self.inner.metrics.request_reset(h));
            stream.deliver_exception(Error::new_closed());
        }
        if let Some(ws) = self.inner.web_socket.lock().unwrap().take() {
            ws.deliver_exception(Error::new_closed());
        }
        for waiter in self.inner.shutdown_waiters.lock().unwrap().drain(..) {
            let _ = waiter.send(());
        }
    }

    /// §4.G `handle_exception`.
    pub fn handle_exception(&self, err: Error) {
        for stream in self.inner.queues.pending_streams() {
            stream.deliver_exception(Error::new(crate::error::Kind::Closed).with(err.to_string()));
        }
    }

    /// §4.G `handle_idle`: only forwarded when idle (no in-flight streams
    /// and no live WebSocket).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.queues.is_empty()
            && !self.inner.is_tunnel.load(Ordering::Acquire)
            && self.inner.web_socket.lock().unwrap().is_none()
    }

    /// §4.E `is_valid`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        lifecycle::is_valid(&self.inner)
    }

    /// §4.E `shutdown`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        lifecycle::shutdown(&self.inner, timeout).await
    }
}

impl ConnectionInner {
    /// §4.C `write_head`, run while holding the transport's exclusive lock
    /// (the Rust stand-in for "runs on the I/O executor").
    pub(crate) async fn write_head(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        chunked: bool,
        initial_body: Option<Bytes>,
        end: bool,
        connect: bool,
    ) -> Result<()> {
        let mut head = stream.shared.request.clone();
        head.version = self.version;
        writer::finalize_headers(
            &mut head,
            &self.authority,
            chunked,
            self.config.keep_alive,
            self.config.accept_compression,
        );

        // Give the tracer a chance to inject propagation headers before the
        // head is finalized onto the wire (spec.md §4.C "tracer may mutate
        // outgoing headers via a sink"). The sink collects additions rather
        // than borrowing `head` directly, since `send_request` also takes
        // `&head` for its own reading (URI tag, etc).
        let op_name = head.method.as_str().to_string();
        let mut sink_additions = Vec::new();
        let trace_handle = self
            .tracer
            .send_request(&head, &op_name, &mut |name, value| sink_additions.push((name, value)));
        for (name, value) in sink_additions {
            head.headers.insert(name, value);
        }

        let encoding = if connect {
            BodyEncoding::Tunnel
        } else if chunked {
            BodyEncoding::Chunked
        } else if let Some(len) = writer::content_length(&head) {
            BodyEncoding::Length(len)
        } else {
            BodyEncoding::Empty
        };

        trace!(stream.id = stream.id(), method = %head.method, uri = %head.uri, "writing request head");
        {
            let mut t = self.transport.lock().await;
            t.write_head(&head, encoding)?;
            let body = initial_body.unwrap_or_default();
            if !body.is_empty() || end {
                let n = body.len() as u64;
                t.write_body_chunk(body, end)?;
                stream.add_bytes_written(n);
            }
        }

        stream.set_is_tunnel(connect);
        stream.set_in_responses(true);
        self.queues.await_response(Arc::clone(stream));
        let metrics_handle = self.metrics.request_begin(&head.uri, &head);
        stream.set_metrics_handle(metrics_handle);
        stream.set_trace_handle(trace_handle);

        if end {
            self.end_request(stream).await;
        }
        Ok(())
    }

    /// §4.C `write_body` / tunnel raw write.
    pub(crate) async fn write_body(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        chunk: Bytes,
        end: bool,
    ) -> Result<()> {
        let n = chunk.len() as u64;
        {
            let mut t = self.transport.lock().await;
            t.write_body_chunk(chunk, end)?;
        }
        stream.add_bytes_written(n);
        if end {
            if stream.is_tunnel() {
                self.close().await;
            } else {
                self.end_request(stream).await;
            }
        }
        Ok(())
    }

    /// §4.C `end_request`: pops `requests.front()`, advances admission for
    /// the new front, and recycles immediately if the response already
    /// ended first (the legal "server responded faster" race, §4.C/§9).
    pub(crate) async fn end_request(self: &Arc<Self>, stream: &Arc<Stream>) {
        trace!(stream.id = stream.id(), bytes_written = stream.bytes_written(), "request ended");
        stream.with_metrics_handle(|h| self.metrics.request_end(h, stream.bytes_written()));
        if let Some((_popped, new_front)) = self.queues.end_request(stream.id()) {
            if let Some(next) = new_front {
                next.mark_admitted();
            }
            if stream.response_ended() {
                lifecycle::check(self).await;
            }
        }
    }

    /// §4.D reset path: terminates a single stream. If the stream had
    /// already written its head (is in `responses`), the connection cannot
    /// safely continue and must close; otherwise it is simply dropped from
    /// `requests` and the connection may be recycled.
    pub(crate) fn reset_stream(self: &Arc<Self>, stream: &Arc<Stream>, cause: Error) {
        if !stream.mark_reset() {
            return;
        }
        debug!(stream.id = stream.id(), %cause, "stream reset");
        stream.with_metrics_handle(|h| self.metrics.request_reset(h));
        stream.deliver_exception(Error::new_stream_reset(cause.to_string()));
        let had_reply_in_flight = stream.in_responses();
        let conn = Arc::clone(self);
        let stream = Arc::clone(stream);
        tokio::spawn(async move {
            if had_reply_in_flight {
                conn.close().await;
            } else {
                conn.queues.remove_from_requests(stream.id());
                lifecycle::check(&conn).await;
            }
        });
    }

    /// §4.E `close`. A closed connection must never be checked out again,
    /// so this also notifies the pool listener (shutdown's explicit
    /// `on_evict` call becomes a no-op duplicate in that case, since
    /// `handle_closed` below only runs once).
    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        debug!("closing connection");
        self.pool.on_evict();
        {
            let mut t = self.transport.lock().await;
            t.close();
        }
        let conn = Connection {
            inner: Arc::clone(self),
        };
        conn.handle_closed().await;
    }

    pub(crate) fn mark_close_after_current(&self) {
        self.close_after_current.store(true, Ordering::Release);
    }

    pub(crate) fn set_keep_alive_timeout(&self, seconds: u64) {
        self.keep_alive_timeout_seconds
            .store(seconds, Ordering::Release);
    }

    /// §4.F `remove_http_codec` handoff, used by the upgrade path.
    pub(crate) async fn surrender_codec(self: &Arc<Self>) -> Vec<InboundMessage> {
        upgrade::surrender_codec(self).await
    }
}
