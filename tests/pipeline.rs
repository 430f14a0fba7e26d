//! Integration tests against an in-memory fake transport/codec pair, the
//! out-of-scope external collaborators a real binary would wire a TCP/TLS
//! socket and HTTP/1.x codec behind. Covers the seed scenarios.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

use rama_h1_mux::{
    BodyEncoding, Builder, Connection, InboundMessage, NoopMetrics, NoopTracer, PoolListener,
    RequestHead, ResponseHead, StreamKind, TokioSpawner, Transport,
};

#[derive(Default)]
struct Recorder {
    written_heads: Mutex<Vec<RequestHead>>,
    written_bodies: Mutex<Vec<(Bytes, bool)>>,
    pause_count: AtomicUsize,
    resume_count: AtomicUsize,
    closed: AtomicBool,
}

struct FakeTransport {
    rec: Arc<Recorder>,
    buffered_on_removal: Vec<InboundMessage>,
}

impl Transport for FakeTransport {
    fn write_head(&mut self, head: &RequestHead, _encoding: BodyEncoding) -> rama_h1_mux::Result<()> {
        self.rec.written_heads.lock().unwrap().push(head.clone());
        Ok(())
    }

    fn write_body_chunk(&mut self, chunk: Bytes, last: bool) -> rama_h1_mux::Result<()> {
        self.rec.written_bodies.lock().unwrap().push((chunk, last));
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn pause_reads(&mut self) {
        self.rec.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_reads(&mut self) {
        self.rec.resume_count.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_http_codec(&mut self) -> Vec<InboundMessage> {
        std::mem::take(&mut self.buffered_on_removal)
    }

    fn close(&mut self) {
        self.rec.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakePool {
    recycles: AtomicUsize,
    evicts: AtomicUsize,
}

impl PoolListener for FakePool {
    fn on_recycle(&self) {
        self.recycles.fetch_add(1, Ordering::SeqCst);
    }

    fn on_evict(&self) {
        self.evicts.fetch_add(1, Ordering::SeqCst);
    }
}

fn harness() -> (Connection, Arc<Recorder>, Arc<FakePool>) {
    let rec = Arc::new(Recorder::default());
    let pool = Arc::new(FakePool::default());
    let transport = FakeTransport {
        rec: Arc::clone(&rec),
        buffered_on_removal: Vec::new(),
    };
    let conn = Builder::new("example.com", Arc::new(TokioSpawner::current()))
        .pool(Arc::clone(&pool) as Arc<dyn PoolListener>)
        .metrics(Arc::new(NoopMetrics))
        .tracer(Arc::new(NoopTracer))
        .build(Box::new(transport));
    (conn, rec, pool)
}

fn get_request(path: &str) -> RequestHead {
    RequestHead {
        method: Method::GET,
        uri: Uri::try_from(path).unwrap(),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
    }
}

fn ok_response(content_length: &str, extra: Option<(&'static str, &'static str)>) -> ResponseHead {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_str(content_length).unwrap());
    if let Some((name, value)) = extra {
        headers.insert(
            http::HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ResponseHead {
        version: Version::HTTP_11,
        status: StatusCode::OK,
        headers,
    }
}

async fn settle() {
    // Lets each stream's single-threaded consumer task drain its mpsc
    // channel before assertions run.
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn pipeline_of_two_gets() {
    let (conn, _rec, pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    let b = conn.create_stream(StreamKind::Request, get_request("/b")).unwrap();

    let a_head_fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&a_head_fired);
    a.on_head(move |_| flag.store(true, Ordering::SeqCst));

    let b_head_fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&b_head_fired);
    b.on_head(move |_| flag.store(true, Ordering::SeqCst));

    // a reaches the front immediately; writing its (bodyless, end=true) head
    // also runs end_request, which resolves b's admission promise.
    a.write_head(false, None, true, false).await.unwrap();
    b.write_head(false, None, true, false).await.unwrap();

    conn.deliver_inbound(InboundMessage::Head(ok_response("3", None)))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"foo")))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::LastChunk {
        chunk: None,
        trailers: HeaderMap::new(),
    })
    .await
    .unwrap();
    settle().await;

    assert!(a_head_fired.load(Ordering::SeqCst), "a's head handler must fire first");
    assert!(!b_head_fired.load(Ordering::SeqCst), "b must not see a head yet");

    conn.deliver_inbound(InboundMessage::Head(ok_response("3", None)))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"bar")))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::LastChunk {
        chunk: None,
        trailers: HeaderMap::new(),
    })
    .await
    .unwrap();
    settle().await;

    assert!(b_head_fired.load(Ordering::SeqCst));
    assert_eq!(a.bytes_read(), 3);
    assert_eq!(b.bytes_read(), 3);
    assert_eq!(pool.recycles.load(Ordering::SeqCst), 2);
    assert!(conn.is_valid());
}

#[tokio::test]
async fn connection_close_header_forces_close() {
    let (conn, _rec, pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, true, false).await.unwrap();

    conn.deliver_inbound(InboundMessage::Head(ok_response("0", Some(("connection", "close")))))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::LastChunk {
        chunk: None,
        trailers: HeaderMap::new(),
    })
    .await
    .unwrap();
    settle().await;

    assert_eq!(pool.evicts.load(Ordering::SeqCst), 1);
    assert_eq!(pool.recycles.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_tunnel_then_raw_bytes_and_close() {
    let (conn, rec, _pool) = harness();

    let connect_req = RequestHead {
        method: Method::CONNECT,
        uri: Uri::try_from("example.com:443").unwrap(),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
    };
    let stream = conn.create_stream(StreamKind::Request, connect_req).unwrap();

    let raw_chunks: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&raw_chunks);
    stream.on_chunk(move |b| sink.lock().unwrap().push(b));

    // connect=true marks this stream tunnel-eligible (spec.md §4.C).
    stream.write_head(false, None, true, true).await.unwrap();

    let tunnel_response = ResponseHead {
        version: Version::HTTP_11,
        status: StatusCode::OK,
        headers: HeaderMap::new(),
    };
    conn.deliver_inbound(InboundMessage::Head(tunnel_response)).await.unwrap();
    settle().await;

    // Bytes after the upgrade arrive as ordinary chunks through the same
    // path (the real codec would stop parsing HTTP framing at this point).
    conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"raw-bytes")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(raw_chunks.lock().unwrap().as_slice(), [Bytes::from_static(b"raw-bytes")]);

    stream.write_body(Bytes::from_static(b"bye"), true).await.unwrap();
    settle().await;

    assert!(rec.closed.load(Ordering::SeqCst), "ending a tunnel write closes the connection");
}

#[tokio::test]
async fn reset_mid_response_delivers_exception_and_closes() {
    let (conn, rec, _pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, true, false).await.unwrap();

    conn.deliver_inbound(InboundMessage::Head(ok_response("100", None)))
        .await
        .unwrap();
    for _ in 0..3 {
        conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"abc")))
            .await
            .unwrap();
    }
    settle().await;

    let exception_seen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exception_seen);
    a.on_exception(move |_| flag.store(true, Ordering::SeqCst));

    a.reset(rama_h1_mux::Error::aborted("client gave up"));
    settle().await;
    // Give the spawned close() task a moment to finish.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(exception_seen.load(Ordering::SeqCst));
    assert!(rec.closed.load(Ordering::SeqCst));

    // A reset stream's consumer loop drops further items instead of
    // delivering them, even if one arrives after the reset.
    let more_chunks_seen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&more_chunks_seen);
    a.on_chunk(move |_| flag.store(true, Ordering::SeqCst));
    let _ = conn
        .deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"late")))
        .await;
    settle().await;
    assert!(!more_chunks_seen.load(Ordering::SeqCst));
}

#[tokio::test]
async fn shutdown_on_idle_connection_closes_synchronously() {
    let (conn, rec, pool) = harness();

    conn.shutdown(None).await.unwrap();

    assert!(rec.closed.load(Ordering::SeqCst));
    // `shutdown` itself evicts, then the close it triggers evicts again.
    assert_eq!(pool.evicts.load(Ordering::SeqCst), 2);

    let err = conn.shutdown(None).await.unwrap_err();
    assert!(!err.is_closed());
}

#[tokio::test]
async fn shutdown_with_grace_waits_for_in_flight_exchange() {
    let (conn, rec, _pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, false, false).await.unwrap();

    let conn_for_shutdown = conn.clone();
    let shutdown_task = tokio::spawn(async move {
        conn_for_shutdown.shutdown(Some(Duration::from_millis(200))).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!rec.closed.load(Ordering::SeqCst), "must not close while request body is still open");

    a.write_body(Bytes::new(), true).await.unwrap();
    conn.deliver_inbound(InboundMessage::Head(ok_response("0", None)))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::LastChunk {
        chunk: None,
        trailers: HeaderMap::new(),
    })
    .await
    .unwrap();

    shutdown_task.await.unwrap().unwrap();
    assert!(rec.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn keep_alive_timeout_header_bounds_validity() {
    let (conn, _rec, _pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, true, false).await.unwrap();

    conn.deliver_inbound(InboundMessage::Head(ok_response("0", Some(("keep-alive", "timeout=2")))))
        .await
        .unwrap();
    conn.deliver_inbound(InboundMessage::LastChunk {
        chunk: None,
        trailers: HeaderMap::new(),
    })
    .await
    .unwrap();
    settle().await;

    assert!(conn.is_valid());
}

#[tokio::test]
async fn pause_and_fetch_gate_chunk_delivery() {
    let (conn, _rec, _pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, true, false).await.unwrap();
    conn.deliver_inbound(InboundMessage::Head(ok_response("0", None)))
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    a.on_chunk(move |b| sink.lock().unwrap().push(b));

    a.pause();
    conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"one")))
        .await
        .unwrap();
    settle().await;
    assert!(seen.lock().unwrap().is_empty(), "a paused stream must not deliver chunks");

    a.fetch(1);
    settle().await;
    assert_eq!(seen.lock().unwrap().as_slice(), [Bytes::from_static(b"one")]);
}

#[tokio::test]
async fn backpressure_pauses_and_resumes_transport_reads() {
    let (conn, rec, _pool) = harness();

    let a = conn.create_stream(StreamKind::Request, get_request("/a")).unwrap();
    a.write_head(false, None, true, false).await.unwrap();

    conn.deliver_inbound(InboundMessage::Head(ok_response("0", None)))
        .await
        .unwrap();

    // Push past the default inbound buffer capacity (5 items) without
    // yielding to the stream's single-threaded consumer task, so the
    // dispatcher observes overflow and pauses transport reads (spec.md
    // §4.A/§4.D).
    for _ in 0..6 {
        conn.deliver_inbound(InboundMessage::Chunk(Bytes::from_static(b"x")))
            .await
            .unwrap();
    }
    assert!(
        rec.pause_count.load(Ordering::SeqCst) >= 1,
        "overflowing the inbound buffer must pause transport reads"
    );

    // Letting the consumer loop drain everything resumes transport reads.
    settle().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(
        rec.resume_count.load(Ordering::SeqCst) >= 1,
        "draining the inbound buffer must resume transport reads"
    );
}
