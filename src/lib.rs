//! Core of an HTTP/1.x client connection multiplexer: the pipeline state
//! machine, per-stream lifecycle, backpressure coordination, keep-alive /
//! recycle / shutdown semantics, and CONNECT/WebSocket upgrade handoff for a
//! single long-lived connection.
//!
//! The byte-level HTTP/1.x codec and the transport it rides on, the
//! connection pool's own checkout logic, DNS/proxy/routing, and the
//! HTTP/2 implementation are external collaborators; only their contracts
//! ([`Transport`](transport::Transport), [`pool::PoolListener`],
//! [`metrics::Metrics`], [`tracer::Tracer`]) live in this crate.

mod config;
mod connection;
mod dispatch;
mod error;
mod lifecycle;
mod metrics;
mod pool;
mod queues;
mod stream;
mod tracer;
mod transport;
mod upgrade;
mod writer;

pub use config::{Builder as ConfigBuilder, ConnectionConfig, FailFast, InvalidMessageSink};
pub use connection::{Builder, Connection};
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsHandle, NoopMetrics};
pub use pool::{NoopPoolListener, PoolListener};
pub use stream::{Spawner, StreamHandle, StreamKind, TokioSpawner};
pub use tracer::{HeaderSink, NoopTracer, TraceHandle, Tracer};
pub use transport::{BodyEncoding, InboundMessage, RequestHead, ResponseHead, Transport};
pub use upgrade::{
    connect as websocket_connect, DeflateFrame, ExtensionHandshaker, PermessageDeflate,
    WebSocketConfig, WebSocketHandle,
};
