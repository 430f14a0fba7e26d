//! The metrics sink's contract (spec.md §6 "Metrics contract"). The actual
//! aggregation/export is out of scope (§1) — only the call sites and their
//! ordering guarantee (`request_begin`, `response_begin`, `response_end` /
//! `request_reset`, spec.md §5) live here.
//!
//! Handles are type-erased (`Box<dyn Any + Send>`) rather than an
//! associated type so a `Connection` can hold `Arc<dyn Metrics>` without
//! becoming generic over the metrics backend — matching §9's guidance to
//! prefer a small set of trait-object capabilities over inheritance.

use std::any::Any;

use crate::transport::{RequestHead, ResponseHead};
use crate::upgrade::WebSocketHandle;

pub type MetricsHandle = Box<dyn Any + Send>;

/// Client-side connection metrics, mirroring spec.md §6.
pub trait Metrics: Send + Sync {
    /// Called the moment a request head is emitted onto the transport.
    fn request_begin(&self, uri: &http::Uri, req: &RequestHead) -> MetricsHandle;

    /// Called when a response head (other than 100-Continue) is received.
    fn response_begin(&self, _handle: &MetricsHandle, _resp: &ResponseHead) {}

    /// Called when the response body has been fully received.
    fn response_end(&self, _handle: &MetricsHandle, _bytes_read: u64) {}

    /// Called when the request body has been fully written.
    fn request_end(&self, _handle: &MetricsHandle, _bytes_written: u64) {}

    /// Called when a stream is reset instead of completing normally.
    fn request_reset(&self, _handle: &MetricsHandle) {}

    /// Called once, when the transport disconnects.
    fn endpoint_disconnected(&self) {}

    /// Called once a WebSocket handshake completes successfully (spec.md
    /// §6 "connected(ws) -> handle").
    fn connected(&self, _ws: &WebSocketHandle) -> MetricsHandle {
        Box::new(())
    }
}

/// A `Metrics` implementation that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn request_begin(&self, _uri: &http::Uri, _req: &RequestHead) -> MetricsHandle {
        Box::new(())
    }
}
