//! The distributed-tracing sink's contract (spec.md §6 "Tracer contract").
//! Export/collection is out of scope (§1); only the call sites live here.
//!
//! §9's Open Question: the `"http.url"` tag is always populated with the
//! request's URI, never left as a placeholder.

use std::any::Any;

use http::{HeaderName, HeaderValue};

use crate::transport::{RequestHead, ResponseHead};

pub type TraceHandle = Box<dyn Any + Send>;

/// Lets a [`Tracer`] add a header to the outgoing request from inside
/// `send_request`, before the head reaches the wire (spec.md §4.C "tracer
/// may mutate outgoing headers via a sink").
pub type HeaderSink<'a> = dyn FnMut(HeaderName, HeaderValue) + 'a;

/// Client-side request tracer, mirroring spec.md §6.
pub trait Tracer: Send + Sync {
    /// Called before the head is written to the transport (spec.md §4.C):
    /// `op_name` is a caller-chosen span name, the `"http.url"` tag is
    /// always the request URI (never a placeholder, §9), and `header_sink`
    /// lets the tracer inject propagation headers into the request that is
    /// about to go out.
    fn send_request(&self, req: &RequestHead, op_name: &str, header_sink: &mut HeaderSink<'_>) -> TraceHandle;

    /// Called once the exchange ends, successfully or not.
    fn receive_response(
        &self,
        resp: Option<&ResponseHead>,
        handle: &TraceHandle,
        error: Option<&crate::error::Error>,
    );
}

/// A `Tracer` that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn send_request(&self, _req: &RequestHead, _op_name: &str, _header_sink: &mut HeaderSink<'_>) -> TraceHandle {
        Box::new(())
    }

    fn receive_response(
        &self,
        _resp: Option<&ResponseHead>,
        _handle: &TraceHandle,
        _error: Option<&crate::error::Error>,
    ) {
    }
}
