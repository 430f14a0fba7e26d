//! The external collaborators this crate does not implement: the byte-level
//! HTTP/1.x codec and the transport it rides on (§1 "Out of scope"). Only
//! their contracts live here; a real binary wires a TCP/TLS socket and frame
//! parser/serializer in behind these traits, the way the teacher wires
//! `Buffered<I, ...>` and `Http1Transaction` behind `proto::h1::Conn`.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

use crate::error::Result;

/// A request head as captured on `Stream::write_head`.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How the request body is framed on the wire, decided by `RequestWriter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// No body, or a body whose length is already implied (e.g. GET).
    Empty,
    /// `Content-Length` framing with the given total length.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// A CONNECT tunnel: bytes are raw, not HTTP content.
    Tunnel,
}

/// A decoded inbound message as produced by the external codec.
///
/// This models exactly the three variants `ResponseDispatcher::validate`
/// branches on (spec.md §4.D): a response head, a content chunk, and the
/// last content chunk (optionally carrying trailers).
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Head(ResponseHead),
    Chunk(Bytes),
    LastChunk {
        chunk: Option<Bytes>,
        trailers: HeaderMap,
    },
    /// The codec failed to parse the bytes on the wire; carries its cause
    /// (spec.md §4.D `validate`: "reject on codec decode-error").
    DecodeError(String),
}

/// A response head as decoded by the external codec.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: http::StatusCode,
    pub headers: HeaderMap,
}

/// The transport a `Connection` writes onto and pauses/resumes reads on.
///
/// This is the seam for the byte-level codec and socket (out of scope, §1):
/// a real implementation serializes `RequestHead`/body chunks to bytes and
/// feeds decoded `InboundMessage`s back via `Connection::deliver_inbound`.
/// Everything here runs on the connection's single I/O executor.
pub trait Transport: Send {
    /// Serialize and write a request head, with the framing `RequestWriter`
    /// already decided.
    fn write_head(&mut self, head: &RequestHead, encoding: BodyEncoding) -> Result<()>;

    /// Serialize and write a body chunk (or tunnel-raw bytes when `encoding`
    /// was `BodyEncoding::Tunnel`). `last` marks the final chunk of the
    /// exchange.
    fn write_body_chunk(&mut self, chunk: Bytes, last: bool) -> Result<()>;

    /// Current transport writability, mirrored onto the front stream's
    /// `is_writable` (spec.md §4.A).
    fn is_writable(&self) -> bool;

    /// Ask the transport to stop delivering inbound chunks (backpressure
    /// from a full `Stream` inbound buffer).
    fn pause_reads(&mut self);

    /// Resume inbound delivery after a stream's consumer has drained.
    fn resume_reads(&mut self);

    /// Remove the decompressor and HTTP codec from the pipeline (§4.F). Any
    /// messages the codec had already parsed ahead of removal are returned
    /// here for manual re-delivery as raw chunks.
    fn remove_http_codec(&mut self) -> Vec<InboundMessage>;

    /// Tear down the transport (used on close / shutdown / tunnel end).
    fn close(&mut self);
}
