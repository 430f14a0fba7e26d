//! Error and Result types for the connection multiplexer.

use std::error::Error as StdError;
use std::fmt;

/// Result type returned from the multiplexer's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while driving a multiplexed HTTP/1.x connection.
///
/// The `Display` impl only prints this level of the error; use `source()`
/// (or `std::error::Report`) to see the full chain.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The byte-level codec reported a decode error.
    Decode,
    /// A response declared neither HTTP/1.0 nor HTTP/1.1.
    UnsupportedVersion,
    /// An inbound frame arrived that the invalid-message sink rejected.
    InvalidMessage,
    /// A stream was reset after its head had already been written.
    StreamReset,
    /// `shutdown` was called a second time.
    AlreadyShutdown,
    /// The operation targeted an already-closed connection.
    Closed,
    /// The admission or response promise was dropped without completing.
    Canceled,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_decode<C: Into<BoxError>>(cause: C) -> Error {
        Error::new(Kind::Decode).with(cause)
    }

    pub(crate) fn new_unsupported_version() -> Error {
        Error::new(Kind::UnsupportedVersion)
    }

    pub(crate) fn new_invalid_message<C: Into<BoxError>>(cause: C) -> Error {
        Error::new(Kind::InvalidMessage).with(cause)
    }

    pub(crate) fn new_stream_reset<C: Into<BoxError>>(cause: C) -> Error {
        Error::new(Kind::StreamReset).with(cause)
    }

    pub(crate) fn new_already_shutdown() -> Error {
        Error::new(Kind::AlreadyShutdown)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    /// Builds a reset cause for a caller driving
    /// [`StreamHandle::reset`](crate::StreamHandle::reset) themselves (e.g.
    /// aborting a request the user gave up on).
    #[must_use]
    pub fn aborted<C: Into<BoxError>>(cause: C) -> Error {
        Error::new(Kind::StreamReset).with(cause)
    }

    /// Returns true if the connection was closed when this operation ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if this was a decode error surfaced by the codec.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if this represents a stream reset.
    #[must_use]
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field("cause", cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Decode => f.write_str("error decoding inbound message"),
            Kind::UnsupportedVersion => f.write_str("unsupported HTTP version"),
            Kind::InvalidMessage => f.write_str("invalid message for current connection state"),
            Kind::StreamReset => f.write_str("stream was reset"),
            Kind::AlreadyShutdown => f.write_str("connection is already shutting down"),
            Kind::Closed => f.write_str("connection is closed"),
            Kind::Canceled => f.write_str("operation was canceled"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|e| &**e as _)
    }
}
