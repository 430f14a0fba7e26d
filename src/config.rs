//! Per-connection configuration, set up the way the teacher configures a
//! `Conn` or `client::conn::http2::Builder`: a handful of setters on a
//! builder rather than an external config-file format.

use std::sync::Arc;

use crate::error::Error;

/// What to do with an inbound frame that's unexpected outside a tunnel or
/// WebSocket context (spec.md §7, error kind 3).
pub trait InvalidMessageSink: Send + Sync {
    /// Called with the error that would otherwise fail the connection.
    /// The default sink re-raises it, escalating to connection failure.
    fn handle(&self, err: Error) -> Result<(), Error> {
        Err(err)
    }
}

/// The default invalid-message sink: fail-fast, as spec.md §3 specifies.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl InvalidMessageSink for FailFast {}

/// Immutable configuration snapshot captured by a `Connection` at creation
/// (spec.md §3: "configuration snapshot").
#[derive(Clone)]
pub struct ConnectionConfig {
    pub(crate) keep_alive: bool,
    pub(crate) keep_alive_timeout_seconds: u64,
    pub(crate) inbound_buffer_capacity: usize,
    pub(crate) accept_compression: bool,
    pub(crate) invalid_message_sink: Arc<dyn InvalidMessageSink>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Builder::new().build()
    }
}

/// Builds a [`ConnectionConfig`].
#[derive(Clone)]
pub struct Builder {
    keep_alive: bool,
    keep_alive_timeout_seconds: u64,
    inbound_buffer_capacity: usize,
    accept_compression: bool,
    invalid_message_sink: Arc<dyn InvalidMessageSink>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Builder {
            keep_alive: true,
            keep_alive_timeout_seconds: 0,
            // spec.md §3: bounded inbound buffer, default capacity 5 items.
            inbound_buffer_capacity: 5,
            accept_compression: true,
            invalid_message_sink: Arc::new(FailFast),
        }
    }

    #[must_use]
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    #[must_use]
    pub fn keep_alive_timeout_seconds(mut self, seconds: u64) -> Self {
        self.keep_alive_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn inbound_buffer_capacity(mut self, capacity: usize) -> Self {
        self.inbound_buffer_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn accept_compression(mut self, enabled: bool) -> Self {
        self.accept_compression = enabled;
        self
    }

    #[must_use]
    pub fn invalid_message_sink(mut self, sink: Arc<dyn InvalidMessageSink>) -> Self {
        self.invalid_message_sink = sink;
        self
    }

    #[must_use]
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive: self.keep_alive,
            keep_alive_timeout_seconds: self.keep_alive_timeout_seconds,
            inbound_buffer_capacity: self.inbound_buffer_capacity,
            accept_compression: self.accept_compression,
            invalid_message_sink: self.invalid_message_sink,
        }
    }
}
