//! Component D: `ResponseDispatcher` (spec.md §4.D). Routes a decoded
//! inbound message to `responses.front()` and drives its state machine.

use std::sync::Arc;

use http::{Method, StatusCode, Version};
use tracing::{trace, warn};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::transport::{InboundMessage, ResponseHead};

/// `validate(msg)` + branch-by-variant (spec.md §4.D).
pub(crate) async fn dispatch_inbound(conn: &Arc<ConnectionInner>, msg: InboundMessage) -> Result<()> {
    match msg {
        InboundMessage::Head(head) => dispatch_head(conn, head).await,
        InboundMessage::Chunk(bytes) => dispatch_chunk(conn, bytes).await,
        InboundMessage::LastChunk { chunk, trailers } => {
            dispatch_last_chunk(conn, chunk, trailers).await
        }
        InboundMessage::DecodeError(cause) => Err(fail_connection(conn, Error::new_decode(cause)).await),
    }
}

/// Reports a cause to every pending stream as the connection closes
/// (spec.md §4.D "surface its cause as a connection-level exception").
async fn fail_connection(conn: &Arc<ConnectionInner>, err: Error) -> Error {
    warn!(%err, "failing connection");
    let message = err.to_string();
    for stream in conn.queues.pending_streams() {
        stream.deliver_exception(Error::new_closed().with(message.clone()));
    }
    conn.close().await;
    err
}

/// Routes an unexpected-frame condition through the configured
/// invalid-message sink (spec.md §7 error kind 3). The default sink
/// re-raises, which escalates to connection failure.
async fn reject_unexpected(conn: &Arc<ConnectionInner>, reason: &'static str) -> Result<()> {
    match conn.config.invalid_message_sink.handle(Error::new_invalid_message(reason)) {
        Ok(()) => Ok(()),
        Err(err) => Err(fail_connection(conn, err).await),
    }
}

fn unsupported_or_ok(version: Version) -> Result<()> {
    if version == Version::HTTP_10 || version == Version::HTTP_11 {
        Ok(())
    } else {
        Err(Error::new_unsupported_version())
    }
}

async fn dispatch_head(conn: &Arc<ConnectionInner>, head: ResponseHead) -> Result<()> {
    if let Err(err) = unsupported_or_ok(head.version) {
        return Err(fail_connection(conn, err).await);
    }

    let Some(stream) = conn.queues.responses_front() else {
        // Spurious data: no stream is awaiting a reply.
        return Ok(());
    };

    if head.status == StatusCode::CONTINUE {
        trace!(stream.id = stream.id(), "100 continue");
        stream.deliver_continue();
        return Ok(());
    }

    trace!(stream.id = stream.id(), status = %head.status, "response head received");
    stream.store_response(head.clone());
    stream.with_metrics_handle(|h| conn.metrics.response_begin(h, &head));

    let is_connect = stream.shared.request.method == Method::CONNECT;
    if !is_connect {
        let close_requested = has_connection_token(&head.headers, "close")
            || has_connection_token(&stream.shared.request.headers, "close")
            || (head.version == Version::HTTP_10 && !has_connection_token(&head.headers, "keep-alive"));
        if close_requested {
            conn.mark_close_after_current();
        }
        if let Some(timeout) = parse_keep_alive_timeout(&head.headers) {
            conn.set_keep_alive_timeout(timeout);
        }
    }

    stream.deliver_head(head.clone());

    let is_upgrade_pattern = (stream.shared.request.method == Method::CONNECT
        && head.status == StatusCode::OK)
        || (stream.shared.request.method == Method::GET
            && has_connection_token(&stream.shared.request.headers, "upgrade")
            && head.status == StatusCode::SWITCHING_PROTOCOLS);

    if stream.is_tunnel() && is_upgrade_pattern {
        let buffered = conn.surrender_codec().await;
        for msg in buffered {
            match msg {
                InboundMessage::Chunk(bytes) => {
                    stream.push_chunk(bytes);
                }
                InboundMessage::LastChunk { chunk: Some(bytes), .. } => {
                    stream.push_chunk(bytes);
                }
                _ => {}
            }
        }
    }

    Ok(())
}

async fn dispatch_chunk(conn: &Arc<ConnectionInner>, bytes: bytes::Bytes) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let Some(stream) = conn.queues.responses_front() else {
        return reject_unexpected(conn, "content chunk received with no response in flight").await;
    };
    stream.add_bytes_read(bytes.len() as u64);
    let accepted = stream.push_chunk(bytes);
    if !accepted {
        let mut t = conn.transport.lock().await;
        t.pause_reads();
    }
    Ok(())
}

async fn dispatch_last_chunk(
    conn: &Arc<ConnectionInner>,
    chunk: Option<bytes::Bytes>,
    trailers: http::HeaderMap,
) -> Result<()> {
    let Some(stream) = conn.queues.responses_front() else {
        return reject_unexpected(conn, "last content chunk received with no response in flight").await;
    };

    if let Some(bytes) = chunk {
        if !bytes.is_empty() {
            stream.add_bytes_read(bytes.len() as u64);
            stream.push_chunk(bytes);
        }
    }
    stream.push_trailers(trailers);

    conn.queues.pop_response_if_front(stream.id());
    stream.mark_response_ended();
    stream.set_in_responses(false);

    if !conn.config.keep_alive {
        conn.mark_close_after_current();
    }

    stream.with_metrics_handle(|h| conn.metrics.response_end(h, stream.bytes_read()));
    stream.with_trace_handle(|h| conn.tracer.receive_response(stream.response().as_ref(), h, None));

    {
        let mut t = conn.transport.lock().await;
        t.resume_reads();
    }

    let request_already_done = conn
        .queues
        .requests_front()
        .map(|s| s.id())
        .as_ref()
        != Some(&stream.id());
    if request_already_done {
        lifecycle::check(conn).await;
    }

    Ok(())
}

fn has_connection_token(headers: &http::HeaderMap, token: &str) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .any(|v| {
            v.to_str()
                .map(|s| s.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
}

/// Parses `Keep-Alive: timeout=N, max=M` for the `timeout` parameter.
fn parse_keep_alive_timeout(headers: &http::HeaderMap) -> Option<u64> {
    let value = headers.get("keep-alive")?.to_str().ok()?;
    for part in value.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("timeout=") {
            if let Ok(n) = rest.trim().parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn parses_keep_alive_timeout() {
        let mut h = HeaderMap::new();
        h.insert("keep-alive", HeaderValue::from_static("timeout=5, max=100"));
        assert_eq!(parse_keep_alive_timeout(&h), Some(5));
    }

    #[test]
    fn no_keep_alive_header_is_none() {
        assert_eq!(parse_keep_alive_timeout(&HeaderMap::new()), None);
    }

    #[test]
    fn connection_token_matches_case_insensitively() {
        let mut h = HeaderMap::new();
        h.insert(http::header::CONNECTION, HeaderValue::from_static("Close"));
        assert!(has_connection_token(&h, "close"));
        assert!(!has_connection_token(&h, "upgrade"));
    }
}
