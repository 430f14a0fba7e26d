//! Component F: `UpgradePath` (spec.md §4.F). Mutates the transport
//! pipeline for CONNECT tunnels and WebSocket handshakes, surrendering
//! ownership of the socket once HTTP framing no longer applies.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::sync::oneshot;
use tracing::debug;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::connection::{Connection, ConnectionInner};
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamHandle, StreamKind};
use crate::transport::{InboundMessage, RequestHead, ResponseHead};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn header_name(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

/// §4.F codec-removal handoff: strips the HTTP codec from the transport
/// pipeline once a tunnel/upgrade response has matched. Any inbound
/// messages the codec had already parsed ahead of removal are returned for
/// manual re-delivery to the stream as raw chunks.
pub(crate) async fn surrender_codec(conn: &Arc<ConnectionInner>) -> Vec<InboundMessage> {
    conn.is_tunnel.store(true, Ordering::Release);
    conn.pool.on_evict();
    let mut t = conn.transport.lock().await;
    t.remove_http_codec()
}

/// §4.F `to_net_socket`: fully removes HTTP handling from a stream and
/// evicts the connection from the pool. Subsequent bytes reach the stream
/// through its `chunk` handler verbatim, as a raw socket would.
pub(crate) fn to_net_socket(conn: &ConnectionInner, stream: &Stream) {
    stream.set_is_tunnel(true);
    stream.set_kind(StreamKind::Upgraded);
    conn.is_tunnel.store(true, Ordering::Release);
    conn.pool.on_evict();
}

/// An extension handshaker a caller may request for a WebSocket handshake
/// (spec.md §4.F names permessage-deflate and deflate-frame). Negotiating
/// and applying the compression itself is out of scope (§1, "WebSocket
/// frame processor past handshake") — only the offer attached to the
/// handshake request, and recognizing it in the response, live here.
pub trait ExtensionHandshaker: Send + Sync {
    /// The `Sec-WebSocket-Extensions` token this handshaker offers.
    fn offer(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PermessageDeflate;

impl ExtensionHandshaker for PermessageDeflate {
    fn offer(&self) -> &'static str {
        "permessage-deflate"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateFrame;

impl ExtensionHandshaker for DeflateFrame {
    fn offer(&self) -> &'static str {
        "deflate-frame"
    }
}

/// Options for a WebSocket handshake (spec.md §4.F).
pub struct WebSocketConfig {
    pub version: u8,
    pub extensions: Vec<Box<dyn ExtensionHandshaker>>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            version: 13,
            extensions: Vec::new(),
        }
    }
}

/// The result of a successful handshake: a tunnel-mode stream plus the
/// subset of requested extensions the server actually accepted.
pub struct WebSocketHandle {
    pub stream: StreamHandle,
    pub accepted_extensions: Vec<&'static str>,
}

fn sec_websocket_accept(key: &str) -> String {
    let mut hash = Sha1::new();
    hash.update(key.as_bytes());
    hash.update(WS_GUID.as_bytes());
    BASE64.encode(hash.finalize())
}

fn generate_sec_websocket_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Builds an absolute handshake URI from a possibly relative one, using the
/// connection's authority (spec.md §4.F "make absolute if necessary").
fn absolute_uri(uri: &Uri, authority: &str, secure: bool) -> Uri {
    if uri.authority().is_some() {
        return uri.clone();
    }
    let scheme = if secure { "https" } else { "http" };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| uri.clone())
}

/// Builds the handshake request head and the key the response must echo
/// back signed (spec.md §4.F): protocol version, and any requested
/// extension handshakers, are attached here.
fn build_handshake_request(
    uri: Uri,
    authority: &str,
    config: &WebSocketConfig,
) -> (RequestHead, String) {
    let key = generate_sec_websocket_key();
    let mut headers = HeaderMap::new();
    headers.insert(
        HOST,
        HeaderValue::from_str(authority).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        header_name("sec-websocket-version"),
        HeaderValue::from_str(&config.version.to_string()).unwrap(),
    );
    headers.insert(
        header_name("sec-websocket-key"),
        HeaderValue::from_str(&key).unwrap(),
    );
    if !config.extensions.is_empty() {
        let offers = config
            .extensions
            .iter()
            .map(|e| e.offer())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(
            header_name("sec-websocket-extensions"),
            HeaderValue::from_str(&offers).unwrap(),
        );
    }
    let head = RequestHead {
        method: Method::GET,
        uri,
        version: Version::HTTP_11,
        headers,
    };
    (head, key)
}

fn validate_handshake_response(resp: &ResponseHead, sent_key: &str) -> Result<()> {
    if resp.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::new_invalid_message(format!(
            "expected 101 Switching Protocols, got {}",
            resp.status
        )));
    }
    let upgrade_ok = resp
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(Error::new_invalid_message("response missing Upgrade: websocket"));
    }
    let accept = resp
        .headers
        .get(header_name("sec-websocket-accept"))
        .and_then(|v| v.to_str().ok());
    let expected = sec_websocket_accept(sent_key);
    if accept != Some(expected.as_str()) {
        return Err(Error::new_invalid_message("Sec-WebSocket-Accept did not match"));
    }
    Ok(())
}

fn negotiated_extensions(resp: &ResponseHead, config: &WebSocketConfig) -> Vec<&'static str> {
    let offered: Vec<&'static str> = config.extensions.iter().map(|e| e.offer()).collect();
    let Some(value) = resp
        .headers
        .get(header_name("sec-websocket-extensions"))
        .and_then(|v| v.to_str().ok())
    else {
        return Vec::new();
    };
    offered
        .into_iter()
        .filter(|offer| value.split(',').any(|tok| tok.trim().eq_ignore_ascii_case(offer)))
        .collect()
}

/// Runs a WebSocket handshake over `conn` (spec.md §4.F): builds the
/// handshake URI, picks the protocol version, attaches any requested
/// extension handshakers, writes the request, and validates the response.
/// On success the returned stream is in tunnel mode and subsequent raw
/// bytes arrive through its `chunk` handler; on failure the connection is
/// closed.
pub async fn connect(
    conn: &Connection,
    uri: Uri,
    secure: bool,
    config: WebSocketConfig,
) -> Result<WebSocketHandle> {
    let authority = conn.inner.authority.clone();
    let abs_uri = absolute_uri(&uri, &authority, secure);
    let (head, key) = build_handshake_request(abs_uri, &authority, &config);

    let stream = conn.create_stream(StreamKind::Request, head)?;

    let (tx, rx) = oneshot::channel::<ResponseHead>();
    let tx = Mutex::new(Some(tx));
    stream.on_head(move |resp| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(resp);
        }
    });

    stream.write_head(false, None, true, true).await?;

    let resp = rx.await.map_err(|_| Error::new_canceled())?;

    match validate_handshake_response(&resp, &key) {
        Ok(()) => {
            debug!("websocket handshake complete");
            let accepted_extensions = negotiated_extensions(&resp, &config);
            let handle = WebSocketHandle {
                stream,
                accepted_extensions,
            };
            let metrics_handle = conn.inner.metrics.connected(&handle);
            handle.stream.stream.set_metrics_handle(metrics_handle);
            conn.inner
                .web_socket
                .lock()
                .unwrap()
                .replace(Arc::clone(&handle.stream.stream));
            Ok(handle)
        }
        Err(err) => {
            debug!(%err, "websocket handshake failed");
            stream.reset(Error::new_invalid_message(err.to_string()));
            conn.inner.close().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_matches_rfc6455_example() {
        // https://www.rfc-editor.org/rfc/rfc6455#section-1.3
        let accept = sec_websocket_accept("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn absolute_uri_fills_in_authority() {
        let uri = Uri::from_static("/chat");
        let abs = absolute_uri(&uri, "example.com", false);
        assert_eq!(abs.to_string(), "http://example.com/chat");
    }

    #[test]
    fn absolute_uri_left_untouched_when_already_absolute() {
        let uri = Uri::from_static("http://other.example/chat");
        let abs = absolute_uri(&uri, "example.com", false);
        assert_eq!(abs, uri);
    }

    #[test]
    fn negotiated_extensions_filters_to_accepted() {
        let config = WebSocketConfig {
            version: 13,
            extensions: vec![Box::new(PermessageDeflate), Box::new(DeflateFrame)],
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            header_name("sec-websocket-extensions"),
            HeaderValue::from_static("permessage-deflate"),
        );
        let resp = ResponseHead {
            version: Version::HTTP_11,
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers,
        };
        assert_eq!(negotiated_extensions(&resp, &config), vec!["permessage-deflate"]);
    }
}
