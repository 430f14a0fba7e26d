//! Component C: `RequestWriter` header-finalization rules (spec.md §4.C).
//! Grounded on `proto::h1::role::Client::{set_length, encode_headers}` in
//! the teacher, which apply the same Host/Transfer-Encoding/Connection
//! bookkeeping to an outgoing request.

use http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderValue, Version};

use crate::transport::RequestHead;

/// Applies the five header-finalization rules of spec.md §4.C, in order.
pub(crate) fn finalize_headers(
    head: &mut RequestHead,
    authority: &str,
    chunked: bool,
    keep_alive: bool,
    accept_compression: bool,
) {
    // 1. Version is whatever the connection announces (set by the caller
    // onto `head.version` before this call).

    // 2. Host / defensive Transfer-Encoding strip.
    if !head.headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(authority) {
            head.headers.insert(HOST, value);
        }
    } else {
        head.headers.remove(TRANSFER_ENCODING);
    }

    // 3. Chunked framing.
    if chunked {
        head.headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        head.headers.remove(CONTENT_LENGTH);
    }

    // 4. Accept-Encoding.
    if accept_compression && !head.headers.contains_key(ACCEPT_ENCODING) {
        head.headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("deflate, gzip"));
    }

    // 5. Connection directive vs. keep-alive setting / version.
    if !keep_alive && head.version == Version::HTTP_11 {
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    } else if keep_alive && head.version == Version::HTTP_10 {
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

/// Reads back a `Content-Length` the caller set explicitly, so `write_head`
/// can decide `BodyEncoding::Length` vs `BodyEncoding::Empty` for a request
/// with no chunked framing and no initial body.
pub(crate) fn content_length(head: &RequestHead) -> Option<u64> {
    head.headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Uri};

    fn head() -> RequestHead {
        RequestHead {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn adds_host_when_missing() {
        let mut h = head();
        finalize_headers(&mut h, "example.com", false, true, false);
        assert_eq!(h.headers.get(HOST).unwrap(), "example.com");
    }

    #[test]
    fn strips_transfer_encoding_when_host_already_set() {
        let mut h = head();
        h.headers.insert(HOST, HeaderValue::from_static("example.com"));
        h.headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        finalize_headers(&mut h, "example.com", false, true, false);
        assert!(!h.headers.contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn chunked_removes_content_length() {
        let mut h = head();
        h.headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        finalize_headers(&mut h, "example.com", true, true, false);
        assert_eq!(h.headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
        assert!(!h.headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn adds_accept_encoding_when_enabled_and_unset() {
        let mut h = head();
        finalize_headers(&mut h, "example.com", false, true, true);
        assert_eq!(h.headers.get(ACCEPT_ENCODING).unwrap(), "deflate, gzip");
    }

    #[test]
    fn keep_alive_disabled_on_1_1_adds_connection_close() {
        let mut h = head();
        finalize_headers(&mut h, "example.com", false, false, false);
        assert_eq!(h.headers.get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn keep_alive_enabled_on_1_0_adds_connection_keep_alive() {
        let mut h = head();
        h.version = Version::HTTP_10;
        finalize_headers(&mut h, "example.com", false, true, false);
        assert_eq!(h.headers.get(CONNECTION).unwrap(), "keep-alive");
    }

    #[test]
    fn keep_alive_enabled_on_1_1_adds_no_connection_header() {
        let mut h = head();
        finalize_headers(&mut h, "example.com", false, true, false);
        assert!(!h.headers.contains_key(CONNECTION));
    }
}
