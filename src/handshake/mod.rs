//! WebSocket handshake control.
//!
//! Only the server side is implemented: an [`Authenticator`](server::Authenticator)
//! buffers the raw bytes of an upgrade request until its header block is
//! complete, validates it and produces the `101 Switching Protocols` response.

pub mod server;

use data_encoding::BASE64;
use http::{HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};

use crate::error::Result;

pub use self::server::{AuthResult, Authenticator};

/// Limit for the number of header lines.
pub const MAX_HEADERS: usize = 124;

/// Derive the `Sec-WebSocket-Accept` response header from a `Sec-WebSocket-Key` request header.
///
/// This function can be used to perform a handshake before passing a raw TCP stream to
/// the framing engine.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::default();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    BASE64.encode(&sha1.finalize())
}

/// Trait to read HTTP parseable objects.
pub(crate) trait TryParse: Sized {
    /// Return Ok(None) if incomplete, Err on syntax error.
    fn try_parse(data: &[u8]) -> Result<Option<(usize, Self)>>;
}

/// Trait to convert raw objects into HTTP parseables.
pub(crate) trait FromHttparse<T>: Sized {
    /// Convert raw object into parsed HTTP headers.
    fn from_httparse(raw: T) -> Result<Self>;
}

impl<'b: 'h, 'h> FromHttparse<&'b [httparse::Header<'h>]> for HeaderMap {
    fn from_httparse(raw: &'b [httparse::Header<'h>]) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for h in raw {
            headers.append(
                HeaderName::from_bytes(h.name.as_bytes())?,
                HeaderValue::from_bytes(h.value)?,
            );
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_conversion() {
        // example from RFC 6455
        assert_eq!(derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn headers() {
        const DATA: &[u8] = b"Host: foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let raw = match httparse::parse_headers(DATA, &mut hbuffer).unwrap() {
            httparse::Status::Complete((_, raw)) => raw,
            httparse::Status::Partial => panic!("incomplete headers"),
        };
        let hdr = HeaderMap::from_httparse(raw).unwrap();
        assert_eq!(hdr.get("Host").unwrap(), &b"foo.com"[..]);
        assert_eq!(hdr.get("Upgrade").unwrap(), &b"websocket"[..]);
        assert_eq!(hdr.get("connection").unwrap(), &b"Upgrade"[..]);
    }
}
