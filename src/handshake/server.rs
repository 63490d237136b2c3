//! Server handshake machine.

use std::io;

use bytes::BytesMut;
use http::{
    header::{CONNECTION, CONTENT_LENGTH, SEC_WEBSOCKET_VERSION},
    HeaderMap, HeaderValue, Request as HttpRequest, Response as HttpResponse, StatusCode,
};
use httparse::Status;
use log::*;

use super::{derive_accept_key, FromHttparse, TryParse, MAX_HEADERS};
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// Server request type.
pub type Request = HttpRequest<()>;

/// Server response type.
pub type Response = HttpResponse<()>;

/// Server error response type.
pub type ErrorResponse = HttpResponse<Option<String>>;

fn create_parts<T>(request: &HttpRequest<T>) -> Result<http::response::Builder> {
    if request.method() != http::Method::GET {
        return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
    }

    if request.version() < http::Version::HTTP_11 {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }

    if !request
        .headers()
        .get("Connection")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(|c| c == ' ' || c == ',').any(|p| p.eq_ignore_ascii_case("Upgrade")))
        .unwrap_or(false)
    {
        return Err(Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader));
    }

    if !request
        .headers()
        .get("Upgrade")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader));
    }

    if !request.headers().get("Sec-WebSocket-Version").map(|h| h == "13").unwrap_or(false) {
        return Err(Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader));
    }

    let key = request
        .headers()
        .get("Sec-WebSocket-Key")
        .ok_or(Error::Protocol(ProtocolError::MissingSecWebSocketKey))?;

    let builder = HttpResponse::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .version(request.version())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()));

    Ok(builder)
}

/// Create a response for the request.
pub fn create_response(request: &Request) -> Result<Response> {
    Ok(create_parts(request)?.body(())?)
}

/// Write `response` to the stream `w`, followed by its body if it has one.
pub fn write_response<T>(mut w: impl io::Write, response: &HttpResponse<T>) -> Result<()> {
    writeln!(
        w,
        "{version:?} {status}\r",
        version = response.version(),
        status = response.status()
    )?;

    for (k, v) in response.headers() {
        writeln!(w, "{}: {}\r", k, v.to_str()?)?;
    }

    writeln!(w, "\r")?;

    Ok(())
}

/// Serialize an error response, its body included.
pub fn write_error_response(mut w: impl io::Write, response: &ErrorResponse) -> Result<()> {
    write_response(&mut w, response)?;
    if let Some(body) = response.body() {
        w.write_all(body.as_bytes())?;
    }
    Ok(())
}

impl TryParse for Request {
    fn try_parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut hbuffer);
        Ok(match req.parse(buf)? {
            Status::Partial => None,
            Status::Complete(size) => Some((size, Request::from_httparse(req)?)),
        })
    }
}

impl<'h, 'b: 'h> FromHttparse<httparse::Request<'h, 'b>> for Request {
    fn from_httparse(raw: httparse::Request<'h, 'b>) -> Result<Self> {
        if raw.method != Some("GET") {
            return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
        }

        if raw.version.map_or(true, |minor| minor < /*1.*/1) {
            return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
        }

        let headers = HeaderMap::from_httparse(raw.headers)?;

        let mut request = Request::new(());
        *request.method_mut() = http::Method::GET;
        *request.headers_mut() = headers;
        *request.uri_mut() = raw.path.unwrap_or("/").parse()?;
        // httparse stops at HTTP/1.x and 1.0 was refused above.
        *request.version_mut() = http::Version::HTTP_11;

        Ok(request)
    }
}

/// The callback trait.
///
/// The callback is called when the server receives an incoming WebSocket
/// handshake request from the client. Specifying a callback allows you to analyze incoming headers
/// and add additional headers to the response that server sends to the client and/or reject the
/// connection based on the incoming headers.
pub trait Callback: Sized {
    /// Called whenever the server read the request from the client and is ready to reply to it.
    /// May return additional reply headers.
    /// Returning an error resulting in rejecting the incoming connection.
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse>;
}

impl<F> Callback for F
where
    F: FnOnce(&Request, Response) -> Result<Response, ErrorResponse>,
{
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        self(request, response)
    }
}

/// Stub for callback that does nothing.
#[derive(Clone, Copy, Debug)]
pub struct NoCallback;

impl Callback for NoCallback {
    fn on_request(self, _request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        Ok(response)
    }
}

/// Outcome of feeding bytes to an [`Authenticator`].
#[derive(Debug)]
pub enum AuthResult {
    /// The header block is not complete yet; feed more bytes.
    Pending,
    /// The upgrade was accepted.
    Success {
        /// The parsed upgrade request.
        request: Request,
        /// The serialized `101 Switching Protocols` response to send.
        response: Vec<u8>,
        /// Bytes received after the header block; they belong to the framed stream.
        tail: Vec<u8>,
    },
    /// The upgrade was rejected.
    Failure {
        /// Why the handshake failed.
        error: Error,
        /// The serialized error response to send before closing.
        response: Vec<u8>,
    },
}

/// Incremental parser and validator for the client's upgrade request.
#[derive(Debug)]
pub struct Authenticator {
    buffer: BytesMut,
    max_size: usize,
}

impl Authenticator {
    /// Create an authenticator that gives up once the header block exceeds `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Authenticator { buffer: BytesMut::new(), max_size }
    }

    /// Number of bytes buffered while waiting for the end of the header block.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially received request.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Feed the next chunk of raw bytes.
    ///
    /// Returns `Pending` until the blank line terminating the header block has
    /// arrived. The callback may amend the response or reject the request.
    pub fn authenticate<C: Callback>(&mut self, chunk: &[u8], callback: C) -> AuthResult {
        self.buffer.extend_from_slice(chunk);

        let (size, request) = match Request::try_parse(&self.buffer) {
            Ok(Some((size, _))) if size > self.max_size => {
                return self.fail(Error::Capacity(CapacityError::HeaderTooLong))
            }
            Ok(Some(parsed)) => parsed,
            Ok(None) if self.buffer.len() > self.max_size => {
                return self.fail(Error::Capacity(CapacityError::HeaderTooLong))
            }
            Ok(None) => {
                trace!("Handshake request incomplete, {} bytes buffered", self.buffer.len());
                return AuthResult::Pending;
            }
            Err(err) => return self.fail(err),
        };

        let tail = self.buffer.split_off(size).to_vec();
        self.buffer.clear();
        debug!("Server handshake request for {}", request.uri());

        let response = match create_response(&request) {
            Ok(response) => response,
            Err(err) => return self.fail(err),
        };

        let response = match callback.on_request(&request, response) {
            Ok(response) => response,
            Err(resp) => {
                if resp.status().is_success() {
                    return self.fail(Error::Protocol(ProtocolError::CustomResponseSuccessful));
                }
                return self.fail(Error::Http(resp));
            }
        };

        let mut output = Vec::new();
        if let Err(err) = write_response(&mut output, &response) {
            return self.fail(err);
        }
        debug!("Server handshake done.");
        AuthResult::Success { request, response: output, tail }
    }

    fn fail(&mut self, mut error: Error) -> AuthResult {
        warn!("Server handshake failed: {}", error);
        self.buffer.clear();

        let mut output = Vec::new();
        let written = match error {
            Error::Http(ref mut response) => {
                close_headers(response);
                write_error_response(&mut output, response)
            }
            ref other => write_error_response(&mut output, &error_response(other)),
        };
        if let Err(err) = written {
            debug!("Cannot serialize handshake error response: {}", err);
            output.clear();
        }
        AuthResult::Failure { error, response: output }
    }
}

/// Build the response sent when the handshake fails for a protocol reason.
fn error_response(error: &Error) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    let status = match error {
        Error::Capacity(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        Error::Protocol(ProtocolError::MissingSecWebSocketVersionHeader) => {
            response.headers_mut().insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
            StatusCode::UPGRADE_REQUIRED
        }
        Error::Protocol(ProtocolError::WrongHttpMethod) => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::BAD_REQUEST,
    };
    *response.status_mut() = status;
    close_headers(&mut response);
    response
}

fn close_headers(response: &mut ErrorResponse) {
    let length = response.body().as_ref().map_or(0, String::len);
    response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(length));
}
