//! Methods to serve a WebSocket connection over a blocking stream.

use std::io::{ErrorKind, Read, Write};

use log::*;

use crate::{
    error::{Error, ProtocolError, Result},
    handler::{Flow, Handler, WebSocketHandler},
    protocol::WebSocketConfig,
    session::ConnectionMode,
};

const READ_BUFFER_CHUNK_SIZE: usize = 4096;

/// Serve one connection until it closes.
///
/// This reads the given stream chunk by chunk, feeds every chunk to a
/// [`WebSocketHandler`] wrapping `app` and writes out whatever the connection
/// produced before reading again. Any `Read + Write` stream is supported, a
/// `TcpStream` being the typical one; timeouts are the stream's business.
///
/// Returns the application handler once the closing handshake completed.
pub fn serve<S: Read + Write, H: Handler>(stream: S, app: H) -> Result<H> {
    serve_with_config(stream, app, None)
}

/// The same as [`serve()`] but the one can specify a websocket configuration.
/// Please refer to [`serve()`] for more details.
pub fn serve_with_config<S: Read + Write, H: Handler>(
    mut stream: S,
    app: H,
    config: Option<WebSocketConfig>,
) -> Result<H> {
    let mut handler = WebSocketHandler::with_config(app, config.unwrap_or_default());
    let mut chunk = [0u8; READ_BUFFER_CHUNK_SIZE];

    loop {
        let size = match stream.read(&mut chunk) {
            Ok(size) => size,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                handler.context_mut().abort();
                return Err(Error::Io(err));
            }
        };

        if size == 0 {
            let err = match handler.context().mode() {
                ConnectionMode::Raw => ProtocolError::HandshakeIncomplete,
                _ => ProtocolError::ResetWithoutClosingHandshake,
            };
            debug!("Stream ended: {}", err);
            handler.context_mut().abort();
            return Err(Error::Protocol(err));
        }

        trace!("Received {} bytes", size);
        let flow = handler.handle_request(&chunk[..size]);
        let flushed = flush(&mut stream, &mut handler);

        // A handler error is reported ahead of a failed write.
        let flow = flow?;
        flushed?;
        match flow {
            Flow::Continue => {}
            Flow::Close => {
                debug!("Connection closed");
                return Ok(handler.into_app());
            }
        }
    }
}

fn flush<S: Write, H: Handler>(stream: &mut S, handler: &mut WebSocketHandler<H>) -> Result<()> {
    if !handler.context().has_output() {
        return Ok(());
    }
    let output = handler.context_mut().take_output();
    trace!("Writing {} bytes", output.len());
    if let Err(err) = stream.write_all(&output).and_then(|()| stream.flush()) {
        handler.context_mut().abort();
        return Err(Error::Io(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::Message, session::UserContext};
    use std::io::{self, Cursor};

    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Silent;

    impl Handler for Silent {
        fn on_message(&mut self, _context: &mut UserContext, _message: Message) -> Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe {
        input: Cursor<Vec<u8>>,
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::BrokenPipe, "peer went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const HANDSHAKE: &[u8] = b"\
        GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[test]
    fn handshake_error_wins_over_write_error() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let err = serve(BrokenPipe { input: Cursor::new(request) }, Silent).unwrap_err();
        assert!(err.is_handshake_failure(), "unexpected error: {err}");
        assert!(!matches!(err, Error::Io(_)));
    }

    #[test]
    fn write_error_after_successful_handshake() {
        let err = serve(BrokenPipe { input: Cursor::new(HANDSHAKE.to_vec()) }, Silent).unwrap_err();
        assert!(matches!(err, Error::Io(ref io) if io.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn eof_before_handshake() {
        let stream = MockStream { input: Cursor::new(b"GET / HTTP/1.1\r\n".to_vec()), output: Vec::new() };
        let err = serve(stream, Silent).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::HandshakeIncomplete)));
    }
}
