//! Per-connection dispatch of inbound bytes.

use log::*;

use crate::{
    error::{Error, Result},
    handshake::{
        server::{ErrorResponse, Request, Response},
        AuthResult,
    },
    protocol::{
        frame::{
            coding::{CloseCode, Control, OpCode},
            CloseFrame, Frame,
        },
        DataState, Message, WebSocketConfig,
    },
    session::{ConnectionMode, UserContext},
};

/// Application callbacks for one connection.
///
/// Only [`Handler::on_message`] is required. Callbacks run on the thread that
/// feeds the connection and receive the session so they can queue replies.
pub trait Handler {
    /// Inspect the upgrade request and amend the response, or reject the
    /// connection by returning an error response.
    fn on_request(&mut self, _request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        Ok(response)
    }

    /// The handshake succeeded and the connection is framed.
    fn on_connect(&mut self, _context: &mut UserContext) -> Result<()> {
        Ok(())
    }

    /// A complete message arrived.
    fn on_message(&mut self, context: &mut UserContext, message: Message) -> Result<()>;

    /// The peer closed the connection with a Close frame.
    ///
    /// Called exactly once per closing handshake, never for malformed input or
    /// a dropped transport.
    fn on_close(&mut self, _context: &mut UserContext, _frame: Option<&CloseFrame>) {}
}

/// What the transport should do after a chunk was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Flush the output and shut the transport down.
    Close,
}

/// Routes a connection's inbound chunks to the authenticator or the assembler
/// and reacts to what they report.
#[derive(Debug)]
pub struct WebSocketHandler<H> {
    context: UserContext,
    app: H,
    /// A closing handshake completed and has not been reported to a later read.
    close_pending: bool,
}

impl<H: Handler> WebSocketHandler<H> {
    /// Create a handler for a freshly accepted connection.
    pub fn new(app: H) -> Self {
        Self::with_config(app, WebSocketConfig::default())
    }

    /// Create a handler with a custom configuration.
    pub fn with_config(app: H, config: WebSocketConfig) -> Self {
        WebSocketHandler { context: UserContext::new(config), app, close_pending: false }
    }

    /// The connection's session.
    pub fn context(&self) -> &UserContext {
        &self.context
    }

    /// The connection's session, mutably, e.g. to send or drain output.
    pub fn context_mut(&mut self) -> &mut UserContext {
        &mut self.context
    }

    /// The application handler.
    pub fn app(&self) -> &H {
        &self.app
    }

    /// Consume the dispatcher, returning the application handler.
    pub fn into_app(self) -> H {
        self.app
    }

    /// Process one chunk of bytes received from the transport.
    ///
    /// Every byte is processed exactly once. Outbound bytes produced on the way
    /// (handshake response, pongs, close replies, application sends) are queued
    /// on the session and must be written out even when an error is returned.
    ///
    /// Once the connection is closed, the first call after a completed closing
    /// handshake fails with [`Error::ConnectionClosed`] and every later call
    /// with [`Error::AlreadyClosed`].
    pub fn handle_request(&mut self, chunk: &[u8]) -> Result<Flow> {
        match self.context.mode() {
            ConnectionMode::Raw => self.authenticate(chunk),
            ConnectionMode::Framed | ConnectionMode::Closing => self.dispatch(chunk),
            ConnectionMode::Closed if std::mem::take(&mut self.close_pending) => {
                Err(Error::ConnectionClosed)
            }
            ConnectionMode::Closed => Err(Error::AlreadyClosed),
        }
    }

    fn authenticate(&mut self, chunk: &[u8]) -> Result<Flow> {
        let app = &mut self.app;
        let callback = |request: &Request, response: Response| app.on_request(request, response);
        match self.context.authenticator_mut().authenticate(chunk, callback) {
            AuthResult::Pending => Ok(Flow::Continue),
            AuthResult::Success { request, response, tail } => {
                self.context.write_raw(&response);
                self.context.upgrade(request);
                self.app.on_connect(&mut self.context)?;
                if tail.is_empty() {
                    return Ok(Flow::Continue);
                }
                trace!("{} bytes of frames arrived with the handshake", tail.len());
                self.dispatch(&tail)
            }
            AuthResult::Failure { error, response } => {
                self.context.write_raw(&response);
                self.context.set_mode(ConnectionMode::Closed);
                Err(error)
            }
        }
    }

    fn dispatch(&mut self, chunk: &[u8]) -> Result<Flow> {
        let mut state = self.context.data_frame_mut().append(chunk);
        loop {
            match state {
                DataState::Continuing => return Ok(Flow::Continue),
                DataState::Complete => {
                    let message = self.context.data_frame_mut().take_message();
                    self.context.data_frame_mut().reset();
                    match message {
                        Some(message) if self.context.mode() == ConnectionMode::Framed => {
                            self.app.on_message(&mut self.context, message)?
                        }
                        _ => trace!("Dropping message received while closing"),
                    }
                }
                DataState::Ping => {
                    let frame = self.context.data_frame();
                    let mut pong = frame.create_instance();
                    for segment in frame.as_raw() {
                        pong.extend_payload(segment.clone());
                    }
                    self.context.data_frame_mut().reset();
                    if self.context.mode() == ConnectionMode::Framed {
                        self.context.write_frame(pong.into_frame(OpCode::Control(Control::Pong)))?;
                    }
                }
                DataState::Pong => {
                    trace!("Received pong");
                    self.context.data_frame_mut().reset();
                }
                DataState::Closed => return self.finish(),
            }

            if self.context.mode() == ConnectionMode::Closed {
                return Ok(Flow::Close);
            }
            state = self.context.data_frame_mut().resume();
        }
    }

    /// Handle the assembler's terminal state.
    fn finish(&mut self) -> Result<Flow> {
        let was_open = self.context.mode() == ConnectionMode::Framed;

        if let Some(error) = self.context.data_frame_mut().take_error() {
            if was_open {
                let (code, reason) = match error {
                    Error::Utf8 => (CloseCode::Invalid, "Invalid UTF-8"),
                    Error::Capacity(_) => (CloseCode::Size, "Message too big"),
                    _ => (CloseCode::Protocol, "Protocol violation"),
                };
                let frame = CloseFrame { code, reason: reason.into() };
                self.context.write_frame(Frame::close(Some(frame)))?;
            }
            self.context.set_mode(ConnectionMode::Closed);
            return Err(error);
        }

        let close = self.context.data_frame().close_frame().cloned();
        debug!("Received close frame: {:?}", close);
        if was_open {
            self.context.reply_close(close.as_ref())?;
        }
        self.context.set_mode(ConnectionMode::Closed);
        self.close_pending = true;
        self.app.on_close(&mut self.context, close.as_ref());
        Ok(Flow::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ProtocolError,
        protocol::{frame::coding::Data, DataFrame, Role},
    };

    const HANDSHAKE: &[u8] = b"\
        GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[derive(Default)]
    struct Recorder {
        connected: usize,
        messages: Vec<Message>,
        closes: Vec<Option<CloseFrame>>,
    }

    impl Handler for Recorder {
        fn on_connect(&mut self, _context: &mut UserContext) -> Result<()> {
            self.connected += 1;
            Ok(())
        }

        fn on_message(&mut self, _context: &mut UserContext, message: Message) -> Result<()> {
            self.messages.push(message);
            Ok(())
        }

        fn on_close(&mut self, _context: &mut UserContext, frame: Option<&CloseFrame>) {
            self.closes.push(frame.cloned());
        }
    }

    fn client_frame(opcode: OpCode, payload: &[u8], is_final: bool) -> Vec<u8> {
        let mut builder = DataFrame::new(Role::Client, WebSocketConfig::default());
        builder.extend_payload(payload.to_vec());
        let mut frame = builder.into_frame(opcode);
        frame.header_mut().is_final = is_final;
        frame.encode().unwrap()
    }

    fn connected() -> WebSocketHandler<Recorder> {
        let mut handler = WebSocketHandler::new(Recorder::default());
        assert_eq!(handler.handle_request(HANDSHAKE).unwrap(), Flow::Continue);
        assert_eq!(handler.context().mode(), ConnectionMode::Framed);
        handler.context_mut().take_output();
        handler
    }

    #[test]
    fn handshake_then_message() {
        let mut handler = connected();
        assert_eq!(handler.app().connected, 1);
        assert_eq!(handler.context().request().unwrap().uri().path(), "/chat");

        let input = client_frame(OpCode::Data(Data::Text), b"Hello", true);
        assert_eq!(handler.handle_request(&input).unwrap(), Flow::Continue);
        assert_eq!(handler.app().messages, vec![Message::text("Hello")]);
        assert!(!handler.context().has_output());
    }

    #[test]
    fn frames_in_handshake_chunk() {
        let mut input = HANDSHAKE.to_vec();
        input.extend(client_frame(OpCode::Data(Data::Binary), &[1, 2, 3], true));
        input.extend(client_frame(OpCode::Data(Data::Text), b"two", true));

        let mut handler = WebSocketHandler::new(Recorder::default());
        assert_eq!(handler.handle_request(&input).unwrap(), Flow::Continue);
        assert_eq!(
            handler.app().messages,
            vec![Message::binary(vec![1u8, 2, 3]), Message::text("two")]
        );
    }

    #[test]
    fn ping_is_answered() {
        let mut handler = connected();
        let input = client_frame(OpCode::Control(Control::Ping), b"abc", true);
        handler.handle_request(&input).unwrap();
        assert_eq!(handler.context_mut().take_output(), vec![0x8a, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn close_is_echoed_once() {
        let mut handler = connected();
        let mut input = client_frame(OpCode::Control(Control::Close), &[0x03, 0xe8], true);
        input.extend(client_frame(OpCode::Data(Data::Text), b"late", true));

        assert_eq!(handler.handle_request(&input).unwrap(), Flow::Close);
        assert_eq!(handler.context().mode(), ConnectionMode::Closed);
        assert_eq!(handler.context_mut().take_output(), vec![0x88, 0x02, 0x03, 0xe8]);
        assert_eq!(
            handler.app().closes,
            vec![Some(CloseFrame { code: CloseCode::Normal, reason: String::new() })]
        );
        assert!(handler.app().messages.is_empty());
        assert!(matches!(handler.handle_request(&[0x81]), Err(Error::ConnectionClosed)));
        assert!(matches!(handler.handle_request(&[0x81]), Err(Error::AlreadyClosed)));
        assert!(!handler.context().has_output());
    }

    #[test]
    fn malformed_frame_is_silent() {
        let mut handler = connected();
        let mut input = client_frame(OpCode::Data(Data::Text), b"par", false);
        input.extend([0xf1, 0x80, 0, 0, 0, 0]);

        let err = handler.handle_request(&input).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::NonZeroReservedBits)));
        assert!(handler.app().messages.is_empty());
        assert!(handler.app().closes.is_empty());
        let output = handler.context_mut().take_output();
        assert_eq!(&output[..4], &[0x88, 0x14, 0x03, 0xea]);
        assert!(matches!(handler.handle_request(&[0x81]), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn server_initiated_close() {
        let mut handler = connected();
        handler.context_mut().close(None).unwrap();
        assert_eq!(handler.context_mut().take_output(), vec![0x88, 0x00]);

        let mut input = client_frame(OpCode::Data(Data::Text), b"dropped", true);
        input.extend(client_frame(OpCode::Control(Control::Close), &[], true));
        assert_eq!(handler.handle_request(&input).unwrap(), Flow::Close);
        assert!(handler.app().messages.is_empty());
        assert_eq!(handler.app().closes, vec![None]);
        assert!(!handler.context().has_output());
    }

    #[test]
    fn handshake_failure() {
        let mut handler = WebSocketHandler::new(Recorder::default());
        let err = handler.handle_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert!(err.is_handshake_failure());
        assert_eq!(handler.context().mode(), ConnectionMode::Closed);
        assert!(!handler.context().is_authenticated());
        assert_eq!(handler.app().connected, 0);
        assert!(handler.context().output().starts_with(b"HTTP/1.1 400 Bad Request"));
    }

    #[test]
    fn application_rejects_upgrade() {
        struct Picky;
        impl Handler for Picky {
            fn on_request(&mut self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
                if request.uri().path() == "/chat" {
                    return Ok(response);
                }
                let mut response = ErrorResponse::new(None);
                *response.status_mut() = http::StatusCode::NOT_FOUND;
                Err(response)
            }

            fn on_message(&mut self, _context: &mut UserContext, _message: Message) -> Result<()> {
                Ok(())
            }
        }

        let mut handler = WebSocketHandler::new(Picky);
        let request = String::from_utf8_lossy(HANDSHAKE).replace("/chat", "/other");
        let err = handler.handle_request(request.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Http(ref response) if response.status() == 404));
        assert!(handler.context().output().starts_with(b"HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn echo_from_callback() {
        struct Echo;
        impl Handler for Echo {
            fn on_message(&mut self, context: &mut UserContext, message: Message) -> Result<()> {
                context.send_message(message)
            }
        }

        let mut handler = WebSocketHandler::new(Echo);
        handler.handle_request(HANDSHAKE).unwrap();
        handler.context_mut().take_output();
        handler.handle_request(&client_frame(OpCode::Data(Data::Text), b"hi", true)).unwrap();
        assert_eq!(handler.context_mut().take_output(), vec![0x81, 0x02, b'h', b'i']);
    }
}
