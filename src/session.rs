//! Per-connection state shared between the dispatcher and the application.

use std::str;

use bytes::Bytes;
use log::*;

use crate::{
    error::{Error, ProtocolError, Result},
    handshake::{server::Request, Authenticator},
    protocol::{
        frame::{
            coding::{CloseCode, Control, Data, OpCode},
            CloseFrame, Frame, MAX_CONTROL_PAYLOAD,
        },
        DataFrame, Message, Role, WebSocketConfig,
    },
};

/// Where a connection stands in its lifetime.
///
/// The mode only moves forward: `Raw` → `Framed` → `Closing` → `Closed`,
/// possibly skipping steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Inbound bytes belong to the upgrade request.
    Raw,
    /// The handshake succeeded; inbound bytes are WebSocket frames.
    Framed,
    /// We sent a Close frame and wait for the peer's.
    Closing,
    /// Terminal. The transport should be shut down once output is flushed.
    Closed,
}

impl ConnectionMode {
    fn is_open(self) -> bool {
        self == ConnectionMode::Framed
    }
}

/// One connection's session: its assembler, its authenticator and the bytes
/// waiting to be written to the transport.
///
/// Nothing here performs I/O. Outbound frames are serialized into an output
/// buffer that the transport drains with [`UserContext::take_output`].
#[derive(Debug)]
pub struct UserContext {
    mode: ConnectionMode,
    authenticated: bool,
    config: WebSocketConfig,
    authenticator: Authenticator,
    data_frame: DataFrame,
    request: Option<Request>,
    output: Vec<u8>,
}

impl UserContext {
    /// Create a session in `Raw` mode.
    pub fn new(config: WebSocketConfig) -> Self {
        UserContext {
            mode: ConnectionMode::Raw,
            authenticated: false,
            config,
            authenticator: Authenticator::new(config.max_handshake_size),
            data_frame: DataFrame::new(Role::Server, config),
            request: None,
            output: Vec::new(),
        }
    }

    /// The current mode.
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Whether the handshake succeeded at some point.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The configuration in effect.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// The upgrade request, available once the handshake succeeded.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The inbound assembler.
    pub fn data_frame(&self) -> &DataFrame {
        &self.data_frame
    }

    pub(crate) fn data_frame_mut(&mut self) -> &mut DataFrame {
        &mut self.data_frame
    }

    pub(crate) fn authenticator_mut(&mut self) -> &mut Authenticator {
        &mut self.authenticator
    }

    /// Queue a data message.
    ///
    /// The payload goes out as a single final frame unless it is larger than
    /// [`WebSocketConfig::fragment_size`], in which case it is split into a
    /// first frame and continuation frames. A text payload must be valid UTF-8,
    /// otherwise nothing is queued and [`Error::Utf8`] is returned.
    pub fn send(&mut self, payload: impl Into<Bytes>, is_binary: bool) -> Result<()> {
        self.check_can_send()?;
        let payload = payload.into();
        if !is_binary {
            str::from_utf8(&payload)?;
        }
        self.send_checked(payload, is_binary)
    }

    /// Queue a [`Message`].
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        self.check_can_send()?;
        let is_binary = message.is_binary();
        self.send_checked(message.into_data(), is_binary)
    }

    fn send_checked(&mut self, payload: Bytes, is_binary: bool) -> Result<()> {
        let opcode = if is_binary { Data::Binary } else { Data::Text };

        match self.config.fragment_size {
            Some(size) if size > 0 && payload.len() > size => {
                let mut offset = 0;
                let mut opcode = opcode;
                while offset < payload.len() {
                    let end = usize::min(offset + size, payload.len());
                    let frame = Frame::message(
                        payload.slice(offset..end),
                        OpCode::Data(opcode),
                        end == payload.len(),
                    );
                    self.write_frame(frame)?;
                    opcode = Data::Continue;
                    offset = end;
                }
                Ok(())
            }
            _ => self.write_frame(Frame::message(payload, OpCode::Data(opcode), true)),
        }
    }

    /// Queue a Ping with the given payload.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.check_can_send()?;
        let payload = payload.into();
        if payload.len() as u64 > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.write_frame(Frame::ping(payload))
    }

    /// Start the closing handshake.
    ///
    /// Queues a Close frame and moves to `Closing`; messages arriving afterwards
    /// are dropped until the peer answers with its own Close. Calling this again
    /// while closing does nothing.
    pub fn close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        match self.mode {
            ConnectionMode::Framed => {
                debug!("Starting close handshake: {:?}", frame);
                self.write_frame(Frame::close(frame))?;
                self.mode = ConnectionMode::Closing;
                Ok(())
            }
            ConnectionMode::Closing => Ok(()),
            ConnectionMode::Raw => Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
            ConnectionMode::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Whether bytes are waiting to be written to the transport.
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Bytes waiting to be written to the transport.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Take all bytes waiting to be written to the transport.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Release everything held for this connection.
    ///
    /// Used when the transport goes away or is cancelled from outside. Buffered
    /// inbound bytes and the upgrade request are dropped; queued output is kept
    /// so it can still be flushed if the transport allows.
    pub fn abort(&mut self) {
        if self.mode != ConnectionMode::Closed {
            debug!("Aborting connection in {:?} mode", self.mode);
        }
        self.data_frame.clear();
        self.authenticator.clear();
        self.request = None;
        self.mode = ConnectionMode::Closed;
    }

    /// Serialize a frame into the output buffer.
    pub(crate) fn write_frame(&mut self, frame: Frame) -> Result<()> {
        trace!("Sending frame: {}", frame);
        frame.format_into_buf(&mut self.output)
    }

    pub(crate) fn write_raw(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    /// Flip from `Raw` to `Framed` after a successful handshake.
    pub(crate) fn upgrade(&mut self, request: Request) {
        debug_assert_eq!(self.mode, ConnectionMode::Raw);
        self.request = Some(request);
        self.authenticated = true;
        self.mode = ConnectionMode::Framed;
    }

    pub(crate) fn set_mode(&mut self, mode: ConnectionMode) {
        self.mode = mode;
    }

    /// Queue the reply to the peer's Close frame.
    ///
    /// The peer's status code is echoed when it may appear on the wire; any
    /// other code is answered as a protocol violation.
    pub(crate) fn reply_close(&mut self, received: Option<&CloseFrame>) -> Result<()> {
        let reply = match received {
            Some(frame) if frame.code.is_allowed() => {
                Some(CloseFrame { code: frame.code, reason: String::new() })
            }
            Some(frame) => {
                debug!("Received close frame with invalid code {}", frame.code);
                Some(CloseFrame { code: CloseCode::Protocol, reason: "Protocol violation".into() })
            }
            None => None,
        };
        let mut builder = self.data_frame.create_instance();
        if let Some(reply) = reply {
            builder.extend_payload(reply.to_payload());
        }
        self.write_frame(builder.into_frame(OpCode::Control(Control::Close)))
    }

    fn check_can_send(&self) -> Result<()> {
        if self.mode.is_open() {
            return Ok(());
        }
        match self.mode {
            ConnectionMode::Raw => Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
            ConnectionMode::Closing => Err(Error::Protocol(ProtocolError::SendAfterClosing)),
            _ => Err(Error::AlreadyClosed),
        }
    }
}
