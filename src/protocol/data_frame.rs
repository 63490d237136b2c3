//! Incremental frame assembly.
//!
//! A [`DataFrame`] owns everything one connection needs to turn an arbitrary
//! sequence of inbound byte chunks into messages and control signals. It never
//! performs I/O and never blocks: each call consumes what it can and reports a
//! [`DataState`].

use std::{io::Cursor, mem};

use bytes::{Buf, Bytes, BytesMut};
use log::*;

use super::{
    frame::{
        apply_mask_offset,
        coding::{Control, Data, OpCode},
        parse_close_payload, CloseFrame, Frame, FrameHeader,
    },
    IncompleteMessage, IncompleteMessageType, Message, Role, WebSocketConfig,
};
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// The state of a [`DataFrame`] after consuming input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataState {
    /// Waiting for more bytes or more fragments.
    #[default]
    Continuing,
    /// A whole message is ready, see [`DataFrame::take_message`].
    Complete,
    /// A close frame arrived or the input was malformed. Terminal.
    Closed,
    /// A ping arrived; its payload is available through [`DataFrame::as_raw`].
    Ping,
    /// A pong arrived.
    Pong,
}

/// Accumulates inbound bytes into frames and frames into messages.
///
/// The same type doubles as a builder for outbound frames: a fresh instance from
/// [`DataFrame::create_instance`] collects payload segments with
/// [`DataFrame::extend_payload`] and is turned into a [`Frame`] with
/// [`DataFrame::into_frame`], masked according to its role.
#[derive(Debug)]
pub struct DataFrame {
    role: Role,
    config: WebSocketConfig,
    state: DataState,
    /// Inbound bytes not yet consumed by a header or a payload.
    pending: BytesMut,
    /// Header and payload length of the frame being received.
    current: Option<(FrameHeader, u64)>,
    /// Payload bytes of the current frame received so far.
    received: u64,
    /// Unmasked payload of the control frame being received.
    segments: Vec<Bytes>,
    /// A data message waiting for further fragments.
    incomplete: Option<IncompleteMessage>,
    /// The message behind `DataState::Complete`.
    message: Option<Message>,
    /// Payload segments of the last control frame, or of the frame being built.
    raw: Vec<Bytes>,
    close: Option<CloseFrame>,
    error: Option<Error>,
}

impl DataFrame {
    /// Create an empty assembler.
    pub fn new(role: Role, config: WebSocketConfig) -> Self {
        DataFrame {
            role,
            config,
            state: DataState::Continuing,
            pending: BytesMut::new(),
            current: None,
            received: 0,
            segments: Vec::new(),
            incomplete: None,
            message: None,
            raw: Vec::new(),
            close: None,
            error: None,
        }
    }

    /// Create a fresh, empty instance sharing this one's role and configuration.
    pub fn create_instance(&self) -> Self {
        DataFrame::new(self.role, self.config)
    }

    /// The role this assembler decodes for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The configuration in effect.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// The current state.
    pub fn state(&self) -> DataState {
        self.state
    }

    /// Number of received bytes not yet consumed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk of inbound bytes.
    ///
    /// Bytes are consumed up to the end of the first frame that changes the state;
    /// anything after it stays buffered until [`DataFrame::resume`] is called
    /// following [`DataFrame::reset`]. Returns `DataState::Continuing` when more
    /// input is needed.
    pub fn append(&mut self, chunk: &[u8]) -> DataState {
        if self.state == DataState::Closed {
            trace!("Discarding {} bytes received after close", chunk.len());
            return DataState::Closed;
        }
        self.pending.extend_from_slice(chunk);
        if self.state != DataState::Continuing {
            // The previous event has not been consumed yet.
            return self.state;
        }

        self.state = match self.poll() {
            Ok(state) => state,
            Err(err) => {
                self.fail(err);
                DataState::Closed
            }
        };
        self.state
    }

    /// Continue processing bytes already buffered, without new input.
    pub fn resume(&mut self) -> DataState {
        self.append(&[])
    }

    /// Acknowledge the current state and get ready for the next frame.
    ///
    /// A partially received fragmented message survives the reset. `Closed` is
    /// terminal and is not reset.
    pub fn reset(&mut self) {
        if self.state == DataState::Closed {
            return;
        }
        self.state = DataState::Continuing;
        self.message = None;
        self.raw.clear();
    }

    /// Take the message completed by the last `DataState::Complete`.
    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    /// Payload segments of the last control frame, or of the frame being built.
    pub fn as_raw(&self) -> &[Bytes] {
        &self.raw
    }

    /// The close frame received, if the peer sent one with a payload.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.close.as_ref()
    }

    /// The error that forced the `Closed` state, if the input was malformed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Take the error that forced the `Closed` state.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Drop all buffered state and move to `Closed`.
    pub fn clear(&mut self) {
        self.discard();
        self.state = DataState::Closed;
    }

    /// Append a payload segment to a frame under construction.
    pub fn extend_payload(&mut self, data: impl Into<Bytes>) {
        self.raw.push(data.into());
    }

    /// Turn the collected payload into a single final frame.
    ///
    /// Client-role instances mask the frame with a fresh random key.
    pub fn into_frame(self, opcode: OpCode) -> Frame {
        let mut header = FrameHeader { opcode, ..FrameHeader::default() };
        if self.role == Role::Client {
            header.set_random_mask();
        }
        Frame::from_payload(header, concat(&self.raw))
    }

    /// Consume buffered bytes until a frame changes the state or input runs out.
    fn poll(&mut self) -> Result<DataState> {
        loop {
            let (header, length) = match self.current.take() {
                Some(current) => current,
                None => match self.read_header()? {
                    Some(current) => current,
                    None => return Ok(DataState::Continuing),
                },
            };

            let wanted = usize::try_from(length - self.received).unwrap_or(usize::MAX);
            let available = self.pending.len().min(wanted);
            if available > 0 {
                let mut piece = self.pending.split_to(available);
                if let Some(mask) = header.mask {
                    apply_mask_offset(&mut piece, mask, (self.received % 4) as usize);
                }
                self.received += available as u64;
                if header.opcode.is_control() {
                    self.segments.push(piece.freeze());
                } else if let Some(ref mut message) = self.incomplete {
                    message.extend(&piece, self.config.max_message_size)?;
                }
            }

            if self.received < length {
                self.current = Some((header, length));
                return Ok(DataState::Continuing);
            }

            self.received = 0;
            if let Some(state) = self.finish_frame(&header)? {
                return Ok(state);
            }
        }
    }

    /// Decode the next header from the buffered bytes, if it is all there.
    fn read_header(&mut self) -> Result<Option<(FrameHeader, u64)>> {
        let mut cursor = Cursor::new(&self.pending[..]);
        let Some((header, length)) = FrameHeader::parse(&mut cursor)? else {
            return Ok(None);
        };
        let consumed = cursor.position() as usize;
        self.pending.advance(consumed);

        trace!("Received frame header {:?} with payload length {}", header, length);
        self.check_header(&header, length)?;
        Ok(Some((header, length)))
    }

    /// Validate a header against the role, the limits and the fragmentation state.
    fn check_header(&mut self, header: &FrameHeader, length: u64) -> Result<()> {
        match self.role {
            Role::Server => {
                // The server MUST close the connection upon receiving a
                // frame that is not masked. (RFC 6455)
                if header.mask.is_none() && !self.config.accept_unmasked_frames {
                    return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
                }
            }
            Role::Client => {
                // A client MUST close a connection if it detects a masked frame. (RFC 6455)
                if header.mask.is_some() {
                    return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
                }
            }
        }

        let size = usize::try_from(length).unwrap_or(usize::MAX);
        if let Some(max_size) = self.config.max_frame_size {
            if size > max_size {
                return Err(Error::Capacity(CapacityError::MessageTooLong { size, max_size }));
            }
        }

        match header.opcode {
            OpCode::Control(_) => Ok(()),
            OpCode::Data(Data::Continue) => match self.incomplete {
                Some(ref message) => self.check_message_size(message.len(), size),
                None => Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame)),
            },
            OpCode::Data(data) if self.incomplete.is_some() => {
                Err(Error::Protocol(ProtocolError::ExpectedFragment(data)))
            }
            OpCode::Data(Data::Text) => self.start_message(IncompleteMessageType::Text, size),
            OpCode::Data(Data::Binary) => self.start_message(IncompleteMessageType::Binary, size),
            OpCode::Data(Data::Reserved(i)) => Err(Error::Protocol(ProtocolError::InvalidOpcode(i))),
        }
    }

    fn start_message(&mut self, message_type: IncompleteMessageType, size: usize) -> Result<()> {
        self.check_message_size(0, size)?;
        self.incomplete = Some(IncompleteMessage::new(message_type));
        Ok(())
    }

    fn check_message_size(&self, buffered: usize, size: usize) -> Result<()> {
        match self.config.max_message_size {
            Some(max_size) if size > max_size.saturating_sub(buffered) => {
                Err(Error::Capacity(CapacityError::MessageTooLong {
                    size: buffered.saturating_add(size),
                    max_size,
                }))
            }
            _ => Ok(()),
        }
    }

    /// React to a fully received frame. `None` means the frame was a non-final fragment.
    fn finish_frame(&mut self, header: &FrameHeader) -> Result<Option<DataState>> {
        match header.opcode {
            OpCode::Control(ctl) => {
                let segments = mem::take(&mut self.segments);
                match ctl {
                    Control::Close => {
                        self.close = parse_close_payload(&concat(&segments))?;
                        debug!("Received close frame: {:?}", self.close);
                        self.raw = segments;
                        // Nothing after a close frame is processed.
                        self.pending.clear();
                        self.incomplete = None;
                        Ok(Some(DataState::Closed))
                    }
                    Control::Ping => {
                        self.raw = segments;
                        Ok(Some(DataState::Ping))
                    }
                    Control::Pong => {
                        self.raw = segments;
                        Ok(Some(DataState::Pong))
                    }
                    Control::Reserved(i) => Err(Error::Protocol(ProtocolError::InvalidOpcode(i))),
                }
            }
            OpCode::Data(_) if header.is_final => {
                let message = self
                    .incomplete
                    .take()
                    .ok_or(Error::Protocol(ProtocolError::UnexpectedContinueFrame))?;
                self.message = Some(message.complete()?);
                Ok(Some(DataState::Complete))
            }
            OpCode::Data(_) => Ok(None),
        }
    }

    /// Forget everything buffered, so a broken message cannot leak into a later one.
    fn discard(&mut self) {
        self.pending.clear();
        self.current = None;
        self.received = 0;
        self.segments.clear();
        self.incomplete = None;
        self.message = None;
        self.raw.clear();
    }

    fn fail(&mut self, err: Error) {
        warn!("Malformed input, closing: {}", err);
        self.discard();
        self.close = None;
        self.error = Some(err);
    }
}

fn concat(segments: &[Bytes]) -> Bytes {
    match segments {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let mut buf = BytesMut::with_capacity(many.iter().map(Bytes::len).sum());
            for segment in many {
                buf.extend_from_slice(segment);
            }
            buf.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::coding::CloseCode;

    fn server() -> DataFrame {
        DataFrame::new(Role::Server, WebSocketConfig::default())
    }

    /// Encode a masked frame the way a client would send it.
    fn client_frame(opcode: OpCode, payload: &[u8], is_final: bool) -> Vec<u8> {
        let mut builder = DataFrame::new(Role::Client, WebSocketConfig::default());
        builder.extend_payload(payload.to_vec());
        let mut frame = builder.into_frame(opcode);
        frame.header_mut().is_final = is_final;
        frame.encode().unwrap()
    }

    #[test]
    fn single_unmasked_text_frame() {
        let mut df =
            DataFrame::new(Role::Server, WebSocketConfig::default().accept_unmasked_frames(true));
        assert_eq!(df.append(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::text("Hello")));
        df.reset();
        assert_eq!(df.state(), DataState::Continuing);
    }

    #[test]
    fn masked_frame_rfc_example() {
        // A single-frame masked text message containing "Hello" (RFC 6455, 5.7).
        let mut df = server();
        let state = df.append(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        assert_eq!(state, DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::text("Hello")));
    }

    #[test]
    fn unmasked_frame_from_client_is_rejected() {
        let mut df = server();
        assert_eq!(df.append(b"\x81\x05Hello"), DataState::Closed);
        assert!(matches!(
            df.error(),
            Some(Error::Protocol(ProtocolError::UnmaskedFrameFromClient))
        ));
        assert_eq!(df.take_message(), None);
    }

    #[test]
    fn byte_by_byte() {
        let bytes = client_frame(OpCode::Data(Data::Binary), &[1, 2, 3, 4, 5, 6, 7], true);
        let mut df = server();
        let (last, head) = bytes.split_last().unwrap();
        for byte in head {
            assert_eq!(df.append(&[*byte]), DataState::Continuing);
        }
        assert_eq!(df.append(&[*last]), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::binary(vec![1, 2, 3, 4, 5, 6, 7])));
        assert_eq!(df.pending_len(), 0);
    }

    #[test]
    fn fragmented_message() {
        let mut input = client_frame(OpCode::Data(Data::Text), b"Hello, ", false);
        input.extend(client_frame(OpCode::Data(Data::Continue), b"Wor", false));
        input.extend(client_frame(OpCode::Data(Data::Continue), b"ld!", true));

        let mut df = server();
        assert_eq!(df.append(&input), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::text("Hello, World!")));
        df.reset();
        assert_eq!(df.resume(), DataState::Continuing);
    }

    #[test]
    fn ping_between_fragments() {
        let mut input = client_frame(OpCode::Data(Data::Binary), &[1, 2], false);
        input.extend(client_frame(OpCode::Control(Control::Ping), b"are you there", true));
        input.extend(client_frame(OpCode::Data(Data::Continue), &[3], true));

        let mut df = server();
        assert_eq!(df.append(&input), DataState::Ping);
        assert_eq!(concat(df.as_raw()), Bytes::from_static(b"are you there"));
        df.reset();
        assert_eq!(df.resume(), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::binary(vec![1, 2, 3])));
    }

    #[test]
    fn pong_is_reported() {
        let mut df = server();
        assert_eq!(df.append(&client_frame(OpCode::Control(Control::Pong), b"x", true)), DataState::Pong);
        df.reset();
        assert_eq!(df.state(), DataState::Continuing);
    }

    #[test]
    fn close_frame_stops_processing() {
        let close = CloseFrame { code: CloseCode::Normal, reason: "done".into() };
        let mut input = client_frame(OpCode::Control(Control::Close), &close.to_payload(), true);
        input.extend(client_frame(OpCode::Data(Data::Text), b"ignored", true));

        let mut df = server();
        assert_eq!(df.append(&input), DataState::Closed);
        assert_eq!(df.close_frame(), Some(&close));
        assert!(df.error().is_none());
        assert_eq!(df.pending_len(), 0);
        df.reset();
        assert_eq!(df.append(&[0x81]), DataState::Closed);
    }

    #[test]
    fn unexpected_continuation() {
        let mut df = server();
        assert_eq!(df.append(&client_frame(OpCode::Data(Data::Continue), b"x", true)), DataState::Closed);
        assert!(matches!(
            df.error(),
            Some(Error::Protocol(ProtocolError::UnexpectedContinueFrame))
        ));
    }

    #[test]
    fn new_message_while_fragmented() {
        let mut input = client_frame(OpCode::Data(Data::Text), b"a", false);
        input.extend(client_frame(OpCode::Data(Data::Binary), b"b", true));
        let mut df = server();
        assert_eq!(df.append(&input), DataState::Closed);
        assert!(matches!(
            df.error(),
            Some(Error::Protocol(ProtocolError::ExpectedFragment(Data::Binary)))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_payload() {
        let config = WebSocketConfig::default().max_frame_size(Some(16));
        let mut df = DataFrame::new(Role::Server, config);
        // Claims 2^40 bytes; only the header is supplied.
        let header = [0x82, 0xff, 0, 0, 0x01, 0, 0, 0, 0, 0, 1, 2, 3, 4];
        assert_eq!(df.append(&header), DataState::Closed);
        assert!(matches!(
            df.error(),
            Some(Error::Capacity(CapacityError::MessageTooLong { max_size: 16, .. }))
        ));
        assert_eq!(df.pending_len(), 0);
    }

    #[test]
    fn oversized_fragmented_message() {
        let config = WebSocketConfig::default().max_message_size(Some(4));
        let mut input = client_frame(OpCode::Data(Data::Binary), &[1, 2, 3], false);
        input.extend(client_frame(OpCode::Data(Data::Continue), &[4, 5], true));
        let mut df = DataFrame::new(Role::Server, config);
        assert_eq!(df.append(&input), DataState::Closed);
        assert!(matches!(df.error(), Some(Error::Capacity(_))));
    }

    #[test]
    fn invalid_utf8_text() {
        let mut df = server();
        assert_eq!(df.append(&client_frame(OpCode::Data(Data::Text), &[0xc3, 0x28], true)), DataState::Closed);
        assert!(matches!(df.error(), Some(Error::Utf8)));
    }

    #[test]
    fn malformed_input_discards_partial_message() {
        let mut input = client_frame(OpCode::Data(Data::Text), b"secret", false);
        input.extend([0xf1, 0x80]);
        let mut df = server();
        assert_eq!(df.append(&input), DataState::Closed);
        assert!(df.incomplete.is_none());
        assert!(df.take_message().is_none());
        assert!(df.as_raw().is_empty());
    }

    #[test]
    fn unconsumed_event_holds_further_input() {
        let mut df = server();
        let first = client_frame(OpCode::Data(Data::Text), b"one", true);
        let second = client_frame(OpCode::Data(Data::Text), b"two", true);
        assert_eq!(df.append(&first), DataState::Complete);
        assert_eq!(df.append(&second), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::text("one")));
        df.reset();
        assert_eq!(df.resume(), DataState::Complete);
        assert_eq!(df.take_message(), Some(Message::text("two")));
    }

    #[test]
    fn builder_masks_by_role() {
        let server = server();
        let mut pong = server.create_instance();
        pong.extend_payload(Bytes::from_static(b"ab"));
        pong.extend_payload(Bytes::from_static(b"cd"));
        let frame = pong.into_frame(OpCode::Control(Control::Pong));
        assert_eq!(frame.encode().unwrap(), b"\x8a\x04abcd");

        let client = DataFrame::new(Role::Client, WebSocketConfig::default());
        let frame = client.create_instance().into_frame(OpCode::Data(Data::Text));
        assert!(frame.is_masked());
    }
}
