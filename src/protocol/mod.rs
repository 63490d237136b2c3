//! Generic WebSocket message stream.

pub mod data_frame;
pub mod frame;

mod message;

pub use self::{
    data_frame::{DataFrame, DataState},
    frame::CloseFrame,
    message::{IncompleteMessage, IncompleteMessageType, Message},
};

/// Indicates a Client or Server role of the websocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This socket is a server
    Server,
    /// This socket is a client
    Client,
}

/// The configuration for a WebSocket connection.
///
/// # Example
/// ```
/// # use wsframe::protocol::WebSocketConfig;
/// let conf = WebSocketConfig::default()
///     .max_message_size(Some(1024 * 1024))
///     .fragment_size(Some(64 * 1024));
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// The maximum size of an incoming message. `None` means no size limit. The default value is
    /// 64 MiB which should be reasonably big for all normal use-cases but small enough to prevent
    /// memory eating by a malicious user.
    pub max_message_size: Option<usize>,
    /// The maximum size of a single incoming message frame. `None` means no size limit. The limit
    /// is for frame payload NOT including the frame header. The default value is 16 MiB which
    /// should be reasonably big for all normal use-cases but small enough to prevent memory
    /// eating by a malicious user.
    pub max_frame_size: Option<usize>,
    /// The maximum size of the upgrade request header block. A client that has not finished its
    /// request within this many bytes fails the handshake. The default value is 8 KiB.
    pub max_handshake_size: usize,
    /// When set to `true`, the server will accept and handle unmasked frames
    /// from the client. According to the RFC 6455, the server must close the
    /// connection to the client in such cases, however it seems like there are
    /// some popular libraries that are sending unmasked frames, ignoring the RFC.
    /// By default this option is set to `false`, i.e. according to RFC 6455.
    ///
    /// With the default, an unmasked client frame such as
    /// `[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']` is rejected with
    /// `ProtocolError::UnmaskedFrameFromClient`; it only assembles into the text
    /// message `"Hello"` with this flag set.
    pub accept_unmasked_frames: bool,
    /// Outgoing messages with a payload larger than this are split into a
    /// sequence of continuation frames. `None` (the default) always sends a
    /// single frame per message.
    pub fragment_size: Option<usize>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            max_handshake_size: 8 << 10,
            accept_unmasked_frames: false,
            fragment_size: None,
        }
    }
}

impl WebSocketConfig {
    /// Set [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set [`Self::max_handshake_size`].
    pub fn max_handshake_size(mut self, max_handshake_size: usize) -> Self {
        self.max_handshake_size = max_handshake_size;
        self
    }

    /// Set [`Self::accept_unmasked_frames`].
    pub fn accept_unmasked_frames(mut self, accept_unmasked_frames: bool) -> Self {
        self.accept_unmasked_frames = accept_unmasked_frames;
        self
    }

    /// Set [`Self::fragment_size`].
    pub fn fragment_size(mut self, fragment_size: Option<usize>) -> Self {
        self.fragment_size = fragment_size;
        self
    }
}
