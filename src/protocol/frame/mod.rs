//! Utilities to work with raw WebSocket frames.
//!
//! Everything here is free of I/O and of per-connection state: header decoding,
//! payload masking and frame serialization.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;

pub use self::{
    frame::{CloseFrame, Frame, FrameHeader, MAX_CONTROL_PAYLOAD},
    mask::{apply_mask, apply_mask_offset, generate_mask},
};

pub(crate) use self::frame::parse_close_payload;
