//! The codec seam: a push/pull decoder supplied by a media backend.

use super::frame::{DecodedFrame, SubtitleFrame};
use crate::core::MediaKind;
use crate::queue::Packet;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("no decoder for codec {0}")]
    NotFound(String),
    #[error("failed to open codec: {0}")]
    Open(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("operation not supported by this codec")]
    Unsupported,
    #[error("codec error: {0}")]
    Backend(String),
}

/// Result of offering a packet to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Output must be drained before the codec accepts more input.
    Again,
}

/// Result of asking the codec for output.
#[derive(Debug, Clone)]
pub enum Received {
    Frame(DecodedFrame),
    /// More input needed.
    Again,
    /// Fully drained after an end-of-stream packet.
    Eof,
}

/// A decoder instance for one stream.
///
/// Video and audio codecs use the send/receive protocol; subtitle codecs
/// decode one packet at a time through [`Codec::decode_subtitle`]. A null
/// packet (empty payload) asks the codec to drain.
pub trait Codec: Send {
    fn kind(&self) -> MediaKind;

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, CodecError>;

    fn receive_frame(&mut self) -> Result<Received, CodecError>;

    /// Decode one subtitle packet. `Ok(None)` means no subtitle was produced.
    fn decode_subtitle(&mut self, _packet: &Packet) -> Result<Option<SubtitleFrame>, CodecError> {
        Err(CodecError::Unsupported)
    }

    /// Drop internal state after a discontinuity.
    fn flush(&mut self);
}
