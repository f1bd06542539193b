pub mod codec;
pub mod decoder;
pub mod frame;
pub mod stream_info;
pub mod workers;

pub use codec::{Codec, CodecError, Received, SendStatus};
pub use decoder::{DecodeError, DecodeOutcome, Decoder, DecoderStatus};
pub use frame::{AudioSamples, DecodedFrame, PixelFormat, SubtitleFrame, SubtitleRect, VideoPicture};
pub use stream_info::{AudioStreamInfo, CodecParameters, StreamInfo, VideoStreamInfo};
