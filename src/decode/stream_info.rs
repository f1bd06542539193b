//! Stream metadata extracted from the container at open time.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::audio::buffer::SampleFormat;
use crate::core::time::ts_to_seconds;
use crate::core::{MediaKind, Rational};
use crate::queue::Packet;

/// Backend-specific codec parameters, carried opaquely so the controller can
/// open a codec for any stream without touching the demuxer.
#[derive(Clone)]
pub struct CodecParameters(Arc<dyn Any + Send + Sync>);

impl CodecParameters {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodecParameters(..)")
    }
}

/// Information about one elementary stream
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec_name: String,
    pub time_base: Rational,
    /// First timestamp, stream time base.
    pub start_time: Option<i64>,
    /// Duration, stream time base.
    pub duration: Option<i64>,
    /// Cover art carried by the container instead of packets.
    pub attached_pic: Option<Packet>,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub params: Option<CodecParameters>,
}

/// Video-specific stream information
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Rational,
    /// Guessed frame rate, if any.
    pub frame_rate: Option<Rational>,
}

/// Audio-specific stream information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamInfo {
    pub fn new(index: usize, kind: MediaKind, time_base: Rational) -> Self {
        Self {
            index,
            kind,
            codec_name: String::new(),
            time_base,
            start_time: None,
            duration: None,
            attached_pic: None,
            video: None,
            audio: None,
            params: None,
        }
    }

    pub fn is_attached_pic(&self) -> bool {
        self.attached_pic.is_some()
    }

    /// Audio streams are only usable with a known rate and layout.
    pub fn has_usable_audio_params(&self) -> bool {
        self.audio
            .map(|audio| audio.sample_rate != 0 && audio.channels != 0)
            .unwrap_or(false)
    }

    pub fn start_seconds(&self) -> Option<f64> {
        self.start_time.map(|ts| ts_to_seconds(ts, self.time_base))
    }

    /// Seconds per frame from the guessed frame rate, 0 if unknown.
    pub fn frame_duration(&self) -> f64 {
        self.video
            .and_then(|video| video.frame_rate)
            .filter(|rate| rate.is_valid())
            .map_or(0.0, |rate| rate.invert().to_f64())
    }
}

/// Pick the sample aspect ratio to display with: the stream's if set,
/// otherwise the frame's, otherwise undefined.
pub fn guess_sample_aspect_ratio(stream_sar: Rational, frame_sar: Rational) -> Rational {
    if stream_sar.is_valid() {
        stream_sar
    } else if frame_sar.is_valid() {
        frame_sar
    } else {
        Rational::UNDEFINED
    }
}
