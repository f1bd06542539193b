//! The demux seam: what the player needs from a container reader, and the
//! backend that opens readers, codecs and resamplers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::buffer::AudioFormat;
use crate::audio::renderer::Resampler;
use crate::config::CodecOptions;
use crate::core::{MediaKind, Rational};
use crate::decode::{Codec, CodecError, StreamInfo};
use crate::queue::Packet;

/// Error type for demux operations
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("failed to open {uri}: {reason}")]
    Open { uri: String, reason: String },
    #[error("end of file")]
    Eof,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("operation not supported by this source")]
    Unsupported,
    #[error("interrupted")]
    Interrupted,
}

/// A chapter mark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chapter {
    pub start: i64,
    pub end: i64,
    pub time_base: Rational,
}

impl Chapter {
    /// Start in microseconds.
    pub fn start_micros(&self) -> i64 {
        crate::core::time::rescale(self.start, self.time_base, Rational::MICROS)
    }
}

/// Static description of an opened source.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub uri: String,
    pub format_name: String,
    pub streams: Vec<StreamInfo>,
    /// Microseconds.
    pub duration: Option<i64>,
    /// Microseconds.
    pub start_time: Option<i64>,
    /// Bits per second, 0 if unknown.
    pub bit_rate: i64,
    pub byte_size: Option<i64>,
    pub chapters: Vec<Chapter>,
    /// Network stream that produces data in real time.
    pub realtime: bool,
    /// Timestamps may jump (MPEG-TS and friends).
    pub ts_discontinuous: bool,
    /// The format cannot seek by timestamp search, so decoders must carry
    /// timestamps themselves after a seek.
    pub no_timestamp_search: bool,
}

impl SourceInfo {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(crate::core::time::to_seconds)
    }
}

/// Seek range and mode for [`DemuxSource::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekSpec {
    pub min: i64,
    pub target: i64,
    pub max: i64,
    pub by_bytes: bool,
}

impl SeekSpec {
    /// Window around `target` that does not cross back over the position
    /// the seek was issued from.
    pub fn new(target: i64, rel: i64, by_bytes: bool) -> Self {
        let min = if rel > 0 { target - rel + 2 } else { i64::MIN };
        let max = if rel < 0 { target - rel - 2 } else { i64::MAX };
        Self { min, target, max, by_bytes }
    }
}

/// Shared flag the source polls to abandon blocking I/O.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A container reader. Owned by the read loop thread.
pub trait DemuxSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Next packet, `Err(DemuxError::Eof)` at end of input.
    fn read_packet(&mut self) -> Result<Packet, DemuxError>;

    fn seek(&mut self, spec: SeekSpec) -> Result<(), DemuxError>;

    /// Pause a network stream. `Err(DemuxError::Unsupported)` for sources
    /// that have no notion of pausing.
    fn read_pause(&mut self) -> Result<(), DemuxError> {
        Err(DemuxError::Unsupported)
    }

    fn read_play(&mut self) -> Result<(), DemuxError> {
        Err(DemuxError::Unsupported)
    }

    /// Current read position in bytes, if the source knows it.
    fn byte_position(&self) -> Option<i64> {
        None
    }

    /// The source must be polled slowly while paused (RTSP, mmsh).
    fn needs_pause_polling(&self) -> bool {
        false
    }

    /// Best stream of `kind`, preferring `wanted` and streams related to
    /// `related`.
    fn best_stream(&self, kind: MediaKind, wanted: Option<usize>, _related: Option<usize>) -> Option<usize> {
        let streams = &self.info().streams;
        if let Some(index) = wanted {
            return streams.get(index).filter(|s| s.kind == kind).map(|s| s.index);
        }
        streams.iter().find(|s| s.kind == kind).map(|s| s.index)
    }
}

/// Factory for sources, codecs and resamplers. Shared with the audio
/// callback, which builds resamplers on format changes.
pub trait MediaBackend: Send + Sync {
    fn open_source(&self, uri: &str, options: &CodecOptions, interrupt: Interrupt)
        -> Result<Box<dyn DemuxSource>, DemuxError>;

    fn open_codec(&self, stream: &StreamInfo, options: &CodecOptions) -> Result<Box<dyn Codec>, CodecError>;

    fn open_resampler(
        &self,
        source: AudioFormat,
        target: AudioFormat,
    ) -> Result<Box<dyn Resampler>, crate::audio::AudioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_window_forward() {
        let spec = SeekSpec::new(20_000_000, 10_000_000, false);
        assert_eq!(spec.min, 10_000_002);
        assert_eq!(spec.max, i64::MAX);
    }

    #[test]
    fn test_seek_window_backward() {
        let spec = SeekSpec::new(5_000_000, -10_000_000, false);
        assert_eq!(spec.min, i64::MIN);
        assert_eq!(spec.max, 14_999_998);
    }

    #[test]
    fn test_seek_window_absolute() {
        let spec = SeekSpec::new(1000, 0, true);
        assert_eq!((spec.min, spec.max), (i64::MIN, i64::MAX));
        assert!(spec.by_bytes);
    }

    #[test]
    fn test_chapter_start_micros() {
        let chapter = Chapter {
            start: 90_000,
            end: 180_000,
            time_base: Rational::new(1, 90_000),
        };
        assert_eq!(chapter.start_micros(), 1_000_000);
    }

    #[test]
    fn test_interrupt_shared() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        clone.trigger();
        assert!(interrupt.is_triggered());
    }
}
