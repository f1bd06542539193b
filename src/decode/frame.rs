//! Decoded frame payloads.
//!
//! Timestamps here are still integers in the codec's packet time base; the
//! decode workers convert them to seconds when queueing frames.

use crate::audio::buffer::{AudioFormat, SampleFormat};
use crate::core::Rational;

/// Pixel layouts the core distinguishes; anything else is carried through
/// as the backend's raw format id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgba,
    Bgra,
    Other(i32),
}

/// One decoded picture.
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample_aspect_ratio: Rational,
    /// Timestamp chosen by the decoder (see `reorder_pts`).
    pub pts: Option<i64>,
    pub frame_pts: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub pos: Option<i64>,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
}

impl VideoPicture {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            sample_aspect_ratio: Rational::UNDEFINED,
            pts: None,
            frame_pts: None,
            best_effort_timestamp: None,
            pkt_dts: None,
            pos: None,
            planes: Vec::new(),
            strides: Vec::new(),
        }
    }
}

/// One decoded chunk of audio.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub format: AudioFormat,
    /// Samples per channel.
    pub nb_samples: usize,
    pub pts: Option<i64>,
    pub pos: Option<i64>,
    /// One plane per channel for planar formats, a single interleaved plane
    /// otherwise.
    pub planes: Vec<Vec<u8>>,
}

impl AudioSamples {
    /// Interleaved f32 samples.
    pub fn from_f32(sample_rate: u32, channels: u16, samples: &[f32]) -> Self {
        let bytes = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Self {
            format: AudioFormat {
                sample_rate,
                channels,
                sample_format: SampleFormat::F32,
            },
            nb_samples: samples.len() / channels.max(1) as usize,
            pts: None,
            pos: None,
            planes: vec![bytes],
        }
    }

    /// Decode the payload as interleaved f32 if it is packed f32.
    pub fn as_interleaved_f32(&self) -> Option<Vec<f32>> {
        if self.format.sample_format != SampleFormat::F32 {
            return None;
        }
        let plane = self.planes.first()?;
        let count = self.nb_samples * self.format.channels as usize;
        Some(
            plane
                .chunks_exact(4)
                .take(count)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }
}

/// A rectangle of a subtitle.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Text or ASS line for text subtitles.
    pub text: Option<String>,
    /// Palettized bitmap for graphics subtitles.
    pub bitmap: Vec<u8>,
}

/// One decoded subtitle event.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleFrame {
    /// Presentation time, microseconds.
    pub pts: Option<i64>,
    /// Display window relative to `pts`, milliseconds.
    pub start_display_time: u32,
    pub end_display_time: u32,
    /// Graphics (bitmap) subtitles are the only ones presented.
    pub graphics: bool,
    pub rects: Vec<SubtitleRect>,
}

/// What a codec hands back.
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Video(VideoPicture),
    Audio(AudioSamples),
    Subtitle(SubtitleFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_samples_f32_round_trip() {
        let samples = [0.5f32, -0.5, 0.25, -0.25];
        let chunk = AudioSamples::from_f32(48_000, 2, &samples);
        assert_eq!(chunk.nb_samples, 2);
        assert_eq!(chunk.as_interleaved_f32(), Some(samples.to_vec()));
    }

    #[test]
    fn test_non_f32_payload_is_not_interleaved_f32() {
        let mut chunk = AudioSamples::from_f32(48_000, 1, &[0.0]);
        chunk.format.sample_format = SampleFormat::S16;
        assert_eq!(chunk.as_interleaved_f32(), None);
    }
}
