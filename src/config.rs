//! Session configuration.
//!
//! A `SessionConfig` is built once (by the CLI or an embedding application)
//! and handed to [`Player::open`](crate::playback::Player::open). It is never
//! mutated afterwards; options that can change during playback are copied
//! into the shared session state at open time.

use crate::core::MediaKind;

/// Which clock drives presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMaster {
    #[default]
    Audio,
    Video,
    External,
}

impl SyncMaster {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SyncMaster::Audio => 0,
            SyncMaster::Video => 1,
            SyncMaster::External => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncMaster::Video,
            2 => SyncMaster::External,
            _ => SyncMaster::Audio,
        }
    }
}

/// Frame drop policy for late video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framedrop {
    /// Drop only when video is not the master clock.
    #[default]
    Auto,
    Always,
    Never,
}

impl Framedrop {
    pub(crate) fn as_i8(self) -> i8 {
        match self {
            Framedrop::Auto => -1,
            Framedrop::Never => 0,
            Framedrop::Always => 1,
        }
    }

    pub(crate) fn from_i8(value: i8) -> Self {
        match value {
            0 => Framedrop::Never,
            1 => Framedrop::Always,
            _ => Framedrop::Auto,
        }
    }
}

/// What the refresh loop shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowMode {
    None,
    Video,
    Waves,
}

impl ShowMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ShowMode::None => 0,
            ShowMode::Video => 1,
            ShowMode::Waves => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ShowMode::Video,
            2 => ShowMode::Waves,
            _ => ShowMode::None,
        }
    }
}

/// Buffer-occupancy driven speed control of the external clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExternalClockTuning {
    /// Slow down when a queue holds this many packets or fewer.
    pub min_frames: usize,
    /// Speed up when every queue holds more than this many packets.
    pub max_frames: usize,
    pub speed_min: f64,
    pub speed_max: f64,
    pub speed_step: f64,
}

impl Default for ExternalClockTuning {
    fn default() -> Self {
        Self {
            min_frames: 2,
            max_frames: 10,
            speed_min: 0.900,
            speed_max: 1.010,
            speed_step: 0.001,
        }
    }
}

/// Hints forwarded to the codec backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecOptions {
    /// Allow non standard-compliant decoder speedups.
    pub fast: bool,
    /// Decode at 1/2^lowres resolution where supported.
    pub lowres: u8,
    /// Generate missing presentation timestamps in the demuxer.
    pub genpts: bool,
}

/// Audio device buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBufferConfig {
    /// Smallest device buffer in samples.
    pub min_buffer_samples: u32,
    /// Upper bound on device callbacks per second.
    pub max_callbacks_per_sec: u32,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_samples: 512,
            max_callbacks_per_sec: 30,
        }
    }
}

impl AudioBufferConfig {
    /// Device buffer size in samples for `sample_rate`: the next power of
    /// two above `sample_rate / max_callbacks_per_sec`, at least the minimum.
    pub fn buffer_samples(&self, sample_rate: u32) -> u32 {
        let per_callback = (sample_rate / self.max_callbacks_per_sec.max(1)).max(1);
        let log2 = 31 - per_callback.leading_zeros();
        self.min_buffer_samples.max(2u32 << log2)
    }
}

/// Immutable configuration for one playback session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub input: String,
    /// Explicit stream index per kind, indexed by [`MediaKind::slot`].
    pub wanted_streams: [Option<usize>; 3],
    pub disable_video: bool,
    pub disable_audio: bool,
    pub disable_subtitles: bool,
    /// `None` picks byte seeking for sources with timestamp discontinuities.
    pub seek_by_bytes: Option<bool>,
    /// Step for relative seeks, seconds.
    pub seek_interval: f64,
    /// Start offset, seconds.
    pub start_time: Option<f64>,
    /// Play only this many seconds.
    pub duration: Option<f64>,
    pub sync_master: SyncMaster,
    pub framedrop: Framedrop,
    /// `None` enables the infinite buffer for realtime sources.
    pub infinite_buffer: Option<bool>,
    /// Number of plays; 0 loops forever.
    pub loop_count: i32,
    pub autoexit: bool,
    /// Percent, clamped to 0..=100.
    pub startup_volume: i32,
    /// `None` shows video when present, otherwise the waveform.
    pub show_mode: Option<ShowMode>,
    /// `None` uses the best-effort timestamp, `Some(true)` the frame pts,
    /// `Some(false)` the packet dts.
    pub reorder_pts: Option<bool>,
    /// Backpressure floor: a queue with more packets than this (and over a
    /// second of data) is considered full.
    pub min_frames: usize,
    pub external_clock: ExternalClockTuning,
    pub codec: CodecOptions,
    pub audio_buffer: AudioBufferConfig,
    /// Volume step in decibels for volume up/down commands.
    pub volume_step_db: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            wanted_streams: [None; 3],
            disable_video: false,
            disable_audio: false,
            disable_subtitles: false,
            seek_by_bytes: None,
            seek_interval: 10.0,
            start_time: None,
            duration: None,
            sync_master: SyncMaster::Audio,
            framedrop: Framedrop::Auto,
            infinite_buffer: None,
            loop_count: 1,
            autoexit: false,
            startup_volume: 100,
            show_mode: None,
            reorder_pts: None,
            min_frames: 25,
            external_clock: ExternalClockTuning::default(),
            codec: CodecOptions::default(),
            audio_buffer: AudioBufferConfig::default(),
            volume_step_db: 0.75,
        }
    }
}

impl SessionConfig {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn is_disabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.disable_video,
            MediaKind::Audio => self.disable_audio,
            MediaKind::Subtitle => self.disable_subtitles,
            MediaKind::Data => true,
        }
    }

    pub fn wanted_stream(&self, kind: MediaKind) -> Option<usize> {
        kind.slot().and_then(|slot| self.wanted_streams[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("movie.mkv");
        assert_eq!(config.input, "movie.mkv");
        assert_eq!(config.loop_count, 1);
        assert_eq!(config.min_frames, 25);
        assert_eq!(config.sync_master, SyncMaster::Audio);
        assert_eq!(config.external_clock.max_frames, 10);
        assert!(!config.is_disabled(MediaKind::Video));
        assert!(config.is_disabled(MediaKind::Data));
    }

    #[test]
    fn test_audio_buffer_samples() {
        let buffering = AudioBufferConfig::default();
        // 48000 / 30 = 1600 -> 2 << 10 = 2048
        assert_eq!(buffering.buffer_samples(48_000), 2048);
        // 8000 / 30 = 266 -> 2 << 8 = 512
        assert_eq!(buffering.buffer_samples(8_000), 512);
        // tiny rates stay at the minimum
        assert_eq!(buffering.buffer_samples(1_000), 512);
    }

    #[test]
    fn test_enum_round_trips_through_atomics() {
        for master in [SyncMaster::Audio, SyncMaster::Video, SyncMaster::External] {
            assert_eq!(SyncMaster::from_u8(master.as_u8()), master);
        }
        for drop in [Framedrop::Auto, Framedrop::Always, Framedrop::Never] {
            assert_eq!(Framedrop::from_i8(drop.as_i8()), drop);
        }
        for mode in [ShowMode::None, ShowMode::Video, ShowMode::Waves] {
            assert_eq!(ShowMode::from_u8(mode.as_u8()), mode);
        }
    }
}
