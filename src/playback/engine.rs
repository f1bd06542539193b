//! The player: one playback session and the controller loop driving it.
//!
//! `Player::open` opens the source, starts a decode worker per selected
//! stream, the audio device and the read loop. `Player::run` then owns the
//! calling thread: it ticks the refresh scheduler and applies
//! [`PlayerCommand`]s received over a crossbeam channel until the session
//! ends. Dropping the player aborts every queue and joins every thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::scheduler::{Scheduler, REFRESH_RATE};
use super::state::{PlaybackStatus, PlayerEvent, QuitReason, SeekTarget, SessionState, MAX_VOLUME};
use crate::audio::{AudioError, AudioOutput, AudioOutputFactory, AudioRenderer, AudioSpec, ResamplerFactory};
use crate::config::{Framedrop, SessionConfig, ShowMode, SyncMaster};
use crate::core::time::{format_hms, from_seconds, to_seconds};
use crate::core::{MediaKind, Seconds};
use crate::decode::{workers, CodecError, Decoder, StreamInfo};
use crate::demux::{Chapter, DemuxError, Interrupt, MediaBackend, ReadLoop, SeekSpec};
use crate::render::VideoSink;

/// Bytes per second assumed for relative byte seeks when the bit rate is
/// unknown.
const DEFAULT_BYTE_RATE: f64 = 180_000.0;

/// Commands applied by the controller loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    TogglePause,
    StepFrame,
    ToggleMute,
    /// Volume up (`+1`) or down (`-1`) by the configured decibel step.
    Volume(i32),
    /// Absolute seek, seconds.
    Seek(Seconds),
    /// Seek by this many seconds from the current position.
    SeekRelative(Seconds),
    /// Seek to a fraction of the duration (or of the byte size).
    SeekFraction(f64),
    /// Previous (`-1`) or next (`+1`) chapter.
    SeekChapter(i32),
    CycleStream(MediaKind),
    ToggleShowMode,
    SetFramedrop(Framedrop),
    SetSyncMaster(SyncMaster),
    SetLoopCount(i32),
    Quit,
}

/// Error type for opening a session
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("{0}: no audio or video stream could be opened")]
    NoStreams(String),
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// New volume after a step of `step_db` decibels in the direction of `sign`.
/// Moves by at least one unit and stays within `0..=MAX_VOLUME`.
pub fn adjusted_volume(volume: i32, sign: i32, step_db: f64) -> i32 {
    let max = MAX_VOLUME as f64;
    let level = if volume > 0 {
        20.0 * (volume as f64 / max).log10()
    } else {
        -1000.0
    };
    let stepped = (max * 10f64.powf((level + sign as f64 * step_db) / 20.0)).round() as i32;
    let next = if stepped == volume { volume + sign } else { stepped };
    next.clamp(0, MAX_VOLUME)
}

/// Start of the chapter `incr` chapters away from the one containing `pos`
/// (microseconds), clamped at the first chapter. `None` past the last one.
/// A position at or after the last chapter start counts as one past the
/// end, so stepping back lands on the start of the last chapter.
pub fn chapter_target(chapters: &[Chapter], pos: i64, incr: i32) -> Option<i64> {
    if chapters.is_empty() {
        return None;
    }
    let current = chapters
        .iter()
        .position(|chapter| pos < chapter.start_micros())
        .map_or(chapters.len() as i64, |next| next as i64 - 1);
    let index = (current + incr as i64).max(0) as usize;
    chapters.get(index).map(Chapter::start_micros)
}

/// The stream after `start` of the same `kind`, wrapping around. Audio
/// candidates need usable parameters. `Some(None)` switches subtitles off;
/// `None` means there is nothing to switch to.
pub fn next_stream(streams: &[StreamInfo], kind: MediaKind, start: Option<usize>) -> Option<Option<usize>> {
    let count = streams.len();
    let mut index = start;
    loop {
        let candidate = index.map_or(0, |i| i + 1);
        let candidate = if candidate >= count {
            if kind == MediaKind::Subtitle {
                return Some(None);
            }
            if start.is_none() {
                return None;
            }
            0
        } else {
            candidate
        };
        if Some(candidate) == start {
            return None;
        }
        index = Some(candidate);
        let stream = &streams[candidate];
        if stream.kind != kind {
            continue;
        }
        if kind != MediaKind::Audio || stream.has_usable_audio_params() {
            return Some(Some(candidate));
        }
    }
}

/// The show mode after `current` among those the open streams support.
pub fn next_show_mode(current: ShowMode, has_video: bool, has_audio: bool) -> ShowMode {
    const CYCLE: [ShowMode; 2] = [ShowMode::Video, ShowMode::Waves];
    let start = CYCLE.iter().position(|&mode| mode == current);
    let available = |mode: ShowMode| match mode {
        ShowMode::Video => has_video,
        _ => has_audio,
    };
    (1..=CYCLE.len())
        .map(|offset| CYCLE[(start.unwrap_or(CYCLE.len() - 1) + offset) % CYCLE.len()])
        .find(|&mode| available(mode))
        .unwrap_or(current)
}

pub struct Player {
    state: Arc<SessionState>,
    backend: Arc<dyn MediaBackend>,
    sink: Box<dyn VideoSink>,
    audio_factory: Box<dyn AudioOutputFactory>,
    scheduler: Scheduler,
    events: Receiver<PlayerEvent>,
    interrupt: Interrupt,
    read_thread: Option<thread::JoinHandle<()>>,
    decoder_threads: [Option<thread::JoinHandle<()>>; 3],
    audio_output: Option<Box<dyn AudioOutput>>,
    /// Most recently opened stream per kind, the starting point for cycling.
    last_streams: [Option<usize>; 3],
}

impl Player {
    /// Open `config.input` and start playback.
    pub fn open(
        config: SessionConfig,
        backend: Arc<dyn MediaBackend>,
        sink: Box<dyn VideoSink>,
        audio_factory: Box<dyn AudioOutputFactory>,
    ) -> Result<Self, PlayerError> {
        let interrupt = Interrupt::new();
        let mut source = backend.open_source(&config.input, &config.codec, interrupt.clone())?;
        let info = source.info().clone();

        if let Some(start) = config.start_time {
            let target = from_seconds(start) + info.start_time.unwrap_or(0);
            if let Err(err) = source.seek(SeekSpec::new(target, 0, false)) {
                tracing::warn!(uri = %info.uri, start, error = %err, "could not seek to start position");
            }
        }

        let mut wanted = [None; 3];
        for kind in MediaKind::PLAYABLE {
            if config.is_disabled(kind) {
                continue;
            }
            let related = match kind {
                MediaKind::Audio => wanted[0],
                MediaKind::Subtitle => wanted[1].or(wanted[0]),
                _ => None,
            };
            if let Some(slot) = kind.slot() {
                wanted[slot] = source.best_stream(kind, config.wanted_stream(kind), related);
            }
        }

        let (events_tx, events): (Sender<PlayerEvent>, Receiver<PlayerEvent>) = channel::unbounded();
        let state = Arc::new(SessionState::new(config, info, events_tx));
        let mut player = Self {
            state,
            backend,
            sink,
            audio_factory,
            scheduler: Scheduler::new(),
            events,
            interrupt,
            read_thread: None,
            decoder_threads: [None, None, None],
            audio_output: None,
            last_streams: [None; 3],
        };

        // audio first, so the waveform fallback knows whether it has samples
        let [video, audio, subtitle] = wanted;
        for index in [audio, video, subtitle].into_iter().flatten() {
            if let Err(err) = player.open_component(index) {
                tracing::warn!(stream = index, error = %err, "could not open stream");
            }
        }

        let state = &player.state;
        let has_video = state.has_stream(MediaKind::Video);
        if !has_video && !state.has_stream(MediaKind::Audio) {
            return Err(PlayerError::NoStreams(state.source.uri.clone()));
        }
        if state.config.show_mode.is_none() {
            state.set_show_mode(if has_video { ShowMode::Video } else { ShowMode::Waves });
        }

        let read_loop = ReadLoop::new(Arc::clone(&player.state), source);
        let handle = read_loop
            .spawn()
            .map_err(|source| PlayerError::Thread { name: "read", source })?;
        player.read_thread = Some(handle);

        tracing::info!(
            uri = %player.state.source.uri,
            format = %player.state.source.format_name,
            duration = ?player.state.source.duration_seconds(),
            video = ?player.state.stream_index(MediaKind::Video),
            audio = ?player.state.stream_index(MediaKind::Audio),
            subtitle = ?player.state.stream_index(MediaKind::Subtitle),
            "session opened"
        );
        Ok(player)
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status()
    }

    /// Drive the session until it ends: tick the scheduler, sleep for the
    /// time it returns unless a command or event arrives first.
    pub fn run(&mut self, commands: Receiver<PlayerCommand>) -> QuitReason {
        let events = self.events.clone();
        let mut commands = commands;
        loop {
            let remaining = self.scheduler.tick(&self.state, self.sink.as_mut());
            let timeout = Duration::from_secs_f64(remaining.clamp(0.0, REFRESH_RATE));
            let mut disconnected = false;
            channel::select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if let Some(reason) = self.process_command(command) {
                            return reason;
                        }
                    }
                    Err(_) => disconnected = true,
                },
                recv(events) -> event => match event {
                    Ok(PlayerEvent::Quit(reason)) => return reason,
                    Err(_) => return QuitReason::Requested,
                },
                default(timeout) => {}
            }
            if disconnected {
                // nobody can send commands anymore; play until the end
                commands = channel::never();
            }
        }
    }

    /// Apply one command. Returns the quit reason when the command ends the
    /// session.
    pub fn process_command(&mut self, command: PlayerCommand) -> Option<QuitReason> {
        tracing::debug!(?command, "command");
        match command {
            PlayerCommand::TogglePause => self.toggle_pause(),
            PlayerCommand::StepFrame => self.step_to_next_frame(),
            PlayerCommand::ToggleMute => self.toggle_mute(),
            PlayerCommand::Volume(sign) => self.update_volume(sign, self.state.config.volume_step_db),
            PlayerCommand::Seek(pos) => self.seek(from_seconds(pos), 0, false),
            PlayerCommand::SeekRelative(incr) => self.seek_relative(incr),
            PlayerCommand::SeekFraction(fraction) => self.seek_to_fraction(fraction),
            PlayerCommand::SeekChapter(incr) => self.seek_chapter(incr),
            PlayerCommand::CycleStream(kind) => self.cycle_stream(kind),
            PlayerCommand::ToggleShowMode => self.toggle_show_mode(),
            PlayerCommand::SetFramedrop(framedrop) => self.state.set_framedrop(framedrop),
            PlayerCommand::SetSyncMaster(master) => self.state.set_configured_master(master),
            PlayerCommand::SetLoopCount(count) => self.state.set_loop_count(count),
            PlayerCommand::Quit => return Some(QuitReason::Requested),
        }
        None
    }

    pub fn toggle_pause(&mut self) {
        self.scheduler.toggle_pause(&self.state);
        self.state.set_stepping(false);
    }

    pub fn step_to_next_frame(&mut self) {
        self.scheduler.step_to_next_frame(&self.state);
    }

    pub fn toggle_mute(&mut self) {
        self.state.set_muted(!self.state.is_muted());
    }

    pub fn update_volume(&mut self, sign: i32, step_db: f64) {
        let volume = adjusted_volume(self.state.volume(), sign, step_db);
        self.state.set_volume(volume);
        tracing::debug!(volume, "volume changed");
    }

    /// Request a seek to `pos` (microseconds, or bytes with `by_bytes`).
    /// Ignored while another seek is pending.
    pub fn seek(&mut self, pos: i64, rel: i64, by_bytes: bool) {
        if self.state.seek.request(SeekTarget { pos, rel, by_bytes }) {
            self.state.wakeup.notify_command();
        }
    }

    pub fn seek_relative(&mut self, incr: Seconds) {
        let state = &self.state;
        if state.seek_by_bytes() {
            let mut pos = None;
            if state.has_stream(MediaKind::Video) {
                pos = state.pictq.last_pos();
            }
            if pos.is_none() && state.has_stream(MediaKind::Audio) {
                pos = state.sampq.last_pos();
            }
            let pos = pos.or_else(|| state.read_position()).unwrap_or(0);
            let byte_rate = if state.source.bit_rate > 0 {
                state.source.bit_rate as f64 / 8.0
            } else {
                DEFAULT_BYTE_RATE
            };
            let incr = (incr * byte_rate) as i64;
            self.seek(pos + incr, incr, true);
        } else {
            let mut pos = state.master_clock();
            if pos.is_nan() {
                pos = to_seconds(state.seek.last_pos());
            }
            pos += incr;
            if let Some(start) = state.source.start_time {
                pos = pos.max(to_seconds(start));
            }
            self.seek(from_seconds(pos), from_seconds(incr), false);
        }
    }

    /// Seek to `fraction` (0..=1) of the input.
    pub fn seek_to_fraction(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let source = &self.state.source;
        let duration = source.duration.filter(|&duration| duration > 0);
        match (duration, source.byte_size) {
            (Some(duration), _) if !self.state.seek_by_bytes() => {
                let total = to_seconds(duration);
                tracing::info!(
                    percent = (fraction * 100.0).round(),
                    target = %format_hms(fraction * total),
                    total = %format_hms(total),
                    "seek to fraction of total duration"
                );
                let target = (fraction * duration as f64) as i64 + source.start_time.unwrap_or(0);
                self.seek(target, 0, false);
            }
            (_, Some(size)) => self.seek((size as f64 * fraction) as i64, 0, true),
            _ => tracing::debug!("input has neither duration nor size; fraction seek ignored"),
        }
    }

    pub fn seek_chapter(&mut self, incr: i32) {
        let master = self.state.master_clock();
        let pos = if master.is_nan() { i64::MIN } else { from_seconds(master) };
        if let Some(target) = chapter_target(&self.state.source.chapters, pos, incr) {
            tracing::debug!(target, incr, "seeking to chapter");
            self.seek(target, 0, false);
        }
    }

    /// Switch to the next stream of `kind`.
    pub fn cycle_stream(&mut self, kind: MediaKind) {
        let Some(slot) = kind.slot() else {
            return;
        };
        let Some(next) = next_stream(&self.state.source.streams, kind, self.last_streams[slot]) else {
            return;
        };
        if kind == MediaKind::Subtitle && next.is_none() {
            self.last_streams[slot] = None;
        }
        tracing::debug!(%kind, from = ?self.state.stream_index(kind), to = ?next, "switching stream");
        self.close_component(kind);
        if let Some(index) = next {
            if let Err(err) = self.open_component(index) {
                tracing::warn!(stream = index, error = %err, "could not open stream");
            }
        }
    }

    pub fn toggle_show_mode(&mut self) {
        let state = &self.state;
        let current = state.show_mode();
        let next = next_show_mode(
            current,
            state.has_stream(MediaKind::Video),
            state.has_stream(MediaKind::Audio),
        );
        if next != current {
            state.set_show_mode(next);
            if let Err(err) = self.sink.clear() {
                tracing::warn!(error = %err, "could not clear output");
            }
            self.scheduler.request_refresh();
        }
    }

    fn open_component(&mut self, index: usize) -> Result<(), PlayerError> {
        let state = Arc::clone(&self.state);
        let Some(stream) = state.source.streams.get(index).cloned() else {
            return Ok(());
        };
        let kind = stream.kind;
        let (Some(slot_index), Some(queue), Some(slot)) =
            (kind.slot(), state.packet_queue(kind), state.stream(kind))
        else {
            return Ok(());
        };
        let codec = self.backend.open_codec(&stream, &state.config.codec)?;

        if kind == MediaKind::Audio {
            self.open_audio_output(&stream)?;
        }
        self.last_streams[slot_index] = Some(index);

        queue.start();
        slot.set_index(Some(index));
        let mut decoder = Decoder::new(
            codec,
            Arc::clone(queue),
            Arc::clone(&state.wakeup),
            Arc::clone(&slot.status),
            stream.time_base,
        )
        .with_reorder_pts(state.config.reorder_pts);
        if kind == MediaKind::Audio && state.source.no_timestamp_search {
            decoder = decoder.with_start_pts(stream.start_time, stream.time_base);
        }
        if kind == MediaKind::Video {
            state.request_attachments();
        }

        let handle = workers::spawn(Arc::clone(&state), decoder, stream).map_err(|source| {
            PlayerError::Thread {
                name: "decoder",
                source,
            }
        })?;
        self.decoder_threads[slot_index] = Some(handle);
        tracing::debug!(%kind, stream = index, "stream opened");
        Ok(())
    }

    fn open_audio_output(&mut self, stream: &StreamInfo) -> Result<(), PlayerError> {
        let Some(params) = stream.audio.as_ref() else {
            return Err(AudioError::UnsupportedFormat(format!("stream {} has no audio parameters", stream.index)).into());
        };
        let backend = Arc::clone(&self.backend);
        let make_resampler: ResamplerFactory = Box::new(move |source, target| backend.open_resampler(source, target));
        let renderer = Arc::new(Mutex::new(AudioRenderer::new(Arc::clone(&self.state), make_resampler)));
        let wanted = AudioSpec {
            sample_rate: params.sample_rate,
            channels: params.channels,
            buffering: self.state.config.audio_buffer,
        };
        let output = self.audio_factory.open(wanted, renderer)?;
        self.scheduler.set_audio_channels(output.params().channels);
        self.audio_output = Some(output);
        Ok(())
    }

    fn close_component(&mut self, kind: MediaKind) {
        let state = &self.state;
        let (Some(slot_index), Some(queue), Some(slot)) = (kind.slot(), state.packet_queue(kind), state.stream(kind))
        else {
            return;
        };
        let Some(index) = slot.index() else {
            return;
        };

        queue.abort();
        match kind {
            MediaKind::Video => state.pictq.signal(),
            MediaKind::Audio => state.sampq.signal(),
            _ => state.subpq.signal(),
        }
        if kind == MediaKind::Audio {
            // closing the device waits for a running callback to return
            self.audio_output = None;
            state.samples.lock().clear();
        }
        if let Some(handle) = self.decoder_threads[slot_index].take() {
            if handle.join().is_err() {
                tracing::error!(%kind, "decoder thread panicked");
            }
        }
        queue.flush();
        slot.set_index(None);
        tracing::debug!(%kind, stream = index, "stream closed");
    }

    fn shutdown(&mut self) {
        self.state.request_abort();
        self.interrupt.trigger();
        if let Some(handle) = self.read_thread.take() {
            if handle.join().is_err() {
                tracing::error!("read thread panicked");
            }
        }
        for kind in [MediaKind::Audio, MediaKind::Video, MediaKind::Subtitle] {
            self.close_component(kind);
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
        let (early, late) = self.state.frame_drops();
        tracing::info!(uri = %self.state.source.uri, early_drops = early, late_drops = late, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rational;
    use crate::decode::AudioStreamInfo;
    use crate::audio::SampleFormat;

    fn audio_stream(index: usize, sample_rate: u32) -> StreamInfo {
        let mut stream = StreamInfo::new(index, MediaKind::Audio, Rational::new(1, 48_000));
        stream.audio = Some(AudioStreamInfo {
            sample_rate,
            channels: 2,
            sample_format: SampleFormat::F32,
        });
        stream
    }

    fn streams() -> Vec<StreamInfo> {
        vec![
            StreamInfo::new(0, MediaKind::Video, Rational::new(1, 25)),
            audio_stream(1, 48_000),
            StreamInfo::new(2, MediaKind::Subtitle, Rational::MICROS),
            audio_stream(3, 0),
            audio_stream(4, 44_100),
            StreamInfo::new(5, MediaKind::Subtitle, Rational::MICROS),
        ]
    }

    #[test]
    fn test_volume_steps_in_decibels() {
        let down = adjusted_volume(MAX_VOLUME, -1, 0.75);
        assert_eq!(down, 117);
        assert_eq!(adjusted_volume(down, 1, 0.75), MAX_VOLUME);
        assert_eq!(adjusted_volume(MAX_VOLUME, 1, 0.75), MAX_VOLUME);
    }

    #[test]
    fn test_volume_moves_at_least_one_unit() {
        // at 1 a 0.75 dB step rounds back to 1
        assert_eq!(adjusted_volume(1, 1, 0.75), 2);
        assert_eq!(adjusted_volume(1, -1, 0.75), 0);
        assert_eq!(adjusted_volume(0, 1, 0.75), 1);
        assert_eq!(adjusted_volume(0, -1, 0.75), 0);
    }

    #[test]
    fn test_next_stream_skips_unusable_audio() {
        let streams = streams();
        assert_eq!(next_stream(&streams, MediaKind::Audio, Some(1)), Some(Some(4)));
        assert_eq!(next_stream(&streams, MediaKind::Audio, Some(4)), Some(Some(1)));
    }

    #[test]
    fn test_next_stream_without_alternative() {
        let streams = streams();
        assert_eq!(next_stream(&streams, MediaKind::Video, Some(0)), None);
        // nothing opened yet: the first video stream
        assert_eq!(next_stream(&streams, MediaKind::Video, None), Some(Some(0)));
        assert_eq!(next_stream(&streams[1..], MediaKind::Video, None), None);
    }

    #[test]
    fn test_next_subtitle_cycles_through_off() {
        let streams = streams();
        assert_eq!(next_stream(&streams, MediaKind::Subtitle, None), Some(Some(2)));
        assert_eq!(next_stream(&streams, MediaKind::Subtitle, Some(2)), Some(Some(5)));
        assert_eq!(next_stream(&streams, MediaKind::Subtitle, Some(5)), Some(None));
    }

    #[test]
    fn test_chapter_target() {
        let tb = Rational::new(1, 1000);
        let chapters = [
            Chapter { start: 0, end: 10_000, time_base: tb },
            Chapter { start: 10_000, end: 20_000, time_base: tb },
            Chapter { start: 20_000, end: 30_000, time_base: tb },
        ];
        assert_eq!(chapter_target(&chapters, 12_000_000, 1), Some(20_000_000));
        assert_eq!(chapter_target(&chapters, 12_000_000, -1), Some(0));
        assert_eq!(chapter_target(&chapters, 1_000_000, -1), Some(0));
        assert_eq!(chapter_target(&chapters, 25_000_000, 1), None);
        assert_eq!(chapter_target(&chapters, 25_000_000, -1), Some(20_000_000));
        assert_eq!(chapter_target(&chapters, 25_000_000, -2), Some(10_000_000));
        assert_eq!(chapter_target(&[], 0, 1), None);
    }

    #[test]
    fn test_show_mode_cycles_available_modes() {
        assert_eq!(next_show_mode(ShowMode::Video, true, true), ShowMode::Waves);
        assert_eq!(next_show_mode(ShowMode::Waves, true, true), ShowMode::Video);
        assert_eq!(next_show_mode(ShowMode::Video, true, false), ShowMode::Video);
        assert_eq!(next_show_mode(ShowMode::None, false, true), ShowMode::Waves);
    }
}
