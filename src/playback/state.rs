//! State shared between the controller, the read loop, the decode workers
//! and the audio callback.
//!
//! Every piece of cross-thread state lives here behind an atomic, a lock or
//! a queue. Threads hold an `Arc<SessionState>`; only the controller owns
//! thread handles and devices.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use super::clock::Clock;
use super::sync::{effective_master, MAX_FRAME_DURATION, MAX_FRAME_DURATION_DISCONT};
use crate::audio::buffer::SampleArray;
use crate::config::{Framedrop, SessionConfig, ShowMode, SyncMaster};
use crate::core::{MediaKind, Seconds};
use crate::decode::frame::{AudioSamples, SubtitleFrame, VideoPicture};
use crate::decode::DecoderStatus;
use crate::demux::SourceInfo;
use crate::queue::{FrameQueue, PacketQueue, ReadWakeup};

/// Capacity of the picture queue.
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
/// Capacity of the audio sample queue.
pub const SAMPLE_QUEUE_SIZE: usize = 9;
/// Capacity of the subtitle queue.
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;

/// Maximum volume.
pub const MAX_VOLUME: i32 = 128;

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitReason {
    /// End of input with `autoexit`.
    EndOfStream,
    /// The source failed.
    Error(String),
    /// The controller asked to stop.
    Requested,
}

/// Events posted by session threads to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Terminal: the session is over.
    Quit(QuitReason),
}

/// A snapshot of the session for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub master_clock: Seconds,
    /// `A-V` with both streams, else `M-V` or `M-A` against the master.
    pub diff_kind: &'static str,
    pub av_diff: Seconds,
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub audioq_bytes: usize,
    pub videoq_bytes: usize,
    pub subtitleq_bytes: usize,
    pub paused: bool,
    pub eof: bool,
    pub volume: i32,
    pub muted: bool,
    pub show_mode: ShowMode,
}

/// A pending seek. At most one exists at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekTarget {
    /// Microseconds, or bytes when `by_bytes`.
    pub pos: i64,
    /// Signed distance from the position the seek was issued at; limits the
    /// search window.
    pub rel: i64,
    pub by_bytes: bool,
}

#[derive(Debug, Default)]
struct SeekSlot {
    pending: Option<SeekTarget>,
    /// Target of the most recent request, kept after completion.
    last_pos: i64,
}

/// Single-slot seek request protocol: the controller sets, the read loop
/// clears.
#[derive(Debug, Default)]
pub struct SeekRequest {
    slot: Mutex<SeekSlot>,
}

impl SeekRequest {
    /// Record a seek unless one is already pending. Returns whether the
    /// request was accepted.
    pub fn request(&self, target: SeekTarget) -> bool {
        let mut slot = self.slot.lock();
        if slot.pending.is_some() {
            return false;
        }
        slot.pending = Some(target);
        slot.last_pos = target.pos;
        true
    }

    pub fn pending(&self) -> Option<SeekTarget> {
        self.slot.lock().pending
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Called by the read loop once the request was handled (successfully or
    /// not).
    pub fn complete(&self) {
        self.slot.lock().pending = None;
    }

    /// Target of the most recent request.
    pub fn last_pos(&self) -> i64 {
        self.slot.lock().last_pos
    }
}

/// Per-kind stream slot: the open stream index and its decoder progress.
#[derive(Debug)]
pub struct StreamSlot {
    index: AtomicI32,
    pub status: Arc<DecoderStatus>,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            index: AtomicI32::new(-1),
            status: Arc::new(DecoderStatus::new()),
        }
    }

    pub fn index(&self) -> Option<usize> {
        let index = self.index.load(Ordering::Acquire);
        (index >= 0).then_some(index as usize)
    }

    pub fn set_index(&self, index: Option<usize>) {
        self.index.store(index.map_or(-1, |i| i as i32), Ordering::Release);
    }
}

pub struct SessionState {
    pub config: SessionConfig,
    pub source: SourceInfo,

    pub videoq: Arc<PacketQueue>,
    pub audioq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,
    pub pictq: FrameQueue<VideoPicture>,
    pub sampq: FrameQueue<AudioSamples>,
    pub subpq: FrameQueue<SubtitleFrame>,

    pub vidclk: Clock,
    pub audclk: Clock,
    pub extclk: Clock,

    pub wakeup: Arc<ReadWakeup>,
    pub seek: SeekRequest,
    pub samples: Mutex<SampleArray>,

    streams: [StreamSlot; 3],

    abort_request: AtomicBool,
    paused: AtomicBool,
    eof: AtomicBool,
    read_pos: AtomicI64,
    step: AtomicBool,
    step_requested: AtomicBool,
    queue_attachments: AtomicBool,
    read_pause_unsupported: AtomicBool,
    muted: AtomicBool,
    volume: AtomicI32,
    loop_count: AtomicI32,
    sync_master: AtomicU8,
    framedrop: AtomicI8,
    show_mode: AtomicU8,
    infinite_buffer: bool,
    seek_by_bytes: bool,
    max_frame_duration: Seconds,

    frame_drops_early: AtomicU64,
    frame_drops_late: AtomicU64,

    events: Sender<PlayerEvent>,
    quit_posted: AtomicBool,
}

impl SessionState {
    pub fn new(config: SessionConfig, source: SourceInfo, events: Sender<PlayerEvent>) -> Self {
        let videoq = Arc::new(PacketQueue::new());
        let audioq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let volume = (config.startup_volume.clamp(0, 100) * MAX_VOLUME) / 100;
        let seek_by_bytes = config
            .seek_by_bytes
            .unwrap_or(source.ts_discontinuous && source.format_name != "ogg");
        let infinite_buffer = config.infinite_buffer.unwrap_or(source.realtime);
        let max_frame_duration = if source.ts_discontinuous {
            MAX_FRAME_DURATION_DISCONT
        } else {
            MAX_FRAME_DURATION
        };

        Self {
            pictq: FrameQueue::new(Arc::clone(&videoq), VIDEO_PICTURE_QUEUE_SIZE, true),
            sampq: FrameQueue::new(Arc::clone(&audioq), SAMPLE_QUEUE_SIZE, true),
            subpq: FrameQueue::new(Arc::clone(&subtitleq), SUBPICTURE_QUEUE_SIZE, false),
            vidclk: Clock::new(Some(Arc::clone(&videoq))),
            audclk: Clock::new(Some(Arc::clone(&audioq))),
            extclk: Clock::new(None),
            videoq,
            audioq,
            subtitleq,
            wakeup: Arc::new(ReadWakeup::new()),
            seek: SeekRequest::default(),
            samples: Mutex::new(SampleArray::default()),
            streams: [StreamSlot::new(), StreamSlot::new(), StreamSlot::new()],
            abort_request: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            read_pos: AtomicI64::new(-1),
            step: AtomicBool::new(false),
            step_requested: AtomicBool::new(false),
            queue_attachments: AtomicBool::new(false),
            read_pause_unsupported: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            volume: AtomicI32::new(volume),
            loop_count: AtomicI32::new(config.loop_count),
            sync_master: AtomicU8::new(config.sync_master.as_u8()),
            framedrop: AtomicI8::new(config.framedrop.as_i8()),
            show_mode: AtomicU8::new(config.show_mode.unwrap_or(ShowMode::None).as_u8()),
            infinite_buffer,
            seek_by_bytes,
            max_frame_duration,
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            events,
            quit_posted: AtomicBool::new(false),
            config,
            source,
        }
    }

    // Streams

    pub fn stream(&self, kind: MediaKind) -> Option<&StreamSlot> {
        kind.slot().map(|slot| &self.streams[slot])
    }

    pub fn stream_index(&self, kind: MediaKind) -> Option<usize> {
        self.stream(kind).and_then(StreamSlot::index)
    }

    pub fn has_stream(&self, kind: MediaKind) -> bool {
        self.stream_index(kind).is_some()
    }

    pub fn packet_queue(&self, kind: MediaKind) -> Option<&Arc<PacketQueue>> {
        match kind {
            MediaKind::Video => Some(&self.videoq),
            MediaKind::Audio => Some(&self.audioq),
            MediaKind::Subtitle => Some(&self.subtitleq),
            MediaKind::Data => None,
        }
    }

    /// The open video stream carries only a cover picture.
    pub fn video_is_attached_pic(&self) -> bool {
        self.stream_index(MediaKind::Video)
            .and_then(|index| self.source.streams.get(index))
            .is_some_and(|info| info.is_attached_pic())
    }

    // Clocks

    pub fn configured_master(&self) -> SyncMaster {
        SyncMaster::from_u8(self.sync_master.load(Ordering::Acquire))
    }

    pub fn set_configured_master(&self, master: SyncMaster) {
        self.sync_master.store(master.as_u8(), Ordering::Release);
    }

    pub fn master_sync_type(&self) -> SyncMaster {
        effective_master(
            self.configured_master(),
            self.has_stream(MediaKind::Video),
            self.has_stream(MediaKind::Audio),
        )
    }

    pub fn master_clock_ref(&self) -> &Clock {
        match self.master_sync_type() {
            SyncMaster::Video => &self.vidclk,
            SyncMaster::Audio => &self.audclk,
            SyncMaster::External => &self.extclk,
        }
    }

    /// Reading of the current master clock.
    pub fn master_clock(&self) -> Seconds {
        self.master_clock_ref().get()
    }

    // Flags

    pub fn request_abort(&self) {
        self.abort_request.store(true, Ordering::Release);
        self.wakeup.notify_command();
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_request.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        self.wakeup.notify_command();
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::Release);
    }

    /// Byte offset the read loop has reached, if the source reports one.
    pub fn read_position(&self) -> Option<i64> {
        let pos = self.read_pos.load(Ordering::Acquire);
        (pos >= 0).then_some(pos)
    }

    pub fn set_read_position(&self, pos: Option<i64>) {
        self.read_pos.store(pos.unwrap_or(-1), Ordering::Release);
    }

    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub fn set_stepping(&self, step: bool) {
        self.step.store(step, Ordering::Release);
    }

    /// Ask the controller to step one frame (used after a seek while paused).
    pub fn request_step(&self) {
        self.step_requested.store(true, Ordering::Release);
    }

    pub fn take_step_request(&self) -> bool {
        self.step_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_attachments(&self) {
        self.queue_attachments.store(true, Ordering::Release);
    }

    pub fn take_attachments_request(&self) -> bool {
        self.queue_attachments.swap(false, Ordering::AcqRel)
    }

    pub fn set_read_pause_unsupported(&self, unsupported: bool) {
        self.read_pause_unsupported.store(unsupported, Ordering::Release);
    }

    pub fn read_pause_unsupported(&self) -> bool {
        self.read_pause_unsupported.load(Ordering::Acquire)
    }

    // Live options

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: i32) {
        self.volume.store(volume.clamp(0, MAX_VOLUME), Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn loop_count(&self) -> i32 {
        self.loop_count.load(Ordering::Acquire)
    }

    pub fn set_loop_count(&self, count: i32) {
        self.loop_count.store(count, Ordering::Release);
    }

    /// Decide whether playback restarts at end of input, consuming one play.
    /// A count of 1 means "play once"; 0 loops forever.
    pub fn consume_loop(&self) -> bool {
        let count = self.loop_count();
        if count == 1 {
            return false;
        }
        if count == 0 {
            return true;
        }
        let remaining = count - 1;
        self.set_loop_count(remaining);
        remaining != 0
    }

    pub fn framedrop(&self) -> Framedrop {
        Framedrop::from_i8(self.framedrop.load(Ordering::Acquire))
    }

    pub fn set_framedrop(&self, framedrop: Framedrop) {
        self.framedrop.store(framedrop.as_i8(), Ordering::Release);
    }

    /// Late frames may be dropped: always, or automatically when video does
    /// not drive the clock.
    pub fn framedrop_enabled(&self) -> bool {
        match self.framedrop() {
            Framedrop::Always => true,
            Framedrop::Never => false,
            Framedrop::Auto => self.master_sync_type() != SyncMaster::Video,
        }
    }

    pub fn show_mode(&self) -> ShowMode {
        ShowMode::from_u8(self.show_mode.load(Ordering::Acquire))
    }

    pub fn set_show_mode(&self, mode: ShowMode) {
        self.show_mode.store(mode.as_u8(), Ordering::Release);
    }

    pub fn infinite_buffer(&self) -> bool {
        self.infinite_buffer
    }

    pub fn seek_by_bytes(&self) -> bool {
        self.seek_by_bytes
    }

    pub fn max_frame_duration(&self) -> Seconds {
        self.max_frame_duration
    }

    pub fn is_realtime(&self) -> bool {
        self.source.realtime
    }

    // Counters

    pub fn count_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_drops(&self) -> (u64, u64) {
        (
            self.frame_drops_early.load(Ordering::Relaxed),
            self.frame_drops_late.load(Ordering::Relaxed),
        )
    }

    pub fn status(&self) -> PlaybackStatus {
        let has_audio = self.has_stream(MediaKind::Audio);
        let has_video = self.has_stream(MediaKind::Video);
        let master_clock = self.master_clock();
        let (diff_kind, av_diff) = match (has_audio, has_video) {
            (true, true) => ("A-V", self.audclk.get() - self.vidclk.get()),
            (false, true) => ("M-V", master_clock - self.vidclk.get()),
            (true, false) => ("M-A", master_clock - self.audclk.get()),
            (false, false) => ("M-A", 0.0),
        };
        let (frame_drops_early, frame_drops_late) = self.frame_drops();
        PlaybackStatus {
            master_clock,
            diff_kind,
            av_diff,
            frame_drops_early,
            frame_drops_late,
            audioq_bytes: self.audioq.size(),
            videoq_bytes: self.videoq.size(),
            subtitleq_bytes: self.subtitleq.size(),
            paused: self.is_paused(),
            eof: self.is_eof(),
            volume: self.volume(),
            muted: self.is_muted(),
            show_mode: self.show_mode(),
        }
    }

    // Events

    /// Post the terminal quit event. Only the first call has an effect.
    pub fn post_quit(&self, reason: QuitReason) {
        if self.quit_posted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(?reason, "session quitting");
        // The receiver only disappears while the controller is tearing down.
        let _ = self.events.send(PlayerEvent::Quit(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn state(config: SessionConfig) -> SessionState {
        let (tx, _rx) = channel::unbounded();
        SessionState::new(config, SourceInfo::default(), tx)
    }

    #[test]
    fn test_seek_request_is_single_slot() {
        let seek = SeekRequest::default();
        let first = SeekTarget { pos: 5_000_000, rel: 0, by_bytes: false };
        let second = SeekTarget { pos: 9_000_000, rel: 0, by_bytes: false };
        assert!(seek.request(first));
        assert!(!seek.request(second));
        assert_eq!(seek.pending(), Some(first));
        seek.complete();
        assert!(!seek.is_pending());
        assert_eq!(seek.last_pos(), 5_000_000);
        assert!(seek.request(second));
    }

    #[test]
    fn test_consume_loop() {
        let session = state(SessionConfig { loop_count: 3, ..Default::default() });
        // three plays: two restarts
        assert!(session.consume_loop());
        assert!(session.consume_loop());
        assert!(!session.consume_loop());
        assert_eq!(session.loop_count(), 1);

        let forever = state(SessionConfig { loop_count: 0, ..Default::default() });
        assert!(forever.consume_loop());
        assert!(forever.consume_loop());
    }

    #[test]
    fn test_master_follows_open_streams() {
        let session = state(SessionConfig::default());
        assert_eq!(session.master_sync_type(), SyncMaster::External);
        session.stream(MediaKind::Audio).unwrap().set_index(Some(1));
        assert_eq!(session.master_sync_type(), SyncMaster::Audio);
        session.stream(MediaKind::Audio).unwrap().set_index(None);
        assert_eq!(session.master_sync_type(), SyncMaster::External);
    }

    #[test]
    fn test_framedrop_auto_depends_on_master() {
        let session = state(SessionConfig {
            sync_master: SyncMaster::Video,
            ..Default::default()
        });
        session.stream(MediaKind::Video).unwrap().set_index(Some(0));
        assert!(!session.framedrop_enabled());
        session.set_framedrop(Framedrop::Always);
        assert!(session.framedrop_enabled());
    }

    #[test]
    fn test_startup_volume_scaled_and_clamped() {
        let session = state(SessionConfig { startup_volume: 50, ..Default::default() });
        assert_eq!(session.volume(), 64);
        let loud = state(SessionConfig { startup_volume: 400, ..Default::default() });
        assert_eq!(loud.volume(), MAX_VOLUME);
    }

    #[test]
    fn test_status_reports_open_streams() {
        let session = state(SessionConfig::default());
        assert_eq!(session.status().diff_kind, "M-A");
        session.stream(MediaKind::Video).unwrap().set_index(Some(0));
        let status = session.status();
        assert_eq!(status.diff_kind, "M-V");
        assert!(!status.paused);
        assert_eq!(status.volume, MAX_VOLUME);
        assert_eq!(session.read_position(), None);
        session.set_read_position(Some(4096));
        assert_eq!(session.read_position(), Some(4096));
    }

    #[test]
    fn test_quit_posted_once() {
        let (tx, rx) = channel::unbounded();
        let session = SessionState::new(SessionConfig::default(), SourceInfo::default(), tx);
        session.post_quit(QuitReason::EndOfStream);
        session.post_quit(QuitReason::Requested);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::Quit(QuitReason::EndOfStream)));
        assert!(rx.try_recv().is_err());
    }
}
