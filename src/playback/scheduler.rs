//! The refresh scheduler.
//!
//! Driven by the controller thread, each tick decides whether the picture
//! on screen stays, is replaced by the next one, or whether queued pictures
//! are already too late and get dropped. It returns how long the controller
//! may sleep before the next tick.

use super::state::SessionState;
use super::sync::{
    compute_target_delay, external_clock_speed, frame_duration, Occupancy, AV_NOSYNC_THRESHOLD,
    AV_SYNC_THRESHOLD_MAX,
};
use crate::config::{ShowMode, SyncMaster};
use crate::core::{now, MediaKind, Seconds};
use crate::render::{calculate_display_rect, RenderError, VideoSink};

/// Upper bound on the sleep between two ticks.
pub const REFRESH_RATE: Seconds = 0.01;
/// Interval between two status lines.
const STATUS_INTERVAL: Seconds = 0.03;
/// Default cadence of the audio visualization.
pub const DEFAULT_RDFTSPEED: Seconds = 0.02;

/// Outcome of examining the head of the picture queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameDecision {
    /// Nothing to show.
    NoFrame,
    /// The next picture belongs to an old generation.
    StaleDiscard,
    /// Paused: keep the current picture.
    Hold,
    /// The current picture stays for `remaining` more seconds.
    NotDue { remaining: Seconds },
    /// The next picture is due but the one after it is due as well.
    Drop,
    /// The next picture is due.
    Display,
}

#[derive(Debug)]
pub struct Scheduler {
    /// Wall time at which the picture on screen became due.
    frame_timer: Seconds,
    force_refresh: bool,
    last_vis_time: Seconds,
    last_status_time: Seconds,
    rdftspeed: Seconds,
    audio_channels: u16,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            frame_timer: 0.0,
            force_refresh: false,
            last_vis_time: 0.0,
            last_status_time: f64::NEG_INFINITY,
            rdftspeed: DEFAULT_RDFTSPEED,
            audio_channels: 2,
        }
    }

    pub fn with_rdftspeed(mut self, rdftspeed: Seconds) -> Self {
        self.rdftspeed = rdftspeed;
        self
    }

    /// Channel layout of the samples in the visualization ring.
    pub fn set_audio_channels(&mut self, channels: u16) {
        self.audio_channels = channels.max(1);
    }

    pub fn frame_timer(&self) -> Seconds {
        self.frame_timer
    }

    /// Redraw on the next tick even if no new picture is due.
    pub fn request_refresh(&mut self) {
        self.force_refresh = true;
    }

    pub fn needs_refresh(&self) -> bool {
        self.force_refresh
    }

    /// Pause or resume all clocks, carrying the frame timer across the pause.
    pub fn toggle_pause(&mut self, state: &SessionState) {
        self.toggle_pause_at(state, now());
    }

    pub fn toggle_pause_at(&mut self, state: &SessionState, time: Seconds) {
        let paused = state.is_paused();
        if paused {
            self.frame_timer += time - state.vidclk.last_updated();
            if !state.read_pause_unsupported() {
                state.vidclk.set_paused(false);
            }
            state
                .vidclk
                .set_at(state.vidclk.get_at(time), state.vidclk.serial(), time);
        }
        state
            .extclk
            .set_at(state.extclk.get_at(time), state.extclk.serial(), time);

        let paused = !paused;
        state.audclk.set_paused(paused);
        state.vidclk.set_paused(paused);
        state.extclk.set_paused(paused);
        state.set_paused(paused);
        tracing::debug!(paused, "pause toggled");
    }

    /// Show exactly one more picture, then pause again.
    pub fn step_to_next_frame(&mut self, state: &SessionState) {
        self.step_to_next_frame_at(state, now());
    }

    pub fn step_to_next_frame_at(&mut self, state: &SessionState, time: Seconds) {
        if state.is_paused() {
            self.toggle_pause_at(state, time);
        }
        state.set_stepping(true);
    }

    /// One controller tick: refresh unless nothing is shown or the picture is
    /// frozen. Returns the time the controller may sleep.
    pub fn tick(&mut self, state: &SessionState, sink: &mut dyn VideoSink) -> Seconds {
        self.tick_at(state, sink, now())
    }

    pub fn tick_at(&mut self, state: &SessionState, sink: &mut dyn VideoSink, time: Seconds) -> Seconds {
        if state.take_step_request() {
            self.step_to_next_frame_at(state, time);
        }
        if state.show_mode() != ShowMode::None && (!state.is_paused() || self.force_refresh) {
            self.refresh_at(state, sink, time)
        } else {
            REFRESH_RATE
        }
    }

    /// Run the refresh state machine at wall time `time`.
    pub fn refresh_at(&mut self, state: &SessionState, sink: &mut dyn VideoSink, time: Seconds) -> Seconds {
        let mut remaining = REFRESH_RATE;

        if !state.is_paused() && state.master_sync_type() == SyncMaster::External && state.is_realtime() {
            self.adjust_external_clock(state, time);
        }

        if state.show_mode() != ShowMode::Video && state.has_stream(MediaKind::Audio) {
            if self.force_refresh || self.last_vis_time + self.rdftspeed < time {
                self.display(state, sink);
                self.last_vis_time = time;
            }
            remaining = remaining.min(self.last_vis_time + self.rdftspeed - time);
        }

        if state.has_stream(MediaKind::Video) {
            loop {
                match self.decide(state, time) {
                    FrameDecision::StaleDiscard => {
                        state.pictq.next();
                    }
                    FrameDecision::Drop => {
                        state.count_late_drop();
                        tracing::trace!(frame_timer = self.frame_timer, "dropping late picture");
                        state.pictq.next();
                    }
                    FrameDecision::NotDue { remaining: wait } => {
                        remaining = remaining.min(wait);
                        break;
                    }
                    FrameDecision::NoFrame | FrameDecision::Hold => break,
                    FrameDecision::Display => {
                        self.expire_subtitles(state);
                        state.pictq.next();
                        self.force_refresh = true;
                        if state.is_stepping() && !state.is_paused() {
                            self.toggle_pause_at(state, time);
                        }
                        break;
                    }
                }
            }

            if self.force_refresh && state.show_mode() == ShowMode::Video && state.pictq.is_last_shown() {
                self.display(state, sink);
            }
        }
        self.force_refresh = false;

        if time - self.last_status_time >= STATUS_INTERVAL {
            self.log_status(state);
            self.last_status_time = time;
        }
        remaining
    }

    /// Examine the head of the picture queue. On a due picture this also
    /// advances the frame timer and the video clock.
    pub fn decide(&mut self, state: &SessionState, time: Seconds) -> FrameDecision {
        if state.pictq.nb_remaining() == 0 {
            return FrameDecision::NoFrame;
        }
        let (Some(lastvp), Some(vp)) = (state.pictq.peek_last(), state.pictq.peek()) else {
            return FrameDecision::NoFrame;
        };
        if vp.serial != state.videoq.serial() {
            return FrameDecision::StaleDiscard;
        }
        if lastvp.serial != vp.serial {
            self.frame_timer = time;
        }
        if state.is_paused() {
            return FrameDecision::Hold;
        }

        let max_frame_duration = state.max_frame_duration();
        let last_duration = frame_duration(&lastvp, &vp, max_frame_duration);
        let diff = if state.master_sync_type() == SyncMaster::Video {
            f64::NAN
        } else {
            state.vidclk.get_at(time) - state.master_clock_ref().get_at(time)
        };
        let delay = compute_target_delay(last_duration, diff, max_frame_duration);
        if !diff.is_nan() {
            tracing::trace!(diff, delay, last_duration, "video target delay");
        }

        if time < self.frame_timer + delay {
            return FrameDecision::NotDue {
                remaining: self.frame_timer + delay - time,
            };
        }

        self.frame_timer += delay;
        if delay > 0.0 && time - self.frame_timer > AV_SYNC_THRESHOLD_MAX {
            self.frame_timer = time;
        }

        if !vp.pts.is_nan() {
            update_video_clock(state, vp.pts, vp.serial, time);
        }

        if state.pictq.nb_remaining() > 1 {
            if let Some(nextvp) = state.pictq.peek_next() {
                let duration = frame_duration(&vp, &nextvp, max_frame_duration);
                if !state.is_stepping() && state.framedrop_enabled() && time > self.frame_timer + duration {
                    return FrameDecision::Drop;
                }
            }
        }
        FrameDecision::Display
    }

    fn adjust_external_clock(&self, state: &SessionState, time: Seconds) {
        let occupancy = Occupancy {
            video: state
                .has_stream(MediaKind::Video)
                .then(|| state.videoq.nb_packets()),
            audio: state
                .has_stream(MediaKind::Audio)
                .then(|| state.audioq.nb_packets()),
        };
        let current = state.extclk.speed();
        if let Some(speed) = external_clock_speed(current, occupancy, &state.config.external_clock) {
            if speed != current {
                state.extclk.set_speed_at(speed, time);
                tracing::trace!(speed, ?occupancy, "external clock speed");
            }
        }
    }

    /// Drop subtitles that ended or were superseded at the current video
    /// clock.
    fn expire_subtitles(&self, state: &SessionState) {
        if !state.has_stream(MediaKind::Subtitle) {
            return;
        }
        let video_pts = state.vidclk.pts();
        while state.subpq.nb_remaining() > 0 {
            let Some((serial, end)) = state
                .subpq
                .with_peek(|sp| (sp.serial, sp.pts + sp.payload.end_display_time as f64 / 1000.0))
            else {
                break;
            };
            let next_start = if state.subpq.nb_remaining() > 1 {
                state
                    .subpq
                    .with_peek_next(|sp| sp.pts + sp.payload.start_display_time as f64 / 1000.0)
            } else {
                None
            };

            let expired = serial != state.subtitleq.serial()
                || video_pts > end
                || next_start.is_some_and(|start| video_pts > start);
            if !expired {
                break;
            }
            state.subpq.next();
        }
    }

    fn display(&mut self, state: &SessionState, sink: &mut dyn VideoSink) {
        let result = if state.has_stream(MediaKind::Audio) && state.show_mode() != ShowMode::Video {
            self.display_waveform(state, sink)
        } else if state.has_stream(MediaKind::Video) {
            display_picture(state, sink)
        } else {
            Ok(())
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "display failed");
        }
    }

    fn display_waveform(&self, state: &SessionState, sink: &mut dyn VideoSink) -> Result<(), RenderError> {
        let (width, _) = sink.size();
        let count = width as usize * self.audio_channels as usize;
        let samples = state.samples.lock().latest(count);
        sink.display_waveform(&samples, self.audio_channels)
    }

    fn log_status(&self, state: &SessionState) {
        let status = state.status();
        tracing::debug!(
            master = status.master_clock,
            diff_kind = status.diff_kind,
            av_diff = status.av_diff,
            framedrops = status.frame_drops_early + status.frame_drops_late,
            aq_kb = status.audioq_bytes / 1024,
            vq_kb = status.videoq_bytes / 1024,
            sq_bytes = status.subtitleq_bytes,
            "status"
        );
    }
}

/// Anchor the video clock at `pts` and let the external clock follow it.
fn update_video_clock(state: &SessionState, pts: Seconds, serial: i32, time: Seconds) {
    state.vidclk.set_at(pts, serial, time);
    state.extclk.sync_to_slave_at(&state.vidclk, AV_NOSYNC_THRESHOLD, time);
}

fn display_picture(state: &SessionState, sink: &mut dyn VideoSink) -> Result<(), RenderError> {
    let (width, height) = sink.size();
    let with_subtitles = state.has_stream(MediaKind::Subtitle);
    let result = state.pictq.with_last(|vp| {
        let picture = &vp.payload;
        let rect = calculate_display_rect(
            0,
            0,
            width,
            height,
            picture.width,
            picture.height,
            picture.sample_aspect_ratio,
        );
        let vp_pts = vp.pts;
        let shown = if with_subtitles && state.subpq.nb_remaining() > 0 {
            state.subpq.with_peek(|sp| {
                let visible = vp_pts >= sp.pts + sp.payload.start_display_time as f64 / 1000.0;
                sink.display_picture(vp, visible.then_some(sp), rect)
            })
        } else {
            None
        };
        match shown {
            Some(result) => result,
            None => sink.display_picture(vp, None, rect),
        }
    });
    result.unwrap_or(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Framedrop, SessionConfig};
    use crate::decode::frame::{PixelFormat, SubtitleFrame, VideoPicture};
    use crate::demux::SourceInfo;
    use crate::queue::Frame;
    use crate::render::{DisplayRect, LoggingVideoSink};
    use crossbeam::channel;
    use std::sync::Arc;

    fn session(master: SyncMaster) -> Arc<SessionState> {
        let (tx, _rx) = channel::unbounded();
        let config = SessionConfig {
            sync_master: master,
            show_mode: Some(ShowMode::Video),
            ..Default::default()
        };
        let state = Arc::new(SessionState::new(config, SourceInfo::default(), tx));
        state.videoq.start();
        state.stream(MediaKind::Video).unwrap().set_index(Some(0));
        state
    }

    fn push_picture(state: &SessionState, pts: f64) {
        let frame = Frame::new(VideoPicture::new(4, 4, PixelFormat::Rgba), state.videoq.serial(), pts, 0.04, -1);
        assert!(state.pictq.push(frame));
    }

    #[test]
    fn test_first_picture_displayed_and_clock_anchored() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);

        scheduler.refresh_at(&state, &mut sink, 100.0);
        assert_eq!(sink.pictures_shown(), 1);
        assert!(state.pictq.is_last_shown());
        assert_eq!(state.vidclk.get_at(100.0), 0.0);
    }

    #[test]
    fn test_not_due_reports_remaining_time() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);
        push_picture(&state, 0.04);

        scheduler.refresh_at(&state, &mut sink, 100.0);
        match scheduler.decide(&state, 100.01) {
            FrameDecision::NotDue { remaining } => assert!((remaining - 0.03).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(scheduler.refresh_at(&state, &mut sink, 100.01), REFRESH_RATE);
        assert_eq!(sink.pictures_shown(), 1);

        scheduler.refresh_at(&state, &mut sink, 100.05);
        assert_eq!(sink.pictures_shown(), 2);
        assert!((state.vidclk.get_at(100.05) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_stale_pictures_are_discarded() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);
        state.videoq.put_flush().unwrap();
        push_picture(&state, 5.0);

        scheduler.refresh_at(&state, &mut sink, 10.0);
        assert_eq!(sink.pictures_shown(), 1);
        assert_eq!(sink.last_pts(), 5.0);
    }

    #[test]
    fn test_late_pictures_are_dropped() {
        let state = session(SyncMaster::External);
        state.set_framedrop(Framedrop::Always);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);
        scheduler.refresh_at(&state, &mut sink, 1.0);

        push_picture(&state, 0.04);
        push_picture(&state, 0.08);
        // 0.04 became due at 1.04 and 0.08 at 1.08: the first is skipped
        scheduler.refresh_at(&state, &mut sink, 1.1);
        assert_eq!(state.frame_drops(), (0, 1));
        assert_eq!(sink.last_pts(), 0.08);
    }

    #[test]
    fn test_paused_holds_picture() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);
        push_picture(&state, 0.04);
        scheduler.refresh_at(&state, &mut sink, 1.0);

        scheduler.toggle_pause_at(&state, 1.0);
        assert!(state.is_paused());
        assert_eq!(scheduler.decide(&state, 10.0), FrameDecision::Hold);
        assert_eq!(sink.pictures_shown(), 1);
    }

    #[test]
    fn test_pause_carries_frame_timer() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        // file sources cannot pause reading, so the video clock stays frozen
        state.set_read_pause_unsupported(true);
        push_picture(&state, 0.0);
        scheduler.refresh_at(&state, &mut sink, 1.0);
        assert_eq!(scheduler.frame_timer(), 1.0);

        scheduler.toggle_pause_at(&state, 1.0);
        scheduler.toggle_pause_at(&state, 6.0);
        assert!(!state.is_paused());
        // five seconds paused are added to the frame timer
        assert_eq!(scheduler.frame_timer(), 6.0);
        assert_eq!(state.vidclk.get_at(6.0), 0.0);
    }

    #[test]
    fn test_step_shows_one_picture_then_pauses() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 0.0);
        push_picture(&state, 0.04);
        scheduler.refresh_at(&state, &mut sink, 1.0);
        scheduler.toggle_pause_at(&state, 1.0);

        scheduler.step_to_next_frame_at(&state, 2.0);
        assert!(!state.is_paused());
        scheduler.refresh_at(&state, &mut sink, 2.1);
        assert_eq!(sink.pictures_shown(), 2);
        assert!(state.is_paused());
    }

    #[test]
    fn test_expired_subtitles_are_dropped() {
        let state = session(SyncMaster::Video);
        state.subtitleq.start();
        state.stream(MediaKind::Subtitle).unwrap().set_index(Some(1));
        let subtitle = |pts: f64| {
            Frame::new(
                SubtitleFrame {
                    pts: None,
                    start_display_time: 0,
                    end_display_time: 500,
                    graphics: true,
                    rects: Vec::new(),
                },
                state.subtitleq.serial(),
                pts,
                0.0,
                -1,
            )
        };
        assert!(state.subpq.push(subtitle(0.0)));
        assert!(state.subpq.push(subtitle(2.0)));

        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        push_picture(&state, 1.0);
        scheduler.refresh_at(&state, &mut sink, 1.0);
        // video clock at 1.0: the first subtitle ended at 0.5
        assert_eq!(state.subpq.nb_remaining(), 1);
        let pts = state.subpq.with_peek(|sp| sp.pts);
        assert_eq!(pts, Some(2.0));
    }

    #[test]
    fn test_external_clock_slows_when_starved() {
        let (tx, _rx) = channel::unbounded();
        let source = SourceInfo {
            realtime: true,
            ..Default::default()
        };
        let config = SessionConfig {
            sync_master: SyncMaster::External,
            show_mode: Some(ShowMode::Video),
            ..Default::default()
        };
        let state = SessionState::new(config, source, tx);
        state.videoq.start();
        state.stream(MediaKind::Video).unwrap().set_index(Some(0));
        state.extclk.set_at(0.0, state.extclk.serial(), 0.0);

        let mut scheduler = Scheduler::new();
        let mut sink = LoggingVideoSink::default();
        scheduler.refresh_at(&state, &mut sink, 1.0);
        assert!((state.extclk.speed() - 0.999).abs() < 1e-12);
    }

    struct FailingSink;

    impl VideoSink for FailingSink {
        fn size(&self) -> (u32, u32) {
            (16, 16)
        }

        fn display_picture(
            &mut self,
            _frame: &mut Frame<VideoPicture>,
            _subtitle: Option<&mut Frame<SubtitleFrame>>,
            _rect: DisplayRect,
        ) -> Result<(), RenderError> {
            Err(RenderError::Surface("lost".into()))
        }

        fn display_waveform(&mut self, _samples: &[f32], _channels: u16) -> Result<(), RenderError> {
            Err(RenderError::Surface("lost".into()))
        }
    }

    #[test]
    fn test_display_failure_does_not_stop_playback() {
        let state = session(SyncMaster::Video);
        let mut scheduler = Scheduler::new();
        push_picture(&state, 0.0);
        push_picture(&state, 0.04);
        scheduler.refresh_at(&state, &mut FailingSink, 1.0);
        scheduler.refresh_at(&state, &mut FailingSink, 1.05);
        assert!((state.vidclk.get_at(1.05) - 0.04).abs() < 1e-9);
    }
}
