//! Audio/video synchronization arithmetic.
//!
//! Pure functions and small state machines used by the refresh scheduler,
//! the decode workers and the audio callback. Nothing here touches threads
//! or queues directly.

use crate::config::{ExternalClockTuning, SyncMaster};
use crate::core::Seconds;
use crate::queue::FrameMeta;

/// No correction below this many seconds of A/V difference.
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Always correct above this many seconds of A/V difference.
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are not duplicated to catch up.
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Differences beyond this are treated as discontinuities, not drift.
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;
/// Maximum audio speed change per frame to correct drift, percent.
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;
/// Audio drift samples averaged before correcting.
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// Maximum frame duration for sources with timestamp discontinuities.
pub const MAX_FRAME_DURATION_DISCONT: f64 = 10.0;
/// Maximum frame duration otherwise.
pub const MAX_FRAME_DURATION: f64 = 3600.0;

/// The clock actually driving presentation, given the configured preference
/// and the streams that are open. Recomputed on every query because streams
/// can open and close during playback.
pub fn effective_master(configured: SyncMaster, has_video: bool, has_audio: bool) -> SyncMaster {
    match configured {
        SyncMaster::Video if has_video => SyncMaster::Video,
        SyncMaster::Video => SyncMaster::Audio,
        SyncMaster::Audio if has_audio => SyncMaster::Audio,
        SyncMaster::Audio => SyncMaster::External,
        SyncMaster::External => SyncMaster::External,
    }
}

/// How long to keep the previous frame on screen before the next one.
///
/// `delay` is the nominal duration of the previous frame and `diff` the
/// video clock minus the master clock. Returns the adjusted delay; when video
/// is master the caller passes `diff = NaN` and gets `delay` back.
pub fn compute_target_delay(delay: Seconds, diff: Seconds, max_frame_duration: Seconds) -> Seconds {
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Display duration of `current` given the frame that follows it.
///
/// Frames of different generations have no meaningful distance (0). A
/// missing, non-positive or absurd pts distance falls back to the frame's own
/// duration estimate.
pub fn frame_duration(current: &FrameMeta, next: &FrameMeta, max_frame_duration: Seconds) -> Seconds {
    if current.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - current.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        current.duration
    } else {
        duration
    }
}

/// Buffer occupancy of the open streams, in packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub video: Option<usize>,
    pub audio: Option<usize>,
}

/// Next external clock speed for a realtime source, or `None` to keep the
/// current speed.
///
/// Slows down when any open queue is nearly empty, speeds up when every open
/// queue is well stocked, and otherwise steps back towards 1.0.
pub fn external_clock_speed(current: f64, occupancy: Occupancy, tuning: &ExternalClockTuning) -> Option<f64> {
    let low = |n: Option<usize>| n.is_some_and(|n| n <= tuning.min_frames);
    let high = |n: Option<usize>| n.map_or(true, |n| n > tuning.max_frames);

    if low(occupancy.video) || low(occupancy.audio) {
        Some(tuning.speed_min.max(current - tuning.speed_step))
    } else if high(occupancy.video) && high(occupancy.audio) {
        Some(tuning.speed_max.min(current + tuning.speed_step))
    } else if current != 1.0 {
        let toward_one = current + tuning.speed_step * (1.0 - current) / (1.0 - current).abs();
        Some(toward_one)
    } else {
        None
    }
}

/// Averaged audio drift estimator used when audio is not the master clock.
///
/// Each callback feeds the instantaneous difference between the audio clock
/// and the master. Once enough samples accumulated and the average exceeds
/// the threshold, the number of samples to output is stretched or shrunk by
/// at most [`SAMPLE_CORRECTION_PERCENT_MAX`] percent.
#[derive(Debug, Clone)]
pub struct AudioDriftCorrector {
    coef: f64,
    cum: f64,
    count: u32,
    /// Differences smaller than this are inaudible; seconds.
    threshold: f64,
}

impl AudioDriftCorrector {
    /// `threshold` is usually the device buffer duration in seconds.
    pub fn new(threshold: f64) -> Self {
        Self {
            coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            cum: 0.0,
            count: 0,
            threshold,
        }
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Number of samples the next output chunk should contain.
    ///
    /// `diff` is audio clock minus master clock (may be `NaN`).
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: Seconds, sample_rate: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // Too big a jump to be drift: start averaging again.
            self.reset();
            return nb_samples;
        }

        self.cum = diff + self.coef * self.cum;
        if self.count < AUDIO_DIFF_AVG_NB {
            self.count += 1;
            return nb_samples;
        }

        let avg_diff = self.cum * (1.0 - self.coef);
        if avg_diff.abs() < self.threshold {
            return nb_samples;
        }

        let wanted = nb_samples as f64 + diff * sample_rate as f64;
        let min = (nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as f64;
        let max = (nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as f64;
        let wanted = wanted.clamp(min, max) as usize;
        tracing::trace!(diff, avg_diff, wanted, nb_samples, "audio drift correction");
        wanted
    }
}
