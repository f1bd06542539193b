//! The audio device callback.
//!
//! Pulls decoded chunks from the sample queue, converts them to the device
//! format (stretching or shrinking them when audio is not the master clock),
//! applies volume and mute, and re-anchors the audio clock to what the
//! listener is hearing at callback time.

use std::sync::Arc;

use super::buffer::{AudioFormat, AudioParams};
use super::AudioError;
use crate::config::{ShowMode, SyncMaster};
use crate::core::{now, Seconds};
use crate::decode::frame::AudioSamples;
use crate::playback::state::{SessionState, MAX_VOLUME};
use crate::playback::sync::{AudioDriftCorrector, AV_NOSYNC_THRESHOLD};
use crate::queue::Frame;

/// Smallest chunk of silence emitted when no audio is available, in bytes.
const SILENCE_BYTES: usize = 512;

/// Sample-format, layout and rate conversion into interleaved f32.
pub trait Resampler: Send {
    /// Convert `input`, appending interleaved samples to `out`. Returns the
    /// number of samples per channel produced.
    fn convert(&mut self, input: &AudioSamples, out: &mut Vec<f32>) -> Result<usize, AudioError>;

    /// Add or drop `delta` output samples spread over the next `distance`
    /// output samples.
    fn set_compensation(&mut self, delta: i32, distance: i32) -> Result<(), AudioError>;
}

/// Builds a resampler from a source format to the device format.
pub type ResamplerFactory =
    Box<dyn FnMut(AudioFormat, AudioFormat) -> Result<Box<dyn Resampler>, AudioError> + Send>;

pub struct AudioRenderer {
    state: Arc<SessionState>,
    make_resampler: ResamplerFactory,
    target: AudioParams,
    /// Format the current resampler was built for.
    source: AudioFormat,
    resampler: Option<Box<dyn Resampler>>,
    buf: Vec<f32>,
    buf_index: usize,
    buf_is_silence: bool,
    /// pts at the end of the last decoded chunk.
    audio_clock: Seconds,
    audio_clock_serial: i32,
    drift: AudioDriftCorrector,
}

impl AudioRenderer {
    pub fn new(state: Arc<SessionState>, make_resampler: ResamplerFactory) -> Self {
        let placeholder = AudioParams::new(0, 0, 0);
        Self {
            state,
            make_resampler,
            target: placeholder,
            source: placeholder.format(),
            resampler: None,
            buf: Vec::new(),
            buf_index: 0,
            buf_is_silence: true,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            drift: AudioDriftCorrector::new(0.0),
        }
    }

    /// Bind to the negotiated device parameters. Called once by the device
    /// layer before the first callback.
    pub fn configure(&mut self, target: AudioParams) {
        self.target = target;
        self.source = target.format();
        self.resampler = None;
        self.drift = AudioDriftCorrector::new(target.bytes_to_seconds(target.hw_buf_size));
        tracing::debug!(
            sample_rate = target.sample_rate,
            channels = target.channels,
            hw_buf_size = target.hw_buf_size,
            "audio output configured"
        );
    }

    pub fn target(&self) -> AudioParams {
        self.target
    }

    /// Fill `out` with interleaved f32 samples.
    pub fn fill(&mut self, out: &mut [f32]) {
        self.fill_at(out, now());
    }

    pub fn fill_at(&mut self, out: &mut [f32], callback_time: Seconds) {
        let mut written = 0;
        while written < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.decode_chunk() {
                    self.fill_silence();
                } else if self.state.show_mode() != ShowMode::Video {
                    self.state.samples.lock().push(&self.buf);
                }
                self.buf_index = 0;
            }

            let n = (self.buf.len() - self.buf_index).min(out.len() - written);
            let src = &self.buf[self.buf_index..self.buf_index + n];
            let dst = &mut out[written..written + n];
            let muted = self.state.is_muted();
            let volume = self.state.volume();
            if !muted && !self.buf_is_silence && volume == MAX_VOLUME {
                dst.copy_from_slice(src);
            } else if muted || self.buf_is_silence {
                dst.fill(0.0);
            } else {
                let gain = volume as f32 / MAX_VOLUME as f32;
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = (s * gain).clamp(-1.0, 1.0);
                }
            }
            written += n;
            self.buf_index += n;
        }

        let pending_bytes = (self.buf.len() - self.buf_index) * std::mem::size_of::<f32>();
        if !self.audio_clock.is_nan() {
            let latency = self.target.bytes_to_seconds(2 * self.target.hw_buf_size + pending_bytes);
            self.state
                .audclk
                .set_at(self.audio_clock - latency, self.audio_clock_serial, callback_time);
            self.state
                .extclk
                .sync_to_slave_at(&self.state.audclk, AV_NOSYNC_THRESHOLD, callback_time);
        }
    }

    fn fill_silence(&mut self) {
        let frame_size = self.target.frame_size.max(1);
        let bytes = (SILENCE_BYTES / frame_size).max(1) * frame_size;
        self.buf.clear();
        self.buf.resize(bytes / std::mem::size_of::<f32>(), 0.0);
        self.buf_is_silence = true;
    }

    /// Decode one chunk into `buf`. Returns false when nothing is available
    /// (paused, aborted or a conversion error).
    fn decode_chunk(&mut self) -> bool {
        if self.state.is_paused() {
            return false;
        }
        let state = Arc::clone(&self.state);
        loop {
            let Some(meta) = state.sampq.peek_readable() else {
                return false;
            };
            state.sampq.next();
            if meta.serial == state.audioq.serial() {
                break;
            }
        }
        state
            .sampq
            .with_last(|frame| self.convert(frame))
            .unwrap_or(false)
    }

    /// Samples the current chunk should turn into, after drift correction.
    fn synchronize(&mut self, nb_samples: usize, sample_rate: u32) -> usize {
        if self.state.master_sync_type() == SyncMaster::Audio {
            return nb_samples;
        }
        let diff = self.state.audclk.get() - self.state.master_clock();
        self.drift.wanted_samples(nb_samples, diff, sample_rate)
    }

    fn convert(&mut self, frame: &Frame<AudioSamples>) -> bool {
        let samples = &frame.payload;
        let format = samples.format;
        let nb_samples = samples.nb_samples;
        let wanted = self.synchronize(nb_samples, format.sample_rate);
        let target = self.target.format();

        if format != self.source || (wanted != nb_samples && self.resampler.is_none()) {
            self.resampler = None;
            if format != target || wanted != nb_samples {
                match (self.make_resampler)(format, target) {
                    Ok(resampler) => self.resampler = Some(resampler),
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            src_rate = format.sample_rate,
                            src_channels = format.channels,
                            "cannot create audio converter"
                        );
                        return false;
                    }
                }
            }
            self.source = format;
        }

        self.buf.clear();
        match self.resampler.as_mut() {
            Some(resampler) => {
                if wanted != nb_samples {
                    let src_rate = format.sample_rate.max(1) as i64;
                    let tgt_rate = target.sample_rate as i64;
                    let delta = (wanted as i64 - nb_samples as i64) * tgt_rate / src_rate;
                    let distance = wanted as i64 * tgt_rate / src_rate;
                    if let Err(err) = resampler.set_compensation(delta as i32, distance as i32) {
                        tracing::error!(error = %err, "audio compensation failed");
                        return false;
                    }
                }
                if let Err(err) = resampler.convert(samples, &mut self.buf) {
                    tracing::error!(error = %err, "audio conversion failed");
                    return false;
                }
            }
            None => match samples.as_interleaved_f32() {
                Some(interleaved) => self.buf = interleaved,
                None => return false,
            },
        }
        self.buf_is_silence = false;

        self.audio_clock = if frame.pts.is_nan() || format.sample_rate == 0 {
            f64::NAN
        } else {
            frame.pts + nb_samples as f64 / format.sample_rate as f64
        };
        self.audio_clock_serial = frame.serial;
        tracing::trace!(
            clock = self.audio_clock,
            serial = self.audio_clock_serial,
            samples = self.buf.len(),
            "audio chunk"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::core::MediaKind;
    use crate::demux::SourceInfo;
    use crossbeam::channel;

    fn session() -> Arc<SessionState> {
        let (tx, _rx) = channel::unbounded();
        let state = Arc::new(SessionState::new(SessionConfig::default(), SourceInfo::default(), tx));
        state.audioq.start();
        state.stream(MediaKind::Audio).unwrap().set_index(Some(0));
        state.set_show_mode(ShowMode::Video);
        state
    }

    fn no_resampler() -> ResamplerFactory {
        Box::new(|_, _| Err(AudioError::Resample("unavailable".into())))
    }

    fn renderer(state: &Arc<SessionState>) -> AudioRenderer {
        let mut renderer = AudioRenderer::new(Arc::clone(state), no_resampler());
        renderer.configure(AudioParams::new(1000, 1, 100));
        renderer
    }

    fn push_chunk(state: &SessionState, pts: f64, value: f32, len: usize) {
        let samples = AudioSamples::from_f32(1000, 1, &vec![value; len]);
        let frame = Frame::new(samples, state.audioq.serial(), pts, len as f64 / 1000.0, -1);
        assert!(state.sampq.push(frame));
    }

    #[test]
    fn test_passthrough_and_clock_update() {
        let state = session();
        let mut renderer = renderer(&state);
        push_chunk(&state, 10.0, 0.5, 200);

        let mut out = vec![0.0f32; 100];
        renderer.fill_at(&mut out, 50.0);
        assert!(out.iter().all(|&s| s == 0.5));

        // chunk ends at 10.2; 2 * 100 samples of device buffer plus 100 still
        // pending are not yet audible
        let expected = 10.2 - 0.3;
        assert!((state.audclk.get_at(50.0) - expected).abs() < 1e-9);
        // external clock follows the audio clock
        assert!((state.extclk.get_at(50.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_volume_and_mute() {
        let state = session();
        let mut renderer = renderer(&state);
        push_chunk(&state, 0.0, 0.5, 100);
        push_chunk(&state, 0.1, 0.5, 100);

        state.set_volume(MAX_VOLUME / 2);
        let mut out = vec![0.0f32; 100];
        renderer.fill_at(&mut out, 0.0);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));

        state.set_muted(true);
        renderer.fill_at(&mut out, 0.0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_paused_outputs_silence() {
        let state = session();
        let mut renderer = renderer(&state);
        push_chunk(&state, 0.0, 0.5, 100);
        state.set_paused(true);

        let mut out = vec![1.0f32; 300];
        renderer.fill_at(&mut out, 0.0);
        assert!(out.iter().all(|&s| s == 0.0));
        // nothing consumed
        assert_eq!(state.sampq.nb_remaining(), 1);
    }

    #[test]
    fn test_stale_chunks_are_skipped() {
        let state = session();
        let mut renderer = renderer(&state);
        push_chunk(&state, 0.0, 0.9, 10);
        state.audioq.put_flush().unwrap();
        push_chunk(&state, 30.0, 0.1, 100);

        let mut out = vec![0.0f32; 100];
        renderer.fill_at(&mut out, 0.0);
        assert!(out.iter().all(|&s| (s - 0.1).abs() < 1e-6));
        assert_eq!(state.audclk.serial(), state.audioq.serial());
    }

    #[test]
    fn test_waveform_ring_fed_outside_video_mode() {
        let state = session();
        state.set_show_mode(ShowMode::Waves);
        let mut renderer = renderer(&state);
        push_chunk(&state, 0.0, 0.75, 100);

        let mut out = vec![0.0f32; 100];
        renderer.fill_at(&mut out, 0.0);
        assert_eq!(state.samples.lock().latest(3), vec![0.75, 0.75, 0.75]);
    }
}
