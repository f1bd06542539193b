//! Decode worker threads: one per open stream, each turning packets from its
//! queue into timed frames on the matching frame queue.

use std::sync::Arc;
use std::thread;

use super::decoder::{DecodeError, DecodeOutcome, Decoder};
use super::frame::DecodedFrame;
use super::stream_info::{guess_sample_aspect_ratio, StreamInfo};
use crate::core::time::{opt_ts_to_seconds, to_seconds};
use crate::core::{MediaKind, Seconds};
use crate::playback::state::SessionState;
use crate::playback::sync::AV_NOSYNC_THRESHOLD;
use crate::queue::Frame;

/// Spawn the worker for `decoder`'s stream kind.
pub fn spawn(
    state: Arc<SessionState>,
    decoder: Decoder,
    stream: StreamInfo,
) -> std::io::Result<thread::JoinHandle<()>> {
    let kind = decoder.kind();
    let name = format!("{kind}-decoder");
    thread::Builder::new().name(name).spawn(move || match kind {
        MediaKind::Video => video_loop(&state, decoder, &stream),
        MediaKind::Audio => audio_loop(&state, decoder),
        MediaKind::Subtitle => subtitle_loop(&state, decoder),
        MediaKind::Data => {}
    })
}

/// Whether a freshly decoded picture is already behind the master clock and
/// can be dropped before it is queued.
pub fn should_drop_early(diff: Seconds, serial_matches_clock: bool, packets_queued: bool) -> bool {
    !diff.is_nan() && diff.abs() < AV_NOSYNC_THRESHOLD && diff < 0.0 && serial_matches_clock && packets_queued
}

fn log_exit(kind: MediaKind, err: &DecodeError) {
    match err {
        DecodeError::Aborted => tracing::debug!(%kind, "decoder stopping"),
        DecodeError::Codec(err) => tracing::error!(%kind, error = %err, "decoder failed"),
    }
}

fn video_loop(state: &SessionState, mut decoder: Decoder, stream: &StreamInfo) {
    let time_base = stream.time_base;
    let duration = stream.frame_duration();
    let stream_sar = stream
        .video
        .as_ref()
        .map(|video| video.sample_aspect_ratio)
        .unwrap_or_default();

    loop {
        let mut picture = match decoder.decode_next() {
            Ok(DecodeOutcome::Frame(DecodedFrame::Video(picture))) => picture,
            Ok(_) => continue,
            Err(err) => {
                log_exit(MediaKind::Video, &err);
                break;
            }
        };

        let pts = opt_ts_to_seconds(picture.pts, time_base);
        let serial = decoder.pkt_serial();
        if state.framedrop_enabled() && picture.pts.is_some() {
            let diff = pts - state.master_clock();
            if should_drop_early(diff, serial == state.vidclk.serial(), state.videoq.nb_packets() > 0) {
                state.count_early_drop();
                tracing::trace!(pts, diff, "dropping late picture before queueing");
                continue;
            }
        }

        picture.sample_aspect_ratio = guess_sample_aspect_ratio(stream_sar, picture.sample_aspect_ratio);
        let pos = picture.pos.unwrap_or(-1);
        if !state.pictq.push(Frame::new(picture, serial, pts, duration, pos)) {
            break;
        }
    }
}

fn audio_loop(state: &SessionState, mut decoder: Decoder) {
    loop {
        let samples = match decoder.decode_next() {
            Ok(DecodeOutcome::Frame(DecodedFrame::Audio(samples))) => samples,
            Ok(_) => continue,
            Err(err) => {
                log_exit(MediaKind::Audio, &err);
                break;
            }
        };

        let rate = samples.format.sample_rate;
        let (pts, duration) = if rate > 0 {
            let rate = rate as f64;
            let pts = samples.pts.map_or(f64::NAN, |pts| pts as f64 / rate);
            (pts, samples.nb_samples as f64 / rate)
        } else {
            (f64::NAN, 0.0)
        };
        let pos = samples.pos.unwrap_or(-1);
        let frame = Frame::new(samples, decoder.pkt_serial(), pts, duration, pos);
        if !state.sampq.push(frame) {
            break;
        }
    }
}

fn subtitle_loop(state: &SessionState, mut decoder: Decoder) {
    loop {
        let Some(slot) = state.subpq.peek_writable() else {
            break;
        };
        let subtitle = match decoder.decode_next() {
            Ok(DecodeOutcome::Frame(DecodedFrame::Subtitle(subtitle))) => subtitle,
            Ok(_) => continue,
            Err(err) => {
                log_exit(MediaKind::Subtitle, &err);
                break;
            }
        };
        // text subtitles are decoded but never presented
        if !subtitle.graphics {
            continue;
        }
        let pts = subtitle.pts.map_or(0.0, to_seconds);
        slot.push(Frame::new(subtitle, decoder.pkt_serial(), pts, 0.0, -1));
    }
}
