//! The demux thread.
//!
//! Owns the [`DemuxSource`] and feeds the packet queues of the open streams.
//! Each iteration handles, in order: pause transitions, a pending seek,
//! cover-art injection, backpressure, end of stream with looping or
//! autoexit, and finally reading and routing one packet.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::source::{DemuxError, DemuxSource, SeekSpec};
use crate::core::time::{from_seconds, to_seconds, ts_to_seconds};
use crate::core::{MediaKind, Seconds};
use crate::decode::StreamInfo;
use crate::playback::state::{QuitReason, SeekTarget, SessionState};
use crate::queue::{Packet, PacketQueue};

/// Stop reading when the queues together hold this many bytes.
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// Bounded wait used for backpressure, end of stream and pause polling.
const READ_WAIT: Duration = Duration::from_millis(10);

/// Whether a packet falls inside the user's play range.
///
/// `start_time` and `duration` are in seconds; without a duration every
/// packet is in range.
pub fn in_play_range(
    packet: &Packet,
    stream: &StreamInfo,
    start_time: Option<Seconds>,
    duration: Option<Seconds>,
) -> bool {
    let Some(duration) = duration else {
        return true;
    };
    let Some(ts) = packet.timestamp() else {
        return true;
    };
    let stream_start = stream.start_time.unwrap_or(0);
    ts_to_seconds(ts - stream_start, stream.time_base) - start_time.unwrap_or(0.0) <= duration
}

/// A queue has enough buffered when it holds more than `min_frames` packets
/// and (if it knows its duration) more than a second of media. Closed
/// streams, aborted queues and cover-art streams never need more.
pub fn has_enough_packets(
    queue: &PacketQueue,
    stream: Option<&StreamInfo>,
    min_frames: usize,
) -> bool {
    let Some(stream) = stream else {
        return true;
    };
    if queue.is_aborted() || stream.is_attached_pic() {
        return true;
    }
    let stats = queue.stats();
    stats.nb_packets > min_frames
        && (stats.duration == 0 || ts_to_seconds(stats.duration, stream.time_base) > 1.0)
}

pub struct ReadLoop {
    state: Arc<SessionState>,
    source: Box<dyn DemuxSource>,
    last_paused: bool,
}

impl ReadLoop {
    pub fn new(state: Arc<SessionState>, source: Box<dyn DemuxSource>) -> Self {
        Self {
            state,
            source,
            last_paused: false,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name("read".into()).spawn(move || self.run())
    }

    fn open_stream(&self, kind: MediaKind) -> Option<&StreamInfo> {
        self.state
            .stream_index(kind)
            .and_then(|index| self.state.source.streams.get(index))
    }

    /// Read until aborted, end of input with autoexit, or a source failure.
    pub fn run(mut self) {
        tracing::debug!(uri = %self.state.source.uri, "read loop started");
        loop {
            if self.state.is_abort_requested() {
                break;
            }

            self.handle_pause_change();
            if self.state.is_paused() && self.source.needs_pause_polling() {
                thread::sleep(READ_WAIT);
                continue;
            }

            if let Some(target) = self.state.seek.pending() {
                self.handle_seek(target);
            }

            if self.state.take_attachments_request() {
                self.queue_attachments();
            }

            if self.is_backpressured() {
                self.state.wakeup.wait_timeout(READ_WAIT);
                continue;
            }

            if self.playback_drained() {
                if self.state.consume_loop() {
                    let start = self.state.config.start_time.map_or(0, from_seconds);
                    tracing::debug!(start, remaining = self.state.loop_count(), "looping");
                    self.state.seek.request(SeekTarget {
                        pos: start,
                        rel: 0,
                        by_bytes: false,
                    });
                } else if self.state.config.autoexit {
                    self.state.post_quit(QuitReason::EndOfStream);
                    break;
                }
            }

            match self.source.read_packet() {
                Ok(packet) => {
                    self.state.set_eof(false);
                    self.state.set_read_position(self.source.byte_position());
                    self.route(packet);
                }
                Err(DemuxError::Eof) => {
                    if !self.state.is_eof() {
                        self.signal_end_of_stream();
                    }
                    self.state.wakeup.wait_timeout(READ_WAIT);
                }
                Err(DemuxError::Interrupted) => break,
                Err(err) => {
                    tracing::error!(error = %err, uri = %self.state.source.uri, "read failed");
                    self.state.post_quit(QuitReason::Error(err.to_string()));
                    break;
                }
            }
        }
        tracing::debug!("read loop stopped");
    }

    fn handle_pause_change(&mut self) {
        let paused = self.state.is_paused();
        if paused == self.last_paused {
            return;
        }
        self.last_paused = paused;
        let result = if paused {
            self.source.read_pause()
        } else {
            self.source.read_play()
        };
        match result {
            Ok(()) => {
                if paused {
                    self.state.set_read_pause_unsupported(false);
                }
            }
            Err(DemuxError::Unsupported) => {
                if paused {
                    self.state.set_read_pause_unsupported(true);
                }
            }
            Err(err) => tracing::warn!(error = %err, paused, "source pause change failed"),
        }
    }

    fn handle_seek(&mut self, target: SeekTarget) {
        let spec = SeekSpec::new(target.pos, target.rel, target.by_bytes);
        match self.source.seek(spec) {
            Ok(()) => self.restart_generation(&target),
            Err(err) => {
                tracing::error!(error = %err, uri = %self.state.source.uri, "error while seeking");
            }
        }
        self.state.request_attachments();
        self.state.set_eof(false);
        if self.state.is_paused() {
            self.state.request_step();
        }
        self.state.seek.complete();
    }

    /// Flush the open streams' queues into a new generation and anchor the
    /// clocks at the seek target (unknown after a byte seek).
    fn restart_generation(&self, target: &SeekTarget) {
        let state = &self.state;
        let anchor = if target.by_bytes {
            f64::NAN
        } else {
            to_seconds(target.pos)
        };
        for kind in MediaKind::PLAYABLE {
            let Some(queue) = state.packet_queue(kind).filter(|_| state.has_stream(kind)) else {
                continue;
            };
            queue.flush();
            let _ = queue.put_flush();
            match kind {
                MediaKind::Video => state.vidclk.set(anchor, queue.serial()),
                MediaKind::Audio => state.audclk.set(anchor, queue.serial()),
                _ => {}
            }
        }
        state.extclk.set(anchor, 0);
        tracing::debug!(pos = target.pos, rel = target.rel, by_bytes = target.by_bytes, "seek done");
    }

    fn queue_attachments(&self) {
        let Some(stream) = self.open_stream(MediaKind::Video) else {
            return;
        };
        let Some(picture) = stream.attached_pic.clone() else {
            return;
        };
        let index = stream.index;
        let queue = &self.state.videoq;
        if queue.put(picture).is_ok() {
            let _ = queue.put_null(index);
            tracing::trace!(stream = index, "queued attached picture");
        }
    }

    fn is_backpressured(&self) -> bool {
        let state = &self.state;
        if state.infinite_buffer() {
            return false;
        }
        let total = state.audioq.size() + state.videoq.size() + state.subtitleq.size();
        if total > MAX_QUEUE_SIZE {
            return true;
        }
        let min_frames = state.config.min_frames;
        has_enough_packets(&state.audioq, self.open_stream(MediaKind::Audio), min_frames)
            && has_enough_packets(&state.videoq, self.open_stream(MediaKind::Video), min_frames)
            && has_enough_packets(&state.subtitleq, self.open_stream(MediaKind::Subtitle), min_frames)
    }

    /// Every open audio/video decoder drained the current generation and
    /// everything decoded was consumed.
    fn playback_drained(&self) -> bool {
        let state = &self.state;
        if state.is_paused() {
            return false;
        }
        let drained = |kind: MediaKind, remaining: usize| match state.stream(kind) {
            Some(slot) if slot.index().is_some() => {
                let serial = state.packet_queue(kind).map_or(-1, |queue| queue.serial());
                slot.status.is_finished_at(serial) && remaining == 0
            }
            _ => true,
        };
        drained(MediaKind::Audio, state.sampq.nb_remaining()) && drained(MediaKind::Video, state.pictq.nb_remaining())
    }

    /// Queue one end-of-stream marker per open stream.
    fn signal_end_of_stream(&self) {
        for kind in MediaKind::PLAYABLE {
            if let (Some(index), Some(queue)) = (self.state.stream_index(kind), self.state.packet_queue(kind)) {
                let _ = queue.put_null(index);
            }
        }
        self.state.set_eof(true);
        tracing::debug!("end of input");
    }

    fn route(&self, packet: Packet) {
        let state = &self.state;
        let Some(stream) = state.source.streams.get(packet.stream_index) else {
            return;
        };
        if !in_play_range(&packet, stream, state.config.start_time, state.config.duration) {
            return;
        }
        let kind = stream.kind;
        if state.stream_index(kind) != Some(packet.stream_index) {
            return;
        }
        if kind == MediaKind::Video && stream.is_attached_pic() {
            return;
        }
        if let Some(queue) = state.packet_queue(kind) {
            // a closed or closing stream's queue is aborted; the packet is dropped
            let _ = queue.put(packet);
        }
    }
}
