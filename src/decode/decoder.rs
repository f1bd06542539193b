//! Generation-aware decoder driving a [`Codec`] from a [`PacketQueue`].
//!
//! `decode_next` pulls packets, discards those of older generations, resets
//! the codec on flush sentinels and keeps at most one packet pending when the
//! codec refuses input. End of stream is recorded per generation in
//! [`DecoderStatus`] and stays set until the next flush.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use super::codec::{Codec, CodecError, Received, SendStatus};
use super::frame::DecodedFrame;
use crate::core::time::rescale;
use crate::core::{MediaKind, Rational};
use crate::queue::{Packet, PacketQueue, QueueItem, ReadWakeup};

/// Error type for decoding operations
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder aborted")]
    Aborted,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What one `decode_next` call produced.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(DecodedFrame),
    /// The codec drained for the current generation.
    Eof,
}

/// Decoder progress visible to the read loop and the scheduler.
#[derive(Debug)]
pub struct DecoderStatus {
    finished: AtomicI32,
    pkt_serial: AtomicI32,
}

impl DecoderStatus {
    pub fn new() -> Self {
        Self {
            finished: AtomicI32::new(0),
            pkt_serial: AtomicI32::new(-1),
        }
    }

    /// Generation at which the decoder hit end of stream, 0 if it has not.
    pub fn finished(&self) -> i32 {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the decoder drained the generation `serial`.
    pub fn is_finished_at(&self, serial: i32) -> bool {
        let finished = self.finished();
        finished != 0 && finished == serial
    }

    /// Generation of the packet most recently taken from the queue.
    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial.load(Ordering::Acquire)
    }

    pub(crate) fn set_finished(&self, serial: i32) {
        self.finished.store(serial, Ordering::Release);
    }

    pub fn reset(&self) {
        self.finished.store(0, Ordering::Release);
        self.pkt_serial.store(-1, Ordering::Release);
    }
}

impl Default for DecoderStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Decoder {
    codec: Box<dyn Codec>,
    kind: MediaKind,
    queue: Arc<PacketQueue>,
    wakeup: Arc<ReadWakeup>,
    status: Arc<DecoderStatus>,
    pkt_serial: i32,
    pending: Option<Packet>,
    /// Time base of the packets fed to the codec.
    time_base: Rational,
    reorder_pts: Option<bool>,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
}

impl Decoder {
    pub fn new(
        codec: Box<dyn Codec>,
        queue: Arc<PacketQueue>,
        wakeup: Arc<ReadWakeup>,
        status: Arc<DecoderStatus>,
        time_base: Rational,
    ) -> Self {
        status.reset();
        let kind = codec.kind();
        Self {
            codec,
            kind,
            queue,
            wakeup,
            status,
            pkt_serial: -1,
            pending: None,
            time_base,
            reorder_pts: None,
            start_pts: None,
            start_pts_tb: Rational::UNDEFINED,
            next_pts: None,
            next_pts_tb: Rational::UNDEFINED,
        }
    }

    /// `None` uses the best-effort timestamp, `Some(true)` the frame pts and
    /// `Some(false)` the packet dts.
    pub fn with_reorder_pts(mut self, reorder_pts: Option<bool>) -> Self {
        self.reorder_pts = reorder_pts;
        self
    }

    /// Timestamp to restart audio extrapolation from after a flush, for
    /// sources whose packets may lack timestamps after seeking.
    pub fn with_start_pts(mut self, start_pts: Option<i64>, time_base: Rational) -> Self {
        self.start_pts = start_pts;
        self.start_pts_tb = time_base;
        self.next_pts = start_pts;
        self.next_pts_tb = time_base;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Generation of the packet that produced the last output.
    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn status(&self) -> &Arc<DecoderStatus> {
        &self.status
    }

    fn mark_finished(&mut self) {
        self.status.set_finished(self.pkt_serial);
        self.codec.flush();
        tracing::debug!(kind = %self.kind, serial = self.pkt_serial, "decoder reached end of stream");
    }

    /// Produce the next frame of the current generation.
    pub fn decode_next(&mut self) -> Result<DecodeOutcome, DecodeError> {
        loop {
            if self.kind != MediaKind::Subtitle && self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return Err(DecodeError::Aborted);
                    }
                    match self.codec.receive_frame()? {
                        Received::Frame(frame) => return Ok(DecodeOutcome::Frame(self.stamp(frame))),
                        Received::Eof => {
                            self.mark_finished();
                            return Ok(DecodeOutcome::Eof);
                        }
                        Received::Again => break,
                    }
                }
            }

            match self.next_item()? {
                QueueItem::Flush => {
                    self.codec.flush();
                    self.status.set_finished(0);
                    self.next_pts = self.start_pts;
                    self.next_pts_tb = self.start_pts_tb;
                    tracing::trace!(kind = %self.kind, serial = self.pkt_serial, "decoder flushed");
                }
                QueueItem::Packet(packet) if self.kind == MediaKind::Subtitle => {
                    match self.codec.decode_subtitle(&packet) {
                        Ok(Some(subtitle)) => {
                            if packet.is_null() {
                                // keep draining on the next call
                                self.pending = Some(packet);
                            }
                            return Ok(DecodeOutcome::Frame(DecodedFrame::Subtitle(subtitle)));
                        }
                        Ok(None) if packet.is_null() => {
                            self.mark_finished();
                            return Ok(DecodeOutcome::Eof);
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!(error = %err, "subtitle decode failed"),
                    }
                }
                QueueItem::Packet(packet) => match self.codec.send_packet(&packet) {
                    Ok(SendStatus::Accepted) => {}
                    Ok(SendStatus::Again) => {
                        tracing::error!(
                            kind = %self.kind,
                            "codec refused input while reporting no output; retrying packet"
                        );
                        self.pending = Some(packet);
                    }
                    Err(err) => tracing::warn!(kind = %self.kind, error = %err, "send_packet failed"),
                },
            }
        }
    }

    /// Next queue item of the current generation, blocking.
    fn next_item(&mut self) -> Result<QueueItem, DecodeError> {
        loop {
            if self.queue.nb_packets() == 0 {
                self.wakeup.notify_room();
            }
            let item = match self.pending.take() {
                Some(packet) => QueueItem::Packet(packet),
                None => {
                    let entry = match self.queue.get(true) {
                        Ok(Some(entry)) => entry,
                        Ok(None) => continue,
                        Err(_) => return Err(DecodeError::Aborted),
                    };
                    self.pkt_serial = entry.serial;
                    self.status.pkt_serial.store(entry.serial, Ordering::Release);
                    entry.item
                }
            };
            if self.queue.serial() == self.pkt_serial {
                return Ok(item);
            }
            tracing::trace!(kind = %self.kind, serial = self.pkt_serial, "discarding stale packet");
        }
    }

    fn stamp(&mut self, frame: DecodedFrame) -> DecodedFrame {
        match frame {
            DecodedFrame::Video(mut picture) => {
                picture.pts = match self.reorder_pts {
                    None => picture.best_effort_timestamp,
                    Some(true) => picture.frame_pts,
                    Some(false) => picture.pkt_dts,
                };
                DecodedFrame::Video(picture)
            }
            DecodedFrame::Audio(mut samples) => {
                let rate = samples.format.sample_rate as i32;
                if rate > 0 {
                    let sample_tb = Rational::new(1, rate);
                    let pts = match (samples.pts, self.next_pts) {
                        (Some(pts), _) => Some(rescale(pts, self.time_base, sample_tb)),
                        (None, Some(next)) => Some(rescale(next, self.next_pts_tb, sample_tb)),
                        (None, None) => None,
                    };
                    if let Some(pts) = pts {
                        self.next_pts = Some(pts + samples.nb_samples as i64);
                        self.next_pts_tb = sample_tb;
                    }
                    samples.pts = pts;
                }
                DecodedFrame::Audio(samples)
            }
            other => other,
        }
    }
}
