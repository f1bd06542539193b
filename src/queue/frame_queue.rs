//! Fixed-capacity ring of decoded frames between one decode worker and one
//! presenting consumer.
//!
//! With `keep_last` the most recently shown frame stays resident after
//! [`FrameQueue::next`] so the presenter can redisplay it (pause, window
//! refresh) and so its byte position stays available for byte seeking.
//!
//! Blocking waits are tied to the owning [`PacketQueue`]: aborting that
//! queue and then calling [`FrameQueue::signal`] releases every waiter.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::packet_queue::PacketQueue;
use crate::core::Seconds;

/// A decoded frame plus the timing metadata the scheduler works with.
#[derive(Debug, Clone)]
pub struct Frame<T> {
    /// Generation of the packet this frame was decoded from.
    pub serial: i32,
    /// Presentation time in seconds, `NaN` if unknown.
    pub pts: Seconds,
    /// Estimated display duration in seconds.
    pub duration: Seconds,
    /// Byte position of the source packet, -1 if unknown.
    pub pos: i64,
    /// Set by the sink once the payload has been uploaded for display.
    pub uploaded: bool,
    pub payload: T,
}

impl<T> Frame<T> {
    pub fn new(payload: T, serial: i32, pts: Seconds, duration: Seconds, pos: i64) -> Self {
        Self {
            serial,
            pts,
            duration,
            pos,
            uploaded: false,
            payload,
        }
    }

    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            serial: self.serial,
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
        }
    }
}

/// Copyable view of a frame's timing fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub serial: i32,
    pub pts: Seconds,
    pub duration: Seconds,
    pub pos: i64,
}

struct Ring<T> {
    slots: Vec<Option<Frame<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: bool,
}

pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    capacity: usize,
    keep_last: bool,
}

/// A reserved writable slot. Only the single producer holds one.
pub struct WriteSlot<'a, T> {
    queue: &'a FrameQueue<T>,
}

impl<'a, T> WriteSlot<'a, T> {
    /// Commit `frame` into the reserved slot and make it readable.
    pub fn push(self, frame: Frame<T>) {
        let queue = self.queue;
        let mut ring = queue.ring.lock();
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % queue.capacity;
        ring.size += 1;
        queue.cond.notify_one();
    }
}

impl<T> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, capacity: usize, keep_last: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: false,
            }),
            cond: Condvar::new(),
            pktq,
            capacity,
            keep_last,
        }
    }

    /// Block until a slot is free. `None` once the packet queue is aborted.
    pub fn peek_writable(&self) -> Option<WriteSlot<'_, T>> {
        let mut ring = self.ring.lock();
        while ring.size >= self.capacity && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        Some(WriteSlot { queue: self })
    }

    /// Wait for a free slot and push `frame` into it. Returns false (dropping
    /// the frame) once aborted.
    pub fn push(&self, frame: Frame<T>) -> bool {
        match self.peek_writable() {
            Some(slot) => {
                slot.push(frame);
                true
            }
            None => false,
        }
    }

    /// Block until a frame is readable. `None` once aborted.
    pub fn peek_readable(&self) -> Option<FrameMeta> {
        let mut ring = self.ring.lock();
        while Self::remaining(&ring) == 0 && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown as usize) % self.capacity;
        ring.slots[index].as_ref().map(Frame::meta)
    }

    fn remaining(ring: &Ring<T>) -> usize {
        ring.size.saturating_sub(ring.rindex_shown as usize)
    }

    fn slot_at(&self, ring: &Ring<T>, offset: usize) -> usize {
        (ring.rindex + offset) % self.capacity
    }

    /// The next frame to show.
    pub fn peek(&self) -> Option<FrameMeta> {
        self.with_peek(|frame| frame.meta())
    }

    /// The frame after [`peek`](Self::peek).
    pub fn peek_next(&self) -> Option<FrameMeta> {
        self.with_peek_next(|frame| frame.meta())
    }

    /// The last shown frame (or the next one if nothing was shown yet).
    pub fn peek_last(&self) -> Option<FrameMeta> {
        self.with_last(|frame| frame.meta())
    }

    pub fn with_peek<R>(&self, f: impl FnOnce(&mut Frame<T>) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        if Self::remaining(&ring) == 0 {
            return None;
        }
        let index = self.slot_at(&ring, ring.rindex_shown as usize);
        ring.slots[index].as_mut().map(f)
    }

    pub fn with_peek_next<R>(&self, f: impl FnOnce(&mut Frame<T>) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        if Self::remaining(&ring) < 2 {
            return None;
        }
        let index = self.slot_at(&ring, ring.rindex_shown as usize + 1);
        ring.slots[index].as_mut().map(f)
    }

    pub fn with_last<R>(&self, f: impl FnOnce(&mut Frame<T>) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        let index = ring.rindex;
        ring.slots[index].as_mut().map(f)
    }

    /// Advance past the current frame. With `keep_last`, the first advance
    /// only marks the frame as shown and keeps it resident.
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && !ring.rindex_shown {
            ring.rindex_shown = true;
            return;
        }
        if ring.size == 0 {
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.capacity;
        ring.size -= 1;
        // nothing left to keep as "last shown"
        if ring.size == 0 {
            ring.rindex_shown = false;
        }
        self.cond.notify_one();
    }

    /// Wake any waiter so it can observe an abort.
    pub fn signal(&self) {
        let _ring = self.ring.lock();
        self.cond.notify_all();
    }

    /// Frames not yet shown.
    pub fn nb_remaining(&self) -> usize {
        Self::remaining(&self.ring.lock())
    }

    /// Whether the frame at the read index has been shown.
    pub fn is_last_shown(&self) -> bool {
        self.ring.lock().rindex_shown
    }

    /// Byte position of the last shown frame if it belongs to the current
    /// generation.
    pub fn last_pos(&self) -> Option<i64> {
        let ring = self.ring.lock();
        if !ring.rindex_shown {
            return None;
        }
        ring.slots[ring.rindex]
            .as_ref()
            .filter(|frame| frame.serial == self.pktq.serial() && frame.pos >= 0)
            .map(|frame| frame.pos)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keep_last(&self) -> bool {
        self.keep_last
    }

    pub fn packet_queue(&self) -> &Arc<PacketQueue> {
        &self.pktq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn started_queue() -> Arc<PacketQueue> {
        let pktq = Arc::new(PacketQueue::new());
        pktq.start();
        pktq
    }

    fn frame(pts: f64, serial: i32) -> Frame<u32> {
        Frame::new(pts as u32, serial, pts, 0.04, (pts * 100.0) as i64)
    }

    #[test]
    fn test_keep_last_retains_shown_frame() {
        let fq = FrameQueue::new(started_queue(), 3, true);
        assert!(fq.push(frame(1.0, 1)));

        assert_eq!(fq.peek_last().map(|m| m.pts), Some(1.0));
        fq.next();
        // shown but still resident
        assert_eq!(fq.nb_remaining(), 0);
        assert!(fq.is_last_shown());
        assert_eq!(fq.peek_last().map(|m| m.pts), Some(1.0));

        fq.next();
        assert_eq!(fq.peek_last(), None);
        assert_eq!(fq.nb_remaining(), 0);
        assert!(!fq.is_last_shown());
    }

    #[test]
    fn test_refill_after_reclaiming_last_shown() {
        let fq = FrameQueue::new(started_queue(), 3, true);
        fq.push(frame(1.0, 1));
        fq.next();
        fq.next();

        fq.push(frame(2.0, 1));
        assert_eq!(fq.nb_remaining(), 1);
        assert_eq!(fq.peek().map(|m| m.pts), Some(2.0));
        assert_eq!(fq.peek_readable().map(|m| m.pts), Some(2.0));
    }

    #[test]
    fn test_abort_releases_blocked_writer() {
        let pktq = started_queue();
        let fq = Arc::new(FrameQueue::new(Arc::clone(&pktq), 1, true));
        fq.push(frame(1.0, 1));

        let writer = {
            let fq = Arc::clone(&fq);
            thread::spawn(move || fq.peek_writable().is_some())
        };
        thread::sleep(Duration::from_millis(20));
        pktq.abort();
        fq.signal();
        assert!(!writer.join().unwrap());
        assert_eq!(fq.nb_remaining(), 1);
    }

    #[test]
    fn test_without_keep_last_next_reclaims() {
        let fq = FrameQueue::new(started_queue(), 4, false);
        fq.push(frame(1.0, 1));
        fq.push(frame(2.0, 1));
        assert_eq!(fq.nb_remaining(), 2);
        fq.next();
        assert_eq!(fq.nb_remaining(), 1);
        assert_eq!(fq.peek().map(|m| m.pts), Some(2.0));
        assert!(!fq.is_last_shown());
    }

    #[test]
    fn test_peek_and_peek_next_skip_shown() {
        let fq = FrameQueue::new(started_queue(), 3, true);
        fq.push(frame(1.0, 1));
        fq.push(frame(2.0, 1));
        fq.push(frame(3.0, 1));
        fq.next();

        assert_eq!(fq.peek_last().map(|m| m.pts), Some(1.0));
        assert_eq!(fq.peek().map(|m| m.pts), Some(2.0));
        assert_eq!(fq.peek_next().map(|m| m.pts), Some(3.0));
        assert_eq!(fq.nb_remaining(), 2);
    }

    #[test]
    fn test_last_pos_requires_current_serial() {
        let pktq = started_queue();
        let fq = FrameQueue::new(Arc::clone(&pktq), 3, true);
        fq.push(frame(2.0, pktq.serial()));
        assert_eq!(fq.last_pos(), None);
        fq.next();
        assert_eq!(fq.last_pos(), Some(200));

        pktq.put_flush().unwrap();
        assert_eq!(fq.last_pos(), None);
    }

    #[test]
    fn test_full_queue_blocks_writer_until_next() {
        let fq = Arc::new(FrameQueue::new(started_queue(), 1, false));
        fq.push(frame(1.0, 1));

        let writer = {
            let fq = Arc::clone(&fq);
            thread::spawn(move || fq.push(frame(2.0, 1)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fq.nb_remaining(), 1);
        fq.next();
        assert!(writer.join().unwrap());
        assert_eq!(fq.peek().map(|m| m.pts), Some(2.0));
    }

    #[test]
    fn test_abort_releases_reader() {
        let pktq = started_queue();
        let fq = Arc::new(FrameQueue::<u32>::new(Arc::clone(&pktq), 2, true));

        let reader = {
            let fq = Arc::clone(&fq);
            thread::spawn(move || fq.peek_readable())
        };
        thread::sleep(Duration::from_millis(20));
        pktq.abort();
        fq.signal();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn test_with_last_gives_payload_access() {
        let fq = FrameQueue::new(started_queue(), 2, true);
        fq.push(frame(5.0, 1));
        fq.next();
        let payload = fq.with_last(|f| {
            f.uploaded = true;
            f.payload
        });
        assert_eq!(payload, Some(5));
        assert_eq!(fq.with_last(|f| f.uploaded), Some(true));
    }
}
