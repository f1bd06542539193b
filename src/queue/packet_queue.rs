//! Thread-safe FIFO of compressed packets with a generation counter.
//!
//! Every entry is stamped with the queue's serial at enqueue time. A flush
//! sentinel bumps the serial, so consumers can tell packets of an older
//! generation (before a seek or stream switch) from current ones. The queue
//! starts aborted; [`PacketQueue::start`] opens it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{Condvar, Mutex};

use super::packet::{Packet, QueueItem, QueuedPacket};

/// Per-entry bookkeeping overhead counted into the byte size.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<QueuedPacket>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue aborted")]
    Aborted,
}

/// Snapshot of the queue's aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub nb_packets: usize,
    /// Payload bytes plus per-entry overhead.
    pub size: usize,
    /// Sum of packet durations, stream time base.
    pub duration: i64,
}

#[derive(Debug)]
struct QueueState {
    entries: VecDeque<QueuedPacket>,
    stats: QueueStats,
    serial: i32,
    abort_request: bool,
}

#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    // Mirrors for lock-free readers (clocks, frame queues).
    serial: AtomicI32,
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                stats: QueueStats::default(),
                serial: 0,
                abort_request: true,
            }),
            cond: Condvar::new(),
            serial: AtomicI32::new(0),
            aborted: AtomicBool::new(true),
        }
    }

    fn push_locked(&self, state: &mut QueueState, item: QueueItem) -> Result<(), QueueError> {
        if state.abort_request {
            return Err(QueueError::Aborted);
        }
        if matches!(item, QueueItem::Flush) {
            state.serial += 1;
            self.serial.store(state.serial, Ordering::Release);
        }
        let (size, duration) = match &item {
            QueueItem::Packet(packet) => (packet.size(), packet.duration),
            QueueItem::Flush => (0, 0),
        };
        state.entries.push_back(QueuedPacket {
            item,
            serial: state.serial,
        });
        state.stats.nb_packets += 1;
        state.stats.size += size + ENTRY_OVERHEAD;
        state.stats.duration += duration;
        self.cond.notify_one();
        Ok(())
    }

    /// Enqueue a packet under the current generation. Fails (dropping the
    /// packet) once the queue is aborted.
    pub fn put(&self, packet: Packet) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.push_locked(&mut state, QueueItem::Packet(packet))
    }

    /// Enqueue the end-of-stream marker for `stream_index`.
    pub fn put_null(&self, stream_index: usize) -> Result<(), QueueError> {
        self.put(Packet::null(stream_index))
    }

    /// Start a new generation and enqueue the flush sentinel.
    pub fn put_flush(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.push_locked(&mut state, QueueItem::Flush)
    }

    /// Clear the abort flag and begin a fresh generation.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.abort_request = false;
        self.aborted.store(false, Ordering::Release);
        // Cannot fail: abort was just cleared under the same lock.
        let _ = self.push_locked(&mut state, QueueItem::Flush);
        tracing::trace!(serial = state.serial, "packet queue started");
    }

    /// Wake every waiter and make all further puts and gets fail.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.abort_request = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Drop every queued entry. The serial is left unchanged.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.stats = QueueStats::default();
    }

    /// Dequeue the oldest entry.
    ///
    /// Returns `Ok(None)` when empty and `block` is false. When `block` is
    /// true, waits until an entry arrives or the queue is aborted.
    pub fn get(&self, block: bool) -> Result<Option<QueuedPacket>, QueueError> {
        let mut state = self.state.lock();
        loop {
            if state.abort_request {
                return Err(QueueError::Aborted);
            }
            if let Some(entry) = state.entries.pop_front() {
                let (size, duration) = match &entry.item {
                    QueueItem::Packet(packet) => (packet.size(), packet.duration),
                    QueueItem::Flush => (0, 0),
                };
                state.stats.nb_packets -= 1;
                state.stats.size -= size + ENTRY_OVERHEAD;
                state.stats.duration -= duration;
                return Ok(Some(entry));
            }
            if !block {
                return Ok(None);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Current generation.
    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    pub fn nb_packets(&self) -> usize {
        self.state.lock().stats.nb_packets
    }

    pub fn size(&self) -> usize {
        self.state.lock().stats.size
    }

    pub fn duration(&self) -> i64 {
        self.state.lock().stats.duration
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn data_packet(len: usize, duration: i64) -> Packet {
        Packet::new(0, vec![0u8; len]).with_duration(duration)
    }

    #[test]
    fn test_new_queue_is_aborted() {
        let queue = PacketQueue::new();
        assert!(queue.is_aborted());
        assert_eq!(queue.put(data_packet(4, 1)), Err(QueueError::Aborted));
        assert_eq!(queue.get(false), Err(QueueError::Aborted));
    }

    #[test]
    fn test_start_enqueues_flush_and_bumps_serial() {
        let queue = PacketQueue::new();
        queue.start();
        assert_eq!(queue.serial(), 1);
        assert_eq!(queue.nb_packets(), 1);
        let entry = queue.get(false).unwrap().unwrap();
        assert!(entry.is_flush());
        assert_eq!(entry.serial, 1);
    }

    #[test]
    fn test_fifo_order_and_serial_stamps() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put(data_packet(1, 10).with_pts(1)).unwrap();
        queue.put_flush().unwrap();
        queue.put(data_packet(1, 10).with_pts(2)).unwrap();

        let stamps: Vec<(bool, i32)> = std::iter::from_fn(|| queue.get(false).unwrap())
            .map(|entry| (entry.is_flush(), entry.serial))
            .collect();
        assert_eq!(stamps, vec![(true, 1), (false, 1), (true, 2), (false, 2)]);
    }

    #[test]
    fn test_counters_return_to_zero() {
        let queue = PacketQueue::new();
        queue.start();
        queue.get(false).unwrap();
        queue.put(data_packet(100, 40)).unwrap();
        queue.put(data_packet(50, 20)).unwrap();
        let stats = queue.stats();
        assert_eq!(stats.nb_packets, 2);
        assert_eq!(stats.size, 150 + 2 * ENTRY_OVERHEAD);
        assert_eq!(stats.duration, 60);

        while queue.get(false).unwrap().is_some() {}
        assert_eq!(queue.stats(), QueueStats::default());
    }

    #[test]
    fn test_flush_keeps_serial() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put(data_packet(10, 1)).unwrap();
        queue.flush();
        assert_eq!(queue.nb_packets(), 0);
        assert_eq!(queue.serial(), 1);
    }

    #[test]
    fn test_restart_after_abort() {
        let queue = PacketQueue::new();
        queue.start();
        queue.abort();
        assert!(queue.put_null(0).is_err());
        queue.flush();
        queue.start();
        assert_eq!(queue.serial(), 2);
        assert!(queue.put_null(0).is_ok());
    }

    #[test]
    fn test_repeated_abort_matches_single_abort() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put(data_packet(8, 4)).unwrap();

        queue.abort();
        let once = (queue.is_aborted(), queue.serial(), queue.stats());
        queue.abort();
        assert_eq!((queue.is_aborted(), queue.serial(), queue.stats()), once);
        assert_eq!(queue.put(data_packet(1, 1)), Err(QueueError::Aborted));
        assert_eq!(queue.get(true), Err(QueueError::Aborted));
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.get(false).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(true))
        };
        thread::sleep(Duration::from_millis(20));
        queue.put(data_packet(3, 1).with_pts(7)).unwrap();

        let entry = consumer.join().unwrap().unwrap().unwrap();
        assert_eq!(entry.packet().and_then(|p| p.pts), Some(7));
    }

    #[test]
    fn test_abort_wakes_blocked_getter() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        queue.get(false).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(true))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Aborted));
    }
}
