//! Playback clocks.
//!
//! A clock is anchored at a (pts, wall time) pair and extrapolates at its
//! speed. It is tagged with the generation of the packets its pts came from;
//! once the watched packet queue moves to a newer generation the clock reads
//! `NaN` until it is re-anchored.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{now, Seconds};
use crate::queue::PacketQueue;

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: Seconds,
    /// pts - last_updated
    pts_drift: Seconds,
    last_updated: Seconds,
    speed: f64,
    serial: i32,
    paused: bool,
}

/// Everything a clock reports, captured under one lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub pts: Seconds,
    pub last_updated: Seconds,
    pub speed: f64,
    pub serial: i32,
    pub paused: bool,
}

#[derive(Debug)]
pub struct Clock {
    state: Mutex<ClockState>,
    /// The queue whose generation this clock follows. `None` follows itself.
    queue: Option<Arc<PacketQueue>>,
}

impl Clock {
    /// A clock following `queue`'s generation, or its own when `None`.
    pub fn new(queue: Option<Arc<PacketQueue>>) -> Self {
        let clock = Self {
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: 0.0,
                speed: 1.0,
                serial: -1,
                paused: false,
            }),
            queue,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    fn queue_serial(&self, state: &ClockState) -> i32 {
        match &self.queue {
            Some(queue) => queue.serial(),
            None => state.serial,
        }
    }

    fn read(&self, state: &ClockState, time: Seconds) -> Seconds {
        if self.queue_serial(state) != state.serial {
            return f64::NAN;
        }
        if state.paused {
            state.pts
        } else {
            state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed)
        }
    }

    /// Current reading, `NaN` if stale or unset.
    pub fn get(&self) -> Seconds {
        self.get_at(now())
    }

    /// Reading at wall time `time`.
    pub fn get_at(&self, time: Seconds) -> Seconds {
        let state = self.state.lock();
        self.read(&state, time)
    }

    pub fn set(&self, pts: Seconds, serial: i32) {
        self.set_at(pts, serial, now());
    }

    pub fn set_at(&self, pts: Seconds, serial: i32, time: Seconds) {
        let mut state = self.state.lock();
        Self::anchor(&mut state, pts, serial, time);
    }

    fn anchor(state: &mut ClockState, pts: Seconds, serial: i32, time: Seconds) {
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
    }

    /// Change speed without a discontinuity: re-anchor at the current
    /// reading first, in one critical section.
    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, now());
    }

    pub fn set_speed_at(&self, speed: f64, time: Seconds) {
        let mut state = self.state.lock();
        let current = self.read(&state, time);
        let serial = state.serial;
        Self::anchor(&mut state, current, serial, time);
        state.speed = speed;
    }

    /// Re-anchor at the current reading, keeping the serial. Used when
    /// pausing or resuming so elapsed paused time does not count.
    pub fn reanchor(&self) {
        self.reanchor_at(now());
    }

    pub fn reanchor_at(&self, time: Seconds) {
        let mut state = self.state.lock();
        let current = self.read(&state, time);
        let serial = state.serial;
        Self::anchor(&mut state, current, serial, time);
    }

    /// Copy `slave`'s reading when this clock is unset or has drifted from it
    /// by more than the no-sync threshold.
    pub fn sync_to_slave(&self, slave: &Clock, no_sync_threshold: f64) {
        self.sync_to_slave_at(slave, no_sync_threshold, now());
    }

    pub fn sync_to_slave_at(&self, slave: &Clock, no_sync_threshold: f64, time: Seconds) {
        let (slave_reading, slave_serial) = {
            let state = slave.state.lock();
            (slave.read(&state, time), state.serial)
        };
        let mut state = self.state.lock();
        let reading = self.read(&state, time);
        if !slave_reading.is_nan()
            && (reading.is_nan() || (reading - slave_reading).abs() > no_sync_threshold)
        {
            Self::anchor(&mut state, slave_reading, slave_serial, time);
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// The raw anchored pts, without extrapolation.
    pub fn pts(&self) -> Seconds {
        self.state.lock().pts
    }

    pub fn serial(&self) -> i32 {
        self.state.lock().serial
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn last_updated(&self) -> Seconds {
        self.state.lock().last_updated
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let state = self.state.lock();
        ClockSnapshot {
            pts: state.pts,
            last_updated: state.last_updated,
            speed: state.speed,
            serial: state.serial,
            paused: state.paused,
        }
    }
}
