//! Hybrid logical clock.
//!
//! Generates monotonically increasing stamps that form a total order
//! across all peers. Wall-clock skew below the configured bound is
//! absorbed by the logical counter; skew beyond it is rejected at the
//! sync boundary.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::identity::PeerId;
use crate::core::time::{Stamp, WriteStamp};

/// Default acceptable skew between peers (seconds).
pub const DEFAULT_CLOCK_OFFSET_SECS: f64 = 30.0;

#[derive(Debug)]
struct ClockState {
    wall_ms: u64,
    counter: u32,
}

/// The single source of causal order for a peer.
///
/// Safe under concurrent callers; all state transitions happen under one
/// lock so two threads can never draw the same stamp.
#[derive(Debug)]
pub struct Clock {
    peer: PeerId,
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: Mutex::new(ClockState {
                wall_ms: now_ms(),
                counter: 0,
            }),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Draw a new stamp, advancing the clock.
    ///
    /// Strictly greater than any stamp previously returned by this
    /// clock, even if the wall clock stands still or steps backward.
    pub fn tick(&self) -> Stamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_ms();
        if now > state.wall_ms {
            state.wall_ms = now;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        Stamp::new(
            WriteStamp::new(state.wall_ms, state.counter),
            self.peer.clone(),
        )
    }

    /// Fold in a remote stamp so the next `tick` is greater than it.
    ///
    /// Call on every accepted remote operation.
    pub fn observe(&self, remote: &WriteStamp) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_ms();
        let wall = state.wall_ms.max(now).max(remote.wall_ms);
        if wall == remote.wall_ms && wall == state.wall_ms {
            state.counter = state.counter.max(remote.counter) + 1;
        } else if wall == remote.wall_ms {
            state.counter = remote.counter + 1;
        } else if wall == state.wall_ms {
            state.counter += 1;
        } else {
            state.counter = 0;
        }
        state.wall_ms = wall;
    }

    /// Advance at least to `floor` without producing a stamp.
    ///
    /// Used on warm restart so new writes stamp after everything in the
    /// replayed log.
    pub fn advance_to(&self, floor: &WriteStamp) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = WriteStamp::new(state.wall_ms, state.counter);
        if *floor > current {
            state.wall_ms = floor.wall_ms;
            state.counter = floor.counter;
        }
    }

    /// Absolute skew between a remote wall reading and ours, in
    /// milliseconds.
    pub fn skew_ms(&self, remote_wall_ms: u64) -> u64 {
        now_ms().abs_diff(remote_wall_ms)
    }

    /// True when the remote wall reading lies outside the accepted
    /// offset. Such messages are treated as suspicious and dropped.
    pub fn skew_exceeded(&self, remote_wall_ms: u64, clock_offset_secs: f64) -> bool {
        let bound_ms = (clock_offset_secs * 1_000.0) as u64;
        self.skew_ms(remote_wall_ms) > bound_ms
    }

    /// Current high-water mark without advancing the clock.
    pub fn high_water(&self) -> WriteStamp {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        WriteStamp::new(state.wall_ms, state.counter)
    }
}

/// Wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
