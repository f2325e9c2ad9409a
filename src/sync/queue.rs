//! Per-peer pending queues with time/count backpressure.
//!
//! A flush fires when either threshold is crossed: time since the last
//! flush exceeds `sync_delta`, or the queue has grown past `sync_max`
//! operations. A flush resets both. The queue itself is bounded; losing
//! ops to overflow flags the peer for a full-snapshot handshake, which
//! resends everything the dropped deltas carried.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::model::op::Op;

/// Queue bound as a multiple of `sync_max`.
const OVERFLOW_FACTOR: usize = 8;

#[derive(Debug)]
pub struct PendingQueue {
    ops: VecDeque<Op>,
    sync_delta: Duration,
    sync_max: usize,
    last_flush: Instant,
    overflowed: bool,
    dropped: u64,
}

impl PendingQueue {
    pub fn new(sync_delta: Duration, sync_max: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            sync_delta,
            sync_max: sync_max.max(1),
            last_flush: Instant::now(),
            overflowed: false,
            dropped: 0,
        }
    }

    pub fn push(&mut self, op: Op) {
        if self.ops.len() >= self.sync_max * OVERFLOW_FACTOR {
            // Shed the oldest; the snapshot handshake will cover it.
            self.ops.pop_front();
            self.overflowed = true;
            self.dropped += 1;
        }
        self.ops.push_back(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// True when either threshold has been crossed.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.ops.len() > self.sync_max {
            return true;
        }
        !self.ops.is_empty() && now.duration_since(self.last_flush) > self.sync_delta
    }

    /// Take everything queued and reset both thresholds.
    pub fn drain(&mut self, now: Instant) -> Vec<Op> {
        self.last_flush = now;
        self.ops.drain(..).collect()
    }

    /// Put back ops a failed or cancelled send did not deliver; they go
    /// out on reconnect.
    pub fn requeue_front(&mut self, ops: Vec<Op>) {
        for op in ops.into_iter().rev() {
            self.ops.push_front(op);
        }
    }

    /// Overflow happened since the last snapshot handshake.
    pub fn needs_snapshot(&self) -> bool {
        self.overflowed
    }

    pub fn mark_snapshot_sent(&mut self) {
        self.overflowed = false;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
