//! Hybrid logical clock used to version records for last-writer-wins merges.
//!
//! A stamp packs wall-clock milliseconds into the high 48 bits and a logical counter
//! into the low 16 bits, so stamps stay comparable across machines with skewed clocks:
//! a node that observes a remote stamp never issues a smaller one afterwards.

use std::sync::Mutex;

const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<u64>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new stamp, strictly greater than every stamp issued or observed so far.
    pub fn now(&self) -> u64 {
        let wall = wall_stamp();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = if wall > *last { wall } else { *last + 1 };
        *last = next;
        next
    }

    /// Fold a stamp seen on another node into the local clock.
    pub fn observe(&self, remote: u64) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if remote > *last {
            *last = remote;
        }
    }
}

/// Wall-clock milliseconds of a stamp.
pub fn stamp_millis(stamp: u64) -> u64 {
    stamp >> COUNTER_BITS
}

/// Logical counter of a stamp.
pub fn stamp_counter(stamp: u64) -> u64 {
    stamp & COUNTER_MASK
}

fn wall_stamp() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    millis << COUNTER_BITS
}
