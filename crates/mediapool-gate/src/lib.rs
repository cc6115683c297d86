//! Weighted admission gate bounding total concurrent slot usage.
//!
//! An ordinary counting semaphore assumes unit-weight acquisition; transcode
//! jobs that occupy several execution slots at once need weighted admission,
//! and a heavy request must eventually get through even under continuous
//! light-weight traffic.
//!
//! The gate tracks two things: a logical count of slots currently
//! requested-or-held, and a single-permit binary gate that acquirers block on
//! once the logical count reaches capacity. The counter is only ever touched
//! under a short-lived lock that is *not* held across the blocking wait, so a
//! slow acquirer never blocks unrelated releases.
//!
//! Known caveat, kept deliberately: when acquisitions of differing weight
//! interleave, the logical count can transiently exceed capacity (two heavy
//! requests can both pass before either blocks). The count trends back down
//! as holders release; callers that need a hard ceiling must serialize their
//! own admissions. See `test_overshoot_with_mixed_weights`.

use mediapool_common::Weight;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug)]
struct GateState {
    /// Slots currently requested-or-held. May transiently exceed capacity.
    requested: u64,
    capacity: u64,
}

/// Counting-semaphore-like primitive with weighted acquisition.
///
/// `acquire` and `release` must be called with matching weights; releasing a
/// different weight than was acquired corrupts the accounting.
#[derive(Debug)]
pub struct WeightedGate {
    state: Mutex<GateState>,
    /// Binary gate: holds exactly zero or one permit. Acquired permits are
    /// forgotten; `release` re-adds the permit when it is consumed.
    blocker: Semaphore,
}

impl WeightedGate {
    /// Creates a gate admitting up to `capacity` slots (clamped to >= 1).
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(GateState {
                requested: 0,
                capacity: capacity.max(1) as u64,
            }),
            blocker: Semaphore::new(1),
        }
    }

    /// Creates a gate sized to the host's logical CPU count.
    pub fn with_default_capacity() -> Self {
        Self::new(Self::default_capacity())
    }

    /// Logical CPU count of the host, minimum 1.
    pub fn default_capacity() -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }

    /// Requests admission for `weight` slots.
    ///
    /// The logical count is incremented optimistically; if the post-increment
    /// count reaches capacity the caller blocks on the binary gate, up to
    /// `timeout` (indefinitely when `None`). On timeout the increment is
    /// rolled back and `false` is returned. Never returns an error.
    pub async fn acquire(&self, weight: Weight, timeout: Option<Duration>) -> bool {
        let slots = weight.get() as u64;
        let must_block = {
            let mut state = self.state.lock().unwrap();
            state.requested += slots;
            state.requested >= state.capacity
        };

        if !must_block {
            trace!(weight = %weight, "admitted without blocking");
            return true;
        }

        let admitted = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.blocker.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    true
                }
                // The semaphore is never closed.
                Ok(Err(_)) | Err(_) => false,
            },
            None => match self.blocker.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        };

        if !admitted {
            let mut state = self.state.lock().unwrap();
            state.requested = state.requested.saturating_sub(slots);
        }
        trace!(weight = %weight, admitted, "weighted acquire");
        admitted
    }

    /// Returns `weight` slots to the gate.
    ///
    /// Always hands the binary gate back if it is currently consumed,
    /// regardless of whether this caller was the one that blocked on it;
    /// a release from a non-blocking acquirer is what lets a blocked heavy
    /// request through.
    pub fn release(&self, weight: Weight) {
        let slots = weight.get() as u64;
        let mut state = self.state.lock().unwrap();
        state.requested = state.requested.saturating_sub(slots);
        if self.blocker.available_permits() == 0 {
            self.blocker.add_permits(1);
        }
        trace!(weight = %weight, requested = state.requested, "weighted release");
    }

    /// Current logical slot count (requested-or-held).
    pub fn requested(&self) -> u64 {
        self.state.lock().unwrap().requested
    }

    /// Current capacity.
    pub fn capacity(&self) -> u32 {
        self.state.lock().unwrap().capacity as u32
    }

    /// Updates the capacity (clamped to >= 1).
    ///
    /// Takes effect for subsequent acquisitions only; holders admitted under
    /// the old capacity are unaffected.
    pub fn set_capacity(&self, capacity: u32) {
        let mut state = self.state.lock().unwrap();
        state.capacity = capacity.max(1) as u64;
    }
}
