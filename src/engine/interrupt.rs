//! Lock-free interrupt signaling
//!
//! Every call into an environment gets a fresh id from a monotonically
//! increasing counter. A stop request names the call it targets, so a request
//! that races with the call finishing can never leak into the next call.
//!
//! The request word packs `(call << 2) | reason`; the first request recorded
//! against a call wins and later ones are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};

const REASON_BITS: u32 = 2;
const REASON_MASK: u64 = (1 << REASON_BITS) - 1;

/// Why a call was interrupted
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reason {
    /// Explicit `stop()`
    Terminated = 1,
    /// Watchdog deadline expired
    Timeout = 2,
}

impl Reason {
    fn from_bits(bits: u64) -> Option<Reason> {
        match bits & REASON_MASK {
            1 => Some(Reason::Terminated),
            2 => Some(Reason::Timeout),
            _ => None,
        }
    }
}

/// Interrupt state shared by a context, its engine interrupt handler and its
/// watchdog
#[derive(Debug, Default)]
pub(crate) struct InterruptState {
    /// Last call id handed out
    epoch: AtomicU64,
    /// Id of the in-flight call, 0 when idle
    active: AtomicU64,
    /// Packed `(call << 2) | reason` of the winning request
    request: AtomicU64,
}

impl InterruptState {
    pub fn new() -> Self {
        InterruptState::default()
    }

    /// Start a new call and return its id
    pub fn begin(&self) -> u64 {
        let call = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(call, Ordering::SeqCst);
        call
    }

    /// End `call`, returning the interrupt recorded against it, if any
    pub fn finish(&self, call: u64) -> Option<Reason> {
        let _ = self
            .active
            .compare_exchange(call, 0, Ordering::SeqCst, Ordering::SeqCst);
        let request = self.request.load(Ordering::SeqCst);
        if request >> REASON_BITS == call {
            Reason::from_bits(request)
        } else {
            None
        }
    }

    /// Id of the in-flight call
    pub fn active(&self) -> Option<u64> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            call => Some(call),
        }
    }

    /// Interrupt whatever call is in flight. Returns false when idle or when
    /// the call was already interrupted.
    pub fn request(&self, reason: Reason) -> bool {
        match self.active() {
            Some(call) => self.request_for(call, reason),
            None => false,
        }
    }

    /// Interrupt `call` if it is still the one in flight
    pub fn request_for(&self, call: u64, reason: Reason) -> bool {
        if self.active.load(Ordering::SeqCst) != call {
            return false;
        }
        self.record(call, reason)
    }

    /// Store the request unless `call` or a later call already holds the word.
    /// The caller's active check can be stale by the time this runs.
    fn record(&self, call: u64, reason: Reason) -> bool {
        let packed = (call << REASON_BITS) | reason as u64;
        self.request
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current >> REASON_BITS < call).then_some(packed)
            })
            .is_ok()
    }

    /// Polled by the engine at safepoints
    #[inline]
    pub fn should_interrupt(&self) -> bool {
        let call = self.active.load(Ordering::Acquire);
        call != 0 && self.request.load(Ordering::Acquire) >> REASON_BITS == call
    }
}
