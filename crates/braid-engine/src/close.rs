//! Connection close negotiation state
//!
//! Closing is connection-wide: each side sets a close-request bit, and the
//! socket's write side shuts down only once both bits are set and every
//! channel count has reached zero. The whole state lives in one `u32` so
//! the hot channel open/close path is a single compare-and-swap, but all
//! call sites work with the named-field [`CloseState`] struct, never raw
//! masks.

use std::sync::atomic::{AtomicU32, Ordering};

/// Largest channel count representable in the packed state (15 bits per
/// direction).
pub const MAX_CHANNEL_COUNT: u16 = 0x7FFF;

const SENT_BIT: u32 = 1 << 31;
const RECEIVED_BIT: u32 = 1 << 30;
const INBOUND_SHIFT: u32 = 15;
const COUNT_MASK: u32 = 0x7FFF;

/// One snapshot of the close negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseState {
    /// We have sent a close request
    pub close_sent: bool,
    /// The peer has sent a close request
    pub close_received: bool,
    /// Channels the peer opened that are still up
    pub inbound: u16,
    /// Channels we opened that are still up
    pub outbound: u16,
}

impl CloseState {
    fn pack(&self) -> u32 {
        let mut bits = ((self.inbound as u32) << INBOUND_SHIFT) | self.outbound as u32;
        if self.close_sent {
            bits |= SENT_BIT;
        }
        if self.close_received {
            bits |= RECEIVED_BIT;
        }
        bits
    }

    fn unpack(bits: u32) -> Self {
        Self {
            close_sent: bits & SENT_BIT != 0,
            close_received: bits & RECEIVED_BIT != 0,
            inbound: ((bits >> INBOUND_SHIFT) & COUNT_MASK) as u16,
            outbound: (bits & COUNT_MASK) as u16,
        }
    }

    /// Whether either side has requested close
    pub fn closing(&self) -> bool {
        self.close_sent || self.close_received
    }

    /// The write side may shut down: both close bits set, no channels left.
    pub fn barrier_reached(&self) -> bool {
        self.close_sent && self.close_received && self.inbound == 0 && self.outbound == 0
    }
}

/// Why a channel count could not be incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountRefused {
    /// Close negotiation already started; no new channels
    Closing,
    /// The per-direction channel limit is reached
    AtLimit,
}

/// The shared atomic holding the packed [`CloseState`].
#[derive(Debug, Default)]
pub struct AtomicCloseState(AtomicU32);

impl AtomicCloseState {
    /// Fresh state: no close bits, zero channels
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot
    pub fn load(&self) -> CloseState {
        CloseState::unpack(self.0.load(Ordering::Acquire))
    }

    /// Apply `f` under a compare-and-swap retry loop. `f` returning `None`
    /// aborts and yields the state that caused the refusal.
    fn update<F>(&self, f: F) -> Result<(CloseState, CloseState), CloseState>
    where
        F: Fn(CloseState) -> Option<CloseState>,
    {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = CloseState::unpack(current);
            let Some(next) = f(state) else {
                return Err(state);
            };
            match self.0.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((state, next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Count a newly accepted inbound channel.
    pub fn try_inc_inbound(&self, max: u16) -> Result<CloseState, CountRefused> {
        self.try_inc(max, true)
    }

    /// Count a newly requested outbound channel.
    pub fn try_inc_outbound(&self, max: u16) -> Result<CloseState, CountRefused> {
        self.try_inc(max, false)
    }

    fn try_inc(&self, max: u16, inbound: bool) -> Result<CloseState, CountRefused> {
        let max = max.min(MAX_CHANNEL_COUNT);
        let result = self.update(|mut state| {
            if state.closing() {
                return None;
            }
            let count = if inbound {
                &mut state.inbound
            } else {
                &mut state.outbound
            };
            if *count >= max {
                return None;
            }
            *count += 1;
            Some(state)
        });
        match result {
            Ok((_, next)) => Ok(next),
            Err(state) if state.closing() => Err(CountRefused::Closing),
            Err(_) => Err(CountRefused::AtLimit),
        }
    }

    /// Drop an inbound channel count, returning the new state.
    pub fn dec_inbound(&self) -> CloseState {
        self.dec(true)
    }

    /// Drop an outbound channel count, returning the new state.
    pub fn dec_outbound(&self) -> CloseState {
        self.dec(false)
    }

    fn dec(&self, inbound: bool) -> CloseState {
        let result = self.update(|mut state| {
            let count = if inbound {
                &mut state.inbound
            } else {
                &mut state.outbound
            };
            *count = count.saturating_sub(1);
            Some(state)
        });
        match result {
            Ok((_, next)) => next,
            Err(state) => state,
        }
    }

    /// Record that this side requested close. Returns whether the bit was
    /// newly set and the resulting state.
    pub fn request_close(&self) -> (bool, CloseState) {
        match self.update(|mut state| {
            state.close_sent = true;
            Some(state)
        }) {
            Ok((prev, next)) => (!prev.close_sent, next),
            Err(state) => (false, state),
        }
    }

    /// Record the peer's close request. Sets both bits: once the peer asks
    /// to close, this side agrees. Returns whether the sent bit was newly
    /// set (a reply frame is owed) and the resulting state.
    pub fn receive_close(&self) -> (bool, CloseState) {
        match self.update(|mut state| {
            state.close_received = true;
            state.close_sent = true;
            Some(state)
        }) {
            Ok((prev, next)) => (!prev.close_sent, next),
            Err(state) => (false, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let state = CloseState {
            close_sent: true,
            close_received: false,
            inbound: 24,
            outbound: 0x7FFF,
        };
        assert_eq!(CloseState::unpack(state.pack()), state);
    }

    #[test]
    fn test_inc_dec() {
        let atomic = AtomicCloseState::new();
        atomic.try_inc_inbound(24).unwrap();
        atomic.try_inc_inbound(24).unwrap();
        atomic.try_inc_outbound(24).unwrap();

        let state = atomic.load();
        assert_eq!(state.inbound, 2);
        assert_eq!(state.outbound, 1);

        assert_eq!(atomic.dec_inbound().inbound, 1);
        assert_eq!(atomic.dec_outbound().outbound, 0);
    }

    #[test]
    fn test_limit_refused() {
        let atomic = AtomicCloseState::new();
        atomic.try_inc_inbound(1).unwrap();
        assert_eq!(atomic.try_inc_inbound(1), Err(CountRefused::AtLimit));
    }

    #[test]
    fn test_no_new_channels_while_closing() {
        let atomic = AtomicCloseState::new();
        atomic.request_close();
        assert_eq!(atomic.try_inc_outbound(24), Err(CountRefused::Closing));
    }

    #[test]
    fn test_request_close_idempotent() {
        let atomic = AtomicCloseState::new();
        let (newly, _) = atomic.request_close();
        assert!(newly);
        let (again, _) = atomic.request_close();
        assert!(!again);
    }

    #[test]
    fn test_receive_close_sets_both_bits() {
        let atomic = AtomicCloseState::new();
        let (owes_reply, state) = atomic.receive_close();
        assert!(owes_reply);
        assert!(state.close_sent);
        assert!(state.close_received);

        // Already-sent side owes no reply
        let other = AtomicCloseState::new();
        other.request_close();
        let (owes_reply, _) = other.receive_close();
        assert!(!owes_reply);
    }

    #[test]
    fn test_barrier_condition() {
        let atomic = AtomicCloseState::new();
        atomic.try_inc_outbound(24).unwrap();
        atomic.request_close();
        atomic.receive_close();
        assert!(!atomic.load().barrier_reached());

        let state = atomic.dec_outbound();
        assert!(state.barrier_reached());
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let atomic = Arc::new(AtomicCloseState::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let atomic = Arc::clone(&atomic);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    atomic.try_inc_inbound(MAX_CHANNEL_COUNT).unwrap();
                    atomic.dec_inbound();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(atomic.load().inbound, 0);
    }
}
