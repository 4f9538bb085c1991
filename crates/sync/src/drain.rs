//! Drain Coordinator: cross-service cooperative drain
//! scheduling. Shared by `Arc` across every `ViewSyncerService` running
//! in the same host, it throttles how often any one instance is told
//! to drain so that a rolling restart doesn't force every client group
//! to rehydrate at once.

use parking_lot::Mutex;

struct State {
    requested: bool,
    next_allowed_at_ms: i64,
}

pub struct DrainCoordinator {
    state: Mutex<State>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                requested: false,
                next_allowed_at_ms: i64::MIN,
            }),
        }
    }

    /// Mark that the host wants every owned client group to eventually
    /// drain (e.g. on rolling restart).
    pub fn request_drain(&self) {
        self.state.lock().requested = true;
    }

    pub fn cancel_drain(&self) {
        let mut state = self.state.lock();
        state.requested = false;
        state.next_allowed_at_ms = i64::MIN;
    }

    /// Checked once per `version-ready` signal in the main loop. A
    /// service only breaks its loop once a drain has been requested
    /// *and* this instance's throttle window has elapsed.
    pub fn should_drain(&self, now_ms: i64) -> bool {
        let state = self.state.lock();
        state.requested && now_ms >= state.next_allowed_at_ms
    }

    /// Called immediately after a service breaks its loop to drain,
    /// with the hydration time its last rehydration took — the cost a
    /// future owner will pay to pick this client group back up. Other
    /// instances' drains are deferred for at least that long.
    pub fn drain_next_in(&self, now_ms: i64, delay_ms: i64) {
        let mut state = self.state.lock();
        state.next_allowed_at_ms = now_ms.saturating_add(delay_ms);
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_drain_until_requested() {
        let dc = DrainCoordinator::new();
        assert!(!dc.should_drain(1_000));
    }

    #[test]
    fn drain_next_in_throttles_subsequent_drains() {
        let dc = DrainCoordinator::new();
        dc.request_drain();
        assert!(dc.should_drain(0));
        dc.drain_next_in(0, 500);
        assert!(!dc.should_drain(100));
        assert!(dc.should_drain(500));
    }

    #[test]
    fn cancel_drain_clears_request() {
        let dc = DrainCoordinator::new();
        dc.request_drain();
        dc.cancel_drain();
        assert!(!dc.should_drain(10_000));
    }
}
