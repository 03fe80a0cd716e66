//! Coordinator liveness tracking.
//!
//! Two thresholds: a keep-alive probe goes out after one quiet interval,
//! and the coordinator is only declared offline after four quiet intervals,
//! so a single lost packet does not flap the online flag.

use std::time::{Duration, Instant};

/// Number of ping intervals without traffic before the coordinator is considered offline.
pub const OFFLINE_INTERVALS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Online,
    Offline,
}

/// Outcome of [`Liveness::maybe_ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingDecision {
    /// A `PING` must be sent now
    pub send_ping: bool,
    pub event: Option<LivenessEvent>,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    last_message: Instant,
    last_ping: Instant,
    online: bool,
}

impl Liveness {
    /// Start offline, as if the last message and ping happened at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            last_message: now,
            last_ping: now,
            online: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn last_message(&self) -> Instant {
        self.last_message
    }

    pub fn last_ping(&self) -> Instant {
        self.last_ping
    }

    /// Record a valid message from the coordinator.
    pub fn on_message(&mut self, now: Instant) -> Option<LivenessEvent> {
        self.last_message = now;
        if self.online {
            None
        } else {
            self.online = true;
            Some(LivenessEvent::Online)
        }
    }

    pub fn maybe_ping(&mut self, now: Instant, interval: Duration) -> PingDecision {
        let last_activity = self.last_message.max(self.last_ping);
        if now.saturating_duration_since(last_activity) <= interval {
            return PingDecision::default();
        }

        let mut event = None;
        let silent = now.saturating_duration_since(self.last_message);
        if self.online && silent > interval * OFFLINE_INTERVALS {
            self.online = false;
            event = Some(LivenessEvent::Offline);
        }
        self.last_ping = now;
        PingDecision {
            send_ping: true,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);

    #[test]
    fn starts_offline_and_comes_online_on_message() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);
        assert!(!liveness.is_online());

        assert_eq!(liveness.on_message(t0), Some(LivenessEvent::Online));
        assert!(liveness.is_online());

        // Already online: no repeated event
        assert_eq!(liveness.on_message(t0 + Duration::from_secs(1)), None);
        assert_eq!(liveness.last_message(), t0 + Duration::from_secs(1));
    }

    #[test]
    fn no_ping_within_interval() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);
        liveness.on_message(t0);

        assert_eq!(liveness.maybe_ping(t0 + INTERVAL, INTERVAL), PingDecision::default());
        assert_eq!(liveness.last_ping(), t0);
    }

    #[test]
    fn ping_after_interval_keeps_online() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);
        liveness.on_message(t0);

        let now = t0 + INTERVAL + Duration::from_millis(1);
        let decision = liveness.maybe_ping(now, INTERVAL);
        assert!(decision.send_ping);
        assert_eq!(decision.event, None);
        assert!(liveness.is_online());
        assert_eq!(liveness.last_ping(), now);

        // The fresh ping resets the probe timer
        assert!(!liveness.maybe_ping(now + INTERVAL, INTERVAL).send_ping);
    }

    #[test]
    fn goes_offline_after_four_silent_intervals() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);
        liveness.on_message(t0);

        let mut now = t0;
        for _ in 0..3 {
            now += INTERVAL + Duration::from_millis(1);
            let decision = liveness.maybe_ping(now, INTERVAL);
            assert!(decision.send_ping);
            assert_eq!(decision.event, None);
        }
        assert!(liveness.is_online());

        now += INTERVAL + Duration::from_millis(1);
        let decision = liveness.maybe_ping(now, INTERVAL);
        assert!(decision.send_ping);
        assert_eq!(decision.event, Some(LivenessEvent::Offline));
        assert!(!liveness.is_online());

        // Offline is only reported once, pings continue
        now += INTERVAL + Duration::from_millis(1);
        let decision = liveness.maybe_ping(now, INTERVAL);
        assert!(decision.send_ping);
        assert_eq!(decision.event, None);

        assert_eq!(liveness.on_message(now), Some(LivenessEvent::Online));
    }

    #[test]
    fn offline_agent_still_pings() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0);

        let decision = liveness.maybe_ping(t0 + INTERVAL * 10, INTERVAL);
        assert!(decision.send_ping);
        assert_eq!(decision.event, None);
    }
}
