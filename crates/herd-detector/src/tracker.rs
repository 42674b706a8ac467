//! Per-server probe state machine.

use crate::DetectorConfig;

/// Probe state of one monitored server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Up,
    Suspect,
    Down,
}

/// What one observation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing notable.
    None,
    /// First failures; the server is now suspected. No event is emitted.
    Suspected,
    /// A suspected server answered again.
    Recovered,
    /// The failure threshold was reached. Emitted exactly once; the caller
    /// fires `SERVER_LOST` (and `FAIL_OVER` for a primary) on this.
    Down,
}

/// Counts consecutive probe failures and reports state transitions.
#[derive(Debug)]
pub struct ProbeTracker {
    state: State,
    consecutive_failures: u32,
    failures_to_suspect: u32,
    failures_to_down: u32,
}

impl ProbeTracker {
    /// A fresh tracker; servers start out `UP`.
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            state: State::Up,
            consecutive_failures: 0,
            failures_to_suspect: config.failures_to_suspect.max(1),
            failures_to_down: config.failures_to_down.max(1),
        }
    }

    /// Feed one probe result; returns the transition it caused.
    ///
    /// A server that reached `Down` stays there; it only leaves through
    /// operator re-activation, which discards the tracker entirely.
    pub fn observe(&mut self, alive: bool) -> Transition {
        if alive {
            self.consecutive_failures = 0;
            return match self.state {
                State::Suspect => {
                    self.state = State::Up;
                    Transition::Recovered
                }
                _ => Transition::None,
            };
        }

        self.consecutive_failures += 1;
        match self.state {
            State::Down => Transition::None,
            _ if self.consecutive_failures >= self.failures_to_down => {
                self.state = State::Down;
                Transition::Down
            }
            State::Up if self.consecutive_failures >= self.failures_to_suspect => {
                self.state = State::Suspect;
                Transition::Suspected
            }
            _ => Transition::None,
        }
    }

    /// Whether the tracked server has been declared down.
    pub fn is_down(&self) -> bool {
        self.state == State::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker(suspect: u32, down: u32) -> ProbeTracker {
        ProbeTracker::new(&DetectorConfig {
            period: Duration::from_secs(1),
            failures_to_suspect: suspect,
            failures_to_down: down,
        })
    }

    #[test]
    fn exactly_one_down_after_threshold_failures() {
        let mut t = tracker(1, 2);
        assert_eq!(t.observe(false), Transition::Suspected);
        assert_eq!(t.observe(false), Transition::Down);
        // Further failures stay silent; the loss was already reported.
        assert_eq!(t.observe(false), Transition::None);
        assert!(t.is_down());
    }

    #[test]
    fn success_before_threshold_resets_without_events() {
        let mut t = tracker(1, 2);
        assert_eq!(t.observe(false), Transition::Suspected);
        assert_eq!(t.observe(true), Transition::Recovered);
        // The counter restarted: one more failure only re-suspects.
        assert_eq!(t.observe(false), Transition::Suspected);
        assert_eq!(t.observe(false), Transition::Down);
    }

    #[test]
    fn healthy_servers_stay_quiet() {
        let mut t = tracker(1, 2);
        for _ in 0..10 {
            assert_eq!(t.observe(true), Transition::None);
        }
        assert!(!t.is_down());
    }

    #[test]
    fn wider_thresholds_take_longer() {
        let mut t = tracker(2, 4);
        assert_eq!(t.observe(false), Transition::None);
        assert_eq!(t.observe(false), Transition::Suspected);
        assert_eq!(t.observe(false), Transition::None);
        assert_eq!(t.observe(false), Transition::Down);
    }

    #[test]
    fn down_is_sticky_even_through_successes() {
        let mut t = tracker(1, 1);
        assert_eq!(t.observe(false), Transition::Down);
        // A recovered probe alone does not resurrect a down server; that
        // takes operator re-activation, which replaces the tracker.
        assert_eq!(t.observe(true), Transition::None);
        assert!(t.is_down());
    }
}
