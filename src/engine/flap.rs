//! Sliding-window flap detection.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::db::FlapState;

#[derive(Debug, Clone, Copy)]
pub struct FlapDetector {
    window: Duration,
    threshold: usize,
}

impl FlapDetector {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self { window, threshold }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one poll. Returns the number of transitions in the window when
    /// a flapping event should fire; at most once until the window empties.
    pub fn observe(&self, state: &mut FlapState, transitioned: bool, now: DateTime<Utc>) -> Option<usize> {
        let window_ms = self.window.as_millis().min(i64::MAX as u128) as i64;
        state
            .recent_transitions
            .retain(|t| now.signed_duration_since(*t).num_milliseconds() <= window_ms);

        if transitioned {
            state.recent_transitions.push(now);
        }

        if state.recent_transitions.is_empty() {
            state.alerted = false;
            return None;
        }

        let count = state.recent_transitions.len();
        if count > self.threshold && !state.alerted {
            state.alerted = true;
            return Some(count);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_fires_once_when_threshold_exceeded() {
        let detector = FlapDetector::new(Duration::from_secs(300), 3);
        let mut state = FlapState::default();

        let fired: Vec<Option<usize>> = (0..6)
            .map(|i| detector.observe(&mut state, true, t0() + ChronoDuration::seconds(i * 10)))
            .collect();

        assert_eq!(fired, vec![None, None, None, Some(4), None, None]);
        assert!(state.alerted);
    }

    #[test]
    fn test_old_transitions_leave_the_window() {
        let detector = FlapDetector::new(Duration::from_secs(60), 2);
        let mut state = FlapState::default();

        detector.observe(&mut state, true, t0());
        detector.observe(&mut state, true, t0() + ChronoDuration::seconds(10));
        assert_eq!(state.recent_transitions.len(), 2);

        // Two minutes later the earlier transitions have aged out.
        assert_eq!(detector.observe(&mut state, true, t0() + ChronoDuration::seconds(130)), None);
        assert_eq!(state.recent_transitions.len(), 1);
    }

    #[test]
    fn test_flag_resets_only_when_window_is_empty() {
        let detector = FlapDetector::new(Duration::from_secs(60), 1);
        let mut state = FlapState::default();

        detector.observe(&mut state, true, t0());
        assert_eq!(detector.observe(&mut state, true, t0() + ChronoDuration::seconds(5)), Some(2));

        // Still inside the window: stays flagged.
        detector.observe(&mut state, false, t0() + ChronoDuration::seconds(30));
        assert!(state.alerted);

        detector.observe(&mut state, false, t0() + ChronoDuration::seconds(120));
        assert!(!state.alerted);
        assert!(state.recent_transitions.is_empty());

        detector.observe(&mut state, true, t0() + ChronoDuration::seconds(130));
        assert_eq!(detector.observe(&mut state, true, t0() + ChronoDuration::seconds(131)), Some(2));
    }
}
