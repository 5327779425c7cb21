//! Per-domain job state machine and failure backoff.
//!
//! Kept free of timers so that overlap and backoff decisions can be tested
//! without running the loop.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// A monitored domain; each one is polled by its own loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Bgp,
    Interfaces,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Bgp => "bgp",
            Domain::Interfaces => "interfaces",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Backoff { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Run,
    SkipOverlap,
    SkipBackoff,
}

/// Exponential backoff: `base * 2^(failures - 1)`, capped at `max`, plus up
/// to 10% random jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let delay = self.base_delay(failures);
        let spread_ms = delay.as_millis() as u64 / 10;
        if spread_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::random::<u64>() % (spread_ms + 1))
    }
}

#[derive(Debug)]
pub struct DomainJob {
    state: JobState,
    consecutive_failures: u32,
    policy: BackoffPolicy,
}

impl DomainJob {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: JobState::Idle,
            consecutive_failures: 0,
            policy,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn backoff_deadline(&self) -> Option<Instant> {
        match self.state {
            JobState::Backoff { until } => Some(until),
            _ => None,
        }
    }

    /// Decide what a tick does. `Run` moves the job to `Running`.
    pub fn on_tick(&mut self, now: Instant) -> TickDecision {
        match self.state {
            JobState::Running => TickDecision::SkipOverlap,
            JobState::Backoff { until } if now < until => TickDecision::SkipBackoff,
            JobState::Idle | JobState::Backoff { .. } => {
                self.state = JobState::Running;
                TickDecision::Run
            }
        }
    }

    /// Returns how many failed polls preceded this success.
    pub fn on_success(&mut self) -> u32 {
        let recovered = self.consecutive_failures;
        self.consecutive_failures = 0;
        self.state = JobState::Idle;
        recovered
    }

    /// Enter backoff and return the delay chosen.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.policy.delay(self.consecutive_failures);
        self.state = JobState::Backoff { until: now + delay };
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(600))
    }

    #[test]
    fn test_running_job_skips_ticks() {
        let mut job = DomainJob::new(policy());
        let now = Instant::now();

        assert_eq!(job.on_tick(now), TickDecision::Run);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.on_tick(now + Duration::from_secs(60)), TickDecision::SkipOverlap);
        assert_eq!(job.on_tick(now + Duration::from_secs(120)), TickDecision::SkipOverlap);

        job.on_success();
        assert_eq!(job.on_tick(now + Duration::from_secs(180)), TickDecision::Run);
    }

    #[test]
    fn test_failure_backs_off_then_resumes() {
        let mut job = DomainJob::new(policy());
        let now = Instant::now();

        job.on_tick(now);
        let delay = job.on_failure(now);
        assert!(delay >= Duration::from_secs(30) && delay <= Duration::from_secs(33));
        assert_eq!(job.backoff_deadline(), Some(now + delay));

        assert_eq!(job.on_tick(now + Duration::from_secs(10)), TickDecision::SkipBackoff);
        assert_eq!(job.on_tick(now + delay), TickDecision::Run);

        let delay = job.on_failure(now + delay);
        assert!(delay >= Duration::from_secs(60));
        assert_eq!(job.consecutive_failures(), 2);

        assert_eq!(job.on_success(), 2);
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.consecutive_failures(), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_secs(30));
        assert_eq!(policy.base_delay(2), Duration::from_secs(60));
        assert_eq!(policy.base_delay(3), Duration::from_secs(120));
        assert_eq!(policy.base_delay(6), Duration::from_secs(600));
        assert_eq!(policy.base_delay(40), Duration::from_secs(600));

        for failures in 1..10 {
            let base = policy.base_delay(failures);
            let delay = policy.delay(failures);
            assert!(delay >= base && delay <= base + base / 10);
        }
    }
}
