use std::fmt;
use std::time::{Duration, Instant};

/// Which deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Total run time since start
    Run,
    /// Time since the last output byte was observed
    Idle,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Tracks the overall and the idle deadline of one launch
///
/// A zero or unset duration disables the corresponding check.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    started_at: Instant,
    last_output_at: Instant,
    timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl TimeoutGuard {
    pub fn new(now: Instant, timeout: Option<Duration>, idle_timeout: Option<Duration>) -> Self {
        Self {
            started_at: now,
            last_output_at: now,
            timeout: timeout.filter(|d| !d.is_zero()),
            idle_timeout: idle_timeout.filter(|d| !d.is_zero()),
        }
    }

    /// Record that output was observed at `now`
    pub fn touch(&mut self, now: Instant) {
        self.last_output_at = now;
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_output_at(&self) -> Instant {
        self.last_output_at
    }

    /// Return the first expired deadline and its configured limit, if any
    pub fn check(&self, now: Instant) -> Option<(TimeoutKind, Duration)> {
        if let Some(limit) = self.timeout {
            if now.saturating_duration_since(self.started_at) > limit {
                return Some((TimeoutKind::Run, limit));
            }
        }

        if let Some(limit) = self.idle_timeout {
            if now.saturating_duration_since(self.last_output_at) > limit {
                return Some((TimeoutKind::Idle, limit));
            }
        }

        None
    }
}
