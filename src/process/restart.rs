use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Minimum number of exits kept per unit
const MIN_HISTORY: usize = 10;

/// What to do after an unexpected exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartImmediately,
    RestartAfter(Duration),
    GiveUp,
}

/// Restart policy configuration
///
/// `decide` is a pure function of the exit history and the supplied `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Maximum number of exits tolerated within the window
    pub max_restarts: usize,
    /// Trailing window for counting exits
    pub window: Duration,
    /// Delay before the first restart of a failure streak
    pub base_delay: Duration,
    /// Cap for the exponential delay
    pub max_delay: Duration,
    /// A run at least this long ends a failure streak
    pub min_uptime: Duration,
}

impl RestartPolicy {
    /// Decide how to react to the most recent exit in `history`
    pub fn decide(&self, history: &ExitHistory, now: Instant) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::GiveUp;
        }

        if history.count_within(self.window, now) > self.max_restarts {
            return RestartDecision::GiveUp;
        }

        let delay = self.delay_for(history.consecutive_failures(self.min_uptime));
        if delay.is_zero() {
            RestartDecision::RestartImmediately
        } else {
            RestartDecision::RestartAfter(delay)
        }
    }

    /// `min(base * 2^failures, max_delay)`
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(consecutive_failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Number of exits the history must retain for `decide` to see the whole budget
    pub fn history_capacity(&self) -> usize {
        MIN_HISTORY.max(self.max_restarts.saturating_add(1))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 10,
            window: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            min_uptime: Duration::from_secs(1),
        }
    }
}

/// One recorded exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// When the exit was observed
    pub at: Instant,
    /// How long the process had been running
    pub uptime: Duration,
}

/// Bounded ring of recent exits for one unit, oldest first
#[derive(Debug, Clone)]
pub struct ExitHistory {
    records: VecDeque<ExitRecord>,
    capacity: usize,
}

impl ExitHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an exit, evicting the oldest one when full
    pub fn record(&mut self, record: ExitRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ExitRecord> {
        self.records.back()
    }

    /// Exits observed no earlier than `window` before `now`
    pub fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.records
            .iter()
            .filter(|r| now.saturating_duration_since(r.at) <= window)
            .count()
    }

    /// Short-lived exits before the latest one, back to the last stable run
    ///
    /// A latest exit that was itself stable yields zero.
    pub fn consecutive_failures(&self, min_uptime: Duration) -> u32 {
        let streak = self
            .records
            .iter()
            .rev()
            .take_while(|r| r.uptime < min_uptime)
            .count();
        streak.saturating_sub(1) as u32
    }

    /// Forget all exits (explicit operator reset)
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self::with_capacity(MIN_HISTORY)
    }
}
