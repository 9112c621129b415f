use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub initial_delay: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
    /// Lower bound for the sleep after a quota error.
    pub quota_min_sleep: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1500),
            floor: Duration::from_millis(1000),
            ceiling: Duration::from_millis(60_000),
            quota_min_sleep: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    pub current_delay: Duration,
    pub consecutive_quota_errors: u32,
}

/// Pacing for one channel. Each channel owns its own instance.
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: RateLimiterState,
    transfers_started: u64,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let ceiling = config.ceiling.max(config.floor);
        let config = RateLimiterConfig { ceiling, ..config };
        Self {
            state: RateLimiterState {
                current_delay: config.initial_delay.clamp(config.floor, ceiling),
                consecutive_quota_errors: 0,
            },
            config,
            transfers_started: 0,
        }
    }

    pub fn state(&self) -> RateLimiterState {
        self.state
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Delay to wait before the next transfer; none before the first one.
    pub fn pacing_delay(&mut self) -> Option<Duration> {
        self.transfers_started += 1;
        (self.transfers_started > 1).then_some(self.state.current_delay)
    }

    pub fn record_success(&mut self) {
        self.state.consecutive_quota_errors = 0;
        let decayed = millis(self.state.current_delay).saturating_mul(9) / 10;
        self.state.current_delay = Duration::from_millis(decayed).max(self.config.floor);
    }

    /// Escalates the delay and returns how long to sleep before retrying
    /// the same file.
    pub fn record_quota(&mut self) -> Duration {
        self.state.consecutive_quota_errors = self.state.consecutive_quota_errors.saturating_add(1);
        let doubled = millis(self.state.current_delay).saturating_mul(2);
        let raised = doubled.max(millis(self.config.floor).saturating_mul(2));
        self.state.current_delay = Duration::from_millis(raised).min(self.config.ceiling);
        self.state.current_delay.max(self.config.quota_min_sleep)
    }
}

fn millis(value: Duration) -> u64 {
    value.as_millis().min(u128::from(u64::MAX)) as u64
}
