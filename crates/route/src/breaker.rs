use serde::Serialize;
use std::time::{Duration, Instant};

/// Per-channel circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive retryable failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing recovery probes.
    pub open_duration: Duration,
    /// Successful probes required to close a half-open circuit.
    pub half_open_successes: u32,
    /// Concurrent probes permitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_successes: 2,
            half_open_max_probes: 3,
        }
    }
}

/// Circuit breaker for one channel. All methods run under the scheduler's
/// lock, so state is plain data.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_probes: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            opened_at: None,
            half_open_successes: 0,
            half_open_probes: 0,
        }
    }
}

impl CircuitBreaker {
    /// Open→half-open happens automatically on the next availability query
    /// once the open duration has elapsed.
    fn tick(&mut self, config: &BreakerConfig) {
        if self.state == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|at| at.elapsed() >= config.open_duration)
        {
            self.state = CircuitState::HalfOpen;
            self.half_open_successes = 0;
            self.half_open_probes = 0;
        }
    }

    pub fn state(&mut self, config: &BreakerConfig) -> CircuitState {
        self.tick(config);
        self.state
    }

    pub fn is_closed(&mut self, config: &BreakerConfig) -> bool {
        self.state(config) == CircuitState::Closed
    }

    /// Half-open with a free probe slot.
    pub fn can_probe(&mut self, config: &BreakerConfig) -> bool {
        self.state(config) == CircuitState::HalfOpen
            && self.half_open_probes < config.half_open_max_probes
    }

    pub fn begin_probe(&mut self) {
        self.half_open_probes += 1;
    }

    pub fn record_success(&mut self, config: &BreakerConfig) {
        self.last_success = Some(Instant::now());
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.half_open_probes = self.half_open_probes.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= config.half_open_successes {
                    self.reset();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Non-retryable failures are request-specific, not channel health: they
    /// stamp `last_failure` (and release a probe slot) without advancing the
    /// consecutive-failure counter.
    pub fn record_failure(&mut self, config: &BreakerConfig, retryable: bool) {
        self.last_failure = Some(Instant::now());
        if !retryable {
            if self.state == CircuitState::HalfOpen {
                self.half_open_probes = self.half_open_probes.saturating_sub(1);
            }
            return;
        }
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}
