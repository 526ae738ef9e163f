//! Circuit breaker for the catalog existence probe.
//!
//! The upstream availability flag is modeled as an explicit
//! Closed / Open / HalfOpen state machine owned by the catalog client handle,
//! never as process-wide mutable state.

use time::{Duration, OffsetDateTime};

use review_ledger_core::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated while Closed before tripping Open.
    pub failure_threshold: u32,
    /// Time the breaker stays Open before letting one probe through.
    pub open_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_cooldown: Duration::seconds(30),
        }
    }
}

impl BreakerConfig {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a field is outside bounds.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.failure_threshold == 0 {
            return Err(LedgerError::Validation(
                "failure_threshold MUST be >= 1".to_string(),
            ));
        }
        if self.open_cooldown <= Duration::ZERO {
            return Err(LedgerError::Validation(
                "open_cooldown MUST be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<OffsetDateTime>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a probe may pass through at `now`. An Open breaker moves to
    /// HalfOpen once the cooldown has elapsed, admitting a single probe.
    pub fn allow_request(&mut self, now: OffsetDateTime) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .is_some_and(|opened| now - opened >= self.config.open_cooldown);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    tracing::warn!("catalog breaker half-open, admitting one probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::warn!(from = ?self.state, "catalog breaker closed after successful probe");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: OffsetDateTime) {
        match self.state {
            BreakerState::HalfOpen => self.trip(now),
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self, now: OffsetDateTime) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        tracing::warn!(
            failures = self.consecutive_failures,
            "catalog breaker opened"
        );
    }
}
