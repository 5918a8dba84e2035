//! Tunables shared by the traverser, applier and batch coordinator.

use std::time::Duration;

use crate::command::CommandTokens;
use crate::defaults;
use crate::errors::ClipError;
use crate::log::Verbosity;

#[derive(Debug, Clone, PartialEq)]
pub struct ClipConfig {
    pub verbosity: Verbosity,
    pub max_nest_depth: usize,
    pub margin_ratio: f64,
    pub degenerate_threshold: f64,
    pub fallback_half_size: f64,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub command_timeout: Duration,
    pub verify_attempts: u32,
    pub verify_backoff: Duration,
    pub tokens: CommandTokens,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::default(),
            max_nest_depth: defaults::MAX_NEST_DEPTH,
            margin_ratio: defaults::MARGIN_RATIO,
            degenerate_threshold: defaults::DEGENERATE_THRESHOLD,
            fallback_half_size: defaults::FALLBACK_HALF_SIZE,
            poll_interval: defaults::POLL_INTERVAL,
            progress_interval: defaults::PROGRESS_INTERVAL,
            command_timeout: defaults::COMMAND_TIMEOUT,
            verify_attempts: defaults::VERIFY_ATTEMPTS,
            verify_backoff: defaults::VERIFY_BACKOFF,
            tokens: CommandTokens::default(),
        }
    }
}

impl ClipConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_max_nest_depth(mut self, depth: usize) -> Self {
        self.max_nest_depth = depth;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_verify(mut self, attempts: u32, backoff: Duration) -> Self {
        self.verify_attempts = attempts;
        self.verify_backoff = backoff;
        self
    }

    pub fn with_tokens(mut self, tokens: CommandTokens) -> Self {
        self.tokens = tokens;
        self
    }

    /// Reject settings the applier cannot run with.
    pub fn validate(&self) -> Result<(), ClipError> {
        let invalid = |msg: &str| Err(ClipError::InvalidArgument(msg.to_string()));
        if !(0.0..0.5).contains(&self.margin_ratio) {
            return invalid("margin ratio must be in [0, 0.5)");
        }
        if !(self.degenerate_threshold > 0.0) || !(self.fallback_half_size > 0.0) {
            return invalid("degenerate threshold and fallback size must be positive");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be non-zero");
        }
        if self.command_timeout < self.poll_interval {
            return invalid("command timeout shorter than one poll interval");
        }
        if self.verify_attempts == 0 {
            return invalid("at least one verification attempt is required");
        }
        if self.tokens.clip.is_empty() || self.tokens.command_name().is_empty() {
            return invalid("clip command token is empty");
        }
        Ok(())
    }

    /// Sleep after failed verification attempt `attempt` (1-based).
    pub fn verify_delay(&self, attempt: u32) -> Duration {
        self.verify_backoff.saturating_mul(attempt)
    }
}
