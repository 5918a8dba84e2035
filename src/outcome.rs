//! Tri-state operation outcomes.
//!
//! Every component returns an [`Outcome`] rather than a `Result`: the caller
//! always gets a status, a human message and the time the operation took,
//! and a payload when there is one. Outcomes are built once and handed up.

use std::fmt;
use std::time::Duration;

use crate::errors::ClipError;

/// How many child failure messages an aggregate keeps for display.
pub const MAX_DISPLAYED_FAILURES: usize = crate::defaults::MAX_LISTED_FAILURES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Success,
    Warning,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Warning => write!(f, "warning"),
            Status::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub status: Status,
    pub data: Option<T>,
    pub message: String,
    pub elapsed: Duration,
}

impl<T> Outcome<T> {
    pub fn success(data: T, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: Status::Success,
            data: Some(data),
            message: message.into(),
            elapsed,
        }
    }

    pub fn warning(data: Option<T>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: Status::Warning,
            data,
            message: message.into(),
            elapsed,
        }
    }

    pub fn error(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: Status::Error,
            data: None,
            message: message.into(),
            elapsed,
        }
    }

    /// Report a pipeline error with the status it maps to.
    pub fn from_error(err: &ClipError, data: Option<T>, elapsed: Duration) -> Self {
        Self {
            status: err.status(),
            data,
            message: err.to_string(),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_warning(&self) -> bool {
        self.status == Status::Warning
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// Transform the payload, keeping status, message and timing.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            status: self.status,
            data: self.data.map(f),
            message: self.message,
            elapsed: self.elapsed,
        }
    }
}

impl<T> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} ms)",
            self.status,
            self.message,
            self.elapsed.as_millis()
        )
    }
}

/// Fold of many child outcomes.
///
/// The worst child status wins; every non-success message is kept, and the
/// first [`MAX_DISPLAYED_FAILURES`] of them appear in the rendered summary.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    worst: Option<Status>,
    successes: usize,
    failures: Vec<String>,
    elapsed: Duration,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T>(&mut self, child: &Outcome<T>) {
        self.worst = Some(self.worst.map_or(child.status, |w| w.max(child.status)));
        self.elapsed += child.elapsed;
        if child.is_success() {
            self.successes += 1;
        } else {
            self.failures.push(child.message.clone());
        }
    }

    pub fn status(&self) -> Status {
        self.worst.unwrap_or(Status::Success)
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Failure messages joined for display, truncated with a remainder count.
    pub fn failure_summary(&self) -> String {
        truncated_list(&self.failures, MAX_DISPLAYED_FAILURES, "; ")
    }

    /// Collapse into a single outcome carrying `data`.
    pub fn into_outcome<T>(self, data: T, headline: impl Into<String>) -> Outcome<T> {
        let mut message = headline.into();
        if !self.failures.is_empty() {
            message.push_str(": ");
            message.push_str(&self.failure_summary());
        }
        Outcome {
            status: self.status(),
            data: Some(data),
            message,
            elapsed: self.elapsed,
        }
    }
}

/// Join at most `limit` items, appending "and N more" when truncated.
pub fn truncated_list(items: &[String], limit: usize, sep: &str) -> String {
    let shown = items.iter().take(limit).cloned().collect::<Vec<_>>().join(sep);
    if items.len() > limit {
        format!("{shown}{sep}and {} more", items.len() - limit)
    } else {
        shown
    }
}
