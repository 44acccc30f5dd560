//! One-shot job records.
//!
//! A `JobRecord` tracks the attempts of a single one-shot service and
//! decides whether a failed attempt is retried.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::compose::{RestartPolicy, ServiceSpec};

/// A one-shot job and its retry bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Service name.
    pub name: String,
    /// Services this job waits for.
    pub dependencies: Vec<String>,
    /// Command as displayed in logs.
    pub command: String,
    /// Effective restart policy.
    pub restart: RestartPolicy,
    /// Attempts made so far.
    pub attempts: u32,
    /// Total attempts allowed; `None` retries until success.
    pub max_attempts: Option<u32>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the last attempt.
    pub last_exit_code: Option<i64>,
}

impl JobRecord {
    /// Creates a record from a manifest entry.
    ///
    /// `always` and `unless-stopped` are treated as `on-failure`: a job that
    /// succeeded is never run again. `cap` bounds the total attempts regardless
    /// of policy.
    pub fn from_spec(name: &str, spec: &ServiceSpec, cap: Option<u32>) -> Self {
        let restart = match spec.restart {
            RestartPolicy::Always | RestartPolicy::UnlessStopped => {
                tracing::warn!(
                    service = %name,
                    policy = %spec.restart,
                    "One-shot job restart policy treated as on-failure"
                );
                RestartPolicy::OnFailure { max_attempts: None }
            }
            other => other,
        };

        let policy_limit = match restart {
            RestartPolicy::No => Some(1),
            // on-failure:N allows N restarts after the first run
            RestartPolicy::OnFailure {
                max_attempts: Some(n),
            } => Some(n.saturating_add(1)),
            _ => None,
        };

        let max_attempts = match (policy_limit, cap) {
            (Some(limit), Some(cap)) => Some(limit.min(cap.max(1))),
            (Some(limit), None) => Some(limit),
            (None, Some(cap)) => Some(cap.max(1)),
            (None, None) => None,
        };

        Self {
            name: name.to_string(),
            dependencies: spec.depends_on.keys().cloned().collect(),
            command: spec.argv().join(" "),
            restart,
            attempts: 0,
            max_attempts,
            started_at: None,
            last_exit_code: None,
        }
    }

    /// Marks the start of an attempt and returns its number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.attempts += 1;
        self.attempts
    }

    /// Records the exit code of the current attempt.
    pub fn finish_attempt(&mut self, exit_code: i64) {
        self.last_exit_code = Some(exit_code);
    }

    /// Returns true if another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.attempts < max,
            None => true,
        }
    }

    /// Attempts left, `None` if unbounded.
    pub fn remaining_attempts(&self) -> Option<u32> {
        self.max_attempts
            .map(|max| max.saturating_sub(self.attempts))
    }

    /// Returns true if the last attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.last_exit_code == Some(0)
    }
}

/// Capped exponential backoff: `base * 2^(attempt - 1)`, at most `cap`.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}
