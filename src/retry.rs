//! Bounded retries around flaky remote interactions.

use crate::diagnostics::Diagnostics;
use crate::error::{InteractionError, PpmiError, Result};
use crate::logging::Logger;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Trial budget and fixed backoff between trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_trials: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_trials: u32, backoff: Duration) -> Result<Self> {
        if max_trials == 0 {
            return Err(PpmiError::Config(
                "retry budget must allow at least one trial".to_string(),
            ));
        }
        Ok(Self {
            max_trials,
            backoff,
        })
    }

    /// A single trial, no waiting.
    pub fn once() -> Self {
        Self {
            max_trials: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn max_trials(&self) -> u32 {
        self.max_trials
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_trials: 30,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Runs an operation until it succeeds, fails permanently, or the trial
/// budget is spent.
pub struct RetryableAction<'a> {
    policy: RetryPolicy,
    diagnostics: Option<&'a dyn Diagnostics>,
    logger: Logger,
}

impl<'a> RetryableAction<'a> {
    pub fn new(policy: RetryPolicy, logger: Logger) -> Self {
        Self {
            policy,
            diagnostics: None,
            logger,
        }
    }

    /// Capture a snapshot of the remote state when the budget runs out.
    pub fn with_diagnostics(mut self, diagnostics: &'a dyn Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute `op`, retrying transient failures.
    ///
    /// Permanent failures propagate immediately as [`PpmiError::PermanentFailure`].
    /// When every trial fails transiently the error is
    /// [`PpmiError::RetryBudgetExceeded`], carrying the diagnostic path if one
    /// could be captured.
    pub async fn run<T, F, Fut>(&self, action: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, InteractionError>>,
    {
        let max_trials = self.policy.max_trials;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.logger.debug(format_args!(
                            "{} succeeded on attempt {}/{}",
                            action, attempt, max_trials
                        ));
                    }
                    return Ok(value);
                }
                Err(InteractionError::Permanent(message)) => {
                    self.logger.warn(format_args!(
                        "{} failed permanently on attempt {}: {}",
                        action, attempt, message
                    ));
                    return Err(PpmiError::PermanentFailure(format!("{}: {}", action, message)));
                }
                Err(InteractionError::Transient(message)) => {
                    if attempt >= max_trials {
                        self.logger.error(format_args!(
                            "{} failed after {} attempt(s): {}",
                            action, attempt, message
                        ));
                        let diagnostic = self.capture_diagnostic(action).await;
                        return Err(PpmiError::RetryBudgetExceeded {
                            action: action.to_string(),
                            attempts: attempt,
                            last_error: message,
                            diagnostic,
                        });
                    }

                    self.logger.debug(format_args!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        action, attempt, max_trials, message, self.policy.backoff
                    ));
                    tokio::time::sleep(self.policy.backoff).await;
                }
            }
        }
    }

    async fn capture_diagnostic(&self, action: &str) -> Option<PathBuf> {
        let diagnostics = self.diagnostics?;
        match diagnostics.capture(action).await {
            Ok(path) => {
                self.logger
                    .info(format_args!("Diagnostic for {} saved to {}", action, path.display()));
                Some(path)
            }
            Err(e) => {
                self.logger
                    .warn(format_args!("Could not capture diagnostic for {}: {}", action, e));
                None
            }
        }
    }
}
