//! Bounded-retry admin-script remediation for known post-start pathologies.
//!
//! Every action goes through [`DockerGateway::exec_in_container`] with a
//! structured argv — never a shell string — so there is no quoting surface
//! for a password or namespace to escape through.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult, RemediationCause};
use crate::gateway::DockerGateway;
use crate::types::ContainerId;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_FACTOR: u32 = 2;
const JITTER_FRACTION: f64 = 0.2;

/// Executes the small, fixed set of in-container admin actions the lifecycle
/// falls back to when a health probe surfaces one of two known pathologies.
pub struct Remediator {
    gateway: Arc<dyn DockerGateway>,
}

impl Remediator {
    /// Build a remediator against the given gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn DockerGateway>) -> Self {
        Self { gateway }
    }

    /// Reset `username`'s password and clear its expiration flag.
    ///
    /// Protocol, in one admin session per attempt: get the user's security
    /// properties, set `Password` and `PasswordNeverExpires=1` on the
    /// returned array, then call the matching modify procedure with the
    /// updated array. The get is mandatory — modify reads from the array it
    /// is given, so skipping the get would silently drop every other
    /// property on the account.
    pub async fn reset_password(&self, id: &ContainerId, username: &str, new_password: &str) -> EngineResult<()> {
        let script = format!(
            "do ##class(Security.Users).Get(\"{username}\",.props) \
             set props(\"Password\")=\"{new_password}\" \
             set props(\"PasswordNeverExpires\")=1 \
             do ##class(Security.Users).Modify(\"{username}\",.props)"
        );
        self.run_admin_script(id, &script, RemediationCause::PasswordRejected)
            .await
    }

    /// Clear the forced-change flag on every account.
    pub async fn unexpire_passwords(&self, id: &ContainerId) -> EngineResult<()> {
        let script = "do ##class(Security.Users).UnExpireUserPasswords(\"*\")".to_string();
        self.run_admin_script(id, &script, RemediationCause::PasswordRejected)
            .await
    }

    /// Enable the in-engine service native client libraries require.
    /// Mirrors `reset_password`'s get -> mutate -> modify shape, applied to
    /// the service record instead of a user record.
    pub async fn enable_privileged_service(&self, id: &ContainerId) -> EngineResult<()> {
        let script = "do ##class(Security.Services).Get(\"%Service_CallIn\",.props) \
             set props(\"Enabled\")=1 \
             do ##class(Security.Services).Modify(\"%Service_CallIn\",.props)"
            .to_string();
        self.run_admin_script(id, &script, RemediationCause::ServiceEnableRejected)
            .await
    }

    async fn run_admin_script(
        &self,
        id: &ContainerId,
        script: &str,
        cause_on_terminal_failure: RemediationCause,
    ) -> EngineResult<()> {
        let argv = vec![
            "iris".to_string(),
            "session".to_string(),
            "iris".to_string(),
            "-U".to_string(),
            "%SYS".to_string(),
        ];

        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .gateway
                .exec_in_container(id, &argv, Some(script.as_bytes()))
                .await
            {
                Ok(outcome) if outcome.is_success() => {
                    debug!(attempt, container = %id, "remediation script succeeded");
                    return Ok(());
                }
                Ok(outcome) => {
                    let err = EngineError::RemediationFailed {
                        cause: cause_on_terminal_failure,
                        message: format!(
                            "exit {}: {}",
                            outcome.exit_code,
                            outcome.stderr.lines().last().unwrap_or("").trim()
                        ),
                    };
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt < MAX_ATTEMPTS {
                let jitter = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
                let sleep_for = Duration::from_secs_f64(backoff.as_secs_f64() * jitter);
                warn!(attempt, ?sleep_for, "remediation attempt failed, retrying");
                tokio::time::sleep(sleep_for).await;
                backoff *= BACKOFF_FACTOR;
            }
        }

        Err(last_error.unwrap_or(EngineError::RemediationFailed {
            cause: RemediationCause::ExecNonRetryable,
            message: "remediation exhausted its retries".to_string(),
        }))
    }
}
