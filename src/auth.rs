//! Establishing an authenticated Copilot session
//!
//! Three strategies, all ending with a persisted storage snapshot:
//!
//! - **Manual**: the operator signs in by hand while the snapshot is saved on
//!   an interval until cancellation or the wall-clock cap.
//! - **Interactive**: credentials handed in by the caller drive the Microsoft
//!   sign-in form, with a TOTP code when an MFA challenge shows up.
//! - **Scripted**: like Interactive, with credentials from the secret store.

mod credentials;
pub mod totp;

pub use credentials::{
    Credentials, EnvSecretStore, SecretStore, OTP_SECRET_KEY, PASSWORD_KEY, USERNAME_KEY,
};

use crate::automation::{first_visible, Automation, AutomationError};
use crate::config::Settings;
use crate::error::{CopilotError, CopilotResult};
use crate::retry::{poll_until, sleep_or_cancel, PollSchedule, Poller, WaitOutcome};
use crate::selectors::{describe, Selector, SELECTORS};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use totp::Totp;

/// Codes submitted before giving up on an MFA challenge
const MFA_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub enum AuthStrategy {
    Manual,
    Interactive(Credentials),
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// A saved storage snapshot was accepted
    Snapshot,
    Manual,
    Interactive,
    Scripted,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::Snapshot => "snapshot",
            AuthMethod::Manual => "manual",
            AuthMethod::Interactive => "interactive",
            AuthMethod::Scripted => "scripted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub method: AuthMethod,
    pub snapshot_path: PathBuf,
    pub snapshots_written: u32,
    pub mfa_used: bool,
}

/// What the sign-in page shows after a submit
enum Step {
    Field(&'static Selector),
    Rejected(String),
}

/// What follows the password page
enum AfterPassword {
    Challenge(&'static Selector),
    Rejected(String),
    Continue,
}

enum MfaProgress {
    Cleared,
    Rejected,
}

pub struct AuthNegotiator {
    settings: Arc<Settings>,
    secrets: Arc<dyn SecretStore>,
}

impl AuthNegotiator {
    pub fn new(settings: Arc<Settings>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { settings, secrets }
    }

    /// Loads the saved snapshot and checks that the remote still accepts it.
    ///
    /// Returns `Ok(false)` when there is no snapshot or it is stale.
    pub async fn restore_snapshot(
        &self,
        surface: &dyn Automation,
        cancel: &CancellationToken,
    ) -> CopilotResult<bool> {
        let path = &self.settings.storage_state_path;
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "No saved session");
            return Ok(false);
        }
        if let Err(e) = surface.load_state(path).await {
            if matches!(e, AutomationError::ContextClosed) {
                return Err(e.into());
            }
            tracing::warn!(path = %path.display(), error = %e, "Saved session could not be loaded");
            return Ok(false);
        }
        surface.navigate(&self.settings.base_url).await?;

        let schedule = PollSchedule::new(
            self.settings.timeouts.poll_interval,
            self.settings.timeouts.interaction,
        );
        let landed = poll_until(schedule, cancel, || async move {
            Ok::<_, AutomationError>(landing_visible(surface).await?.then_some(()))
        })
        .await?;
        match landed {
            WaitOutcome::Ready(()) => {
                tracing::info!(path = %path.display(), "Saved session accepted");
                Ok(true)
            }
            WaitOutcome::TimedOut => {
                tracing::info!(path = %path.display(), "Saved session expired; signing in again");
                Ok(false)
            }
            WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
        }
    }

    pub async fn negotiate(
        &self,
        surface: &dyn Automation,
        strategy: AuthStrategy,
        cancel: &CancellationToken,
    ) -> CopilotResult<AuthOutcome> {
        match strategy {
            AuthStrategy::Manual => self.manual(surface, cancel).await,
            AuthStrategy::Interactive(credentials) => {
                self.sign_in(surface, &credentials, AuthMethod::Interactive, cancel)
                    .await
            }
            AuthStrategy::Scripted => {
                let credentials = Credentials::from_store(self.secrets.as_ref())?;
                self.sign_in(surface, &credentials, AuthMethod::Scripted, cancel)
                    .await
            }
        }
    }

    async fn manual(
        &self,
        surface: &dyn Automation,
        cancel: &CancellationToken,
    ) -> CopilotResult<AuthOutcome> {
        let timeouts = &self.settings.timeouts;
        let path = &self.settings.storage_state_path;
        ensure_parent(path).await?;
        surface.navigate(&self.settings.base_url).await?;
        tracing::info!(
            path = %path.display(),
            interval = ?timeouts.manual_save_interval,
            max = ?timeouts.manual_max,
            "Complete the sign-in in the browser window; the session is saved periodically"
        );

        let mut poller = Poller::new(
            PollSchedule::new(timeouts.manual_save_interval, timeouts.manual_max),
            cancel,
        );
        let mut written = 0u32;
        // The first slot is immediate; nothing worth saving yet
        let ended = match poller.next_attempt().await {
            Err(stop) => Some(stop),
            Ok(()) => loop {
                if let Err(stop) = poller.next_attempt().await {
                    break Some(stop);
                }
                match surface.persist_state(path).await {
                    Ok(()) => {
                        written += 1;
                        tracing::debug!(snapshots = written, "Saved session snapshot");
                    }
                    Err(AutomationError::ContextClosed) if written > 0 => {
                        tracing::info!("Browser closed; keeping the last saved session");
                        break None;
                    }
                    Err(AutomationError::ContextClosed) => {
                        return Err(AutomationError::ContextClosed.into());
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to save session snapshot"),
                }
            },
        };

        tracing::info!(
            snapshots = written,
            elapsed = ?poller.elapsed(),
            reason = ?ended,
            "Manual sign-in ended"
        );
        Ok(AuthOutcome {
            method: AuthMethod::Manual,
            snapshot_path: path.clone(),
            snapshots_written: written,
            mfa_used: false,
        })
    }

    async fn sign_in(
        &self,
        surface: &dyn Automation,
        credentials: &Credentials,
        method: AuthMethod,
        cancel: &CancellationToken,
    ) -> CopilotResult<AuthOutcome> {
        tracing::info!(method = %method, username = %credentials.username, "Signing in");

        surface.navigate(&self.settings.base_url).await?;
        let mut mfa_used = false;

        if !landing_visible(surface).await? {
            let password = credentials
                .password
                .as_deref()
                .ok_or(CopilotError::MissingCredentials {
                    field: PASSWORD_KEY,
                })?;
            if let Some(sign_in) = first_visible(surface, SELECTORS.sign_in).await? {
                surface.click(sign_in).await?;
            }

            let username_field = self.await_field(surface, SELECTORS.username_input, cancel).await?;
            surface.type_text(username_field, &credentials.username).await?;
            submit(surface, SELECTORS.login_submit, username_field).await?;

            let password_field = self.await_field(surface, SELECTORS.password_input, cancel).await?;
            surface.type_text(password_field, password).await?;
            submit(surface, SELECTORS.login_submit, password_field).await?;

            match self.after_password(surface, cancel).await? {
                AfterPassword::Rejected(message) => {
                    return Err(CopilotError::CredentialsRejected(message));
                }
                AfterPassword::Challenge(otp_field) => {
                    let secret = credentials.otp_secret.as_deref().ok_or_else(|| {
                        CopilotError::Authentication(format!(
                            "an MFA challenge appeared but {OTP_SECRET_KEY} is not configured"
                        ))
                    })?;
                    self.complete_mfa(surface, secret, otp_field, cancel).await?;
                    mfa_used = true;
                }
                AfterPassword::Continue => {}
            }

            self.await_landing(surface, cancel).await?;
        }

        let path = &self.settings.storage_state_path;
        ensure_parent(path).await?;
        surface.persist_state(path).await?;
        tracing::info!(
            method = %method,
            mfa = mfa_used,
            path = %path.display(),
            "Signed in; session saved"
        );

        Ok(AuthOutcome {
            method,
            snapshot_path: path.clone(),
            snapshots_written: 1,
            mfa_used,
        })
    }

    /// Waits for a form field, failing fast when an error banner shows up instead.
    async fn await_field(
        &self,
        surface: &dyn Automation,
        group: &'static [Selector],
        cancel: &CancellationToken,
    ) -> CopilotResult<&'static Selector> {
        let timeout = self.settings.timeouts.auth;
        let schedule = PollSchedule::new(self.settings.timeouts.poll_interval, timeout);
        let step = poll_until(schedule, cancel, || async move {
            if let Some(message) = login_error(surface).await? {
                return Ok(Some(Step::Rejected(message)));
            }
            Ok::<_, AutomationError>(first_visible(surface, group).await?.map(Step::Field))
        })
        .await?;

        match step {
            WaitOutcome::Ready(Step::Field(field)) => Ok(field),
            WaitOutcome::Ready(Step::Rejected(message)) => {
                Err(CopilotError::CredentialsRejected(message))
            }
            WaitOutcome::TimedOut => Err(CopilotError::WaitTimeout {
                selector: describe(group),
                timeout,
            }),
            WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
        }
    }

    /// Bounded look for an MFA challenge; nothing within the window means none is required.
    async fn after_password(
        &self,
        surface: &dyn Automation,
        cancel: &CancellationToken,
    ) -> CopilotResult<AfterPassword> {
        let schedule = PollSchedule::new(
            self.settings.timeouts.poll_interval,
            self.settings.timeouts.mfa_detect,
        );
        let outcome = poll_until(schedule, cancel, || async move {
            if let Some(message) = login_error(surface).await? {
                return Ok(Some(AfterPassword::Rejected(message)));
            }
            if let Some(field) = first_visible(surface, SELECTORS.otp_input).await? {
                return Ok(Some(AfterPassword::Challenge(field)));
            }
            if first_visible(surface, SELECTORS.stay_signed_in).await?.is_some()
                || landing_visible(surface).await?
            {
                return Ok(Some(AfterPassword::Continue));
            }
            Ok::<_, AutomationError>(None)
        })
        .await?;

        match outcome {
            WaitOutcome::Ready(next) => Ok(next),
            WaitOutcome::TimedOut => {
                tracing::debug!("No MFA challenge detected");
                Ok(AfterPassword::Continue)
            }
            WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
        }
    }

    async fn complete_mfa(
        &self,
        surface: &dyn Automation,
        secret: &str,
        mut otp_field: &'static Selector,
        cancel: &CancellationToken,
    ) -> CopilotResult<()> {
        let totp = Totp::from_base32(secret)
            .map_err(|e| CopilotError::Authentication(format!("{OTP_SECRET_KEY}: {e}")))?;
        let schedule = PollSchedule::new(
            self.settings.timeouts.poll_interval,
            self.settings.timeouts.auth,
        );
        let mut step = totp::current_step();

        for attempt in 1..=MFA_ATTEMPTS {
            if attempt > 1 {
                // A fresh code, from the next time step
                step += 1;
                if !sleep_or_cancel(totp::until_step(step), cancel).await {
                    return Err(CopilotError::Cancelled);
                }
                if let Some(field) = first_visible(surface, SELECTORS.otp_input).await? {
                    otp_field = field;
                }
            }

            let code = totp
                .code_for_step(step)
                .map_err(|e| CopilotError::Authentication(e.to_string()))?;
            tracing::info!(attempt, "Submitting MFA code");
            surface.type_text(otp_field, &code).await?;
            submit(surface, SELECTORS.otp_submit, otp_field).await?;

            let progress = poll_until(schedule, cancel, || async move {
                if login_error(surface).await?.is_some() {
                    return Ok(Some(MfaProgress::Rejected));
                }
                if first_visible(surface, SELECTORS.otp_input).await?.is_some() {
                    return Ok(None);
                }
                Ok::<_, AutomationError>(Some(MfaProgress::Cleared))
            })
            .await?;

            match progress {
                WaitOutcome::Ready(MfaProgress::Cleared) => return Ok(()),
                WaitOutcome::Ready(MfaProgress::Rejected) | WaitOutcome::TimedOut => {
                    tracing::warn!(attempt, max_attempts = MFA_ATTEMPTS, "MFA challenge not cleared");
                }
                WaitOutcome::Cancelled => return Err(CopilotError::Cancelled),
            }
        }

        Err(CopilotError::MfaTimeout {
            attempts: MFA_ATTEMPTS,
        })
    }

    /// Accepts "Stay signed in?" and waits for the chat surface.
    async fn await_landing(
        &self,
        surface: &dyn Automation,
        cancel: &CancellationToken,
    ) -> CopilotResult<()> {
        let timeout = self.settings.timeouts.auth;
        let schedule = PollSchedule::new(self.settings.timeouts.poll_interval, timeout);
        let landed = poll_until(schedule, cancel, || async move {
            if let Some(accept) = first_visible(surface, SELECTORS.stay_signed_in).await? {
                tracing::debug!("Accepting stay-signed-in prompt");
                surface.click(accept).await?;
            }
            Ok::<_, AutomationError>(landing_visible(surface).await?.then_some(()))
        })
        .await?;

        match landed {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => Err(CopilotError::Authentication(format!(
                "the signed-in page did not appear within {timeout:?}"
            ))),
            WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
        }
    }
}

/// Whether the signed-in chat surface is showing
pub async fn landing_visible(surface: &dyn Automation) -> Result<bool, AutomationError> {
    Ok(first_visible(surface, SELECTORS.logged_in).await?.is_some())
}

/// Text of the sign-in error banner, if one is showing
async fn login_error(surface: &dyn Automation) -> Result<Option<String>, AutomationError> {
    let Some(banner) = first_visible(surface, SELECTORS.login_error).await? else {
        return Ok(None);
    };
    let message = match surface.read_text(banner).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => "the sign-in page reported an error".to_string(),
        Err(AutomationError::ContextClosed) => return Err(AutomationError::ContextClosed),
        Err(e) => {
            tracing::debug!(error = %e, "Could not read sign-in error text");
            "the sign-in page reported an error".to_string()
        }
    };
    Ok(Some(message))
}

/// Clicks the first visible submit button, or presses Enter in `field`.
async fn submit(
    surface: &dyn Automation,
    buttons: &'static [Selector],
    field: &Selector,
) -> Result<(), AutomationError> {
    match first_visible(surface, buttons).await? {
        Some(button) => surface.click(button).await,
        None => surface.press_key(field, "Enter").await,
    }
}

async fn ensure_parent(path: &Path) -> CopilotResult<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CopilotError::io(parent, e)),
        None => Ok(()),
    }
}
