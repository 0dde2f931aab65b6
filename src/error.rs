//! Error taxonomy for the automation core
//!
//! Every failure that crosses the public API is a [`CopilotError`]. Fatal
//! variants carry a remediation hint for the operator; expected outcomes such
//! as "no artifact was offered" are not errors at all and live in
//! [`crate::artifact::DownloadOutcome`].

use crate::automation::AutomationError;
use crate::config::ConfigError;
use crate::selectors::SELECTOR_TABLE_VERSION;
use crate::session::TransitionError;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type CopilotResult<T> = Result<T, CopilotError>;

/// Coarse classification used for session bookkeeping and exit reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Environment,
    MissingCredentials,
    Authentication,
    CredentialsRejected,
    MfaTimeout,
    ElementNotFound,
    WaitTimeout,
    ResponseTimeout,
    DownloadTimeout,
    InvalidInput,
    InvalidState,
    Cancelled,
    Automation,
    Config,
    Io,
}

#[derive(Debug, Error)]
pub enum CopilotError {
    #[error("Browser environment unavailable: {0}")]
    Environment(String),

    #[error("Missing credentials: {field} is not set")]
    MissingCredentials { field: &'static str },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Credentials rejected by the sign-in page: {0}")]
    CredentialsRejected(String),

    #[error("MFA challenge not completed after {attempts} attempt(s)")]
    MfaTimeout { attempts: u32 },

    #[error("Element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("Timed out after {timeout:?} waiting for {selector}")]
    WaitTimeout { selector: String, timeout: Duration },

    #[error("No complete response within {timeout:?} (part {part}/{total})")]
    ResponseTimeout {
        timeout: Duration,
        part: usize,
        total: usize,
    },

    #[error("Download did not complete within {timeout:?}")]
    DownloadTimeout { timeout: Duration },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Browser automation failed: {0}")]
    Automation(AutomationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CopilotError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Environment(_) => ErrorKind::Environment,
            Self::MissingCredentials { .. } => ErrorKind::MissingCredentials,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::CredentialsRejected(_) => ErrorKind::CredentialsRejected,
            Self::MfaTimeout { .. } => ErrorKind::MfaTimeout,
            Self::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            Self::WaitTimeout { .. } => ErrorKind::WaitTimeout,
            Self::ResponseTimeout { .. } => ErrorKind::ResponseTimeout,
            Self::DownloadTimeout { .. } => ErrorKind::DownloadTimeout,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidState { .. } | Self::Transition(_) => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Automation(_) => ErrorKind::Automation,
            Self::Config(_) => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// The browsing context is gone; the session cannot continue.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Automation(AutomationError::ContextClosed))
    }

    /// Errors the operator has to fix before a retry can succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Environment
                | ErrorKind::MissingCredentials
                | ErrorKind::Authentication
                | ErrorKind::CredentialsRejected
                | ErrorKind::MfaTimeout
                | ErrorKind::InvalidInput
                | ErrorKind::Config
        ) || self.is_unrecoverable()
    }

    /// Operator-facing hint printed next to the error message
    pub fn remediation(&self) -> Option<String> {
        let hint = match self {
            Self::Environment(_) => {
                "Install Google Chrome or Chromium, or point CHROME_EXECUTABLE at a browser binary."
                    .to_string()
            }
            Self::MissingCredentials { field } => format!(
                "Set {field} in the environment, the OS keyring or .keyring.json, or run `copilot-automation auth --manual` to refresh the saved session."
            ),
            Self::Authentication(_) => {
                "Run `copilot-automation auth --manual` and complete the sign-in in the browser window."
                    .to_string()
            }
            Self::CredentialsRejected(_) => {
                "Check M365_USERNAME and M365_PASSWORD, or sign in with `copilot-automation auth --manual`."
                    .to_string()
            }
            Self::MfaTimeout { .. } => {
                "Verify M365_OTP_SECRET and the system clock, or sign in with `copilot-automation auth --manual`."
                    .to_string()
            }
            Self::ElementNotFound { .. } | Self::WaitTimeout { .. } => format!(
                "The Copilot page layout may have changed; the selector table (version {SELECTOR_TABLE_VERSION}) may need an update. Retry with --headed to inspect the page."
            ),
            Self::ResponseTimeout { .. } => {
                "Copilot is slow or throttling. Retry later or raise COPILOT_COMPLETION_TIMEOUT_SECS."
                    .to_string()
            }
            Self::DownloadTimeout { .. } => {
                "Raise --download-timeout or COPILOT_DOWNLOAD_TRANSFER_TIMEOUT_SECS and retry."
                    .to_string()
            }
            Self::InvalidInput(_) => {
                "Check the file path, size (100 MiB max) and type before retrying.".to_string()
            }
            Self::InvalidState { .. } | Self::Transition(_) => {
                "Start and authenticate the session before issuing this operation.".to_string()
            }
            Self::Automation(AutomationError::ContextClosed) => {
                "The browser window was closed. Start a new session.".to_string()
            }
            Self::Config(_) => "Fix the configuration value named above.".to_string(),
            Self::Cancelled | Self::Automation(_) | Self::Io { .. } => return None,
        };
        Some(hint)
    }
}

impl From<AutomationError> for CopilotError {
    fn from(e: AutomationError) -> Self {
        match e {
            AutomationError::Launch(message) => Self::Environment(message),
            AutomationError::ElementNotFound(selector) => Self::ElementNotFound { selector },
            AutomationError::WaitTimeout { selector, timeout } => {
                Self::WaitTimeout { selector, timeout }
            }
            other => Self::Automation(other),
        }
    }
}
