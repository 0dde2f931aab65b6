//! Runtime settings
//!
//! One explicit [`Settings`] value is built at startup (defaults, then the
//! environment with optional `.env` support, then CLI overrides) and shared by
//! reference with the controller and the auth negotiator.

use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://copilot.microsoft.com";
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 10_000;
pub const DEFAULT_STORAGE_STATE_PATH: &str = ".copilot/auth/storage-state.json";
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "output";

/// Appended to the final message when Markdown output is forced
pub const MARKDOWN_INSTRUCTION: &str =
    "Respond strictly in raw, unrendered, well-structured Markdown which I can use in an .md file.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::InvalidEnumVariant {
                field: "LOG_LEVEL",
                value: value.to_string(),
            }),
        }
    }
}

/// Bounds for every wait the automation performs.
///
/// Two classes: short interaction waits (element lookups, MFA detection) and
/// long waits (navigation, response completion, transfers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub interaction: Duration,
    pub navigation: Duration,
    pub completion: Duration,
    pub download_offer: Duration,
    pub download_transfer: Duration,
    pub poll_interval: Duration,
    pub auth: Duration,
    pub mfa_detect: Duration,
    pub manual_save_interval: Duration,
    pub manual_max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            interaction: Duration::from_secs(5),
            navigation: Duration::from_secs(45),
            completion: Duration::from_secs(90),
            download_offer: Duration::from_secs(45),
            download_transfer: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            auth: Duration::from_secs(45),
            mfa_detect: Duration::from_secs(5),
            manual_save_interval: Duration::from_secs(5),
            manual_max: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub base_url: String,
    pub headless: bool,
    pub output_directory: PathBuf,
    pub storage_state_path: PathBuf,
    pub force_markdown_instruction: bool,
    pub normalize_response: bool,
    pub max_prompt_chars: usize,
    pub log_level: LogLevel,
    pub chrome_executable: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            headless: true,
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            storage_state_path: PathBuf::from(DEFAULT_STORAGE_STATE_PATH),
            force_markdown_instruction: true,
            normalize_response: true,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            log_level: LogLevel::default(),
            chrome_executable: None,
            timeouts: Timeouts::default(),
        }
    }
}

/// Programmatic overrides applied on top of loaded settings
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub base_url: Option<String>,
    pub headless: Option<bool>,
    pub output_directory: Option<PathBuf>,
    pub storage_state_path: Option<PathBuf>,
    pub force_markdown_instruction: Option<bool>,
    pub normalize_response: Option<bool>,
    pub max_prompt_chars: Option<usize>,
    pub log_level: Option<LogLevel>,
    pub chrome_executable: Option<PathBuf>,
    pub timeouts: Option<Timeouts>,
}

impl Settings {
    /// Loads settings from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(env_var)
    }

    /// Builds settings from an arbitrary key lookup. Unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let url = ["COPILOT_URL", "M365_COPILOT_URL"]
            .into_iter()
            .find_map(|key| get(key).map(|value| (key, value)));
        if let Some((key, value)) = url {
            settings.base_url = parse_url(key, &value)?;
        }
        if let Some(value) = get("BROWSER_HEADLESS") {
            settings.headless = parse_bool("BROWSER_HEADLESS", &value)?;
        }
        if let Some(value) = get("OUTPUT_DIRECTORY") {
            settings.output_directory = PathBuf::from(value);
        }
        if let Some(value) = get("COPILOT_STORAGE_STATE") {
            settings.storage_state_path = PathBuf::from(value);
        }
        if let Some(value) = get("COPILOT_FORCE_MARKDOWN") {
            settings.force_markdown_instruction = parse_bool("COPILOT_FORCE_MARKDOWN", &value)?;
        }
        if let Some(value) = get("COPILOT_NORMALIZE_MARKDOWN") {
            settings.normalize_response = parse_bool("COPILOT_NORMALIZE_MARKDOWN", &value)?;
        }
        if let Some(value) = get("COPILOT_MAX_PROMPT_CHARS") {
            settings.max_prompt_chars = parse_usize("COPILOT_MAX_PROMPT_CHARS", &value)?;
        }
        if let Some(value) = get("LOG_LEVEL") {
            settings.log_level = value.parse()?;
        }
        if let Some(value) = get("CHROME_EXECUTABLE") {
            settings.chrome_executable = Some(PathBuf::from(value));
        }

        let timeouts = &mut settings.timeouts;
        let duration_fields: [(&'static str, &mut Duration); 10] = [
            ("COPILOT_INTERACTION_TIMEOUT_SECS", &mut timeouts.interaction),
            ("COPILOT_NAVIGATION_TIMEOUT_SECS", &mut timeouts.navigation),
            ("COPILOT_COMPLETION_TIMEOUT_SECS", &mut timeouts.completion),
            ("COPILOT_DOWNLOAD_TIMEOUT_SECS", &mut timeouts.download_offer),
            (
                "COPILOT_DOWNLOAD_TRANSFER_TIMEOUT_SECS",
                &mut timeouts.download_transfer,
            ),
            ("COPILOT_POLL_INTERVAL_SECS", &mut timeouts.poll_interval),
            ("COPILOT_AUTH_TIMEOUT_SECS", &mut timeouts.auth),
            ("COPILOT_MFA_TIMEOUT_SECS", &mut timeouts.mfa_detect),
            (
                "COPILOT_MANUAL_SAVE_INTERVAL_SECS",
                &mut timeouts.manual_save_interval,
            ),
            ("COPILOT_MANUAL_TIMEOUT_SECS", &mut timeouts.manual_max),
        ];
        for (field, slot) in duration_fields {
            if let Some(value) = get(field) {
                *slot = parse_secs(field, &value)?;
            }
        }

        Ok(settings)
    }

    pub fn with_overrides(&self, overrides: SettingsOverrides) -> Settings {
        let mut next = self.clone();

        if let Some(value) = overrides.base_url {
            next.base_url = value;
        }
        if let Some(value) = overrides.headless {
            next.headless = value;
        }
        if let Some(value) = overrides.output_directory {
            next.output_directory = value;
        }
        if let Some(value) = overrides.storage_state_path {
            next.storage_state_path = value;
        }
        if let Some(value) = overrides.force_markdown_instruction {
            next.force_markdown_instruction = value;
        }
        if let Some(value) = overrides.normalize_response {
            next.normalize_response = value;
        }
        if let Some(value) = overrides.max_prompt_chars {
            next.max_prompt_chars = value;
        }
        if let Some(value) = overrides.log_level {
            next.log_level = value;
        }
        if let Some(value) = overrides.chrome_executable {
            next.chrome_executable = Some(value);
        }
        if let Some(value) = overrides.timeouts {
            next.timeouts = value;
        }

        next
    }

    /// The instruction appended to final messages, if forced Markdown is on
    pub fn final_instruction(&self) -> Option<&'static str> {
        self.force_markdown_instruction.then_some(MARKDOWN_INSTRUCTION)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("invalid URL '{value}' for {field}: expected http:// or https://")]
    InvalidUrl { field: &'static str, value: String },
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_usize(field: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_secs(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs = value
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })?;
    if secs == 0 {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_url(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Ok(trimmed.to_string())
    } else {
        Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        })
    }
}
