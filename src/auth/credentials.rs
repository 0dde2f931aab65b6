//! Sign-in secrets and where they come from

use crate::error::{CopilotError, CopilotResult};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

pub const USERNAME_KEY: &str = "M365_USERNAME";
pub const PASSWORD_KEY: &str = "M365_PASSWORD";
pub const OTP_SECRET_KEY: &str = "M365_OTP_SECRET";

/// Local fallback for secrets not set in the environment
pub const KEYRING_FILE: &str = ".keyring.json";

/// Service name the secrets are filed under in the OS credential store
pub const KEYRING_SERVICE: &str = "ms-copilot-automation";

/// Read-only secret lookup. Blank values count as absent.
pub trait SecretStore: Send + Sync {
    fn secret(&self, key: &str) -> Option<String>;
}

impl SecretStore for HashMap<String, String> {
    fn secret(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// Environment variables first, then the OS credential store, then a flat
/// JSON object in `.keyring.json`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    keyring_path: PathBuf,
    /// `None` skips the OS credential store
    keyring_service: Option<String>,
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::with_keyring(KEYRING_FILE)
    }

    pub fn with_keyring(path: impl Into<PathBuf>) -> Self {
        Self {
            keyring_path: path.into(),
            keyring_service: Some(KEYRING_SERVICE.to_string()),
        }
    }

    pub fn with_keyring_service(mut self, service: Option<&str>) -> Self {
        self.keyring_service = service.map(str::to_string);
        self
    }

    /// Lookup failures (no entry, no store backend, access denied) fall through.
    fn lookup_os_keyring(&self, key: &str) -> Option<String> {
        let service = self.keyring_service.as_deref()?;
        let password = keyring::Entry::new(service, key).and_then(|entry| entry.get_password());
        match password {
            Ok(value) if !value.trim().is_empty() => Some(value),
            Ok(_) | Err(keyring::Error::NoEntry) => {
                tracing::debug!(service, key, "No OS keyring entry");
                None
            }
            Err(e) => {
                tracing::debug!(service, key, error = %e, "OS keyring unavailable");
                None
            }
        }
    }

    fn lookup_keyring_file(&self, key: &str) -> Option<String> {
        let contents = std::fs::read_to_string(&self.keyring_path).ok()?;
        match serde_json::from_str::<HashMap<String, String>>(&contents) {
            Ok(secrets) => secrets.secret(key),
            Err(e) => {
                tracing::warn!(
                    path = %self.keyring_path.display(),
                    error = %e,
                    "Failed to read local keyring file"
                );
                None
            }
        }
    }
}

impl SecretStore for EnvSecretStore {
    fn secret(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.lookup_os_keyring(key))
            .or_else(|| self.lookup_keyring_file(key))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub otp_secret: Option<String>,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: Option<String>,
        otp_secret: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password,
            otp_secret,
        }
    }

    /// Loads credentials, failing before any page interaction if the username is absent.
    pub fn from_store(store: &dyn SecretStore) -> CopilotResult<Self> {
        let username = store
            .secret(USERNAME_KEY)
            .ok_or(CopilotError::MissingCredentials {
                field: USERNAME_KEY,
            })?;
        Ok(Self {
            username,
            password: store.secret(PASSWORD_KEY),
            otp_secret: store.secret(OTP_SECRET_KEY),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("otp_secret", &redact(&self.otp_secret))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_store() {
        let secrets = store(&[
            (USERNAME_KEY, "user@example.com"),
            (PASSWORD_KEY, "hunter2"),
            (OTP_SECRET_KEY, "  "),
        ]);
        let creds = Credentials::from_store(&secrets).unwrap();
        assert_eq!(creds.username, "user@example.com");
        assert_eq!(creds.password.as_deref(), Some("hunter2"));
        assert_eq!(creds.otp_secret, None);
    }

    #[test]
    fn test_missing_username() {
        let secrets = store(&[(PASSWORD_KEY, "hunter2")]);
        let err = Credentials::from_store(&secrets).unwrap_err();
        assert!(matches!(
            err,
            CopilotError::MissingCredentials {
                field: USERNAME_KEY
            }
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new(
            "user@example.com",
            Some("hunter2".to_string()),
            Some("JBSWY3DPEHPK3PXP".to_string()),
        );
        let debug = format!("{creds:?}");
        assert!(debug.contains("user@example.com"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn test_keyring_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        std::fs::write(
            &path,
            r#"{"COPILOT_TEST_KEYRING_ONLY": "from-file", "COPILOT_TEST_BLANK": ""}"#,
        )
        .unwrap();

        let store = EnvSecretStore::with_keyring(&path);
        assert_eq!(
            store.secret("COPILOT_TEST_KEYRING_ONLY").as_deref(),
            Some("from-file")
        );
        assert_eq!(store.secret("COPILOT_TEST_BLANK"), None);
        assert_eq!(store.secret("COPILOT_TEST_ABSENT"), None);
    }

    #[test]
    fn test_os_keyring_miss_falls_through_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        std::fs::write(&path, r#"{"COPILOT_TEST_FILE_AFTER_OS": "from-file"}"#).unwrap();

        let service = format!("copilot-automation-test-{}", uuid::Uuid::new_v4());
        let store = EnvSecretStore::with_keyring(&path).with_keyring_service(Some(service.as_str()));
        assert_eq!(
            store.lookup_os_keyring("COPILOT_TEST_FILE_AFTER_OS"),
            None
        );
        assert_eq!(
            store.secret("COPILOT_TEST_FILE_AFTER_OS").as_deref(),
            Some("from-file")
        );
    }

    #[test]
    fn test_os_keyring_can_be_skipped() {
        let store = EnvSecretStore::with_keyring("missing.json").with_keyring_service(None);
        assert_eq!(store.lookup_os_keyring(USERNAME_KEY), None);
        assert_eq!(store.secret("COPILOT_TEST_NOWHERE"), None);
    }

    #[test]
    fn test_malformed_keyring_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(EnvSecretStore::with_keyring(&path).secret("ANY_KEY"), None);
    }
}
