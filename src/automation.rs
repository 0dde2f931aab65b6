//! Browser automation surface
//!
//! The controller, the auth negotiator and the artifact waiter only talk to
//! the page through the [`Automation`] trait. The production implementation
//! drives Chrome over CDP ([`chromium`]); tests use a scripted in-memory double.

pub mod chromium;
#[cfg(test)]
pub mod testing;

use crate::selectors::Selector;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timed out after {timeout:?} waiting for {selector}")]
    WaitTimeout { selector: String, timeout: Duration },

    #[error("Browsing context is closed")]
    ContextClosed,

    #[error("Storage snapshot error: {0}")]
    Snapshot(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Browser operation failed: {0}")]
    OperationFailed(String),
}

/// Options for acquiring a browsing context
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub interaction_timeout: Duration,
}

/// A finished transfer that has not yet been moved to its final location
pub struct PendingDownload {
    pub suggested_name: String,
    handle: Box<dyn DownloadHandle>,
}

impl PendingDownload {
    pub fn new(suggested_name: impl Into<String>, handle: Box<dyn DownloadHandle>) -> Self {
        Self {
            suggested_name: suggested_name.into(),
            handle,
        }
    }

    /// Moves the transferred bytes to `dest`, returning the byte count.
    pub async fn save(self, dest: &Path) -> Result<u64, AutomationError> {
        self.handle.save(dest).await
    }
}

impl std::fmt::Debug for PendingDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDownload")
            .field("suggested_name", &self.suggested_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait DownloadHandle: Send {
    async fn save(self: Box<Self>, dest: &Path) -> Result<u64, AutomationError>;
}

/// Page-level operations, all bounded by the implementation's own timeouts.
///
/// `is_visible` is an instant check; the `wait_for_*` methods block up to the
/// given timeout. Selectors that match several elements resolve to the first
/// visible one.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError>;

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), AutomationError>;

    async fn click(&self, selector: &Selector) -> Result<(), AutomationError>;

    async fn press_key(&self, selector: &Selector, key: &str) -> Result<(), AutomationError>;

    async fn is_visible(&self, selector: &Selector) -> Result<bool, AutomationError>;

    async fn wait_for_visible(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError>;

    async fn wait_for_hidden(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError>;

    async fn read_text(&self, selector: &Selector) -> Result<String, AutomationError>;

    /// Inner text of every match, in document order
    async fn read_all_texts(&self, selector: &Selector) -> Result<Vec<String>, AutomationError>;

    async fn upload_file(&self, selector: &Selector, path: &Path) -> Result<(), AutomationError>;

    /// Drops completed transfers nobody waited for; returns how many.
    async fn discard_downloads(&self) -> Result<usize, AutomationError>;

    /// Blocks until a transfer started by the page completes.
    async fn wait_for_download(
        &self,
        timeout: Duration,
    ) -> Result<PendingDownload, AutomationError>;

    async fn persist_state(&self, path: &Path) -> Result<(), AutomationError>;

    async fn load_state(&self, path: &Path) -> Result<(), AutomationError>;

    async fn close(&self) -> Result<(), AutomationError>;
}

#[async_trait]
impl<T: Automation + ?Sized> Automation for Arc<T> {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        (**self).navigate(url).await
    }

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), AutomationError> {
        (**self).type_text(selector, text).await
    }

    async fn click(&self, selector: &Selector) -> Result<(), AutomationError> {
        (**self).click(selector).await
    }

    async fn press_key(&self, selector: &Selector, key: &str) -> Result<(), AutomationError> {
        (**self).press_key(selector, key).await
    }

    async fn is_visible(&self, selector: &Selector) -> Result<bool, AutomationError> {
        (**self).is_visible(selector).await
    }

    async fn wait_for_visible(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        (**self).wait_for_visible(selector, timeout).await
    }

    async fn wait_for_hidden(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        (**self).wait_for_hidden(selector, timeout).await
    }

    async fn read_text(&self, selector: &Selector) -> Result<String, AutomationError> {
        (**self).read_text(selector).await
    }

    async fn read_all_texts(&self, selector: &Selector) -> Result<Vec<String>, AutomationError> {
        (**self).read_all_texts(selector).await
    }

    async fn upload_file(&self, selector: &Selector, path: &Path) -> Result<(), AutomationError> {
        (**self).upload_file(selector, path).await
    }

    async fn discard_downloads(&self) -> Result<usize, AutomationError> {
        (**self).discard_downloads().await
    }

    async fn wait_for_download(
        &self,
        timeout: Duration,
    ) -> Result<PendingDownload, AutomationError> {
        (**self).wait_for_download(timeout).await
    }

    async fn persist_state(&self, path: &Path) -> Result<(), AutomationError> {
        (**self).persist_state(path).await
    }

    async fn load_state(&self, path: &Path) -> Result<(), AutomationError> {
        (**self).load_state(path).await
    }

    async fn close(&self) -> Result<(), AutomationError> {
        (**self).close().await
    }
}

/// Acquires a browsing context
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn Automation>, AutomationError>;
}

/// First selector of `candidates` that is visible right now.
///
/// Lookup failures other than a closed context count as "not visible" so one
/// stale selector cannot break a whole group.
pub async fn first_visible<'a>(
    surface: &dyn Automation,
    candidates: &'a [Selector],
) -> Result<Option<&'a Selector>, AutomationError> {
    for selector in candidates {
        match surface.is_visible(selector).await {
            Ok(true) => return Ok(Some(selector)),
            Ok(false) => {}
            Err(AutomationError::ContextClosed) => return Err(AutomationError::ContextClosed),
            Err(e) => {
                tracing::debug!(selector = %selector, error = %e, "Visibility check failed");
            }
        }
    }
    Ok(None)
}
