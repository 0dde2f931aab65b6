//! Attaching a local file to the next prompt

use crate::automation::{first_visible, Automation, AutomationError};
use crate::config::Settings;
use crate::error::{CopilotError, CopilotResult, ErrorKind};
use crate::retry::{poll_until, retry, PollSchedule, RetryPolicy, WaitOutcome};
use crate::selectors::{describe, SELECTORS};
use std::ffi::OsStr;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Upload limit enforced by the service
pub const MAX_ATTACHMENT_BYTES: u64 = 100 * 1024 * 1024;

/// File types the chat surface accepts
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "doc", "docx", "docm", "xls", "xlsx", "xlsm", "xlsb", "csv", "md", "py", "js",
    "json", "xml", "html", "css", "ppt", "pptx",
];

/// A local file that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

/// Checks `path` without touching the page.
pub async fn validate(path: &Path) -> CopilotResult<Attachment> {
    let invalid = |reason: String| CopilotError::InvalidInput(format!("{}: {reason}", path.display()));

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            return Err(invalid("file does not exist".to_string()))
        }
        Err(e) => return Err(invalid(format!("cannot read file ({e})"))),
    };
    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    let size_bytes = metadata.len();
    if size_bytes == 0 {
        return Err(invalid("file is empty".to_string()));
    }
    if size_bytes > MAX_ATTACHMENT_BYTES {
        return Err(invalid(format!(
            "file is {size_bytes} bytes; the limit is {MAX_ATTACHMENT_BYTES}"
        )));
    }

    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);
    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => {}
        Some(ext) => return Err(invalid(format!("unsupported file type .{ext}"))),
        None => return Err(invalid("file has no extension".to_string())),
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Attachment {
        path: path.to_path_buf(),
        name,
        size_bytes,
    })
}

/// Uploads `attachment` and waits until the page shows it as attached.
///
/// A chip that does not appear in time gets one more bounded wait.
pub async fn attach(
    surface: &dyn Automation,
    attachment: &Attachment,
    settings: &Settings,
    cancel: &CancellationToken,
) -> CopilotResult<()> {
    let timeouts = &settings.timeouts;
    if let Some(button) = first_visible(surface, SELECTORS.attach_button).await? {
        surface.click(button).await?;
    }
    upload(surface, &attachment.path).await?;

    let schedule = PollSchedule::new(timeouts.poll_interval, timeouts.interaction);
    retry(
        RetryPolicy::ONCE,
        cancel,
        |e: &CopilotError| matches!(e.kind(), ErrorKind::WaitTimeout | ErrorKind::ElementNotFound),
        || async move {
            match wait_for_attachment(surface, schedule, cancel).await? {
                WaitOutcome::Ready(()) => Ok::<_, CopilotError>(()),
                WaitOutcome::TimedOut => Err(CopilotError::WaitTimeout {
                    selector: describe(SELECTORS.attachment_chip),
                    timeout: schedule.timeout,
                }),
                WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
            }
        },
    )
    .await?;

    if let Some(progress) = first_visible(surface, SELECTORS.upload_progress).await? {
        surface.wait_for_hidden(progress, timeouts.navigation).await?;
    }
    tracing::info!(
        file = %attachment.name,
        size_bytes = attachment.size_bytes,
        "File attached"
    );
    Ok(())
}

/// Polls for the attachment chip.
pub async fn wait_for_attachment(
    surface: &dyn Automation,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<()>, AutomationError> {
    poll_until(schedule, cancel, || async move {
        let chip = first_visible(surface, SELECTORS.attachment_chip).await?;
        Ok::<_, AutomationError>(chip.map(|_| ()))
    })
    .await
}

/// Hands the file to the first file input that takes it
async fn upload(surface: &dyn Automation, path: &Path) -> CopilotResult<()> {
    for selector in SELECTORS.file_input {
        match surface.upload_file(selector, path).await {
            Ok(()) => return Ok(()),
            Err(AutomationError::ContextClosed) => return Err(AutomationError::ContextClosed.into()),
            Err(e) => tracing::debug!(selector = %selector, error = %e, "File input rejected upload"),
        }
    }
    Err(CopilotError::ElementNotFound {
        selector: describe(SELECTORS.file_input),
    })
}
