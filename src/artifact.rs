//! Retrieving a file the remote service generated
//!
//! Polls for a download affordance, clicks it and moves the finished transfer
//! into the target directory. No affordance within the offer window is an
//! expected outcome ([`DownloadOutcome::NoArtifact`]), not an error.

use crate::automation::{first_visible, Automation, AutomationError};
use crate::error::{CopilotError, CopilotResult};
use crate::retry::{poll_until, PollSchedule, WaitOutcome};
use crate::selectors::SELECTORS;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FALLBACK_NAME: &str = "copilot-download";
const MAX_NAME_CHARS: usize = 200;
const MAX_EXTENSION_CHARS: usize = 16;
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    /// Name the page suggested
    pub source_name: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Saved(DownloadResult),
    NoArtifact { waited: Duration },
}

/// Waits up to `schedule.timeout` for a download affordance and saves the file it yields.
pub async fn wait_for_artifact(
    surface: &dyn Automation,
    target_dir: &Path,
    schedule: PollSchedule,
    transfer_timeout: Duration,
    cancel: &CancellationToken,
) -> CopilotResult<DownloadOutcome> {
    let offer = poll_until(schedule, cancel, || async move {
        first_visible(surface, SELECTORS.download_buttons).await
    })
    .await?;

    let button = match offer {
        WaitOutcome::Ready(button) => button,
        WaitOutcome::TimedOut => {
            tracing::info!(waited = ?schedule.timeout, "No downloadable artifact offered");
            return Ok(DownloadOutcome::NoArtifact {
                waited: schedule.timeout,
            });
        }
        WaitOutcome::Cancelled => return Err(CopilotError::Cancelled),
    };

    tracing::info!(selector = %button, "Download affordance found");
    let stale = surface.discard_downloads().await?;
    if stale > 0 {
        tracing::debug!(stale, "Dropped transfers from earlier requests");
    }
    surface.click(button).await?;

    let pending = tokio::select! {
        () = cancel.cancelled() => return Err(CopilotError::Cancelled),
        pending = surface.wait_for_download(transfer_timeout) => pending,
    };
    let pending = match pending {
        Ok(pending) => pending,
        Err(AutomationError::WaitTimeout { .. }) => {
            return Err(CopilotError::DownloadTimeout {
                timeout: transfer_timeout,
            })
        }
        Err(e) => return Err(e.into()),
    };

    tokio::fs::create_dir_all(target_dir)
        .await
        .map_err(|e| CopilotError::io(target_dir, e))?;
    let name = sanitize_filename(&pending.suggested_name);
    let destination = unique_destination(target_dir, &name).await;
    let source_name = pending.suggested_name.clone();
    let size_bytes = pending.save(&destination).await?;

    tracing::info!(
        path = %destination.display(),
        size_bytes,
        "Artifact saved"
    );
    Ok(DownloadOutcome::Saved(DownloadResult {
        source_name,
        local_path: destination,
        size_bytes,
    }))
}

/// Makes a page-suggested name safe to use as a single path component.
pub fn sanitize_filename(suggested: &str) -> String {
    let base = suggested.rsplit(['/', '\\']).next().unwrap_or(suggested);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();
    let trimmed = trim_name(&cleaned);
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    if trimmed.chars().count() <= MAX_NAME_CHARS {
        return trimmed.to_string();
    }

    let (stem, extension) = split_extension(trimmed);
    let extension_chars = extension.chars().count();
    if extension_chars > 1 && extension_chars <= MAX_EXTENSION_CHARS {
        let stem: String = stem.chars().take(MAX_NAME_CHARS - extension_chars).collect();
        format!("{}{extension}", trim_name(&stem))
    } else {
        trim_name(&trimmed.chars().take(MAX_NAME_CHARS).collect::<String>()).to_string()
    }
}

fn trim_name(name: &str) -> &str {
    name.trim_matches(|c: char| c == '.' || c.is_whitespace())
}

/// `("report", ".pdf")`; a leading dot is part of the stem
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` not already taken
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, extension) = split_extension(name);
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){extension}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}
