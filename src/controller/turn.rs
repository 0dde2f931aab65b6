//! One prompt/response exchange on the chat surface

use crate::automation::{first_visible, Automation, AutomationError};
use crate::config::Settings;
use crate::error::{CopilotError, CopilotResult};
use crate::retry::{poll_until, PollSchedule, Poller, WaitOutcome};
use crate::selectors::{describe, Selector, NOISY_PHRASES, SELECTORS, STATUS_PREFIXES};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// Repeat observations of the same text, with generation stopped, that count as complete
const STABLE_POLLS_REQUIRED: u32 = 2;

/// Only the most recent matches of each message selector are considered
const RECENT_TEXTS: usize = 12;

/// Response text as captured from the page, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

pub(super) struct TurnDriver<'a> {
    surface: &'a dyn Automation,
    settings: &'a Settings,
    cancel: &'a CancellationToken,
}

impl<'a> TurnDriver<'a> {
    pub(super) fn new(
        surface: &'a dyn Automation,
        settings: &'a Settings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            surface,
            settings,
            cancel,
        }
    }

    /// Types `message`, submits it and waits for the answer to settle.
    pub(super) async fn run_turn(
        &self,
        message: &str,
        part: usize,
        total: usize,
    ) -> CopilotResult<RawResponse> {
        let baseline = self.visible_texts().await?;
        self.submit(message).await?;
        tracing::debug!(part, total, chars = message.chars().count(), "Message submitted");

        match self.wait_for_completion(message, &baseline).await? {
            WaitOutcome::Ready(text) => {
                tracing::info!(part, total, chars = text.chars().count(), "Response complete");
                Ok(RawResponse {
                    text,
                    captured_at: Utc::now(),
                })
            }
            WaitOutcome::TimedOut => Err(CopilotError::ResponseTimeout {
                timeout: self.settings.timeouts.completion,
                part,
                total,
            }),
            WaitOutcome::Cancelled => Err(CopilotError::Cancelled),
        }
    }

    async fn submit(&self, message: &str) -> CopilotResult<()> {
        let surface = self.surface;
        let timeout = self.settings.timeouts.interaction;
        let schedule = PollSchedule::new(self.settings.timeouts.poll_interval, timeout);
        let found = poll_until(schedule, self.cancel, || async move {
            first_visible(surface, SELECTORS.prompt_input).await
        })
        .await?;
        let input = match found {
            WaitOutcome::Ready(input) => input,
            WaitOutcome::TimedOut => {
                return Err(CopilotError::WaitTimeout {
                    selector: describe(SELECTORS.prompt_input),
                    timeout,
                })
            }
            WaitOutcome::Cancelled => return Err(CopilotError::Cancelled),
        };

        surface.type_text(input, message).await?;
        match first_visible(surface, SELECTORS.send_button).await? {
            Some(button) => surface.click(button).await?,
            None => surface.press_key(input, "Enter").await?,
        }
        Ok(())
    }

    /// Polls until the best answer candidate stops changing and the stop
    /// button is gone.
    async fn wait_for_completion(
        &self,
        message: &str,
        baseline: &HashSet<String>,
    ) -> CopilotResult<WaitOutcome<String>> {
        let timeouts = &self.settings.timeouts;
        let mut poller = Poller::new(
            PollSchedule::new(timeouts.poll_interval, timeouts.completion),
            self.cancel,
        );
        let sent = squash(message);
        let mut last: Option<String> = None;
        let mut stable = 0u32;

        loop {
            if let Err(stop) = poller.next_attempt().await {
                tracing::debug!(elapsed = ?poller.elapsed(), stable, "Completion wait ended");
                return Ok(stop.into());
            }

            let generating = first_visible(self.surface, SELECTORS.stop_generating)
                .await?
                .is_some();
            let candidates = self.candidates(&sent, baseline).await?;
            let Some(best) = best_candidate(&candidates) else {
                last = None;
                stable = 0;
                continue;
            };

            if !generating && last.as_deref() == Some(best) {
                stable += 1;
            } else {
                stable = 0;
            }
            if stable >= STABLE_POLLS_REQUIRED {
                return Ok(WaitOutcome::Ready(best.to_string()));
            }
            last = Some(best.to_string());
        }
    }

    /// New texts that could be the answer to `sent`
    async fn candidates(
        &self,
        sent: &str,
        baseline: &HashSet<String>,
    ) -> Result<Vec<String>, AutomationError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for selector in SELECTORS.messages {
            for text in recent(self.read_texts(selector).await?) {
                if baseline.contains(&text) || is_noise(&text, sent) {
                    continue;
                }
                if seen.insert(text.clone()) {
                    candidates.push(text);
                }
            }
        }
        Ok(candidates)
    }

    /// Every message text currently on the page
    async fn visible_texts(&self) -> Result<HashSet<String>, AutomationError> {
        let mut texts = HashSet::new();
        for selector in SELECTORS.messages {
            texts.extend(self.read_texts(selector).await?);
        }
        Ok(texts)
    }

    /// Trimmed, non-empty texts for `selector`; lookup failures read as nothing.
    async fn read_texts(&self, selector: &Selector) -> Result<Vec<String>, AutomationError> {
        match self.surface.read_all_texts(selector).await {
            Ok(texts) => Ok(texts
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()),
            Err(AutomationError::ContextClosed) => Err(AutomationError::ContextClosed),
            Err(e) => {
                tracing::debug!(selector = %selector, error = %e, "Message lookup failed");
                Ok(Vec::new())
            }
        }
    }
}

fn recent(texts: Vec<String>) -> impl Iterator<Item = String> {
    let skip = texts.len().saturating_sub(RECENT_TEXTS);
    texts.into_iter().skip(skip)
}

/// Echoes of the sent message (alone or inside a larger container), status
/// lines and suggestion chips
fn is_noise(text: &str, sent: &str) -> bool {
    (!sent.is_empty() && squash(text).contains(sent))
        || STATUS_PREFIXES.iter().any(|p| text.starts_with(p))
        || NOISY_PHRASES.iter().any(|p| text.contains(p))
}

/// Whitespace runs collapsed to single spaces
fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Highest-scoring candidate; the earliest wins a tie.
fn best_candidate(candidates: &[String]) -> Option<&str> {
    let mut best: Option<(&str, (u32, usize))> = None;
    for text in candidates {
        let key = (score(text), text.chars().count());
        match best {
            Some((_, top)) if key <= top => {}
            _ => best = Some((text, key)),
        }
    }
    best.map(|(text, _)| text)
}

/// Structure score favoring answers over one-line fragments
#[allow(clippy::cast_possible_truncation)]
fn score(text: &str) -> u32 {
    let lines: Vec<&str> = text.lines().map(str::trim_start).collect();
    let bullets = lines
        .iter()
        .filter(|l| l.starts_with("- ") || l.starts_with("* ") || l.starts_with("• "))
        .count();
    let mut score = match bullets {
        0 => 0,
        1 => 1,
        _ => 3,
    };
    if lines
        .iter()
        .take(3)
        .any(|l| l.starts_with('#') || l.trim_end().ends_with(':'))
    {
        score += 1;
    }
    score + (text.chars().count().min(2000) / 200) as u32
}
