//! Session controller
//!
//! Owns one browsing context and exposes the chat, upload and download
//! operations. Every state change goes through [`Session::apply`]; the
//! controller only decides which event a result maps to.
//!
//! ```text
//! start -> ensure_authenticated -> chat / ask_with_file / download ... -> close
//! ```

mod attachment;
mod turn;

pub use turn::RawResponse;

use crate::artifact::{wait_for_artifact, DownloadOutcome};
use crate::auth::{AuthMethod, AuthNegotiator, AuthOutcome, AuthStrategy, SecretStore};
use crate::automation::{Automation, AutomationError, BrowserLauncher, LaunchOptions};
use crate::chunking::plan_messages;
use crate::config::Settings;
use crate::error::{CopilotError, CopilotResult};
use crate::normalize::{decode_entities, normalize};
use crate::retry::PollSchedule;
use crate::selectors::SELECTORS;
use crate::session::{Event, Operation, Session, SessionState, TransitionError};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turn::TurnDriver;

/// Caller-side handle that interrupts the controller's current operation.
///
/// A cancellation issued while the controller is idle interrupts the next
/// operation. Once an interrupted operation returns, the controller arms a
/// fresh token, so later operations run normally and this handle keeps working.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    current: Arc<Mutex<CancellationToken>>,
}

impl Interrupt {
    pub fn cancel(&self) {
        self.token().cancel();
    }

    fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces a spent token; returns true if one was replaced.
    fn rearm(&self) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_cancelled() {
            *current = CancellationToken::new();
            true
        } else {
            false
        }
    }
}

pub struct SessionController {
    settings: Arc<Settings>,
    launcher: Arc<dyn BrowserLauncher>,
    negotiator: AuthNegotiator,
    session: Session,
    surface: Option<Box<dyn Automation>>,
    interrupt: Interrupt,
    /// Token of the operation in flight, taken from `interrupt` when it begins
    cancel: CancellationToken,
    /// Turns answered in this session; `download` needs at least one
    completed_turns: u32,
}

impl SessionController {
    pub fn new(
        settings: Arc<Settings>,
        launcher: Arc<dyn BrowserLauncher>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let interrupt = Interrupt::default();
        let cancel = interrupt.token();
        let session = Session::new(&settings);
        let negotiator = AuthNegotiator::new(Arc::clone(&settings), secrets);
        Self {
            settings,
            launcher,
            negotiator,
            session,
            surface: None,
            interrupt,
            cancel,
            completed_turns: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Acquires a browsing context.
    pub async fn start(&mut self) -> CopilotResult<()> {
        self.session.apply(Event::Start)?;
        let timeouts = &self.settings.timeouts;
        let options = LaunchOptions {
            headless: self.session.headless,
            chrome_executable: self.settings.chrome_executable.clone(),
            navigation_timeout: timeouts.navigation,
            interaction_timeout: timeouts.interaction,
        };

        match self.launcher.launch(&options).await {
            Ok(surface) => {
                self.surface = Some(surface);
                self.session.apply(Event::ContextAcquired)?;
                tracing::info!(headless = options.headless, "Browsing context acquired");
                Ok(())
            }
            Err(e) => {
                let err = match CopilotError::from(e) {
                    err @ CopilotError::Environment(_) => err,
                    other => CopilotError::Environment(other.to_string()),
                };
                self.fault(&err);
                Err(err)
            }
        }
    }

    /// Reuses the saved session if the remote still accepts it, otherwise
    /// signs in with stored credentials.
    pub async fn ensure_authenticated(&mut self) -> CopilotResult<AuthOutcome> {
        self.require_authenticating("authenticate")?;
        self.cancel = self.interrupt.token();
        let result = self.run_auth(None).await;
        self.settle_auth(result)
    }

    /// Runs `strategy` unconditionally, without trying the saved session first.
    pub async fn authenticate(&mut self, strategy: AuthStrategy) -> CopilotResult<AuthOutcome> {
        self.require_authenticating("authenticate")?;
        self.cancel = self.interrupt.token();
        let result = self.run_auth(Some(strategy)).await;
        self.settle_auth(result)
    }

    /// Sends `prompt` (split into parts if it is too long) and returns the
    /// answer to the final part.
    pub async fn chat(&mut self, prompt: &str) -> CopilotResult<String> {
        self.begin(Operation::Chat)?;
        let result = self.converse(prompt).await;
        self.finish(result)
    }

    /// Attaches `path` and sends `prompt` about it.
    ///
    /// The file is validated before anything touches the page. An empty
    /// prompt asks for a review of the file.
    pub async fn ask_with_file(&mut self, path: &Path, prompt: &str) -> CopilotResult<String> {
        self.begin(Operation::AskWithFile)?;
        let result = self.converse_with_file(path, prompt).await;
        self.finish(result)
    }

    /// Saves the artifact offered by the last answer into `target_dir`.
    ///
    /// `timeout` bounds the wait for a download affordance; the configured
    /// offer timeout applies when it is `None`.
    pub async fn download(
        &mut self,
        target_dir: &Path,
        timeout: Option<Duration>,
    ) -> CopilotResult<DownloadOutcome> {
        if self.completed_turns == 0 && *self.session.state() == SessionState::Ready {
            return Err(CopilotError::InvalidState {
                operation: Operation::Download.as_str(),
                state: "ready with no completed turn".to_string(),
            });
        }
        self.begin(Operation::Download)?;
        let result = self.fetch_artifact(target_dir, timeout).await;
        self.finish(result)
    }

    /// Releases the browsing context. Safe to call in any state, any number of times.
    pub async fn close(&mut self) -> CopilotResult<()> {
        if self.session.state().is_terminal() {
            return Ok(());
        }
        self.session.apply(Event::Close)?;
        if let Some(surface) = self.surface.take() {
            if let Err(e) = surface.close().await {
                tracing::warn!(error = %e, "Failed to close browsing context cleanly");
            }
        }
        self.session.apply(Event::Released)?;
        Ok(())
    }

    fn require_authenticating(&self, operation: &'static str) -> CopilotResult<()> {
        if *self.session.state() == SessionState::Authenticating {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> CopilotError {
        CopilotError::InvalidState {
            operation,
            state: self.session.state().to_string(),
        }
    }

    fn live_surface(&self, operation: &'static str) -> CopilotResult<&dyn Automation> {
        self.surface
            .as_deref()
            .ok_or_else(|| self.invalid_state(operation))
    }

    /// Records an unrecoverable failure.
    fn fault(&mut self, err: &CopilotError) {
        if self.session.state().is_shutting_down() {
            return;
        }
        let event = Event::Fault {
            kind: err.kind(),
            message: err.to_string(),
        };
        if let Err(e) = self.session.apply(event) {
            tracing::debug!(error = %e, "Fault not recorded");
        }
    }

    fn begin(&mut self, operation: Operation) -> CopilotResult<()> {
        let applied = self
            .session
            .apply(Event::BeginOperation(operation))
            .map(|_| ());
        match applied {
            Ok(()) => {
                self.cancel = self.interrupt.token();
                Ok(())
            }
            Err(e @ TransitionError::Busy(_)) => Err(e.into()),
            Err(TransitionError::InvalidTransition { .. }) => {
                Err(self.invalid_state(operation.as_str()))
            }
        }
    }

    /// Maps the result of a busy operation back onto the state machine.
    fn finish<T>(&mut self, result: CopilotResult<T>) -> CopilotResult<T> {
        self.rearm();
        match &result {
            Err(e) if e.is_unrecoverable() => {
                tracing::error!(error = %e, "Browsing context lost");
                self.fault(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "Operation failed; session still usable");
                self.finish_operation();
            }
            Ok(_) => self.finish_operation(),
        }
        result
    }

    fn rearm(&self) {
        if self.interrupt.rearm() {
            tracing::debug!("Interrupted operation ended; cancellation re-armed");
        }
    }

    fn finish_operation(&mut self) {
        if let Err(e) = self.session.apply(Event::OperationFinished) {
            tracing::warn!(error = %e, "Operation end not recorded");
        }
    }

    async fn run_auth(&self, strategy: Option<AuthStrategy>) -> CopilotResult<AuthOutcome> {
        let surface = self.live_surface("authenticate")?;
        let strategy = match strategy {
            Some(strategy) => strategy,
            None => {
                if self.negotiator.restore_snapshot(surface, &self.cancel).await? {
                    return Ok(AuthOutcome {
                        method: AuthMethod::Snapshot,
                        snapshot_path: self.session.storage_state_path.clone(),
                        snapshots_written: 0,
                        mfa_used: false,
                    });
                }
                AuthStrategy::Scripted
            }
        };
        self.negotiator
            .negotiate(surface, strategy, &self.cancel)
            .await
    }

    fn settle_auth(&mut self, result: CopilotResult<AuthOutcome>) -> CopilotResult<AuthOutcome> {
        self.rearm();
        match result {
            Ok(outcome) => {
                self.session.apply(Event::Authenticated)?;
                tracing::info!(
                    method = %outcome.method,
                    mfa = outcome.mfa_used,
                    "Session authenticated"
                );
                Ok(outcome)
            }
            // Interrupted, not failed; the caller may try again
            Err(CopilotError::Cancelled) => Err(CopilotError::Cancelled),
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    async fn converse(&mut self, prompt: &str) -> CopilotResult<String> {
        if prompt.trim().is_empty() {
            return Err(CopilotError::InvalidInput("prompt is empty".to_string()));
        }
        let surface = self.live_surface(Operation::Chat.as_str())?;
        self.open_conversation(surface).await?;
        let answer = self.exchange(surface, prompt).await?;
        self.completed_turns += 1;
        Ok(answer)
    }

    async fn converse_with_file(&mut self, path: &Path, prompt: &str) -> CopilotResult<String> {
        let file = attachment::validate(path).await?;
        let surface = self.live_surface(Operation::AskWithFile.as_str())?;
        self.open_conversation(surface).await?;
        attachment::attach(surface, &file, &self.settings, &self.cancel).await?;

        let prompt = if prompt.trim().is_empty() {
            format!("Please review the attached file {}.", file.name)
        } else {
            prompt.to_string()
        };
        let answer = self.exchange(surface, &prompt).await?;
        self.completed_turns += 1;
        Ok(answer)
    }

    async fn fetch_artifact(
        &self,
        target_dir: &Path,
        timeout: Option<Duration>,
    ) -> CopilotResult<DownloadOutcome> {
        let surface = self.live_surface(Operation::Download.as_str())?;
        let timeouts = &self.settings.timeouts;
        let schedule = PollSchedule::new(
            timeouts.poll_interval,
            timeout.unwrap_or(timeouts.download_offer),
        );
        wait_for_artifact(
            surface,
            target_dir,
            schedule,
            timeouts.download_transfer,
            &self.cancel,
        )
        .await
    }

    /// Starts a fresh conversation and clears consent or onboarding overlays.
    async fn open_conversation(&self, surface: &dyn Automation) -> CopilotResult<()> {
        surface.navigate(&self.session.base_url).await?;
        for selector in SELECTORS.overlay_dismiss {
            let dismissed = match surface.is_visible(selector).await {
                Ok(true) => surface.click(selector).await,
                Ok(false) => continue,
                Err(e) => Err(e),
            };
            match dismissed {
                Ok(()) => tracing::debug!(selector = %selector, "Overlay dismissed"),
                Err(AutomationError::ContextClosed) => {
                    return Err(AutomationError::ContextClosed.into())
                }
                Err(e) => tracing::debug!(selector = %selector, error = %e, "Overlay not dismissed"),
            }
        }
        Ok(())
    }

    /// Sends every planned message in order; only the final answer is kept.
    async fn exchange(&self, surface: &dyn Automation, prompt: &str) -> CopilotResult<String> {
        let messages = plan_messages(
            prompt,
            self.settings.max_prompt_chars,
            self.settings.final_instruction(),
        );
        let total = messages.len();
        let driver = TurnDriver::new(surface, &self.settings, &self.cancel);

        let mut answer = None;
        for (i, message) in messages.iter().enumerate() {
            let part = i + 1;
            let response = driver.run_turn(message, part, total).await?;
            if part == total {
                answer = Some(response);
            } else {
                tracing::debug!(part, total, "Intermediate acknowledgement discarded");
            }
        }
        let Some(response) = answer else {
            return Err(CopilotError::InvalidInput("prompt is empty".to_string()));
        };
        self.finalize(surface, response).await
    }

    async fn finalize(
        &self,
        surface: &dyn Automation,
        response: RawResponse,
    ) -> CopilotResult<String> {
        if self.settings.normalize_response {
            return Ok(normalize(&response.text));
        }
        let raw = match raw_markdown(surface).await? {
            Some(markdown) => markdown,
            None => response.text,
        };
        Ok(decode_entities(&raw))
    }
}

/// The answer's raw Markdown block, when the page renders one
async fn raw_markdown(surface: &dyn Automation) -> CopilotResult<Option<String>> {
    for selector in SELECTORS.raw_markdown {
        match surface.read_all_texts(selector).await {
            Ok(texts) => {
                if let Some(last) = texts.into_iter().rev().find(|t| !t.trim().is_empty()) {
                    return Ok(Some(last));
                }
            }
            Err(AutomationError::ContextClosed) => return Err(AutomationError::ContextClosed.into()),
            Err(e) => tracing::debug!(selector = %selector, error = %e, "Raw Markdown lookup failed"),
        }
    }
    Ok(None)
}
