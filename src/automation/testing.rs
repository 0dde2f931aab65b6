//! Scripted in-memory automation surface for tests
//!
//! Simulates just enough of the Copilot page and the Microsoft sign-in flow to
//! drive the controller, the negotiator and the artifact waiter. Every call is
//! recorded so tests can assert on exactly what touched the page.

use super::{
    Automation, AutomationError, BrowserLauncher, DownloadHandle, LaunchOptions, PendingDownload,
};
use crate::selectors::{Selector, SELECTORS};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Navigate(String),
    Type { selector: String, text: String },
    Click(String),
    PressKey { selector: String, key: String },
    IsVisible(String),
    ReadText(String),
    ReadAllTexts(String),
    Upload { selector: String, path: PathBuf },
    DiscardDownloads,
    WaitForDownload,
    PersistState(PathBuf),
    LoadState(PathBuf),
    Close,
}

/// What the page does after a prompt is submitted
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Nothing ever appears
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    SignedOut,
    Username,
    Password,
    Mfa,
    StaySignedIn,
    SignedIn,
}

#[derive(Debug)]
struct Script {
    calls: Vec<Call>,
    closed: bool,
    close_on_submit: bool,

    stage: LoginStage,
    accept_snapshot: bool,
    reject_credentials: bool,
    require_mfa: bool,
    otp_rejections: u32,
    login_error_shown: bool,
    username: Option<String>,
    password: Option<String>,
    otp_draft: Option<String>,
    submitted_codes: Vec<String>,
    snapshots_written: u32,

    messages: Vec<String>,
    draft: String,
    replies: VecDeque<Reply>,
    generating_per_reply: u32,
    generating_checks: u32,
    raw_markdown: Option<String>,

    uploaded: Option<PathBuf>,
    attachment_hidden_checks: u32,

    offered_download: Option<(String, Vec<u8>)>,
    armed_download: Option<(String, Vec<u8>)>,
    /// Finished before anything was clicked; delivered first unless discarded
    stale_download: Option<(String, Vec<u8>)>,
    download_stalls: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            closed: false,
            close_on_submit: false,
            stage: LoginStage::SignedOut,
            accept_snapshot: false,
            reject_credentials: false,
            require_mfa: false,
            otp_rejections: 0,
            login_error_shown: false,
            username: None,
            password: None,
            otp_draft: None,
            submitted_codes: Vec::new(),
            snapshots_written: 0,
            messages: Vec::new(),
            draft: String::new(),
            replies: VecDeque::new(),
            generating_per_reply: 0,
            generating_checks: 0,
            raw_markdown: None,
            uploaded: None,
            attachment_hidden_checks: 0,
            offered_download: None,
            armed_download: None,
            stale_download: None,
            download_stalls: false,
        }
    }
}

impl Script {
    /// Pure visibility, without consuming any scripted countdowns
    fn shown(&self, selector: &Selector) -> bool {
        let is = |group: &[Selector]| group.contains(selector);

        if self.stage == LoginStage::SignedIn {
            return if is(SELECTORS.logged_in)
                || is(SELECTORS.prompt_input)
                || is(SELECTORS.send_button)
                || is(SELECTORS.attach_button)
            {
                true
            } else if is(SELECTORS.stop_generating) {
                self.generating_checks > 0
            } else if is(SELECTORS.attachment_chip) {
                self.uploaded.is_some() && self.attachment_hidden_checks == 0
            } else if is(SELECTORS.download_buttons) {
                self.offered_download.is_some()
            } else if is(SELECTORS.raw_markdown) {
                self.raw_markdown.is_some()
            } else {
                false
            };
        }

        if is(SELECTORS.sign_in) {
            self.stage == LoginStage::SignedOut
        } else if is(SELECTORS.username_input) {
            self.stage == LoginStage::Username
        } else if is(SELECTORS.password_input) {
            self.stage == LoginStage::Password
        } else if is(SELECTORS.login_error) {
            self.login_error_shown
        } else if is(SELECTORS.otp_input) {
            self.stage == LoginStage::Mfa
        } else if is(SELECTORS.stay_signed_in) {
            self.stage == LoginStage::StaySignedIn
        } else if is(SELECTORS.login_submit) || is(SELECTORS.otp_submit) {
            matches!(
                self.stage,
                LoginStage::Username | LoginStage::Password | LoginStage::Mfa
            )
        } else {
            false
        }
    }

    fn submit_prompt(&mut self) -> Result<(), AutomationError> {
        if self.close_on_submit {
            self.closed = true;
            return Err(AutomationError::ContextClosed);
        }
        let draft = std::mem::take(&mut self.draft);
        self.messages.push(draft);
        match self.replies.pop_front() {
            Some(Reply::Text(text)) => {
                self.messages.push(text);
                self.generating_checks = self.generating_per_reply;
            }
            Some(Reply::Silent) | None => {}
        }
        Ok(())
    }

    fn submit_login(&mut self) {
        if self.reject_credentials && matches!(self.stage, LoginStage::Password) {
            self.login_error_shown = true;
            return;
        }
        self.stage = match self.stage {
            LoginStage::Username if self.username.is_some() => LoginStage::Password,
            LoginStage::Password if self.password.is_some() => {
                if self.require_mfa {
                    LoginStage::Mfa
                } else {
                    LoginStage::StaySignedIn
                }
            }
            LoginStage::Mfa => match self.otp_draft.take() {
                Some(code) => {
                    self.submitted_codes.push(code);
                    if self.otp_rejections > 0 {
                        self.otp_rejections -= 1;
                        LoginStage::Mfa
                    } else {
                        LoginStage::StaySignedIn
                    }
                }
                None => LoginStage::Mfa,
            },
            other => other,
        };
    }
}

pub struct ScriptedSurface {
    script: Mutex<Script>,
}

impl Default for ScriptedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSurface {
    /// A signed-out page
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
        }
    }

    /// A page that already shows the signed-in chat surface
    pub fn signed_in() -> Self {
        let surface = Self::new();
        surface.script.lock().unwrap().stage = LoginStage::SignedIn;
        surface
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        f(&mut self.script.lock().unwrap());
        self
    }

    pub fn with_replies(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.edit(|s| s.replies.extend(replies))
    }

    pub fn with_text_replies<S: Into<String>>(self, replies: impl IntoIterator<Item = S>) -> Self {
        self.with_replies(replies.into_iter().map(|r| Reply::Text(r.into())))
    }

    /// The stop button stays visible for `checks` checks after each reply
    pub fn with_generating_checks(self, checks: u32) -> Self {
        self.edit(|s| s.generating_per_reply = checks)
    }

    pub fn with_raw_markdown(self, markdown: impl Into<String>) -> Self {
        let markdown = markdown.into();
        self.edit(|s| s.raw_markdown = Some(markdown))
    }

    /// Text already on the page before the first turn
    pub fn with_existing_messages<S: Into<String>>(
        self,
        messages: impl IntoIterator<Item = S>,
    ) -> Self {
        self.edit(|s| s.messages.extend(messages.into_iter().map(Into::into)))
    }

    pub fn accepting_snapshot(self) -> Self {
        self.edit(|s| s.accept_snapshot = true)
    }

    pub fn rejecting_credentials(self) -> Self {
        self.edit(|s| s.reject_credentials = true)
    }

    pub fn requiring_mfa(self) -> Self {
        self.edit(|s| s.require_mfa = true)
    }

    pub fn with_otp_rejections(self, rejections: u32) -> Self {
        self.edit(|s| s.otp_rejections = rejections)
    }

    /// The attachment chip stays hidden for `checks` checks after upload
    pub fn with_attachment_delay(self, checks: u32) -> Self {
        self.edit(|s| s.attachment_hidden_checks = checks)
    }

    pub fn offering_download(self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let offer = (name.into(), bytes.into());
        self.edit(|s| s.offered_download = Some(offer))
    }

    /// A transfer from an earlier request is still queued
    pub fn with_stale_download(self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let stale = (name.into(), bytes.into());
        self.edit(|s| s.stale_download = Some(stale))
    }

    /// The download affordance is shown but the transfer never completes
    pub fn with_stalled_download(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.edit(|s| {
            s.offered_download = Some((name, Vec::new()));
            s.download_stalls = true;
        })
    }

    /// The browsing context dies when a prompt is submitted
    pub fn closing_on_submit(self) -> Self {
        self.edit(|s| s.close_on_submit = true)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Prompts typed into the chat input, in order
    pub fn typed_prompts(&self) -> Vec<String> {
        let prompt_inputs: Vec<String> = SELECTORS
            .prompt_input
            .iter()
            .map(ToString::to_string)
            .collect();
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Type { selector, text } if prompt_inputs.contains(&selector) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn stage(&self) -> LoginStage {
        self.script.lock().unwrap().stage
    }

    pub fn submitted_codes(&self) -> Vec<String> {
        self.script.lock().unwrap().submitted_codes.clone()
    }

    pub fn snapshots_written(&self) -> u32 {
        self.script.lock().unwrap().snapshots_written
    }

    pub fn uploaded(&self) -> Option<PathBuf> {
        self.script.lock().unwrap().uploaded.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().unwrap().closed
    }

    /// Records `call` and fails if the context is gone
    fn enter(&self, call: Call) -> Result<std::sync::MutexGuard<'_, Script>, AutomationError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(call);
        if script.closed {
            return Err(AutomationError::ContextClosed);
        }
        Ok(script)
    }
}

#[async_trait]
impl Automation for ScriptedSurface {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        self.enter(Call::Navigate(url.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), AutomationError> {
        let mut script = self.enter(Call::Type {
            selector: selector.to_string(),
            text: text.to_string(),
        })?;
        if !script.shown(selector) {
            return Err(AutomationError::ElementNotFound(selector.to_string()));
        }
        match script.stage {
            LoginStage::Username => script.username = Some(text.to_string()),
            LoginStage::Password => script.password = Some(text.to_string()),
            LoginStage::Mfa => script.otp_draft = Some(text.to_string()),
            LoginStage::SignedIn => script.draft = text.to_string(),
            LoginStage::SignedOut | LoginStage::StaySignedIn => {}
        }
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<(), AutomationError> {
        let mut script = self.enter(Call::Click(selector.to_string()))?;
        if !script.shown(selector) {
            return Err(AutomationError::ElementNotFound(selector.to_string()));
        }
        let is = |group: &[Selector]| group.contains(selector);
        match script.stage {
            LoginStage::SignedOut if is(SELECTORS.sign_in) => script.stage = LoginStage::Username,
            LoginStage::StaySignedIn if is(SELECTORS.stay_signed_in) => {
                script.stage = LoginStage::SignedIn;
            }
            LoginStage::Username | LoginStage::Password | LoginStage::Mfa => script.submit_login(),
            LoginStage::SignedIn if is(SELECTORS.send_button) => script.submit_prompt()?,
            LoginStage::SignedIn if is(SELECTORS.download_buttons) => {
                script.armed_download = script.offered_download.take();
            }
            _ => {}
        }
        Ok(())
    }

    async fn press_key(&self, selector: &Selector, key: &str) -> Result<(), AutomationError> {
        let mut script = self.enter(Call::PressKey {
            selector: selector.to_string(),
            key: key.to_string(),
        })?;
        if key == "Enter" && script.stage == LoginStage::SignedIn {
            script.submit_prompt()?;
        }
        Ok(())
    }

    async fn is_visible(&self, selector: &Selector) -> Result<bool, AutomationError> {
        let mut script = self.enter(Call::IsVisible(selector.to_string()))?;
        if script.stage == LoginStage::SignedIn {
            if SELECTORS.stop_generating.contains(selector) && script.generating_checks > 0 {
                script.generating_checks -= 1;
                return Ok(true);
            }
            if SELECTORS.attachment_chip.contains(selector)
                && script.uploaded.is_some()
                && script.attachment_hidden_checks > 0
            {
                script.attachment_hidden_checks -= 1;
                return Ok(false);
            }
        }
        Ok(script.shown(selector))
    }

    async fn wait_for_visible(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        if self.is_visible(selector).await? {
            return Ok(());
        }
        tokio::time::sleep(timeout).await;
        Err(AutomationError::WaitTimeout {
            selector: selector.to_string(),
            timeout,
        })
    }

    async fn wait_for_hidden(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        if !self.is_visible(selector).await? {
            return Ok(());
        }
        tokio::time::sleep(timeout).await;
        Err(AutomationError::WaitTimeout {
            selector: selector.to_string(),
            timeout,
        })
    }

    async fn read_text(&self, selector: &Selector) -> Result<String, AutomationError> {
        let script = self.enter(Call::ReadText(selector.to_string()))?;
        if SELECTORS.raw_markdown.contains(selector) {
            if let Some(markdown) = &script.raw_markdown {
                return Ok(markdown.clone());
            }
        }
        if SELECTORS.login_error.contains(selector) && script.login_error_shown {
            return Ok("Your account or password is incorrect.".to_string());
        }
        Err(AutomationError::ElementNotFound(selector.to_string()))
    }

    async fn read_all_texts(&self, selector: &Selector) -> Result<Vec<String>, AutomationError> {
        let script = self.enter(Call::ReadAllTexts(selector.to_string()))?;
        if script.stage != LoginStage::SignedIn {
            return Ok(Vec::new());
        }
        if SELECTORS.messages.first() == Some(selector) {
            Ok(script.messages.clone())
        } else if SELECTORS.raw_markdown.contains(selector) {
            Ok(script.raw_markdown.iter().cloned().collect())
        } else {
            Ok(Vec::new())
        }
    }

    async fn upload_file(&self, selector: &Selector, path: &Path) -> Result<(), AutomationError> {
        let mut script = self.enter(Call::Upload {
            selector: selector.to_string(),
            path: path.to_path_buf(),
        })?;
        if script.stage != LoginStage::SignedIn || !SELECTORS.file_input.contains(selector) {
            return Err(AutomationError::ElementNotFound(selector.to_string()));
        }
        script.uploaded = Some(path.to_path_buf());
        Ok(())
    }

    async fn discard_downloads(&self) -> Result<usize, AutomationError> {
        let mut script = self.enter(Call::DiscardDownloads)?;
        Ok(usize::from(script.stale_download.take().is_some()))
    }

    async fn wait_for_download(
        &self,
        timeout: Duration,
    ) -> Result<PendingDownload, AutomationError> {
        let armed = {
            let mut script = self.enter(Call::WaitForDownload)?;
            let stalls = script.download_stalls;
            let armed = script.armed_download.take().filter(|_| !stalls);
            script.stale_download.take().or(armed)
        };
        match armed {
            Some((name, bytes)) => Ok(PendingDownload::new(
                name,
                Box::new(MemoryDownload { bytes }),
            )),
            None => {
                tokio::time::sleep(timeout).await;
                Err(AutomationError::WaitTimeout {
                    selector: "download completion".to_string(),
                    timeout,
                })
            }
        }
    }

    async fn persist_state(&self, path: &Path) -> Result<(), AutomationError> {
        self.enter(Call::PersistState(path.to_path_buf()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AutomationError::Snapshot(e.to_string()))?;
        }
        tokio::fs::write(path, br#"{"version":1,"cookies":[]}"#)
            .await
            .map_err(|e| AutomationError::Snapshot(e.to_string()))?;
        self.script.lock().unwrap().snapshots_written += 1;
        Ok(())
    }

    async fn load_state(&self, path: &Path) -> Result<(), AutomationError> {
        let mut script = self.enter(Call::LoadState(path.to_path_buf()))?;
        if !path.exists() {
            return Err(AutomationError::Snapshot(format!(
                "{} does not exist",
                path.display()
            )));
        }
        if script.accept_snapshot {
            script.stage = LoginStage::SignedIn;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(Call::Close);
        script.closed = true;
        Ok(())
    }
}

struct MemoryDownload {
    bytes: Vec<u8>,
}

#[async_trait]
impl DownloadHandle for MemoryDownload {
    async fn save(self: Box<Self>, dest: &Path) -> Result<u64, AutomationError> {
        tokio::fs::write(dest, &self.bytes)
            .await
            .map_err(|e| AutomationError::Download(e.to_string()))?;
        Ok(self.bytes.len() as u64)
    }
}

/// Hands out one shared [`ScriptedSurface`]
pub struct ScriptedLauncher {
    surface: Arc<ScriptedSurface>,
    fail: bool,
    launches: AtomicU32,
}

impl ScriptedLauncher {
    pub fn new(surface: Arc<ScriptedSurface>) -> Self {
        Self {
            surface,
            fail: false,
            launches: AtomicU32::new(0),
        }
    }

    /// A launcher whose browser never starts
    pub fn failing() -> Self {
        Self {
            surface: Arc::new(ScriptedSurface::new()),
            fail: true,
            launches: AtomicU32::new(0),
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Box<dyn Automation>, AutomationError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AutomationError::Launch(
                "no Chrome or Chromium found".to_string(),
            ));
        }
        Ok(Box::new(Arc::clone(&self.surface)))
    }
}
