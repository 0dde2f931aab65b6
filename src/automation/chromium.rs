//! Chrome automation over CDP
//!
//! Element lookups run as small scripts in the page so a selector can carry a
//! text filter and resolve to the first visible match. Typing goes through
//! `Input.insertText`, uploads through `DOM.setFileInputFiles`, and downloads
//! are staged by the browser into a private directory and reported by a
//! listener task.

use super::{
    Automation, AutomationError, BrowserLauncher, DownloadHandle, LaunchOptions, PendingDownload,
};
use crate::selectors::Selector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::{
        browser::{
            DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
            SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
        },
        dom::SetFileInputFilesParams,
        input::InsertTextParams,
        network::{Cookie, CookieParam, SetCookiesParams},
        page::AddScriptToEvaluateOnNewDocumentParams,
    },
    error::CdpError,
    fetcher::{BrowserFetcher, BrowserFetcherOptions},
    listeners::EventStream,
    Page,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 900;

/// Interval between visibility checks inside `wait_for_visible`/`wait_for_hidden`
const WAIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const SNAPSHOT_VERSION: u32 = 1;

/// Attribute used to hand a script-resolved element over to CDP
const TARGET_ATTRIBUTE: &str = "data-copilot-automation-target";

/// `(css, text) => Element[]`: every match, narrowed by case-insensitive text.
const FIND_NODES: &str = r"(css, text) => {
  let nodes;
  try { nodes = Array.from(document.querySelectorAll(css)); } catch (e) { return []; }
  if (text !== null) {
    const needle = text.toLowerCase();
    nodes = nodes.filter((n) => (n.innerText || n.textContent || '').toLowerCase().includes(needle));
  }
  return nodes;
}";

const IS_VISIBLE: &str = r"(el) => {
  const rect = el.getBoundingClientRect();
  const style = window.getComputedStyle(el);
  return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';
}";

impl From<CdpError> for AutomationError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Ws(_) | CdpError::ChannelSendError(_) => AutomationError::ContextClosed,
            other => AutomationError::OperationFailed(other.to_string()),
        }
    }
}

/// Launches a local Chrome per session
pub struct ChromiumLauncher;

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn Automation>, AutomationError> {
        let surface = ChromiumSurface::launch(options).await?;
        Ok(Box::new(surface))
    }
}

#[derive(Debug)]
struct FinishedDownload {
    suggested_name: String,
    path: PathBuf,
}

type DownloadReport = Result<FinishedDownload, String>;

#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    origin: String,
    cookies: Vec<Value>,
    local_storage: Vec<(String, String)>,
}

pub struct ChromiumSurface {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    download_task: JoinHandle<()>,
    downloads: Mutex<mpsc::UnboundedReceiver<DownloadReport>>,
    user_data_dir: PathBuf,
    navigation_timeout: Duration,
}

impl ChromiumSurface {
    /// Tries the configured or system Chrome first. On failure, downloads a
    /// compatible Chromium via `BrowserFetcher` and caches it for future runs.
    pub async fn launch(options: &LaunchOptions) -> Result<Self, AutomationError> {
        let session_id = uuid::Uuid::new_v4();
        let user_data_dir = std::env::temp_dir().join(format!("copilot-automation-{session_id}"));

        let executable = options
            .chrome_executable
            .clone()
            .or_else(find_system_chrome);
        match Self::launch_and_init(options, &user_data_dir, executable.as_deref()).await {
            Ok(surface) => return Ok(surface),
            Err(e) => {
                tracing::info!(error = %e, "System Chrome not available, trying fetcher");
            }
        }

        let executable = fetch_chromium().await?;
        Self::launch_and_init(options, &user_data_dir, Some(&executable)).await
    }

    fn browser_config(
        options: &LaunchOptions,
        user_data_dir: &Path,
        executable: Option<&Path>,
    ) -> Result<BrowserConfig, AutomationError> {
        // Stale profile directories keep a SingletonLock around
        let _ = std::fs::remove_dir_all(user_data_dir);

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .user_data_dir(user_data_dir)
            .request_timeout(options.navigation_timeout);

        builder = if options.headless {
            builder
                .new_headless_mode()
                .viewport(chromiumoxide::handler::viewport::Viewport {
                    width: DEFAULT_VIEWPORT_WIDTH,
                    height: DEFAULT_VIEWPORT_HEIGHT,
                    device_scale_factor: Some(1.0),
                    emulating_mobile: false,
                    is_landscape: true,
                    has_touch: false,
                })
        } else {
            builder.with_head()
        };

        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(AutomationError::Launch)
    }

    async fn launch_and_init(
        options: &LaunchOptions,
        user_data_dir: &Path,
        executable: Option<&Path>,
    ) -> Result<Self, AutomationError> {
        let config = Self::browser_config(options, user_data_dir, executable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AutomationError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!("CDP handler error: {e}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AutomationError::Launch(e.to_string()))?;

        let staging_dir = user_data_dir.join("downloads");
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| AutomationError::Launch(format!("download dir: {e}")))?;

        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .download_path(staging_dir.to_string_lossy().into_owned())
            .events_enabled(true)
            .build()
            .map_err(AutomationError::Launch)?;
        browser.execute(behavior).await?;

        let will_begin = browser.event_listener::<EventDownloadWillBegin>().await?;
        let progress = browser.event_listener::<EventDownloadProgress>().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let download_task = spawn_download_listener(will_begin, progress, staging_dir, tx);

        tracing::info!(
            headless = options.headless,
            user_data_dir = %user_data_dir.display(),
            "Browser launched"
        );

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            download_task,
            downloads: Mutex::new(rx),
            user_data_dir: user_data_dir.to_path_buf(),
            navigation_timeout: options.navigation_timeout,
        })
    }

    async fn eval<T: DeserializeOwned>(&self, expression: String) -> Result<T, AutomationError> {
        let result = self.page.evaluate(expression).await?;
        result
            .into_value::<T>()
            .map_err(|e| AutomationError::OperationFailed(format!("unexpected script result: {e}")))
    }

    /// Runs `body` with `nodes` (matches) and `visible` (predicate) in scope
    async fn eval_on<T: DeserializeOwned>(
        &self,
        selector: &Selector,
        body: &str,
    ) -> Result<T, AutomationError> {
        self.eval(selector_script(selector, body)).await
    }

    /// Tags the first visible match (or the first match) and resolves it as a CDP element.
    async fn resolve(
        &self,
        selector: &Selector,
    ) -> Result<chromiumoxide::element::Element, AutomationError> {
        let tag = uuid::Uuid::new_v4().to_string();
        let body = format!(
            "const el = nodes.find(visible) || nodes[0]; if (!el) return false; el.setAttribute('{TARGET_ATTRIBUTE}', {}); return true;",
            Value::from(tag.as_str())
        );
        let found: bool = self.eval_on(selector, &body).await?;
        if !found {
            return Err(AutomationError::ElementNotFound(selector.to_string()));
        }
        Ok(self
            .page
            .find_element(format!("[{TARGET_ATTRIBUTE}=\"{tag}\"]"))
            .await?)
    }

    async fn wait_for(
        &self,
        selector: &Selector,
        timeout: Duration,
        want_visible: bool,
    ) -> Result<(), AutomationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_visible(selector).await? == want_visible {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AutomationError::WaitTimeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(WAIT_CHECK_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl Automation for ChromiumSurface {
    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => match AutomationError::from(e) {
                AutomationError::ContextClosed => Err(AutomationError::ContextClosed),
                other => Err(AutomationError::Navigation {
                    url: url.to_string(),
                    message: other.to_string(),
                }),
            },
            Err(_) => Err(AutomationError::Navigation {
                url: url.to_string(),
                message: format!("timeout after {:?}", self.navigation_timeout),
            }),
        }
    }

    async fn type_text(&self, selector: &Selector, text: &str) -> Result<(), AutomationError> {
        let focused: bool = self
            .eval_on(
                selector,
                "const el = nodes.find(visible) || nodes[0]; if (!el) return false; el.focus(); \
                 if ('value' in el) { el.value = ''; } else if (el.isContentEditable) { el.textContent = ''; } \
                 return true;",
            )
            .await?;
        if !focused {
            return Err(AutomationError::ElementNotFound(selector.to_string()));
        }
        self.page.execute(InsertTextParams::new(text)).await?;
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<(), AutomationError> {
        let clicked: bool = self
            .eval_on(
                selector,
                "const el = nodes.find(visible) || nodes[0]; if (!el) return false; \
                 el.scrollIntoView({ block: 'center' }); el.click(); return true;",
            )
            .await?;
        if clicked {
            Ok(())
        } else {
            Err(AutomationError::ElementNotFound(selector.to_string()))
        }
    }

    async fn press_key(&self, selector: &Selector, key: &str) -> Result<(), AutomationError> {
        let element = self.resolve(selector).await?;
        element.press_key(key).await?;
        Ok(())
    }

    async fn is_visible(&self, selector: &Selector) -> Result<bool, AutomationError> {
        self.eval_on(selector, "return nodes.some(visible);").await
    }

    async fn wait_for_visible(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        self.wait_for(selector, timeout, true).await
    }

    async fn wait_for_hidden(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        self.wait_for(selector, timeout, false).await
    }

    async fn read_text(&self, selector: &Selector) -> Result<String, AutomationError> {
        let text: Option<String> = self
            .eval_on(
                selector,
                "const el = nodes.find(visible) || nodes[0]; \
                 return el ? (el.innerText || el.textContent || '') : null;",
            )
            .await?;
        text.ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))
    }

    async fn read_all_texts(&self, selector: &Selector) -> Result<Vec<String>, AutomationError> {
        self.eval_on(
            selector,
            "return nodes.map((n) => n.innerText || n.textContent || '');",
        )
        .await
    }

    async fn upload_file(&self, selector: &Selector, path: &Path) -> Result<(), AutomationError> {
        let element = self.resolve(selector).await?;
        let absolute = std::path::absolute(path)
            .map_err(|e| AutomationError::OperationFailed(format!("{}: {e}", path.display())))?;
        let params = SetFileInputFilesParams::builder()
            .files(vec![absolute.to_string_lossy().into_owned()])
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(AutomationError::OperationFailed)?;
        self.page.execute(params).await?;
        tracing::debug!(path = %absolute.display(), "File handed to upload input");
        Ok(())
    }

    async fn discard_downloads(&self) -> Result<usize, AutomationError> {
        let mut downloads = self.downloads.lock().await;
        let mut discarded = 0;
        loop {
            match downloads.try_recv() {
                Ok(Ok(stale)) => {
                    tracing::debug!(name = %stale.suggested_name, "Discarding unclaimed download");
                    let _ = tokio::fs::remove_file(&stale.path).await;
                    discarded += 1;
                }
                Ok(Err(_)) => discarded += 1,
                Err(TryRecvError::Empty) => return Ok(discarded),
                Err(TryRecvError::Disconnected) => return Err(AutomationError::ContextClosed),
            }
        }
    }

    async fn wait_for_download(
        &self,
        timeout: Duration,
    ) -> Result<PendingDownload, AutomationError> {
        let mut downloads = self.downloads.lock().await;
        match tokio::time::timeout(timeout, downloads.recv()).await {
            Ok(Some(Ok(finished))) => Ok(PendingDownload::new(
                finished.suggested_name,
                Box::new(StagedFile {
                    path: finished.path,
                }),
            )),
            Ok(Some(Err(message))) => Err(AutomationError::Download(message)),
            Ok(None) => Err(AutomationError::ContextClosed),
            Err(_) => Err(AutomationError::WaitTimeout {
                selector: "download completion".to_string(),
                timeout,
            }),
        }
    }

    async fn persist_state(&self, path: &Path) -> Result<(), AutomationError> {
        // Browser-wide, so sign-in cookies on other domains are kept too
        let cookies = {
            let browser = self.browser.lock().await;
            let browser = browser.as_ref().ok_or(AutomationError::ContextClosed)?;
            cookie_values(browser.get_cookies().await?)?
        };
        let origin: String = self.eval("window.location.origin".to_string()).await?;
        let local_storage: Vec<(String, String)> = match self
            .eval("Object.entries(window.localStorage)".to_string())
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Local storage not captured in snapshot");
                Vec::new()
            }
        };

        let snapshot = StorageSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            origin,
            cookies,
            local_storage,
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| AutomationError::Snapshot(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AutomationError::Snapshot(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| AutomationError::Snapshot(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| AutomationError::Snapshot(format!("{}: {e}", path.display())))?;

        tracing::debug!(
            path = %path.display(),
            cookies = snapshot.cookies.len(),
            local_storage = snapshot.local_storage.len(),
            "Storage snapshot written"
        );
        Ok(())
    }

    async fn load_state(&self, path: &Path) -> Result<(), AutomationError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AutomationError::Snapshot(format!("{}: {e}", path.display())))?;
        let snapshot: StorageSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| AutomationError::Snapshot(format!("{}: {e}", path.display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(AutomationError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let cookies = snapshot
            .cookies
            .into_iter()
            .filter_map(cookie_param)
            .collect::<Vec<_>>();
        let cookie_count = cookies.len();
        if !cookies.is_empty() {
            self.page.execute(SetCookiesParams::new(cookies)).await?;
        }

        if !snapshot.local_storage.is_empty() {
            let entries = serde_json::to_string(&snapshot.local_storage)
                .map_err(|e| AutomationError::Snapshot(e.to_string()))?;
            let source = format!(
                "(() => {{ if (window.location.origin !== {origin}) return; \
                 if (sessionStorage.getItem('__copilot_automation_restored')) return; \
                 for (const [k, v] of {entries}) {{ localStorage.setItem(k, v); }} \
                 sessionStorage.setItem('__copilot_automation_restored', '1'); }})()",
                origin = Value::from(snapshot.origin.as_str()),
            );
            self.page
                .execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
                .await?;
        }

        tracing::debug!(
            path = %path.display(),
            saved_at = %snapshot.saved_at,
            cookies = cookie_count,
            "Storage snapshot loaded"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                tracing::debug!(error = %e, "Browser close command failed");
            }
            if let Err(e) = browser.wait().await {
                tracing::debug!(error = %e, "Waiting for browser exit failed");
            }
            self.download_task.abort();
            self.handler_task.abort();
            if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
                tracing::warn!(path = %self.user_data_dir.display(), error = %e, "Failed to clean up browser data dir");
            }
            tracing::info!("Browser closed");
        }
        Ok(())
    }
}

impl Drop for ChromiumSurface {
    fn drop(&mut self) {
        self.download_task.abort();
        self.handler_task.abort();
    }
}

/// A completed transfer waiting in the staging directory
struct StagedFile {
    path: PathBuf,
}

#[async_trait]
impl DownloadHandle for StagedFile {
    async fn save(self: Box<Self>, dest: &Path) -> Result<u64, AutomationError> {
        if tokio::fs::rename(&self.path, dest).await.is_err() {
            // Staging and target may live on different filesystems
            tokio::fs::copy(&self.path, dest)
                .await
                .map_err(|e| AutomationError::Download(format!("{}: {e}", dest.display())))?;
            let _ = tokio::fs::remove_file(&self.path).await;
        }
        let metadata = tokio::fs::metadata(dest)
            .await
            .map_err(|e| AutomationError::Download(format!("{}: {e}", dest.display())))?;
        Ok(metadata.len())
    }
}

fn spawn_download_listener(
    mut will_begin: EventStream<EventDownloadWillBegin>,
    mut progress: EventStream<EventDownloadProgress>,
    staging_dir: PathBuf,
    tx: mpsc::UnboundedSender<DownloadReport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut names: HashMap<String, String> = HashMap::new();
        loop {
            tokio::select! {
                Some(event) = will_begin.next() => {
                    tracing::debug!(guid = %event.guid, name = %event.suggested_filename, "Download started");
                    names.insert(event.guid.clone(), event.suggested_filename.clone());
                }
                Some(event) = progress.next() => {
                    let report = match event.state {
                        DownloadProgressState::Completed => Ok(FinishedDownload {
                            suggested_name: names.remove(&event.guid).unwrap_or_default(),
                            path: staging_dir.join(&event.guid),
                        }),
                        DownloadProgressState::Canceled => {
                            names.remove(&event.guid);
                            Err(format!("download {} was canceled", event.guid))
                        }
                        DownloadProgressState::InProgress => continue,
                    };
                    if tx.send(report).is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    })
}

fn cookie_values(cookies: Vec<Cookie>) -> Result<Vec<Value>, AutomationError> {
    cookies
        .into_iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AutomationError::Snapshot(e.to_string()))
}

/// Session cookies have no meaningful expiry; replaying `-1` would expire them.
fn cookie_param(mut cookie: Value) -> Option<CookieParam> {
    if cookie.get("session").and_then(Value::as_bool) == Some(true) {
        if let Some(map) = cookie.as_object_mut() {
            map.remove("expires");
        }
    }
    match serde_json::from_value(cookie) {
        Ok(param) => Some(param),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unreadable cookie in snapshot");
            None
        }
    }
}

fn selector_script(selector: &Selector, body: &str) -> String {
    let css = Value::from(selector.css);
    let text = selector.text.map_or(Value::Null, Value::from);
    format!(
        "(() => {{ const nodes = ({FIND_NODES})({css}, {text}); const visible = {IS_VISIBLE}; {body} }})()"
    )
}

fn find_system_chrome() -> Option<PathBuf> {
    [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "chrome",
    ]
    .iter()
    .find_map(|name| which::which(name).ok())
}

/// Directory where the fetcher caches downloaded Chrome binaries
fn fetcher_cache_dir() -> PathBuf {
    let base = std::env::var("HOME").map_or_else(|_| std::env::temp_dir(), PathBuf::from);
    base.join(".cache/copilot-automation/chromium")
}

async fn fetch_chromium() -> Result<PathBuf, AutomationError> {
    let cache_dir = fetcher_cache_dir();
    tracing::info!("Downloading Chrome to {cache_dir:?} (first run only)...");

    tokio::fs::create_dir_all(&cache_dir).await.map_err(|e| {
        AutomationError::Launch(format!(
            "Failed to create cache dir {}: {e}",
            cache_dir.display()
        ))
    })?;

    let fetcher_opts = BrowserFetcherOptions::builder()
        .with_path(&cache_dir)
        .build()
        .map_err(|e| AutomationError::Launch(format!("Fetcher config error: {e}")))?;

    let info = BrowserFetcher::new(fetcher_opts)
        .fetch()
        .await
        .map_err(|e| AutomationError::Launch(format!("Chrome download failed: {e:#}")))?;

    tracing::info!("Using Chrome at {:?}", info.executable_path);
    Ok(info.executable_path)
}
