use crate::artifact::DownloadOutcome;
use crate::auth::{AuthStrategy, Credentials, EnvSecretStore, SecretStore, USERNAME_KEY};
use crate::automation::chromium::ChromiumLauncher;
use crate::automation::BrowserLauncher;
use crate::config::{LogLevel, Settings, SettingsOverrides};
use crate::controller::{Interrupt, SessionController};
use crate::error::{CopilotError, CopilotResult};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "copilot-automation")]
#[command(version, about = "Drive Microsoft Copilot chat from the command line")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Show the browser window
    #[arg(long, global = true)]
    pub headed: bool,

    /// Print the captured answer without Markdown clean-up
    #[arg(long, global = true)]
    pub raw: bool,

    /// Longest message sent in one turn; longer prompts are split
    #[arg(long, global = true, value_name = "CHARS")]
    pub max_prompt_chars: Option<usize>,

    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Saved browser session
    #[arg(long, global = true, value_name = "PATH", env = "COPILOT_STORAGE_STATE")]
    pub storage_state: Option<PathBuf>,

    /// Chrome or Chromium binary to launch
    #[arg(long, global = true, value_name = "PATH", env = "CHROME_EXECUTABLE")]
    pub chrome: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and save the browser session for later runs
    Auth(AuthArgs),

    /// Send a prompt and print the answer
    Chat {
        prompt: String,
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Attach a file, ask about it and print the answer
    AskWithFile {
        file: PathBuf,
        prompt: String,
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Attach a file with a default review prompt
    Upload { file: PathBuf },
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct AuthArgs {
    /// Sign in by hand in a browser window; the session is saved every few seconds
    #[arg(long)]
    pub manual: bool,

    /// Type credentials on the terminal instead of reading them from the environment
    #[arg(long)]
    pub interactive: bool,
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Write the answer to FILE instead of stdout
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Save a file the answer offers for download
    #[arg(long)]
    pub download: bool,

    /// Where downloaded files go (default: the output directory)
    #[arg(long, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Seconds to wait for a download to be offered
    #[arg(long, value_name = "SECS")]
    pub download_timeout: Option<u64>,
}

impl Cli {
    pub fn overrides(&self) -> SettingsOverrides {
        let manual_auth = matches!(&self.command, Command::Auth(args) if args.manual);
        SettingsOverrides {
            headless: (self.headed || manual_auth).then_some(false),
            normalize_response: self.raw.then_some(false),
            max_prompt_chars: self.max_prompt_chars,
            log_level: self.log_level,
            storage_state_path: self.storage_state.clone(),
            chrome_executable: self.chrome.clone(),
            ..Default::default()
        }
    }
}

/// Runs one command in a fresh session and always releases the browser afterwards.
///
/// Ctrl-C cancels whatever wait is in progress.
pub async fn run(cli: Cli, settings: Arc<Settings>) -> CopilotResult<()> {
    let secrets = Arc::new(EnvSecretStore::new());
    // Terminal prompts happen before the browser starts
    let strategy = match &cli.command {
        Command::Auth(args) => Some(auth_strategy(args, secrets.as_ref())?),
        _ => None,
    };

    let default_download_dir = settings.output_directory.clone();
    let launcher: Arc<dyn BrowserLauncher> = Arc::new(ChromiumLauncher);
    let mut controller = SessionController::new(settings, launcher, secrets);
    cancel_on_interrupt(controller.interrupt_handle());
    let result = execute(&mut controller, cli.command, strategy, &default_download_dir).await;
    if let Err(e) = controller.close().await {
        tracing::warn!(error = %e, "Session did not close cleanly");
    }
    result
}

fn cancel_on_interrupt(interrupt: Interrupt) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });
}

async fn execute(
    controller: &mut SessionController,
    command: Command,
    strategy: Option<AuthStrategy>,
    default_download_dir: &Path,
) -> CopilotResult<()> {
    controller.start().await?;

    if let Some(strategy) = strategy {
        let outcome = controller.authenticate(strategy).await?;
        eprintln!(
            "Signed in ({}); session saved to {}",
            outcome.method,
            outcome.snapshot_path.display()
        );
        return Ok(());
    }

    controller.ensure_authenticated().await?;
    match command {
        Command::Chat { prompt, output } => {
            let answer = controller.chat(&prompt).await?;
            deliver(controller, &answer, &output, default_download_dir).await
        }
        Command::AskWithFile {
            file,
            prompt,
            output,
        } => {
            let answer = controller.ask_with_file(&file, &prompt).await?;
            deliver(controller, &answer, &output, default_download_dir).await
        }
        Command::Upload { file } => {
            let answer = controller.ask_with_file(&file, "").await?;
            println!("{answer}");
            Ok(())
        }
        Command::Auth(_) => Ok(()),
    }
}

/// Prints or writes the answer, then fetches an offered file if asked to.
async fn deliver(
    controller: &mut SessionController,
    answer: &str,
    output: &OutputArgs,
    default_download_dir: &Path,
) -> CopilotResult<()> {
    match &output.out {
        Some(path) => {
            write_answer(path, answer).await?;
            eprintln!("Answer written to {}", path.display());
        }
        None => println!("{answer}"),
    }

    if !output.download {
        return Ok(());
    }
    let target = output.download_dir.as_deref().unwrap_or(default_download_dir);
    let timeout = output.download_timeout.map(Duration::from_secs);
    match controller.download(target, timeout).await? {
        DownloadOutcome::Saved(result) => eprintln!(
            "Downloaded {} ({} bytes) to {}",
            result.source_name,
            result.size_bytes,
            result.local_path.display()
        ),
        DownloadOutcome::NoArtifact { waited } => eprintln!(
            "No downloadable file was offered within {}s",
            waited.as_secs()
        ),
    }
    Ok(())
}

async fn write_answer(path: &Path, answer: &str) -> CopilotResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CopilotError::io(parent, e))?;
    }
    let mut contents = answer.to_string();
    contents.push('\n');
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| CopilotError::io(path, e))
}

fn auth_strategy(args: &AuthArgs, secrets: &dyn SecretStore) -> CopilotResult<AuthStrategy> {
    if args.manual {
        return Ok(AuthStrategy::Manual);
    }
    if !args.interactive {
        return Ok(AuthStrategy::Scripted);
    }

    let known = secrets.secret(USERNAME_KEY);
    let label = match &known {
        Some(username) => format!("Username [{username}]: "),
        None => "Username: ".to_string(),
    };
    let typed = prompt_line(&label)?;
    let username = match (typed.trim(), known) {
        ("", Some(known)) => known,
        ("", None) => {
            return Err(CopilotError::MissingCredentials {
                field: USERNAME_KEY,
            })
        }
        (typed, _) => typed.to_string(),
    };
    let password = read_secret("Password: ")?;
    let otp_secret = read_secret("OTP secret (blank if MFA is not set up): ")?;
    Ok(AuthStrategy::Interactive(Credentials::new(
        username, password, otp_secret,
    )))
}

fn prompt_line(label: &str) -> CopilotResult<String> {
    let mut stderr = std::io::stderr();
    let mut line = String::new();
    write!(stderr, "{label}")
        .and_then(|()| stderr.flush())
        .and_then(|()| std::io::stdin().lock().read_line(&mut line))
        .map_err(terminal_error)?;
    Ok(line)
}

/// Reads a hidden value; blank input means "not provided".
fn read_secret(label: &str) -> CopilotResult<Option<String>> {
    let value = rpassword::prompt_password(label).map_err(terminal_error)?;
    Ok(Some(value.trim().to_string()).filter(|v| !v.is_empty()))
}

fn terminal_error(e: std::io::Error) -> CopilotError {
    CopilotError::InvalidInput(format!("could not read from the terminal: {e}"))
}
