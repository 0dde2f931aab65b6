//! Copilot automation - drives the Microsoft Copilot web chat through a
//! controlled Chromium session.
//!
//! Handles sign-in, prompt submission with automatic splitting, response
//! capture and clean-up, file attachments and downloads.

mod artifact;
mod auth;
mod automation;
mod chunking;
mod cli;
mod config;
mod controller;
mod error;
mod normalize;
mod retry;
mod selectors;
mod session;

use clap::Parser;
use cli::Cli;
use config::Settings;
use error::CopilotError;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::from_env() {
        Ok(settings) => settings.with_overrides(cli.overrides()),
        Err(e) => return report(&CopilotError::from(e)),
    };

    // Logs go to stderr so stdout carries only the answer
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("copilot_automation={},chromiumoxide=warn", settings.log_level).into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli::run(cli, Arc::new(settings)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(kind = ?e.kind(), error = %e, "Command failed");
            } else {
                tracing::warn!(kind = ?e.kind(), error = %e, "Command did not complete");
            }
            report(&e)
        }
    }
}

fn report(error: &CopilotError) -> ExitCode {
    eprintln!("error: {error}");
    if let Some(hint) = error.remediation() {
        eprintln!("hint: {hint}");
    }
    ExitCode::FAILURE
}
