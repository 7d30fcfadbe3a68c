use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use csutility_lib::downloader::ProgressFn;
use csutility_lib::logging::{ErrorCategory, LogFormat, init_logging, log_error_simple};
use csutility_lib::{AcquisitionError, AcquisitionSettings, Identifier, Orchestrator, build_http_client};

/// Offline lineup video acquisition.
#[derive(Debug, Parser)]
#[command(name = "csutility", version, about = "Download lineup videos for offline playback")]
struct Cli {
    /// JSON settings file; environment overrides still apply
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// Download a video into the artifact directory
    Acquire { url: String },
    /// Check every configured backend
    Health,
    /// List stored artifacts
    List,
    /// Delete invalid artifacts and stale partial downloads
    Purge,
    /// Delete the artifact for a video identifier
    Delete { id: String },
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => log_error_simple(ErrorCategory::System, "Failed to render output", Some(&e.to_string())),
    }
}

async fn run(cli: Cli) -> Result<(), AcquisitionError> {
    let settings = AcquisitionSettings::load(cli.settings.as_deref())?;
    let orchestrator = Orchestrator::from_settings(&settings, build_http_client(&settings)?);
    let store = orchestrator.store().clone();

    match cli.command {
        Command::Acquire { url } => {
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling");
                    on_ctrl_c.cancel();
                }
            });

            let on_progress: ProgressFn = Arc::new(|progress| eprint!("\r{:5.1}%", progress * 100.0));
            let result = orchestrator.acquire(&url, on_progress, &cancel).await;
            eprintln!();
            let artifact = result?;
            print_json(&json!(artifact));
        }
        Command::Health => {
            let report = orchestrator.health().await;
            print_json(&json!(report));
        }
        Command::List => {
            let artifacts = store.list().await?;
            let total_bytes = store.total_bytes().await?;
            print_json(&json!({ "artifacts": artifacts, "totalBytes": total_bytes }));
        }
        Command::Purge => {
            let removed = store.purge_invalid().await?;
            info!(removed, "purged invalid artifacts");
            print_json(&json!({ "removed": removed }));
        }
        Command::Delete { id: raw } => {
            let identifier =
                Identifier::new(raw).ok_or_else(|| AcquisitionError::InvalidSource("empty identifier".into()))?;
            let path = store.artifact_path(&identifier)?;
            store.delete(&path).await?;
            print_json(&json!({ "deleted": path }));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(if cli.json_logs { LogFormat::Json } else { LogFormat::Plain });

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.to_frontend_json());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_acquire_with_flags() {
        let cli = Cli::try_parse_from(["csutility", "--settings", "s.json", "acquire", "https://youtu.be/abc123", "--json-logs"])
            .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("s.json")));
        assert!(cli.json_logs);
        assert_eq!(
            cli.command,
            Command::Acquire {
                url: "https://youtu.be/abc123".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Cli::try_parse_from(["csutility"]).is_err());
        assert!(Cli::try_parse_from(["csutility", "acquire"]).is_err());
        assert!(Cli::try_parse_from(["csutility", "--settings"]).is_err());
        assert!(Cli::try_parse_from(["csutility", "--verbose", "list"]).is_err());
        assert_eq!(
            Cli::try_parse_from(["csutility", "delete", "abc123"]).unwrap().command,
            Command::Delete { id: "abc123".into() }
        );
    }
}
