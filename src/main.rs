//! CLI entry point for the mirrordl tool.

use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mirrordl_core::config;
use mirrordl_core::{
    AcquireConfig, DownloadEngine, EventSink, FileDescriptor, HttpClient, SourceRegistry,
    TracingSink, parse_records,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// Process exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    /// Every file downloaded or already present.
    Success,
    /// Some files acquired, some unfulfillable.
    Partial,
    /// No file could be acquired.
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::from(1),
            ProcessExit::Partial => ExitCode::from(2),
        }
    }
}

/// Maps acquired and unfulfillable counts to the process exit outcome.
fn determine_exit_outcome(acquired: usize, unfulfillable: usize) -> ProcessExit {
    if unfulfillable == 0 {
        ProcessExit::Success
    } else if acquired > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = resolve_config(&args)?;
    debug!(?config, "effective configuration");

    let Some(input) = read_input(&args)? else {
        info!("No input provided. Pass metadata record files or pipe JSON via stdin.");
        info!("Example: mirrordl records.json");
        return Ok(ExitCode::SUCCESS);
    };

    let descriptors = descriptors_from(&input)?;
    if descriptors.is_empty() {
        info!("No downloadable files found in input");
        return Ok(ExitCode::SUCCESS);
    }
    info!(files = descriptors.len(), "Parsed metadata records");

    let client = HttpClient::new().context("failed to build HTTP client")?;
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let engine = config.engine(SourceRegistry::with_defaults(&client), sink);

    let total = descriptors.len();
    let use_spinner = !args.quiet && io::stderr().is_terminal();
    let (spinner, stop) = spawn_progress_ui(use_spinner, engine.clone(), total);

    let outcomes = engine.acquire_all(descriptors).await;

    stop_progress_ui(&stop, spinner).await;

    let stats = engine.stats();
    let acquired = outcomes.iter().filter(|o| o.is_success()).count();
    let unfulfillable = outcomes.len() - acquired;
    info!(
        downloaded = stats.downloaded(),
        already_present = stats.already_present(),
        unfulfillable,
        sources_abandoned = stats.sources_abandoned(),
        total,
        "Acquisition complete"
    );

    Ok(determine_exit_outcome(acquired, unfulfillable).into())
}

/// Defaults, then the config file, then flags given on the command line.
fn resolve_config(args: &Args) -> Result<AcquireConfig> {
    let file = if args.no_config {
        None
    } else if let Some(path) = &args.config {
        Some(config::load_file_config(path)?)
    } else {
        config::load_default_file_config()?.map(|(path, file)| {
            debug!(path = %path.display(), "using config file");
            file
        })
    };

    let mut config = AcquireConfig::default().with_file(&file.unwrap_or_default());
    if let Some(concurrency) = args.concurrency {
        config.concurrency = usize::from(concurrency);
    }
    if let Some(attempts) = args.retry_attempts {
        config.retry_attempts = u32::from(attempts);
    }
    if let Some(secs) = args.retry_delay_secs {
        config.retry_delay = Duration::from_secs(u64::from(secs));
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    if let Some(dir) = &args.working_dir {
        config.working_dir.clone_from(dir);
    }

    config.validate()?;
    Ok(config)
}

/// Reads record files, or stdin when none were given and it is not a terminal.
fn read_input(args: &Args) -> Result<Option<Vec<(String, String)>>> {
    if !args.records.is_empty() {
        let inputs = args
            .records
            .iter()
            .map(|path| read_record_file(path).map(|text| (path.display().to_string(), text)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Some(inputs));
    }

    if io::stdin().is_terminal() {
        return Ok(None);
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("failed to read stdin")?;
    if buffer.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(vec![("<stdin>".to_string(), buffer)]))
}

fn read_record_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read record file '{}'", path.display()))
}

fn descriptors_from(inputs: &[(String, String)]) -> Result<Vec<FileDescriptor>> {
    let mut descriptors = Vec::new();
    for (origin, text) in inputs {
        let records =
            parse_records(text).with_context(|| format!("failed to parse records from {origin}"))?;
        for record in records {
            if !record.is_ready() {
                warn!(
                    title = %record.title,
                    status = record.status.as_deref().unwrap_or_default(),
                    "Skipping record that is not complete"
                );
                continue;
            }
            descriptors.extend(record.descriptors());
        }
    }
    Ok(descriptors)
}

/// Spawns the spinner when requested. Returns (handle, stop) so the caller can
/// signal stop and await the handle.
fn spawn_progress_ui(
    use_spinner: bool,
    engine: DownloadEngine,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(!use_spinner));
    if !use_spinner {
        return (None, stop);
    }

    let stopping = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stopping.load(Ordering::SeqCst) {
            let stats = engine.stats();
            spinner.set_message(format!(
                "[{}/{}] acquiring files ({} sources abandoned)",
                stats.total().min(total),
                total,
                stats.sources_abandoned()
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    });
    (Some(handle), stop)
}

/// Signals the spinner to stop and waits for it. Returns false when the
/// spinner task panicked or was cancelled.
async fn stop_progress_ui(
    stop: &AtomicBool,
    spinner: Option<tokio::task::JoinHandle<()>>,
) -> bool {
    stop.store(true, Ordering::SeqCst);
    let Some(handle) = spinner else {
        return true;
    };
    match handle.await {
        Ok(()) => true,
        Err(error) => {
            warn!(%error, "progress display task ended abnormally");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_outcome_success_when_nothing_failed() {
        assert_eq!(determine_exit_outcome(3, 0), ProcessExit::Success);
        assert_eq!(determine_exit_outcome(0, 0), ProcessExit::Success);
    }

    #[test]
    fn test_exit_outcome_partial_when_mixed() {
        assert_eq!(determine_exit_outcome(2, 1), ProcessExit::Partial);
    }

    #[test]
    fn test_exit_outcome_failure_when_all_failed() {
        assert_eq!(determine_exit_outcome(0, 2), ProcessExit::Failure);
    }

    #[test]
    fn test_skips_records_that_are_not_ready() {
        let input = r#"[
            {"title": "A", "status": "pending", "files": [{"filename": "a", "md5": "00", "links": {"direct": "u"}}]},
            {"title": "B", "files": [{"filename": "b", "md5": "00", "links": {"direct": "u"}}]}
        ]"#;
        let descriptors = descriptors_from(&[("t".to_string(), input.to_string())]).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].filename, "b");
    }
    #[tokio::test]
    async fn test_stop_progress_ui_reports_panicked_spinner() {
        let stop = AtomicBool::new(false);
        let handle: tokio::task::JoinHandle<()> = tokio::spawn(async { panic!("spinner failed") });
        assert!(!stop_progress_ui(&stop, Some(handle)).await);
        assert!(stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_progress_ui_without_spinner() {
        let stop = AtomicBool::new(false);
        assert!(stop_progress_ui(&stop, None).await);

        let handle = tokio::spawn(async {});
        assert!(stop_progress_ui(&stop, Some(handle)).await);
    }
}
