use anyhow::{Context, Result};
use bkdrive::config::{self, AppConfig};
use bkdrive::context::AppContext;
use bkdrive::core::{BackupOrchestrator, BackupRequest, CleanupPlan, RemoteEntry};
use bkdrive::error::JobError;
use bkdrive::logging::{self, LogConfig};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bkdrive")]
#[command(about = "Archive directories with 7z and keep them on Google Drive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Use a local directory instead of Google Drive
    #[arg(long, global = true)]
    simulation: bool,

    /// Remote folder holding the archives
    #[arg(long, global = true)]
    remote_folder: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a directory and upload it
    Backup(BackupArgs),
    /// Restore an archive from disk or from the remote
    Restore(RestoreArgs),
    /// List remote archives, newest first
    List,
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("cleanup_scope")
        .multiple(true)
        .args(["cleanup", "clean_all_archives"])
))]
struct BackupArgs {
    source: PathBuf,

    /// Directory for the local archive and metadata file
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Archive name prefix, defaults to the source directory name
    #[arg(long)]
    label: Option<String>,

    /// Delete this job's local files after a successful upload
    #[arg(long)]
    cleanup: bool,

    /// Delete every local archive in the destination after a successful upload
    #[arg(long)]
    clean_all_archives: bool,

    /// Only report what cleanup would delete
    #[arg(long, requires = "cleanup_scope")]
    dry_run_cleanup: bool,

    /// Prompt for the archive password
    #[arg(long)]
    ask_password: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("from").required(true).args(["archive_file", "from_drive"])))]
struct RestoreArgs {
    /// Local archive to restore
    #[arg(long)]
    archive_file: Option<PathBuf>,

    /// Timestamp record for --archive-file, defaults to its sibling
    #[arg(long, requires = "archive_file")]
    metadata_file: Option<PathBuf>,

    /// Pick an archive from the remote
    #[arg(long)]
    from_drive: bool,

    /// 1-based position in the remote listing, skips the prompt
    #[arg(long, requires = "from_drive")]
    select: Option<usize>,

    /// Where the archive contents go
    #[arg(long, default_value = "restored")]
    target_dir: PathBuf,

    /// Directory downloads are written to
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Prompt for the archive password
    #[arg(long)]
    ask_password: bool,
}

/// CLI values layered over file and environment configuration.
#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    remote_folder: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        let destination = match &cli.command {
            Commands::Backup(args) => args.destination.clone(),
            Commands::Restore(args) => args.destination.clone(),
            _ => None,
        };

        Self {
            destination,
            remote_folder: cli.remote_folder.clone(),
            simulation: cli.simulation.then_some(true),
            verbose: cli.verbose.then_some(true),
            json_logs: cli.json.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let overrides = Overrides::from_cli(&cli);
    let config = match AppConfig::new(Some(&overrides)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error[ConfigError]: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let credentials_path = config.credentials_path.clone();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in failure_report(&err, &credentials_path) {
                eprintln!("{line}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Lines printed for a failed command. Auth failures point at the token
/// file the effective configuration reads.
fn failure_report(err: &anyhow::Error, credentials_path: &Path) -> Vec<String> {
    let kind = err
        .downcast_ref::<JobError>()
        .map(JobError::kind)
        .unwrap_or("ConfigError");
    let mut lines = vec![format!("error[{kind}]: {err:#}")];

    if err.downcast_ref::<JobError>().is_some_and(JobError::is_auth) {
        lines.push(format!(
            "hint: re-authorize and place a fresh token at {}",
            credentials_path.display()
        ));
    }
    lines
}

async fn run(cli: Cli, mut config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    if let Commands::Config = cli.command {
        println!("# {}", config::config_file_path().display());
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let ask = match &cli.command {
        Commands::Backup(args) => args.ask_password,
        Commands::Restore(args) => args.ask_password,
        _ => false,
    };
    if ask {
        let password = rpassword::prompt_password("Archive password: ")
            .context("Failed to read password")?;
        config.password = Some(password).filter(|p| !p.is_empty());
    }

    let ctx = AppContext::new(config);
    spawn_signal_handler(ctx.cancel.clone());

    let orchestrator = BackupOrchestrator::from_context(&ctx)?;

    match cli.command {
        Commands::Backup(args) => run_backup(&ctx, &orchestrator, args).await,
        Commands::Restore(args) => run_restore(&ctx, &orchestrator, args).await,
        Commands::List => run_list(&orchestrator).await,
        Commands::Config => Ok(()),
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, cancelling");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}

async fn run_backup(
    ctx: &AppContext,
    orchestrator: &BackupOrchestrator,
    args: BackupArgs,
) -> Result<()> {
    let request = BackupRequest {
        source: args.source,
        destination: ctx.config.destination.clone(),
        label: args.label,
        password: ctx.config.password.clone(),
        cleanup: CleanupPlan {
            this_job: args.cleanup,
            all_archives: args.clean_all_archives,
            dry_run: args.dry_run_cleanup,
        },
    };

    let outcome = orchestrator.run_backup(request).await?;

    println!("Backup complete");
    println!("  Archive:  {}", outcome.archive.display());
    if let Some(metadata) = &outcome.metadata {
        println!("  Metadata: {}", metadata.display());
    }
    println!(
        "  Remote:   {} ({})",
        outcome.remote_archive.name,
        format_size(outcome.remote_archive.size)
    );
    if let Some(report) = &outcome.cleanup {
        for path in &report.planned {
            println!("  Would remove {}", path.display());
        }
        for path in &report.removed {
            println!("  Removed {}", path.display());
        }
    }
    Ok(())
}

async fn run_restore(
    ctx: &AppContext,
    orchestrator: &BackupOrchestrator,
    args: RestoreArgs,
) -> Result<()> {
    let password = ctx.config.password.as_deref();

    let outcome = if let Some(archive) = &args.archive_file {
        orchestrator
            .restore_local(
                archive,
                args.metadata_file.as_deref(),
                &args.target_dir,
                password,
            )
            .await?
    } else {
        let preselected = args.select;
        orchestrator
            .restore_from_remote(
                |entries| match preselected {
                    Some(n) => n.checked_sub(1),
                    None => prompt_selection(entries),
                },
                &args.target_dir,
                password,
            )
            .await?
    };

    println!("Restored {} into {}", outcome.archive.display(), outcome.target.display());
    if let Some(report) = outcome.timestamps {
        println!(
            "  Timestamps applied to {} files ({} skipped)",
            report.applied, report.skipped
        );
    }
    Ok(())
}

async fn run_list(orchestrator: &BackupOrchestrator) -> Result<()> {
    let entries = orchestrator.list_archives().await?;
    if entries.is_empty() {
        println!("No archives found");
        return Ok(());
    }

    print_entries(&entries);
    info!(count = entries.len(), "Listed remote archives");
    Ok(())
}

fn print_entries(entries: &[RemoteEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        println!(
            "{:>3}. {}  {:>10}  {}",
            i + 1,
            entry.modified.format("%Y-%m-%d %H:%M"),
            format_size(entry.size),
            entry.name
        );
    }
}

/// Show the listing and read a 1-based choice from stdin.
fn prompt_selection(entries: &[RemoteEntry]) -> Option<usize> {
    if entries.is_empty() {
        println!("No archives found");
        return None;
    }

    print_entries(entries);
    print!("Archive to restore [1-{}]: ", entries.len());
    std::io::stdout().flush().ok()?;

    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input).ok()?;
    input.trim().parse::<usize>().ok()?.checked_sub(1)
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
