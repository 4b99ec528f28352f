//! Config Time Machine - command line entry point
//!
//! Every command prints JSON (or raw file bytes for `show`) on stdout and
//! logs to stderr. The exit code identifies the error kind.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use timemachine_core::backend::{self, HistoryBackend, SnapshotBackend};
use timemachine_core::config::{ConfigLoader, Settings};
use timemachine_core::restore::RestoreContext;
use timemachine_core::scanner;
use timemachine_core::schedule::{self, ScheduleJob, ScheduleStore};
use timemachine_core::snapshot::Trigger;
use timemachine_core::writer::SnapshotWriter;
use timemachine_core::{utils, TimeMachineError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List snapshot folders under a backup root
    Scan {
        /// Root to scan (defaults to the configured backup folder)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Take a snapshot of the live configuration now
    WriteNow {
        /// IANA timezone for the snapshot timestamp
        #[arg(long)]
        timezone: Option<String>,
    },
    /// List snapshots, newest first
    List,
    /// Show what a snapshot changed relative to its predecessor
    Diff { revision: String, file: Option<String> },
    /// List the files stored in a snapshot
    ListFiles { revision: String },
    /// Show the file tree of a snapshot (latest when omitted)
    Tree { revision: Option<String> },
    /// Print a file as it was in a snapshot
    Show { revision: String, file: String },
    /// Restore a single file from a snapshot into the live configuration
    RestoreFile {
        revision: String,
        file: String,
        /// Restore into this directory instead of the live configuration
        #[arg(long)]
        destination: Option<PathBuf>,
    },
    /// Keep the newest snapshots and delete the rest
    Prune { keep: usize },
    /// Move legacy snapshot folders out of the history store
    Migrate,
    /// History store statistics
    Stats,
    /// Create or replace a scheduled backup
    SetSchedule {
        id: String,
        cron: String,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        disabled: bool,
        /// Live configuration directory for this job
        #[arg(long)]
        source: Option<PathBuf>,
        /// Backup root for this job
        #[arg(long)]
        destination: Option<PathBuf>,
        /// Enable retention, keeping this many snapshots
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Print all scheduled backups
    GetSchedule,
    /// Delete a scheduled backup
    RemoveSchedule { id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_backend(settings: &Settings) -> Box<dyn SnapshotBackend> {
    backend::open(settings.backup.mode, settings.backup.backup_folder_path.clone())
}

fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::Scan { root } => {
            let root = root.unwrap_or_else(|| settings.backup.backup_folder_path.clone());
            let mut found = scanner::scan(&root)?;
            found.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.relative.cmp(&a.relative))
            });
            print_json(&found)?;
        }
        Command::WriteNow { timezone } => {
            let timezone = timezone.or_else(|| settings.backup.timezone.clone());
            let backend = open_backend(&settings);
            let report = SnapshotWriter::from_settings(&settings).write(
                backend.as_ref(),
                &settings.backup.live_config_path,
                Trigger::Manual,
                timezone,
            )?;
            print_json(&report)?;
        }
        Command::List => print_json(&open_backend(&settings).list()?)?,
        Command::Diff { revision, file } => {
            let diff = open_backend(&settings).diff(&revision, file.as_deref())?;
            print!("{diff}");
        }
        Command::ListFiles { revision } => {
            print_json(&open_backend(&settings).list_files(&revision)?)?;
        }
        Command::Tree { revision } => {
            let backend = open_backend(&settings);
            let revision = match revision {
                Some(revision) => revision,
                None => backend
                    .list()?
                    .into_iter()
                    .next()
                    .map(|s| s.id)
                    .ok_or_else(|| TimeMachineError::not_found("snapshot", backend.root()))?,
            };
            print_json(&backend.file_tree(&revision)?)?;
        }
        Command::Show { revision, file } => {
            let content = open_backend(&settings).read_file_at(&revision, &file)?;
            std::io::stdout().write_all(&content)?;
        }
        Command::RestoreFile {
            revision,
            file,
            destination,
        } => {
            let backend = open_backend(&settings);
            let ctx = RestoreContext {
                live_root: destination.unwrap_or_else(|| settings.backup.live_config_path.clone()),
                timezone: settings.backup.timezone.clone(),
                credentials_configured: settings.reload_credentials_configured(),
                writer: SnapshotWriter::from_settings(&settings),
            };
            print_json(&ctx.restore_file(backend.as_ref(), &revision, &file)?)?;
        }
        Command::Prune { keep } => print_json(&open_backend(&settings).prune(keep)?)?,
        Command::Migrate => {
            let moved = HistoryBackend::new(&settings.backup.backup_folder_path).migrate_legacy_folders()?;
            print_json(&serde_json::json!({ "migrated": moved }))?;
        }
        Command::Stats => {
            print_json(&HistoryBackend::new(&settings.backup.backup_folder_path).stats()?)?;
        }
        Command::SetSchedule {
            id,
            cron,
            timezone,
            disabled,
            source,
            destination,
            keep,
        } => {
            let mut job = ScheduleJob::new(id, cron);
            job.enabled = !disabled;
            job.timezone = timezone;
            job.source_path = source;
            job.destination_path = destination;
            if let Some(keep) = keep {
                job.retention_enabled = true;
                job.retention_count = keep;
            }
            schedule::validate(&job)?;

            let store = ScheduleStore::new(settings.schedule_file());
            let mut jobs = store.load();
            jobs.insert(job.id.clone(), job.clone());
            store.save(&jobs)?;
            tracing::info!(job_id = %job.id, "Schedule saved; running daemons pick it up on restart");
            print_json(&job)?;
        }
        Command::GetSchedule => {
            print_json(&ScheduleStore::new(settings.schedule_file()).load())?;
        }
        Command::RemoveSchedule { id } => {
            let store = ScheduleStore::new(settings.schedule_file());
            let mut jobs = store.load();
            if jobs.remove(&id).is_none() {
                return Err(TimeMachineError::not_found(format!("schedule '{id}'"), store.path()).into());
            }
            store.save(&jobs)?;
            print_json(&serde_json::json!({ "removed": id }))?;
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let loader = ConfigLoader::from_args(args.config);
    let settings = match loader.load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.kind().exit_code());
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&settings.log.level);
    if let Err(e) = utils::logger::init_stderr(log_level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    if let Err(e) = run(args.command, settings) {
        let code = e
            .downcast_ref::<TimeMachineError>()
            .map(|e| e.kind().exit_code())
            .unwrap_or(1);
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        std::process::exit(code);
    }
}
