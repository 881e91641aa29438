//! statecraft - state-chart runner
//!
//! Loads a document, feeds it events read from stdin and prints the active
//! configuration after every macrostep.

mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use statecraft_core::{Data, Document, Event};
use statecraft_interp::{Interpreter, InterpreterConfig, InterpreterError, InterpreterState};
use statecraft_storage::{SnapshotPolicy, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "statecraft")]
#[command(about = "Run state-chart documents")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "STATECRAFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a document. Events are read from stdin, one per line, as
    /// `name` or `name {json data}`.
    Run {
        /// Document file (JSON)
        document: PathBuf,

        /// Persist the session into this directory
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Resume the latest snapshot of this session id
        #[arg(long)]
        resume: Option<String>,

        /// Session id for a new session
        #[arg(long, conflicts_with = "resume")]
        session_id: Option<String>,
    },

    /// Validate a document
    Check {
        /// Document file (JSON)
        document: PathBuf,
    },

    /// List stored snapshots
    Snapshots {
        /// Snapshot directory
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run_cli(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<(), BoxError> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            document,
            snapshot_dir,
            resume,
            session_id,
        } => {
            if snapshot_dir.is_some() {
                config.storage.snapshot_dir = snapshot_dir;
            }
            run(&config, &document, resume, session_id).await
        }
        Commands::Check { document } => {
            let doc = load_document(&document)?;
            println!(
                "{} {} ({} states, {} transitions, checksum {})",
                "ok".green().bold(),
                doc.name.bold(),
                doc.state_count() - 1,
                doc.transition_count(),
                doc.checksum
            );
            Ok(())
        }
        Commands::Snapshots { snapshot_dir } => {
            let dir = snapshot_dir
                .or(config.storage.snapshot_dir)
                .ok_or("no snapshot directory configured")?;
            let store = SnapshotStore::open(dir)?;
            if store.is_empty() {
                println!("{}", "no snapshots".dimmed());
            }
            for meta in store.list() {
                println!(
                    "{}  {}  {} bytes  {}",
                    meta.session_id.bold(),
                    meta.document.cyan(),
                    meta.size_bytes,
                    meta.snapshot_id.dimmed()
                );
            }
            Ok(())
        }
    }
}

fn load_document(path: &Path) -> Result<Document, BoxError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    Ok(Document::from_json_str(&text)?)
}

async fn run(
    config: &Config,
    document: &Path,
    resume: Option<String>,
    session_id: Option<String>,
) -> Result<(), BoxError> {
    let doc = Arc::new(load_document(document)?);
    let store = match &config.storage.snapshot_dir {
        Some(dir) => Some(Arc::new(SnapshotStore::open(dir)?)),
        None => None,
    };

    let mut interp_config =
        InterpreterConfig::new().with_max_microsteps(config.interpreter.max_microsteps);
    if let Some(id) = resume.clone().or(session_id) {
        interp_config = interp_config.with_session_id(id);
    }
    let interp = Arc::new(Interpreter::new(Arc::clone(&doc), interp_config)?);

    if let Some(id) = &resume {
        let store = store
            .as_ref()
            .ok_or("--resume needs a snapshot directory")?;
        let snapshot = store
            .latest(id)?
            .ok_or_else(|| format!("no snapshot for session '{}'", id))?;
        interp.deserialize(&snapshot)?;
        tracing::info!(session = %id, state = %interp.state(), "resumed");
    }

    println!(
        "{} {} {}",
        "session".dimmed(),
        interp.session_id().bold(),
        format!("({})", doc.name).dimmed()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let mut stepper = {
        let interp = Arc::clone(&interp);
        let store = store.clone();
        let stop = Arc::clone(&stop);
        let policy = config.storage.policy();
        let timeout = config.interpreter.step_timeout();
        tokio::task::spawn_blocking(move || {
            drive(&interp, store.as_deref(), policy, timeout, &stop)
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut finished = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match parse_event_line(&line) {
                    Ok(Some(event)) => interp.send(event),
                    Ok(None) => {}
                    Err(e) => eprintln!("{} {}", "invalid event:".yellow(), e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, stopping");
                break;
            }
            result = &mut stepper => {
                finished = true;
                result??;
                break;
            }
        }
    }

    if !finished {
        stop.store(true, Ordering::Release);
        stepper.await??;
    }
    Ok(())
}

/// Steps the session until it ends or `stop` is set, printing every new
/// configuration.
fn drive(
    interp: &Interpreter,
    store: Option<&SnapshotStore>,
    policy: SnapshotPolicy,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), BoxError> {
    let mut last: Option<Vec<String>> = None;
    let mut changes = 0u64;

    let result = loop {
        // Once stopping, only drain what was already queued.
        let stopping = stop.load(Ordering::Acquire);
        if stopping
            && !interp.has_pending_events()
            && interp.state() != InterpreterState::Instantiated
        {
            break Ok(());
        }
        let wait = if stopping { Duration::ZERO } else { timeout };

        let state = match interp.step(Some(wait)) {
            Ok(state) => state,
            Err(InterpreterError::Terminated { state }) => state,
            Err(e) => break Err(e.into()),
        };

        let configuration = interp.configuration()?;
        if last.as_ref() != Some(&configuration) {
            print_configuration(&configuration, state);
            last = Some(configuration);
            changes += 1;
            if let Some(store) = store {
                if policy.due_after(changes) {
                    store.save(&interp.serialize()?)?;
                }
            }
        }
        if state.is_terminal() {
            println!("{} {}", "session".dimmed(), state.to_string().bold());
            break Ok(());
        }
    };

    if let Some(store) = store {
        if policy.on_exit() {
            store.save(&interp.serialize()?)?;
        }
    }
    result
}

fn print_configuration(configuration: &[String], state: InterpreterState) {
    let states = if configuration.is_empty() {
        "(none)".dimmed().to_string()
    } else {
        configuration.join(", ").green().to_string()
    };
    println!("{} {}", format!("[{}]", state).cyan(), states);
}

/// Parses `name` or `name {json}`. Blank lines and `#` comments yield `None`.
fn parse_event_line(line: &str) -> Result<Option<Event>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    let mut event = Event::external(name);
    if !rest.is_empty() {
        let json: serde_json::Value =
            serde_json::from_str(rest).map_err(|e| format!("bad data for '{}': {}", name, e))?;
        event = event.with_data(Data::from_json(&json));
    }
    Ok(Some(event))
}
