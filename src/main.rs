mod sim;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use labflow::logging::{init_tracing, level_for_verbosity};
use labflow::{JsonFileStore, LabConfig, MemoryStore, Scheduler, SnapshotStore, TracingAudit, WaypointTable};

#[derive(Parser, Debug)]
#[command(name = "labflow", version, about = "Lab robot task scheduler")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two simulated robots run the bundled configuration (default).
    Demo,
    /// Repeat the demo flow without simulated work and print CSV throughput.
    Bench {
        #[arg(long, default_value_t = 20)]
        rounds: usize,
    },
    /// Load a configuration, build a scheduler from it and print a summary.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the archive snapshot as JSON.
    Snapshot {
        #[arg(long)]
        config: PathBuf,
        /// Snapshot file to load; defaults to `app.snapshot_path`.
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn validate(path: &Path) -> labflow::Result<()> {
    let config = LabConfig::from_path(path)?;
    let zones = config.zones.len();
    let transitions = config.transitions.len();
    let robots = config.app.robots.len();
    let scheduler = Scheduler::new(config)?;
    println!(
        "config ok: zones={zones} transitions={transitions} robots={robots} hooks={}",
        scheduler.hook_count()
    );
    Ok(())
}

fn snapshot(config: &Path, store: Option<PathBuf>) -> labflow::Result<()> {
    let config = LabConfig::from_path(config)?;
    let store: Arc<dyn SnapshotStore> = match store.or_else(|| config.app.snapshot_path.clone()) {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let waypoints = WaypointTable::from_config(&config.waypoints)?;
    let scheduler =
        Scheduler::with_collaborators(config, store, Arc::new(TracingAudit), Arc::new(waypoints))?;
    println!("{}", serde_json::to_string_pretty(&scheduler.get_archive_snapshot())?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(level_for_verbosity(cli.verbose, cli.quiet));
    let outcome = match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => sim::run_demo(),
        Command::Bench { rounds } => sim::run_benchmark(rounds),
        Command::Validate { config } => validate(&config),
        Command::Snapshot { config, store } => snapshot(&config, store),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("labflow: {err}");
            ExitCode::FAILURE
        }
    }
}
