//! `energy_fl` command line.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use energy_fl::config::Settings;
use energy_fl::experiment::encode;
use energy_fl::ledger::{Ledger, StatusFilter};
use energy_fl::logging;
use energy_fl::orchestrator::Orchestrator;
use energy_fl::remote::SshExecutor;
use energy_fl::training::CommandCoordinator;

#[derive(Parser, Debug)]
#[command(name = "energy_fl", about = "Energy-instrumented federated learning campaigns")]
struct Cli {
    /// TOML configuration file (defaults to config/energy_fl.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every experiment of the configured campaign not yet finished.
    Run(RunArgs),
    /// List ledger entries.
    Status(StatusArgs),
    /// Delete ledger entries.
    Purge(PurgeArgs),
    /// Print the campaign's experiment keys without running anything.
    Grid,
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Run experiments again even when the ledger marks them finished.
    #[arg(long)]
    rerun_finished: bool,
}

#[derive(ClapArgs, Debug)]
struct StatusArgs {
    /// Only show entries of this version.
    #[arg(long)]
    version: Option<String>,
    #[arg(long, value_enum, default_value_t = Filter::All)]
    filter: Filter,
    /// Emit one JSON object per entry.
    #[arg(long)]
    json: bool,
}

#[derive(ClapArgs, Debug)]
struct PurgeArgs {
    /// Only delete entries of this version.
    #[arg(long)]
    version: Option<String>,
    /// Confirm the deletion.
    #[arg(long)]
    yes: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Filter {
    All,
    Running,
    Finished,
    Incomplete,
    Failed,
}

impl From<Filter> for StatusFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::All => StatusFilter::All,
            Filter::Running => StatusFilter::Running,
            Filter::Finished => StatusFilter::Finished,
            Filter::Incomplete => StatusFilter::Incomplete,
            Filter::Failed => StatusFilter::Failed,
        }
    }
}

fn open_ledger(settings: &Settings) -> Result<Ledger> {
    let path = &settings.paths.ledger_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ledger::open(path).with_context(|| format!("opening ledger {}", path.display()))
}

async fn run(settings: Settings, args: RunArgs) -> Result<()> {
    let topology = settings.topology()?;
    let descriptors = settings.parameter_grid().generate(&settings.catalog)?;
    info!(
        "Campaign {} with {} experiment(s) on {} part(ies)",
        settings.application.experiment_version,
        descriptors.len(),
        topology.parties().len()
    );

    let ledger = open_ledger(&settings)?;
    let executor = SshExecutor::new(settings.remote.clone());
    let trainer = CommandCoordinator::new(
        &settings.commands.training,
        topology.aggregator().training_port,
    );
    let rerun = args.rerun_finished || settings.campaign.rerun_finished;

    let mut orchestrator = Orchestrator::new(topology, settings.clone(), executor, trainer, ledger);
    let outcome = tokio::select! {
        summary = orchestrator.run_campaign(&descriptors, rerun) => Some(summary?),
        _ = tokio::signal::ctrl_c() => None,
    };
    drop(orchestrator);

    match outcome {
        Some(summary) => println!(
            "{} finished, {} failed, {} skipped of {}",
            summary.finished, summary.failed, summary.skipped, summary.total
        ),
        None => {
            warn!("Interrupted; the current experiment will run again on resume");
            let mut ledger = open_ledger(&settings)?;
            for descriptor in ledger.query(StatusFilter::Running, None)? {
                ledger.set_not_running(&descriptor)?;
            }
        }
    }
    Ok(())
}

fn status(settings: &Settings, args: StatusArgs) -> Result<()> {
    let ledger = open_ledger(settings)?;
    for descriptor in ledger.query(args.filter.into(), args.version.as_deref())? {
        let state = ledger.status(&descriptor)?;
        if args.json {
            let line = serde_json::json!({
                "key": encode(&descriptor),
                "status": state,
                "descriptor": descriptor,
            });
            println!("{}", line);
        } else {
            println!("{:<10} {}", format!("{:?}", state), descriptor);
        }
    }
    Ok(())
}

fn purge(settings: &Settings, args: PurgeArgs) -> Result<()> {
    if !args.yes {
        bail!("refusing to purge the ledger without --yes");
    }
    let mut ledger = open_ledger(settings)?;
    let removed = ledger.purge(args.version.as_deref())?;
    println!("Removed {} ledger row(s)", removed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init(&settings.application.log_level, settings.application.log_format)?;

    match cli.command {
        Command::Run(args) => run(settings, args).await,
        Command::Status(args) => status(&settings, args),
        Command::Purge(args) => purge(&settings, args),
        Command::Grid => {
            for descriptor in settings.parameter_grid().generate(&settings.catalog)? {
                println!("{}", encode(&descriptor));
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}
