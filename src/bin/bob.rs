use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bob_builder::process;
use bob_builder::storage::local::LocalConnector;
use bob_builder::storage::BucketRegistry;
use bob_builder::{Config, Error, Formula};
use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Build formulas and publish their output as archives.
#[derive(Debug, Parser)]
#[command(name = "bob", version)]
struct Cli {
    /// TOML configuration file (defaults to ./bob.toml when present).
    #[arg(long, global = true, env = "BOB_CONFIG")]
    config: Option<PathBuf>,

    /// Show debug logging.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a formula into its build path.
    Build(Target),
    /// Build, then pack the build path into a local archive.
    Archive(PublishTarget),
    /// Build, archive, and upload the archive to the primary bucket.
    Deploy(PublishTarget),
}

#[derive(Debug, Args)]
struct Target {
    /// Formula path relative to the workspace directory.
    formula: String,

    /// Alternate name for the archived output.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct PublishTarget {
    #[command(flatten)]
    target: Target,

    /// Allow overwriting a deployed archive.
    #[arg(long)]
    overwrite: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match Config::from_env(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<Error>() {
            Some(Error::Interrupted { signal }) => {
                process::reraise(*signal);
                ExitCode::from(exit_status(128 + signal))
            }
            Some(bob_err) => {
                error!("{bob_err}");
                ExitCode::from(exit_status(bob_err.exit_code()))
            }
            None => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "bob_builder=info,bob=info",
        _ => "bob_builder=debug,bob=debug",
    };
    let filter = EnvFilter::try_from_env("BOB_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(command: &Command, config: &Config) -> Result<()> {
    let mut registry = BucketRegistry::new(
        LocalConnector::new(&config.storage_root),
        config.credentials.is_some(),
    );

    let (target, overwrite) = match command {
        Command::Build(target) => (target, None),
        Command::Archive(publish) | Command::Deploy(publish) => {
            (&publish.target, Some(publish.overwrite))
        }
    };

    let mut formula = Formula::connect(
        target.formula.clone(),
        target.name.clone(),
        config,
        &mut registry,
    )
    .with_context(|| format!("opening bucket '{}'", config.bucket.name))?;

    formula.build()?;
    if matches!(command, Command::Build(_)) {
        return Ok(());
    }

    println!("Archiving.");
    let archive = formula.archive()?;
    if matches!(command, Command::Archive(_)) {
        println!("{}", archive.display());
        return Ok(());
    }

    println!("Deploying.");
    let deployed = formula.deploy(overwrite.unwrap_or(false));
    let _ = std::fs::remove_file(&archive);
    deployed?;
    Ok(())
}

fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
