mod config;
mod enablement;
mod engine;
mod executor;
mod mutant;
mod pool;
#[cfg(test)]
mod testing;
mod verify;
mod workdir;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::enablement::Enablement;
use crate::engine::{Engine, EngineSettings};
use crate::mutant::{BoxedMutant, ManifestEntry, MutantType};
use crate::verify::CommandVerifier;
use crate::workdir::CopyProvisioner;

/// Boxed future used at the trait seams that need dynamic dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Parser)]
#[command(name = "mutiny")]
#[command(version)]
#[command(about = "Runs mutation tests in parallel, isolated working copies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the mutants listed in a manifest
    Run(RunArgs),
    /// List mutant types and whether they are enabled
    Types {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Project whose .mutiny.toml should be consulted
        #[arg(long, default_value = ".")]
        source_root: PathBuf,
    },
    /// Write a configuration file with every default spelled out
    Init {
        /// Where to write it (defaults to the per-user config file)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON manifest of mutants produced by the analysis pass
    manifest: PathBuf,

    /// Root of the project under test
    #[arg(long, default_value = ".")]
    source_root: PathBuf,

    /// Number of mutants executed concurrently
    #[arg(short, long)]
    workers: Option<usize>,

    /// Multiplier applied to the baseline duration
    #[arg(long)]
    timeout_coefficient: Option<u32>,

    /// Fixed per-mutant timeout in seconds
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Classify mutants without running anything
    #[arg(long)]
    dry_run: bool,

    /// Write the results as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Types {
            config,
            source_root,
        } => {
            let (config, _) = Config::resolve(config.as_deref(), &source_root)?;
            init_logging(&config.general.log_level);
            list_types(&config)
        }
        Commands::Init { config } => {
            init_logging("info");
            init_config(config.as_deref())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let (mut config, config_path) = Config::resolve(args.config.as_deref(), &args.source_root)?;
    init_logging(&config.general.log_level);

    tracing::info!(
        "Config path: {}",
        config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none, using defaults)".to_string())
    );

    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if let Some(coefficient) = args.timeout_coefficient {
        config.engine.timeout_coefficient = coefficient;
    }
    if let Some(seconds) = args.timeout_seconds {
        config.engine.timeout_seconds = Some(seconds);
    }

    anyhow::ensure!(
        args.source_root.is_dir(),
        "Source root {:?} is not a directory",
        args.source_root
    );
    let source_root = args
        .source_root
        .canonicalize()
        .with_context(|| format!("Failed to resolve source root {:?}", args.source_root))?;

    let mutants: Vec<BoxedMutant> = ManifestEntry::load(&args.manifest)?
        .into_iter()
        .map(|entry| Box::new(entry.into_mutant()) as BoxedMutant)
        .collect();
    tracing::info!("Loaded {} mutants from {:?}", mutants.len(), args.manifest);

    let settings = EngineSettings {
        dry_run: args.dry_run,
        ..EngineSettings::from_config(&config.engine)
    };
    let enablement = Enablement::new(&config.mutant_overrides());
    tracing::debug!("Enabled mutant types: {:?}", enablement.enabled_types());
    let provisioner = Arc::new(CopyProvisioner::new(
        source_root,
        config.engine.skip.clone(),
        config.engine.workdir_prefix.clone(),
    ));
    tracing::info!("Source root: {}", provisioner.source_root().display());
    let verifier = Arc::new(
        CommandVerifier::new(
            config.engine.build_command.clone(),
            config.engine.test_command.clone(),
        )
        .with_max_output_bytes(config.engine.max_output_bytes),
    );

    let engine = Engine::new(settings, enablement, provisioner.clone(), verifier)?;
    let summary = engine.run(mutants).await?;
    summary.log();
    tracing::debug!(
        "Working directories left behind: {} live, {} idle",
        provisioner.live_count(),
        provisioner.idle_count()
    );

    if let Some(output) = &args.output {
        summary.write_json(output)?;
        tracing::info!("Results written to {:?}", output);
    }

    Ok(())
}

fn list_types(config: &Config) -> anyhow::Result<()> {
    let enablement = Enablement::new(&config.mutant_overrides());
    if !enablement.unknown_keys().is_empty() {
        anyhow::bail!(
            "Unknown mutant configuration keys: {}",
            enablement.unknown_keys().join(", ")
        );
    }

    for mutant_type in MutantType::ALL {
        let state = if enablement.is_enabled(mutant_type) {
            "enabled"
        } else {
            "disabled"
        };
        println!("{:<24} {:<10} {}", mutant_type.name(), state, mutant_type.enabled_key());
    }
    Ok(())
}

fn init_config(path: Option<&Path>) -> anyhow::Result<()> {
    let target = path
        .map(PathBuf::from)
        .or_else(Config::default_config_path)
        .context("No config path available")?;
    anyhow::ensure!(!target.exists(), "Refusing to overwrite {:?}", target);

    Config::default().save(Some(&target))?;
    tracing::info!("Wrote default configuration to {:?}", target);
    Ok(())
}
