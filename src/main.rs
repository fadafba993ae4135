use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use constellation::device::{DeviceRecord, DeviceRegistry, ShellBackend};
use constellation::log::LogLevel;
use constellation::orchestration::{NoopOracle, Orchestrator};
use constellation::{Error, GraphSnapshot, OrchestratorConfig, Result, TaskGraph};

/// Constellation - run task graphs across a pool of execution devices
#[derive(Parser, Debug)]
#[command(name = "constellation")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONSTELLATION_LOG=<level>  Log level when --log-level is absent\n    CONSTELLATION_DEBUG=1      Enable debug logging"
)]
pub struct Cli {
    /// Log level (overrides CONSTELLATION_LOG)
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a plan to completion and print the per-task results as JSON
    Run {
        /// Plan file (graph snapshot JSON)
        plan: PathBuf,

        /// Config file (defaults to ~/.constellation/constellation.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a plan for cycles and inconsistent assignments
    Validate {
        /// Plan file (graph snapshot JSON)
        plan: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Config file (defaults to ~/.constellation/constellation.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    constellation::log::init(cli.log_level);

    match cli.command {
        Command::Run { plan, config } => run_plan(&plan, config.as_deref()),
        Command::Validate { plan } => validate_plan(&plan),
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load_from(path),
        None => OrchestratorConfig::load(),
    }
}

fn load_plan(path: &Path) -> Result<TaskGraph> {
    let snapshot: GraphSnapshot = serde_json::from_str(&fs::read_to_string(path)?)?;
    TaskGraph::from_snapshot(snapshot)
}

/// Register the configured devices, or a single local shell when none are.
fn build_registry(config: &OrchestratorConfig) -> Result<DeviceRegistry> {
    let registry = DeviceRegistry::new();
    if config.devices.is_empty() {
        registry.register(
            DeviceRecord::new("local", ["shell"], "shell"),
            Arc::new(ShellBackend::default()),
        );
        return Ok(registry);
    }
    for device in &config.devices {
        if device.kind != "shell" {
            return Err(Error::Validation(format!(
                "device {} has unsupported kind {}",
                device.id, device.kind
            )));
        }
        let mut backend = ShellBackend::default();
        if let Some(dir) = &device.working_dir {
            backend = backend.with_working_dir(PathBuf::from(dir));
        }
        registry.register(
            DeviceRecord::new(device.id.as_str(), device.capabilities.iter().cloned(), "shell"),
            Arc::new(backend),
        );
    }
    Ok(registry)
}

fn run_plan(plan: &Path, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let graph = load_plan(plan)?;
    let registry = Arc::new(build_registry(&config)?);

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let orchestrator = Orchestrator::new(config, registry, Arc::new(NoopOracle));
        orchestrator.orchestrate(graph).await
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.succeeded() {
        std::process::exit(2);
    }
    Ok(())
}

fn validate_plan(plan: &Path) -> Result<()> {
    let graph = load_plan(plan)?;
    let order = graph.topological_order()?;
    println!("{}", graph.summary());
    println!(
        "order: {}",
        order
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    Ok(())
}
