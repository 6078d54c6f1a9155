//! testgrid CLI - Test execution orchestrator.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testgrid::config::{self, Config};
use testgrid::model::{ExecutionPlanStatus, PlanId, TestKey, load_plan};
use testgrid::orchestrator::Orchestrator;
use testgrid::pool::Environment;
use testgrid::report;
use testgrid::store::StateStore;
use testgrid::tracker::StatusTracker;

#[derive(Parser)]
#[command(name = "testgrid")]
#[command(about = "Run test plans on containers, emulators and physical boards", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testgrid.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit plans and run them, together with any recovered work, to completion
    Run {
        /// Plan files (.toml or .json)
        #[arg(required = true)]
        plans: Vec<PathBuf>,

        /// Override maximum parallel workers
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Stream test output to the terminal
        #[arg(long)]
        stream: bool,
    },

    /// Show persisted plan status
    Status {
        /// Only this plan
        #[arg(long)]
        plan: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the configured environment pool
    Pool {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Backend to configure (container, emulator, physical)
        #[arg(short, long, default_value = "container")]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("TESTGRID_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            plans,
            parallel,
            stream,
        } => run_plans(&cli.config, &plans, parallel, stream).await,
        Commands::Status { plan, format } => show_status(&cli.config, plan, &format),
        Commands::Pool { format } => show_pool(&cli.config, &format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { backend } => init_config(&backend),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config::validate(&config)?;
    Ok(config)
}

async fn run_plans(
    config_path: &Path,
    plan_paths: &[PathBuf],
    parallel_override: Option<usize>,
    stream: bool,
) -> Result<()> {
    let mut config = load(config_path)?;
    if let Some(parallel) = parallel_override {
        config.orchestrator.max_parallel = parallel;
    }
    if stream {
        config.orchestrator.stream_output = true;
    }
    info!("Loaded configuration from {}", config_path.display());

    let plans = plan_paths
        .iter()
        .map(|p| load_plan(p))
        .collect::<Result<Vec<_>>>()?;

    let orchestrator = Orchestrator::from_config(&config)
        .await
        .context("Failed to start orchestrator")?;
    let handle = orchestrator.start();
    let start = Instant::now();

    let mut submitted: Vec<PlanId> = Vec::new();
    for plan in plans {
        let id = plan.id.clone();
        match orchestrator.submit(plan) {
            Ok(id) => submitted.push(id),
            Err(e) => {
                // stop what already started before reporting the rejection
                cancel_unfinished(&orchestrator);
                orchestrator.wait_idle().await;
                handle.shutdown().await;
                return Err(e).with_context(|| format!("Failed to submit plan {id}"));
            }
        }
    }

    tokio::select! {
        _ = orchestrator.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling unfinished plans");
            cancel_unfinished(&orchestrator);
            orchestrator.wait_idle().await;
        }
    }
    let elapsed = start.elapsed();

    let statuses: Vec<ExecutionPlanStatus> = orchestrator.plans();
    for status in statuses.iter().filter(|s| submitted.contains(&s.plan)) {
        report::print_summary(status, Some(elapsed));
        if let Some(plan) = orchestrator.tracker().plan(&status.plan) {
            let results: Vec<_> = plan
                .tests
                .iter()
                .filter_map(|t| orchestrator.result(&TestKey::new(plan.id.clone(), t.id.clone())))
                .collect();
            report::print_failures(&results);
        }
    }

    handle.shutdown().await;

    let finished: Vec<ExecutionPlanStatus> = statuses
        .into_iter()
        .filter(|s| submitted.contains(&s.plan))
        .collect();
    std::process::exit(report::exit_code(&finished));
}

fn cancel_unfinished(orchestrator: &Orchestrator) {
    for status in orchestrator.plans() {
        if status.state.is_terminal() {
            continue;
        }
        if let Err(e) = orchestrator.cancel(&status.plan) {
            warn!(plan = %status.plan, error = %e, "Failed to cancel plan");
        }
    }
}

fn show_status(config_path: &Path, plan: Option<String>, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let tracker = StatusTracker::open(StateStore::new(&config.orchestrator.state_dir))?;

    let statuses = match plan {
        Some(id) => {
            let id = PlanId::from(id);
            match tracker.snapshot(&id) {
                Some(status) => vec![status],
                None => bail!("Unknown plan: {}", id),
            }
        }
        None => tracker.plans(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&statuses)?),
        _ => {
            if statuses.is_empty() {
                println!("No plans recorded in {}", config.orchestrator.state_dir.display());
            }
            for status in &statuses {
                report::print_summary(status, None);
            }
        }
    }
    Ok(())
}

fn show_pool(config_path: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let environments: Vec<Environment> = config
        .environments
        .iter()
        .map(|e| e.to_environment())
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&environments)?),
        _ => report::print_pool(&environments),
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max parallel: {}", config.orchestrator.max_parallel);
            println!("  Test timeout: {}s", config.orchestrator.test_timeout_secs);
            println!("  Transient retries: {}", config.orchestrator.transient_retries);
            println!("  Environments: {}", config.environments.len());

            let backends: Vec<&str> = [
                config.backends.container.as_ref().map(|_| "container"),
                config.backends.emulator.as_ref().map(|_| "emulator"),
                config.backends.physical.as_ref().map(|_| "physical"),
            ]
            .into_iter()
            .flatten()
            .collect();
            println!("  Backends: {}", backends.join(", "));

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(backend: &str) -> Result<()> {
    let backend_config = match backend {
        "container" => {
            r#"[backends.container]
image = "ubuntu:24.04"
network_mode = "none"

[[environments]]
id = "ctr-1"
backend = "container"
architecture = "x86_64"
memory_mb = 4096
cpu_cores = 2"#
        }
        "emulator" => {
            r#"[backends.emulator]
launch_command = "emuctl start --arch {arch} --mem {memory_mb} --smp {cpu_cores}"
exec_command = "emuctl exec {instance} -- sh -c {command}"
reset_command = "emuctl restore {instance} --snapshot clean"
health_command = "emuctl ping {instance}"
destroy_command = "emuctl stop {instance}"

[[environments]]
id = "emu-arm64-1"
backend = "emulated_hardware"
handle = "arm64-1"
architecture = "arm64"
memory_mb = 2048
cpu_cores = 2"#
        }
        "physical" => {
            r#"[backends.physical]
user = "ci"
identity_file = "~/.ssh/boards"
reset_command = "sudo /usr/local/bin/board-reset"

[[environments]]
id = "board-1"
backend = "physical"
handle = "board-1.lab"
architecture = "arm64"
memory_mb = 4096
cpu_cores = 4"#
        }
        _ => {
            eprintln!(
                "Unknown backend: {}. Use: container, emulator, physical",
                backend
            );
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# testgrid configuration file

[orchestrator]
max_parallel = 8
test_timeout_secs = 900
kill_grace_secs = 5
transient_retries = 1
state_dir = ".testgrid"

[provisioning]
enabled = false

{}
"#,
        backend_config
    );

    let path = PathBuf::from("testgrid.toml");
    if path.exists() {
        eprintln!("testgrid.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created testgrid.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  testgrid run plan.toml");

    Ok(())
}
