//! Testground local Docker runner - command line entry point.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use testground::{HealthcheckReport, LocalDockerRunner, RunInput};

#[derive(Parser, Debug)]
#[command(name = "testground")]
#[command(about = "Run distributed test plans as local Docker containers")]
#[command(version)]
struct Cli {
    /// Work directory holding runner state and run outputs
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the runner's singleton infrastructure, optionally repairing it
    Healthcheck {
        /// Attempt to repair anything unhealthy
        #[arg(long)]
        fix: bool,
    },
    /// Execute a run described by a JSON composition file
    Run {
        /// Path to the run composition (JSON)
        #[arg(long)]
        input: PathBuf,
        /// Override the composition's run id (generated when absent there)
        #[arg(long)]
        run_id: Option<String>,
        /// Retain test containers after the run
        #[arg(long)]
        keep_containers: bool,
        /// Log level exported to the test containers
        #[arg(long)]
        log_level: Option<String>,
        /// Create the containers without starting them
        #[arg(long)]
        unstarted: bool,
        /// Do not tail container output
        #[arg(long)]
        background: bool,
    },
    /// Archive the outputs of a finished run
    Collect {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        run_id: String,
        /// Destination archive (tar.gz)
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testground=info")),
        )
        .init();

    let cli = Cli::parse();

    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("cannot determine home directory; pass --workdir")?
            .join(".testground"),
    };
    let runner = LocalDockerRunner::new(workdir);

    match cli.command {
        Command::Healthcheck { fix } => {
            let report = runner.healthcheck(fix).await?;
            print_report(&report);
            if !report.all_ok() {
                std::process::exit(1);
            }
        }
        Command::Run {
            input,
            run_id,
            keep_containers,
            log_level,
            unstarted,
            background,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading composition {}", input.display()))?;
            let mut run_input: RunInput = serde_json::from_str(&raw)
                .with_context(|| format!("parsing composition {}", input.display()))?;

            if let Some(id) = run_id {
                run_input.run_id = id;
            }
            if run_input.run_id.is_empty() {
                run_input.run_id = uuid::Uuid::new_v4().simple().to_string();
            }

            // CLI flags override the composition's runner_config.
            if keep_containers {
                run_input.runner_config.keep_containers = Some(true);
            }
            if let Some(level) = log_level {
                run_input.runner_config.log_level = Some(level);
            }
            if unstarted {
                run_input.runner_config.unstarted = Some(true);
            }
            if background {
                run_input.runner_config.background = Some(true);
            }

            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, tearing down run");
                    signal_token.cancel();
                }
            });

            let output = runner
                .run(token, &run_input, Box::new(std::io::stdout()))
                .await?;
            tracing::info!(run_id = %output.run_id, "run finished");
            println!("run {} finished", output.run_id);
        }
        Command::Collect {
            plan,
            run_id,
            output,
        } => {
            let file = File::create(&output)
                .with_context(|| format!("creating archive {}", output.display()))?;
            runner.collect_outputs(&plan, &run_id, BufWriter::new(file))?;
            println!("outputs of run {run_id} written to {}", output.display());
        }
    }

    Ok(())
}

fn print_report(report: &HealthcheckReport) {
    println!("checks:");
    for item in &report.checks {
        let status = item.status.to_string();
        println!("  {:<20} {:<8} {}", item.name, status, item.message);
    }
    if !report.fixes.is_empty() {
        println!("fixes:");
        for item in &report.fixes {
            let status = item.status.to_string();
            println!("  {:<20} {:<8} {}", item.name, status, item.message);
        }
    }
}
