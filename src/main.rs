use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use volley::{
    HttpTransport, JsonReporter, Reporter, Runner, StdoutReporter,
    config::{Overrides, RunConfig},
    scripts,
};

/// Exit code of a run whose thresholds failed.
const THRESHOLDS_FAILED: u8 = 99;
/// Exit code of a configuration or runtime error.
const RUN_FAILED: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "volley", version, about = "Scenario-driven HTTP load generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the scenarios of a YAML/JSON config and judges its thresholds.
    Run(RunArgs),
    /// Lists the built-in iteration functions and the metrics they write.
    Scripts,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Path to the run configuration.
    config: PathBuf,

    /// Cuts every scenario off after this duration (e.g. `30s`).
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Target base URL, overriding the config.
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Writes the summary as JSON to this file.
    #[arg(long)]
    summary_export: Option<PathBuf>,

    /// Seeds every VU's random generator.
    #[arg(long)]
    seed: Option<u64>,

    /// Scheduler tick.
    #[arg(long, value_parser = humantime::parse_duration)]
    tick: Option<Duration>,

    /// Per-request timeout.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    timeout: Duration,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Scripts => {
            list_scripts();
            Ok(true)
        }
    };

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
    }
    ExitCode::from(exit_status(&result))
}

/// Maps a run's verdict, or its error, to the process exit code.
fn exit_status(result: &Result<bool>) -> u8 {
    match result {
        Ok(true) => 0,
        Ok(false) => THRESHOLDS_FAILED,
        Err(_) => RUN_FAILED,
    }
}

/// Runs a config and reports whether every threshold passed.
async fn run(args: RunArgs) -> Result<bool> {
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunConfig::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;

    let overrides = Overrides {
        base_url: args.base_url,
        seed: args.seed,
        duration: args.duration,
        tick: args.tick,
    };

    let plan = config
        .into_plan(&scripts::builtin(), &overrides)
        .context("invalid run configuration")?;
    let transport = HttpTransport::new(args.timeout).context("building the HTTP client")?;
    let runner = Runner::new(plan, Arc::new(transport))?;

    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping scenarios...");
            stop.stop();
        }
    });

    let outcome = runner.run().await?;

    StdoutReporter.report(&outcome.summary).await?;
    if let Some(path) = args.summary_export {
        JsonReporter::new(path.clone())
            .report(&outcome.summary)
            .await
            .with_context(|| format!("writing summary to {}", path.display()))?;
    }

    Ok(outcome.verdict.passed)
}

fn list_scripts() {
    let scripts = scripts::builtin();
    println!("Iteration functions:");
    for name in scripts.names() {
        println!("  {name}");
    }
    println!("Custom metrics:");
    for (name, kind) in scripts.declared_metrics() {
        println!("  {name} ({kind})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_maps_to_exit_status() {
        assert_eq!(exit_status(&Ok(true)), 0);
        assert_eq!(exit_status(&Ok(false)), 99);
        assert_eq!(exit_status(&Err(anyhow::anyhow!("config not found"))), 1);
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "volley",
            "run",
            "demos/shop.json",
            "--duration",
            "30s",
            "--seed",
            "7",
            "-v",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(args.duration, Some(Duration::from_secs(30)));
        assert_eq!(args.seed, Some(7));
        assert_eq!(args.timeout, Duration::from_secs(60));
        assert!(args.verbose);
    }
}
