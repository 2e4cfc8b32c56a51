//! stagepipe CLI
//!
//! Runs a small demonstration pipeline and inspects stage policies.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

use stagepipe::{Pipeline, PipelineOptions, StageDescriptor, StagePlan, StagePolicy};

#[derive(Parser)]
#[command(name = "stagepipe")]
#[command(about = "Batched multi-stage parallel pipeline", long_about = None)]
struct Cli {
    /// Path to a JSON pipeline options file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Double 1..=N on the shared pool, then stringify on a dedicated worker
    Run {
        /// Number of input items
        #[arg(short = 'n', long, default_value_t = 10)]
        count: i64,

        /// Override the shared pool size
        #[arg(long)]
        pool_size: Option<usize>,

        /// Stop after this many outputs and close with work still in flight
        #[arg(long)]
        take: Option<usize>,

        /// How long close waits for in-flight work, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Classify a stage policy given as JSON
    Classify {
        /// e.g. '{"statefulness": 3, "feed_batch_size": 2}'
        policy: String,
    },
}

fn main() -> Result<()> {
    stagepipe::init_logging();

    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => PipelineOptions::from_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => PipelineOptions::default(),
    };

    match cli.command {
        Commands::Run {
            count,
            pool_size,
            take,
            timeout_ms,
        } => {
            if let Some(size) = pool_size {
                options.pool_size = Some(size);
            }
            run_command(options, count, take, timeout_ms.map(Duration::from_millis))
        }
        Commands::Classify { policy } => classify_command(&policy),
    }
}

fn demo_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new("double", |v| {
            let n = v
                .as_i64()
                .with_context(|| format!("expected an integer, got {}", v))?;
            Ok(json!(n * 2))
        })
        .stateless()
        .feed_batch_size(2),
        StageDescriptor::new("stringify", |v| Ok(json!(v.to_string()))),
    ]
}

/// Result of one demo run.
struct DemoRun {
    outputs: Vec<Value>,
    clean: bool,
    metrics: stagepipe::PipelineMetrics,
}

fn run_demo(
    options: PipelineOptions,
    count: i64,
    take: Option<usize>,
    timeout: Option<Duration>,
) -> Result<DemoRun> {
    let mut pipeline = Pipeline::with_options(demo_stages(), options)?;
    tracing::info!(
        pool_size = pipeline.pool_size(),
        dedicated_workers = pipeline.dedicated_worker_count(),
        "Running demo pipeline over 1..={}",
        count
    );

    let limit = take.unwrap_or(usize::MAX);
    let outputs = pipeline
        .apply((1..=count).map(|v| json!(v)))?
        .take(limit)
        .collect::<Result<Vec<_>, _>>()?;

    // With --take, items past the limit may still be in flight here.
    let clean = pipeline.close(timeout);
    if !clean {
        tracing::warn!("Pipeline did not shut down before the timeout");
    }

    Ok(DemoRun {
        outputs,
        clean,
        metrics: pipeline.metrics(),
    })
}

fn run_command(
    options: PipelineOptions,
    count: i64,
    take: Option<usize>,
    timeout: Option<Duration>,
) -> Result<()> {
    let run = run_demo(options, count, take, timeout)?;
    for output in &run.outputs {
        println!("{}", output);
    }
    println!("{}", serde_json::to_string_pretty(&run.metrics)?);
    if !run.clean {
        anyhow::bail!("pipeline did not shut down cleanly");
    }
    Ok(())
}

fn classify_command(policy: &str) -> Result<()> {
    let policy = StagePolicy::from_json(policy)?;
    let plan = StagePlan::from_policy(&policy)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["stagepipe", "run", "--count", "5"]).unwrap();
        match cli.command {
            Commands::Run {
                count, pool_size, ..
            } => {
                assert_eq!(count, 5);
                assert!(pool_size.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "stagepipe",
            "run",
            "--pool-size",
            "3",
            "-c",
            "pipeline.json",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_take_and_timeout() {
        let cli = Cli::try_parse_from([
            "stagepipe",
            "run",
            "-n",
            "100",
            "--take",
            "2",
            "--timeout-ms",
            "500",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                take, timeout_ms, ..
            } => {
                assert_eq!(take, Some(2));
                assert_eq!(timeout_ms, Some(500));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_demo_stops_early() {
        let run = run_demo(
            PipelineOptions::default().with_pool_size(2),
            1000,
            Some(2),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(run.outputs, vec![json!("2"), json!("4")]);
        assert!(run.clean);
        assert!(run.metrics.stages[1].items_out >= 2);
    }

    #[test]
    fn test_cli_parse_classify() {
        let cli = Cli::try_parse_from(["stagepipe", "classify", r#"{"statefulness": 3}"#]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["stagepipe"]).is_err());
    }

    #[test]
    fn test_demo_stages_output() {
        let mut pipeline = Pipeline::with_options(
            demo_stages(),
            PipelineOptions::default().with_pool_size(2),
        )
        .unwrap();
        let out: Vec<_> = pipeline
            .apply((1..=3).map(|v| json!(v)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(out, vec![json!("2"), json!("4"), json!("6")]);
    }
}
