//! CLI for per-repository guidance tuning experiments.
//!
//! Subcommands:
//! - `tune` — hill-climb the guidance for one repository
//! - `experiment` — run the full two-phase experiment from a JSON config
//! - `reap` — stop orphaned task containers left by crashed runs
//!
//! The LLM endpoint comes from `OPENAI_BASE_URL` / `OPENAI_API_KEY`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tuning::experiment::{CommandHarness, Experiment, ExperimentConfig};
use tuning::llm::LlmClient;
use tuning::scoring::HarnessEvaluator;
use tuning::tuner::{production_tuner, TuningConfig};
use tuning::{AgentRunner, RunnerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Per-repo guidance tuning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tune the guidance block for a single repository.
    Tune {
        /// Repository slug, e.g. `astropy/astropy`.
        #[arg(long)]
        repo: String,

        /// Commit the tasks are pinned to.
        #[arg(long)]
        commit: String,

        /// Per-repo tasks file (JSONL or JSON).
        #[arg(long)]
        tasks_file: PathBuf,

        /// Model identifier for the agent and the proposer.
        #[arg(long)]
        model: String,

        /// Hill-climbing iterations T.
        #[arg(long, default_value_t = 10)]
        iterations: u32,

        /// Candidates per iteration K.
        #[arg(long, default_value_t = 6)]
        candidates_per_iter: usize,

        /// Tasks per scoring pass N.
        #[arg(long, default_value_t = 20)]
        tasks_per_score: usize,

        /// Guidance character budget.
        #[arg(long, default_value_t = 3200)]
        char_budget: usize,

        /// Per-task agent timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout_s: u64,

        /// Agent step limit.
        #[arg(long, default_value_t = 30)]
        step_limit: u32,

        /// Output directory for all tuning artifacts.
        #[arg(long)]
        output_dir: PathBuf,

        /// Agent executable.
        #[arg(long, default_value = "mini-swe-agent")]
        agent_command: String,
    },

    /// Run the full tuning + evaluation experiment.
    Experiment {
        /// JSON experiment config.
        #[arg(long)]
        config: PathBuf,

        /// Skip inference; produce placeholder guidance and empty patches.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Agent executable.
        #[arg(long, default_value = "mini-swe-agent")]
        agent_command: String,

        /// Directory where the harness writes per-run results.
        #[arg(long, default_value = "results")]
        results_root: PathBuf,
    },

    /// Stop orphaned task containers left behind by crashed runs.
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tuning=info".parse().expect("valid directive"))
                .add_directive("repotune=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tune {
            repo,
            commit,
            tasks_file,
            model,
            iterations,
            candidates_per_iter,
            tasks_per_score,
            char_budget,
            timeout_s,
            step_limit,
            output_dir,
            agent_command,
        } => {
            let config = TuningConfig {
                repo,
                commit,
                tasks_file,
                model: model.clone(),
                iterations,
                candidates_per_iter,
                tasks_per_score,
                char_budget,
                timeout_s,
                step_limit,
                output_dir: output_dir.clone(),
            };

            let llm = Arc::new(LlmClient::from_env().context("building LLM client")?);
            let mut runner_config = RunnerConfig::new(model);
            runner_config.agent_command = agent_command;
            runner_config.timeout = Duration::from_secs(timeout_s);
            runner_config.step_limit = step_limit;
            let driver = Arc::new(AgentRunner::new(runner_config));
            let evaluator = Arc::new(HarnessEvaluator::default());

            let cache_root = output_dir.join("cache");
            tracing::info!(output_dir = %output_dir.display(), "starting tuning run");
            let tuner = production_tuner(config, llm, driver, evaluator, &cache_root)
                .context("assembling tuner")?;
            let best = tuner.run().await.context("tuning run failed")?;

            println!(
                "best guidance: v{} ({} lines, {} chars)",
                best.version,
                best.lines.len(),
                best.char_count()
            );
        }

        Commands::Experiment {
            config,
            dry_run,
            agent_command,
            results_root,
        } => {
            let config = ExperimentConfig::load(&config).context("loading experiment config")?;

            let llm = Arc::new(LlmClient::from_env().context("building LLM client")?);
            let mut runner_config = RunnerConfig::new(config.model.clone());
            runner_config.agent_command = agent_command;
            runner_config.timeout = Duration::from_secs(config.timeout_s);
            runner_config.step_limit = config.step_limit;
            runner_config.dry_run = dry_run;
            let driver = Arc::new(AgentRunner::new(runner_config));

            let evaluator = Arc::new(HarnessEvaluator {
                dataset: config.eval_dataset.clone(),
                ..HarnessEvaluator::default()
            });
            let harness = Arc::new(CommandHarness::new(
                config.harness_command.clone(),
                results_root,
                config.output_dir.join("logs"),
            ));

            let summary = Experiment::new(config, llm, driver, evaluator, harness)
                .dry_run(dry_run)
                .run()
                .await
                .context("experiment failed")?;

            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Reap => {
            let reaped = tuning::runner::reap_orphans()
                .await
                .context("reaping containers")?;
            println!("removed {reaped} orphaned containers");
        }
    }

    Ok(())
}
