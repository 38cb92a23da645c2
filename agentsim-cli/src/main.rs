// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agentsim CLI
//!
//! Runs simulation batches against a webhook target agent and renders the
//! results in the supported export formats.

use agentsim_core::{EvaluationResultSet, SimulationConfig};
use agentsim_engine::{
    parse_evaluation_json, AgentFactory, ExportFormat, Exporter, InMemoryKnowledgeBase,
    OpenAIClient, PersonaGenerator, RetryingAgent, SimulationBatchRunner, TargetAgent,
    WebhookAgent,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "agentsim")]
#[command(about = "Agentsim - simulated conversations for agent evaluation", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation batch
    Run {
        /// Path to batch configuration file (TOML)
        #[arg(short, long, env = "AGENTSIM_CONFIG")]
        config: Option<PathBuf>,

        /// Directory receiving the export files
        #[arg(short, long, default_value = "./agentsim-results")]
        output: PathBuf,

        /// Export format; repeat for several
        #[arg(short, long = "format", default_value = "evaluation")]
        formats: Vec<ExportFormat>,

        /// Number of simulations (overrides config file)
        #[arg(long)]
        num_simulations: Option<usize>,

        /// Maximum turns per conversation (overrides config file)
        #[arg(long)]
        max_turns: Option<usize>,

        /// Conversations in flight at once (overrides config file)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit with an error when the pass rate is below this fraction
        #[arg(long)]
        min_pass_rate: Option<f64>,
    },

    /// Check a configuration without dispatching anything
    Validate {
        /// Path to batch configuration file (TOML)
        #[arg(short, long, env = "AGENTSIM_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Re-render a saved evaluation JSON
    Export {
        /// Evaluation JSON written by `run`
        input: PathBuf,

        /// Directory receiving the export files
        #[arg(short, long, default_value = "./agentsim-results")]
        output: PathBuf,

        /// Export format; repeat for several
        #[arg(short, long = "format", required = true)]
        formats: Vec<ExportFormat>,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "agentsim_engine=debug,agentsim_core=debug,agentsim=debug,info"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Factory building a fresh webhook agent per simulation; instances share
/// one connection pool
fn webhook_factory(config: &SimulationConfig) -> Result<AgentFactory> {
    let Some(target) = &config.target else {
        bail!("no [target] configured; the batch needs a webhook agent to talk to");
    };
    let template = WebhookAgent::from_config(target)
        .context("invalid [target]")?
        .with_timeout(config.agent_timeout());

    Ok(Arc::new(move || -> Arc<dyn TargetAgent> {
        Arc::new(RetryingAgent::new(Arc::new(template.clone())))
    }))
}

fn runner(config: SimulationConfig) -> Result<SimulationBatchRunner> {
    let factory = webhook_factory(&config)?;
    let llm = config.llm.clone();
    let mut runner = SimulationBatchRunner::new(config, factory);

    if let Some(llm) = llm {
        let Some(api_key) = llm.api_key else {
            bail!("[llm] is configured but no api_key is set (or OPENAI_API_KEY)");
        };
        let mut client = OpenAIClient::new(api_key, llm.model);
        if let Some(base_url) = llm.base_url {
            client = client.with_base_url(base_url);
        }
        runner = runner.with_llm(Arc::new(client), llm.verify_claims);
    }
    Ok(runner)
}

fn write_exports(
    results: &EvaluationResultSet,
    formats: &[ExportFormat],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let exporter = Exporter::new().pretty();
    let mut paths = Vec::with_capacity(formats.len());
    for format in formats {
        let path = exporter
            .write(results, *format, dir)
            .with_context(|| format!("failed to export {}", format.name()))?;
        paths.push(path);
    }
    Ok(paths)
}

fn print_summary(results: &EvaluationResultSet, paths: &[PathBuf], json: bool) -> Result<()> {
    let s = &results.summary;
    if json {
        let out = serde_json::json!({
            "batch_id": results.batch_id,
            "cancelled": results.cancelled,
            "summary": s,
            "files": paths,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Batch {}", results.batch_id);
    println!("=====================");
    println!(
        "  Runs: {} of {} requested{}",
        s.total_runs,
        results.requested,
        if results.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "  Completed: {}  Failed: {}  Timed out: {}  Cancelled: {}",
        s.completed, s.failed, s.timed_out, s.cancelled
    );
    println!("  Pass rate: {:.1}%", s.pass_rate * 100.0);
    println!("  Turns: {} ({} degraded)", s.total_turns, s.degraded_turns);
    println!("  Claims flagged: {} of {}", s.flagged_claims, s.total_claims);
    println!("  Judge issues: {}", s.issue_count);
    if !s.violation_counts.is_empty() {
        println!();
        println!("Violations:");
        for (rule, count) in &s.violation_counts {
            println!("  {}: {}", rule, count);
        }
    }
    if !paths.is_empty() {
        println!();
        for path in paths {
            println!("✓ Wrote {}", path.display());
        }
    }
    Ok(())
}

async fn run_batch(
    config_path: Option<PathBuf>,
    output: PathBuf,
    formats: Vec<ExportFormat>,
    overrides: (Option<usize>, Option<usize>, Option<usize>),
    min_pass_rate: Option<f64>,
    json: bool,
) -> Result<()> {
    let mut config = SimulationConfig::load(config_path)?;
    let (num_simulations, max_turns, concurrency) = overrides;
    if let Some(n) = num_simulations {
        config.num_simulations = n;
    }
    if let Some(n) = max_turns {
        config.max_turns = n;
    }
    if let Some(n) = concurrency {
        config.max_concurrency = n;
    }

    let runner = runner(config)?;
    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling batch");
            cancel.cancel();
        }
    });

    let results = runner.run().await?;
    let paths = write_exports(&results, &formats, &output)?;
    print_summary(&results, &paths, json)?;

    if let Some(min) = min_pass_rate {
        if results.summary.pass_rate < min {
            bail!(
                "pass rate {:.3} is below the required {:.3}",
                results.summary.pass_rate,
                min
            );
        }
    }
    Ok(())
}

fn validate(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = SimulationConfig::load(config_path)?;
    config.validate()?;
    let rules = config.parsed_rules()?;
    let generator =
        PersonaGenerator::from_template(&config.persona.template, config.persona.context.clone())?;
    let passages = match &config.knowledge_base {
        Some(kb) => Some(InMemoryKnowledgeBase::from_config(kb)?.passage_count()),
        None => None,
    };
    if let Some(target) = &config.target {
        WebhookAgent::from_config(target).context("invalid [target]")?;
    }

    if json {
        let out = serde_json::json!({
            "valid": true,
            "personas": generator.available(),
            "rules": rules,
            "test_cases": config.effective_test_cases().len(),
            "knowledge_base_passages": passages,
            "target": config.target.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("✓ Configuration is valid");
        println!("  Personas available: {}", generator.available());
        println!("  Rules: {}", rules.len());
        for rule in &rules {
            println!("    {} [{:?}] {}", rule.id, rule.scope, rule.text);
        }
        println!("  Test cases: {}", config.effective_test_cases().len());
        if let Some(passages) = passages {
            println!("  Knowledge base passages: {}", passages);
        }
        if config.target.is_none() {
            println!("  ! No [target] configured; `run` will refuse this config");
        }
    }
    Ok(())
}

fn export(input: PathBuf, output: PathBuf, formats: Vec<ExportFormat>, json: bool) -> Result<()> {
    let body = std::fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let results = parse_evaluation_json(&body)
        .with_context(|| format!("{} is not a complete evaluation export", input.display()))?;
    let paths = write_exports(&results, &formats, &output)?;
    print_summary(&results, &paths, json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            output,
            formats,
            num_simulations,
            max_turns,
            concurrency,
            min_pass_rate,
        } => {
            run_batch(
                config,
                output,
                formats,
                (num_simulations, max_turns, concurrency),
                min_pass_rate,
                cli.json,
            )
            .await
        }
        Commands::Validate { config } => validate(config, cli.json),
        Commands::Export {
            input,
            output,
            formats,
        } => export(input, output, formats, cli.json),
    }
}
