//! Mindstack - Layered Belief Model Engine
//!
//! Command-line front end over the owner-level pipeline. Every command
//! prints its result as pretty JSON on stdout; logs go to stderr.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mindstack::{
    config::MindstackConfig,
    model::{today, Direction, OutcomeResult, Signal},
    query::{ExploreDepth, OutputType, RecallOptions},
    Mindstack,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mindstack")]
#[command(version)]
#[command(about = "Layered belief model engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MINDSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Owner whose model is read or written
    #[arg(short, long, env = "MINDSTACK_OWNER", default_value = "default")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append signals from a JSONL file (one signal per line)
    Ingest {
        /// JSONL file of signals
        file: PathBuf,
    },

    /// Mark a signal inactive so it stops feeding the engines
    Deactivate {
        /// Signal id
        signal_id: String,

        /// Why the signal is withdrawn
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// Show signal statistics and layer counts
    Stats,

    /// Detect and reinforce convictions
    Detect,

    /// Merge near-duplicate convictions
    Dedupe {
        /// Report merge groups without committing
        #[arg(long)]
        dry_run: bool,
    },

    /// Scan conviction pairs for contradictions
    Contradictions {
        /// Re-check pairs already examined
        #[arg(long)]
        force: bool,
    },

    /// Extract reasoning traces from signal episodes
    Extract,

    /// Rebuild context frames
    Frames,

    /// Rebuild the identity layer
    Identity,

    /// Build the vector index for the current generation
    Index,

    /// Answer a question from the belief model
    Query {
        /// Question text
        question: String,

        /// Who is asking
        #[arg(long)]
        caller: Option<String>,
    },

    /// Generate content in the owner's voice
    Generate {
        /// Task description
        task: String,

        /// Output type (article, post, decision, script)
        #[arg(short = 't', long = "type", default_value = "article")]
        output_type: OutputType,

        /// Additional instructions appended to the prompt
        #[arg(long)]
        extra: Option<String>,

        /// Who is asking
        #[arg(long)]
        caller: Option<String>,
    },

    /// Classify the intent and answer or generate
    Ask {
        /// Free-form request
        text: String,

        /// Who is asking
        #[arg(long)]
        caller: Option<String>,
    },

    /// Find raw signals nearest a text
    Recall {
        /// Text to match
        text: String,

        /// Only signals from this source context
        #[arg(long)]
        context: Option<String>,

        /// Only input or output signals
        #[arg(long)]
        direction: Option<String>,

        /// Earliest signal date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Latest signal date (YYYY-MM-DD)
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Maximum number of signals
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show convictions, traces, frames and tensions around a topic
    Explore {
        /// Topic text
        topic: String,

        /// Convictions only
        #[arg(long)]
        lite: bool,
    },

    /// Show how the convictions of a topic changed over time
    Evolution {
        /// Topic text
        topic: String,
    },

    /// Report say-do gaps, one-sided topics and thinking inertia
    Blindspots,

    /// Show what two topics share
    Connections {
        /// First topic
        topic_a: String,

        /// Second topic
        topic_b: String,
    },

    /// Walk through a hypothetical scenario in the owner's voice
    Simulate {
        /// Scenario description
        scenario: String,

        /// Extra situational context
        #[arg(long)]
        context: Option<String>,
    },

    /// Run the daily batch (detect, extract, contradictions, follow-ups, digest)
    Daily,

    /// Run the rebuild batch (frames, identity, index)
    Rebuild,

    /// List decisions awaiting an outcome
    Followups,

    /// Record the outcome of a decision
    Outcome {
        /// Reasoning trace id
        trace_id: String,

        /// Result (positive, negative, mixed, unknown)
        result: String,

        /// Free-form note
        #[arg(long)]
        note: Option<String>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mindstack={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => MindstackConfig::from_file(path)?,
        None => MindstackConfig::default(),
    };

    if let Commands::Config { default } = cli.command {
        return show_config(if default { None } else { Some(&config) });
    }

    let app = Mindstack::from_config(config)?;
    let owner = cli.owner.as_str();
    let date = today();

    match cli.command {
        Commands::Ingest { file } => {
            let signals = read_signals(&file)?;
            print_json(&app.ingest(owner, signals).await?)?;
        }
        Commands::Deactivate { signal_id, reason } => {
            app.deactivate_signal(owner, &signal_id, &reason).await?;
            print_json(&serde_json::json!({ "deactivated": signal_id, "reason": reason }))?;
        }
        Commands::Stats => print_json(&app.stats(owner).await?)?,
        Commands::Detect => print_json(&app.detect(owner, date).await?)?,
        Commands::Dedupe { dry_run } => print_json(&app.dedupe(owner, dry_run).await?)?,
        Commands::Contradictions { force } => {
            print_json(&app.contradictions(owner, force, date).await?)?
        }
        Commands::Extract => print_json(&app.extract(owner).await?)?,
        Commands::Frames => print_json(&app.rebuild_frames(owner, date).await?)?,
        Commands::Identity => print_json(&app.rebuild_identity(owner).await?)?,
        Commands::Index => print_json(&app.build_index(owner).await?)?,
        Commands::Query { question, caller } => {
            print_json(&app.query(owner, &question, caller.as_deref()).await?)?
        }
        Commands::Generate {
            task,
            output_type,
            extra,
            caller,
        } => {
            let content = app
                .generate(owner, &task, output_type, extra.as_deref(), caller.as_deref())
                .await?;
            print_json(&content)?;
        }
        Commands::Ask { text, caller } => {
            print_json(&app.ask(owner, &text, caller.as_deref()).await?)?
        }
        Commands::Recall {
            text,
            context,
            direction,
            since,
            until,
            limit,
        } => {
            let options = RecallOptions {
                context,
                direction: direction.as_deref().map(parse_direction).transpose()?,
                since,
                until,
                limit,
            };
            print_json(&app.recall(owner, &text, &options).await?)?;
        }
        Commands::Explore { topic, lite } => {
            let depth = if lite { ExploreDepth::Lite } else { ExploreDepth::Full };
            print_json(&app.explore(owner, &topic, depth).await?)?;
        }
        Commands::Evolution { topic } => print_json(&app.evolution(owner, &topic).await?)?,
        Commands::Blindspots => print_json(&app.blindspots(owner).await?)?,
        Commands::Connections { topic_a, topic_b } => {
            print_json(&app.connections(owner, &topic_a, &topic_b).await?)?
        }
        Commands::Simulate { scenario, context } => {
            print_json(&app.simulate(owner, &scenario, context.as_deref()).await?)?
        }
        Commands::Daily => print_json(&app.run_daily(owner, date).await?)?,
        Commands::Rebuild => print_json(&app.rebuild(owner, date).await?)?,
        Commands::Followups => print_json(&app.followups(owner, date).await?)?,
        Commands::Outcome {
            trace_id,
            result,
            note,
        } => {
            let result = OutcomeResult::parse(&result)
                .with_context(|| format!("Unknown outcome result: {}", result))?;
            print_json(&app.record_outcome(owner, &trace_id, result, note, date).await?)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn read_signals(path: &Path) -> Result<Vec<Signal>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid signal", path.display(), n + 1))
        })
        .collect()
}

fn parse_direction(value: &str) -> Result<Direction> {
    match value.to_lowercase().as_str() {
        "input" => Ok(Direction::Input),
        "output" => Ok(Direction::Output),
        other => bail!("Unknown direction: {} (expected input or output)", other),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn show_config(config: Option<&MindstackConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
