use anyhow::Result;
use clap::{Parser, Subcommand};
use knot_core::{EngineConfig, NodeInputs, Registry, RunOptions};
use serde_json::{json, Value};
use std::path::PathBuf;

mod pipeline;

#[derive(Parser, Debug)]
#[command(name = "knot")]
#[command(about = "Knot - run the order pricing DAG", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "knot.toml", env = "KNOT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered nodes and the terminal ones
    Nodes,

    /// Print the execution order of a target's closure
    Order { target: String },

    /// Print node -> dependencies for a target, or for the whole registry
    Graph { target: Option<String> },

    /// Execute a target, or every terminal node when none is given
    Run {
        target: Option<String>,

        /// Dispatch independent nodes concurrently
        #[arg(long)]
        concurrent: bool,

        /// Neither read nor write node caches
        #[arg(long)]
        no_cache: bool,

        /// Run input as name=value (repeatable)
        #[arg(short, long = "input", value_parser = pipeline::parse_input)]
        inputs: Vec<(String, Value)>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = EngineConfig::load(&args.config)?;

    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Using configuration from {}", args.config.display());

    let registry = pipeline::build_registry(config)?;
    let output = dispatch(&registry, args.command).await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn dispatch(registry: &Registry, command: Command) -> Result<Value> {
    let output = match command {
        Command::Nodes => {
            let terminals: Vec<String> = registry
                .terminal_nodes()
                .iter()
                .map(|n| n.name().to_string())
                .collect();
            json!({
                "registry": registry.name(),
                "nodes": registry.names(),
                "terminal": terminals,
            })
        }
        Command::Order { target } => json!(registry.topological_order(&target)?),
        Command::Graph { target: Some(target) } => json!(registry.graph_dict(&target)?),
        Command::Graph { target: None } => json!(registry.full_graph_dict()?),
        Command::Run {
            target,
            concurrent,
            no_cache,
            inputs,
        } => {
            let inputs: NodeInputs = inputs.into_iter().collect();
            let mut options = registry.default_options();
            if no_cache {
                options = RunOptions::without_cache();
            }

            tracing::info!(
                "Running {} ({} mode, cache {})",
                target.as_deref().unwrap_or("all terminal nodes"),
                if concurrent { "concurrent" } else { "sequential" },
                if options.enable_cache { "on" } else { "off" }
            );

            match (target, concurrent) {
                (Some(target), false) => registry.execute_one_with(&target, inputs, options)?,
                (Some(target), true) => {
                    registry
                        .execute_one_concurrent_with(&target, inputs, options)
                        .await?
                }
                (None, false) => json!(registry.execute_all_with(inputs, options)?),
                (None, true) => json!(registry.execute_all_concurrent_with(inputs, options).await?),
            }
        }
    };
    Ok(output)
}
