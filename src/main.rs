use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use detsql::analyzer::{apply_rules, Rules};
use detsql::config::EngineConfig;
use detsql::datastore::Value;
use detsql::engine::{ExecutionOptions, ExtensionRegistry, Procedure};

/// Deterministic SQL analysis and atomic procedure execution
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite a statement so it returns the same rows in the same order on every replica
    Analyze {
        /// Engine config whose tables are the schema
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Comma-separated rules, or "all"
        #[arg(long, default_value = "all")]
        rules: Rules,

        sql: String,
    },
    /// Execute a procedure atomically
    Exec {
        /// Engine config (defaults to the user config directory)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "")]
        caller: String,

        #[arg(long, default_value = "")]
        dataset: String,

        /// Reject statements that write
        #[arg(long)]
        read_only: bool,

        procedure: String,

        /// Arguments; JSON literals bind as typed values, anything else as text
        args: Vec<String>,
    },
    /// List the tables of an engine config
    Tables {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List the procedures of an engine config
    Procedures {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::Text(arg.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Analyze { schema, rules, sql } => {
            let tables = match schema {
                Some(path) => EngineConfig::load(Some(path.as_path()))?.tables,
                None => vec![],
            };
            let analyzed = apply_rules(&sql, rules, &tables).context("analysis failed")?;
            print_json(&analyzed)?;
        }
        Command::Exec {
            config,
            caller,
            dataset,
            read_only,
            procedure,
            args,
        } => {
            let config = EngineConfig::load(config.as_deref())?;
            let engine = config.build(ExtensionRegistry::new())?;
            let result = engine
                .execute_procedure(
                    &procedure,
                    args.iter().map(|a| parse_arg(a)).collect(),
                    ExecutionOptions {
                        caller,
                        dataset,
                        read_only,
                    },
                )
                .with_context(|| format!("procedure {} failed", procedure));
            let closed = engine.close();
            print_json(&result?)?;
            closed?;
        }
        Command::Tables { config } => {
            let config = EngineConfig::load(config.as_deref())?;
            print_json(&config.tables)?;
        }
        Command::Procedures { config } => {
            let config = EngineConfig::load(config.as_deref())?;
            let engine = config.build(ExtensionRegistry::new())?;
            let procedures = engine.list_procedures();
            let procedures: Vec<&Procedure> = procedures.iter().map(AsRef::as_ref).collect();
            print_json(&procedures)?;
        }
    }

    Ok(())
}
