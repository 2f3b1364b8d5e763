use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::{Format, Toml};
use figment::Figment;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};
use tumbler_sequence::{window_for, MemoryClient, SequenceConfig, SequenceDefinition};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a sequence definition over a JSON array of events
    Run {
        /// JSON file holding an array of event documents
        #[arg(long)]
        events: PathBuf,

        /// TOML file describing the sequence stages
        #[arg(long)]
        definition: PathBuf,

        /// Configuration file (toml, yaml or json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Index name recorded on every event
        #[arg(long, default_value = "events")]
        index: String,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            events,
            definition,
            config,
            index,
        } => run(&events, &definition, config.as_deref(), &index).await,
    };

    if let Err(e) = result {
        error!(message = "tumbler failed", error = ?e);
        std::process::exit(1);
    }
}

// stdout carries the payload, so logs go to stderr
fn init_logging() {
    let stderr_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_line_number(false)
        .with_file(false)
        .with_span_events(FmtSpan::NEW)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let subscriber = Registry::default().with(stderr_log);

    tracing::subscriber::set_global_default(subscriber).expect("Unable to set global subscriber");

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));
}

async fn run(events: &Path, definition: &Path, config: Option<&Path>, index: &str) -> Result<()> {
    let config = SequenceConfig::load(config)?;
    let definition = load_definition(definition)?;
    let events = load_events(events)?;

    info!(
        message = "loaded events",
        events = events.len(),
        stages = definition.stages.len(),
        tail = definition.tail
    );

    let client = MemoryClient::from_sources(index, events);
    let mut window = window_for(client, &definition, &config)?;
    let payload = window.execute().await?;

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn load_definition(path: &Path) -> Result<SequenceDefinition> {
    if !path.exists() {
        bail!("definition file {} does not exist", path.display());
    }
    parse_definition(Figment::from(Toml::file(path)))
        .with_context(|| format!("failed to read definition from {}", path.display()))
}

fn parse_definition(figment: Figment) -> Result<SequenceDefinition> {
    Ok(figment.extract()?)
}

fn load_events(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read events from {}", path.display()))?;
    match serde_json::from_str(&contents)? {
        Value::Array(events) => Ok(events),
        _ => Err(anyhow!("{} must hold a JSON array of events", path.display())),
    }
}
