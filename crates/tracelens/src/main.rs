//! Tracelens - root-cause analysis of slow and failed traces
//!
//! Rebuilds the service call tree of one trace id from an APM backend and
//! points at the hop most likely responsible.

mod dump;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dump::TraceDump;
use std::path::{Path, PathBuf};
use tracelens_adapter::HttpAdapter;
use tracelens_core::{
    AnalyzerOptions, ApmType, ConfigLoader, MutationMode, TraceAdapter, TraceAnalyzer,
    TracelensConfig,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tracelens")]
#[command(version)]
#[command(about = "Root-cause analysis of slow and failed traces", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TRACELENS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the node responsible for a slow trace
    Slow {
        /// Trace dump (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Fetch spans from the configured adapter instead of the dump
        #[arg(long)]
        remote: bool,

        /// Ranking mode (single, maxService, top3Service)
        #[arg(long)]
        mode: Option<MutationMode>,

        /// Minimum share of the entry duration, in percent
        #[arg(long)]
        ratio: Option<u32>,
    },

    /// Find the deepest traced error of a failed trace
    Error {
        /// Trace dump (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Fetch spans from the configured adapter instead of the dump
        #[arg(long)]
        remote: bool,
    },

    /// Derive a span id from a vendor-native identifier
    SpanId {
        /// Vendor (skywalking, tingyun)
        vendor: String,

        /// Segment id or GUID
        id: String,

        /// Span sequence
        #[arg(default_value = "0")]
        seq: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.log.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Slow {
            input,
            remote,
            mode,
            ratio,
        } => {
            let mut options = config.analyzer.to_options()?;
            if let Some(mode) = mode {
                options.mode = mode;
            }
            if let Some(ratio) = ratio {
                options.mutated_ratio = ratio.min(100);
            }
            slow_command(&config, options, &input, remote).await
        }
        Commands::Error { input, remote } => {
            let options = config.analyzer.to_options()?;
            error_command(&config, options, &input, remote).await
        }
        Commands::SpanId { vendor, id, seq } => span_id_command(&vendor, &id, seq),
    }
}

fn load_config(cli_path: Option<PathBuf>) -> TracelensConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            TracelensConfig::default()
        }
    }
}

/// Analyzer over the dump, or over the adapter service when `remote` is set
fn build_analyzer(
    config: &TracelensConfig,
    options: AnalyzerOptions,
    dump: TraceDump,
    remote: bool,
) -> anyhow::Result<TraceAnalyzer> {
    let adapter: Box<dyn TraceAdapter> = if remote {
        info!(address = %config.adapter.address, "Using remote adapter");
        Box::new(HttpAdapter::new(
            &config.adapter.address,
            config.adapter.timeout(),
        )?)
    } else {
        Box::new(dump.into_adapter())
    };
    Ok(TraceAnalyzer::new(adapter, options))
}

async fn slow_command(
    config: &TracelensConfig,
    options: AnalyzerOptions,
    input: &Path,
    remote: bool,
) -> anyhow::Result<()> {
    let dump = TraceDump::load(input)
        .with_context(|| format!("failed to read trace dump {}", input.display()))?;
    let trace_id = dump.trace_id.clone();
    let records = dump.sampled_traces();

    let analyzer = build_analyzer(config, options, dump, remote)?;
    let analysis = analyzer
        .analyze_slow(&trace_id, &records)
        .await
        .with_context(|| format!("slow analysis of trace {} failed", trace_id))?;

    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

async fn error_command(
    config: &TracelensConfig,
    options: AnalyzerOptions,
    input: &Path,
    remote: bool,
) -> anyhow::Result<()> {
    let dump = TraceDump::load(input)
        .with_context(|| format!("failed to read trace dump {}", input.display()))?;
    let trace_id = dump.trace_id.clone();
    let records = dump.sampled_traces();

    let analyzer = build_analyzer(config, options, dump, remote)?;
    let analysis = analyzer
        .analyze_error(&trace_id, &records)
        .await
        .with_context(|| format!("error analysis of trace {} failed", trace_id))?;

    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn span_id_command(vendor: &str, id: &str, seq: u32) -> anyhow::Result<()> {
    let apm_type: ApmType = vendor.parse()?;
    let span_id = apm_type.derive_span_id(id, seq);
    if span_id.is_empty() {
        anyhow::bail!("cannot derive a {} span id from {}", apm_type, id);
    }
    println!("{}", span_id);
    Ok(())
}
