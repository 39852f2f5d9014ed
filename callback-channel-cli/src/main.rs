//! Callback Channel CLI Application
//!
//! Command-line load driver for the callback-channel library. It runs a
//! configurable multi-producer scenario against one channel and reports:
//! - How many requests were enqueued, delivered, unresolved or failed
//! - Whether per-producer delivery order held
//! - How often a bounded queue pushed back on producers

use anyhow::{Context, Result};
use clap::Parser;
use std::num::NonZeroUsize;
use std::path::PathBuf;

mod config;
mod report;
mod scenario;

use config::{OutputFormat, ScenarioConfig};

/// Callback Channel - Drive a multi-producer callback dispatch scenario
#[derive(Parser, Debug)]
#[command(name = "callback-channel-cli")]
#[command(about = "Run a multi-producer load scenario against a callback channel", long_about = None)]
#[command(version)]
struct Args {
    /// Path to scenario configuration file (scenario.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of producer threads (overrides config)
    #[arg(short, long, value_name = "COUNT")]
    producers: Option<usize>,

    /// Requests per producer (overrides config)
    #[arg(short, long, value_name = "COUNT")]
    requests: Option<usize>,

    /// Bound the queue to this many pending requests (overrides config)
    #[arg(long, value_name = "COUNT")]
    capacity: Option<usize>,

    /// Send every n-th request to a released handle
    #[arg(long, value_name = "N")]
    unregistered_every: Option<usize>,

    /// Send every n-th request to a failing callback
    #[arg(long, value_name = "N")]
    failing_every: Option<usize>,

    /// Report format (overrides config)
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Output file for the report (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Callback Channel CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using callback-channel library v{}", callback_channel::VERSION);

    let config = resolve_config(&args)?;
    log::debug!("Effective configuration: {:?}", config);

    let outcome = scenario::run(&config)?;
    let rendered = report::render(&outcome, config.output.format)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &rendered)?;
            log::info!("Report written to {:?}", path);
        }
        None => print!("{}", rendered),
    }

    if !outcome.is_consistent() {
        anyhow::bail!("delivery accounting mismatch, see report");
    }
    Ok(())
}

/// Load the config file (if any) and apply command-line overrides
fn resolve_config(args: &Args) -> Result<ScenarioConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => ScenarioConfig::default(),
    };

    if let Some(producers) = args.producers {
        config.scenario.producers = producers;
    }
    if let Some(requests) = args.requests {
        config.scenario.requests_per_producer = requests;
    }
    if let Some(capacity) = args.capacity {
        let capacity = NonZeroUsize::new(capacity).context("--capacity must be at least 1")?;
        config.channel.capacity = Some(capacity);
    }
    if let Some(n) = args.unregistered_every {
        config.scenario.unregistered_every = n;
    }
    if let Some(n) = args.failing_every {
        config.scenario.failing_every = n;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
