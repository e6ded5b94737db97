//! `concentrator` command-line entry point.

// ============================================================================
// SECTION 14: COMMAND LINE INTERFACE
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use frame_concentrator::{
    init_logging, wait_periods, Concentrator, ConcentratorConfig, ConcentratorError,
    ConcentratorObserver, EngineConfig, Frame, FrameHandler, FrameRate, Measurement,
    MeasurementKey, PublishError, SimulationConfig, Ticks, NAME, VERSION,
};

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Frame concentrator CLI
#[derive(Parser, Debug)]
#[command(
    name = "concentrator",
    author = "AIOps Team",
    version,
    about = "Real-time measurement concentrator",
    long_about = "Sorts an unordered stream of timestamped measurements from many \
                  sources into time-aligned frames published at a fixed rate."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "concentrator.toml", env = "CONCENTRATOR_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CONCENTRATOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the concentrator against a simulated multi-source feed
    Run {
        /// Stop after this long (e.g. "30s"); overrides simulation.run_for
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the per-frame wait periods for a frame rate
    WaitPeriods {
        #[arg(short, long, default_value_t = frame_concentrator::DEFAULT_FRAMES_PER_SECOND)]
        fps: u32,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 Command Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)?;
    println!("Configuration is valid");

    if verbose {
        println!("\n{}", toml::to_string_pretty(&config)?);
    }

    let c = &config.concentrator;
    println!("\nConfiguration summary:");
    println!("  Frames per second: {}", c.frames_per_second);
    println!("  Lag time: {} s, lead time: {} s", c.lag_time, c.lead_time);
    println!("  Local clock as real-time: {}", c.use_local_clock_as_real_time);
    println!("  Precision timer: {}", c.use_precision_timer);
    println!(
        "  Simulated feed: {} source(s) x {} measurement(s) at {} samples/s",
        config.simulation.sources,
        config.simulation.measurements_per_source,
        config.simulation.sample_rate
    );
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str).map_err(ConcentratorError::Io)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_wait_periods(fps: u32) -> AnyhowResult<()> {
    let rate = FrameRate::new(fps)?;
    let periods = wait_periods(rate);
    println!("{rate}: {} ticks per frame", rate.ticks_per_frame());
    for (index, period) in periods.iter().enumerate() {
        println!("  frame {index:>4}: {period:>4} ms");
    }
    println!("  total: {} ms", periods.iter().sum::<u32>());
    Ok(())
}

fn handle_version() {
    println!("{NAME} v{VERSION}");
    println!();
    println!("Build Information:");
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS: {}", std::env::consts::OS);
}

// ----------------------------------------------------------------------------
// 14.3 Logging Frame Handler
// ----------------------------------------------------------------------------

/// Logs published frames and flags incomplete ones.
#[derive(Debug, Default)]
struct LoggingFrameHandler {
    expected: usize,
    frames: AtomicU64,
    incomplete: AtomicU64,
}

impl FrameHandler for LoggingFrameHandler {
    fn publish_frame(&self, frame: &Frame, index: usize) -> Result<(), PublishError> {
        let count = frame.sorted_measurements();
        self.frames.fetch_add(1, AtomicOrdering::Relaxed);
        if self.expected > 0 && count < self.expected {
            self.incomplete.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(
                target: "concentrator::publish",
                frame = %frame.timestamp(),
                index,
                count,
                expected = self.expected,
                "Incomplete frame"
            );
        }
        if index == 0 {
            info!(
                target: "concentrator::publish",
                frame = %frame.timestamp(),
                measurements = count,
                published = self.frames.load(AtomicOrdering::Relaxed),
                incomplete = self.incomplete.load(AtomicOrdering::Relaxed),
                "Top of second"
            );
        }
        Ok(())
    }
}

/// Logs monitor and error notifications.
#[derive(Debug, Default)]
struct LoggingObserver;

impl ConcentratorObserver for LoggingObserver {
    fn unpublished_samples(&self, seconds: u64) {
        if seconds > 0 {
            warn!(target: "concentrator::monitor", seconds, "Publication is falling behind");
        }
    }

    fn process_exception(&self, error: &ConcentratorError) {
        warn!(target: "concentrator::engine", %error, "Processing exception");
    }

    fn discarding_measurements(&self, measurements: &[Measurement]) {
        debug!(target: "concentrator::sort", count = measurements.len(), "Measurements discarded");
    }
}

// ----------------------------------------------------------------------------
// 14.4 Simulated Feed
// ----------------------------------------------------------------------------

/// One simulated device: reports a batch of phase-shifted sine values per
/// sample, delivered late by the configured delay plus its own skew.
async fn run_source(
    engine: Arc<Concentrator<LoggingFrameHandler>>,
    simulation: SimulationConfig,
    source: u32,
    stale_after: Duration,
) {
    let name = format!("PMU{source:02}");
    let period = Duration::from_secs(1) / simulation.sample_rate;
    let skew = Duration::from_millis(u64::from(source) * 3);
    let delay = Ticks::from_duration(simulation.delivery_delay + skew);
    let mut ticker = tokio::time::interval(period);
    let mut batch_number: u32 = 0;

    loop {
        ticker.tick().await;
        if !engine.is_enabled() {
            break;
        }
        batch_number = batch_number.wrapping_add(1);

        let mut sampled = Ticks::now() - delay;
        if simulation.stale_every > 0 && batch_number % simulation.stale_every == 0 {
            sampled -= Ticks::from_duration(stale_after);
        }

        let seconds = sampled.as_secs_f64();
        let batch: Vec<Measurement> = (0..simulation.measurements_per_source)
            .map(|id| {
                let phase = f64::from(id) * std::f64::consts::FRAC_PI_4 + f64::from(source);
                let value = (seconds * std::f64::consts::TAU * 0.2 + phase).sin();
                Measurement::new(MeasurementKey::new(id, name.as_str()), value, sampled)
                    .with_multiplier(100.0)
                    .with_adder(60.0)
            })
            .collect();

        engine.sort_measurements(batch);
    }
}

async fn handle_run(config: EngineConfig, duration: Option<Duration>) -> AnyhowResult<()> {
    let simulation = config.simulation.clone();
    let concentrator_config = ConcentratorConfig {
        expected_measurements: if config.concentrator.expected_measurements == 0 {
            simulation.measurements_per_frame()
        } else {
            config.concentrator.expected_measurements
        },
        ..config.concentrator.clone()
    };
    let handler = LoggingFrameHandler {
        expected: concentrator_config.expected_measurements,
        ..LoggingFrameHandler::default()
    };

    let engine = Arc::new(
        Concentrator::builder(concentrator_config.clone(), handler)
            .with_observer(LoggingObserver)
            .build()?,
    );
    engine.start()?;

    let stale_after = Duration::from_secs_f64(concentrator_config.lag_time * 2.0);
    let sources: Vec<_> = (0..simulation.sources)
        .map(|source| {
            tokio::spawn(run_source(
                engine.clone(),
                simulation.clone(),
                source,
                stale_after,
            ))
        })
        .collect();

    // Host-driven publication when no precision timer thread is running.
    let manual_publisher = (!concentrator_config.use_precision_timer).then(|| {
        let engine = engine.clone();
        let period = Duration::from_secs(1) / concentrator_config.frames_per_second;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            while engine.is_enabled() {
                ticker.tick().await;
                engine.publish_ready_frames();
            }
        })
    });

    let run_for = duration.or(simulation.run_for);
    info!(
        target: "concentrator::engine",
        sources = simulation.sources,
        run_for = ?run_for,
        "Simulated feed running, press Ctrl-C to stop"
    );

    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;
    let until = async {
        match run_for {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(until);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "concentrator::engine", "Shutdown signal received");
                break;
            }
            _ = &mut until => break,
            _ = report.tick() => {
                let stats = engine.stats();
                info!(
                    target: "concentrator::engine",
                    received = stats.received_measurements,
                    published_frames = stats.published_frames,
                    discarded = stats.discarded_measurements,
                    queued = stats.queued_frames,
                    "Progress"
                );
            }
        }
    }

    engine.stop();
    for source in sources {
        source.await.context("Simulated source task failed")?;
    }
    if let Some(publisher) = manual_publisher {
        publisher.await.context("Publication task failed")?;
    }

    println!("{}", engine.status());
    Ok(())
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::WaitPeriods { fps }) => return handle_wait_periods(*fps),
        Some(Commands::Run { .. }) | None => {}
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::from_env().context("Failed to load default configuration")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!(
            target: "concentrator::engine",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!(target: "concentrator::engine", "{} v{}", NAME, VERSION);

    let duration = match cli.command {
        Some(Commands::Run { duration }) => duration,
        _ => None,
    };
    handle_run(config, duration).await
}
