use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::time::Duration;

use ridelog::ant::AbsentNode;
use ridelog::config::{Settings, SettingsFile};
use ridelog::gps::{ClockControl, NoClock, SystemClock};
use ridelog::integrate::{IntegrationConfig, Integrator};
use ridelog::runtime::{Runtime, Sources};
use ridelog::session::{LoggerConfig, ResumeOutcome, SessionLogger};

#[derive(Parser, Debug)]
#[command(name = "ridelog")]
#[command(
    about = "Cycling head-unit core: ANT+ and GPS fusion with a crash-safe ride log",
    long_about = None
)]
struct Args {
    /// Settings file (JSON); created on the first binding change
    #[arg(long, default_value = "settings.json")]
    config: PathBuf,

    /// Override the ride log path
    #[arg(long)]
    log: Option<PathBuf>,

    /// Use synthetic ANT+ and GPS data
    #[arg(long)]
    dummy: bool,

    /// Run time in seconds (0 = until Ctrl-C)
    #[arg(long, value_name = "SECONDS", default_value = "0")]
    duration: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    if let Some(path) = args.log {
        settings.log.path = path;
    }
    settings.dummy_output |= args.dummy;

    log::info!("ridelog starting");
    log::info!("  settings: {}", args.config.display());
    log::info!("  log: {}", settings.log.path.display());
    log::info!("  interval: {:.2}s, dummy: {}", settings.sensor_interval, settings.dummy_output);

    let (logger, outcome) = SessionLogger::open_jsonl(LoggerConfig::from(&settings))
        .with_context(|| format!("opening ride log {}", settings.log.path.display()))?;
    let mut integrator = Integrator::new(IntegrationConfig::from(&settings));
    match outcome {
        ResumeOutcome::Fresh => log::info!("starting a new session"),
        ResumeOutcome::Resumed(state) => {
            log::info!(
                "resumed lap {} at tick {} ({:.0} m, {:.0} J)",
                state.lap,
                state.count,
                state.distance,
                state.accumulated_power
            );
            integrator.restore(state.distance, state.accumulated_power);
            integrator.restore_climb(state.total_ascent, state.total_descent);
        }
    }

    let clock: Box<dyn ClockControl> = if settings.dummy_output {
        Box::new(NoClock::new(settings.gps.min_valid_date))
    } else {
        Box::new(SystemClock::new(settings.gps.min_valid_date))
    };
    let sources = Sources {
        ant_node: Box::new(AbsentNode),
        binding_store: Box::new(SettingsFile::new(args.config.clone(), settings.clone())),
        clock,
    };
    let runtime = Runtime::start(&settings, logger, integrator, sources);

    if args.duration > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {
                log::info!("duration reached, stopping")
            }
            r = tokio::signal::ctrl_c() => { r?; log::info!("interrupted, stopping"); }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        log::info!("interrupted, stopping");
    }

    runtime.join().await;
    Ok(())
}
