use std::{fs, path::PathBuf, sync::mpsc, thread};

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use events::EventMonitor;
use powsim_core::{
    config::{AttackerStrategy, SimConfiguration},
    events::EventTracker,
    sim::Simulation,
};
use topology::{Scenario, ScenarioAttacker};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod events;
mod report;
mod topology;

#[derive(Parser)]
struct Args {
    /// TOML scenario file describing the run.
    filename: PathBuf,
    /// Where to stream the run's events, one JSON object per line.
    output: Option<PathBuf>,
    /// Directory to write per-node Graphviz block trees into.
    #[clap(long)]
    trees: Option<PathBuf>,
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long)]
    horizon_ms: Option<f64>,
    /// Add or override the attacker's strategy.
    #[clap(long)]
    attacker: Option<AttackerArg>,
    /// Hashing-power share handed to the attacker, in (0, 1).
    #[clap(long)]
    attacker_power: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum AttackerArg {
    Selfish,
    Stubborn,
}

impl From<AttackerArg> for AttackerStrategy {
    fn from(value: AttackerArg) -> Self {
        match value {
            AttackerArg::Selfish => Self::Selfish,
            AttackerArg::Stubborn => Self::Stubborn,
        }
    }
}

fn read_config(args: &Args) -> Result<SimConfiguration> {
    let file = fs::read_to_string(&args.filename)?;
    let mut scenario: Scenario = toml::from_str(&file)?;
    if let Some(seed) = args.seed {
        scenario.seed = Some(seed);
    }
    if let Some(horizon_ms) = args.horizon_ms {
        scenario.horizon_ms = horizon_ms;
    }
    if let Some(strategy) = args.attacker {
        let attacker = scenario.attacker.get_or_insert(ScenarioAttacker {
            node: None,
            strategy: strategy.into(),
            power: None,
            zeta: None,
        });
        attacker.strategy = strategy.into();
    }
    if let Some(power) = args.attacker_power {
        let attacker = scenario
            .attacker
            .as_mut()
            .ok_or_else(|| anyhow!("--attacker-power needs an attacker in the scenario"))?;
        attacker.power = Some(power);
    }
    scenario.into_raw()?.build()
}

fn main() -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer().compact().without_time();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();

    let args = Args::parse();
    let config = read_config(&args)?;

    let (events_sink, events_source) = mpsc::channel();
    let output = args.output.clone();
    let monitor = thread::spawn(move || EventMonitor::new(events_source, output).run());

    let tracker = EventTracker::new(events_sink);
    let mut simulation = Simulation::new(config, tracker)?;
    simulation.run();

    let summary = report::summarize(&simulation);
    report::log_summary(&summary);
    if let Some(dir) = &args.trees {
        report::write_trees(&simulation, dir)?;
    }

    // dropping the simulation hangs up the last event sender, which lets
    // the monitor drain and exit
    drop(simulation);
    monitor
        .join()
        .map_err(|_| anyhow!("event monitor panicked"))??;

    // the summary goes in last, after the monitor has flushed the stream
    if let Some(path) = &args.output {
        report::append_summary(&summary, path)?;
    }
    Ok(())
}
